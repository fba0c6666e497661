//! WebSocket channel names.
//!
//! A channel is addressed on the wire as `"<kind>:<id>"` (for example
//! `job:0190c1f2-...` or `chat:42`). Names are parsed once at the
//! boundary into a [`ChannelName`] so that authorization and bridging
//! dispatch on [`ChannelKind`] instead of string prefixes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Separator between the kind and the id.
const SEPARATOR: char = ':';

/// Maximum accepted length of the id part.
const MAX_ID_LEN: usize = 128;

/// The family a channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Progress of a single background job.
    Job,
    /// Messages of a chat session.
    Chat,
    /// Progress of a document upload.
    Upload,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Job => "job",
            ChannelKind::Chat => "chat",
            ChannelKind::Upload => "upload",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "job" => Ok(ChannelKind::Job),
            "chat" => Ok(ChannelKind::Chat),
            "upload" => Ok(ChannelKind::Upload),
            other => Err(ChannelParseError::UnknownKind(other.to_string())),
        }
    }
}

/// Reasons a raw channel string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelParseError {
    #[error("channel name must have the form <kind>:<id>")]
    MissingSeparator,

    #[error("unknown channel kind: {0}")]
    UnknownKind(String),

    #[error("channel id must be between 1 and {MAX_ID_LEN} characters without whitespace")]
    InvalidId,
}

/// A parsed `<kind>:<id>` channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    pub kind: ChannelKind,
    pub id: String,
}

impl ChannelName {
    pub fn new(kind: ChannelKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// Channel carrying progress for the given job.
    pub fn job(job_id: crate::types::JobId) -> Self {
        Self::new(ChannelKind::Job, job_id.to_string())
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.kind, self.id)
    }
}

impl FromStr for ChannelName {
    type Err = ChannelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(SEPARATOR)
            .ok_or(ChannelParseError::MissingSeparator)?;
        let kind = kind.parse::<ChannelKind>()?;

        if id.is_empty() || id.len() > MAX_ID_LEN || id.chars().any(char::is_whitespace) {
            return Err(ChannelParseError::InvalidId);
        }

        Ok(Self::new(kind, id))
    }
}

impl Serialize for ChannelName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChannelName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_kinds() {
        let job: ChannelName = "job:abc-123".parse().unwrap();
        assert_eq!(job.kind, ChannelKind::Job);
        assert_eq!(job.id, "abc-123");

        let chat: ChannelName = "chat:42".parse().unwrap();
        assert_eq!(chat.kind, ChannelKind::Chat);

        let upload: ChannelName = "upload:7".parse().unwrap();
        assert_eq!(upload.kind, ChannelKind::Upload);
    }

    #[test]
    fn id_may_contain_separator() {
        let name: ChannelName = "chat:a:b".parse().unwrap();
        assert_eq!(name.id, "a:b");
        assert_eq!(name.to_string(), "chat:a:b");
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(
            "job".parse::<ChannelName>(),
            Err(ChannelParseError::MissingSeparator)
        );
        assert_eq!(
            "exam:1".parse::<ChannelName>(),
            Err(ChannelParseError::UnknownKind("exam".into()))
        );
        assert_eq!(
            "job:".parse::<ChannelName>(),
            Err(ChannelParseError::InvalidId)
        );
        assert_eq!(
            "job:a b".parse::<ChannelName>(),
            Err(ChannelParseError::InvalidId)
        );
    }

    #[test]
    fn display_round_trips_through_serde() {
        let id = uuid::Uuid::new_v4();
        let name = ChannelName::job(id);
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, format!("\"job:{id}\""));

        let back: ChannelName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }

    #[test]
    fn deserialize_reports_parse_error() {
        let err = serde_json::from_str::<ChannelName>("\"bogus\"").unwrap_err();
        assert!(err.to_string().contains("<kind>:<id>"));
    }
}
