//! Per-kind authorization of channel subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lectern_core::channels::{ChannelKind, ChannelName};
use lectern_core::error::CoreError;
use lectern_core::types::{DbId, JobId};
use lectern_worker::JobQueue;

/// Decides whether a user may subscribe to a channel of one kind.
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    async fn authorize(&self, user_id: DbId, channel: &ChannelName) -> Result<(), CoreError>;
}

/// Authorization strategies keyed by channel kind.
///
/// Kinds without a registered strategy are denied.
#[derive(Clone, Default)]
pub struct AuthorizationTable {
    strategies: HashMap<ChannelKind, Arc<dyn ChannelAuthorizer>>,
}

impl AuthorizationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: ChannelKind, authorizer: impl ChannelAuthorizer + 'static) -> Self {
        self.insert(kind, authorizer);
        self
    }

    pub fn insert(&mut self, kind: ChannelKind, authorizer: impl ChannelAuthorizer + 'static) {
        self.strategies.insert(kind, Arc::new(authorizer));
    }

    pub fn handles(&self, kind: ChannelKind) -> bool {
        self.strategies.contains_key(&kind)
    }

    pub async fn authorize(&self, user_id: DbId, channel: &ChannelName) -> Result<(), CoreError> {
        match self.strategies.get(&channel.kind) {
            Some(authorizer) => authorizer.authorize(user_id, channel).await,
            None => Err(CoreError::Forbidden(format!(
                "No authorizer for {} channels",
                channel.kind
            ))),
        }
    }
}

/// `job:<id>` channels are open to the job's owner only.
pub struct JobOwnerAuthorizer {
    queue: Arc<JobQueue>,
}

impl JobOwnerAuthorizer {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl ChannelAuthorizer for JobOwnerAuthorizer {
    async fn authorize(&self, user_id: DbId, channel: &ChannelName) -> Result<(), CoreError> {
        let job_id: JobId = channel
            .id
            .parse()
            .map_err(|_| CoreError::Validation(format!("Invalid job id: {}", channel.id)))?;

        let job = self.queue.get_job(job_id).await?;
        if job.owner_id != user_id {
            return Err(CoreError::Forbidden("Job belongs to another user".into()));
        }
        Ok(())
    }
}

/// Looks up the owner of a business resource (chat session, document).
#[async_trait]
pub trait OwnerLookup: Send + Sync {
    /// `None` when the resource does not exist.
    async fn owner_of(&self, resource_id: DbId) -> Result<Option<DbId>, CoreError>;
}

/// Channels whose id is a resource owned by a single user.
pub struct OwnedResourceAuthorizer<L> {
    entity: &'static str,
    lookup: L,
}

impl<L: OwnerLookup> OwnedResourceAuthorizer<L> {
    pub fn new(entity: &'static str, lookup: L) -> Self {
        Self { entity, lookup }
    }
}

#[async_trait]
impl<L: OwnerLookup> ChannelAuthorizer for OwnedResourceAuthorizer<L> {
    async fn authorize(&self, user_id: DbId, channel: &ChannelName) -> Result<(), CoreError> {
        let resource_id: DbId = channel.id.parse().map_err(|_| {
            CoreError::Validation(format!("Invalid {} id: {}", self.entity, channel.id))
        })?;

        match self.lookup.owner_of(resource_id).await? {
            Some(owner) if owner == user_id => Ok(()),
            Some(_) => Err(CoreError::Forbidden(format!(
                "{} belongs to another user",
                self.entity
            ))),
            None => Err(CoreError::NotFound {
                entity: self.entity,
                id: channel.id.clone(),
            }),
        }
    }
}
