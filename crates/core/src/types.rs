/// Primary keys of relational business entities (users, exams, lectures)
/// are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// Jobs are identified by a UUID generated at enqueue time.
pub type JobId = uuid::Uuid;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
