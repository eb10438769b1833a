use strata_core::event::IllegalEventStreamError;

/// Error type for the `PostgreSQL` stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A stream, snapshot or claimed value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    /// The stream handed to `append` breaks the stream invariants.
    #[error("refusing to store illegal event stream: {0}")]
    IllegalStream(#[source] IllegalEventStreamError),
    /// A version does not fit in a `BIGINT` column.
    #[error("version {0} is out of range for the database")]
    VersionOutOfRange(u64),
    /// The database returned a negative version.
    #[error("invalid version value from database: {0}")]
    InvalidVersion(i64),
}

pub(crate) fn to_db_version(version: u64) -> Result<i64, Error> {
    i64::try_from(version).map_err(|_| Error::VersionOutOfRange(version))
}

pub(crate) fn from_db_version(version: i64) -> Result<u64, Error> {
    u64::try_from(version).map_err(|_| Error::InvalidVersion(version))
}

/// Clamp a range bound into `BIGINT`; open-ended ranges use `u64::MAX`.
pub(crate) fn clamp_db_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}
