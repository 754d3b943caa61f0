use std::time::Duration;

/// Error type for the pgward crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// A migration file name or id that cannot be parsed, or a catalog
    /// invariant violation (duplicate ids).
    #[error("malformed migration: {0}")]
    MalformedMigration(String),
    /// A newly generated migration id already exists in the catalog.
    /// Narrow race between rapid successive invocations; retry.
    #[error("migration id '{id}' already exists")]
    Collision { id: String },
    /// The schema version table records an id with no corresponding
    /// migration file. Requires operator intervention.
    #[error("schema version table references unknown migration '{id}'")]
    Drift { id: String },
    #[error("no migration for target '{target}'")]
    UnknownTarget { target: String },
    #[error("timed out after {waited:?} waiting for migration lock {key}")]
    LockTimeout { key: i64, waited: Duration },
    /// A statement inside a migration failed. The migration's transaction
    /// has been rolled back and the version table is unaffected.
    #[error("migration '{id}' failed: {source}")]
    MigrationApply { id: String, source: postgres::Error },
    /// Rollback would cross a migration that has no down file.
    #[error("cannot rollback past migration '{id}': no down file")]
    Irreversible { id: String },
    #[error("{0}")]
    Rollback(String),
    #[error("{0}")]
    PgDump(String),
    #[error("{0}")]
    Project(String),
}
