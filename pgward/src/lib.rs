//! `pgward` manages PostgreSQL schema migrations from versioned SQL files.
//!
//! Core concepts:
//! - Migrations are plain SQL file pairs (`<id>_<name>.up.sql` /
//!   `<id>_<name>.down.sql`) discovered from a project directory, applied in
//!   id order, and tracked in a version table in the target database.
//! - Every migration runs in its own transaction together with its version
//!   record, so the tracked state and the actual schema cannot diverge.
//! - Concurrent invocations (from any number of processes or hosts) are
//!   serialized by a session-level advisory lock.
//! - A project declares its end-state schema in `schema.sql`, and `verify`
//!   replays the whole catalog into a throwaway database to prove the two
//!   agree.
//!
//! # Motivation
//!
//! ## Transactional pairing of schema and bookkeeping
//!
//! PostgreSQL supports transactional DDL, and `pgward` leans on it: the
//! version table row for a migration commits in the same transaction as the
//! migration's statements. A failed migration leaves no trace, neither in
//! the schema nor in the history, so a fixed script can simply be re-run.
//!
//! ## Drift you can prove, not guess
//!
//! Migration histories rot quietly: a snapshot regenerated by hand, a
//! hotfix applied straight to production, a migration edited after the
//! fact. `pgward verify` rebuilds the database that the migrations *say*
//! exists and compares it, via `pg_dump`, with the one the project
//! declares, failing loudly on any difference.
//!
//! # Example
//!
//! ```ignore
//! use pgward::{ConnectConfig, Migrator, Project, Target};
//!
//! let project = Project::open("./db")?;
//! let config = ConnectConfig::new("appdb").host("localhost").user("app");
//! let mut client = config.connect()?;
//!
//! let migrator = Migrator::new(project.catalog().clone());
//! let report = migrator.migrate(&mut client, &Target::Latest)?;
//! println!("applied {} migrations", report.migrations_run.len());
//! # Ok::<(), pgward::Error>(())
//! ```
//!
//! # Logging
//!
//! Enable the `tracing` feature for structured spans and events around lock
//! acquisition and each migration:
//!
//! ```toml
//! pgward = { version = "0.1", features = ["tracing"] }
//! ```

mod error;
pub use error::Error;

mod config;
pub use config::{ConnectConfig, MAINTENANCE_DATABASE};

mod migration;
pub use migration::{valid_id, Catalog, Migration, SqlFile, MIGRATION_ID_LEN};

mod project;
pub use project::Project;

mod tracker;
pub use tracker::{
    pending, resolve_target, AppliedRecord, Direction, Target, VersionTable,
    DEFAULT_VERSION_TABLE,
};

mod lock;
pub use lock::{lock_key, MigrationLock};

mod migrator;
pub use migrator::{MigrationReport, Migrator};

mod pg_dump;
pub use pg_dump::PgDump;

mod verify;
pub use verify::{canonicalize, version_stamp, Verifier, VerifyOutcome, VersionStamp};

#[cfg(test)]
pub(crate) mod test_postgres;
