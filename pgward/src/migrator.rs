//! The migration executor.
//!
//! [Migrator] drives a [Catalog] against a live database: it plans the
//! minimal ordered subsequence of migrations between the recorded state and
//! a [Target], then applies or reverts each one inside its own transaction.
//!
//! ## Transaction safety
//!
//! PostgreSQL supports transactional DDL, so each migration's script runs
//! in a transaction together with the version-table bookkeeping row for
//! that migration. Either the schema change and its record commit together
//! or neither does; the version table can never observably diverge from the
//! schema it describes. A failing statement rolls the whole step back,
//! abandons the rest of the plan, and surfaces [Error::MigrationApply] with
//! the failing migration's id.
//!
//! ## Locking
//!
//! Unless disabled, a session-level advisory lock keyed by the version
//! table name is held across the whole plan, serializing concurrent
//! invocations from any number of processes. The lock is released on every
//! exit path; a session that dies takes its lock with it.

use std::time::Duration;

use postgres::Client;

use crate::error::Error;
use crate::lock::{lock_key, MigrationLock};
use crate::migration::{Catalog, Migration, SqlFile};
use crate::tracker::{
    pending, resolve_target, AppliedRecord, Direction, Target, VersionTable,
    DEFAULT_VERSION_TABLE,
};

/// A report of actions performed by a successful migration run.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationReport {
    pub version_table_existed: bool,
    pub version_table_created: bool,
    /// Ids applied (forward) or reverted (rollback), in execution order.
    pub migrations_run: Vec<String>,
}

/// The entrypoint for applying and reverting a [Catalog] of migrations.
#[derive(Debug, Clone)]
pub struct Migrator {
    catalog: Catalog,
    table: VersionTable,
    use_lock: bool,
    lock_timeout: Duration,
}

impl Migrator {
    /// Create a migrator over `catalog`, tracking state in the default
    /// version table, with locking enabled and an indefinite lock wait.
    pub fn new(catalog: Catalog) -> Self {
        let table = VersionTable::new(DEFAULT_VERSION_TABLE)
            .expect("default version table name is valid");
        Self {
            catalog,
            table,
            use_lock: true,
            lock_timeout: Duration::ZERO,
        }
    }

    /// Track state in a custom (optionally schema-qualified) table.
    pub fn with_version_table(mut self, name: &str) -> Result<Self, Error> {
        self.table = VersionTable::new(name)?;
        Ok(self)
    }

    /// Run without the advisory lock. Concurrent invocations may interleave.
    pub fn with_lock_disabled(mut self) -> Self {
        self.use_lock = false;
        self
    }

    /// Give up after waiting this long for the advisory lock. Zero (the
    /// default) waits indefinitely.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn version_table(&self) -> &VersionTable {
        &self.table
    }

    /// The maximum applied id, or `None` if no migrations have been applied.
    pub fn current_version(&self, client: &mut Client) -> Result<Option<String>, Error> {
        self.table.current(client)
    }

    /// All applied migrations in id order.
    pub fn history(&self, client: &mut Client) -> Result<Vec<AppliedRecord>, Error> {
        self.table.applied(client)
    }

    /// Catalog entries not yet applied, ascending.
    pub fn pending<'a>(&'a self, client: &mut Client) -> Result<Vec<&'a Migration>, Error> {
        let applied = self.table.applied_ids(client)?;
        pending(&self.catalog, &applied)
    }

    /// Apply pending migrations, in ascending id order, up to and including
    /// `target`.
    pub fn migrate(&self, client: &mut Client, target: &Target) -> Result<MigrationReport, Error> {
        self.locked(client, |this, client| this.run_forward(client, target))
    }

    /// Revert applied migrations with ids greater than `target`, newest
    /// first. The whole plan is checked for down scripts before anything
    /// runs, so an irreversible migration mid-plan fails fast instead of
    /// stranding the database half-reverted.
    pub fn rollback(&self, client: &mut Client, target: &Target) -> Result<MigrationReport, Error> {
        self.locked(client, |this, client| this.run_rollback(client, target))
    }

    /// Run `op` with the advisory lock held (unless disabled), releasing it
    /// on every exit path.
    fn locked<F>(&self, client: &mut Client, op: F) -> Result<MigrationReport, Error>
    where
        F: FnOnce(&Self, &mut Client) -> Result<MigrationReport, Error>,
    {
        let mut lock = if self.use_lock {
            MigrationLock::acquire(client, lock_key(&self.table.to_string()), self.lock_timeout)?
        } else {
            MigrationLock::disabled()
        };

        let result = op(self, client);

        // The session's end would release the lock anyway; a failed unlock
        // must not mask the operation's own outcome.
        if let Err(_release_error) = lock.release(client) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_release_error, "Failed to release migration lock");
        }

        result
    }

    fn run_forward(&self, client: &mut Client, target: &Target) -> Result<MigrationReport, Error> {
        let version_table_existed = self.table.exists(client)?;
        let applied = self.table.applied_ids(client)?;
        let pending = pending(&self.catalog, &applied)?;
        let target = resolve_target(&self.catalog, &applied, target, Direction::Up)?;

        let plan: Vec<&Migration> = match &target {
            Some(target) => pending.into_iter().filter(|m| m.id <= *target).collect(),
            None => Vec::new(),
        };

        let mut migrations_run = Vec::new();

        for migration in plan {
            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!(
                "migration_up",
                id = %migration.id,
                name = %migration.name
            )
            .entered();

            self.run_step(client, migration, &migration.up, Direction::Up)?;
            migrations_run.push(migration.id.clone());

            #[cfg(feature = "tracing")]
            tracing::info!("Migration applied");
        }

        Ok(MigrationReport {
            version_table_existed,
            version_table_created: !version_table_existed && !migrations_run.is_empty(),
            migrations_run,
        })
    }

    fn run_rollback(&self, client: &mut Client, target: &Target) -> Result<MigrationReport, Error> {
        let version_table_existed = self.table.exists(client)?;
        let applied = self.table.applied_ids(client)?;
        let target = resolve_target(&self.catalog, &applied, target, Direction::Down)?;

        // Newest first. Reverting out of catalog order could violate the
        // dependency ordering the forward sequence encoded.
        let mut plan: Vec<(&Migration, &SqlFile)> = Vec::new();
        for id in applied.iter().rev() {
            if let Some(target) = &target {
                if id <= target {
                    break;
                }
            }

            let migration = self
                .catalog
                .get(id)
                .ok_or_else(|| Error::Drift { id: id.clone() })?;
            let down = migration.down.as_ref().ok_or_else(|| Error::Irreversible {
                id: migration.id.clone(),
            })?;
            plan.push((migration, down));
        }

        let mut migrations_run = Vec::new();

        for (migration, down) in plan {
            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!(
                "migration_down",
                id = %migration.id,
                name = %migration.name
            )
            .entered();

            self.run_step(client, migration, down, Direction::Down)?;
            migrations_run.push(migration.id.clone());

            #[cfg(feature = "tracing")]
            tracing::info!("Migration reverted");
        }

        Ok(MigrationReport {
            version_table_existed,
            version_table_created: false,
            migrations_run,
        })
    }

    /// Execute one migration script and its version-table record in a single
    /// transaction. Dropping the transaction on the error path rolls back
    /// both together.
    fn run_step(
        &self,
        client: &mut Client,
        migration: &Migration,
        script: &SqlFile,
        direction: Direction,
    ) -> Result<(), Error> {
        let sql = script.read()?;

        let mut tx = client.transaction()?;

        let step = |tx: &mut postgres::Transaction<'_>| -> Result<(), Error> {
            if !sql.trim().is_empty() {
                tx.batch_execute(&sql)?;
            }

            match direction {
                Direction::Up => {
                    self.table.ensure(tx)?;
                    self.table.record_applied(tx, &migration.id)?;
                }
                Direction::Down => {
                    self.table.record_reverted(tx, &migration.id)?;
                }
            }
            Ok(())
        };

        match step(&mut tx) {
            Ok(()) => {
                tx.commit().map_err(|source| Error::MigrationApply {
                    id: migration.id.clone(),
                    source,
                })?;
                Ok(())
            }
            Err(Error::Postgres(source)) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %source, "Migration failed, rolling back");

                // Dropped transaction rolls back.
                drop(tx);
                Err(Error::MigrationApply {
                    id: migration.id.clone(),
                    source,
                })
            }
            Err(other) => Err(other),
        }
    }
}
