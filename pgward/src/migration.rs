//! Migration files and the catalog built from them.
//!
//! A migration is a pair of SQL files in the project's `migrations/`
//! directory:
//!
//! ```text
//! migrations/20240101120000_create_users.up.sql
//! migrations/20240101120000_create_users.down.sql
//! ```
//!
//! The id is the migration's creation time in UTC, formatted
//! `YYYYMMDDHHMMSS`, which makes ids lexicographically sortable in the
//! order they were created. The down file may be missing, in which case the
//! migration is irreversible and any rollback crossing it fails fast.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::Error;

/// Width of a migration id: `YYYYMMDDHHMMSS`.
pub const MIGRATION_ID_LEN: usize = 14;

const ID_FORMAT: &str = "%Y%m%d%H%M%S";

/// A named SQL file on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlFile {
    /// The file stem, e.g. `20240101120000_create_users.up` for an up script.
    pub name: String,
    pub path: PathBuf,
}

impl SqlFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { name, path }
    }

    /// Read the file's contents.
    pub fn read(&self) -> Result<String, Error> {
        Ok(fs::read_to_string(&self.path)?)
    }

    /// Execute the file's contents against the database as a single batch.
    /// A file with no statements executes nothing and succeeds.
    pub fn execute(&self, client: &mut postgres::Client) -> Result<(), Error> {
        let sql = self.read()?;

        if sql.trim().is_empty() {
            return Ok(());
        }

        client.batch_execute(&sql)?;
        Ok(())
    }
}

/// A single migration: an id, a human-readable name, an up script, and an
/// optional down script.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    /// Sortable timestamp id, unique within the catalog.
    pub id: String,
    /// The name portion of the file name, for humans only.
    pub name: String,
    pub up: SqlFile,
    /// `None` marks the migration irreversible.
    pub down: Option<SqlFile>,
}

impl Migration {
    /// Build a migration from the path of its up file, locating the matching
    /// down file next to it.
    pub fn from_up_path(up_path: &Path) -> Result<Self, Error> {
        let file_name = up_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let full_name = file_name.strip_suffix(".up.sql").ok_or_else(|| {
            Error::MalformedMigration(format!("not an up file: '{}'", up_path.display()))
        })?;

        let (id, name) = full_name.split_once('_').ok_or_else(|| {
            Error::MalformedMigration(format!(
                "cannot extract migration id and name from '{}'",
                up_path.display()
            ))
        })?;

        if !valid_id(id) {
            return Err(Error::MalformedMigration(format!(
                "migration id '{}' is not a {}-digit timestamp in '{}'",
                id,
                MIGRATION_ID_LEN,
                up_path.display()
            )));
        }

        if name.is_empty() {
            return Err(Error::MalformedMigration(format!(
                "migration '{}' has an empty name",
                up_path.display()
            )));
        }

        let down_path = up_path.with_file_name(format!("{full_name}.down.sql"));
        let down = down_path.is_file().then(|| SqlFile::new(down_path));

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            up: SqlFile::new(up_path),
            down,
        })
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }
}

/// Returns whether `id` is a valid migration id: fixed width, all digits,
/// and a real timestamp.
pub fn valid_id(id: &str) -> bool {
    id.len() == MIGRATION_ID_LEN
        && id.bytes().all(|b| b.is_ascii_digit())
        && NaiveDateTime::parse_from_str(id, ID_FORMAT).is_ok()
}

/// The ordered, validated collection of all discovered migrations.
///
/// Invariants: ids are unique, and iteration order is ascending by id.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    migrations: Vec<Migration>,
}

impl Catalog {
    /// Scan a directory for `<id>_<name>.up.sql` files and build the catalog.
    ///
    /// Down files are picked up alongside their up file; a down file with no
    /// matching up file is ignored. Subdirectories are not descended into.
    pub fn discover(directory: &Path) -> Result<Self, Error> {
        let mut up_paths: Vec<PathBuf> = Vec::new();

        for entry in fs::read_dir(directory)? {
            let path = entry?.path();
            if path.is_file()
                && path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().ends_with(".up.sql"))
            {
                up_paths.push(path);
            }
        }

        up_paths.sort();

        let migrations = up_paths
            .iter()
            .map(|p| Migration::from_up_path(p))
            .collect::<Result<Vec<_>, _>>()?;

        for pair in migrations.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(Error::MalformedMigration(format!(
                    "duplicate migration id '{}'",
                    pair[0].id
                )));
            }
        }

        Ok(Self { migrations })
    }

    #[cfg(test)]
    pub(crate) fn from_migrations(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by(|a, b| a.id.cmp(&b.id));
        Self { migrations }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// The migration with the greatest id, if any.
    pub fn latest(&self) -> Option<&Migration> {
        self.migrations.last()
    }

    /// Format a timestamp as a migration id.
    pub fn generate_id(at: DateTime<Utc>) -> String {
        at.format(ID_FORMAT).to_string()
    }

    /// Create a new migration in `directory`, with an id taken from the
    /// current UTC time, and register it in the catalog. Both the up and
    /// down files are created empty.
    pub fn create(&mut self, directory: &Path, name: &str) -> Result<&Migration, Error> {
        self.create_with_id(directory, Self::generate_id(Utc::now()), name)
    }

    /// As [Catalog::create], with an explicit id.
    pub fn create_with_id(
        &mut self,
        directory: &Path,
        id: String,
        name: &str,
    ) -> Result<&Migration, Error> {
        if !valid_id(&id) {
            return Err(Error::MalformedMigration(format!(
                "migration id '{id}' is not a {MIGRATION_ID_LEN}-digit timestamp"
            )));
        }

        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-') {
            return Err(Error::MalformedMigration(format!(
                "migration name '{name}' must be non-empty and contain only \
                 alphanumerics, '_' and '-'"
            )));
        }

        if self.contains(&id) {
            return Err(Error::Collision { id });
        }

        let up_path = directory.join(format!("{id}_{name}.up.sql"));
        let down_path = directory.join(format!("{id}_{name}.down.sql"));
        fs::write(&up_path, "")?;
        fs::write(&down_path, "")?;

        let created_id = id.clone();
        self.migrations.push(Migration {
            id,
            name: name.to_string(),
            up: SqlFile::new(up_path),
            down: Some(SqlFile::new(down_path)),
        });
        self.migrations.sort_by(|a, b| a.id.cmp(&b.id));

        // Cannot fail: the id was just pushed.
        Ok(self
            .get(&created_id)
            .expect("catalog contains the id it just created"))
    }
}
