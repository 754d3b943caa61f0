//! Project directory layout.
//!
//! A pgward project is a directory with this shape:
//!
//! ```text
//! schema.sql        declared schema snapshot
//! migrations/       <id>_<name>.up.sql / .down.sql pairs
//! fixtures/         named SQL files for seeding data (optional)
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::migration::{Catalog, Migration, SqlFile};

#[derive(Debug)]
pub struct Project {
    root: PathBuf,
    schema: SqlFile,
    catalog: Catalog,
    fixtures: BTreeMap<String, SqlFile>,
}

impl Project {
    /// Open and validate an existing project directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        let schema_file = root.join("schema.sql");
        let migrations_dir = root.join("migrations");
        let fixtures_dir = root.join("fixtures");

        if !schema_file.is_file() {
            return Err(Error::Project(format!(
                "schema does not exist or is wrong type: {}",
                schema_file.display()
            )));
        }

        if !migrations_dir.is_dir() {
            return Err(Error::Project(format!(
                "migrations directory does not exist or is wrong type: {}",
                migrations_dir.display()
            )));
        }

        if fixtures_dir.exists() && !fixtures_dir.is_dir() {
            return Err(Error::Project(format!(
                "fixtures directory is not a directory: {}",
                fixtures_dir.display()
            )));
        }

        let catalog = Catalog::discover(&migrations_dir)?;

        let mut fixtures = BTreeMap::new();
        if fixtures_dir.is_dir() {
            for entry in fs::read_dir(&fixtures_dir)? {
                let path = entry?.path();
                if path.is_file() && path.extension().is_some_and(|e| e == "sql") {
                    let fixture = SqlFile::new(path);
                    fixtures.insert(fixture.name.clone(), fixture);
                }
            }
        }

        Ok(Self {
            root,
            schema: SqlFile::new(schema_file),
            catalog,
            fixtures,
        })
    }

    /// Scaffold a new project in `root` (which must exist) and open it.
    /// Existing files are left alone, so `init` is idempotent.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();

        let schema_file = root.join("schema.sql");
        if !schema_file.exists() {
            fs::write(&schema_file, "")?;
        }
        fs::create_dir_all(root.join("migrations"))?;
        fs::create_dir_all(root.join("fixtures"))?;

        Self::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn schema_file(&self) -> &SqlFile {
        &self.schema
    }

    pub fn migrations_dir(&self) -> PathBuf {
        self.root.join("migrations")
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.root.join("fixtures")
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn fixtures(&self) -> impl Iterator<Item = &SqlFile> {
        self.fixtures.values()
    }

    /// Create a new migration named `name`, with an id taken from the
    /// current UTC time.
    pub fn new_migration(&mut self, name: &str) -> Result<&Migration, Error> {
        let dir = self.migrations_dir();
        self.catalog.create(&dir, name)
    }

    /// Execute `schema.sql` against the database as a single batch.
    pub fn load_schema(&self, client: &mut postgres::Client) -> Result<(), Error> {
        self.schema.execute(client)
    }

    pub fn fixture(&self, name: &str) -> Result<&SqlFile, Error> {
        self.fixtures
            .get(name)
            .ok_or_else(|| Error::Project(format!("unknown fixture: '{name}'")))
    }

    /// Execute a named fixture against the database.
    pub fn load_fixture(&self, name: &str, client: &mut postgres::Client) -> Result<(), Error> {
        self.fixture(name)?.execute(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_schema_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("migrations")).unwrap();

        let err = Project::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Project(msg) if msg.starts_with("schema does not exist")));
    }

    #[test]
    fn open_requires_migrations_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("schema.sql"), "").unwrap();

        let err = Project::open(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Project(msg) if msg.contains("migrations directory")));
    }

    #[test]
    fn init_scaffolds_layout() {
        let dir = tempfile::tempdir().unwrap();

        let project = Project::init(dir.path()).unwrap();

        assert!(project.schema_file().path.is_file());
        assert!(project.migrations_dir().is_dir());
        assert!(project.fixtures_dir().is_dir());
        assert!(project.catalog().is_empty());
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        Project::init(dir.path()).unwrap();
        fs::write(dir.path().join("schema.sql"), "CREATE TABLE a ();").unwrap();

        Project::init(dir.path()).unwrap();

        let contents = fs::read_to_string(dir.path().join("schema.sql")).unwrap();
        assert_eq!(contents, "CREATE TABLE a ();");
    }

    #[test]
    fn new_migration_lands_in_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::init(dir.path()).unwrap();

        let id = project.new_migration("add-users").unwrap().id.clone();

        assert!(project.catalog().contains(&id));
        assert_eq!(project.catalog().len(), 1);
        assert!(project
            .migrations_dir()
            .join(format!("{id}_add-users.up.sql"))
            .is_file());
    }

    #[test]
    fn fixtures_are_discovered_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        Project::init(dir.path()).unwrap();
        fs::write(dir.path().join("fixtures").join("seed_users.sql"), "").unwrap();

        let project = Project::open(dir.path()).unwrap();

        assert!(project.fixture("seed_users").is_ok());
        let err = project.fixture("missing").unwrap_err();
        assert!(matches!(err, Error::Project(msg) if msg.starts_with("unknown fixture")));
    }
}

#[cfg(test)]
mod pg_tests {
    use super::*;
    use crate::test_postgres::fresh_client;

    #[test]
    fn load_schema_and_fixture_execute_batches() {
        let (mut client, _config) = fresh_client();
        let dir = tempfile::tempdir().unwrap();
        Project::init(dir.path()).unwrap();
        fs::write(
            dir.path().join("schema.sql"),
            "CREATE TABLE users (id bigserial PRIMARY KEY, name text NOT NULL);",
        )
        .unwrap();
        fs::write(
            dir.path().join("fixtures").join("seed_users.sql"),
            "INSERT INTO users (name) VALUES ('alice'), ('bob');",
        )
        .unwrap();
        let project = Project::open(dir.path()).unwrap();

        project.load_schema(&mut client).unwrap();
        project.load_fixture("seed_users", &mut client).unwrap();

        let count: i64 = client
            .query_one("SELECT count(*) FROM users", &[])
            .unwrap()
            .get(0);
        assert_eq!(count, 2);
    }
}
