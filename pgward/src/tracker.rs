//! The schema version table and migration planning queries.
//!
//! Applied migrations are recorded in a table (optionally schema-qualified,
//! default [DEFAULT_VERSION_TABLE]) with one row per applied migration id.
//! The set of recorded ids is kept prefix-closed under the catalog's order
//! by the executor, which makes the current version the maximum recorded id
//! and the pending set the remainder of the catalog.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use postgres::{Client, Transaction};

use crate::error::Error;
use crate::migration::{Catalog, Migration};

/// Default name for the schema version table.
pub const DEFAULT_VERSION_TABLE: &str = "schema_version";

/// Quote a SQL identifier.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// One applied migration, as durably recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedRecord {
    pub id: String,
    pub applied_at: DateTime<Utc>,
}

/// The (optionally schema-qualified) version table.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionTable {
    schema: Option<String>,
    table: String,
}

impl VersionTable {
    /// Parse a table name of the form `table` or `schema.table`.
    pub fn new(name: &str) -> Result<Self, Error> {
        let mut parts = name.split('.');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();

        if first.is_empty() || second.is_some_and(str::is_empty) || parts.next().is_some() {
            return Err(Error::Project(format!(
                "invalid schema version table name: '{name}'"
            )));
        }

        Ok(match second {
            Some(table) => Self {
                schema: Some(first.to_string()),
                table: table.to_string(),
            },
            None => Self {
                schema: None,
                table: first.to_string(),
            },
        })
    }

    /// The quoted, qualified name for use in SQL text.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.table)),
            None => quote_ident(&self.table),
        }
    }

    fn schema_or_public(&self) -> &str {
        self.schema.as_deref().unwrap_or("public")
    }

    /// Whether the table exists in the database.
    pub fn exists(&self, client: &mut Client) -> Result<bool, Error> {
        let row = client.query_one(
            "SELECT EXISTS (SELECT FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name = $2)",
            &[&self.schema_or_public(), &self.table.as_str()],
        )?;
        Ok(row.get(0))
    }

    /// Idempotently create the table (and its schema, when qualified).
    /// Runs inside the caller's transaction so that table creation commits
    /// together with the first recorded migration.
    pub fn ensure(&self, tx: &mut Transaction<'_>) -> Result<(), Error> {
        if let Some(schema) = &self.schema {
            tx.batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema)))?;
        }

        tx.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id text PRIMARY KEY, \
                applied_at timestamptz NOT NULL DEFAULT now()\
            )",
            self.qualified()
        ))?;
        Ok(())
    }

    /// All recorded migrations, ascending by id. An absent table reads as
    /// an empty history.
    pub fn applied(&self, client: &mut Client) -> Result<Vec<AppliedRecord>, Error> {
        if !self.exists(client)? {
            return Ok(Vec::new());
        }

        let rows = client.query(
            &format!("SELECT id, applied_at FROM {} ORDER BY id", self.qualified()),
            &[],
        )?;

        Ok(rows
            .into_iter()
            .map(|row| AppliedRecord {
                id: row.get(0),
                applied_at: row.get(1),
            })
            .collect())
    }

    /// All recorded ids, ascending.
    pub fn applied_ids(&self, client: &mut Client) -> Result<Vec<String>, Error> {
        Ok(self.applied(client)?.into_iter().map(|r| r.id).collect())
    }

    /// The maximum recorded id, or `None` when nothing has been applied.
    pub fn current(&self, client: &mut Client) -> Result<Option<String>, Error> {
        if !self.exists(client)? {
            return Ok(None);
        }

        let row = client.query_one(&format!("SELECT max(id) FROM {}", self.qualified()), &[])?;
        Ok(row.get(0))
    }

    pub(crate) fn record_applied(&self, tx: &mut Transaction<'_>, id: &str) -> Result<(), Error> {
        tx.execute(
            &format!("INSERT INTO {} (id) VALUES ($1)", self.qualified()),
            &[&id],
        )?;
        Ok(())
    }

    pub(crate) fn record_reverted(&self, tx: &mut Transaction<'_>, id: &str) -> Result<(), Error> {
        tx.execute(
            &format!("DELETE FROM {} WHERE id = $1", self.qualified()),
            &[&id],
        )?;
        Ok(())
    }
}

impl fmt::Display for VersionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

/// Which way a migration operation moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// A migration target: the symbolic tokens `latest` (forward) and `last`
/// (rollback), or an explicit migration id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The newest migration in the catalog (forward default).
    Latest,
    /// The version the database was at before its most recent migration
    /// (rollback default): rolling back to `last` reverts exactly one
    /// migration.
    Last,
    Id(String),
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(Self::Latest),
            "last" => Ok(Self::Last),
            "" => Err(Error::UnknownTarget { target: s.into() }),
            _ => Ok(Self::Id(s.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Last => write!(f, "last"),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Catalog entries not yet applied, ascending by id.
///
/// Fails with [Error::Drift] when the history records an id with no
/// corresponding migration file: the engine halts rather than plan around a
/// catalog it cannot account for.
pub fn pending<'a>(catalog: &'a Catalog, applied: &[String]) -> Result<Vec<&'a Migration>, Error> {
    for id in applied {
        if !catalog.contains(id) {
            return Err(Error::Drift { id: id.clone() });
        }
    }

    let applied: HashSet<&str> = applied.iter().map(String::as_str).collect();
    Ok(catalog
        .iter()
        .filter(|m| !applied.contains(m.id.as_str()))
        .collect())
}

/// Resolve a [Target] to a concrete migration id, or `None` for "before
/// everything" (an empty catalog forward, a full revert backward).
pub fn resolve_target(
    catalog: &Catalog,
    applied: &[String],
    target: &Target,
    direction: Direction,
) -> Result<Option<String>, Error> {
    match (target, direction) {
        (Target::Latest, Direction::Up) => Ok(catalog.latest().map(|m| m.id.clone())),
        (Target::Last, Direction::Down) => match applied {
            [] => Err(Error::Rollback(
                "cannot rollback: no migrations have been applied".to_string(),
            )),
            [_only] => Ok(None),
            [.., previous, _newest] => Ok(Some(previous.clone())),
        },
        (Target::Id(id), _) => {
            if catalog.contains(id) {
                Ok(Some(id.clone()))
            } else {
                Err(Error::UnknownTarget { target: id.clone() })
            }
        }
        // 'latest' only moves forward, 'last' only backward.
        (token, _) => Err(Error::UnknownTarget {
            target: token.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::SqlFile;

    fn migration(id: &str) -> Migration {
        Migration {
            id: id.to_string(),
            name: "m".to_string(),
            up: SqlFile::new(format!("{id}_m.up.sql")),
            down: Some(SqlFile::new(format!("{id}_m.down.sql"))),
        }
    }

    fn catalog(ids: &[&str]) -> Catalog {
        Catalog::from_migrations(ids.iter().map(|id| migration(id)).collect())
    }

    fn ids(migrations: &[&Migration]) -> Vec<String> {
        migrations.iter().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn version_table_parses_qualified_names() {
        let plain = VersionTable::new("schema_version").unwrap();
        assert_eq!(plain.qualified(), "\"schema_version\"");

        let qualified = VersionTable::new("audit.schema_version").unwrap();
        assert_eq!(qualified.qualified(), "\"audit\".\"schema_version\"");
        assert_eq!(qualified.to_string(), "audit.schema_version");

        for bad in ["", ".", "a.", ".b", "a.b.c"] {
            assert!(VersionTable::new(bad).is_err(), "name: {bad:?}");
        }
    }

    #[test]
    fn pending_is_catalog_minus_applied_in_order() {
        let catalog = catalog(&["20240101000000", "20240102000000", "20240103000000"]);

        let all = pending(&catalog, &[]).unwrap();
        assert_eq!(
            ids(&all),
            vec!["20240101000000", "20240102000000", "20240103000000"]
        );

        let rest = pending(&catalog, &["20240101000000".into()]).unwrap();
        assert_eq!(ids(&rest), vec!["20240102000000", "20240103000000"]);

        let none = pending(
            &catalog,
            &[
                "20240101000000".into(),
                "20240102000000".into(),
                "20240103000000".into(),
            ],
        )
        .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn pending_halts_on_unknown_applied_id() {
        let catalog = catalog(&["20240101000000"]);

        let err = pending(&catalog, &["20230101000000".into()]).unwrap_err();
        assert!(matches!(err, Error::Drift { id } if id == "20230101000000"));
    }

    #[test]
    fn latest_resolves_to_newest_catalog_entry() {
        let catalog = catalog(&["20240101000000", "20240102000000"]);

        let target = resolve_target(&catalog, &[], &Target::Latest, Direction::Up).unwrap();
        assert_eq!(target.as_deref(), Some("20240102000000"));

        let empty = resolve_target(&Catalog::default(), &[], &Target::Latest, Direction::Up).unwrap();
        assert_eq!(empty, None);
    }

    #[test]
    fn last_reverts_exactly_one_migration() {
        let catalog = catalog(&["20240101000000", "20240102000000", "20240103000000"]);
        let applied = vec![
            "20240101000000".to_string(),
            "20240102000000".to_string(),
            "20240103000000".to_string(),
        ];

        let target = resolve_target(&catalog, &applied, &Target::Last, Direction::Down).unwrap();
        assert_eq!(target.as_deref(), Some("20240102000000"));

        let single = resolve_target(
            &catalog,
            &["20240101000000".to_string()],
            &Target::Last,
            Direction::Down,
        )
        .unwrap();
        assert_eq!(single, None);

        let err = resolve_target(&catalog, &[], &Target::Last, Direction::Down).unwrap_err();
        assert!(matches!(err, Error::Rollback(_)));
    }

    #[test]
    fn explicit_target_must_be_in_catalog() {
        let catalog = catalog(&["20240101000000"]);

        let ok = resolve_target(
            &catalog,
            &[],
            &Target::Id("20240101000000".into()),
            Direction::Up,
        )
        .unwrap();
        assert_eq!(ok.as_deref(), Some("20240101000000"));

        let err = resolve_target(
            &catalog,
            &[],
            &Target::Id("20990101000000".into()),
            Direction::Up,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownTarget { target } if target == "20990101000000"));
    }

    #[test]
    fn symbolic_targets_are_direction_specific() {
        let catalog = catalog(&["20240101000000"]);

        assert!(resolve_target(&catalog, &[], &Target::Last, Direction::Up).is_err());
        assert!(
            resolve_target(&catalog, &[], &Target::Latest, Direction::Down).is_err()
        );
    }

    #[test]
    fn target_parses_tokens_and_ids() {
        assert_eq!("latest".parse::<Target>().unwrap(), Target::Latest);
        assert_eq!("last".parse::<Target>().unwrap(), Target::Last);
        assert_eq!(
            "20240101000000".parse::<Target>().unwrap(),
            Target::Id("20240101000000".into())
        );
        assert!("".parse::<Target>().is_err());
    }
}
