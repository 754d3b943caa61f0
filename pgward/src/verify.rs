//! Schema drift verification.
//!
//! `verify` answers one question: does replaying every migration from
//! nothing produce the schema the project declares in `schema.sql`?
//!
//! The full catalog is applied to a throwaway database created for the
//! occasion (never the target database), the result is captured with
//! `pg_dump`, and both the dump and the declared snapshot are compared
//! after a fixed normalization: `--` comments stripped, blank lines
//! dropped, whitespace runs collapsed. Comparison is textual equality,
//! not semantic DDL analysis.
//!
//! Independently of the structural comparison, the version stamp in the
//! snapshot's leading comment block (`-- schema version: <id>`) must name
//! the catalog's newest id; a stale stamp means the snapshot was generated
//! out of band and is reported even when the structure matches.

use similar::TextDiff;
use uuid::Uuid;

use crate::config::ConnectConfig;
use crate::error::Error;
use crate::migrator::Migrator;
use crate::pg_dump::PgDump;
use crate::project::Project;
use crate::tracker::{Target, DEFAULT_VERSION_TABLE};

/// Result of a schema verification. Failed checks live here; only
/// infrastructure problems (scratch database, pg_dump) are [Error]s.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    /// Whether the canonicalized dump equals the canonicalized snapshot.
    pub schema_matches: bool,
    /// Unified diff between snapshot and dump; empty when they match.
    pub diff: String,
    /// The stamp check, or `None` when the snapshot carries no stamp.
    pub version_stamp: Option<VersionStamp>,
}

/// The version stamp recorded in the snapshot versus the catalog's newest id.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionStamp {
    pub declared: String,
    pub expected: String,
}

impl VersionStamp {
    pub fn matches(&self) -> bool {
        self.declared == self.expected
    }
}

impl VerifyOutcome {
    /// Whether the check passed: structure matches and the stamp, when
    /// present, names the catalog's newest id.
    pub fn is_success(&self) -> bool {
        self.schema_matches && self.version_stamp.as_ref().map_or(true, VersionStamp::matches)
    }
}

/// Replays a project's catalog into a scratch database and compares the
/// result against the declared snapshot.
#[derive(Debug)]
pub struct Verifier<'a> {
    project: &'a Project,
    version_table: String,
    pg_dump: PgDump,
}

impl<'a> Verifier<'a> {
    pub fn new(project: &'a Project) -> Self {
        Self {
            project,
            version_table: DEFAULT_VERSION_TABLE.to_string(),
            pg_dump: PgDump::default(),
        }
    }

    pub fn with_version_table(mut self, name: impl Into<String>) -> Self {
        self.version_table = name.into();
        self
    }

    pub fn with_pg_dump(mut self, pg_dump: PgDump) -> Self {
        self.pg_dump = pg_dump;
        self
    }

    /// Run the verification. `config` names the server to borrow for the
    /// scratch database; its `dbname` is not touched.
    pub fn verify(&self, config: &ConnectConfig) -> Result<VerifyOutcome, Error> {
        let declared = self.project.schema_file().read()?;
        let dumped = self.replay_dump(config)?;

        let expected = canonicalize(&declared);
        let actual = canonicalize(&dumped);
        let schema_matches = expected == actual;

        let diff = if schema_matches {
            String::new()
        } else {
            TextDiff::from_lines(&expected, &actual)
                .unified_diff()
                .header("schema.sql", "pg_dump")
                .to_string()
        };

        let version_stamp = version_stamp(&declared).map(|declared| VersionStamp {
            declared,
            expected: self
                .project
                .catalog()
                .latest()
                .map(|m| m.id.clone())
                .unwrap_or_default(),
        });

        Ok(VerifyOutcome {
            schema_matches,
            diff,
            version_stamp,
        })
    }

    /// Apply the full catalog to a fresh scratch database and return its
    /// schema dump. The scratch database is dropped on every exit path.
    pub fn replay_dump(&self, config: &ConnectConfig) -> Result<String, Error> {
        let scratch_name = format!("pgward_verify_{}", Uuid::new_v4().simple());
        let scratch = config.with_dbname(&scratch_name);

        scratch.create_database()?;

        let result = self.replay_dump_in(&scratch);

        // Best effort: a failed replay must surface its own error, not the
        // cleanup's.
        let cleanup = scratch.drop_database();

        match (result, cleanup) {
            (Ok(dump), Ok(())) => Ok(dump),
            (Ok(_), Err(cleanup_error)) => Err(cleanup_error),
            (Err(error), _) => Err(error),
        }
    }

    fn replay_dump_in(&self, scratch: &ConnectConfig) -> Result<String, Error> {
        let mut client = scratch.connect()?;

        // The scratch database is private to this call; locking would only
        // collide with a real run against the same server.
        let migrator = Migrator::new(self.project.catalog().clone())
            .with_version_table(&self.version_table)?
            .with_lock_disabled();
        migrator.migrate(&mut client, &Target::Latest)?;

        // The connection must be gone before the scratch database can drop.
        drop(client);

        self.pg_dump.schema_only(scratch, &self.version_table)
    }
}

/// Apply the fixed normalization rule: strip `--` comments, drop blank
/// lines and psql meta-commands, collapse whitespace runs.
///
/// Meta-command lines (`\restrict`, `\connect`, ...) are not schema; newer
/// pg_dump versions emit `\restrict` with a token that differs per run.
pub fn canonicalize(sql: &str) -> String {
    sql.lines()
        .map(|line| match line.find("--") {
            Some(idx) => &line[..idx],
            None => line,
        })
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty() && !line.starts_with('\\'))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Read the version stamp from the snapshot's leading comment block:
/// a `--` comment containing `version` followed by a migration id.
pub fn version_stamp(schema: &str) -> Option<String> {
    for line in schema.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let Some(comment) = line.strip_prefix("--") else {
            // Only the leading comment block may carry the stamp.
            return None;
        };

        if !comment.to_ascii_lowercase().contains("version") {
            continue;
        }

        if let Some(id) = comment
            .split_whitespace()
            .find(|token| crate::migration::valid_id(token))
        {
            return Some(id.to_string());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_ignores_comments_and_whitespace() {
        let left = "-- a comment\nCREATE TABLE a (\n    id   int\n);\n\n";
        let right = "\\restrict abc123\nCREATE TABLE a ( -- inline note\n  id int\n);";

        assert_eq!(canonicalize(left), canonicalize(right));
        assert_eq!(canonicalize(left), "CREATE TABLE a (\nid int\n);");
    }

    #[test]
    fn canonicalize_distinguishes_real_differences() {
        assert_ne!(
            canonicalize("CREATE TABLE a (id int);"),
            canonicalize("CREATE TABLE a (id bigint);")
        );
    }

    #[test]
    fn stamp_is_read_from_leading_comments_only() {
        let schema = "-- pgward schema\n-- schema version: 20240102000000\nCREATE TABLE a ();";
        assert_eq!(version_stamp(schema).as_deref(), Some("20240102000000"));

        let after_sql = "CREATE TABLE a ();\n-- schema version: 20240102000000";
        assert_eq!(version_stamp(after_sql), None);

        let unstamped = "-- just a comment\nCREATE TABLE a ();";
        assert_eq!(version_stamp(unstamped), None);
    }

    #[test]
    fn outcome_success_requires_structure_and_stamp() {
        let ok = VerifyOutcome {
            schema_matches: true,
            diff: String::new(),
            version_stamp: Some(VersionStamp {
                declared: "20240101000000".into(),
                expected: "20240101000000".into(),
            }),
        };
        assert!(ok.is_success());

        let stale_stamp = VerifyOutcome {
            version_stamp: Some(VersionStamp {
                declared: "20240101000000".into(),
                expected: "20240102000000".into(),
            }),
            ..ok.clone()
        };
        assert!(!stale_stamp.is_success());

        let unstamped = VerifyOutcome {
            version_stamp: None,
            ..ok.clone()
        };
        assert!(unstamped.is_success());

        let mismatch = VerifyOutcome {
            schema_matches: false,
            ..ok
        };
        assert!(!mismatch.is_success());
    }
}
