//! The `pgward` command-line interface.
//!
//! A thin layer over the `pgward` library: argument parsing, env-var
//! fallbacks, and exit codes. Exit code 0 on success, 1 on any engine error
//! or failed verification, 2 on usage errors (clap's default).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pgward::{
    ConnectConfig, Migrator, PgDump, Project, Target, Verifier, DEFAULT_VERSION_TABLE,
};

#[derive(Parser)]
#[command(name = "pgward", version, about = "PostgreSQL migrations with verification")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ProjectArgs {
    /// Project directory containing schema.sql and migrations/
    #[arg(long, env = "PGWARD_PROJECT_DIRECTORY", default_value = ".")]
    project_directory: PathBuf,
}

impl ProjectArgs {
    fn open(&self) -> anyhow::Result<Project> {
        Project::open(&self.project_directory).with_context(|| {
            format!("failed to open project '{}'", self.project_directory.display())
        })
    }
}

#[derive(Args)]
struct ServerArgs {
    /// Database server host
    #[arg(long, env = "PGHOST", default_value = "localhost")]
    host: String,

    /// Database server port
    #[arg(long, env = "PGPORT", default_value_t = 5432)]
    port: u16,

    /// Database user
    #[arg(long, env = "PGUSER", default_value = "postgres")]
    user: String,

    /// Database password
    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Seconds to wait for a database connection
    #[arg(long, env = "PGWARD_WAIT_TIMEOUT", default_value_t = 60)]
    wait_timeout: u64,
}

impl ServerArgs {
    fn config(&self, dbname: &str) -> ConnectConfig {
        let mut config = ConnectConfig::new(dbname)
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .connect_timeout(Duration::from_secs(self.wait_timeout));

        if let Some(password) = &self.password {
            config = config.password(password);
        }

        config
    }
}

#[derive(Args)]
struct DatabaseArgs {
    #[command(flatten)]
    server: ServerArgs,

    /// Database name to operate on
    #[arg(short = 'd', long, env = "PGDATABASE", value_name = "DATABASE_NAME")]
    database: String,
}

impl DatabaseArgs {
    fn config(&self) -> ConnectConfig {
        self.server.config(&self.database)
    }
}

#[derive(Args)]
struct TrackerArgs {
    /// Name of the table (optionally schema-qualified) in which to store
    /// applied schema versions
    #[arg(
        long,
        env = "PGWARD_SCHEMA_VERSION_TABLE",
        default_value = DEFAULT_VERSION_TABLE
    )]
    schema_version_table: String,
}

#[derive(Args)]
struct LockArgs {
    /// Run without the migration advisory lock
    #[arg(long)]
    no_lock: bool,

    /// Seconds to wait for the migration advisory lock; 0 waits indefinitely
    #[arg(long, env = "PGWARD_LOCK_TIMEOUT", default_value_t = 60)]
    lock_timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new pgward project in the project directory
    Init {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Create a new migration with the given name
    New {
        migration_name: String,
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Create the database
    Create {
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Drop the database
    Drop {
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// List all unapplied migrations
    Pending {
        #[command(flatten)]
        project: ProjectArgs,
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        tracker: TrackerArgs,
    },
    /// Print the current schema version
    CurrentSchema {
        #[command(flatten)]
        project: ProjectArgs,
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        tracker: TrackerArgs,
    },
    /// Execute schema.sql against the database
    LoadSchema {
        #[command(flatten)]
        project: ProjectArgs,
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Execute a named fixture against the database
    LoadFixture {
        fixture_name: String,
        #[command(flatten)]
        project: ProjectArgs,
        #[command(flatten)]
        database: DatabaseArgs,
    },
    /// Migrate the database to the latest (or specified) version
    Migrate {
        /// Migration id to converge to
        #[arg(long, value_name = "TARGET_MIGRATION_ID", default_value = "latest")]
        target: Target,
        #[command(flatten)]
        project: ProjectArgs,
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        tracker: TrackerArgs,
        #[command(flatten)]
        lock: LockArgs,
    },
    /// Rollback the database to the last (or specified) version
    Rollback {
        /// Migration id to converge to
        #[arg(long, value_name = "TARGET_MIGRATION_ID", default_value = "last")]
        target: Target,
        #[command(flatten)]
        project: ProjectArgs,
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        tracker: TrackerArgs,
        #[command(flatten)]
        lock: LockArgs,
    },
    /// Migrate to the latest version, creating the database if necessary
    Up {
        #[command(flatten)]
        project: ProjectArgs,
        #[command(flatten)]
        database: DatabaseArgs,
        #[command(flatten)]
        tracker: TrackerArgs,
        #[command(flatten)]
        lock: LockArgs,
    },
    /// Check that schema.sql and the migrations are in sync
    Verify {
        #[command(flatten)]
        project: ProjectArgs,
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        tracker: TrackerArgs,
        /// Path to the pg_dump executable, or a name to look up on PATH
        #[arg(long = "pg-dump", env = "PGWARD_PG_DUMP", default_value = "pg_dump")]
        pg_dump: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn build_migrator(
    project: &Project,
    tracker: &TrackerArgs,
    lock: &LockArgs,
) -> anyhow::Result<Migrator> {
    let mut migrator = Migrator::new(project.catalog().clone())
        .with_version_table(&tracker.schema_version_table)?
        .with_lock_timeout(Duration::from_secs(lock.lock_timeout));

    if lock.no_lock {
        migrator = migrator.with_lock_disabled();
    }

    Ok(migrator)
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Init { project } => {
            Project::init(&project.project_directory)?;
        }
        Commands::New {
            migration_name,
            project,
        } => {
            let mut project = project.open()?;
            let migration = project.new_migration(&migration_name)?;
            println!("created {}", migration.up.path.display());
            if let Some(down) = &migration.down {
                println!("created {}", down.path.display());
            }
        }
        Commands::Create { database } => {
            database.config().create_database()?;
        }
        Commands::Drop { database } => {
            database.config().drop_database()?;
        }
        Commands::Pending {
            project,
            database,
            tracker,
        } => {
            let project = project.open()?;
            let migrator = Migrator::new(project.catalog().clone())
                .with_version_table(&tracker.schema_version_table)?;
            let mut client = database.config().connect()?;

            for migration in migrator.pending(&mut client)? {
                println!("{} {}", migration.id, migration.name);
            }
        }
        Commands::CurrentSchema {
            project,
            database,
            tracker,
        } => {
            let project = project.open()?;
            let migrator = Migrator::new(project.catalog().clone())
                .with_version_table(&tracker.schema_version_table)?;
            let mut client = database.config().connect()?;

            match migrator.current_version(&mut client)? {
                Some(version) => println!("{version}"),
                None => println!("none"),
            }
        }
        Commands::LoadSchema { project, database } => {
            let project = project.open()?;
            let mut client = database.config().connect()?;
            project.load_schema(&mut client)?;
        }
        Commands::LoadFixture {
            fixture_name,
            project,
            database,
        } => {
            let project = project.open()?;
            let mut client = database.config().connect()?;
            project.load_fixture(&fixture_name, &mut client)?;
        }
        Commands::Migrate {
            target,
            project,
            database,
            tracker,
            lock,
        } => {
            let project = project.open()?;
            let migrator = build_migrator(&project, &tracker, &lock)?;
            let mut client = database.config().connect()?;

            let report = migrator.migrate(&mut client, &target)?;
            for id in &report.migrations_run {
                println!("applied {id}");
            }
        }
        Commands::Rollback {
            target,
            project,
            database,
            tracker,
            lock,
        } => {
            let project = project.open()?;
            let migrator = build_migrator(&project, &tracker, &lock)?;
            let mut client = database.config().connect()?;

            let report = migrator.rollback(&mut client, &target)?;
            for id in &report.migrations_run {
                println!("reverted {id}");
            }
        }
        Commands::Up {
            project,
            database,
            tracker,
            lock,
        } => {
            let project = project.open()?;
            let migrator = build_migrator(&project, &tracker, &lock)?;
            let config = database.config();

            if !config.database_exists()? {
                config.create_database()?;
            }

            let mut client = config.connect()?;
            let report = migrator.migrate(&mut client, &Target::Latest)?;
            for id in &report.migrations_run {
                println!("applied {id}");
            }
        }
        Commands::Verify {
            project,
            server,
            tracker,
            pg_dump,
        } => {
            let project = project.open()?;
            let outcome = Verifier::new(&project)
                .with_version_table(&tracker.schema_version_table)
                .with_pg_dump(PgDump::new(pg_dump))
                .verify(&server.config(pgward::MAINTENANCE_DATABASE))?;

            if let Some(stamp) = &outcome.version_stamp {
                if !stamp.matches() {
                    eprintln!(
                        "version from schema doesn't match that from migrations: {} != {}",
                        stamp.declared, stamp.expected
                    );
                }
            }

            if !outcome.schema_matches {
                eprint!("{}", outcome.diff);
            }

            if !outcome.is_success() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
