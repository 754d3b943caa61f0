//! Explicit connection configuration.
//!
//! Nothing in this crate reads the process environment; callers (usually the
//! CLI) assemble a [ConnectConfig] and pass it down. The same values drive
//! both [postgres] client connections and the arguments handed to the
//! external `pg_dump` executable.

use std::time::Duration;

use postgres::{Client, NoTls};

use crate::error::Error;
use crate::tracker::quote_ident;

/// The maintenance database used for create/drop operations and as the
/// connection point when no target database exists yet.
pub const MAINTENANCE_DATABASE: &str = "postgres";

/// Connection parameters for a single PostgreSQL server and database.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
    /// How long to wait for a connection to be established.
    pub connect_timeout: Duration,
}

impl ConnectConfig {
    pub fn new(dbname: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            dbname: dbname.into(),
            connect_timeout: Duration::from_secs(60),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The same server, different database.
    pub fn with_dbname(&self, dbname: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.dbname = dbname.into();
        config
    }

    /// The same server, connected to the maintenance database.
    pub fn maintenance(&self) -> Self {
        self.with_dbname(MAINTENANCE_DATABASE)
    }

    /// Open a blocking client connection.
    pub fn connect(&self) -> Result<Client, Error> {
        let mut config = postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .connect_timeout(self.connect_timeout);

        if let Some(password) = &self.password {
            config.password(password);
        }

        Ok(config.connect(NoTls)?)
    }

    /// Connection arguments for the `pg_dump` executable. The password, when
    /// set, travels via the `PGPASSWORD` environment variable instead (see
    /// [crate::pg_dump::PgDump]).
    pub fn pg_dump_args(&self) -> Vec<String> {
        vec![
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--username".to_string(),
            self.user.clone(),
            "--dbname".to_string(),
            self.dbname.clone(),
        ]
    }

    /// Create this configuration's database via the maintenance database.
    pub fn create_database(&self) -> Result<(), Error> {
        let mut admin = self.maintenance().connect()?;
        admin.batch_execute(&format!("CREATE DATABASE {}", quote_ident(&self.dbname)))?;
        Ok(())
    }

    /// Drop this configuration's database via the maintenance database.
    pub fn drop_database(&self) -> Result<(), Error> {
        let mut admin = self.maintenance().connect()?;
        admin.batch_execute(&format!("DROP DATABASE {}", quote_ident(&self.dbname)))?;
        Ok(())
    }

    /// Whether this configuration's database exists on the server.
    pub fn database_exists(&self) -> Result<bool, Error> {
        let mut admin = self.maintenance().connect()?;
        let row = admin.query_one(
            "SELECT EXISTS (SELECT FROM pg_database WHERE datname = $1)",
            &[&self.dbname],
        )?;
        Ok(row.get(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_dump_args_carry_connection_parameters() {
        let config = ConnectConfig::new("appdb")
            .host("db.internal")
            .port(5433)
            .user("deploy");

        assert_eq!(
            config.pg_dump_args(),
            vec![
                "--host", "db.internal", "--port", "5433", "--username", "deploy", "--dbname",
                "appdb",
            ]
        );
    }

    #[test]
    fn maintenance_swaps_only_the_database() {
        let config = ConnectConfig::new("appdb").host("db.internal").port(5433);
        let admin = config.maintenance();

        assert_eq!(admin.dbname, MAINTENANCE_DATABASE);
        assert_eq!(admin.host, "db.internal");
        assert_eq!(admin.port, 5433);
    }
}
