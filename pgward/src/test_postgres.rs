#![allow(dead_code)]

//! PostgreSQL test infrastructure.
//!
//! One container is started for the whole test run; each test gets its own
//! uniquely-named database so tests never observe each other's state.

use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;

use postgres::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

use crate::config::ConnectConfig;

/// Default credentials for testcontainers-modules postgres.
const PG_USER: &str = "postgres";
const PG_PASSWORD: &str = "postgres";
const PG_DB: &str = "postgres";

static POSTGRES_PORT: OnceLock<u16> = OnceLock::new();

/// Start the shared PostgreSQL container on first use and return its mapped
/// port. The container (and the runtime that owns it) is intentionally
/// leaked so it outlives every test.
fn postgres_port() -> u16 {
    *POSTGRES_PORT.get_or_init(|| {
        let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");

        let port = rt.block_on(async {
            let container = Postgres::default()
                .start()
                .await
                .expect("failed to start postgres container");

            let port = container
                .get_host_port_ipv4(5432)
                .await
                .expect("failed to get postgres port");

            std::mem::forget(container);
            port
        });

        std::mem::forget(rt);
        port
    })
}

/// Connection settings for the shared container's maintenance database.
pub fn server_config() -> ConnectConfig {
    ConnectConfig::new(PG_DB)
        .host("127.0.0.1")
        .port(postgres_port())
        .user(PG_USER)
        .password(PG_PASSWORD)
}

/// Create a fresh, uniquely-named database and return a client connected to
/// it along with its connection settings (for opening further sessions).
pub fn fresh_client() -> (Client, ConnectConfig) {
    let db_name = format!("test_{}", Uuid::new_v4().simple());
    let config = server_config().with_dbname(&db_name);

    config.create_database().expect("failed to create test database");
    let client = config.connect().expect("failed to connect to test database");

    (client, config)
}

/// Write a migration file pair into `dir`. `down: None` leaves the
/// migration irreversible.
pub fn write_migration(dir: &Path, id: &str, name: &str, up: &str, down: Option<&str>) {
    std::fs::write(dir.join(format!("{id}_{name}.up.sql")), up).unwrap();
    if let Some(down) = down {
        std::fs::write(dir.join(format!("{id}_{name}.down.sql")), down).unwrap();
    }
}

/// Whether a host-side `pg_dump` is available for verification tests.
pub fn pg_dump_available() -> bool {
    Command::new("pg_dump")
        .arg("--version")
        .output()
        .is_ok()
}
