//! Cross-process mutual exclusion via PostgreSQL advisory locks.
//!
//! The lock is session-level, not transaction-level: the executor runs one
//! transaction per migration and the lock must span the whole plan. A
//! session that dies releases its advisory locks with it, so a crashed run
//! can never leave the database locked beyond its connection's lifetime.
//!
//! Lock keys are derived from the fully-qualified version table name, so
//! two projects tracking state in different tables never contend, and the
//! same project always contends with itself.

use std::thread;
use std::time::{Duration, Instant};

use postgres::Client;
use sha2::{Digest, Sha256};

use crate::error::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Derive the 64-bit advisory lock key for a version table name.
/// Deterministic across processes and hosts.
pub fn lock_key(version_table: &str) -> i64 {
    let digest = Sha256::digest(version_table.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// An exclusively-held session-level advisory lock, or the no-op token used
/// when locking is disabled.
#[derive(Debug)]
pub struct MigrationLock {
    key: i64,
    acquired: bool,
}

impl MigrationLock {
    /// Acquire the lock on `client`'s session.
    ///
    /// A zero `timeout` blocks until the lock is granted. A nonzero timeout
    /// polls `pg_try_advisory_lock` until the deadline and fails with
    /// [Error::LockTimeout], having mutated nothing.
    ///
    /// `pg_advisory_lock` would also serialize waiters, but the try-lock
    /// poll keeps the timeout under our control rather than the server's.
    pub fn acquire(client: &mut Client, key: i64, timeout: Duration) -> Result<Self, Error> {
        if timeout.is_zero() {
            #[cfg(feature = "tracing")]
            tracing::info!(key, "Waiting for migration lock");

            client.execute("SELECT pg_advisory_lock($1)", &[&key])?;
            return Ok(Self { key, acquired: true });
        }

        let deadline = Instant::now() + timeout;
        loop {
            let granted: bool = client
                .query_one("SELECT pg_try_advisory_lock($1)", &[&key])?
                .get(0);

            if granted {
                #[cfg(feature = "tracing")]
                tracing::info!(key, "Acquired migration lock");

                return Ok(Self { key, acquired: true });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::LockTimeout {
                    key,
                    waited: timeout,
                });
            }

            #[cfg(feature = "tracing")]
            tracing::warn!(key, "Migration lock held elsewhere, waiting");

            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// A token that holds nothing. Used when locking is disabled; callers
    /// proceeding without exclusion accept concurrent interleaving.
    pub fn disabled() -> Self {
        Self {
            key: 0,
            acquired: false,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    pub fn key(&self) -> i64 {
        self.key
    }

    /// Release the lock. Idempotent: releasing an already-released or
    /// disabled token does nothing. The session's end releases the lock
    /// regardless.
    pub fn release(&mut self, client: &mut Client) -> Result<(), Error> {
        if self.acquired {
            client.execute("SELECT pg_advisory_unlock($1)", &[&self.key])?;
            self.acquired = false;

            #[cfg(feature = "tracing")]
            tracing::info!(key = self.key, "Released migration lock");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_per_table() {
        assert_eq!(lock_key("schema_version"), lock_key("schema_version"));
        assert_ne!(lock_key("schema_version"), lock_key("audit.schema_version"));
        assert_ne!(lock_key("schema_version"), lock_key("schema_version2"));
    }

    #[test]
    fn disabled_token_is_inert() {
        let token = MigrationLock::disabled();
        assert!(!token.is_acquired());
        assert_eq!(token.key(), 0);
    }
}

#[cfg(test)]
mod pg_tests {
    use super::*;
    use crate::test_postgres::fresh_client;

    #[test]
    fn acquire_and_release_roundtrip() {
        let (mut client, config) = fresh_client();
        let key = lock_key("schema_version");

        let mut token = MigrationLock::acquire(&mut client, key, Duration::ZERO).unwrap();
        assert!(token.is_acquired());

        // A second session cannot take the lock while it is held.
        let mut other = config.connect().unwrap();
        let granted: bool = other
            .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
            .unwrap()
            .get(0);
        assert!(!granted);

        token.release(&mut client).unwrap();
        // Idempotent.
        token.release(&mut client).unwrap();

        let granted: bool = other
            .query_one("SELECT pg_try_advisory_lock($1)", &[&key])
            .unwrap()
            .get(0);
        assert!(granted);
    }

    #[test]
    fn acquire_times_out_when_held_elsewhere() {
        let (mut holder, config) = fresh_client();
        let key = lock_key("timeout_case");
        MigrationLock::acquire(&mut holder, key, Duration::ZERO).unwrap();

        let mut waiter = config.connect().unwrap();
        let started = Instant::now();
        let err =
            MigrationLock::acquire(&mut waiter, key, Duration::from_millis(300)).unwrap_err();

        assert!(matches!(err, Error::LockTimeout { key: k, .. } if k == key));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
