//! SQLite-backed credential store.

use super::schema::{CREATE_SCHEMA, SCHEMA_VERSION};
use super::PASSWORD_SALT_LEN;
use crate::error::{Error, Result};
use rand::RngCore;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Account store consumed by the rendezvous server.
///
/// Implementations must be safe to call from many connection tasks at once.
pub trait CredentialStore: Send + Sync {
    /// Create an account. Fails with [`Error::DuplicateUser`] if the
    /// username is taken, in which case nothing is written.
    fn register(&self, username: &str, password: &str) -> Result<()>;

    /// Check a username/password pair. Unknown users verify as `false`.
    fn verify(&self, username: &str, password: &str) -> Result<bool>;

    /// Refresh the user's last-seen timestamp.
    fn touch(&self, username: &str) -> Result<()>;
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the database file.
    pub path: String,
    /// Whether to use in-memory database (for testing).
    pub in_memory: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: super::DEFAULT_DB_NAME.to_string(),
            in_memory: false,
        }
    }
}

/// Database handle.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the account database.
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let conn = if config.in_memory {
            Connection::open_in_memory()
        } else {
            // Create parent directories if needed
            if let Some(parent) = Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| Error::Storage(format!("failed to create directory: {}", e)))?;
                }
            }

            Connection::open_with_flags(
                &config.path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
        }
        .map_err(|e| Error::Storage(format!("failed to open database: {}", e)))?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = DELETE;
            PRAGMA secure_delete = ON;
            PRAGMA temp_store = MEMORY;
            "#,
        )
        .map_err(|e| Error::Storage(format!("failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&DatabaseConfig {
            path: String::new(),
            in_memory: true,
        })
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        self.lock()?
            .execute_batch(&CREATE_SCHEMA.replace("?", &SCHEMA_VERSION.to_string()))
            .map_err(|e| Error::Storage(format!("failed to create schema: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("database lock poisoned".into()))
    }

    /// Last-seen timestamp of a user, if registered.
    pub fn last_seen(&self, username: &str) -> Result<Option<i64>> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT last_seen FROM users WHERE username = ?",
            params![username],
            |row| row.get(0),
        );

        match result {
            Ok(ts) => Ok(Some(ts)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    /// Number of registered accounts.
    pub fn user_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(count as u64)
    }
}

impl CredentialStore for Database {
    fn register(&self, username: &str, password: &str) -> Result<()> {
        let mut salt = [0u8; PASSWORD_SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let salt = hex::encode(salt);
        let hash = hash_password(&salt, password);
        let now = chrono::Utc::now().timestamp();

        let conn = self.lock()?;
        let result = conn.execute(
            r#"
            INSERT INTO users (username, password_salt, password_hash, last_seen, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![username, salt, hash, now, now],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(Error::DuplicateUser)
            }
            Err(e) => Err(Error::Storage(format!("failed to register user: {}", e))),
        }
    }

    fn verify(&self, username: &str, password: &str) -> Result<bool> {
        let conn = self.lock()?;
        let result = conn.query_row(
            "SELECT password_salt, password_hash FROM users WHERE username = ?",
            params![username],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        );

        match result {
            Ok((salt, stored)) => Ok(hash_password(&salt, password) == stored),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(Error::Storage(e.to_string())),
        }
    }

    fn touch(&self, username: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        self.lock()?
            .execute(
                "UPDATE users SET last_seen = ? WHERE username = ?",
                params![now, username],
            )
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Hex SHA-256 of `salt || password`.
fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}
