//! Database schema definitions.

/// Schema version for migrations.
pub const SCHEMA_VERSION: u32 = 1;

/// SQL to create the database schema.
pub const CREATE_SCHEMA: &str = r#"
-- Registered accounts
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    password_salt TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    last_seen INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_username ON users(username);

-- Settings table
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);

-- Schema version
INSERT OR REPLACE INTO settings (key, value) VALUES ('schema_version', ?);
"#;
