//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS tenants (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            username TEXT NOT NULL,
            password_enc TEXT NOT NULL,
            pin_enc TEXT,
            run_hour INTEGER NOT NULL DEFAULT 3,
            sheet_id TEXT NOT NULL,
            scope_selector TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            manual_run INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS run_log (
            id INTEGER PRIMARY KEY,
            tenant_id INTEGER NOT NULL,
            attempted_at TEXT NOT NULL,
            success INTEGER NOT NULL,
            message TEXT,
            artifact_path TEXT,
            sheet_updated INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (tenant_id) REFERENCES tenants(id)
        );

        CREATE INDEX IF NOT EXISTS idx_run_log_tenant ON run_log(tenant_id, attempted_at);",
    )?;

    Ok(())
}
