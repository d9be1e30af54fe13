//! SQLite storage layer -- tenants and the append-only run log.

pub mod schema;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};

/// Connection pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// In-memory pool for tests. Capped at one connection so every handle sees
/// the same database.
pub fn open_pool_in_memory() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory();
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

/// A configured venue/account the engine extracts reports for.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub password_enc: String,
    pub pin_enc: Option<String>,
    /// Scheduled hour-of-day, 0-23. Matching is deliberately hour-granular;
    /// minutes are not part of the schedule.
    pub run_hour: u8,
    pub sheet_id: String,
    pub scope_selector: Option<String>,
    pub active: bool,
    pub manual_run: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a tenant from the CLI.
#[derive(Debug)]
pub struct NewTenant {
    pub name: String,
    pub username: String,
    pub password_enc: String,
    pub pin_enc: Option<String>,
    pub run_hour: u8,
    pub sheet_id: String,
    pub scope_selector: Option<String>,
    pub active: bool,
}

/// One attempt outcome, written exactly once per processed tenant.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub tenant_id: i64,
    pub attempted_at: DateTime<Utc>,
    pub success: bool,
    pub message: String,
    pub artifact_path: Option<String>,
    pub sheet_updated: bool,
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get(0)?,
        name: row.get(1)?,
        username: row.get(2)?,
        password_enc: row.get(3)?,
        pin_enc: row.get(4)?,
        run_hour: row.get::<_, i64>(5)? as u8,
        sheet_id: row.get(6)?,
        scope_selector: row.get(7)?,
        active: row.get::<_, i64>(8)? != 0,
        manual_run: row.get::<_, i64>(9)? != 0,
        created_at: parse_utc(row.get::<_, String>(10)?),
        updated_at: parse_utc(row.get::<_, String>(11)?),
    })
}

fn parse_utc(s: String) -> DateTime<Utc> {
    // Stored either as RFC3339 (our writes) or sqlite datetime('now')
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

const TENANT_COLUMNS: &str = "id, name, username, password_enc, pin_enc, run_hour, sheet_id, \
                              scope_selector, active, manual_run, created_at, updated_at";

/// Tenant records, managed externally; the engine reads them and flips
/// the manual-run flag.
#[derive(Clone)]
pub struct TenantStore {
    pool: Pool,
}

impl TenantStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// All active tenants, ordered by name. The decider preserves this order.
    pub fn list_active(&self) -> Result<Vec<Tenant>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE active = 1 ORDER BY name"
        ))?;
        let rows = stmt.query_map([], tenant_from_row)?;

        let mut tenants = Vec::new();
        for r in rows {
            tenants.push(r?);
        }
        Ok(tenants)
    }

    /// All tenants, active or not, for the management CLI.
    pub fn list_all(&self) -> Result<Vec<Tenant>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY name"))?;
        let rows = stmt.query_map([], tenant_from_row)?;

        let mut tenants = Vec::new();
        for r in rows {
            tenants.push(r?);
        }
        Ok(tenants)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Tenant>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE name = ?1"
        ))?;
        let mut rows = stmt.query_map(params![name], tenant_from_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub fn insert(&self, tenant: &NewTenant) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO tenants (name, username, password_enc, pin_enc, run_hour, sheet_id, \
             scope_selector, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                tenant.name,
                tenant.username,
                tenant.password_enc,
                tenant.pin_enc,
                tenant.run_hour as i64,
                tenant.sheet_id,
                tenant.scope_selector,
                tenant.active as i64,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to insert tenant (name must be unique)")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute("DELETE FROM tenants WHERE name = ?1", params![name])?;
        if changed == 0 {
            anyhow::bail!("Tenant '{}' not found", name);
        }
        Ok(())
    }

    pub fn set_manual_run(&self, id: i64, value: bool) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE tenants SET manual_run = ?1, updated_at = ?2 WHERE id = ?3",
            params![value as i64, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn clear_manual_run(&self, id: i64) -> Result<()> {
        self.set_manual_run(id, false)
    }
}

/// Append-only record of run outcomes. No update or delete exists.
#[derive(Clone)]
pub struct RunLog {
    pool: Pool,
}

impl RunLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn append(&self, record: &RunRecord) -> Result<i64> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO run_log (tenant_id, attempted_at, success, message, artifact_path, sheet_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.tenant_id,
                record.attempted_at.to_rfc3339(),
                record.success as i64,
                record.message,
                record.artifact_path,
                record.sheet_updated as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Did this tenant have a successful run at or after `since`?
    pub fn succeeded_since(&self, tenant_id: i64, since: DateTime<Utc>) -> Result<bool> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM run_log WHERE tenant_id = ?1 AND success = 1 AND attempted_at >= ?2",
            params![tenant_id, since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Most recent entries with tenant names, newest first, for auditing.
    pub fn recent(&self, limit: u32) -> Result<Vec<(String, RunRecord)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT t.name, r.tenant_id, r.attempted_at, r.success, r.message, r.artifact_path, r.sheet_updated
             FROM run_log r JOIN tenants t ON t.id = r.tenant_id
             ORDER BY r.attempted_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                RunRecord {
                    tenant_id: row.get(1)?,
                    attempted_at: parse_utc(row.get::<_, String>(2)?),
                    success: row.get::<_, i64>(3)? != 0,
                    message: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    artifact_path: row.get(5)?,
                    sheet_updated: row.get::<_, i64>(6)? != 0,
                },
            ))
        })?;

        let mut entries = Vec::new();
        for r in rows {
            entries.push(r?);
        }
        Ok(entries)
    }
}
