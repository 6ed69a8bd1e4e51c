//! Local SQLite database layer for ProFlow WMS.
//!
//! Uses rusqlite with WAL mode. The local file is the offline-first mirror of
//! the hosted Postgres: every mutation lands here first and is pushed through
//! the `sync_queue`. Provides schema migrations, settings helpers, and the
//! managed state shared by Tauri commands and background workers.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Tauri managed state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 5;

/// Initialize the database at `{app_data_dir}/wms.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(app_data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(app_data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = app_data_dir.join("wms.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current = schema_version(conn);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    let migrations: [(i32, fn(&Connection) -> Result<(), String>); 5] = [
        (1, migrate_v1),
        (2, migrate_v2),
        (3, migrate_v3),
        (4, migrate_v4),
        (5, migrate_v5),
    ];
    for (version, migrate) in migrations {
        if current < version {
            migrate(conn)?;
        }
    }

    Ok(())
}

/// Highest applied migration, 0 for a fresh file.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

fn apply(conn: &Connection, version: i32, label: &str, sql: &str) -> Result<(), String> {
    conn.execute_batch(sql).map_err(|e| {
        error!("Migration v{version} failed: {e}");
        format!("migration v{version}: {e}")
    })?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )
    .map_err(|e| format!("record migration v{version}: {e}"))?;
    info!("Applied migration v{version} ({label})");
    Ok(())
}

/// Migration v1: settings and the sync queue.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    apply(
        conn,
        1,
        "local_settings, sync_queue",
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            idempotency_key TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            next_retry_at TEXT,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            synced_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
        CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_type, entity_id);
        ",
    )
}

/// Migration v2: receiving and packaging (carros, notas, divergencias).
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    apply(
        conn,
        2,
        "carros, notas_fiscais, divergencias",
        "
        CREATE TABLE IF NOT EXISTS carros (
            id TEXT PRIMARY KEY,
            codigo TEXT UNIQUE NOT NULL,
            doca TEXT,
            responsavel TEXT,
            status TEXT NOT NULL DEFAULT 'embalando',
            observacao TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE TABLE IF NOT EXISTS notas_fiscais (
            id TEXT PRIMARY KEY,
            chave TEXT UNIQUE,
            numero TEXT NOT NULL,
            serie TEXT,
            emitente_cnpj TEXT,
            emitente_nome TEXT,
            destinatario TEXT,
            volumes INTEGER NOT NULL DEFAULT 1,
            volumes_conferidos INTEGER NOT NULL DEFAULT 0,
            peso_kg REAL,
            status TEXT NOT NULL DEFAULT 'recebida',
            carro_id TEXT REFERENCES carros(id) ON DELETE SET NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE TABLE IF NOT EXISTS divergencias (
            id TEXT PRIMARY KEY,
            nota_id TEXT REFERENCES notas_fiscais(id) ON DELETE CASCADE,
            carro_id TEXT,
            tipo TEXT NOT NULL,
            esperado INTEGER,
            encontrado INTEGER,
            observacao TEXT,
            status TEXT NOT NULL DEFAULT 'aberta',
            resolucao TEXT,
            resolvido_por TEXT,
            resolved_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE INDEX IF NOT EXISTS idx_carros_status ON carros(status);
        CREATE INDEX IF NOT EXISTS idx_notas_status ON notas_fiscais(status);
        CREATE INDEX IF NOT EXISTS idx_notas_carro ON notas_fiscais(carro_id);
        CREATE INDEX IF NOT EXISTS idx_divergencias_nota ON divergencias(nota_id);
        CREATE INDEX IF NOT EXISTS idx_divergencias_status ON divergencias(status);
        ",
    )
}

/// Migration v3: operator chat.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    apply(
        conn,
        3,
        "messages",
        "
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            canal TEXT NOT NULL DEFAULT 'geral',
            autor TEXT NOT NULL,
            conteudo TEXT NOT NULL,
            origin TEXT NOT NULL DEFAULT 'local',
            created_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE INDEX IF NOT EXISTS idx_messages_canal_created ON messages(canal, created_at);
        ",
    )
}

/// Migration v4: storage positions and allocations.
fn migrate_v4(conn: &Connection) -> Result<(), String> {
    apply(
        conn,
        4,
        "wms_posicoes, wms_alocacoes",
        "
        CREATE TABLE IF NOT EXISTS wms_posicoes (
            id TEXT PRIMARY KEY,
            codigo TEXT UNIQUE NOT NULL,
            rua TEXT NOT NULL,
            predio TEXT NOT NULL,
            nivel INTEGER NOT NULL,
            apartamento TEXT NOT NULL,
            capacidade INTEGER NOT NULL,
            ocupacao INTEGER NOT NULL DEFAULT 0,
            compatibilidade TEXT NOT NULL DEFAULT '',
            ativo INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            sync_status TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE TABLE IF NOT EXISTS wms_alocacoes (
            id TEXT PRIMARY KEY,
            posicao_id TEXT NOT NULL REFERENCES wms_posicoes(id),
            nota_id TEXT NOT NULL,
            volumes INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            released_at TEXT,
            sync_status TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE INDEX IF NOT EXISTS idx_posicoes_rua ON wms_posicoes(rua);
        CREATE INDEX IF NOT EXISTS idx_alocacoes_posicao ON wms_alocacoes(posicao_id);
        CREATE INDEX IF NOT EXISTS idx_alocacoes_nota ON wms_alocacoes(nota_id);
        ",
    )
}

/// Migration v5: label printers and the print job queue.
fn migrate_v5(conn: &Connection) -> Result<(), String> {
    apply(
        conn,
        5,
        "printer_profiles, print_jobs",
        "
        CREATE TABLE IF NOT EXISTS printer_profiles (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            transport TEXT NOT NULL DEFAULT 'tcp',
            host TEXT,
            port INTEGER NOT NULL DEFAULT 9100,
            bridge_url TEXT,
            dpi INTEGER NOT NULL DEFAULT 203,
            label_width_mm REAL NOT NULL DEFAULT 100,
            label_height_mm REAL NOT NULL DEFAULT 50,
            darkness INTEGER,
            logo_source TEXT,
            is_default INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS print_jobs (
            id TEXT PRIMARY KEY,
            label_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload_json TEXT,
            printer_profile_id TEXT,
            copies INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            next_retry_at TEXT,
            last_error TEXT,
            warning_message TEXT,
            last_attempt_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_print_jobs_status ON print_jobs(status);
        CREATE INDEX IF NOT EXISTS idx_print_jobs_entity ON print_jobs(label_type, entity_id);
        ",
    )
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Get all settings grouped by category as JSON.
pub fn get_all_settings(conn: &Connection) -> serde_json::Value {
    let mut stmt = match conn.prepare(
        "SELECT setting_category, setting_key, setting_value FROM local_settings ORDER BY setting_category, setting_key",
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("get_all_settings prepare: {e}");
            return serde_json::json!({});
        }
    };

    let rows = match stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    }) {
        Ok(r) => r,
        Err(e) => {
            error!("get_all_settings query: {e}");
            return serde_json::json!({});
        }
    };

    let mut result = serde_json::Map::new();
    for (cat, key, val) in rows.flatten() {
        let category = result.entry(cat).or_insert_with(|| serde_json::json!({}));
        if let serde_json::Value::Object(ref mut map) = category {
            map.insert(key, serde_json::Value::String(val));
        }
    }

    serde_json::Value::Object(result)
}

/// Delete all settings in a category.
pub fn delete_all_settings(conn: &Connection, category: &str) -> Result<usize, String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )
    .map_err(|e| format!("delete_all_settings: {e}"))
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory database with every migration applied.
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "local_settings",
            "sync_queue",
            "carros",
            "notas_fiscais",
            "divergencias",
            "messages",
            "wms_posicoes",
            "wms_alocacoes",
            "printer_profiles",
            "print_jobs",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing table {expected}"
            );
        }
        assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).expect("second run should be a no-op");

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_settings_roundtrip_and_grouping() {
        let db = test_state();
        let conn = db.conn.lock().unwrap();

        assert_eq!(get_setting(&conn, "printer", "default_copies"), None);
        set_setting(&conn, "printer", "default_copies", "1").unwrap();
        set_setting(&conn, "printer", "default_copies", "2").unwrap();
        set_setting(&conn, "sync", "messages_cursor", "2026-01-01T00:00:00Z").unwrap();

        assert_eq!(
            get_setting(&conn, "printer", "default_copies").as_deref(),
            Some("2")
        );

        let all = get_all_settings(&conn);
        assert_eq!(all["printer"]["default_copies"], "2");
        assert_eq!(all["sync"]["messages_cursor"], "2026-01-01T00:00:00Z");

        assert_eq!(delete_all_settings(&conn, "printer").unwrap(), 1);
        assert_eq!(get_setting(&conn, "printer", "default_copies"), None);
    }

    #[test]
    fn test_init_creates_file_on_disk() {
        let dir = std::env::temp_dir().join(format!("wms_db_test_{}", uuid::Uuid::new_v4()));
        let state = init(&dir).expect("init should succeed");
        assert!(state.db_path.exists());
        {
            let conn = state.conn.lock().unwrap();
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap();
            assert_eq!(mode.to_lowercase(), "wal");
        }
        drop(state);
        let _ = fs::remove_dir_all(&dir);
    }
}
