//! Diagnostics for ProFlow WMS.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: schema version, sync backlog, printer status, data issues
//! - **Diagnostics export**: packages logs, sync counts, recent sync errors,
//!   printer profiles and the data check into a zip bundle.
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use crate::db::{self, DbState};
use crate::{maintenance, printers, storage};
use rusqlite::params;
use serde_json::{json, Value};
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Maximum size per log file copied into an export (5 MB).
pub const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Prefix of the rolling log files written by `lib.rs`.
pub const LOG_FILE_PREFIX: &str = "wms";

const APP_IDENTIFIER: &str = "br.com.proflow.wms";

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsExportOptions {
    pub include_logs: bool,
    pub redact_sensitive: bool,
}

impl Default for DiagnosticsExportOptions {
    fn default() -> Self {
        Self {
            include_logs: true,
            redact_sensitive: true,
        }
    }
}

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Snapshot for the System Health screen.
pub fn get_system_health(db: &DbState) -> Result<Value, String> {
    let (schema_version, sync_backlog, last_sync_times, mut printer_status, counts, issues, db_size) = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let issues = maintenance::collect_issues(&conn)
            .map(|issues| issues.len())
            .unwrap_or(0);
        (
            db::schema_version(&conn),
            get_sync_backlog(&conn),
            get_last_sync_times(&conn),
            get_printer_status(&conn),
            maintenance::entity_counts(&conn),
            issues,
            fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0),
        )
    }; // lock released before resolving the printer, which locks again

    if let Ok(profile) = printers::resolve_printer_profile(db, None) {
        printer_status["defaultProfile"] = profile["name"].clone();
    }

    Ok(json!({
        "schemaVersion": schema_version,
        "syncBacklog": sync_backlog,
        "lastSyncTimes": last_sync_times,
        "printerStatus": printer_status,
        "entityCounts": counts,
        "dataIssues": issues,
        "dbSizeBytes": db_size,
        "supabaseConfigured": storage::is_configured(),
    }))
}

fn get_sync_backlog(conn: &rusqlite::Connection) -> Value {
    let mut result = serde_json::Map::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT entity_type, status, COUNT(*) FROM sync_queue
         WHERE status != 'synced' GROUP BY entity_type, status",
    ) {
        if let Ok(rows) = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        }) {
            for (entity_type, status, count) in rows.flatten() {
                let entry = result.entry(entity_type).or_insert_with(|| json!({}));
                entry[&status] = json!(count);
            }
        }
    }
    Value::Object(result)
}

fn get_last_sync_times(conn: &rusqlite::Connection) -> Value {
    let mut result = json!({});
    if let Ok(mut stmt) = conn.prepare(
        "SELECT entity_type, MAX(synced_at) FROM sync_queue WHERE status = 'synced' GROUP BY entity_type",
    ) {
        if let Ok(rows) = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        }) {
            for (entity_type, ts) in rows.flatten() {
                result[entity_type] = json!(ts);
            }
        }
    }
    result
}

fn get_printer_status(conn: &rusqlite::Connection) -> Value {
    let count = |sql: &str| -> i64 { conn.query_row(sql, [], |row| row.get(0)).unwrap_or(0) };
    json!({
        "configured": count("SELECT COUNT(*) FROM printer_profiles WHERE enabled = 1") > 0,
        "profileCount": count("SELECT COUNT(*) FROM printer_profiles"),
        "defaultProfile": Value::Null,
        "pendingJobs": count("SELECT COUNT(*) FROM print_jobs WHERE status IN ('pending', 'printing')"),
        "failedJobs": count("SELECT COUNT(*) FROM print_jobs WHERE status = 'failed'"),
    })
}

// ---------------------------------------------------------------------------
// Diagnostics export (zip bundle)
// ---------------------------------------------------------------------------

/// Writes a diagnostics zip into `output_dir` and returns its path.
pub fn export_diagnostics_with_options(
    db: &DbState,
    output_dir: &Path,
    export_options: DiagnosticsExportOptions,
) -> Result<String, String> {
    fs::create_dir_all(output_dir).map_err(|e| format!("Failed to create export dir: {e}"))?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let zip_path = output_dir.join(format!("proflow-wms-diagnostics-{timestamp}.zip"));

    let file = fs::File::create(&zip_path)
        .map_err(|e| format!("Failed to create diagnostics zip: {e}"))?;
    let mut zip = zip::ZipWriter::new(file);
    let zip_options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let redact = export_options.redact_sensitive;
    let mut write_json = |name: &str, value: Value| -> Result<(), String> {
        let value = redact_value_for_export(value, redact);
        let text = serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?;
        zip.start_file(name, zip_options).map_err(|e| e.to_string())?;
        zip.write_all(text.as_bytes()).map_err(|e| e.to_string())
    };

    write_json("about.json", get_about_info())?;
    write_json("system_health.json", get_system_health(db)?)?;
    write_json("config.json", storage::get_full_config())?;
    {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        write_json("sync_backlog.json", get_sync_backlog(&conn))?;
        write_json("sync_errors.json", json!(get_recent_sync_errors(&conn, 20)))?;
        write_json("printer_diagnostics.json", get_printer_diagnostics(&conn))?;
        let issues = maintenance::collect_issues(&conn)?;
        write_json("data_check.json", json!(issues))?;
    }

    if export_options.include_logs {
        for path in list_log_files() {
            let fname = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();
            let Ok(f) = fs::File::open(&path) else { continue };
            let mut buf = Vec::new();
            let _ = f.take(MAX_LOG_SIZE).read_to_end(&mut buf);
            let content = if redact {
                redact_log_text(&String::from_utf8_lossy(&buf))
            } else {
                String::from_utf8_lossy(&buf).into_owned()
            };
            if zip.start_file(format!("logs/{fname}"), zip_options).is_ok() {
                let _ = zip.write_all(content.as_bytes());
            }
        }
    }

    zip.finish().map_err(|e| e.to_string())?;
    info!(path = %zip_path.display(), redacted = redact, "Diagnostics exported");

    Ok(zip_path.to_string_lossy().to_string())
}

fn redact_value_for_export(value: Value, enabled: bool) -> Value {
    if !enabled {
        return value;
    }
    redact_sensitive_fields(value)
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "api_key",
        "apikey",
        "anon_key",
        "anonkey",
        "secret",
        "password",
        "token",
        "authorization",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

/// Masks JWT-looking tokens (the Supabase anon key) in free text.
fn redact_log_text(text: &str) -> String {
    text.split_inclusive(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .map(|chunk| {
            let word = chunk.trim_end_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'');
            let tail = &chunk[word.len()..];
            let looks_like_jwt = word.starts_with("eyJ") && word.matches('.').count() == 2;
            if looks_like_jwt {
                format!("[REDACTED]{tail}")
            } else {
                chunk.to_string()
            }
        })
        .collect()
}

fn get_recent_sync_errors(conn: &rusqlite::Connection, limit: i64) -> Vec<Value> {
    let mut errors = Vec::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT id, entity_type, entity_id, status, last_error, retry_count, created_at, updated_at
         FROM sync_queue
         WHERE last_error IS NOT NULL AND last_error != ''
         ORDER BY updated_at DESC LIMIT ?1",
    ) {
        if let Ok(rows) = stmt.query_map(params![limit], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "entityType": row.get::<_, String>(1)?,
                "entityId": row.get::<_, String>(2)?,
                "status": row.get::<_, String>(3)?,
                "lastError": row.get::<_, String>(4)?,
                "retryCount": row.get::<_, i64>(5)?,
                "createdAt": row.get::<_, Option<String>>(6)?,
                "updatedAt": row.get::<_, Option<String>>(7)?,
            }))
        }) {
            errors.extend(rows.flatten());
        }
    }
    errors
}

fn get_printer_diagnostics(conn: &rusqlite::Connection) -> Value {
    let mut profiles = Vec::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT id, name, transport, host, port, bridge_url, dpi, is_default, enabled
         FROM printer_profiles ORDER BY is_default DESC, name",
    ) {
        if let Ok(rows) = stmt.query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "transport": row.get::<_, String>(2)?,
                "host": row.get::<_, Option<String>>(3)?,
                "port": row.get::<_, i64>(4)?,
                "bridgeUrl": row.get::<_, Option<String>>(5)?,
                "dpi": row.get::<_, i64>(6)?,
                "isDefault": row.get::<_, bool>(7)?,
                "enabled": row.get::<_, bool>(8)?,
            }))
        }) {
            profiles.extend(rows.flatten());
        }
    }

    let mut recent_jobs = Vec::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT id, label_type, entity_id, status, printer_profile_id, retry_count,
                last_error, warning_message, created_at, last_attempt_at
         FROM print_jobs ORDER BY created_at DESC LIMIT 10",
    ) {
        if let Ok(rows) = stmt.query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "labelType": row.get::<_, String>(1)?,
                "entityId": row.get::<_, String>(2)?,
                "status": row.get::<_, String>(3)?,
                "printerProfileId": row.get::<_, Option<String>>(4)?,
                "retryCount": row.get::<_, i64>(5)?,
                "lastError": row.get::<_, Option<String>>(6)?,
                "warningMessage": row.get::<_, Option<String>>(7)?,
                "createdAt": row.get::<_, String>(8)?,
                "lastAttemptAt": row.get::<_, Option<String>>(9)?,
            }))
        }) {
            recent_jobs.extend(rows.flatten());
        }
    }

    json!({
        "profiles": profiles,
        "recentJobs": recent_jobs,
    })
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Returns the log directory path (same location used by lib.rs).
pub fn get_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join(APP_IDENTIFIER).join("logs")
}

fn is_log_file_name(name: &str) -> bool {
    name == format!("{LOG_FILE_PREFIX}.log") || name.starts_with(&format!("{LOG_FILE_PREFIX}."))
}

/// Log files in the log directory, newest first.
fn list_log_files() -> Vec<PathBuf> {
    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(get_log_dir()) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_log = path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(is_log_file_name);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }
    log_files.sort_by(|a, b| b.1.cmp(&a.1));
    log_files.into_iter().map(|(path, _)| path).collect()
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs() {
    for path in list_log_files().iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = get_about_info();
        assert_eq!(info["name"], "proflow-wms");
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
    }

    #[test]
    fn test_log_dir_is_stable() {
        let d1 = get_log_dir();
        assert_eq!(d1, get_log_dir());
        assert!(d1.to_string_lossy().contains(APP_IDENTIFIER));
    }

    #[test]
    fn test_log_file_name_matching() {
        assert!(is_log_file_name("wms.log"));
        assert!(is_log_file_name("wms.2026-10-18"));
        assert!(!is_log_file_name("other.log"));
        assert!(!is_log_file_name("wms_backup.db"));
    }

    #[test]
    fn test_system_health_with_empty_db() {
        let dir = std::env::temp_dir().join(format!("wms_diag_{}", uuid::Uuid::new_v4()));
        let db_state = db::init(&dir).unwrap();
        let health = get_system_health(&db_state).unwrap();
        assert_eq!(health["schemaVersion"], db::CURRENT_SCHEMA_VERSION);
        assert_eq!(health["dataIssues"], 0);
        assert_eq!(health["printerStatus"]["configured"], false);
        assert_eq!(health["entityCounts"]["carros"], 0);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_export_diagnostics_creates_zip() {
        let dir = std::env::temp_dir().join(format!("wms_export_{}", uuid::Uuid::new_v4()));
        let db_state = db::init(&dir).unwrap();
        let options = DiagnosticsExportOptions {
            include_logs: false,
            redact_sensitive: true,
        };
        let zip_path = export_diagnostics_with_options(&db_state, &dir, options).unwrap();
        let file = fs::File::open(&zip_path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive.len(), 7);
        assert!(archive.by_name("data_check.json").is_ok());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_redact_sensitive_fields_recurses() {
        let value = json!({
            "supabaseAnonKey": "eyJ...",
            "nested": { "api_key": "k", "status": "ok" },
            "items": [{ "password": "1234" }, { "name": "safe" }]
        });
        let redacted = redact_sensitive_fields(value);
        assert_eq!(redacted["supabaseAnonKey"], json!("[REDACTED]"));
        assert_eq!(redacted["nested"]["api_key"], json!("[REDACTED]"));
        assert_eq!(redacted["nested"]["status"], json!("ok"));
        assert_eq!(redacted["items"][0]["password"], json!("[REDACTED]"));
        assert_eq!(redacted["items"][1]["name"], json!("safe"));
    }

    #[test]
    fn test_redact_log_text_masks_jwts() {
        let line = "apikey=x header \"eyJhbGciOi.eyJyb2xlIjoi.c2lnbmF0dXJl\" done\n";
        let out = redact_log_text(line);
        assert_eq!(out, "apikey=x header \"[REDACTED]\" done\n");
        assert_eq!(redact_log_text("no secrets here"), "no secrets here");
    }
}
