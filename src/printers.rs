//! Label printer profiles.
//!
//! A profile says where labels go (raw TCP to the printer, or through the
//! HTTP printer bridge) and how big they are. One profile may be the default;
//! the default id is mirrored in `local_settings` like other station settings.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::{now_rfc3339, print, value_f64, value_i64, value_str};

pub const TRANSPORT_TCP: &str = "tcp";
pub const TRANSPORT_BRIDGE: &str = "bridge";

/// Error text for a job that has nowhere to go. The print worker does not
/// retry jobs failing with it.
pub const NO_PROFILE_ERROR: &str = "No printer profile configured";

const SUPPORTED_DPI: &[i64] = &[152, 203, 300, 600];
const DEFAULT_SETTING_CATEGORY: &str = "printer";
const DEFAULT_SETTING_KEY: &str = "default_printer_profile_id";

const PROFILE_COLUMNS: &str = "id, name, transport, host, port, bridge_url, dpi, label_width_mm,
    label_height_mm, darkness, logo_source, is_default, enabled, created_at, updated_at";

fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "name": row.get::<_, String>(1)?,
        "transport": row.get::<_, String>(2)?,
        "host": row.get::<_, Option<String>>(3)?,
        "port": row.get::<_, i64>(4)?,
        "bridgeUrl": row.get::<_, Option<String>>(5)?,
        "dpi": row.get::<_, i64>(6)?,
        "labelWidthMm": row.get::<_, f64>(7)?,
        "labelHeightMm": row.get::<_, f64>(8)?,
        "darkness": row.get::<_, Option<i64>>(9)?,
        "logoSource": row.get::<_, Option<String>>(10)?,
        "isDefault": row.get::<_, i64>(11)? != 0,
        "enabled": row.get::<_, i64>(12)? != 0,
        "createdAt": row.get::<_, String>(13)?,
        "updatedAt": row.get::<_, String>(14)?,
    }))
}

fn load_profile(conn: &Connection, id: &str) -> Result<Option<Value>, String> {
    conn.query_row(
        &format!("SELECT {PROFILE_COLUMNS} FROM printer_profiles WHERE id = ?1"),
        params![id],
        profile_from_row,
    )
    .optional()
    .map_err(|e| format!("load printer profile: {e}"))
}

/// Validated profile fields, ready to write.
#[derive(Debug, Clone, PartialEq)]
struct ProfileFields {
    name: String,
    transport: String,
    host: Option<String>,
    port: i64,
    bridge_url: Option<String>,
    dpi: i64,
    label_width_mm: f64,
    label_height_mm: f64,
    darkness: Option<i64>,
    logo_source: Option<String>,
    enabled: bool,
}

impl ProfileFields {
    fn defaults() -> Self {
        Self {
            name: String::new(),
            transport: TRANSPORT_TCP.to_string(),
            host: None,
            port: 9100,
            bridge_url: None,
            dpi: 203,
            label_width_mm: 100.0,
            label_height_mm: 50.0,
            darkness: None,
            logo_source: None,
            enabled: true,
        }
    }

    fn from_existing(row: &Value) -> Self {
        let defaults = Self::defaults();
        Self {
            name: row["name"].as_str().unwrap_or_default().to_string(),
            transport: row["transport"].as_str().unwrap_or(TRANSPORT_TCP).to_string(),
            host: row["host"].as_str().map(str::to_string),
            port: row["port"].as_i64().unwrap_or(defaults.port),
            bridge_url: row["bridgeUrl"].as_str().map(str::to_string),
            dpi: row["dpi"].as_i64().unwrap_or(defaults.dpi),
            label_width_mm: row["labelWidthMm"].as_f64().unwrap_or(defaults.label_width_mm),
            label_height_mm: row["labelHeightMm"].as_f64().unwrap_or(defaults.label_height_mm),
            darkness: row["darkness"].as_i64(),
            logo_source: row["logoSource"].as_str().map(str::to_string),
            enabled: row["enabled"].as_bool().unwrap_or(true),
        }
    }

    /// Overlay the keys present in `payload`. A present-but-empty string
    /// clears an optional field.
    fn apply(&mut self, payload: &Value) {
        fn optional(payload: &Value, keys: &[&str]) -> Option<Option<String>> {
            let present = keys.iter().any(|k| payload.get(*k).is_some());
            present.then(|| value_str(payload, keys))
        }

        if let Some(name) = value_str(payload, &["name"]) {
            self.name = name;
        }
        if let Some(transport) = value_str(payload, &["transport"]) {
            self.transport = transport.to_lowercase();
        }
        if let Some(host) = optional(payload, &["host", "ip"]) {
            self.host = host;
        }
        if let Some(port) = value_i64(payload, &["port"]) {
            self.port = port;
        }
        if let Some(url) = optional(payload, &["bridgeUrl", "bridge_url"]) {
            self.bridge_url = url.map(|u| u.trim_end_matches('/').to_string());
        }
        if let Some(dpi) = value_i64(payload, &["dpi"]) {
            self.dpi = dpi;
        }
        if let Some(w) = value_f64(payload, &["labelWidthMm", "label_width_mm"]) {
            self.label_width_mm = w;
        }
        if let Some(h) = value_f64(payload, &["labelHeightMm", "label_height_mm"]) {
            self.label_height_mm = h;
        }
        if payload.get("darkness").is_some() {
            self.darkness = value_i64(payload, &["darkness"]);
        }
        if let Some(logo) = optional(payload, &["logoSource", "logo_source"]) {
            self.logo_source = logo;
        }
        if let Some(enabled) = payload.get("enabled").and_then(Value::as_bool) {
            self.enabled = enabled;
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Missing profile name".into());
        }
        match self.transport.as_str() {
            TRANSPORT_TCP => {}
            TRANSPORT_BRIDGE => {
                let url = self
                    .bridge_url
                    .as_deref()
                    .ok_or("Bridge transport requires bridgeUrl")?;
                let parsed =
                    reqwest::Url::parse(url).map_err(|e| format!("Invalid bridgeUrl: {e}"))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err("bridgeUrl must be http or https".into());
                }
            }
            other => return Err(format!("Unknown transport: {other}")),
        }
        if self.host.is_none() {
            return Err("Missing printer host".into());
        }
        if !(1..=65535).contains(&self.port) {
            return Err(format!("Invalid port: {}", self.port));
        }
        if !SUPPORTED_DPI.contains(&self.dpi) {
            return Err(format!("Unsupported dpi: {}", self.dpi));
        }
        if self.label_width_mm <= 0.0 || self.label_height_mm <= 0.0 {
            return Err("Label size must be positive".into());
        }
        if let Some(d) = self.darkness {
            if !(-30..=30).contains(&d) {
                return Err(format!("Darkness must be between -30 and 30, got {d}"));
            }
        }
        Ok(())
    }
}

fn set_default_locked(conn: &Connection, profile_id: &str) -> Result<(), String> {
    conn.execute("UPDATE printer_profiles SET is_default = 0", [])
        .map_err(|e| format!("clear existing default printer flags: {e}"))?;
    conn.execute(
        "UPDATE printer_profiles SET is_default = 1, updated_at = ?1 WHERE id = ?2",
        params![now_rfc3339(), profile_id],
    )
    .map_err(|e| format!("set printer default flag: {e}"))?;
    db::set_setting(conn, DEFAULT_SETTING_CATEGORY, DEFAULT_SETTING_KEY, profile_id)?;
    Ok(())
}

fn default_profile_id(conn: &Connection) -> Option<String> {
    db::get_setting(conn, DEFAULT_SETTING_CATEGORY, DEFAULT_SETTING_KEY)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .or_else(|| {
            conn.query_row(
                "SELECT id FROM printer_profiles WHERE is_default = 1
                 ORDER BY updated_at DESC LIMIT 1",
                [],
                |row| row.get::<_, String>(0),
            )
            .ok()
        })
}

// ---------------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------------

/// Create a profile. The first profile becomes the default.
pub fn create_printer_profile(db: &DbState, payload: &Value) -> Result<Value, String> {
    let mut fields = ProfileFields::defaults();
    fields.apply(payload);
    fields.validate()?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO printer_profiles (id, name, transport, host, port, bridge_url, dpi,
                                       label_width_mm, label_height_mm, darkness, logo_source,
                                       enabled, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
        params![
            id,
            fields.name,
            fields.transport,
            fields.host,
            fields.port,
            fields.bridge_url,
            fields.dpi,
            fields.label_width_mm,
            fields.label_height_mm,
            fields.darkness,
            fields.logo_source,
            fields.enabled as i64,
            now
        ],
    )
    .map_err(|e| format!("insert printer profile: {e}"))?;

    let wants_default = payload
        .get("isDefault")
        .or_else(|| payload.get("is_default"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if wants_default || default_profile_id(&conn).is_none() {
        set_default_locked(&conn, &id)?;
    }

    info!(id = %id, name = %fields.name, transport = %fields.transport, "Printer profile created");
    load_profile(&conn, &id)?.ok_or_else(|| format!("Printer profile {id} not found"))
}

pub fn update_printer_profile(db: &DbState, id: &str, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let existing = load_profile(&conn, id)?.ok_or_else(|| format!("Printer profile {id} not found"))?;

    let mut fields = ProfileFields::from_existing(&existing);
    fields.apply(payload);
    fields.validate()?;

    conn.execute(
        "UPDATE printer_profiles SET
            name = ?1, transport = ?2, host = ?3, port = ?4, bridge_url = ?5, dpi = ?6,
            label_width_mm = ?7, label_height_mm = ?8, darkness = ?9, logo_source = ?10,
            enabled = ?11, updated_at = ?12
         WHERE id = ?13",
        params![
            fields.name,
            fields.transport,
            fields.host,
            fields.port,
            fields.bridge_url,
            fields.dpi,
            fields.label_width_mm,
            fields.label_height_mm,
            fields.darkness,
            fields.logo_source,
            fields.enabled as i64,
            now_rfc3339(),
            id
        ],
    )
    .map_err(|e| format!("update printer profile: {e}"))?;

    if payload.get("isDefault").and_then(Value::as_bool) == Some(true) {
        set_default_locked(&conn, id)?;
    }

    info!(id = %id, "Printer profile updated");
    load_profile(&conn, id)?.ok_or_else(|| format!("Printer profile {id} not found"))
}

pub fn list_printer_profiles(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM printer_profiles ORDER BY is_default DESC, name ASC"
        ))
        .map_err(|e| e.to_string())?;
    let rows: Vec<Value> = stmt
        .query_map([], profile_from_row)
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Value::Array(rows))
}

pub fn get_printer_profile(db: &DbState, id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    load_profile(&conn, id)?.ok_or_else(|| format!("Printer profile {id} not found"))
}

pub fn delete_printer_profile(db: &DbState, id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let was_default = default_profile_id(&conn).as_deref() == Some(id);

    let affected = conn
        .execute("DELETE FROM printer_profiles WHERE id = ?1", params![id])
        .map_err(|e| format!("delete printer profile: {e}"))?;
    if affected == 0 {
        return Err(format!("Printer profile {id} not found"));
    }

    if was_default {
        let next: Option<String> = conn
            .query_row(
                "SELECT id FROM printer_profiles WHERE enabled = 1 ORDER BY created_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        match next {
            Some(next) => set_default_locked(&conn, &next)?,
            None => {
                conn.execute(
                    "DELETE FROM local_settings
                     WHERE setting_category = ?1 AND setting_key = ?2",
                    params![DEFAULT_SETTING_CATEGORY, DEFAULT_SETTING_KEY],
                )
                .map_err(|e| format!("clear default printer setting after delete: {e}"))?;
            }
        }
    }

    info!(id = %id, "Printer profile deleted");
    Ok(serde_json::json!({ "success": true }))
}

pub fn set_default_printer_profile(db: &DbState, id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    if load_profile(&conn, id)?.is_none() {
        return Err(format!("Printer profile {id} not found"));
    }
    set_default_locked(&conn, id)?;
    info!(profile_id = %id, "Default printer profile set");
    Ok(serde_json::json!({ "success": true }))
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Pick the profile for a job: explicit id > enabled default > any enabled.
pub(crate) fn resolve_profile_locked(conn: &Connection, explicit: Option<&str>) -> Result<Value, String> {
    if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
        let profile = load_profile(conn, id)?.ok_or_else(|| format!("Printer profile {id} not found"))?;
        if profile["enabled"] != true {
            return Err(format!("Printer profile {id} is disabled"));
        }
        return Ok(profile);
    }

    if let Some(id) = default_profile_id(conn) {
        match load_profile(conn, &id)? {
            Some(profile) if profile["enabled"] == true => return Ok(profile),
            Some(_) => {}
            None => warn!(id = %id, "Default printer profile setting points to missing profile"),
        }
    }

    let any: Option<String> = conn
        .query_row(
            "SELECT id FROM printer_profiles WHERE enabled = 1
             ORDER BY is_default DESC, updated_at DESC, created_at ASC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?;
    match any {
        Some(id) => load_profile(conn, &id)?.ok_or_else(|| NO_PROFILE_ERROR.to_string()),
        None => Err(NO_PROFILE_ERROR.to_string()),
    }
}

pub fn resolve_printer_profile(db: &DbState, explicit: Option<&str>) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    resolve_profile_locked(&conn, explicit)
}

/// Check a profile's transport without printing.
pub async fn test_printer_connection(db: &DbState, id: &str) -> Result<Value, String> {
    let profile = get_printer_profile(db, id)?;
    let host = profile["host"].as_str().unwrap_or_default().to_string();
    let port = profile["port"].as_u64().unwrap_or(9100) as u16;
    let started = std::time::Instant::now();

    let result = match profile["transport"].as_str() {
        Some(TRANSPORT_BRIDGE) => {
            let url = profile["bridgeUrl"].as_str().unwrap_or_default();
            print::bridge_health(url).await
        }
        _ => print::check_tcp_reachable(&host, port).await,
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(()) => {
            info!(profile_id = %id, latency_ms, "Printer connection ok");
            Ok(serde_json::json!({ "success": true, "latencyMs": latency_ms }))
        }
        Err(e) => {
            warn!(profile_id = %id, error = %e, "Printer connection failed");
            Ok(serde_json::json!({ "success": false, "error": e, "latencyMs": latency_ms }))
        }
    }
}
