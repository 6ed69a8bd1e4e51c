use std::sync::Arc;

use serde_json::Value;
use tauri::Manager;

use crate::{db, diagnostics, storage, supabase, sync};

fn parse_diagnostics_export_payload(arg0: Option<Value>) -> diagnostics::DiagnosticsExportOptions {
    let mut options = diagnostics::DiagnosticsExportOptions::default();

    match arg0 {
        Some(Value::Bool(include_logs)) => {
            options.include_logs = include_logs;
        }
        Some(Value::Object(obj)) => {
            if let Some(include_logs) = obj
                .get("includeLogs")
                .or_else(|| obj.get("include_logs"))
                .or_else(|| obj.get("logs"))
                .and_then(|v| v.as_bool())
            {
                options.include_logs = include_logs;
            }
            if let Some(redact_sensitive) = obj
                .get("redactSensitive")
                .or_else(|| obj.get("redact_sensitive"))
                .or_else(|| obj.get("redacted"))
                .and_then(|v| v.as_bool())
            {
                options.redact_sensitive = redact_sensitive;
            }
        }
        _ => {}
    }

    options
}

#[tauri::command]
pub async fn diagnostics_get_about() -> Result<Value, String> {
    Ok(diagnostics::get_about_info())
}

#[tauri::command]
pub async fn diagnostics_get_system_health(
    db: tauri::State<'_, db::DbState>,
    sync_state: tauri::State<'_, Arc<sync::SyncState>>,
) -> Result<Value, String> {
    let mut health = diagnostics::get_system_health(&db)?;

    let is_online = storage::is_configured() && supabase::check_connectivity().await;
    let last_sync = sync_state.last_sync.lock().ok().and_then(|g| g.clone());
    if let Some(obj) = health.as_object_mut() {
        obj.insert("isOnline".into(), serde_json::json!(is_online));
        obj.insert("lastSyncTime".into(), serde_json::json!(last_sync));
    }

    Ok(health)
}

#[tauri::command]
pub async fn diagnostics_export(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let options = parse_diagnostics_export_payload(arg0);
    let output_dir = app
        .path()
        .app_data_dir()
        .map_err(|e| format!("Failed to resolve app data dir: {e}"))?
        .join("diagnostics");
    let path = diagnostics::export_diagnostics_with_options(&db, &output_dir, options)?;
    Ok(serde_json::json!({ "success": true, "path": path }))
}
