use std::sync::Arc;

use serde_json::Value;
use tauri::Emitter;
use tracing::info;

use crate::{db, storage, supabase, sync};

#[tauri::command]
pub async fn sync_get_status(
    db: tauri::State<'_, db::DbState>,
    sync_state: tauri::State<'_, Arc<sync::SyncState>>,
) -> Result<Value, String> {
    sync::get_sync_status(&db, &sync_state)
}

#[tauri::command]
pub async fn sync_get_network_status(app: tauri::AppHandle) -> Result<Value, String> {
    let configured = storage::is_configured();
    let online = configured && supabase::check_connectivity().await;
    let status = serde_json::json!({ "isOnline": online, "configured": configured });
    let _ = app.emit("network_status", status.clone());
    Ok(status)
}

#[tauri::command]
pub async fn sync_force(
    db: tauri::State<'_, db::DbState>,
    sync_state: tauri::State<'_, Arc<sync::SyncState>>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    match sync::force_sync(&db, &sync_state, &app).await {
        Ok(result) => {
            let _ = app.emit("sync_complete", serde_json::json!({ "trigger": "manual" }));
            Ok(result)
        }
        Err(e) => {
            let _ = app.emit("sync_error", serde_json::json!({ "error": e }));
            Err(e)
        }
    }
}

#[tauri::command]
pub async fn sync_retry_failed(
    db: tauri::State<'_, db::DbState>,
    sync_state: tauri::State<'_, Arc<sync::SyncState>>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let result = sync::retry_failed(&db)?;
    info!(requeued = %result["requeued"], "Failed sync rows requeued");
    if let Ok(status) = sync::get_sync_status(&db, &sync_state) {
        let _ = app.emit("sync_status", status);
    }
    Ok(result)
}
