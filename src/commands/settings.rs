use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::{db, payload_object, storage};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalSettingPayload {
    #[serde(alias = "setting_category")]
    category: String,
    #[serde(alias = "setting_key")]
    key: String,
    #[serde(alias = "setting_value")]
    value: Value,
}

fn parse_local_setting_payload(arg0: Option<Value>) -> Result<(String, String, String), String> {
    let parsed: LocalSettingPayload = serde_json::from_value(payload_object(arg0))
        .map_err(|e| format!("Invalid setting payload: {e}"))?;
    let category = parsed.category.trim().to_lowercase();
    let key = parsed.key.trim().to_string();
    if category.is_empty() || key.is_empty() {
        return Err("Missing setting category or key".into());
    }
    let value = match parsed.value {
        Value::String(s) => s,
        Value::Null => return Err("Missing setting value".into()),
        other => other.to_string(),
    };
    Ok((category, key, value))
}

#[tauri::command]
pub async fn settings_get_config() -> Result<Value, String> {
    Ok(storage::get_full_config())
}

#[tauri::command]
pub async fn settings_update_supabase(arg0: Option<Value>) -> Result<Value, String> {
    storage::update_supabase_credentials(&payload_object(arg0))
}

#[tauri::command]
pub async fn settings_get_local(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(db::get_all_settings(&conn))
}

#[tauri::command]
pub async fn settings_set_local(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let (category, key, value) = parse_local_setting_payload(arg0)?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::set_setting(&conn, &category, &key, &value)?;
    Ok(serde_json::json!({ "success": true, "category": category, "key": key }))
}

/// Forget backend credentials and sync cursors. Local records stay.
#[tauri::command]
pub async fn settings_factory_reset(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    storage::factory_reset()?;
    let cleared = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        db::delete_all_settings(&conn, "sync")?
    };
    info!(cleared_settings = cleared, "Factory reset completed");
    Ok(serde_json::json!({ "success": true, "clearedSettings": cleared }))
}

#[cfg(test)]
mod dto_tests {
    use super::*;

    #[test]
    fn parse_local_setting_payload_stringifies_values() {
        let (category, key, value) = parse_local_setting_payload(Some(serde_json::json!({
            "category": " Printer ",
            "key": "auto_print",
            "value": true
        })))
        .unwrap();
        assert_eq!(category, "printer");
        assert_eq!(key, "auto_print");
        assert_eq!(value, "true");

        let (_, _, value) = parse_local_setting_payload(Some(serde_json::json!({
            "setting_category": "ui",
            "setting_key": "theme",
            "setting_value": "dark"
        })))
        .unwrap();
        assert_eq!(value, "dark");
    }

    #[test]
    fn parse_local_setting_payload_rejects_blank_or_null() {
        assert!(parse_local_setting_payload(Some(serde_json::json!({
            "category": "",
            "key": "k",
            "value": "v"
        })))
        .is_err());
        assert!(parse_local_setting_payload(Some(serde_json::json!({
            "category": "ui",
            "key": "k",
            "value": null
        })))
        .is_err());
    }
}
