use serde::Deserialize;
use serde_json::Value;
use tauri::Emitter;

use crate::{carros, db, payload_arg0_as_string, payload_object};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CarroStatusPayload {
    #[serde(alias = "carro_id", alias = "id")]
    carro_id: String,
    status: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CarroListPayload {
    #[serde(default)]
    status: Option<String>,
}

fn parse_carro_id_payload(arg0: Option<Value>) -> Result<String, String> {
    payload_arg0_as_string(arg0, &["carroId", "carro_id", "id"]).ok_or("Missing carroId".into())
}

fn parse_carro_status_payload(arg0: Option<Value>) -> Result<CarroStatusPayload, String> {
    let parsed: CarroStatusPayload = serde_json::from_value(payload_object(arg0))
        .map_err(|e| format!("Invalid carro status payload: {e}"))?;
    if parsed.carro_id.trim().is_empty() {
        return Err("Missing carroId".into());
    }
    Ok(parsed)
}

fn parse_carro_list_payload(arg0: Option<Value>) -> Option<String> {
    let parsed = match arg0 {
        Some(Value::String(status)) => CarroListPayload {
            status: Some(status),
        },
        Some(v @ Value::Object(_)) => serde_json::from_value(v).unwrap_or_default(),
        _ => CarroListPayload::default(),
    };
    parsed
        .status
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn carro_deleted_event(id: &str) -> Value {
    serde_json::json!({ "id": id })
}

#[tauri::command]
pub async fn carro_create(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let carro = carros::create_carro(&db, &payload_object(arg0))?;
    let _ = app.emit("carro_updated", carro.clone());
    Ok(carro)
}

#[tauri::command]
pub async fn carro_list(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let status = parse_carro_list_payload(arg0);
    carros::list_carros(&db, status.as_deref())
}

#[tauri::command]
pub async fn carro_get(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let id = parse_carro_id_payload(arg0)?;
    carros::get_carro(&db, &id)
}

#[tauri::command]
pub async fn carro_update(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = payload_object(arg0);
    let id = parse_carro_id_payload(Some(payload.clone()))?;
    let carro = carros::update_carro(&db, &id, &payload)?;
    let _ = app.emit("carro_updated", carro.clone());
    Ok(carro)
}

#[tauri::command]
pub async fn carro_update_status(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = parse_carro_status_payload(arg0)?;
    let carro = carros::update_carro_status(&db, payload.carro_id.trim(), &payload.status)?;
    let _ = app.emit("carro_updated", carro.clone());
    Ok(carro)
}

#[tauri::command]
pub async fn carro_delete(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let id = parse_carro_id_payload(arg0)?;
    let result = carros::delete_carro(&db, &id)?;
    let _ = app.emit("carro_deleted", carro_deleted_event(&id));
    Ok(result)
}

#[cfg(test)]
mod dto_tests {
    use super::*;

    #[test]
    fn parse_carro_id_payload_supports_string_and_aliases() {
        assert_eq!(parse_carro_id_payload(Some(serde_json::json!("c-1"))).unwrap(), "c-1");
        assert_eq!(
            parse_carro_id_payload(Some(serde_json::json!({ "carro_id": "c-2" }))).unwrap(),
            "c-2"
        );
        assert!(parse_carro_id_payload(Some(serde_json::json!({}))).is_err());
    }

    #[test]
    fn parse_carro_status_payload_requires_both_fields() {
        let parsed = parse_carro_status_payload(Some(serde_json::json!({
            "id": "c-1",
            "status": "pronto"
        })))
        .expect("status payload should parse");
        assert_eq!(parsed.carro_id, "c-1");
        assert_eq!(parsed.status, "pronto");

        let err = parse_carro_status_payload(Some(serde_json::json!({ "id": "c-1" })))
            .expect_err("missing status should fail");
        assert!(err.contains("Invalid carro status payload"));
    }

    #[test]
    fn parse_carro_list_payload_accepts_string_object_or_nothing() {
        assert_eq!(parse_carro_list_payload(None), None);
        assert_eq!(
            parse_carro_list_payload(Some(serde_json::json!("pronto"))),
            Some("pronto".to_string())
        );
        assert_eq!(
            parse_carro_list_payload(Some(serde_json::json!({ "status": " " }))),
            None
        );
    }

    #[test]
    fn carro_deleted_event_carries_id() {
        assert_eq!(carro_deleted_event("c-9"), serde_json::json!({ "id": "c-9" }));
    }
}
