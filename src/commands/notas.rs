use serde::Deserialize;
use serde_json::Value;
use tauri::Emitter;
use tracing::info;

use crate::{db, notas, payload_arg0_as_string, payload_object};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct NotaListPayload {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "carro_id")]
    carro_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotaAssignPayload {
    #[serde(alias = "nota_id", alias = "chave", alias = "reference")]
    nota_id: String,
    #[serde(alias = "carro_id")]
    carro_id: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_nota_id_payload(arg0: Option<Value>) -> Result<String, String> {
    payload_arg0_as_string(arg0, &["notaId", "nota_id", "id"]).ok_or("Missing notaId".into())
}

/// A nota id, a chave, or a scanned volume code.
fn parse_nota_reference_payload(arg0: Option<Value>) -> Result<String, String> {
    payload_arg0_as_string(
        arg0,
        &["notaId", "nota_id", "id", "chave", "reference", "barcode"],
    )
    .ok_or("Missing nota reference".into())
}

fn parse_nota_list_payload(arg0: Option<Value>) -> NotaListPayload {
    let parsed: NotaListPayload = match arg0 {
        Some(v @ Value::Object(_)) => serde_json::from_value(v).unwrap_or_default(),
        _ => NotaListPayload::default(),
    };
    NotaListPayload {
        status: non_empty(parsed.status),
        carro_id: non_empty(parsed.carro_id),
    }
}

fn parse_nota_assign_payload(arg0: Option<Value>) -> Result<NotaAssignPayload, String> {
    let parsed: NotaAssignPayload = serde_json::from_value(payload_object(arg0))
        .map_err(|e| format!("Invalid assign payload: {e}"))?;
    if parsed.nota_id.trim().is_empty() || parsed.carro_id.trim().is_empty() {
        return Err("Missing notaId or carroId".into());
    }
    Ok(parsed)
}

#[tauri::command]
pub async fn nota_parse_chave(arg0: Option<Value>) -> Result<Value, String> {
    let raw = payload_arg0_as_string(arg0, &["chave", "value"]).ok_or("Missing chave")?;
    let chave = notas::parse_chave(&raw).map_err(|e| e.to_string())?;
    serde_json::to_value(chave).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn nota_receive(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let result = notas::receive_nota(&db, &payload_object(arg0))?;
    if result["duplicate"] != true {
        let _ = app.emit("nota_updated", result["nota"].clone());
    }
    Ok(result)
}

#[tauri::command]
pub async fn nota_list(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let filter = parse_nota_list_payload(arg0);
    notas::list_notas(&db, filter.status.as_deref(), filter.carro_id.as_deref())
}

#[tauri::command]
pub async fn nota_get(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let id = parse_nota_id_payload(arg0)?;
    notas::get_nota(&db, &id)
}

#[tauri::command]
pub async fn nota_conferir_volume(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let reference = parse_nota_reference_payload(arg0)?;
    let result = notas::conferir_volume(&db, &reference)?;
    let _ = app.emit("nota_updated", result.get("nota").cloned().unwrap_or(Value::Null));
    Ok(result)
}

#[tauri::command]
pub async fn nota_finalizar_conferencia(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let id = parse_nota_id_payload(arg0)?;
    let result = notas::finalizar_conferencia(&db, &id)?;
    info!(nota_id = %id, "Conferencia finalized");
    let _ = app.emit("nota_updated", result.get("nota").cloned().unwrap_or(Value::Null));
    Ok(result)
}

#[tauri::command]
pub async fn nota_assign_to_carro(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = parse_nota_assign_payload(arg0)?;
    let result = notas::assign_nota_to_carro(&db, payload.nota_id.trim(), payload.carro_id.trim())?;
    let _ = app.emit("carro_updated", serde_json::json!({ "id": payload.carro_id.trim() }));
    Ok(result)
}

#[tauri::command]
pub async fn nota_remove_from_carro(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let id = parse_nota_id_payload(arg0)?;
    let result = notas::remove_nota_from_carro(&db, &id)?;
    let _ = app.emit("nota_updated", result.get("nota").cloned().unwrap_or(Value::Null));
    Ok(result)
}

#[cfg(test)]
mod dto_tests {
    use super::*;

    #[test]
    fn parse_nota_reference_payload_accepts_chave_or_barcode() {
        assert_eq!(
            parse_nota_reference_payload(Some(serde_json::json!({ "chave": "3526" }))).unwrap(),
            "3526"
        );
        assert_eq!(
            parse_nota_reference_payload(Some(serde_json::json!({ "barcode": "NF:1|V:1/2" })))
                .unwrap(),
            "NF:1|V:1/2"
        );
        assert!(parse_nota_reference_payload(None).is_err());
    }

    #[test]
    fn parse_nota_list_payload_drops_blank_filters() {
        let parsed = parse_nota_list_payload(Some(serde_json::json!({
            "status": "conferida",
            "carro_id": "  "
        })));
        assert_eq!(parsed.status.as_deref(), Some("conferida"));
        assert_eq!(parsed.carro_id, None);
        assert!(parse_nota_list_payload(None).status.is_none());
    }

    #[test]
    fn parse_nota_assign_payload_supports_aliases() {
        let parsed = parse_nota_assign_payload(Some(serde_json::json!({
            "chave": "35260312345678000199550010001234561123456780",
            "carro_id": "c-1"
        })))
        .expect("assign payload should parse");
        assert_eq!(parsed.carro_id, "c-1");
        assert!(parsed.nota_id.starts_with("3526"));

        let err = parse_nota_assign_payload(Some(serde_json::json!({ "notaId": "n", "carroId": "" })))
            .expect_err("blank carro should fail");
        assert!(err.contains("Missing"));
    }
}
