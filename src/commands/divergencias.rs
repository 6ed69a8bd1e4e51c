use serde::Deserialize;
use serde_json::Value;
use tauri::Emitter;

use crate::{db, divergencias, payload_object};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct DivergenciaListPayload {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "nota_id")]
    nota_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DivergenciaResolvePayload {
    #[serde(alias = "divergencia_id", alias = "divergenciaId")]
    id: String,
    #[serde(default, alias = "resolution")]
    resolucao: String,
    #[serde(default, alias = "resolvido_por", alias = "operador")]
    resolvido_por: Option<String>,
}

fn parse_divergencia_list_payload(arg0: Option<Value>) -> DivergenciaListPayload {
    let parsed: DivergenciaListPayload = match arg0 {
        Some(v @ Value::Object(_)) => serde_json::from_value(v).unwrap_or_default(),
        _ => DivergenciaListPayload::default(),
    };
    let clean = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    DivergenciaListPayload {
        status: clean(parsed.status),
        nota_id: clean(parsed.nota_id),
    }
}

fn parse_divergencia_resolve_payload(
    arg0: Option<Value>,
) -> Result<DivergenciaResolvePayload, String> {
    let parsed: DivergenciaResolvePayload = serde_json::from_value(payload_object(arg0))
        .map_err(|e| format!("Invalid resolve payload: {e}"))?;
    if parsed.id.trim().is_empty() {
        return Err("Missing divergencia id".into());
    }
    Ok(parsed)
}

#[tauri::command]
pub async fn divergencia_record(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let divergencia = divergencias::record_divergencia(&db, &payload_object(arg0))?;
    let _ = app.emit("divergencia_updated", divergencia.clone());
    Ok(divergencia)
}

#[tauri::command]
pub async fn divergencia_list(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let filter = parse_divergencia_list_payload(arg0);
    divergencias::list_divergencias(&db, filter.status.as_deref(), filter.nota_id.as_deref())
}

#[tauri::command]
pub async fn divergencia_resolve(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = parse_divergencia_resolve_payload(arg0)?;
    let result = divergencias::resolve_divergencia(
        &db,
        payload.id.trim(),
        payload.resolucao.trim(),
        payload.resolvido_por.as_deref().map(str::trim),
    )?;
    let _ = app.emit("divergencia_updated", result.clone());
    Ok(result)
}

#[cfg(test)]
mod dto_tests {
    use super::*;

    #[test]
    fn parse_divergencia_resolve_payload_supports_aliases() {
        let parsed = parse_divergencia_resolve_payload(Some(serde_json::json!({
            "divergenciaId": "d-1",
            "resolution": "Volume encontrado",
            "operador": "ana"
        })))
        .expect("resolve payload should parse");
        assert_eq!(parsed.id, "d-1");
        assert_eq!(parsed.resolucao, "Volume encontrado");
        assert_eq!(parsed.resolvido_por.as_deref(), Some("ana"));
    }

    #[test]
    fn parse_divergencia_resolve_payload_rejects_missing_id() {
        assert!(parse_divergencia_resolve_payload(None).is_err());
        assert!(parse_divergencia_resolve_payload(Some(serde_json::json!({ "id": " " }))).is_err());
    }

    #[test]
    fn parse_divergencia_list_payload_reads_filters() {
        let parsed = parse_divergencia_list_payload(Some(serde_json::json!({
            "status": "aberta",
            "notaId": "n-1"
        })));
        assert_eq!(parsed.status.as_deref(), Some("aberta"));
        assert_eq!(parsed.nota_id.as_deref(), Some("n-1"));
    }
}
