use serde::Deserialize;
use serde_json::Value;
use tauri::Emitter;

use crate::{db, payload_arg0_as_string, payload_object, wms};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PosicaoListPayload {
    #[serde(default)]
    rua: Option<String>,
    #[serde(default, alias = "only_free", alias = "livres")]
    only_free: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuggestPayload {
    volumes: i64,
    #[serde(default, alias = "category")]
    categoria: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlocarPayload {
    #[serde(alias = "nota_id")]
    nota_id: String,
    #[serde(alias = "posicao_id")]
    posicao_id: String,
    volumes: i64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AlocacaoListPayload {
    #[serde(default, alias = "nota_id")]
    nota_id: Option<String>,
    #[serde(default, alias = "posicao_id")]
    posicao_id: Option<String>,
}

fn parse_object_or_default<T: serde::de::DeserializeOwned + Default>(arg0: Option<Value>) -> T {
    match arg0 {
        Some(v @ Value::Object(_)) => serde_json::from_value(v).unwrap_or_default(),
        _ => T::default(),
    }
}

fn parse_suggest_payload(arg0: Option<Value>) -> Result<SuggestPayload, String> {
    let payload = match arg0 {
        Some(Value::Number(n)) => serde_json::json!({ "volumes": n }),
        other => payload_object(other),
    };
    serde_json::from_value(payload).map_err(|e| format!("Invalid suggest payload: {e}"))
}

fn parse_alocar_payload(arg0: Option<Value>) -> Result<AlocarPayload, String> {
    let parsed: AlocarPayload = serde_json::from_value(payload_object(arg0))
        .map_err(|e| format!("Invalid alocar payload: {e}"))?;
    if parsed.nota_id.trim().is_empty() || parsed.posicao_id.trim().is_empty() {
        return Err("Missing notaId or posicaoId".into());
    }
    Ok(parsed)
}

#[tauri::command]
pub async fn wms_parse_codigo(arg0: Option<Value>) -> Result<Value, String> {
    let raw = payload_arg0_as_string(arg0, &["codigo", "code", "value"]).ok_or("Missing codigo")?;
    let parsed = wms::parse_codigo_posicao(&raw).map_err(|e| e.to_string())?;
    serde_json::to_value(parsed).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn wms_create_posicao(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    wms::create_posicao(&db, &payload_object(arg0))
}

#[tauri::command]
pub async fn wms_list_posicoes(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let filter: PosicaoListPayload = parse_object_or_default(arg0);
    let rua = filter
        .rua
        .map(|r| r.trim().to_uppercase())
        .filter(|r| !r.is_empty());
    wms::list_posicoes(&db, rua.as_deref(), filter.only_free)
}

#[tauri::command]
pub async fn wms_update_posicao(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = payload_object(arg0);
    let id = payload_arg0_as_string(Some(payload.clone()), &["posicaoId", "posicao_id", "id"])
        .ok_or("Missing posicaoId")?;
    wms::update_posicao(&db, &id, &payload)
}

#[tauri::command]
pub async fn wms_suggest_posicoes(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = parse_suggest_payload(arg0)?;
    wms::suggest_posicoes(&db, payload.volumes, payload.categoria.as_deref(), payload.limit)
}

#[tauri::command]
pub async fn wms_alocar(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = parse_alocar_payload(arg0)?;
    let result = wms::alocar(
        &db,
        payload.nota_id.trim(),
        payload.posicao_id.trim(),
        payload.volumes,
    )?;
    let _ = app.emit("posicao_updated", result["posicao"].clone());
    Ok(result)
}

#[tauri::command]
pub async fn wms_liberar(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let id = payload_arg0_as_string(arg0, &["alocacaoId", "alocacao_id", "id"])
        .ok_or("Missing alocacaoId")?;
    let result = wms::liberar(&db, &id)?;
    if let Some(posicao) = result.get("posicao") {
        let _ = app.emit("posicao_updated", posicao.clone());
    }
    Ok(result)
}

#[tauri::command]
pub async fn wms_list_alocacoes(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let filter: AlocacaoListPayload = parse_object_or_default(arg0);
    wms::list_alocacoes(&db, filter.nota_id.as_deref(), filter.posicao_id.as_deref())
}

#[cfg(test)]
mod dto_tests {
    use super::*;

    #[test]
    fn parse_suggest_payload_accepts_bare_number() {
        let parsed = parse_suggest_payload(Some(serde_json::json!(3))).unwrap();
        assert_eq!(parsed.volumes, 3);
        assert!(parsed.categoria.is_none());

        let parsed = parse_suggest_payload(Some(serde_json::json!({
            "volumes": 2,
            "category": "refrigerado",
            "limit": 10
        })))
        .unwrap();
        assert_eq!(parsed.categoria.as_deref(), Some("refrigerado"));
        assert_eq!(parsed.limit, Some(10));

        assert!(parse_suggest_payload(None).is_err());
    }

    #[test]
    fn parse_alocar_payload_requires_ids() {
        let parsed = parse_alocar_payload(Some(serde_json::json!({
            "nota_id": "n-1",
            "posicaoId": "p-1",
            "volumes": 2
        })))
        .unwrap();
        assert_eq!(parsed.nota_id, "n-1");
        assert_eq!(parsed.posicao_id, "p-1");

        assert!(parse_alocar_payload(Some(serde_json::json!({
            "notaId": "",
            "posicaoId": "p-1",
            "volumes": 1
        })))
        .is_err());
    }

    #[test]
    fn parse_posicao_list_payload_defaults() {
        let parsed: PosicaoListPayload = parse_object_or_default(None);
        assert!(!parsed.only_free);
        let parsed: PosicaoListPayload =
            parse_object_or_default(Some(serde_json::json!({ "rua": "a", "livres": true })));
        assert!(parsed.only_free);
        assert_eq!(parsed.rua.as_deref(), Some("a"));
    }
}
