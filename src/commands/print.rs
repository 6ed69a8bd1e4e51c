use serde::Deserialize;
use serde_json::Value;
use tauri::Emitter;
use tracing::info;

use crate::{db, labels, payload_arg0_as_string, payload_object, print, printers};

// -- Printer profiles ----------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelPreviewPayload {
    #[serde(alias = "label_type", alias = "type", alias = "kind")]
    label_type: String,
    #[serde(alias = "entity_id", alias = "id")]
    entity_id: String,
    #[serde(default, alias = "profile_id", alias = "printerProfileId")]
    profile_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrintEnqueuePayload {
    #[serde(alias = "label_type", alias = "type", alias = "kind")]
    label_type: String,
    #[serde(default, alias = "entity_id", alias = "id")]
    entity_id: String,
    #[serde(default, alias = "printer_profile_id", alias = "profileId", alias = "printerId")]
    printer_profile_id: Option<String>,
    #[serde(default, alias = "zpl")]
    payload: Option<Value>,
    #[serde(default)]
    copies: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PrintJobListPayload {
    #[serde(default)]
    status: Option<String>,
}

fn clean(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_profile_id_payload(arg0: Option<Value>) -> Result<String, String> {
    payload_arg0_as_string(
        arg0,
        &["profileId", "profile_id", "printerId", "printer_id", "id"],
    )
    .ok_or("Missing profileId".into())
}

fn parse_job_id_payload(arg0: Option<Value>) -> Result<String, String> {
    payload_arg0_as_string(arg0, &["jobId", "job_id", "id"]).ok_or("Missing jobId".into())
}

fn parse_label_preview_payload(arg0: Option<Value>) -> Result<LabelPreviewPayload, String> {
    let parsed: LabelPreviewPayload = serde_json::from_value(payload_object(arg0))
        .map_err(|e| format!("Invalid label preview payload: {e}"))?;
    Ok(LabelPreviewPayload {
        profile_id: clean(parsed.profile_id),
        ..parsed
    })
}

/// A raw job may carry its ZPL either as `payload` (string or object) or
/// under the `zpl` alias; both end up as the job payload.
fn parse_print_enqueue_payload(arg0: Option<Value>) -> Result<PrintEnqueuePayload, String> {
    let parsed: PrintEnqueuePayload = serde_json::from_value(payload_object(arg0))
        .map_err(|e| format!("Invalid print payload: {e}"))?;
    let payload = match parsed.payload {
        Some(Value::String(zpl)) => Some(serde_json::json!({ "zpl": zpl })),
        other => other,
    };
    Ok(PrintEnqueuePayload {
        printer_profile_id: clean(parsed.printer_profile_id),
        payload,
        ..parsed
    })
}

#[tauri::command]
pub async fn printer_create_profile(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    printers::create_printer_profile(&db, &payload_object(arg0))
}

#[tauri::command]
pub async fn printer_update_profile(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = payload_object(arg0);
    let id = parse_profile_id_payload(Some(payload.clone()))?;
    printers::update_printer_profile(&db, &id, &payload)
}

#[tauri::command]
pub async fn printer_list_profiles(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    printers::list_printer_profiles(&db)
}

#[tauri::command]
pub async fn printer_get_profile(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let id = parse_profile_id_payload(arg0)?;
    printers::get_printer_profile(&db, &id)
}

#[tauri::command]
pub async fn printer_delete_profile(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let id = parse_profile_id_payload(arg0)?;
    printers::delete_printer_profile(&db, &id)
}

#[tauri::command]
pub async fn printer_set_default_profile(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let id = parse_profile_id_payload(arg0)?;
    printers::set_default_printer_profile(&db, &id)
}

#[tauri::command]
pub async fn printer_test_connection(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let id = parse_profile_id_payload(arg0)?;
    let result = printers::test_printer_connection(&db, &id).await?;
    let _ = app.emit(
        "printer_status_changed",
        serde_json::json!({ "profileId": id, "result": result.clone() }),
    );
    Ok(result)
}

// -- Labels & jobs -------------------------------------------------------------

#[tauri::command]
pub async fn label_preview(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = parse_label_preview_payload(arg0)?;
    labels::preview_label(
        &db,
        payload.label_type.trim(),
        payload.entity_id.trim(),
        payload.profile_id.as_deref(),
    )
}

#[tauri::command]
pub async fn print_enqueue_job(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let payload = parse_print_enqueue_payload(arg0)?;
    let result = print::enqueue_print_job(
        &db,
        &payload.label_type,
        payload.entity_id.trim(),
        payload.printer_profile_id.as_deref(),
        payload.payload.as_ref(),
        payload.copies,
    )?;
    if result["duplicate"] != true {
        info!(job_id = %result["jobId"], label_type = %payload.label_type, "Print job queued");
        let _ = app.emit("print_job_updated", result.clone());
    }
    Ok(result)
}

#[tauri::command]
pub async fn print_list_jobs(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let filter = match arg0 {
        Some(Value::String(status)) => PrintJobListPayload {
            status: Some(status),
        },
        Some(v @ Value::Object(_)) => serde_json::from_value(v).unwrap_or_default(),
        _ => PrintJobListPayload::default(),
    };
    print::list_print_jobs(&db, clean(filter.status).as_deref())
}

#[tauri::command]
pub async fn print_retry_job(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let id = parse_job_id_payload(arg0)?;
    let result = print::retry_print_job(&db, &id)?;
    let _ = app.emit("print_job_updated", result.clone());
    Ok(result)
}

#[tauri::command]
pub async fn print_cancel_job(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let id = parse_job_id_payload(arg0)?;
    let result = print::cancel_print_job(&db, &id)?;
    let _ = app.emit("print_job_updated", result.clone());
    Ok(result)
}
