use serde::Deserialize;
use serde_json::Value;

use crate::{payload_arg0_as_string, payload_object, scanner};

const DEFAULT_BAUD_RATE: u32 = 9600;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScannerStartPayload {
    #[serde(alias = "port_name", alias = "portName")]
    port: String,
    #[serde(default, alias = "baud_rate", alias = "baud")]
    baud_rate: Option<u32>,
}

fn parse_scanner_start_payload(arg0: Option<Value>) -> Result<(String, u32), String> {
    let payload = match arg0 {
        Some(Value::String(port)) => serde_json::json!({ "port": port }),
        other => payload_object(other),
    };
    let parsed: ScannerStartPayload = serde_json::from_value(payload)
        .map_err(|e| format!("Invalid scanner payload: {e}"))?;
    let port = parsed.port.trim().to_string();
    if port.is_empty() {
        return Err("Missing port".into());
    }
    Ok((port, parsed.baud_rate.unwrap_or(DEFAULT_BAUD_RATE)))
}

#[tauri::command]
pub async fn scanner_classify(arg0: Option<Value>) -> Result<Value, String> {
    let barcode =
        payload_arg0_as_string(arg0, &["barcode", "code", "value"]).ok_or("Missing barcode")?;
    Ok(serde_json::json!({
        "barcode": barcode,
        "classification": scanner::classify_barcode(&barcode),
    }))
}

#[tauri::command]
pub async fn scanner_list_ports() -> Result<Value, String> {
    scanner::list_ports()
}

#[tauri::command]
pub async fn scanner_start(arg0: Option<Value>, app: tauri::AppHandle) -> Result<Value, String> {
    let (port, baud_rate) = parse_scanner_start_payload(arg0)?;
    scanner::start(&port, baud_rate, app)
}

#[tauri::command]
pub async fn scanner_stop() -> Result<Value, String> {
    scanner::stop()
}

#[tauri::command]
pub async fn scanner_get_status() -> Result<Value, String> {
    scanner::status()
}
