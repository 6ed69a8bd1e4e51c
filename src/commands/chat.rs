use serde::Deserialize;
use serde_json::Value;
use tauri::Emitter;

use crate::{chat, db, payload_object};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ChatListPayload {
    #[serde(default, alias = "channel")]
    canal: Option<String>,
    #[serde(default, alias = "cursor", alias = "after")]
    since: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

fn parse_chat_list_payload(arg0: Option<Value>) -> ChatListPayload {
    match arg0 {
        Some(Value::String(canal)) => ChatListPayload {
            canal: Some(canal),
            ..Default::default()
        },
        Some(v @ Value::Object(_)) => serde_json::from_value(v).unwrap_or_default(),
        _ => ChatListPayload::default(),
    }
}

#[tauri::command]
pub async fn chat_post_message(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    app: tauri::AppHandle,
) -> Result<Value, String> {
    let message = chat::post_message(&db, &payload_object(arg0))?;
    let _ = app.emit("chat_message", message.clone());
    Ok(message)
}

#[tauri::command]
pub async fn chat_list_messages(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = parse_chat_list_payload(arg0);
    chat::list_messages(
        &db,
        payload.canal.as_deref(),
        payload.since.as_deref(),
        payload.limit,
    )
}

#[cfg(test)]
mod dto_tests {
    use super::*;

    #[test]
    fn parse_chat_list_payload_accepts_channel_string() {
        let parsed = parse_chat_list_payload(Some(serde_json::json!("doca")));
        assert_eq!(parsed.canal.as_deref(), Some("doca"));
        assert!(parsed.since.is_none());
    }

    #[test]
    fn parse_chat_list_payload_supports_cursor_alias() {
        let parsed = parse_chat_list_payload(Some(serde_json::json!({
            "channel": "geral",
            "cursor": "2026-10-18T10:00:00.000Z",
            "limit": 20
        })));
        assert_eq!(parsed.canal.as_deref(), Some("geral"));
        assert_eq!(parsed.since.as_deref(), Some("2026-10-18T10:00:00.000Z"));
        assert_eq!(parsed.limit, Some(20));
    }
}
