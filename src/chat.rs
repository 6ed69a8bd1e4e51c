//! Operator chat.
//!
//! Messages are written locally and pushed through the sync queue; messages
//! from other stations are pulled by the sync loop and ingested here. The UI
//! polls with a `since` cursor (the `created_at` of the last message it has).

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::{now_rfc3339, sync, value_str};

const DEFAULT_CANAL: &str = "geral";
const MAX_MESSAGE_CHARS: usize = 2000;
const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "canal": row.get::<_, String>(1)?,
        "autor": row.get::<_, String>(2)?,
        "conteudo": row.get::<_, String>(3)?,
        "origin": row.get::<_, String>(4)?,
        "createdAt": row.get::<_, String>(5)?,
    }))
}

fn normalize_canal(raw: Option<&str>) -> String {
    raw.map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| DEFAULT_CANAL.to_string())
}

/// Normalize any RFC 3339 timestamp to the fixed-width UTC form used for
/// ordering (`2026-01-01T10:00:00.000Z`).
pub(crate) fn normalize_timestamp(raw: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| {
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true)
        })
}

/// Post a message from this station.
pub fn post_message(db: &DbState, payload: &Value) -> Result<Value, String> {
    let autor = value_str(payload, &["autor", "author", "user"]).ok_or("Missing autor")?;
    let conteudo = value_str(payload, &["conteudo", "content", "text"]).ok_or("Empty message")?;
    if conteudo.chars().count() > MAX_MESSAGE_CHARS {
        return Err(format!(
            "Message too long (max {MAX_MESSAGE_CHARS} characters)"
        ));
    }
    let canal = normalize_canal(value_str(payload, &["canal", "channel"]).as_deref());

    let id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO messages (id, canal, autor, conteudo, origin, created_at)
         VALUES (?1, ?2, ?3, ?4, 'local', ?5)",
        params![id, canal, autor, conteudo, created_at],
    )
    .map_err(|e| format!("insert message: {e}"))?;

    sync::enqueue(
        &conn,
        "message",
        &id,
        "insert",
        &serde_json::json!({
            "id": id,
            "canal": canal,
            "autor": autor,
            "conteudo": conteudo,
            "created_at": created_at,
        }),
    )?;

    Ok(serde_json::json!({
        "id": id,
        "canal": canal,
        "autor": autor,
        "conteudo": conteudo,
        "origin": "local",
        "createdAt": created_at,
    }))
}

/// Position after the last message of a page: `{created_at}|{id}`.
/// A bare timestamp is accepted too and means "after every message at that
/// instant".
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MessageCursor {
    pub created_at: String,
    pub id: Option<String>,
}

impl MessageCursor {
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (ts, id) = match raw.split_once('|') {
            Some((ts, id)) => (ts, Some(id.trim()).filter(|i| !i.is_empty())),
            None => (raw, None),
        };
        Some(Self {
            created_at: normalize_timestamp(ts)?,
            id: id.map(str::to_string),
        })
    }

    fn after(message: &Value) -> Option<Self> {
        Some(Self {
            created_at: message["createdAt"].as_str()?.to_string(),
            id: message["id"].as_str().map(str::to_string),
        })
    }

    fn encode(&self) -> String {
        match &self.id {
            Some(id) => format!("{}|{id}", self.created_at),
            None => self.created_at.clone(),
        }
    }
}

/// Messages of a channel in ascending order, strictly after `since`.
pub fn list_messages(
    db: &DbState,
    canal: Option<&str>,
    since: Option<&str>,
    limit: Option<i64>,
) -> Result<Value, String> {
    let canal = normalize_canal(canal);
    let since = match since.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(MessageCursor::parse(raw).ok_or_else(|| format!("Invalid cursor: {raw}"))?),
        None => None,
    };
    let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let messages = query_messages(&conn, &canal, since.as_ref(), limit)?;
    let cursor = messages
        .last()
        .and_then(MessageCursor::after)
        .or(since)
        .map(|c| c.encode());

    Ok(serde_json::json!({
        "canal": canal,
        "messages": messages,
        "cursor": cursor,
    }))
}

fn query_messages(
    conn: &Connection,
    canal: &str,
    since: Option<&MessageCursor>,
    limit: i64,
) -> Result<Vec<Value>, String> {
    // Without a cursor the UI wants the latest page, still shown oldest first.
    let sql = if since.is_some() {
        "SELECT id, canal, autor, conteudo, origin, created_at FROM messages
         WHERE canal = ?1
           AND (created_at > ?2 OR (created_at = ?2 AND ?4 IS NOT NULL AND id > ?4))
         ORDER BY created_at ASC, id ASC LIMIT ?3"
    } else {
        "SELECT * FROM (
            SELECT id, canal, autor, conteudo, origin, created_at FROM messages
            WHERE canal = ?1 AND ?2 IS NULL AND ?4 IS NULL
            ORDER BY created_at DESC, id DESC LIMIT ?3
         ) ORDER BY created_at ASC, id ASC"
    };
    let since_at = since.map(|c| c.created_at.as_str());
    let since_id = since.and_then(|c| c.id.as_deref());
    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map(params![canal, since_at, limit, since_id], message_from_row)
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Insert messages pulled from the hosted table. Rows already present (our
/// own pushes included) are skipped. Returns the newly ingested messages.
pub fn ingest_remote_messages(db: &DbState, rows: &[Value]) -> Result<Vec<Value>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut ingested = Vec::new();

    for row in rows {
        let (Some(id), Some(autor), Some(conteudo)) = (
            value_str(row, &["id"]),
            value_str(row, &["autor"]),
            value_str(row, &["conteudo"]),
        ) else {
            warn!("Skipping remote message without id/autor/conteudo");
            continue;
        };
        let Some(created_at) = value_str(row, &["created_at"]).and_then(|t| normalize_timestamp(&t))
        else {
            warn!(message_id = %id, "Skipping remote message with invalid created_at");
            continue;
        };
        let canal = normalize_canal(value_str(row, &["canal"]).as_deref());

        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO messages (id, canal, autor, conteudo, origin, created_at, sync_status)
                 VALUES (?1, ?2, ?3, ?4, 'remote', ?5, 'synced')",
                params![id, canal, autor, conteudo, created_at],
            )
            .map_err(|e| format!("ingest message: {e}"))?;
        if inserted > 0 {
            ingested.push(serde_json::json!({
                "id": id,
                "canal": canal,
                "autor": autor,
                "conteudo": conteudo,
                "origin": "remote",
                "createdAt": created_at,
            }));
        }
    }

    if !ingested.is_empty() {
        debug!(count = ingested.len(), "Ingested remote chat messages");
    }
    Ok(ingested)
}
