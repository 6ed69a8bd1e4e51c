//! Background sync engine.
//!
//! Every local write appends a row to `sync_queue`. A background loop pushes
//! due rows to the hosted Supabase tables (upsert keyed by `id`), grouped by
//! table, and pulls chat messages written by other stations. Failed rows are
//! rescheduled with exponential backoff until `max_retries` is reached.

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tauri::{AppHandle, Emitter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::{chat, storage, supabase};

const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
const MAX_RETRY_DELAY_MS: i64 = 300_000;
const BATCH_SIZE: i64 = 50;

pub const OP_DELETE: &str = "delete";
const MESSAGE_PULL_LIMIT: usize = 200;
const MESSAGES_SINCE_FALLBACK: &str = "1970-01-01T00:00:00.000Z";
const CURSOR_CATEGORY: &str = "sync";
const CURSOR_KEY: &str = "messages_cursor";

/// Remote tables in push order. Parents go before the rows that reference them.
const TABLE_ORDER: &[&str] = &[
    "carros",
    "notas_fiscais",
    "divergencias",
    "wms_posicoes",
    "wms_alocacoes",
    "messages",
];

pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_sync: Arc<Mutex<Option<String>>>,
    pub last_error: Arc<Mutex<Option<String>>>,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(Mutex::new(None)),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    fn record_success(&self) {
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    fn record_error(&self, error: &str) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(error.to_string());
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

/// Local entity type -> hosted table. Local tables share the same names.
pub fn table_for_entity(entity_type: &str) -> Option<&'static str> {
    match entity_type {
        "carro" => Some("carros"),
        "nota_fiscal" => Some("notas_fiscais"),
        "divergencia" => Some("divergencias"),
        "message" => Some("messages"),
        "wms_posicao" => Some("wms_posicoes"),
        "wms_alocacao" => Some("wms_alocacoes"),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Append a change to the sync queue. Called with the connection lock held,
/// usually right after the write it describes.
pub fn enqueue(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    operation: &str,
    payload: &Value,
) -> Result<(), String> {
    if table_for_entity(entity_type).is_none() {
        return Err(format!("Unknown sync entity type: {entity_type}"));
    }
    let idempotency_key = format!("{entity_type}:{entity_id}:{}", Uuid::new_v4());
    conn.execute(
        "INSERT INTO sync_queue (entity_type, entity_id, operation, payload, idempotency_key)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entity_type,
            entity_id,
            operation,
            payload.to_string(),
            idempotency_key
        ],
    )
    .map_err(|e| format!("enqueue sync: {e}"))?;
    Ok(())
}

#[derive(Debug, Clone)]
pub(crate) struct QueueItem {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub payload: String,
    pub retry_count: i64,
    pub max_retries: i64,
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    let positive = if seed < 0 { -seed } else { seed };
    (positive % 700) + 50
}

/// Backoff before attempt `retry_count + 1`: 5 s doubling, capped at 5 min.
fn retry_delay_ms(retry_count: i64) -> i64 {
    let shift = retry_count.clamp(0, 16) as u32;
    DEFAULT_RETRY_DELAY_MS
        .saturating_mul(1_i64 << shift)
        .min(MAX_RETRY_DELAY_MS)
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    let jitter = deterministic_jitter_ms(seed);
    (Utc::now() + ChronoDuration::milliseconds(bounded + jitter))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Put rows left `in_progress` by an interrupted run back to `pending`.
pub(crate) fn recover_in_progress(conn: &Connection) -> Result<usize, String> {
    conn.execute(
        "UPDATE sync_queue SET status = 'pending', updated_at = datetime('now')
         WHERE status = 'in_progress'",
        [],
    )
    .map_err(|e| format!("recover sync queue: {e}"))
}

/// Take up to `limit` due rows and mark them `in_progress`.
pub(crate) fn claim_due_items(conn: &Connection, limit: i64) -> Result<Vec<QueueItem>, String> {
    let items: Vec<QueueItem> = {
        let mut stmt = conn
            .prepare(
                "SELECT id, entity_type, entity_id, operation, payload, retry_count, max_retries
                 FROM sync_queue
                 WHERE status = 'pending'
                   AND retry_count < max_retries
                   AND (next_retry_at IS NULL OR julianday(next_retry_at) <= julianday('now'))
                 ORDER BY id ASC
                 LIMIT ?1",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(QueueItem {
                    id: row.get(0)?,
                    entity_type: row.get(1)?,
                    entity_id: row.get(2)?,
                    operation: row.get(3)?,
                    payload: row.get(4)?,
                    retry_count: row.get(5)?,
                    max_retries: row.get(6)?,
                })
            })
            .map_err(|e| e.to_string())?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };

    for item in &items {
        conn.execute(
            "UPDATE sync_queue SET status = 'in_progress', updated_at = datetime('now') WHERE id = ?1",
            params![item.id],
        )
        .map_err(|e| format!("claim sync row: {e}"))?;
    }
    Ok(items)
}

/// Claimed rows for one remote table.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct TableBatch {
    pub table: &'static str,
    pub upserts: Vec<Value>,
    pub deletes: Vec<String>,
    pub queue_ids: Vec<i64>,
}

/// Group claimed rows by remote table in push order. Within a table only the
/// latest operation per entity is sent; PostgREST rejects a batch that touches
/// the same row twice. An entity whose latest operation is a delete is sent
/// as a delete only.
pub(crate) fn group_by_table(items: &[QueueItem]) -> Vec<TableBatch> {
    let mut grouped: HashMap<&'static str, (BTreeMap<String, (i64, bool, Value)>, Vec<i64>)> =
        HashMap::new();
    for item in items {
        let Some(table) = table_for_entity(&item.entity_type) else {
            continue;
        };
        let is_delete = item.operation == OP_DELETE;
        let payload: Value = if is_delete {
            Value::Null
        } else {
            match serde_json::from_str(&item.payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!(queue_id = item.id, error = %e, "Unparseable sync payload");
                    continue;
                }
            }
        };
        let entry = grouped.entry(table).or_default();
        entry.1.push(item.id);
        match entry.0.get(&item.entity_id) {
            Some((existing_id, _, _)) if *existing_id > item.id => {}
            _ => {
                entry
                    .0
                    .insert(item.entity_id.clone(), (item.id, is_delete, payload));
            }
        }
    }

    TABLE_ORDER
        .iter()
        .filter_map(|table| {
            grouped.remove(table).map(|(rows, queue_ids)| {
                let mut batch = TableBatch {
                    table: *table,
                    queue_ids,
                    ..Default::default()
                };
                for (entity_id, (_, is_delete, payload)) in rows {
                    if is_delete {
                        batch.deletes.push(entity_id);
                    } else {
                        batch.upserts.push(payload);
                    }
                }
                batch
            })
        })
        .collect()
}

/// Mark queue rows synced and flag their entities as synced when nothing
/// newer is still waiting for them.
pub(crate) fn mark_items_synced(conn: &Connection, items: &[&QueueItem]) -> Result<(), String> {
    for item in items {
        conn.execute(
            "UPDATE sync_queue
             SET status = 'synced', synced_at = datetime('now'), last_error = NULL,
                 updated_at = datetime('now')
             WHERE id = ?1",
            params![item.id],
        )
        .map_err(|e| format!("mark synced: {e}"))?;

        if let Some(table) = table_for_entity(&item.entity_type) {
            conn.execute(
                &format!(
                    "UPDATE {table} SET sync_status = 'synced'
                     WHERE id = ?1
                       AND NOT EXISTS (
                            SELECT 1 FROM sync_queue
                            WHERE entity_type = ?2 AND entity_id = ?1
                              AND status IN ('pending', 'in_progress')
                       )"
                ),
                params![item.entity_id, item.entity_type],
            )
            .map_err(|e| format!("mark entity synced: {e}"))?;
        }
    }
    Ok(())
}

/// Reschedule failed rows, or park them as `failed` once retries run out.
pub(crate) fn mark_items_failed(
    conn: &Connection,
    items: &[&QueueItem],
    error: &str,
) -> Result<(), String> {
    for item in items {
        let new_count = item.retry_count + 1;
        let exhausted = new_count >= item.max_retries;
        let new_status = if exhausted { "failed" } else { "pending" };
        let next_retry_at = if exhausted {
            None
        } else {
            Some(schedule_next_retry(retry_delay_ms(item.retry_count), item.id))
        };
        conn.execute(
            "UPDATE sync_queue
             SET status = ?1, retry_count = ?2, next_retry_at = ?3, last_error = ?4,
                 updated_at = datetime('now')
             WHERE id = ?5",
            params![new_status, new_count, next_retry_at, error, item.id],
        )
        .map_err(|e| format!("mark failed: {e}"))?;
        if exhausted {
            warn!(
                queue_id = item.id,
                entity_type = %item.entity_type,
                entity_id = %item.entity_id,
                "Sync row exhausted retries"
            );
            if let Some(table) = table_for_entity(&item.entity_type) {
                conn.execute(
                    &format!("UPDATE {table} SET sync_status = 'failed' WHERE id = ?1"),
                    params![item.entity_id],
                )
                .map_err(|e| format!("mark entity failed: {e}"))?;
            }
        }
    }
    Ok(())
}

/// Move every `failed` row back to `pending` with a fresh retry budget.
pub fn retry_failed(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let count = conn
        .execute(
            "UPDATE sync_queue
             SET status = 'pending', retry_count = 0, next_retry_at = NULL,
                 updated_at = datetime('now')
             WHERE status = 'failed'",
            [],
        )
        .map_err(|e| format!("retry failed: {e}"))?;
    info!(count, "Requeued failed sync rows");
    Ok(serde_json::json!({ "success": true, "requeued": count }))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

fn status_snapshot(conn: &Connection) -> Value {
    let count = |sql: &str| -> i64 { conn.query_row(sql, [], |row| row.get(0)).unwrap_or(0) };
    let pending = count("SELECT COUNT(*) FROM sync_queue WHERE status IN ('pending', 'in_progress')");
    let failed = count("SELECT COUNT(*) FROM sync_queue WHERE status = 'failed'");
    let in_progress = count("SELECT COUNT(*) FROM sync_queue WHERE status = 'in_progress'");

    let mut by_entity = serde_json::Map::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT entity_type,
                SUM(CASE WHEN status IN ('pending', 'in_progress') THEN 1 ELSE 0 END),
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END)
         FROM sync_queue
         WHERE status != 'synced'
         GROUP BY entity_type",
    ) {
        if let Ok(rows) = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        }) {
            for (entity, p, f) in rows.filter_map(|r| r.ok()) {
                by_entity.insert(entity, serde_json::json!({ "pending": p, "failed": f }));
            }
        }
    }

    let oldest_next_retry_at: Option<String> = conn
        .query_row(
            "SELECT MIN(next_retry_at) FROM sync_queue
             WHERE status = 'pending' AND next_retry_at IS NOT NULL",
            [],
            |row| row.get(0),
        )
        .ok()
        .flatten();

    serde_json::json!({
        "pendingItems": pending,
        "failedItems": failed,
        "syncInProgress": in_progress > 0,
        "byEntity": by_entity,
        "oldestNextRetryAt": oldest_next_retry_at,
    })
}

fn status_with_state(db: &DbState, state: &SyncState, is_online: Option<bool>) -> Value {
    let mut status = match db.conn.lock() {
        Ok(conn) => status_snapshot(&conn),
        Err(_) => serde_json::json!({}),
    };
    let last_sync = state.last_sync.lock().ok().and_then(|g| g.clone());
    let last_error = state.last_error.lock().ok().and_then(|g| g.clone());
    status["lastSync"] = serde_json::json!(last_sync);
    status["lastError"] = serde_json::json!(last_error);
    status["isConfigured"] = Value::Bool(storage::is_configured());
    status["isOnline"] = serde_json::json!(is_online);
    status
}

pub fn get_sync_status(db: &DbState, state: &SyncState) -> Result<Value, String> {
    Ok(status_with_state(db, state, None))
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

async fn push_pending(db: &DbState) -> Result<usize, String> {
    let items = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        claim_due_items(&conn, BATCH_SIZE)?
    };
    if items.is_empty() {
        return Ok(0);
    }

    let by_id: HashMap<i64, &QueueItem> = items.iter().map(|i| (i.id, i)).collect();
    let mut synced = 0usize;
    let mut first_error: Option<String> = None;

    for group in group_by_table(&items) {
        let table = group.table;
        let batch: Vec<&QueueItem> = group
            .queue_ids
            .iter()
            .filter_map(|id| by_id.get(id).copied())
            .collect();
        let pushed = match supabase::upsert_rows(table, &group.upserts).await {
            Ok(()) => supabase::delete_rows(table, &group.deletes).await,
            Err(e) => Err(e),
        };
        match pushed {
            Ok(()) => {
                let conn = db.conn.lock().map_err(|e| e.to_string())?;
                mark_items_synced(&conn, &batch)?;
                synced += batch.len();
                debug!(
                    table,
                    upserts = group.upserts.len(),
                    deletes = group.deletes.len(),
                    "Pushed sync batch"
                );
            }
            Err(e) => {
                warn!(table, error = %e, "Sync batch failed");
                let conn = db.conn.lock().map_err(|e| e.to_string())?;
                mark_items_failed(&conn, &batch, &e)?;
                first_error.get_or_insert(e);
            }
        }
    }

    // Rows whose entity type has no table were skipped by grouping.
    let orphaned: Vec<&QueueItem> = items
        .iter()
        .filter(|i| table_for_entity(&i.entity_type).is_none())
        .collect();
    if !orphaned.is_empty() {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        mark_items_failed(&conn, &orphaned, "Unknown sync entity type")?;
    }

    match first_error {
        Some(e) if synced == 0 => Err(e),
        _ => Ok(synced),
    }
}

/// Pull chat messages newer than the stored cursor and emit them.
async fn pull_messages(db: &DbState, app: &AppHandle) -> Result<usize, String> {
    let cursor = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        db::get_setting(&conn, CURSOR_CATEGORY, CURSOR_KEY)
            .and_then(|c| chat::normalize_timestamp(&c))
            .unwrap_or_else(|| MESSAGES_SINCE_FALLBACK.to_string())
    };

    let rows = supabase::fetch_rows(
        "messages",
        &[
            ("select", "id,canal,autor,conteudo,created_at".to_string()),
            ("created_at", format!("gt.{cursor}")),
            ("order", "created_at.asc".to_string()),
            ("limit", MESSAGE_PULL_LIMIT.to_string()),
        ],
    )
    .await?;
    let rows = rows.as_array().cloned().unwrap_or_default();
    if rows.is_empty() {
        return Ok(0);
    }

    let ingested = chat::ingest_remote_messages(db, &rows)?;
    for message in &ingested {
        let _ = app.emit("chat_message", message);
    }

    let newest = rows
        .iter()
        .filter_map(|r| r.get("created_at").and_then(Value::as_str))
        .filter_map(chat::normalize_timestamp)
        .max();
    if let Some(newest) = newest {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        db::set_setting(&conn, CURSOR_CATEGORY, CURSOR_KEY, &newest)?;
    }
    Ok(ingested.len())
}

async fn run_sync_cycle(db: &DbState, app: &AppHandle) -> Result<usize, String> {
    let pushed = push_pending(db).await?;
    let pulled = match pull_messages(db, app).await {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "Message pull failed");
            0
        }
    };
    Ok(pushed + pulled)
}

/// Start the background sync loop.
pub fn start_sync_loop(app: AppHandle, db: Arc<DbState>, state: Arc<SyncState>, interval_secs: u64) {
    state.is_running.store(true, Ordering::SeqCst);
    if let Ok(conn) = db.conn.lock() {
        match recover_in_progress(&conn) {
            Ok(n) if n > 0 => info!(recovered = n, "Recovered interrupted sync rows"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not recover sync rows"),
        }
    }

    tauri::async_runtime::spawn(async move {
        info!("Sync loop started (interval: {interval_secs}s)");
        let mut previous_online: Option<bool> = None;

        loop {
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;
            if !state.is_running.load(Ordering::SeqCst) {
                info!("Sync loop stopped");
                break;
            }

            if !storage::is_configured() {
                previous_online = None;
                let _ = app.emit("sync_status", status_with_state(&db, &state, None));
                continue;
            }

            let online = supabase::check_connectivity().await;
            let _ = app.emit("network_status", serde_json::json!({ "isOnline": online }));
            if !online {
                if previous_online != Some(false) {
                    info!("Backend unreachable; keeping queue pending");
                }
                previous_online = Some(false);
                let _ = app.emit("sync_status", status_with_state(&db, &state, Some(false)));
                continue;
            }
            if previous_online == Some(false) {
                info!("Backend reachable again; resuming sync");
            }
            previous_online = Some(true);

            match run_sync_cycle(&db, &app).await {
                Ok(n) => {
                    if n > 0 {
                        info!("Sync cycle complete: {n} items");
                    }
                    state.record_success();
                }
                Err(e) => {
                    warn!("Sync cycle failed: {e}");
                    state.record_error(&e);
                }
            }
            let _ = app.emit("sync_status", status_with_state(&db, &state, Some(true)));
        }
    });
}

/// Run one cycle now.
pub async fn force_sync(db: &DbState, state: &SyncState, app: &AppHandle) -> Result<Value, String> {
    if !storage::is_configured() {
        return Err("Supabase not configured".into());
    }
    match run_sync_cycle(db, app).await {
        Ok(n) => {
            state.record_success();
            info!("Force sync complete: {n} items");
            let status = status_with_state(db, state, Some(true));
            let _ = app.emit("sync_status", &status);
            Ok(serde_json::json!({ "success": true, "synced": n, "status": status }))
        }
        Err(e) => {
            state.record_error(&e);
            Err(e)
        }
    }
}
