//! Label print queue.
//!
//! UI "Print" actions enqueue a job; a background worker renders the label
//! to ZPL and sends it to the resolved printer profile, either raw over TCP
//! (port 9100) or through the HTTP printer bridge. Failed jobs are retried
//! with backoff; a job with no printer profile to go to fails for good.

use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::labels::{self, LabelLayout};
use crate::printers::{self, NO_PROFILE_ERROR, TRANSPORT_BRIDGE};
use crate::now_rfc3339;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const BRIDGE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_COPIES: i64 = 99;
const WORKER_BATCH: i64 = 10;

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// Queue a label job. Returns `{ success, jobId }`; a job already pending or
/// printing for the same label returns that job with `duplicate: true`.
pub fn enqueue_print_job(
    db: &DbState,
    label_type: &str,
    entity_id: &str,
    printer_profile_id: Option<&str>,
    payload: Option<&Value>,
    copies: Option<i64>,
) -> Result<Value, String> {
    let label_type = label_type.trim().to_lowercase();
    if !labels::ALL_LABEL_TYPES.contains(&label_type.as_str()) {
        return Err(format!(
            "Invalid label_type: {label_type}. Must be one of {}",
            labels::ALL_LABEL_TYPES.join(", ")
        ));
    }
    let copies = copies.unwrap_or(1);
    if !(1..=MAX_COPIES).contains(&copies) {
        return Err(format!("copies must be between 1 and {MAX_COPIES}"));
    }

    let entity_id = match entity_id.trim() {
        "" if label_type == labels::LABEL_RAW => Uuid::new_v4().to_string(),
        "" => return Err("Missing entity id".into()),
        id => id.to_string(),
    };

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    // Fail fast on labels that could never render.
    labels::document_for(&conn, &label_type, &entity_id, payload)?;

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM print_jobs
             WHERE label_type = ?1 AND entity_id = ?2
               AND status IN ('pending', 'printing')",
            params![label_type, entity_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?;
    if let Some(existing_id) = existing {
        return Ok(serde_json::json!({
            "success": true,
            "jobId": existing_id,
            "message": "Print job already queued",
            "duplicate": true,
        }));
    }

    let job_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO print_jobs (id, label_type, entity_id, payload_json, printer_profile_id,
                                 copies, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?7)",
        params![
            job_id,
            label_type,
            entity_id,
            payload.map(|p| p.to_string()),
            printer_profile_id.map(str::trim).filter(|p| !p.is_empty()),
            copies,
            now
        ],
    )
    .map_err(|e| format!("enqueue print job: {e}"))?;

    info!(job_id = %job_id, label_type = %label_type, entity_id = %entity_id, copies, "Print job enqueued");
    Ok(serde_json::json!({
        "success": true,
        "jobId": job_id,
        "message": "Print job enqueued",
        "duplicate": false,
    }))
}

// ---------------------------------------------------------------------------
// Query and manual control
// ---------------------------------------------------------------------------

const JOB_COLUMNS: &str = "id, label_type, entity_id, payload_json, printer_profile_id, copies, status,
    retry_count, max_retries, next_retry_at, last_error, warning_message, last_attempt_at,
    created_at, updated_at";

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "labelType": row.get::<_, String>(1)?,
        "entityId": row.get::<_, String>(2)?,
        "payloadJson": row.get::<_, Option<String>>(3)?,
        "printerProfileId": row.get::<_, Option<String>>(4)?,
        "copies": row.get::<_, i64>(5)?,
        "status": row.get::<_, String>(6)?,
        "retryCount": row.get::<_, i64>(7)?,
        "maxRetries": row.get::<_, i64>(8)?,
        "nextRetryAt": row.get::<_, Option<String>>(9)?,
        "lastError": row.get::<_, Option<String>>(10)?,
        "warningMessage": row.get::<_, Option<String>>(11)?,
        "lastAttemptAt": row.get::<_, Option<String>>(12)?,
        "createdAt": row.get::<_, String>(13)?,
        "updatedAt": row.get::<_, String>(14)?,
    }))
}

fn load_job(conn: &Connection, id: &str) -> Result<Value, String> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM print_jobs WHERE id = ?1"),
        params![id],
        job_from_row,
    )
    .optional()
    .map_err(|e| format!("load print job: {e}"))?
    .ok_or_else(|| format!("Print job {id} not found"))
}

/// List print jobs newest first, optionally filtered by status.
pub fn list_print_jobs(db: &DbState, status: Option<&str>) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM print_jobs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC
             LIMIT 200"
        ))
        .map_err(|e| e.to_string())?;
    let jobs: Vec<Value> = stmt
        .query_map(params![status], job_from_row)
        .map_err(|e| e.to_string())?
        .filter_map(|r| match r {
            Ok(j) => Some(j),
            Err(e) => {
                warn!("skipping malformed print job row: {e}");
                None
            }
        })
        .collect();
    Ok(Value::Array(jobs))
}

/// Put a failed job back in the queue with a fresh retry budget.
pub fn retry_print_job(db: &DbState, id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let affected = conn
        .execute(
            "UPDATE print_jobs SET status = 'pending', retry_count = 0, next_retry_at = NULL,
                    last_error = NULL, updated_at = ?1
             WHERE id = ?2 AND status IN ('failed', 'cancelled')",
            params![now_rfc3339(), id],
        )
        .map_err(|e| format!("retry print job: {e}"))?;
    if affected == 0 {
        load_job(&conn, id)?;
        return Err(format!("Print job {id} is not failed or cancelled"));
    }
    info!(job_id = %id, "Print job requeued");
    load_job(&conn, id)
}

/// Cancel a job that has not started printing.
pub fn cancel_print_job(db: &DbState, id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let affected = conn
        .execute(
            "UPDATE print_jobs SET status = 'cancelled', next_retry_at = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            params![now_rfc3339(), id],
        )
        .map_err(|e| format!("cancel print job: {e}"))?;
    if affected == 0 {
        load_job(&conn, id)?;
        return Err(format!("Print job {id} is not pending"));
    }
    info!(job_id = %id, "Print job cancelled");
    load_job(&conn, id)
}

// ---------------------------------------------------------------------------
// Status updates
// ---------------------------------------------------------------------------

fn mark_printed(conn: &Connection, job_id: &str, warning: Option<&str>) -> Result<(), String> {
    let now = now_rfc3339();
    conn.execute(
        "UPDATE print_jobs SET status = 'printed', last_error = NULL, warning_message = ?1,
                last_attempt_at = ?2, updated_at = ?2
         WHERE id = ?3",
        params![warning, now, job_id],
    )
    .map_err(|e| format!("mark printed: {e}"))?;
    info!(job_id = %job_id, "Print job printed");
    Ok(())
}

/// Count a failed attempt and schedule the next one (5 s × 2^min(n, 4)).
fn mark_failed(conn: &Connection, job_id: &str, error_msg: &str) -> Result<(), String> {
    let now = now_rfc3339();
    conn.execute(
        "UPDATE print_jobs SET
            status = CASE
                WHEN retry_count + 1 >= max_retries THEN 'failed'
                ELSE 'pending'
            END,
            next_retry_at = CASE
                WHEN retry_count + 1 >= max_retries THEN NULL
                ELSE strftime('%Y-%m-%dT%H:%M:%fZ', 'now',
                              '+' || (5 * (1 << MIN(retry_count, 4))) || ' seconds')
            END,
            retry_count = retry_count + 1,
            last_error = ?1,
            last_attempt_at = ?2,
            updated_at = ?2
         WHERE id = ?3",
        params![error_msg, now, job_id],
    )
    .map_err(|e| format!("mark failed: {e}"))?;
    warn!(job_id = %job_id, error = %error_msg, "Print job failed");
    Ok(())
}

fn mark_failed_non_retryable(conn: &Connection, job_id: &str, error_msg: &str) -> Result<(), String> {
    let now = now_rfc3339();
    conn.execute(
        "UPDATE print_jobs SET status = 'failed', retry_count = retry_count + 1, last_error = ?1,
                last_attempt_at = ?2, next_retry_at = NULL, updated_at = ?2
         WHERE id = ?3",
        params![error_msg, now, job_id],
    )
    .map_err(|e| format!("mark failed non-retryable: {e}"))?;
    warn!(job_id = %job_id, error = %error_msg, "Print job failed (non-retryable)");
    Ok(())
}

fn is_non_retryable_print_error(error_msg: &str) -> bool {
    let normalized = error_msg.to_ascii_lowercase();
    normalized.contains(&NO_PROFILE_ERROR.to_ascii_lowercase())
        || normalized.contains("is disabled")
        || normalized.contains("unknown label type")
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let host = host.trim();
    if host.is_empty() {
        return Err("Printer host is empty".into());
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| format!("Invalid printer address {host}:{port}: {e}"))?
        .next()
        .ok_or_else(|| format!("Printer address {host}:{port} did not resolve"))
}

/// Write raw bytes to a printer's raw port. Returns the bytes written.
pub fn send_raw_tcp(host: &str, port: u16, bytes: &[u8]) -> Result<usize, String> {
    let addr = resolve_addr(host, port)?;
    let stream = TcpStream::connect_timeout(&addr, TCP_CONNECT_TIMEOUT)
        .map_err(|e| format!("TCP connect to {addr} failed: {e}"))?;
    stream
        .set_write_timeout(Some(TCP_WRITE_TIMEOUT))
        .map_err(|e| format!("set_write_timeout: {e}"))?;

    let mut writer = std::io::BufWriter::new(stream);
    writer
        .write_all(bytes)
        .map_err(|e| format!("TCP write to {addr}: {e}"))?;
    writer
        .flush()
        .map_err(|e| format!("TCP flush to {addr}: {e}"))?;

    info!(addr = %addr, bytes = bytes.len(), "Label data sent over TCP");
    Ok(bytes.len())
}

/// Body posted to `{bridge_url}/print`.
pub(crate) fn bridge_payload(host: &str, port: u16, zpl: &str) -> Value {
    serde_json::json!({ "host": host, "port": port, "zpl": zpl })
}

fn bridge_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .timeout(BRIDGE_TIMEOUT)
        .build()
        .map_err(|e| format!("HTTP client error: {e}"))
}

/// Hand a label to the printer bridge, which forwards it to `host:port`.
pub async fn send_via_bridge(bridge_url: &str, host: &str, port: u16, zpl: &str) -> Result<(), String> {
    let url = format!("{}/print", bridge_url.trim_end_matches('/'));
    let resp = bridge_client()?
        .post(&url)
        .json(&bridge_payload(host, port, zpl))
        .send()
        .await
        .map_err(|e| format!("Bridge request to {url} failed: {e}"))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(format!("Bridge error ({status}): {body}"));
    }
    info!(bridge = %url, host, port, bytes = zpl.len(), "Label handed to bridge");
    Ok(())
}

/// `GET {bridge_url}/health`.
pub async fn bridge_health(bridge_url: &str) -> Result<(), String> {
    let url = format!("{}/health", bridge_url.trim_end_matches('/'));
    let resp = bridge_client()?
        .get(&url)
        .send()
        .await
        .map_err(|e| format!("Bridge request to {url} failed: {e}"))?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("Bridge health check returned {}", resp.status()))
    }
}

/// Connect to a raw printer port without sending anything.
pub async fn check_tcp_reachable(host: &str, port: u16) -> Result<(), String> {
    let addr = resolve_addr(host, port)?;
    match tokio::time::timeout(TCP_CONNECT_TIMEOUT, tokio::net::TcpStream::connect(addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(format!("TCP connect to {addr} failed: {e}")),
        Err(_) => Err(format!("TCP connect to {addr} timed out")),
    }
}

async fn dispatch(profile: &Value, zpl: String) -> Result<(), String> {
    let host = profile["host"].as_str().unwrap_or_default().to_string();
    let port = profile["port"].as_u64().unwrap_or(9100) as u16;
    if profile["transport"].as_str() == Some(TRANSPORT_BRIDGE) {
        let bridge_url = profile["bridgeUrl"].as_str().unwrap_or_default();
        return send_via_bridge(bridge_url, &host, port, &zpl).await;
    }
    tokio::task::spawn_blocking(move || send_raw_tcp(&host, port, zpl.as_bytes()))
        .await
        .map_err(|e| format!("TCP send task failed: {e}"))?
        .map(|_| ())
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct PendingJob {
    id: String,
    label_type: String,
    entity_id: String,
    payload_json: Option<String>,
    profile_id: Option<String>,
    copies: i64,
}

/// Render and send every due job. Returns the number of jobs attempted.
pub async fn process_pending_jobs(db: &DbState) -> Result<usize, String> {
    let jobs: Vec<PendingJob> = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT id, label_type, entity_id, payload_json, printer_profile_id, copies
                 FROM print_jobs
                 WHERE status = 'pending'
                   AND (next_retry_at IS NULL OR julianday(next_retry_at) <= julianday('now'))
                 ORDER BY created_at ASC
                 LIMIT ?1",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![WORKER_BATCH], |row| {
                Ok(PendingJob {
                    id: row.get(0)?,
                    label_type: row.get(1)?,
                    entity_id: row.get(2)?,
                    payload_json: row.get(3)?,
                    profile_id: row.get(4)?,
                    copies: row.get(5)?,
                })
            })
            .map_err(|e| e.to_string())?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };

    let mut count = 0usize;
    for job in jobs {
        // Render under the lock, send without it.
        let prepared = {
            let conn = db.conn.lock().map_err(|e| e.to_string())?;
            let claimed = conn
                .execute(
                    "UPDATE print_jobs SET status = 'printing', updated_at = ?1
                     WHERE id = ?2 AND status = 'pending'",
                    params![now_rfc3339(), job.id],
                )
                .map_err(|e| format!("mark printing: {e}"))?;
            if claimed == 0 {
                debug!(job_id = %job.id, "Print job no longer pending, skipped");
                continue;
            }
            count += 1;
            prepare_job(&conn, &job)
        };

        let outcome = match prepared {
            Ok((profile, render)) => dispatch(&profile, render.zpl)
                .await
                .map(|()| render.warnings),
            Err(e) => Err(e),
        };

        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        match outcome {
            Ok(warnings) => {
                let warning = (!warnings.is_empty()).then(|| {
                    warnings
                        .iter()
                        .map(|w| w.message.clone())
                        .collect::<Vec<String>>()
                        .join(" | ")
                });
                mark_printed(&conn, &job.id, warning.as_deref())?;
            }
            Err(e) if is_non_retryable_print_error(&e) => {
                mark_failed_non_retryable(&conn, &job.id, &e)?;
            }
            Err(e) => mark_failed(&conn, &job.id, &e)?,
        }
    }

    if count > 0 {
        info!(processed = count, "Print worker processed jobs");
    }
    Ok(count)
}

fn prepare_job(conn: &Connection, job: &PendingJob) -> Result<(Value, labels::LabelRender), String> {
    let payload: Option<Value> = job
        .payload_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());
    let profile = printers::resolve_profile_locked(conn, job.profile_id.as_deref())?;
    let document = labels::document_for(conn, &job.label_type, &job.entity_id, payload.as_ref())?;
    let layout = LabelLayout::from_profile(&profile).with_settings(conn);
    let render = labels::render(
        &document,
        &layout,
        profile["logoSource"].as_str(),
        job.copies.clamp(1, MAX_COPIES) as u32,
    )?;
    Ok((profile, render))
}

/// Put jobs left `printing` by an interrupted run back to `pending`.
fn recover_printing_jobs(db: &DbState) -> Result<usize, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "UPDATE print_jobs SET status = 'pending', updated_at = ?1 WHERE status = 'printing'",
        params![now_rfc3339()],
    )
    .map_err(|e| format!("recover print jobs: {e}"))
}

/// Start the background print worker loop.
pub fn start_print_worker(db: Arc<DbState>, interval_secs: u64) {
    match recover_printing_jobs(&db) {
        Ok(n) if n > 0 => info!(recovered = n, "Recovered interrupted print jobs"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Could not recover print jobs"),
    }

    tauri::async_runtime::spawn(async move {
        let interval = Duration::from_secs(interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = process_pending_jobs(&db).await {
                error!("Print worker error: {e}");
            }
        }
    });

    info!(interval_secs, "Print worker started");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_state;
    use crate::{carros, printers};
    use std::io::Read;
    use std::net::TcpListener;

    fn tcp_test_server() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral TCP port for test");
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn carro_id(db: &DbState) -> String {
        carros::create_carro(db, &serde_json::json!({ "doca": "1" })).unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    fn job_status(db: &DbState, id: &str) -> Value {
        let conn = db.conn.lock().unwrap();
        load_job(&conn, id).unwrap()
    }

    #[test]
    fn test_enqueue_validates_and_dedupes() {
        let db = test_state();
        let id = carro_id(&db);
        assert!(enqueue_print_job(&db, "pallet", &id, None, None, None).is_err());
        assert!(enqueue_print_job(&db, "carro", "missing", None, None, None).is_err());
        assert!(enqueue_print_job(&db, "carro", &id, None, None, Some(0)).is_err());
        assert!(enqueue_print_job(&db, "raw", "", None, None, None).is_err());

        let first = enqueue_print_job(&db, "CARRO", &id, None, None, Some(2)).unwrap();
        assert_eq!(first["duplicate"], false);
        let second = enqueue_print_job(&db, "carro", &id, None, None, None).unwrap();
        assert_eq!(second["duplicate"], true);
        assert_eq!(second["jobId"], first["jobId"]);

        let raw = serde_json::json!({ "zpl": "^XA^FDteste^FS^XZ" });
        let a = enqueue_print_job(&db, "raw", "", None, Some(&raw), None).unwrap();
        let b = enqueue_print_job(&db, "raw", "", None, Some(&raw), None).unwrap();
        assert_ne!(a["jobId"], b["jobId"]);
    }

    #[test]
    fn test_cancel_and_retry() {
        let db = test_state();
        let id = carro_id(&db);
        let job = enqueue_print_job(&db, "carro", &id, None, None, None).unwrap();
        let job_id = job["jobId"].as_str().unwrap();

        assert!(retry_print_job(&db, job_id).is_err());
        assert_eq!(cancel_print_job(&db, job_id).unwrap()["status"], "cancelled");
        assert!(cancel_print_job(&db, job_id).is_err());
        assert_eq!(retry_print_job(&db, job_id).unwrap()["status"], "pending");
        assert_eq!(list_print_jobs(&db, Some("pending")).unwrap().as_array().unwrap().len(), 1);
        assert!(cancel_print_job(&db, "missing").unwrap_err().contains("not found"));
    }

    #[test]
    fn test_mark_failed_backs_off_then_gives_up() {
        let db = test_state();
        let id = carro_id(&db);
        let job = enqueue_print_job(&db, "carro", &id, None, None, None).unwrap();
        let job_id = job["jobId"].as_str().unwrap();

        let conn = db.conn.lock().unwrap();
        for expected in 1..=3 {
            mark_failed(&conn, job_id, "TCP connect failed").unwrap();
            let row = load_job(&conn, job_id).unwrap();
            assert_eq!(row["retryCount"], expected);
            if expected < 3 {
                assert_eq!(row["status"], "pending");
                assert!(row["nextRetryAt"].as_str().unwrap().ends_with('Z'));
            } else {
                assert_eq!(row["status"], "failed");
                assert!(row["nextRetryAt"].is_null());
            }
        }
    }

    #[test]
    fn test_non_retryable_errors() {
        assert!(is_non_retryable_print_error(NO_PROFILE_ERROR));
        assert!(is_non_retryable_print_error("Printer profile abc is disabled"));
        assert!(!is_non_retryable_print_error("TCP connect to 10.0.0.1:9100 failed"));
    }

    #[test]
    fn test_send_raw_tcp_delivers_bytes() {
        let (listener, port) = tcp_test_server();
        let handle = std::thread::spawn(move || {
            let (mut stream, _addr) = listener.accept().expect("accept TCP connection");
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).expect("read from TCP connection");
            buf
        });

        let sent = send_raw_tcp("127.0.0.1", port, b"^XA^XZ").unwrap();
        assert_eq!(sent, 6);
        assert_eq!(handle.join().unwrap(), b"^XA^XZ".to_vec());
    }

    #[test]
    fn test_send_raw_tcp_refused() {
        let (listener, port) = tcp_test_server();
        drop(listener);
        let err = send_raw_tcp("127.0.0.1", port, b"^XA^XZ").unwrap_err();
        assert!(err.contains("TCP connect"), "unexpected error: {err}");
        assert!(send_raw_tcp("  ", 9100, b"x").is_err());
    }

    #[test]
    fn test_bridge_payload_shape() {
        assert_eq!(
            bridge_payload("10.0.0.5", 9100, "^XA^XZ"),
            serde_json::json!({ "host": "10.0.0.5", "port": 9100, "zpl": "^XA^XZ" })
        );
    }

    #[tokio::test]
    async fn test_worker_prints_over_tcp() {
        let db = test_state();
        let (listener, port) = tcp_test_server();
        let handle = std::thread::spawn(move || {
            let (mut stream, _addr) = listener.accept().expect("accept TCP connection");
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).expect("read from TCP connection");
            String::from_utf8(buf).unwrap()
        });

        printers::create_printer_profile(
            &db,
            &serde_json::json!({ "name": "Doca", "host": "127.0.0.1", "port": port }),
        )
        .unwrap();
        let id = carro_id(&db);
        let job = enqueue_print_job(&db, "carro", &id, None, None, None).unwrap();
        let job_id = job["jobId"].as_str().unwrap().to_string();

        assert_eq!(process_pending_jobs(&db).await.unwrap(), 1);
        let received = handle.join().unwrap();
        assert!(received.starts_with("^XA"));
        assert!(received.contains("CARRO:CAR-0001"));
        assert_eq!(job_status(&db, &job_id)["status"], "printed");
    }

    #[tokio::test]
    async fn test_worker_skips_job_cancelled_mid_batch() {
        let db = Arc::new(test_state());
        let (listener, port) = tcp_test_server();
        printers::create_printer_profile(
            &db,
            &serde_json::json!({
                "name": "Bridge",
                "transport": "bridge",
                "host": "10.0.0.9",
                "bridgeUrl": format!("http://127.0.0.1:{port}")
            }),
        )
        .unwrap();
        let first = enqueue_print_job(&db, "carro", &carro_id(&db), None, None, None).unwrap();
        let second = enqueue_print_job(&db, "carro", &carro_id(&db), None, None, None).unwrap();
        let first_id = first["jobId"].as_str().unwrap().to_string();
        let second_id = second["jobId"].as_str().unwrap().to_string();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE print_jobs SET created_at = '2026-01-01T00:00:00.000Z' WHERE id = ?1",
                params![first_id],
            )
            .unwrap();
            conn.execute(
                "UPDATE print_jobs SET created_at = '2026-01-01T00:00:01.000Z' WHERE id = ?1",
                params![second_id],
            )
            .unwrap();
        }

        // The bridge answers the first job only after the second is cancelled.
        let server_db = Arc::clone(&db);
        let cancel_id = second_id.clone();
        let handle = std::thread::spawn(move || {
            let (mut stream, _addr) = listener.accept().expect("accept bridge connection");
            let request = read_http_request(&mut stream);
            let cancelled = cancel_print_job(&server_db, &cancel_id).unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();
            (request, cancelled["status"].as_str().unwrap().to_string())
        });

        assert_eq!(process_pending_jobs(&db).await.unwrap(), 1);
        let (request, cancel_status) = handle.join().unwrap();
        assert!(request.starts_with("POST /print"));
        assert!(request.contains("CARRO:CAR-0001"));
        assert_eq!(cancel_status, "cancelled");
        assert_eq!(job_status(&db, &first_id)["status"], "printed");
        assert_eq!(job_status(&db, &second_id)["status"], "cancelled");
    }

    fn read_http_request(stream: &mut std::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    #[tokio::test]
    async fn test_worker_without_profile_fails_for_good() {
        let db = test_state();
        let id = carro_id(&db);
        let job = enqueue_print_job(&db, "carro", &id, None, None, None).unwrap();
        let job_id = job["jobId"].as_str().unwrap().to_string();

        assert_eq!(process_pending_jobs(&db).await.unwrap(), 1);
        let row = job_status(&db, &job_id);
        assert_eq!(row["status"], "failed");
        assert_eq!(row["lastError"], NO_PROFILE_ERROR);
        assert_eq!(process_pending_jobs(&db).await.unwrap(), 0);
    }
}
