//! Carts ("carros") for ProFlow WMS.
//!
//! A carro groups the notas fiscais being packed together. Its lifecycle is a
//! plain status column:
//!
//! ```text
//! embalando -> pronto -> em_doca -> despachado
//!     ^          |
//!     +----------+ (reopen)
//! embalando | pronto -> cancelado
//! ```
//!
//! `despachado` and `cancelado` are terminal. Every mutation is enqueued for
//! sync to the hosted database.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::{notas, now_rfc3339, sync, wms};

pub const STATUS_EMBALANDO: &str = "embalando";
pub const STATUS_PRONTO: &str = "pronto";
pub const STATUS_EM_DOCA: &str = "em_doca";
pub const STATUS_DESPACHADO: &str = "despachado";
pub const STATUS_CANCELADO: &str = "cancelado";

const ALL_STATUSES: &[&str] = &[
    STATUS_EMBALANDO,
    STATUS_PRONTO,
    STATUS_EM_DOCA,
    STATUS_DESPACHADO,
    STATUS_CANCELADO,
];

/// Whether `from -> to` is an allowed cart transition.
pub fn is_valid_transition(from: &str, to: &str) -> bool {
    matches!(
        (from, to),
        (STATUS_EMBALANDO, STATUS_PRONTO)
            | (STATUS_PRONTO, STATUS_EMBALANDO)
            | (STATUS_PRONTO, STATUS_EM_DOCA)
            | (STATUS_EM_DOCA, STATUS_DESPACHADO)
            | (STATUS_EMBALANDO, STATUS_CANCELADO)
            | (STATUS_PRONTO, STATUS_CANCELADO)
    )
}

fn normalize_status(raw: &str) -> Result<String, String> {
    let status = raw.trim().to_lowercase().replace(['-', ' '], "_");
    if ALL_STATUSES.contains(&status.as_str()) {
        Ok(status)
    } else {
        Err(format!("Invalid cart status: {raw}"))
    }
}

fn next_codigo(conn: &Connection) -> Result<String, String> {
    let last: i64 = db::get_setting(conn, "carros", "last_sequence")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut next = last + 1;
    // Skip codes taken by explicitly named carts.
    loop {
        let candidate = format!("CAR-{next:04}");
        let taken: bool = conn
            .query_row(
                "SELECT 1 FROM carros WHERE codigo = ?1",
                params![candidate],
                |_| Ok(true),
            )
            .optional()
            .map_err(|e| format!("check codigo: {e}"))?
            .unwrap_or(false);
        if !taken {
            db::set_setting(conn, "carros", "last_sequence", &next.to_string())?;
            return Ok(candidate);
        }
        next += 1;
    }
}

const CARRO_COLUMNS: &str = "c.id, c.codigo, c.doca, c.responsavel, c.status, c.observacao,
     c.created_at, c.updated_at, c.sync_status,
     (SELECT COUNT(*) FROM notas_fiscais n WHERE n.carro_id = c.id),
     (SELECT COALESCE(SUM(n.volumes), 0) FROM notas_fiscais n WHERE n.carro_id = c.id)";

fn carro_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "codigo": row.get::<_, String>(1)?,
        "doca": row.get::<_, Option<String>>(2)?,
        "responsavel": row.get::<_, Option<String>>(3)?,
        "status": row.get::<_, String>(4)?,
        "observacao": row.get::<_, Option<String>>(5)?,
        "createdAt": row.get::<_, String>(6)?,
        "updatedAt": row.get::<_, String>(7)?,
        "syncStatus": row.get::<_, String>(8)?,
        "notasCount": row.get::<_, i64>(9)?,
        "volumesTotal": row.get::<_, i64>(10)?,
    }))
}

/// Load a cart row (with counts) by id.
pub(crate) fn load_carro(conn: &Connection, id: &str) -> Result<Value, String> {
    conn.query_row(
        &format!("SELECT {CARRO_COLUMNS} FROM carros c WHERE c.id = ?1"),
        params![id],
        carro_from_row,
    )
    .optional()
    .map_err(|e| format!("load carro: {e}"))?
    .ok_or_else(|| format!("Carro not found: {id}"))
}

/// Snake-case row shape pushed to the hosted `carros` table.
pub(crate) fn remote_row(conn: &Connection, id: &str) -> Result<Value, String> {
    conn.query_row(
        "SELECT id, codigo, doca, responsavel, status, observacao, created_at, updated_at
         FROM carros WHERE id = ?1",
        params![id],
        |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "codigo": row.get::<_, String>(1)?,
                "doca": row.get::<_, Option<String>>(2)?,
                "responsavel": row.get::<_, Option<String>>(3)?,
                "status": row.get::<_, String>(4)?,
                "observacao": row.get::<_, Option<String>>(5)?,
                "created_at": row.get::<_, String>(6)?,
                "updated_at": row.get::<_, String>(7)?,
            }))
        },
    )
    .map_err(|e| format!("carro remote row: {e}"))
}

pub(crate) fn enqueue_carro_sync(conn: &Connection, id: &str, operation: &str) -> Result<(), String> {
    let payload = remote_row(conn, id)?;
    sync::enqueue(conn, "carro", id, operation, &payload)
}

fn trimmed(payload: &Value, keys: &[&str]) -> Option<String> {
    crate::value_str(payload, keys)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Create a cart. A missing `codigo` gets the next `CAR-nnnn`.
pub fn create_carro(db: &DbState, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let codigo = match trimmed(payload, &["codigo", "code"]) {
        Some(c) => {
            let c = c.to_uppercase();
            let exists: bool = conn
                .query_row("SELECT 1 FROM carros WHERE codigo = ?1", params![c], |_| {
                    Ok(true)
                })
                .optional()
                .map_err(|e| e.to_string())?
                .unwrap_or(false);
            if exists {
                return Err(format!("Carro {c} already exists"));
            }
            c
        }
        None => next_codigo(&conn)?,
    };

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO carros (id, codigo, doca, responsavel, status, observacao, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'embalando', ?5, ?6, ?6)",
        params![
            id,
            codigo,
            trimmed(payload, &["doca", "dock"]),
            trimmed(payload, &["responsavel", "operador"]),
            trimmed(payload, &["observacao", "notes"]),
            now
        ],
    )
    .map_err(|e| format!("insert carro: {e}"))?;

    enqueue_carro_sync(&conn, &id, "insert")?;
    info!(carro_id = %id, codigo = %codigo, "Carro created");

    load_carro(&conn, &id)
}

/// List carts newest first, optionally filtered by status.
pub fn list_carros(db: &DbState, status: Option<&str>) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let rows: Vec<Value> = match status {
        Some(s) => {
            let s = normalize_status(s)?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CARRO_COLUMNS} FROM carros c WHERE c.status = ?1 ORDER BY c.created_at DESC"
                ))
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map(params![s], carro_from_row)
                .map_err(|e| e.to_string())?
                .filter_map(|r| r.ok())
                .collect();
            rows
        }
        None => {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CARRO_COLUMNS} FROM carros c ORDER BY c.created_at DESC"
                ))
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map([], carro_from_row)
                .map_err(|e| e.to_string())?
                .filter_map(|r| r.ok())
                .collect();
            rows
        }
    };

    Ok(serde_json::json!(rows))
}

/// Cart plus the notas packed in it.
pub fn get_carro(db: &DbState, id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut carro = load_carro(&conn, id)?;
    let notas = crate::notas::list_notas_locked(&conn, None, Some(id))?;
    carro["notas"] = serde_json::json!(notas);
    Ok(carro)
}

/// Move a cart to a new status, applying the side effects on its notas.
pub fn update_carro_status(db: &DbState, id: &str, status: &str) -> Result<Value, String> {
    let target = normalize_status(status)?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let current: String = conn
        .query_row(
            "SELECT status FROM carros WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Carro not found: {id}"))?;

    if current == target {
        return load_carro(&conn, id);
    }
    if !is_valid_transition(&current, &target) {
        return Err(format!(
            "Invalid cart transition: {current} -> {target}"
        ));
    }

    let notas_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM notas_fiscais WHERE carro_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .map_err(|e| e.to_string())?;
    if target == STATUS_PRONTO && notas_count == 0 {
        return Err("Cannot mark an empty cart as pronto".into());
    }

    let now = now_rfc3339();
    let touched = wms::in_transaction(&conn, || {
        conn.execute(
            "UPDATE carros SET status = ?1, updated_at = ?2, sync_status = 'pending' WHERE id = ?3",
            params![target, now, id],
        )
        .map_err(|e| format!("update carro status: {e}"))?;

        let touched: Vec<String> = match target.as_str() {
            STATUS_DESPACHADO | STATUS_CANCELADO => {
                let mut stmt = conn
                    .prepare("SELECT id FROM notas_fiscais WHERE carro_id = ?1")
                    .map_err(|e| e.to_string())?;
                let ids = stmt
                    .query_map(params![id], |row| row.get::<_, String>(0))
                    .map_err(|e| e.to_string())?
                    .filter_map(|r| r.ok())
                    .collect();
                ids
            }
            _ => Vec::new(),
        };

        match target.as_str() {
            STATUS_DESPACHADO => {
                conn.execute(
                    "UPDATE notas_fiscais SET status = ?3, updated_at = ?1, sync_status = 'pending'
                     WHERE carro_id = ?2",
                    params![now, id, notas::STATUS_EXPEDIDA],
                )
                .map_err(|e| format!("expedir notas: {e}"))?;
            }
            STATUS_CANCELADO => {
                conn.execute(
                    "UPDATE notas_fiscais SET status = ?3, carro_id = NULL, updated_at = ?1,
                            sync_status = 'pending'
                     WHERE carro_id = ?2",
                    params![now, id, notas::STATUS_CONFERIDA],
                )
                .map_err(|e| format!("detach notas: {e}"))?;
            }
            _ => {}
        }

        enqueue_carro_sync(&conn, id, "update")?;
        for nota_id in &touched {
            notas::enqueue_nota_sync(&conn, nota_id, "update")?;
        }
        Ok(touched)
    })?;

    info!(carro_id = %id, from = %current, to = %target, notas = touched.len(), "Carro status changed");
    load_carro(&conn, id)
}

/// Update the editable descriptive fields of a cart.
pub fn update_carro(db: &DbState, id: &str, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let existing = load_carro(&conn, id)?;
    let status = existing["status"].as_str().unwrap_or_default();
    if status == STATUS_DESPACHADO || status == STATUS_CANCELADO {
        return Err(format!("Carro {id} is {status} and can no longer be edited"));
    }

    let pick = |keys: &[&str], current: &Value| -> Option<String> {
        // Present-but-empty clears the field.
        for key in keys {
            if let Some(v) = payload.get(*key) {
                return v
                    .as_str()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
            }
        }
        current.as_str().map(|s| s.to_string())
    };
    let doca = pick(&["doca", "dock"], &existing["doca"]);
    let responsavel = pick(&["responsavel", "operador"], &existing["responsavel"]);
    let observacao = pick(&["observacao", "notes"], &existing["observacao"]);

    conn.execute(
        "UPDATE carros SET doca = ?1, responsavel = ?2, observacao = ?3, updated_at = ?4,
                sync_status = 'pending'
         WHERE id = ?5",
        params![doca, responsavel, observacao, now_rfc3339(), id],
    )
    .map_err(|e| format!("update carro: {e}"))?;

    enqueue_carro_sync(&conn, id, "update")?;
    load_carro(&conn, id)
}

/// Delete an empty cart.
pub fn delete_carro(db: &DbState, id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let carro = load_carro(&conn, id)?;
    if carro["notasCount"].as_i64().unwrap_or(0) > 0 {
        return Err("Cannot delete a cart that still has notas".into());
    }

    conn.execute("DELETE FROM carros WHERE id = ?1", params![id])
        .map_err(|e| format!("delete carro: {e}"))?;
    sync::enqueue(&conn, "carro", id, sync::OP_DELETE, &serde_json::json!({ "id": id }))?;

    info!(carro_id = %id, "Carro deleted");
    Ok(serde_json::json!({ "success": true, "id": id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_state;

    fn seed_nota(db: &DbState, carro_id: Option<&str>, status: &str) -> String {
        let conn = db.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO notas_fiscais (id, numero, volumes, status, carro_id, created_at, updated_at)
             VALUES (?1, '123', 2, ?2, ?3, datetime('now'), datetime('now'))",
            params![id, status, carro_id],
        )
        .unwrap();
        id
    }

    fn nota_state(db: &DbState, id: &str) -> (String, Option<String>) {
        let conn = db.conn.lock().unwrap();
        conn.query_row(
            "SELECT status, carro_id FROM notas_fiscais WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap()
    }

    #[test]
    fn test_create_generates_sequential_codes() {
        let db = test_state();
        let a = create_carro(&db, &serde_json::json!({})).unwrap();
        let b = create_carro(&db, &serde_json::json!({ "doca": "D2" })).unwrap();
        assert_eq!(a["codigo"], "CAR-0001");
        assert_eq!(b["codigo"], "CAR-0002");
        assert_eq!(b["doca"], "D2");
        assert_eq!(a["status"], "embalando");
    }

    #[test]
    fn test_generated_code_skips_explicit_names() {
        let db = test_state();
        create_carro(&db, &serde_json::json!({ "codigo": "car-0001" })).unwrap();
        let next = create_carro(&db, &serde_json::json!({})).unwrap();
        assert_eq!(next["codigo"], "CAR-0002");
    }

    #[test]
    fn test_duplicate_explicit_code_rejected() {
        let db = test_state();
        create_carro(&db, &serde_json::json!({ "codigo": "EXP-1" })).unwrap();
        let err = create_carro(&db, &serde_json::json!({ "codigo": "exp-1" })).unwrap_err();
        assert!(err.contains("already exists"));
    }

    #[test]
    fn test_transition_table() {
        assert!(is_valid_transition("embalando", "pronto"));
        assert!(is_valid_transition("pronto", "embalando"));
        assert!(is_valid_transition("em_doca", "despachado"));
        assert!(!is_valid_transition("embalando", "despachado"));
        assert!(!is_valid_transition("despachado", "embalando"));
        assert!(!is_valid_transition("cancelado", "pronto"));
        assert!(!is_valid_transition("em_doca", "cancelado"));
    }

    #[test]
    fn test_empty_cart_cannot_be_pronto() {
        let db = test_state();
        let carro = create_carro(&db, &serde_json::json!({})).unwrap();
        let id = carro["id"].as_str().unwrap();
        let err = update_carro_status(&db, id, "pronto").unwrap_err();
        assert!(err.contains("empty cart"));
    }

    #[test]
    fn test_dispatch_marks_notas_expedida() {
        let db = test_state();
        let carro = create_carro(&db, &serde_json::json!({})).unwrap();
        let id = carro["id"].as_str().unwrap();
        let nota = seed_nota(&db, Some(id), "embalada");

        update_carro_status(&db, id, "pronto").unwrap();
        update_carro_status(&db, id, "em-doca").unwrap();
        let done = update_carro_status(&db, id, "despachado").unwrap();
        assert_eq!(done["status"], "despachado");
        assert_eq!(done["volumesTotal"], 2);

        assert_eq!(nota_state(&db, &nota).0, "expedida");
        assert!(update_carro_status(&db, id, "embalando").is_err());
    }

    #[test]
    fn test_dispatch_rolls_back_when_sync_enqueue_fails() {
        let db = test_state();
        let carro = create_carro(&db, &serde_json::json!({})).unwrap();
        let id = carro["id"].as_str().unwrap();
        let nota = seed_nota(&db, Some(id), "embalada");
        update_carro_status(&db, id, "pronto").unwrap();
        update_carro_status(&db, id, "em_doca").unwrap();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute_batch(
                "CREATE TRIGGER reject_nota_sync BEFORE INSERT ON sync_queue
                 WHEN NEW.entity_type = 'nota_fiscal'
                 BEGIN SELECT RAISE(ABORT, 'sync queue unavailable'); END;",
            )
            .unwrap();
        }

        let err = update_carro_status(&db, id, "despachado").unwrap_err();
        assert!(err.contains("sync queue unavailable"), "{err}");
        assert_eq!(get_carro(&db, id).unwrap()["status"], "em_doca");
        assert_eq!(nota_state(&db, &nota).0, "embalada");

        let conn = db.conn.lock().unwrap();
        let queued_updates: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE entity_type = 'carro' AND payload LIKE '%despachado%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(queued_updates, 0);
    }

    #[test]
    fn test_cancel_detaches_notas() {
        let db = test_state();
        let carro = create_carro(&db, &serde_json::json!({})).unwrap();
        let id = carro["id"].as_str().unwrap();
        let nota = seed_nota(&db, Some(id), "embalada");

        let cancelled = update_carro_status(&db, id, "cancelado").unwrap();
        assert_eq!(cancelled["notasCount"], 0);
        assert_eq!(nota_state(&db, &nota), ("conferida".to_string(), None));
    }

    #[test]
    fn test_update_and_delete_rules() {
        let db = test_state();
        let carro = create_carro(&db, &serde_json::json!({ "doca": "D1" })).unwrap();
        let id = carro["id"].as_str().unwrap();

        let updated =
            update_carro(&db, id, &serde_json::json!({ "responsavel": "Ana", "doca": "" })).unwrap();
        assert_eq!(updated["responsavel"], "Ana");
        assert!(updated["doca"].is_null());

        seed_nota(&db, Some(id), "embalada");
        assert!(delete_carro(&db, id).is_err());

        let empty = create_carro(&db, &serde_json::json!({})).unwrap();
        let empty_id = empty["id"].as_str().unwrap();
        delete_carro(&db, empty_id).unwrap();
        assert!(get_carro(&db, empty_id).is_err());
    }

    #[test]
    fn test_mutations_enqueue_sync_rows() {
        let db = test_state();
        let carro = create_carro(&db, &serde_json::json!({})).unwrap();
        let id = carro["id"].as_str().unwrap();
        update_carro(&db, id, &serde_json::json!({ "doca": "D9" })).unwrap();

        let conn = db.conn.lock().unwrap();
        let ops: Vec<String> = conn
            .prepare("SELECT operation FROM sync_queue WHERE entity_type = 'carro' ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(ops, vec!["insert", "update"]);
    }

    #[test]
    fn test_list_filters_by_status() {
        let db = test_state();
        create_carro(&db, &serde_json::json!({})).unwrap();
        let b = create_carro(&db, &serde_json::json!({})).unwrap();
        update_carro_status(&db, b["id"].as_str().unwrap(), "cancelado").unwrap();

        let all = list_carros(&db, None).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);
        let cancelled = list_carros(&db, Some("cancelado")).unwrap();
        assert_eq!(cancelled.as_array().unwrap().len(), 1);
        assert!(list_carros(&db, Some("bogus")).is_err());
    }
}
