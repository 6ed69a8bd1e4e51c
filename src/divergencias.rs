//! Divergências: recorded mismatches between expected and actual nota data.
//!
//! Most rows are created automatically by the conferência flow in `notas`
//! (missing or extra volumes); operators can also record damage or unknown
//! notas by hand. Resolving the last open divergência of a `divergente` nota
//! returns it to `conferida`.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::{notas, now_rfc3339, sync, value_i64, value_str, wms};

pub const TIPO_VOLUME_FALTANTE: &str = "volume_faltante";
pub const TIPO_VOLUME_EXCEDENTE: &str = "volume_excedente";
pub const TIPO_AVARIA: &str = "avaria";
pub const TIPO_NOTA_NAO_ENCONTRADA: &str = "nota_nao_encontrada";
pub const TIPO_OUTRO: &str = "outro";

const ALL_TIPOS: &[&str] = &[
    TIPO_VOLUME_FALTANTE,
    TIPO_VOLUME_EXCEDENTE,
    TIPO_AVARIA,
    TIPO_NOTA_NAO_ENCONTRADA,
    TIPO_OUTRO,
];

pub const STATUS_ABERTA: &str = "aberta";
pub const STATUS_RESOLVIDA: &str = "resolvida";

const RESOLUCAO_VOLUMES_COMPLETOS: &str = "Volumes completos na conferência";

#[derive(Debug, Clone)]
pub struct NewDivergencia {
    pub nota_id: Option<String>,
    pub carro_id: Option<String>,
    pub tipo: String,
    pub esperado: Option<i64>,
    pub encontrado: Option<i64>,
    pub observacao: Option<String>,
}

const DIVERGENCIA_COLUMNS: &str = "id, nota_id, carro_id, tipo, esperado, encontrado, observacao,
     status, resolucao, resolvido_por, resolved_at, created_at, updated_at";

fn divergencia_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "notaId": row.get::<_, Option<String>>(1)?,
        "carroId": row.get::<_, Option<String>>(2)?,
        "tipo": row.get::<_, String>(3)?,
        "esperado": row.get::<_, Option<i64>>(4)?,
        "encontrado": row.get::<_, Option<i64>>(5)?,
        "observacao": row.get::<_, Option<String>>(6)?,
        "status": row.get::<_, String>(7)?,
        "resolucao": row.get::<_, Option<String>>(8)?,
        "resolvidoPor": row.get::<_, Option<String>>(9)?,
        "resolvedAt": row.get::<_, Option<String>>(10)?,
        "createdAt": row.get::<_, String>(11)?,
        "updatedAt": row.get::<_, String>(12)?,
    }))
}

fn load_locked(conn: &Connection, id: &str) -> Result<Value, String> {
    conn.query_row(
        &format!("SELECT {DIVERGENCIA_COLUMNS} FROM divergencias WHERE id = ?1"),
        params![id],
        divergencia_from_row,
    )
    .optional()
    .map_err(|e| format!("load divergencia: {e}"))?
    .ok_or_else(|| format!("Divergencia not found: {id}"))
}

fn enqueue_divergencia_sync(conn: &Connection, id: &str, operation: &str) -> Result<(), String> {
    let row = load_locked(conn, id)?;
    let payload = serde_json::json!({
        "id": row["id"],
        "nota_id": row["notaId"],
        "carro_id": row["carroId"],
        "tipo": row["tipo"],
        "esperado": row["esperado"],
        "encontrado": row["encontrado"],
        "observacao": row["observacao"],
        "status": row["status"],
        "resolucao": row["resolucao"],
        "resolvido_por": row["resolvidoPor"],
        "resolved_at": row["resolvedAt"],
        "created_at": row["createdAt"],
        "updated_at": row["updatedAt"],
    });
    sync::enqueue(conn, "divergencia", id, operation, &payload)
}

/// Insert a divergência while the caller holds the lock.
pub(crate) fn insert_locked(conn: &Connection, new: &NewDivergencia) -> Result<Value, String> {
    if !ALL_TIPOS.contains(&new.tipo.as_str()) {
        return Err(format!("Invalid divergencia tipo: {}", new.tipo));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO divergencias (id, nota_id, carro_id, tipo, esperado, encontrado, observacao,
                                   status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'aberta', ?8, ?8)",
        params![
            id,
            new.nota_id,
            new.carro_id,
            new.tipo,
            new.esperado,
            new.encontrado,
            new.observacao,
            now
        ],
    )
    .map_err(|e| format!("insert divergencia: {e}"))?;

    enqueue_divergencia_sync(conn, &id, "insert")?;
    info!(divergencia_id = %id, tipo = %new.tipo, nota_id = ?new.nota_id, "Divergencia recorded");
    load_locked(conn, &id)
}

pub(crate) fn list_locked(
    conn: &Connection,
    status: Option<&str>,
    nota_id: Option<&str>,
) -> Result<Vec<Value>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {DIVERGENCIA_COLUMNS} FROM divergencias
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR nota_id = ?2)
             ORDER BY created_at DESC"
        ))
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map(params![status, nota_id], divergencia_from_row)
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Record a divergência from the UI.
///
/// The nota must exist unless the tipo is `nota_nao_encontrada`. A nota with a
/// new divergência is marked `divergente` while it is still in conferência
/// (`recebida`, `em_conferencia`, `conferida`). Packed or shipped notas keep
/// their status; the divergência still references them and their cart.
pub fn record_divergencia(db: &DbState, payload: &Value) -> Result<Value, String> {
    let tipo = value_str(payload, &["tipo", "type"])
        .map(|t| t.to_lowercase())
        .ok_or("Missing tipo")?;
    let nota_id = value_str(payload, &["notaId", "nota_id"]);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let nota = match nota_id.as_deref() {
        Some(id) => Some(notas::load_nota(&conn, id)?),
        None if tipo == TIPO_NOTA_NAO_ENCONTRADA => None,
        None => return Err("Missing notaId".into()),
    };

    let carro_id = value_str(payload, &["carroId", "carro_id"]).or_else(|| {
        nota.as_ref()
            .and_then(|n| n["carroId"].as_str().map(|s| s.to_string()))
    });
    wms::in_transaction(&conn, || {
        let divergencia = insert_locked(
            &conn,
            &NewDivergencia {
                nota_id: nota_id.clone(),
                carro_id,
                tipo,
                esperado: value_i64(payload, &["esperado", "expected"]),
                encontrado: value_i64(payload, &["encontrado", "found"]),
                observacao: value_str(payload, &["observacao", "notes"]),
            },
        )?;

        if let (Some(id), Some(nota)) = (nota_id.as_deref(), nota.as_ref()) {
            let status = nota["status"].as_str().unwrap_or_default();
            if matches!(
                status,
                notas::STATUS_RECEBIDA | notas::STATUS_EM_CONFERENCIA | notas::STATUS_CONFERIDA
            ) {
                notas::set_status_locked(&conn, id, notas::STATUS_DIVERGENTE)?;
                notas::enqueue_nota_sync(&conn, id, "update")?;
            }
        }
        Ok(divergencia)
    })
}

pub fn list_divergencias(
    db: &DbState,
    status: Option<&str>,
    nota_id: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(serde_json::json!(list_locked(&conn, status, nota_id)?))
}

/// Close a divergência with its resolution text.
pub fn resolve_divergencia(
    db: &DbState,
    id: &str,
    resolucao: &str,
    resolvido_por: Option<&str>,
) -> Result<Value, String> {
    let resolucao = resolucao.trim();
    if resolucao.is_empty() {
        return Err("Missing resolucao".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let existing = load_locked(&conn, id)?;
    if existing["status"] == STATUS_RESOLVIDA {
        return Err(format!("Divergencia {id} already resolved"));
    }

    let nota_reopened = wms::in_transaction(&conn, || {
        let now = now_rfc3339();
        conn.execute(
            "UPDATE divergencias SET status = 'resolvida', resolucao = ?1, resolvido_por = ?2,
                    resolved_at = ?3, updated_at = ?3, sync_status = 'pending'
             WHERE id = ?4",
            params![resolucao, resolvido_por, now, id],
        )
        .map_err(|e| format!("resolve divergencia: {e}"))?;
        enqueue_divergencia_sync(&conn, id, "update")?;

        let Some(nota_id) = existing["notaId"].as_str() else {
            return Ok(false);
        };
        let open = count_open_for_nota(&conn, nota_id)?;
        let nota_status: Option<String> = conn
            .query_row(
                "SELECT status FROM notas_fiscais WHERE id = ?1",
                params![nota_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        if open == 0 && nota_status.as_deref() == Some(notas::STATUS_DIVERGENTE) {
            notas::set_status_locked(&conn, nota_id, notas::STATUS_CONFERIDA)?;
            notas::enqueue_nota_sync(&conn, nota_id, "update")?;
            return Ok(true);
        }
        Ok(false)
    })?;

    info!(divergencia_id = %id, nota_reopened, "Divergencia resolved");
    Ok(serde_json::json!({
        "success": true,
        "divergencia": load_locked(&conn, id)?,
        "notaConferida": nota_reopened,
    }))
}

/// Open divergências of one nota.
pub(crate) fn count_open_for_nota(conn: &Connection, nota_id: &str) -> Result<i64, String> {
    conn.query_row(
        "SELECT COUNT(*) FROM divergencias WHERE nota_id = ?1 AND status = ?2",
        params![nota_id, STATUS_ABERTA],
        |row| row.get(0),
    )
    .map_err(|e| format!("count open divergencias: {e}"))
}

/// Close the open `volume_faltante` divergências of a nota whose volumes
/// were all scanned after the conferência was finalized.
pub(crate) fn resolve_faltantes_locked(conn: &Connection, nota_id: &str) -> Result<usize, String> {
    let ids: Vec<String> = {
        let mut stmt = conn
            .prepare(
                "SELECT id FROM divergencias
                 WHERE nota_id = ?1 AND tipo = ?2 AND status = ?3",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(
                params![nota_id, TIPO_VOLUME_FALTANTE, STATUS_ABERTA],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?
            .filter_map(|r| r.ok())
            .collect();
        rows
    };
    let now = now_rfc3339();
    for id in &ids {
        conn.execute(
            "UPDATE divergencias SET status = 'resolvida', resolucao = ?1, resolvido_por = NULL,
                    resolved_at = ?2, updated_at = ?2, sync_status = 'pending'
             WHERE id = ?3",
            params![RESOLUCAO_VOLUMES_COMPLETOS, now, id],
        )
        .map_err(|e| format!("resolve faltante: {e}"))?;
        enqueue_divergencia_sync(conn, id, "update")?;
    }
    Ok(ids.len())
}

/// Count of open divergências (system health).
pub(crate) fn count_open(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT COUNT(*) FROM divergencias WHERE status = ?1",
        params![STATUS_ABERTA],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_state;

    fn received(db: &DbState, volumes: i64) -> String {
        let r = notas::receive_nota(db, &serde_json::json!({ "numero": "900", "volumes": volumes }))
            .unwrap();
        r["nota"]["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn test_record_requires_known_nota() {
        let db = test_state();
        assert!(record_divergencia(&db, &serde_json::json!({ "tipo": "avaria" })).is_err());
        assert!(record_divergencia(
            &db,
            &serde_json::json!({ "tipo": "avaria", "notaId": "missing" })
        )
        .is_err());

        let orphan = record_divergencia(
            &db,
            &serde_json::json!({ "tipo": "nota_nao_encontrada", "observacao": "NF 1234 sem cadastro" }),
        )
        .unwrap();
        assert!(orphan["notaId"].is_null());
        assert_eq!(orphan["status"], "aberta");
    }

    #[test]
    fn test_record_rejects_unknown_tipo() {
        let db = test_state();
        let nota_id = received(&db, 1);
        let err = record_divergencia(&db, &serde_json::json!({ "tipo": "sumiu", "notaId": nota_id }))
            .unwrap_err();
        assert!(err.contains("Invalid divergencia tipo"));
    }

    #[test]
    fn test_record_marks_nota_divergente_and_resolution_restores() {
        let db = test_state();
        let nota_id = received(&db, 1);
        notas::conferir_volume(&db, &nota_id).unwrap();

        let d = record_divergencia(
            &db,
            &serde_json::json!({ "tipo": "AVARIA", "notaId": nota_id, "observacao": "caixa amassada" }),
        )
        .unwrap();
        assert_eq!(d["tipo"], "avaria");
        assert_eq!(
            notas::get_nota(&db, &nota_id).unwrap()["status"],
            "divergente"
        );

        let resolved =
            resolve_divergencia(&db, d["id"].as_str().unwrap(), "Cliente aceitou", Some("Bia"))
                .unwrap();
        assert_eq!(resolved["divergencia"]["status"], "resolvida");
        assert_eq!(resolved["divergencia"]["resolvidoPor"], "Bia");
        assert_eq!(resolved["notaConferida"], true);
        assert_eq!(
            notas::get_nota(&db, &nota_id).unwrap()["status"],
            "conferida"
        );
    }

    #[test]
    fn test_packed_nota_keeps_status_but_divergencia_has_cart() {
        let db = test_state();
        let nota_id = received(&db, 1);
        notas::conferir_volume(&db, &nota_id).unwrap();
        let carro = crate::carros::create_carro(&db, &serde_json::json!({})).unwrap();
        let carro_id = carro["id"].as_str().unwrap().to_string();
        notas::assign_nota_to_carro(&db, &nota_id, &carro_id).unwrap();

        let d = record_divergencia(&db, &serde_json::json!({ "tipo": "avaria", "notaId": nota_id }))
            .unwrap();
        assert_eq!(d["carroId"], carro_id.as_str());
        assert_eq!(notas::get_nota(&db, &nota_id).unwrap()["status"], "embalada");

        let resolved = resolve_divergencia(&db, d["id"].as_str().unwrap(), "Trocada", None).unwrap();
        assert_eq!(resolved["notaConferida"], false);
        assert_eq!(notas::get_nota(&db, &nota_id).unwrap()["status"], "embalada");
    }

    #[test]
    fn test_nota_stays_divergente_while_others_open() {
        let db = test_state();
        let nota_id = received(&db, 1);
        let a = record_divergencia(&db, &serde_json::json!({ "tipo": "avaria", "notaId": nota_id }))
            .unwrap();
        record_divergencia(&db, &serde_json::json!({ "tipo": "outro", "notaId": nota_id })).unwrap();

        let resolved = resolve_divergencia(&db, a["id"].as_str().unwrap(), "ok", None).unwrap();
        assert_eq!(resolved["notaConferida"], false);

        let open = list_divergencias(&db, Some("aberta"), Some(&nota_id)).unwrap();
        assert_eq!(open.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_twice_or_blank_fails() {
        let db = test_state();
        let nota_id = received(&db, 1);
        let d = record_divergencia(&db, &serde_json::json!({ "tipo": "avaria", "notaId": nota_id }))
            .unwrap();
        let id = d["id"].as_str().unwrap();

        assert!(resolve_divergencia(&db, id, "   ", None).is_err());
        resolve_divergencia(&db, id, "ok", None).unwrap();
        let err = resolve_divergencia(&db, id, "again", None).unwrap_err();
        assert!(err.contains("already resolved"));

        let conn = db.conn.lock().unwrap();
        assert_eq!(count_open(&conn), 0);
    }
}
