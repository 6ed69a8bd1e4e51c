//! Local data consistency checks and repair.
//!
//! Remote pulls, interrupted writes and manual edits can leave the local
//! database inconsistent. `verify_data` reports what is wrong without
//! touching anything; `repair_data` fixes the mechanical issues (occupancy
//! counters, dangling cart references) and leaves the rest to an operator.

use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::db::DbState;
use crate::{carros, divergencias, notas, now_rfc3339, wms};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub code: &'static str,
    pub entity_type: &'static str,
    pub entity_id: String,
    pub message: String,
    pub repairable: bool,
}

fn query_issues(
    conn: &Connection,
    sql: &str,
    build: impl Fn(&rusqlite::Row<'_>) -> rusqlite::Result<Issue>,
) -> Result<Vec<Issue>, String> {
    let mut stmt = conn.prepare(sql).map_err(|e| format!("prepare check: {e}"))?;
    let rows = stmt
        .query_map([], |row| build(row))
        .map_err(|e| format!("run check: {e}"))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("read check: {e}"))
}

pub(crate) fn collect_issues(conn: &Connection) -> Result<Vec<Issue>, String> {
    let mut issues = Vec::new();

    issues.extend(query_issues(
        conn,
        "SELECT n.id, n.numero, n.carro_id FROM notas_fiscais n
         WHERE n.carro_id IS NOT NULL
           AND NOT EXISTS (SELECT 1 FROM carros c WHERE c.id = n.carro_id)",
        |row| {
            let numero: String = row.get(1)?;
            let carro_id: String = row.get(2)?;
            Ok(Issue {
                code: "nota_missing_carro",
                entity_type: "nota",
                entity_id: row.get(0)?,
                message: format!("Nota {numero} references missing carro {carro_id}"),
                repairable: true,
            })
        },
    )?);

    issues.extend(query_issues(
        conn,
        "SELECT id, numero FROM notas_fiscais WHERE status = 'embalada' AND carro_id IS NULL",
        |row| {
            let numero: String = row.get(1)?;
            Ok(Issue {
                code: "embalada_without_carro",
                entity_type: "nota",
                entity_id: row.get(0)?,
                message: format!("Nota {numero} is embalada but not on a carro"),
                repairable: false,
            })
        },
    )?);

    issues.extend(query_issues(
        conn,
        "SELECT p.id, p.codigo, p.ocupacao,
                COALESCE((SELECT SUM(a.volumes) FROM wms_alocacoes a
                          WHERE a.posicao_id = p.id AND a.released_at IS NULL), 0) AS alocado
         FROM wms_posicoes p
         WHERE p.ocupacao <> COALESCE((SELECT SUM(a.volumes) FROM wms_alocacoes a
                                       WHERE a.posicao_id = p.id AND a.released_at IS NULL), 0)",
        |row| {
            let codigo: String = row.get(1)?;
            let ocupacao: i64 = row.get(2)?;
            let alocado: i64 = row.get(3)?;
            Ok(Issue {
                code: "ocupacao_mismatch",
                entity_type: "posicao",
                entity_id: row.get(0)?,
                message: format!(
                    "Posicao {codigo} records {ocupacao} volumes but allocations sum to {alocado}"
                ),
                repairable: true,
            })
        },
    )?);

    issues.extend(query_issues(
        conn,
        "SELECT id, codigo, ocupacao, capacidade FROM wms_posicoes WHERE ocupacao > capacidade",
        |row| {
            let codigo: String = row.get(1)?;
            let ocupacao: i64 = row.get(2)?;
            let capacidade: i64 = row.get(3)?;
            Ok(Issue {
                code: "posicao_over_capacity",
                entity_type: "posicao",
                entity_id: row.get(0)?,
                message: format!("Posicao {codigo} holds {ocupacao} of {capacidade} volumes"),
                repairable: false,
            })
        },
    )?);

    issues.extend(query_issues(
        conn,
        "SELECT c.id, c.codigo FROM carros c
         WHERE c.status = 'pronto'
           AND NOT EXISTS (SELECT 1 FROM notas_fiscais n WHERE n.carro_id = c.id)",
        |row| {
            let codigo: String = row.get(1)?;
            Ok(Issue {
                code: "pronto_carro_empty",
                entity_type: "carro",
                entity_id: row.get(0)?,
                message: format!("Carro {codigo} is pronto but has no notas"),
                repairable: false,
            })
        },
    )?);

    issues.extend(query_issues(
        conn,
        "SELECT n.id, n.numero, COUNT(d.id) FROM notas_fiscais n
         JOIN divergencias d ON d.nota_id = n.id AND d.status = 'aberta'
         WHERE n.status = 'conferida'
         GROUP BY n.id, n.numero",
        |row| {
            let numero: String = row.get(1)?;
            let abertas: i64 = row.get(2)?;
            Ok(Issue {
                code: "conferida_with_open_divergencias",
                entity_type: "nota",
                entity_id: row.get(0)?,
                message: format!("Nota {numero} is conferida with {abertas} open divergencias"),
                repairable: false,
            })
        },
    )?);

    Ok(issues)
}

/// Report local inconsistencies.
pub fn verify_data(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let issues = collect_issues(&conn)?;
    if !issues.is_empty() {
        warn!(count = issues.len(), "Data verification found issues");
    }
    Ok(serde_json::json!({
        "ok": issues.is_empty(),
        "issueCount": issues.len(),
        "issues": issues,
        "checkedAt": now_rfc3339(),
    }))
}

/// Recompute position occupancy from active allocations and clear cart
/// references that point nowhere. Running it twice changes nothing the
/// second time.
pub fn repair_data(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let now = now_rfc3339();

    let (posicoes, notas_fixed) = wms::in_transaction(&conn, || {
        let mismatched: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT p.id FROM wms_posicoes p
                     WHERE p.ocupacao <> COALESCE((SELECT SUM(a.volumes) FROM wms_alocacoes a
                                                   WHERE a.posicao_id = p.id AND a.released_at IS NULL), 0)",
                )
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| e.to_string())?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())?
        };
        for id in &mismatched {
            conn.execute(
                "UPDATE wms_posicoes
                 SET ocupacao = COALESCE((SELECT SUM(volumes) FROM wms_alocacoes
                                          WHERE posicao_id = ?1 AND released_at IS NULL), 0),
                     updated_at = ?2, sync_status = 'pending'
                 WHERE id = ?1",
                params![id, now],
            )
            .map_err(|e| format!("repair ocupacao: {e}"))?;
            wms::enqueue_posicao_sync(&conn, id, "update")?;
        }

        let dangling: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT n.id FROM notas_fiscais n
                     WHERE n.carro_id IS NOT NULL
                       AND NOT EXISTS (SELECT 1 FROM carros c WHERE c.id = n.carro_id)",
                )
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| e.to_string())?;
            rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())?
        };
        for id in &dangling {
            conn.execute(
                "UPDATE notas_fiscais
                 SET carro_id = NULL,
                     status = CASE WHEN status = ?3 THEN ?4 ELSE status END,
                     updated_at = ?1, sync_status = 'pending'
                 WHERE id = ?2",
                params![now, id, notas::STATUS_EMBALADA, notas::STATUS_CONFERIDA],
            )
            .map_err(|e| format!("clear carro ref: {e}"))?;
            notas::enqueue_nota_sync(&conn, id, "update")?;
        }

        Ok((mismatched.len(), dangling.len()))
    })?;

    let remaining = collect_issues(&conn)?;
    info!(
        posicoes_recomputed = posicoes,
        carro_refs_cleared = notas_fixed,
        remaining = remaining.len(),
        "Data repair finished"
    );

    Ok(serde_json::json!({
        "success": true,
        "posicoesRecomputed": posicoes,
        "carroRefsCleared": notas_fixed,
        "remainingIssues": remaining,
    }))
}

/// Counts used by the diagnostics snapshot.
pub(crate) fn entity_counts(conn: &Connection) -> Value {
    let count = |sql: &str| -> i64 { conn.query_row(sql, [], |row| row.get(0)).unwrap_or(0) };
    serde_json::json!({
        "carros": count("SELECT COUNT(*) FROM carros"),
        "carrosAbertos": count(&format!(
            "SELECT COUNT(*) FROM carros WHERE status NOT IN ('{}', '{}')",
            carros::STATUS_DESPACHADO,
            carros::STATUS_CANCELADO
        )),
        "notas": count("SELECT COUNT(*) FROM notas_fiscais"),
        "divergenciasAbertas": divergencias::count_open(conn),
        "posicoes": count("SELECT COUNT(*) FROM wms_posicoes"),
        "alocacoesAtivas": count("SELECT COUNT(*) FROM wms_alocacoes WHERE released_at IS NULL"),
        "messages": count("SELECT COUNT(*) FROM messages"),
        "printJobsPending": count("SELECT COUNT(*) FROM print_jobs WHERE status = 'pending'"),
    })
}
