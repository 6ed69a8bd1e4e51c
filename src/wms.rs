//! Storage positions and put-away.
//!
//! A position is addressed `RUA-PREDIO-NIVEL-APTO` (e.g. `A-01-02-03`).
//! Capacity and occupancy are counted in volumes; an allocation ties a nota
//! to a position until it is released.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::{notas, now_rfc3339, sync, value_i64, value_str};

const DEFAULT_SUGGESTIONS: i64 = 5;
const MAX_SUGGESTIONS: i64 = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PosicaoCodeError {
    #[error("position code must have 4 parts (RUA-PREDIO-NIVEL-APTO), got {0}")]
    PartCount(usize),
    #[error("empty {0} in position code")]
    EmptyPart(&'static str),
    #[error("nivel must be numeric: {0}")]
    Nivel(String),
    #[error("invalid character in position code: {0:?}")]
    InvalidChar(char),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodigoPosicao {
    pub codigo: String,
    pub rua: String,
    pub predio: String,
    pub nivel: i64,
    pub apartamento: String,
}

/// Parse and normalize a position code. Parts are upper-cased; the nivel
/// keeps its written form in `codigo` but is also exposed as a number.
pub fn parse_codigo_posicao(raw: &str) -> Result<CodigoPosicao, PosicaoCodeError> {
    let upper = raw.trim().to_uppercase();
    let parts: Vec<&str> = upper.split('-').map(str::trim).collect();
    if parts.len() != 4 {
        return Err(PosicaoCodeError::PartCount(parts.len()));
    }
    for (part, name) in parts.iter().zip(["rua", "predio", "nivel", "apartamento"]) {
        if part.is_empty() {
            return Err(PosicaoCodeError::EmptyPart(name));
        }
        if let Some(c) = part.chars().find(|c| !c.is_ascii_alphanumeric()) {
            return Err(PosicaoCodeError::InvalidChar(c));
        }
    }
    let nivel: i64 = parts[2]
        .parse()
        .map_err(|_| PosicaoCodeError::Nivel(parts[2].to_string()))?;

    Ok(CodigoPosicao {
        codigo: parts.join("-"),
        rua: parts[0].to_string(),
        predio: parts[1].to_string(),
        nivel,
        apartamento: parts[3].to_string(),
    })
}

/// Normalize a compatibility list to a sorted, deduplicated, comma-joined
/// set of lower-case categories.
fn normalize_compatibilidade(value: &Value) -> String {
    let mut items: Vec<String> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_lowercase())
            .collect(),
        Value::String(s) => s.split(',').map(|s| s.trim().to_lowercase()).collect(),
        _ => Vec::new(),
    };
    items.retain(|s| !s.is_empty());
    items.sort();
    items.dedup();
    items.join(",")
}

fn accepts(compatibilidade: &str, categoria: Option<&str>) -> bool {
    match categoria {
        None => true,
        Some(_) if compatibilidade.is_empty() => true,
        Some(cat) => compatibilidade.split(',').any(|c| c == cat),
    }
}

const POSICAO_COLUMNS: &str = "id, codigo, rua, predio, nivel, apartamento, capacidade, ocupacao,
    compatibilidade, ativo, created_at, updated_at, sync_status";

fn posicao_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let compat: String = row.get(8)?;
    let capacidade: i64 = row.get(6)?;
    let ocupacao: i64 = row.get(7)?;
    let compat_list: Vec<&str> = compat.split(',').filter(|s| !s.is_empty()).collect();
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "codigo": row.get::<_, String>(1)?,
        "rua": row.get::<_, String>(2)?,
        "predio": row.get::<_, String>(3)?,
        "nivel": row.get::<_, i64>(4)?,
        "apartamento": row.get::<_, String>(5)?,
        "capacidade": capacidade,
        "ocupacao": ocupacao,
        "livre": capacidade - ocupacao,
        "compatibilidade": compat_list,
        "ativo": row.get::<_, i64>(9)? != 0,
        "createdAt": row.get::<_, String>(10)?,
        "updatedAt": row.get::<_, String>(11)?,
        "syncStatus": row.get::<_, String>(12)?,
    }))
}

pub(crate) fn load_posicao(conn: &Connection, id: &str) -> Result<Value, String> {
    conn.query_row(
        &format!("SELECT {POSICAO_COLUMNS} FROM wms_posicoes WHERE id = ?1"),
        params![id],
        posicao_from_row,
    )
    .optional()
    .map_err(|e| format!("load posicao: {e}"))?
    .ok_or_else(|| format!("Posicao not found: {id}"))
}

pub(crate) fn enqueue_posicao_sync(conn: &Connection, id: &str, operation: &str) -> Result<(), String> {
    let row = load_posicao(conn, id)?;
    let payload = serde_json::json!({
        "id": row["id"],
        "codigo": row["codigo"],
        "rua": row["rua"],
        "predio": row["predio"],
        "nivel": row["nivel"],
        "apartamento": row["apartamento"],
        "capacidade": row["capacidade"],
        "ocupacao": row["ocupacao"],
        "compatibilidade": row["compatibilidade"],
        "ativo": row["ativo"],
        "created_at": row["createdAt"],
        "updated_at": row["updatedAt"],
    });
    sync::enqueue(conn, "wms_posicao", id, operation, &payload)
}

fn alocacao_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "posicaoId": row.get::<_, String>(1)?,
        "notaId": row.get::<_, String>(2)?,
        "volumes": row.get::<_, i64>(3)?,
        "createdAt": row.get::<_, String>(4)?,
        "releasedAt": row.get::<_, Option<String>>(5)?,
    }))
}

fn load_alocacao(conn: &Connection, id: &str) -> Result<Option<Value>, String> {
    conn.query_row(
        "SELECT id, posicao_id, nota_id, volumes, created_at, released_at
         FROM wms_alocacoes WHERE id = ?1",
        params![id],
        alocacao_from_row,
    )
    .optional()
    .map_err(|e| format!("load alocacao: {e}"))
}

fn enqueue_alocacao_sync(conn: &Connection, id: &str, operation: &str) -> Result<(), String> {
    let row = load_alocacao(conn, id)?.ok_or_else(|| format!("Alocacao not found: {id}"))?;
    let payload = serde_json::json!({
        "id": row["id"],
        "posicao_id": row["posicaoId"],
        "nota_id": row["notaId"],
        "volumes": row["volumes"],
        "created_at": row["createdAt"],
        "released_at": row["releasedAt"],
    });
    sync::enqueue(conn, "wms_alocacao", id, operation, &payload)
}

/// Run `f` inside `BEGIN IMMEDIATE`, committing on success.
pub(crate) fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce() -> Result<T, String>,
) -> Result<T, String> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;
    match f() {
        Ok(value) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

pub fn create_posicao(db: &DbState, payload: &Value) -> Result<Value, String> {
    let raw = value_str(payload, &["codigo", "code"]).ok_or("Missing position codigo")?;
    let parsed = parse_codigo_posicao(&raw).map_err(|e| e.to_string())?;
    let capacidade = value_i64(payload, &["capacidade", "capacity"]).unwrap_or(1);
    if capacidade < 1 {
        return Err("capacidade must be at least 1".into());
    }
    let compat = payload
        .get("compatibilidade")
        .or_else(|| payload.get("compatibility"))
        .map(normalize_compatibilidade)
        .unwrap_or_default();

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let exists = conn
        .query_row(
            "SELECT 1 FROM wms_posicoes WHERE codigo = ?1",
            params![parsed.codigo],
            |_| Ok(()),
        )
        .optional()
        .map_err(|e| e.to_string())?
        .is_some();
    if exists {
        return Err(format!("Posicao {} already exists", parsed.codigo));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO wms_posicoes (id, codigo, rua, predio, nivel, apartamento, capacidade,
                                   compatibilidade, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            id,
            parsed.codigo,
            parsed.rua,
            parsed.predio,
            parsed.nivel,
            parsed.apartamento,
            capacidade,
            compat,
            now
        ],
    )
    .map_err(|e| format!("insert posicao: {e}"))?;

    enqueue_posicao_sync(&conn, &id, "insert")?;
    info!(posicao_id = %id, codigo = %parsed.codigo, capacidade, "Posicao created");
    load_posicao(&conn, &id)
}

pub fn list_posicoes(db: &DbState, rua: Option<&str>, only_free: bool) -> Result<Value, String> {
    let rua = rua.map(|r| r.trim().to_uppercase()).filter(|r| !r.is_empty());
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {POSICAO_COLUMNS} FROM wms_posicoes
             WHERE (?1 IS NULL OR rua = ?1)
               AND (?2 = 0 OR (ativo = 1 AND ocupacao < capacidade))
             ORDER BY rua, predio, nivel, apartamento"
        ))
        .map_err(|e| e.to_string())?;
    let rows: Vec<Value> = stmt
        .query_map(params![rua, only_free as i64], posicao_from_row)
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Value::Array(rows))
}

pub fn update_posicao(db: &DbState, id: &str, payload: &Value) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let current = load_posicao(&conn, id)?;

    let capacidade = match value_i64(payload, &["capacidade", "capacity"]) {
        Some(c) => {
            let ocupacao = current["ocupacao"].as_i64().unwrap_or(0);
            if c < 1 {
                return Err("capacidade must be at least 1".into());
            }
            if c < ocupacao {
                return Err(format!(
                    "capacidade {c} is below current ocupacao {ocupacao}"
                ));
            }
            Some(c)
        }
        None => None,
    };
    let compat = payload
        .get("compatibilidade")
        .or_else(|| payload.get("compatibility"))
        .map(normalize_compatibilidade);
    let ativo = payload
        .get("ativo")
        .or_else(|| payload.get("active"))
        .and_then(Value::as_bool);

    conn.execute(
        "UPDATE wms_posicoes SET
            capacidade = COALESCE(?1, capacidade),
            compatibilidade = COALESCE(?2, compatibilidade),
            ativo = COALESCE(?3, ativo),
            updated_at = ?4,
            sync_status = 'pending'
         WHERE id = ?5",
        params![capacidade, compat, ativo.map(|a| a as i64), now_rfc3339(), id],
    )
    .map_err(|e| format!("update posicao: {e}"))?;

    enqueue_posicao_sync(&conn, id, "update")?;
    load_posicao(&conn, id)
}

// ---------------------------------------------------------------------------
// Put-away
// ---------------------------------------------------------------------------

/// Candidate positions for `volumes`, best fit first.
pub fn suggest_posicoes(
    db: &DbState,
    volumes: i64,
    categoria: Option<&str>,
    limit: Option<i64>,
) -> Result<Value, String> {
    if volumes < 1 {
        return Err("volumes must be at least 1".into());
    }
    let categoria = categoria
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty());
    let limit = limit.unwrap_or(DEFAULT_SUGGESTIONS).clamp(1, MAX_SUGGESTIONS) as usize;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {POSICAO_COLUMNS} FROM wms_posicoes
             WHERE ativo = 1 AND capacidade - ocupacao >= ?1
             ORDER BY capacidade - ocupacao - ?1 ASC, nivel ASC, codigo ASC"
        ))
        .map_err(|e| e.to_string())?;
    let candidates: Vec<Value> = stmt
        .query_map(params![volumes], posicao_from_row)
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .filter(|p| {
            let compat: Vec<&str> = p["compatibilidade"]
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            accepts(&compat.join(","), categoria.as_deref())
        })
        .take(limit)
        .collect();
    Ok(Value::Array(candidates))
}

/// Allocate `volumes` of a nota to a position.
pub fn alocar(db: &DbState, nota_id: &str, posicao_id: &str, volumes: i64) -> Result<Value, String> {
    if volumes < 1 {
        return Err("volumes must be at least 1".into());
    }
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    notas::load_nota(&conn, nota_id)?;

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    in_transaction(&conn, || {
        let (capacidade, ocupacao, ativo): (i64, i64, i64) = conn
            .query_row(
                "SELECT capacidade, ocupacao, ativo FROM wms_posicoes WHERE id = ?1",
                params![posicao_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("Posicao not found: {posicao_id}"))?;
        if ativo == 0 {
            return Err("Posicao is inactive".to_string());
        }
        if capacidade - ocupacao < volumes {
            return Err(format!(
                "Posicao has {} free volume(s), {volumes} requested",
                capacidade - ocupacao
            ));
        }
        conn.execute(
            "UPDATE wms_posicoes SET ocupacao = ocupacao + ?1, updated_at = ?2, sync_status = 'pending'
             WHERE id = ?3",
            params![volumes, now, posicao_id],
        )
        .map_err(|e| format!("update ocupacao: {e}"))?;
        conn.execute(
            "INSERT INTO wms_alocacoes (id, posicao_id, nota_id, volumes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, posicao_id, nota_id, volumes, now],
        )
        .map_err(|e| format!("insert alocacao: {e}"))?;
        Ok(())
    })?;

    enqueue_alocacao_sync(&conn, &id, "insert")?;
    enqueue_posicao_sync(&conn, posicao_id, "update")?;
    info!(alocacao_id = %id, nota_id, posicao_id, volumes, "Volumes allocated");

    Ok(serde_json::json!({
        "alocacao": load_alocacao(&conn, &id)?,
        "posicao": load_posicao(&conn, posicao_id)?,
    }))
}

/// Release an allocation, returning its volumes to the position.
pub fn liberar(db: &DbState, alocacao_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let alocacao =
        load_alocacao(&conn, alocacao_id)?.ok_or_else(|| format!("Alocacao not found: {alocacao_id}"))?;
    if !alocacao["releasedAt"].is_null() {
        return Err(format!("Alocacao {alocacao_id} was already released"));
    }
    let posicao_id = alocacao["posicaoId"].as_str().unwrap_or_default().to_string();
    let volumes = alocacao["volumes"].as_i64().unwrap_or(0);

    let now = now_rfc3339();
    in_transaction(&conn, || {
        let changed = conn
            .execute(
                "UPDATE wms_alocacoes SET released_at = ?1, sync_status = 'pending'
                 WHERE id = ?2 AND released_at IS NULL",
                params![now, alocacao_id],
            )
            .map_err(|e| format!("release alocacao: {e}"))?;
        if changed == 0 {
            return Err(format!("Alocacao {alocacao_id} was already released"));
        }
        conn.execute(
            "UPDATE wms_posicoes SET ocupacao = MAX(ocupacao - ?1, 0), updated_at = ?2,
                    sync_status = 'pending'
             WHERE id = ?3",
            params![volumes, now, posicao_id],
        )
        .map_err(|e| format!("update ocupacao: {e}"))?;
        Ok(())
    })?;

    enqueue_alocacao_sync(&conn, alocacao_id, "update")?;
    enqueue_posicao_sync(&conn, &posicao_id, "update")?;
    info!(alocacao_id, posicao_id = %posicao_id, volumes, "Alocacao released");

    Ok(serde_json::json!({
        "alocacao": load_alocacao(&conn, alocacao_id)?,
        "posicao": load_posicao(&conn, &posicao_id)?,
    }))
}

/// Open allocations, optionally for one nota or one position.
pub fn list_alocacoes(
    db: &DbState,
    nota_id: Option<&str>,
    posicao_id: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT id, posicao_id, nota_id, volumes, created_at, released_at
             FROM wms_alocacoes
             WHERE released_at IS NULL
               AND (?1 IS NULL OR nota_id = ?1)
               AND (?2 IS NULL OR posicao_id = ?2)
             ORDER BY created_at ASC",
        )
        .map_err(|e| e.to_string())?;
    let rows: Vec<Value> = stmt
        .query_map(params![nota_id, posicao_id], alocacao_from_row)
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Value::Array(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_state;

    fn posicao(db: &DbState, codigo: &str, capacidade: i64, compat: &str) -> String {
        create_posicao(
            db,
            &serde_json::json!({ "codigo": codigo, "capacidade": capacidade, "compatibilidade": compat }),
        )
        .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    fn nota(db: &DbState) -> String {
        notas::receive_nota(db, &serde_json::json!({ "numero": "123", "volumes": 4 })).unwrap()["nota"]
            ["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_parse_codigo_posicao() {
        let p = parse_codigo_posicao(" a-01-02-3b ").unwrap();
        assert_eq!(p.codigo, "A-01-02-3B");
        assert_eq!(p.rua, "A");
        assert_eq!(p.nivel, 2);
        assert_eq!(p.apartamento, "3B");

        assert_eq!(parse_codigo_posicao("A-01-02"), Err(PosicaoCodeError::PartCount(3)));
        assert_eq!(parse_codigo_posicao("A--02-03"), Err(PosicaoCodeError::EmptyPart("predio")));
        assert_eq!(
            parse_codigo_posicao("A-01-X-03"),
            Err(PosicaoCodeError::Nivel("X".into()))
        );
        assert_eq!(parse_codigo_posicao("A-01-02-0/3"), Err(PosicaoCodeError::InvalidChar('/')));
    }

    #[test]
    fn test_create_rejects_duplicates_and_bad_capacity() {
        let db = test_state();
        posicao(&db, "A-01-01-01", 10, "");
        assert!(create_posicao(&db, &serde_json::json!({ "codigo": "a-01-01-01", "capacidade": 3 })).is_err());
        assert!(create_posicao(&db, &serde_json::json!({ "codigo": "A-01-01-02", "capacidade": 0 })).is_err());
    }

    #[test]
    fn test_suggest_best_fit_order() {
        let db = test_state();
        posicao(&db, "A-01-03-01", 10, "");
        posicao(&db, "A-01-02-01", 5, "");
        posicao(&db, "A-01-01-02", 5, "");
        posicao(&db, "A-01-01-01", 2, "");
        posicao(&db, "B-01-01-01", 5, "refrigerado");

        let picks = suggest_posicoes(&db, 4, Some("seco"), None).unwrap();
        let codes: Vec<&str> = picks
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["codigo"].as_str().unwrap())
            .collect();
        assert_eq!(codes, vec!["A-01-01-02", "A-01-02-01", "A-01-03-01"]);

        let cold = suggest_posicoes(&db, 4, Some("Refrigerado"), Some(1)).unwrap();
        assert_eq!(cold.as_array().unwrap().len(), 1);
        assert_eq!(cold[0]["codigo"], "A-01-01-02");

        assert!(suggest_posicoes(&db, 0, None, None).is_err());
    }

    #[test]
    fn test_alocar_and_liberar() {
        let db = test_state();
        let pos = posicao(&db, "A-01-01-01", 5, "seco,fragil");
        let nota_id = nota(&db);

        let first = alocar(&db, &nota_id, &pos, 3).unwrap();
        assert_eq!(first["posicao"]["ocupacao"], 3);
        assert!(alocar(&db, &nota_id, &pos, 3).is_err());
        assert!(alocar(&db, "missing", &pos, 1).is_err());

        let open = list_alocacoes(&db, Some(&nota_id), None).unwrap();
        assert_eq!(open.as_array().unwrap().len(), 1);

        let alocacao_id = first["alocacao"]["id"].as_str().unwrap().to_string();
        let released = liberar(&db, &alocacao_id).unwrap();
        assert_eq!(released["posicao"]["ocupacao"], 0);
        assert!(!released["alocacao"]["releasedAt"].is_null());
        assert!(liberar(&db, &alocacao_id).is_err());
        assert!(list_alocacoes(&db, Some(&nota_id), None).unwrap().as_array().unwrap().is_empty());
    }

    #[test]
    fn test_update_capacity_not_below_occupancy() {
        let db = test_state();
        let pos = posicao(&db, "A-01-01-01", 5, "");
        let nota_id = nota(&db);
        alocar(&db, &nota_id, &pos, 4).unwrap();

        assert!(update_posicao(&db, &pos, &serde_json::json!({ "capacidade": 3 })).is_err());
        let updated = update_posicao(
            &db,
            &pos,
            &serde_json::json!({ "capacidade": 4, "compatibilidade": ["Seco", "seco"], "ativo": false }),
        )
        .unwrap();
        assert_eq!(updated["capacidade"], 4);
        assert_eq!(updated["compatibilidade"], serde_json::json!(["seco"]));
        assert_eq!(updated["ativo"], false);

        assert!(list_posicoes(&db, Some("a"), true).unwrap().as_array().unwrap().is_empty());
        assert_eq!(list_posicoes(&db, Some("a"), false).unwrap().as_array().unwrap().len(), 1);
    }
}
