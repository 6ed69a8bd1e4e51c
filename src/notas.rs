//! Notas fiscais: receiving, volume check ("conferência") and packaging.
//!
//! A nota is usually identified by its 44-digit NF-e access key (`chave`),
//! scanned from the DANFE barcode. Status flow:
//!
//! ```text
//! recebida -> em_conferencia -> conferida | divergente -> embalada -> expedida
//! ```
//!
//! Volume mismatches found during conferência are recorded as divergências.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::{
    carros, divergencias, now_rfc3339, scanner, sync, value_f64, value_i64, value_str, wms,
};

pub const STATUS_RECEBIDA: &str = "recebida";
pub const STATUS_EM_CONFERENCIA: &str = "em_conferencia";
pub const STATUS_CONFERIDA: &str = "conferida";
pub const STATUS_DIVERGENTE: &str = "divergente";
pub const STATUS_EMBALADA: &str = "embalada";
pub const STATUS_EXPEDIDA: &str = "expedida";

const CHAVE_LEN: usize = 44;

// ---------------------------------------------------------------------------
// NF-e access key
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum ChaveError {
    #[error("access key must have 44 digits, got {0}")]
    Length(usize),
    #[error("access key check digit mismatch: expected {expected}, found {found}")]
    CheckDigit { expected: u32, found: u32 },
}

/// Fields encoded in an NF-e access key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaveNfe {
    pub chave: String,
    pub uf: String,
    pub ano_mes: String,
    pub cnpj: String,
    pub modelo: String,
    pub serie: String,
    pub numero: String,
    pub tipo_emissao: String,
    pub codigo: String,
    pub dv: u32,
}

/// Modulo-11 check digit over the first 43 digits of a key.
pub fn chave_check_digit(digits: &[u32]) -> u32 {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, d)| d * (2 + (i as u32 % 8)))
        .sum();
    match 11 - (sum % 11) {
        10 | 11 => 0,
        dv => dv,
    }
}

/// Parse a scanned access key. Non-digit characters (spaces, dots) are
/// ignored so keys copied from a printed DANFE parse as-is.
pub fn parse_chave(raw: &str) -> Result<ChaveNfe, ChaveError> {
    let chave: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if chave.len() != CHAVE_LEN {
        return Err(ChaveError::Length(chave.len()));
    }

    let digits: Vec<u32> = chave.chars().filter_map(|c| c.to_digit(10)).collect();
    let expected = chave_check_digit(&digits[..CHAVE_LEN - 1]);
    let found = digits[CHAVE_LEN - 1];
    if expected != found {
        return Err(ChaveError::CheckDigit { expected, found });
    }

    let numero = chave[25..34].trim_start_matches('0');
    let serie = chave[22..25].trim_start_matches('0');
    Ok(ChaveNfe {
        uf: chave[0..2].to_string(),
        ano_mes: chave[2..6].to_string(),
        cnpj: chave[6..20].to_string(),
        modelo: chave[20..22].to_string(),
        serie: if serie.is_empty() { "0" } else { serie }.to_string(),
        numero: if numero.is_empty() { "0" } else { numero }.to_string(),
        tipo_emissao: chave[34..35].to_string(),
        codigo: chave[35..43].to_string(),
        dv: found,
        chave,
    })
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const NOTA_COLUMNS: &str = "id, chave, numero, serie, emitente_cnpj, emitente_nome, destinatario,
     volumes, volumes_conferidos, peso_kg, status, carro_id, created_at, updated_at, sync_status";

fn nota_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "chave": row.get::<_, Option<String>>(1)?,
        "numero": row.get::<_, String>(2)?,
        "serie": row.get::<_, Option<String>>(3)?,
        "emitenteCnpj": row.get::<_, Option<String>>(4)?,
        "emitenteNome": row.get::<_, Option<String>>(5)?,
        "destinatario": row.get::<_, Option<String>>(6)?,
        "volumes": row.get::<_, i64>(7)?,
        "volumesConferidos": row.get::<_, i64>(8)?,
        "pesoKg": row.get::<_, Option<f64>>(9)?,
        "status": row.get::<_, String>(10)?,
        "carroId": row.get::<_, Option<String>>(11)?,
        "createdAt": row.get::<_, String>(12)?,
        "updatedAt": row.get::<_, String>(13)?,
        "syncStatus": row.get::<_, String>(14)?,
    }))
}

pub(crate) fn load_nota(conn: &Connection, id: &str) -> Result<Value, String> {
    conn.query_row(
        &format!("SELECT {NOTA_COLUMNS} FROM notas_fiscais WHERE id = ?1"),
        params![id],
        nota_from_row,
    )
    .optional()
    .map_err(|e| format!("load nota: {e}"))?
    .ok_or_else(|| format!("Nota not found: {id}"))
}

fn find_by_chave(conn: &Connection, chave: &str) -> Result<Option<Value>, String> {
    conn.query_row(
        &format!("SELECT {NOTA_COLUMNS} FROM notas_fiscais WHERE chave = ?1"),
        params![chave],
        nota_from_row,
    )
    .optional()
    .map_err(|e| format!("find nota by chave: {e}"))
}

pub(crate) fn remote_row(conn: &Connection, id: &str) -> Result<Value, String> {
    let nota = load_nota(conn, id)?;
    Ok(serde_json::json!({
        "id": nota["id"],
        "chave": nota["chave"],
        "numero": nota["numero"],
        "serie": nota["serie"],
        "emitente_cnpj": nota["emitenteCnpj"],
        "emitente_nome": nota["emitenteNome"],
        "destinatario": nota["destinatario"],
        "volumes": nota["volumes"],
        "volumes_conferidos": nota["volumesConferidos"],
        "peso_kg": nota["pesoKg"],
        "status": nota["status"],
        "carro_id": nota["carroId"],
        "created_at": nota["createdAt"],
        "updated_at": nota["updatedAt"],
    }))
}

pub(crate) fn enqueue_nota_sync(conn: &Connection, id: &str, operation: &str) -> Result<(), String> {
    let payload = remote_row(conn, id)?;
    sync::enqueue(conn, "nota_fiscal", id, operation, &payload)
}

pub(crate) fn set_status_locked(conn: &Connection, id: &str, status: &str) -> Result<(), String> {
    conn.execute(
        "UPDATE notas_fiscais SET status = ?1, updated_at = ?2, sync_status = 'pending' WHERE id = ?3",
        params![status, now_rfc3339(), id],
    )
    .map_err(|e| format!("update nota status: {e}"))?;
    Ok(())
}

/// Query notas with optional filters while the caller holds the lock.
pub(crate) fn list_notas_locked(
    conn: &Connection,
    status: Option<&str>,
    carro_id: Option<&str>,
) -> Result<Vec<Value>, String> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {NOTA_COLUMNS} FROM notas_fiscais
             WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR carro_id = ?2)
             ORDER BY created_at DESC"
        ))
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map(params![status, carro_id], nota_from_row)
        .map_err(|e| e.to_string())?
        .filter_map(|r| match r {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("skipping malformed nota row: {e}");
                None
            }
        })
        .collect();
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Register an incoming nota. Either a valid `chave` or a `numero` is
/// required; re-receiving a known chave returns the existing row.
pub fn receive_nota(db: &DbState, payload: &Value) -> Result<Value, String> {
    let parsed = match value_str(payload, &["chave", "chaveAcesso", "chave_acesso"]) {
        Some(raw) => Some(parse_chave(&raw).map_err(|e| format!("Invalid chave: {e}"))?),
        None => None,
    };

    let numero = value_str(payload, &["numero", "nf", "numeroNf"])
        .or_else(|| parsed.as_ref().map(|c| c.numero.clone()))
        .ok_or("Missing chave or numero")?;
    let serie = value_str(payload, &["serie"]).or_else(|| parsed.as_ref().map(|c| c.serie.clone()));
    let emitente_cnpj = value_str(payload, &["emitenteCnpj", "emitente_cnpj", "cnpj"])
        .or_else(|| parsed.as_ref().map(|c| c.cnpj.clone()));
    let volumes = value_i64(payload, &["volumes", "qtdVolumes"]).unwrap_or(1);
    if volumes < 1 {
        return Err("volumes must be at least 1".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    if let Some(chave) = parsed.as_ref() {
        if let Some(existing) = find_by_chave(&conn, &chave.chave)? {
            info!(chave = %chave.chave, "Nota already received");
            return Ok(serde_json::json!({
                "success": true,
                "duplicate": true,
                "nota": existing,
            }));
        }
    }

    let id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO notas_fiscais (id, chave, numero, serie, emitente_cnpj, emitente_nome,
                                    destinatario, volumes, peso_kg, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'recebida', ?10, ?10)",
        params![
            id,
            parsed.as_ref().map(|c| c.chave.clone()),
            numero,
            serie,
            emitente_cnpj,
            value_str(payload, &["emitenteNome", "emitente_nome", "emitente"]),
            value_str(payload, &["destinatario", "cliente"]),
            volumes,
            value_f64(payload, &["pesoKg", "peso_kg", "peso"]),
            now
        ],
    )
    .map_err(|e| format!("insert nota: {e}"))?;

    enqueue_nota_sync(&conn, &id, "insert")?;
    info!(nota_id = %id, numero = %numero, volumes, "Nota received");

    Ok(serde_json::json!({
        "success": true,
        "duplicate": false,
        "nota": load_nota(&conn, &id)?,
    }))
}

pub fn list_notas(
    db: &DbState,
    status: Option<&str>,
    carro_id: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(serde_json::json!(list_notas_locked(&conn, status, carro_id)?))
}

/// Nota plus its open divergências.
pub fn get_nota(db: &DbState, id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut nota = load_nota(&conn, id)?;
    nota["divergencias"] =
        serde_json::json!(divergencias::list_locked(&conn, Some("aberta"), Some(id))?);
    Ok(nota)
}

/// Newest nota with the given number; numbers repeat across emitters.
fn find_id_by_numero(conn: &Connection, numero: &str) -> Result<Option<String>, String> {
    conn.query_row(
        "SELECT id FROM notas_fiscais WHERE numero = ?1 ORDER BY created_at DESC LIMIT 1",
        params![numero],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| format!("find nota by numero: {e}"))
}

/// Resolve a nota reference that may be an id, a scanned chave or a
/// scanned volume label.
fn resolve_nota_id(conn: &Connection, reference: &str) -> Result<String, String> {
    let reference = reference.trim();
    if let scanner::ScanKind::Volume { nota, .. } = scanner::classify_barcode(reference) {
        if parse_chave(&nota).is_ok() {
            return resolve_nota_id(conn, &nota);
        }
        return find_id_by_numero(conn, &nota)?
            .ok_or_else(|| format!("Nota not received for numero {nota}"));
    }
    if let Ok(chave) = parse_chave(reference) {
        if let Some(nota) = find_by_chave(conn, &chave.chave)? {
            return nota["id"]
                .as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| "Nota row without id".to_string());
        }
        return Err(format!("Nota not received for chave {}", chave.chave));
    }
    load_nota(conn, reference)?;
    Ok(reference.to_string())
}

/// Count one scanned volume of a nota.
///
/// A nota that became `divergente` only for missing volumes goes back to
/// `conferida` once the late volumes are scanned; the `volume_faltante`
/// divergência is closed with it. Other open divergências keep it
/// `divergente`.
pub fn conferir_volume(db: &DbState, reference: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = resolve_nota_id(&conn, reference)?;
    let nota = load_nota(&conn, &id)?;

    let status = nota["status"].as_str().unwrap_or_default().to_string();
    if !matches!(
        status.as_str(),
        STATUS_RECEBIDA | STATUS_EM_CONFERENCIA | STATUS_CONFERIDA | STATUS_DIVERGENTE
    ) {
        return Err(format!("Nota is {status}; conferência is closed"));
    }

    let volumes = nota["volumes"].as_i64().unwrap_or(1);
    let conferidos = nota["volumesConferidos"].as_i64().unwrap_or(0);

    if conferidos >= volumes {
        let divergencia = wms::in_transaction(&conn, || {
            let d = divergencias::insert_locked(
                &conn,
                &divergencias::NewDivergencia {
                    nota_id: Some(id.clone()),
                    carro_id: nota["carroId"].as_str().map(|s| s.to_string()),
                    tipo: divergencias::TIPO_VOLUME_EXCEDENTE.to_string(),
                    esperado: Some(volumes),
                    encontrado: Some(conferidos + 1),
                    observacao: Some("Volume lido além do esperado".into()),
                },
            )?;
            set_status_locked(&conn, &id, STATUS_DIVERGENTE)?;
            enqueue_nota_sync(&conn, &id, "update")?;
            Ok(d)
        })?;
        warn!(nota_id = %id, volumes, "Extra volume scanned");
        return Ok(serde_json::json!({
            "success": false,
            "excedente": true,
            "nota": load_nota(&conn, &id)?,
            "divergencia": divergencia,
        }));
    }

    let conferidos = conferidos + 1;
    let complete = conferidos == volumes;
    let next_status = wms::in_transaction(&conn, || {
        let mut next_status = if complete {
            STATUS_CONFERIDA
        } else if status == STATUS_DIVERGENTE {
            STATUS_DIVERGENTE
        } else {
            STATUS_EM_CONFERENCIA
        };
        if complete && status == STATUS_DIVERGENTE {
            let closed = divergencias::resolve_faltantes_locked(&conn, &id)?;
            if closed > 0 {
                info!(nota_id = %id, closed, "Late volumes closed faltante divergencias");
            }
            if divergencias::count_open_for_nota(&conn, &id)? > 0 {
                next_status = STATUS_DIVERGENTE;
            }
        }
        conn.execute(
            "UPDATE notas_fiscais SET volumes_conferidos = ?1, status = ?2, updated_at = ?3,
                    sync_status = 'pending'
             WHERE id = ?4",
            params![conferidos, next_status, now_rfc3339(), id],
        )
        .map_err(|e| format!("conferir volume: {e}"))?;
        enqueue_nota_sync(&conn, &id, "update")?;
        Ok(next_status)
    })?;

    Ok(serde_json::json!({
        "success": true,
        "excedente": false,
        "complete": complete,
        "conferida": next_status == STATUS_CONFERIDA,
        "nota": load_nota(&conn, &id)?,
    }))
}

/// Close the conferência of a nota, recording missing volumes.
pub fn finalizar_conferencia(db: &DbState, id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let nota = load_nota(&conn, id)?;
    let status = nota["status"].as_str().unwrap_or_default();
    if !matches!(status, STATUS_RECEBIDA | STATUS_EM_CONFERENCIA) {
        return Err(format!("Nota is {status}; nothing to finalize"));
    }

    let volumes = nota["volumes"].as_i64().unwrap_or(1);
    let conferidos = nota["volumesConferidos"].as_i64().unwrap_or(0);

    let divergencia = wms::in_transaction(&conn, || {
        let divergencia = if conferidos < volumes {
            let d = divergencias::insert_locked(
                &conn,
                &divergencias::NewDivergencia {
                    nota_id: Some(id.to_string()),
                    carro_id: None,
                    tipo: divergencias::TIPO_VOLUME_FALTANTE.to_string(),
                    esperado: Some(volumes),
                    encontrado: Some(conferidos),
                    observacao: None,
                },
            )?;
            set_status_locked(&conn, id, STATUS_DIVERGENTE)?;
            Some(d)
        } else {
            set_status_locked(&conn, id, STATUS_CONFERIDA)?;
            None
        };
        enqueue_nota_sync(&conn, id, "update")?;
        Ok(divergencia)
    })?;

    Ok(serde_json::json!({
        "success": divergencia.is_none(),
        "nota": load_nota(&conn, id)?,
        "divergencia": divergencia,
    }))
}

/// Pack a checked nota into an open cart.
pub fn assign_nota_to_carro(db: &DbState, nota_ref: &str, carro_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = resolve_nota_id(&conn, nota_ref)?;
    let nota = load_nota(&conn, &id)?;
    let carro = carros::load_carro(&conn, carro_id)?;

    if carro["status"] != carros::STATUS_EMBALANDO {
        return Err(format!(
            "Carro {} is {}; only carts in embalando accept notas",
            carro["codigo"].as_str().unwrap_or(carro_id),
            carro["status"].as_str().unwrap_or_default()
        ));
    }

    let previous_carro = nota["carroId"].as_str().map(|s| s.to_string());
    let nota_status = nota["status"].as_str().unwrap_or_default().to_string();
    match nota_status.as_str() {
        STATUS_CONFERIDA => {}
        STATUS_EMBALADA => {
            if previous_carro.as_deref() == Some(carro_id) {
                return Ok(serde_json::json!({ "success": true, "nota": nota, "unchanged": true }));
            }
            if let Some(prev) = previous_carro.as_deref() {
                let prev_carro = carros::load_carro(&conn, prev)?;
                if prev_carro["status"] != carros::STATUS_EMBALANDO {
                    return Err("Nota is packed in a closed cart".into());
                }
            }
        }
        other => {
            return Err(format!(
                "Nota is {other}; only conferida notas can be packed"
            ))
        }
    }

    conn.execute(
        "UPDATE notas_fiscais SET carro_id = ?1, status = 'embalada', updated_at = ?2,
                sync_status = 'pending'
         WHERE id = ?3",
        params![carro_id, now_rfc3339(), id],
    )
    .map_err(|e| format!("assign nota: {e}"))?;
    enqueue_nota_sync(&conn, &id, "update")?;

    info!(nota_id = %id, carro_id = %carro_id, moved_from = ?previous_carro, "Nota packed");
    Ok(serde_json::json!({
        "success": true,
        "nota": load_nota(&conn, &id)?,
        "carro": carros::load_carro(&conn, carro_id)?,
    }))
}

/// Take a nota back out of its (still open) cart.
pub fn remove_nota_from_carro(db: &DbState, nota_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let nota = load_nota(&conn, nota_id)?;
    let carro_id = nota["carroId"]
        .as_str()
        .ok_or("Nota is not in a cart")?
        .to_string();
    let carro = carros::load_carro(&conn, &carro_id)?;
    if carro["status"] != carros::STATUS_EMBALANDO {
        return Err("Cart is closed; reopen it before removing notas".into());
    }

    conn.execute(
        "UPDATE notas_fiscais SET carro_id = NULL, status = 'conferida', updated_at = ?1,
                sync_status = 'pending'
         WHERE id = ?2",
        params![now_rfc3339(), nota_id],
    )
    .map_err(|e| format!("remove nota: {e}"))?;
    enqueue_nota_sync(&conn, nota_id, "update")?;

    Ok(serde_json::json!({
        "success": true,
        "nota": load_nota(&conn, nota_id)?,
        "carro": carros::load_carro(&conn, &carro_id)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_state;

    /// Build a valid key from its first 43 digits.
    fn with_dv(prefix43: &str) -> String {
        let digits: Vec<u32> = prefix43.chars().filter_map(|c| c.to_digit(10)).collect();
        format!("{prefix43}{}", chave_check_digit(&digits))
    }

    fn sample_chave() -> String {
        // SP, 2026-03, CNPJ, modelo 55, série 1, número 123456, tpEmis 1, código 12345678
        with_dv("3526031234567800019955001000123456112345678")
    }

    #[test]
    fn test_check_digit_values() {
        let digits = |s: &str| -> Vec<u32> { s.chars().filter_map(|c| c.to_digit(10)).collect() };
        assert_eq!(
            chave_check_digit(&digits("4325121234567800019955001000000042100000001")),
            9
        );
        assert_eq!(
            chave_check_digit(&digits("3517060853052800018455000000000001100000001")),
            5
        );
        // Remainder 0 maps to 11, which folds to 0.
        assert_eq!(
            chave_check_digit(&digits("3526031234567800019955001000123456112345678")),
            0
        );
    }

    #[test]
    fn test_parse_chave_fields() {
        let chave = sample_chave();
        let parsed = parse_chave(&chave).unwrap();
        assert_eq!(parsed.uf, "35");
        assert_eq!(parsed.ano_mes, "2603");
        assert_eq!(parsed.cnpj, "12345678000199");
        assert_eq!(parsed.modelo, "55");
        assert_eq!(parsed.serie, "1");
        assert_eq!(parsed.numero, "123456");
        assert_eq!(parsed.tipo_emissao, "1");
        assert_eq!(parsed.codigo, "12345678");
    }

    #[test]
    fn test_parse_chave_ignores_formatting() {
        let chave = sample_chave();
        let spaced: String = chave
            .chars()
            .collect::<Vec<_>>()
            .chunks(4)
            .map(|c| c.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(parse_chave(&spaced).unwrap().chave, chave);
    }

    #[test]
    fn test_parse_chave_rejects_bad_input() {
        assert_eq!(parse_chave("123"), Err(ChaveError::Length(3)));
        let mut chave = sample_chave();
        let last = chave.pop().unwrap().to_digit(10).unwrap();
        chave.push(char::from_digit((last + 1) % 10, 10).unwrap());
        assert!(matches!(
            parse_chave(&chave),
            Err(ChaveError::CheckDigit { .. })
        ));
    }

    #[test]
    fn test_receive_from_chave_fills_fields_and_dedups() {
        let db = test_state();
        let chave = sample_chave();
        let first = receive_nota(
            &db,
            &serde_json::json!({ "chave": chave, "volumes": 3, "destinatario": "Loja 7" }),
        )
        .unwrap();
        assert_eq!(first["duplicate"], false);
        assert_eq!(first["nota"]["numero"], "123456");
        assert_eq!(first["nota"]["emitenteCnpj"], "12345678000199");
        assert_eq!(first["nota"]["status"], "recebida");

        let again = receive_nota(&db, &serde_json::json!({ "chave": chave })).unwrap();
        assert_eq!(again["duplicate"], true);
        assert_eq!(again["nota"]["id"], first["nota"]["id"]);
    }

    #[test]
    fn test_receive_validation() {
        let db = test_state();
        assert!(receive_nota(&db, &serde_json::json!({})).is_err());
        assert!(receive_nota(&db, &serde_json::json!({ "numero": "1", "volumes": 0 })).is_err());
        assert!(receive_nota(&db, &serde_json::json!({ "chave": "999" }))
            .unwrap_err()
            .contains("Invalid chave"));
        let manual = receive_nota(&db, &serde_json::json!({ "numero": "77" })).unwrap();
        assert_eq!(manual["nota"]["volumes"], 1);
        assert!(manual["nota"]["chave"].is_null());
    }

    #[test]
    fn test_conferencia_by_chave_until_complete() {
        let db = test_state();
        let chave = sample_chave();
        receive_nota(&db, &serde_json::json!({ "chave": chave, "volumes": 2 })).unwrap();

        let first = conferir_volume(&db, &chave).unwrap();
        assert_eq!(first["nota"]["status"], "em_conferencia");
        assert_eq!(first["complete"], false);

        let second = conferir_volume(&db, &chave).unwrap();
        assert_eq!(second["nota"]["status"], "conferida");
        assert_eq!(second["complete"], true);

        let extra = conferir_volume(&db, &chave).unwrap();
        assert_eq!(extra["excedente"], true);
        assert_eq!(extra["nota"]["status"], "divergente");
        assert_eq!(extra["nota"]["volumesConferidos"], 2);
        assert_eq!(extra["divergencia"]["tipo"], "volume_excedente");
        assert_eq!(extra["divergencia"]["encontrado"], 3);
    }

    #[test]
    fn test_finalizar_records_missing_volumes() {
        let db = test_state();
        let nota = receive_nota(&db, &serde_json::json!({ "numero": "10", "volumes": 4 })).unwrap();
        let id = nota["nota"]["id"].as_str().unwrap();
        conferir_volume(&db, id).unwrap();

        let result = finalizar_conferencia(&db, id).unwrap();
        assert_eq!(result["success"], false);
        assert_eq!(result["nota"]["status"], "divergente");
        assert_eq!(result["divergencia"]["esperado"], 4);
        assert_eq!(result["divergencia"]["encontrado"], 1);

        let detail = get_nota(&db, id).unwrap();
        assert_eq!(detail["divergencias"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_late_volume_after_finalizar_closes_faltante() {
        let db = test_state();
        let nota = receive_nota(&db, &serde_json::json!({ "numero": "77", "volumes": 2 })).unwrap();
        let id = nota["nota"]["id"].as_str().unwrap().to_string();
        conferir_volume(&db, &id).unwrap();
        finalizar_conferencia(&db, &id).unwrap();

        let late = conferir_volume(&db, &id).unwrap();
        assert_eq!(late["complete"], true);
        assert_eq!(late["nota"]["status"], STATUS_CONFERIDA);
        assert_eq!(late["nota"]["volumesConferidos"], 2);

        let faltantes = divergencias::list_divergencias(&db, Some("resolvida"), Some(&id)).unwrap();
        assert_eq!(faltantes.as_array().unwrap().len(), 1);
        assert_eq!(faltantes[0]["tipo"], divergencias::TIPO_VOLUME_FALTANTE);

        let check = crate::maintenance::verify_data(&db).unwrap();
        assert_eq!(check["ok"], true, "unexpected issues: {}", check["issues"]);
    }

    #[test]
    fn test_late_volume_keeps_other_divergencias_open() {
        let db = test_state();
        let nota = receive_nota(&db, &serde_json::json!({ "numero": "78", "volumes": 2 })).unwrap();
        let id = nota["nota"]["id"].as_str().unwrap().to_string();
        conferir_volume(&db, &id).unwrap();
        finalizar_conferencia(&db, &id).unwrap();
        divergencias::record_divergencia(
            &db,
            &serde_json::json!({ "notaId": id, "tipo": "avaria", "observacao": "caixa molhada" }),
        )
        .unwrap();

        let late = conferir_volume(&db, &id).unwrap();
        assert_eq!(late["conferida"], false);
        assert_eq!(late["nota"]["status"], STATUS_DIVERGENTE);
        let open = divergencias::list_divergencias(&db, Some("aberta"), Some(&id)).unwrap();
        assert_eq!(open.as_array().unwrap().len(), 1);
        assert_eq!(open[0]["tipo"], divergencias::TIPO_AVARIA);

        let check = crate::maintenance::verify_data(&db).unwrap();
        assert_eq!(check["ok"], true, "unexpected issues: {}", check["issues"]);
    }

    #[test]
    fn test_conferencia_by_volume_label() {
        let db = test_state();
        receive_nota(&db, &serde_json::json!({ "numero": "321", "volumes": 2 })).unwrap();
        let first = conferir_volume(&db, "NF:321|V:1/2").unwrap();
        assert_eq!(first["nota"]["volumesConferidos"], 1);
        let second = conferir_volume(&db, "NF:321|V:2/2").unwrap();
        assert_eq!(second["nota"]["status"], STATUS_CONFERIDA);

        let err = conferir_volume(&db, "NF:999|V:1/1").unwrap_err();
        assert!(err.contains("999"));
    }

    #[test]
    fn test_pack_move_and_remove() {
        let db = test_state();
        let nota = receive_nota(&db, &serde_json::json!({ "numero": "5" })).unwrap();
        let nota_id = nota["nota"]["id"].as_str().unwrap().to_string();

        let carro_a = carros::create_carro(&db, &serde_json::json!({})).unwrap();
        let carro_b = carros::create_carro(&db, &serde_json::json!({})).unwrap();
        let a = carro_a["id"].as_str().unwrap();
        let b = carro_b["id"].as_str().unwrap();

        // Not yet checked.
        assert!(assign_nota_to_carro(&db, &nota_id, a).is_err());
        conferir_volume(&db, &nota_id).unwrap();

        let packed = assign_nota_to_carro(&db, &nota_id, a).unwrap();
        assert_eq!(packed["nota"]["status"], "embalada");
        assert_eq!(packed["carro"]["notasCount"], 1);

        let moved = assign_nota_to_carro(&db, &nota_id, b).unwrap();
        assert_eq!(moved["nota"]["carroId"], b);

        let removed = remove_nota_from_carro(&db, &nota_id).unwrap();
        assert_eq!(removed["nota"]["status"], "conferida");
        assert_eq!(removed["carro"]["notasCount"], 0);
        assert!(remove_nota_from_carro(&db, &nota_id).is_err());
    }

    #[test]
    fn test_closed_cart_rejects_notas() {
        let db = test_state();
        let nota = receive_nota(&db, &serde_json::json!({ "numero": "6" })).unwrap();
        let nota_id = nota["nota"]["id"].as_str().unwrap().to_string();
        conferir_volume(&db, &nota_id).unwrap();

        let carro = carros::create_carro(&db, &serde_json::json!({})).unwrap();
        let carro_id = carro["id"].as_str().unwrap();
        carros::update_carro_status(&db, carro_id, "cancelado").unwrap();

        let err = assign_nota_to_carro(&db, &nota_id, carro_id).unwrap_err();
        assert!(err.contains("only carts in embalando"));
    }

    #[test]
    fn test_list_filters() {
        let db = test_state();
        receive_nota(&db, &serde_json::json!({ "numero": "1" })).unwrap();
        let second = receive_nota(&db, &serde_json::json!({ "numero": "2" })).unwrap();
        conferir_volume(&db, second["nota"]["id"].as_str().unwrap()).unwrap();

        let recebidas = list_notas(&db, Some("recebida"), None).unwrap();
        assert_eq!(recebidas.as_array().unwrap().len(), 1);
        let all = list_notas(&db, None, None).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);
    }
}
