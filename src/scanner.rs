//! Serial barcode scanner and scan classification.
//!
//! Keyboard-wedge scanners are handled by the UI; scanners attached to a
//! serial/COM port are read here on a background task. Every code, whatever
//! its source, can be classified with [`classify_barcode`] so the UI knows
//! whether it scanned a nota, a volume label, a cart or a position.

use serde::Serialize;
use serde_json::Value;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tauri::Emitter;
use tracing::{info, warn};

use crate::{notas, wms};

const MIN_CODE_LEN: usize = 3;
const MAX_CODE_LEN: usize = 120;
const MAX_LINE_BUFFER: usize = 1024;
const READ_TIMEOUT_MS: u64 = 200;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanKind {
    NotaChave { chave: String },
    Volume { nota: String, index: u32, total: u32 },
    Carro { codigo: String },
    Posicao { codigo: String },
    Unknown,
}

/// `NF:{ref}|V:{i}/{n}` as printed on volume labels.
fn parse_volume_payload(code: &str) -> Option<ScanKind> {
    let rest = code.strip_prefix("NF:")?;
    let (nota, volume) = rest.split_once("|V:")?;
    let (index, total) = volume.split_once('/')?;
    let index: u32 = index.trim().parse().ok()?;
    let total: u32 = total.trim().parse().ok()?;
    if nota.trim().is_empty() || index == 0 || total == 0 || index > total {
        return None;
    }
    Some(ScanKind::Volume {
        nota: nota.trim().to_string(),
        index,
        total,
    })
}

fn is_carro_code(code: &str) -> bool {
    code.strip_prefix("CAR-")
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

pub fn classify_barcode(raw: &str) -> ScanKind {
    let code = raw.trim();
    if code.is_empty() {
        return ScanKind::Unknown;
    }
    if let Ok(chave) = notas::parse_chave(code) {
        return ScanKind::NotaChave { chave: chave.chave };
    }
    if let Some(volume) = parse_volume_payload(code) {
        return volume;
    }

    let upper = code.to_uppercase();
    if let Some(codigo) = upper.strip_prefix("CARRO:") {
        let codigo = codigo.trim();
        if !codigo.is_empty() {
            return ScanKind::Carro { codigo: codigo.to_string() };
        }
    }
    if is_carro_code(&upper) {
        return ScanKind::Carro { codigo: upper };
    }
    let posicao = upper.strip_prefix("POS:").unwrap_or(&upper);
    if let Ok(parsed) = wms::parse_codigo_posicao(posicao) {
        return ScanKind::Posicao { codigo: parsed.codigo };
    }
    ScanKind::Unknown
}

// ---------------------------------------------------------------------------
// Line assembly
// ---------------------------------------------------------------------------

/// Accumulates serial chunks and yields complete newline-terminated codes.
#[derive(Debug, Default)]
pub(crate) struct LineAssembler {
    buffer: String,
}

impl LineAssembler {
    pub(crate) fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut codes = Vec::new();
        while let Some(pos) = self.buffer.find(['\n', '\r']) {
            let line = self.buffer[..pos].trim().to_string();
            self.buffer.drain(..=pos);
            let len = line.chars().count();
            if (MIN_CODE_LEN..=MAX_CODE_LEN).contains(&len) {
                codes.push(line);
            }
        }
        if self.buffer.len() > MAX_LINE_BUFFER {
            self.buffer.clear();
        }
        codes
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

static SCANNER_RUNNING: AtomicBool = AtomicBool::new(false);
/// Bumped on every start and stop; a reader only runs while it owns the
/// current generation.
static SCANNER_GENERATION: AtomicU64 = AtomicU64::new(0);
static SCANNER_PORT: Mutex<Option<String>> = Mutex::new(None);
static LAST_SCAN: Mutex<Option<Value>> = Mutex::new(None);

fn begin_session() -> u64 {
    SCANNER_GENERATION.fetch_add(1, Ordering::SeqCst) + 1
}

fn end_session() {
    SCANNER_GENERATION.fetch_add(1, Ordering::SeqCst);
}

fn session_active(generation: u64) -> bool {
    SCANNER_GENERATION.load(Ordering::SeqCst) == generation
}

fn scan_event(code: &str) -> Value {
    serde_json::json!({
        "barcode": code,
        "classification": classify_barcode(code),
        "source": "serial",
        "timestamp": crate::now_rfc3339(),
    })
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Open the port and start reading codes on a background task. Each code is
/// emitted as a `barcode_scanned` event.
pub fn start(port: &str, baud_rate: u32, app: tauri::AppHandle) -> Result<Value, String> {
    if SCANNER_RUNNING.load(Ordering::SeqCst) {
        return Err("Serial scanner already running; stop it first".to_string());
    }

    let mut serial = serialport::new(port, baud_rate)
        .timeout(Duration::from_millis(READ_TIMEOUT_MS))
        .open()
        .map_err(|e| format!("Failed to open {port} @ {baud_rate}: {e}"))?;

    if let Ok(mut p) = SCANNER_PORT.lock() {
        *p = Some(port.to_string());
    }
    SCANNER_RUNNING.store(true, Ordering::SeqCst);
    let generation = begin_session();

    let port_name = port.to_string();
    tauri::async_runtime::spawn_blocking(move || {
        info!(port = %port_name, generation, "Serial scanner reader started");
        let mut assembler = LineAssembler::default();
        let mut buf = [0u8; 256];

        while session_active(generation) {
            match serial.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    for code in assembler.push(&chunk) {
                        if !session_active(generation) {
                            break;
                        }
                        let event = scan_event(&code);
                        info!(barcode = %code, kind = %event["classification"]["kind"], "Barcode scanned");
                        if let Ok(mut last) = LAST_SCAN.lock() {
                            *last = Some(event.clone());
                        }
                        let _ = app.emit("barcode_scanned", event);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    warn!(error = %e, "Serial scanner read error");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }

        info!(port = %port_name, generation, "Serial scanner reader stopped");
    });

    Ok(serde_json::json!({
        "success": true,
        "port": port,
        "baudRate": baud_rate,
    }))
}

/// Stop the reader. The port closes when the reader task exits.
pub fn stop() -> Result<Value, String> {
    if !SCANNER_RUNNING.swap(false, Ordering::SeqCst) {
        return Ok(serde_json::json!({
            "success": true,
            "message": "Scanner was not running",
        }));
    }
    end_session();
    if let Ok(mut p) = SCANNER_PORT.lock() {
        *p = None;
    }
    info!("Serial scanner stopped");
    Ok(serde_json::json!({ "success": true }))
}

pub fn status() -> Result<Value, String> {
    let running = SCANNER_RUNNING.load(Ordering::SeqCst);
    let port = SCANNER_PORT.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let last = LAST_SCAN.lock().unwrap_or_else(|e| e.into_inner()).clone();
    Ok(serde_json::json!({
        "connected": running,
        "port": port,
        "lastScan": last,
    }))
}

/// Serial ports present on this machine.
pub fn list_ports() -> Result<Value, String> {
    let ports = serialport::available_ports().map_err(|e| format!("Failed to list ports: {e}"))?;
    let list: Vec<Value> = ports
        .iter()
        .map(|p| {
            let mut obj = serde_json::json!({ "name": p.port_name });
            match &p.port_type {
                serialport::SerialPortType::UsbPort(usb) => {
                    obj["portType"] = "usb".into();
                    obj["vid"] = usb.vid.into();
                    obj["pid"] = usb.pid.into();
                    if let Some(ref product) = usb.product {
                        obj["product"] = product.clone().into();
                    }
                }
                serialport::SerialPortType::BluetoothPort => obj["portType"] = "bluetooth".into(),
                serialport::SerialPortType::PciPort => obj["portType"] = "pci".into(),
                serialport::SerialPortType::Unknown => obj["portType"] = "unknown".into(),
            }
            obj
        })
        .collect();
    Ok(serde_json::json!({ "success": true, "ports": list }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn chave() -> String {
        // DV of this prefix is 5.
        "3517060853052800018455000000000001100000001".to_string() + "5"
    }

    #[test]
    fn test_classify_nota_and_volume() {
        assert_eq!(classify_barcode(&chave()), ScanKind::NotaChave { chave: chave() });
        assert_eq!(
            classify_barcode("NF:123456|V:2/3"),
            ScanKind::Volume { nota: "123456".into(), index: 2, total: 3 }
        );
        assert_eq!(classify_barcode("NF:123456|V:4/3"), ScanKind::Unknown);
        assert_eq!(classify_barcode("NF:|V:1/1"), ScanKind::Unknown);
    }

    #[test]
    fn test_classify_carro_and_posicao() {
        assert_eq!(
            classify_barcode("carro:car-0007"),
            ScanKind::Carro { codigo: "CAR-0007".into() }
        );
        assert_eq!(classify_barcode("CAR-0012"), ScanKind::Carro { codigo: "CAR-0012".into() });
        assert_eq!(
            classify_barcode("POS:a-01-02-03"),
            ScanKind::Posicao { codigo: "A-01-02-03".into() }
        );
        assert_eq!(
            classify_barcode("B-02-01-04"),
            ScanKind::Posicao { codigo: "B-02-01-04".into() }
        );
        assert_eq!(classify_barcode("7891234567895"), ScanKind::Unknown);
        assert_eq!(classify_barcode("   "), ScanKind::Unknown);
    }

    #[test]
    fn test_classification_serializes_with_kind() {
        let value = serde_json::to_value(classify_barcode("CAR-0001")).unwrap();
        assert_eq!(value, serde_json::json!({ "kind": "carro", "codigo": "CAR-0001" }));
    }

    #[test]
    fn test_line_assembler_splits_chunks() {
        let mut asm = LineAssembler::default();
        assert!(asm.push("CAR-00").is_empty());
        assert_eq!(asm.push("01\r\nA-01"), vec!["CAR-0001".to_string()]);
        assert_eq!(asm.push("-01-01\nx\n"), vec!["A-01-01-01".to_string()]);
        let long = "9".repeat(MAX_CODE_LEN + 1) + "\n";
        assert!(asm.push(&long).is_empty());
    }

    #[test]
    #[serial]
    fn test_stop_when_not_running() {
        SCANNER_RUNNING.store(false, Ordering::SeqCst);
        assert_eq!(stop().unwrap()["success"], true);
        assert_eq!(status().unwrap()["connected"], false);
    }

    #[test]
    #[serial]
    fn test_reader_from_previous_session_sees_itself_stale() {
        let old = begin_session();
        assert!(session_active(old));

        SCANNER_RUNNING.store(true, Ordering::SeqCst);
        stop().unwrap();
        assert!(!session_active(old));

        // A quick restart must not revive the old reader.
        let new = begin_session();
        assert!(session_active(new));
        assert!(!session_active(old));
        end_session();
        assert!(!session_active(new));
    }
}
