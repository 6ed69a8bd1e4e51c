//! ProFlow WMS - Tauri v2 Backend
//!
//! This module registers all IPC command handlers that the React frontend
//! calls via `@tauri-apps/api/core::invoke()`, and starts the background
//! sync loop and print worker.

use chrono::{SecondsFormat, Utc};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod carros;
mod chat;
mod commands;
mod db;
mod diagnostics;
mod divergencias;
mod labels;
mod maintenance;
mod notas;
mod print;
mod printers;
mod scanner;
mod storage;
mod supabase;
mod sync;
mod wms;
mod zpl;

/// UTC timestamp with millisecond precision and a `Z` suffix. Values sort
/// lexicographically, which the queues rely on.
pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}

/// Accepts either a bare string or an object carrying one of `keys`.
pub(crate) fn payload_arg0_as_string(
    arg0: Option<serde_json::Value>,
    keys: &[&str],
) -> Option<String> {
    match arg0 {
        Some(serde_json::Value::String(s)) => {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        }
        Some(serde_json::Value::Object(obj)) => {
            let payload = serde_json::Value::Object(obj);
            value_str(&payload, keys)
        }
        _ => None,
    }
}

/// Object payload, or an empty object when the frontend sent nothing.
pub(crate) fn payload_object(arg0: Option<serde_json::Value>) -> serde_json::Value {
    match arg0 {
        Some(v @ serde_json::Value::Object(_)) => v,
        _ => serde_json::json!({}),
    }
}

// ============================================================================
// App entry point
// ============================================================================

pub fn run() {
    // Initialize structured logging (console + rolling file)
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,proflow_wms_lib=debug"));

    diagnostics::prune_old_logs();

    let log_dir = diagnostics::get_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Dropping the guard flushes and stops the file writer; the app runs
    // until process exit.
    std::mem::forget(_guard);

    info!("Starting ProFlow WMS v{}", env!("CARGO_PKG_VERSION"));

    let result = tauri::Builder::default()
        .setup(|app| {
            use std::sync::Arc;
            use tauri::Manager;

            let app_data_dir = app.path().app_data_dir()?;

            // Main DB connection for Tauri commands
            app.manage(db::init(&app_data_dir)?);

            // Sync state (shared between commands and background loop)
            let sync_state = Arc::new(sync::SyncState::new());
            app.manage(sync_state.clone());

            // Second DB connection for the background sync loop (15s interval)
            let db_for_sync = Arc::new(db::init(&app_data_dir)?);
            sync::start_sync_loop(app.handle().clone(), db_for_sync, sync_state, 15);

            // Third DB connection for the background print worker (5s interval)
            let db_for_print = Arc::new(db::init(&app_data_dir)?);
            print::start_print_worker(db_for_print, 5);

            info!(
                data_dir = %app_data_dir.display(),
                supabase_configured = storage::is_configured(),
                "Database, sync loop and print worker registered"
            );
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            // Carros
            commands::carros::carro_create,
            commands::carros::carro_list,
            commands::carros::carro_get,
            commands::carros::carro_update,
            commands::carros::carro_update_status,
            commands::carros::carro_delete,
            // Notas fiscais
            commands::notas::nota_parse_chave,
            commands::notas::nota_receive,
            commands::notas::nota_list,
            commands::notas::nota_get,
            commands::notas::nota_conferir_volume,
            commands::notas::nota_finalizar_conferencia,
            commands::notas::nota_assign_to_carro,
            commands::notas::nota_remove_from_carro,
            // Divergencias
            commands::divergencias::divergencia_record,
            commands::divergencias::divergencia_list,
            commands::divergencias::divergencia_resolve,
            // Chat
            commands::chat::chat_post_message,
            commands::chat::chat_list_messages,
            // WMS
            commands::wms::wms_parse_codigo,
            commands::wms::wms_create_posicao,
            commands::wms::wms_list_posicoes,
            commands::wms::wms_update_posicao,
            commands::wms::wms_suggest_posicoes,
            commands::wms::wms_alocar,
            commands::wms::wms_liberar,
            commands::wms::wms_list_alocacoes,
            // Printers & labels
            commands::print::printer_create_profile,
            commands::print::printer_update_profile,
            commands::print::printer_list_profiles,
            commands::print::printer_get_profile,
            commands::print::printer_delete_profile,
            commands::print::printer_set_default_profile,
            commands::print::printer_test_connection,
            commands::print::label_preview,
            commands::print::print_enqueue_job,
            commands::print::print_list_jobs,
            commands::print::print_retry_job,
            commands::print::print_cancel_job,
            // Settings
            commands::settings::settings_get_config,
            commands::settings::settings_update_supabase,
            commands::settings::settings_get_local,
            commands::settings::settings_set_local,
            commands::settings::settings_factory_reset,
            // Sync
            commands::sync::sync_get_status,
            commands::sync::sync_force,
            commands::sync::sync_retry_failed,
            commands::sync::sync_get_network_status,
            // Scanner
            commands::scanner::scanner_classify,
            commands::scanner::scanner_list_ports,
            commands::scanner::scanner_start,
            commands::scanner::scanner_stop,
            commands::scanner::scanner_get_status,
            // Maintenance
            commands::maintenance::maintenance_verify_data,
            commands::maintenance::maintenance_repair_data,
            // Diagnostics
            commands::diagnostics::diagnostics_get_about,
            commands::diagnostics::diagnostics_get_system_health,
            commands::diagnostics::diagnostics_export,
        ])
        .run(tauri::generate_context!());

    if let Err(e) = result {
        tracing::error!(error = %e, "Tauri application exited with an error");
    }
}
