use serde_json::Value;
use tracing::info;

use crate::{db, maintenance};

#[tauri::command]
pub async fn maintenance_verify_data(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    maintenance::verify_data(&db)
}

#[tauri::command]
pub async fn maintenance_repair_data(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    info!("Data repair requested");
    maintenance::repair_data(&db)
}
