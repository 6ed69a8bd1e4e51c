//! Backend credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

const SERVICE_NAME: &str = "proflow-wms";

pub const KEY_SUPABASE_URL: &str = "supabase_url";
pub const KEY_SUPABASE_ANON_KEY: &str = "supabase_anon_key";
pub const KEY_STATION_NAME: &str = "station_name";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_SUPABASE_URL, KEY_SUPABASE_ANON_KEY, KEY_STATION_NAME];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Sync runs only when both the project URL and the anon key are stored.
pub fn is_configured() -> bool {
    has_credential(KEY_SUPABASE_URL) && has_credential(KEY_SUPABASE_ANON_KEY)
}

/// `https://x.supabase.co/rest/v1/` -> `https://x.supabase.co`
pub fn normalize_supabase_url(raw: &str) -> Option<String> {
    let mut url = raw.trim().trim_end_matches('/').to_string();
    if url.is_empty() {
        return None;
    }
    if let Some(stripped) = url.strip_suffix("/rest/v1") {
        url = stripped.to_string();
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("https://{url}");
    }
    reqwest::Url::parse(&url).ok()?;
    Some(url)
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - 4))
}

/// Stored config as shown in the settings screen. The key is masked.
pub fn get_full_config() -> Value {
    serde_json::json!({
        "supabase_url": get_credential(KEY_SUPABASE_URL),
        "supabase_anon_key": get_credential(KEY_SUPABASE_ANON_KEY).map(|k| mask_secret(&k)),
        "station_name": get_credential(KEY_STATION_NAME),
        "configured": is_configured(),
    })
}

/// Store backend credentials entered in the settings screen.
///
/// Expected JSON shape:
/// ```json
/// { "supabaseUrl": "...", "supabaseAnonKey": "...", "stationName": "..." }
/// ```
pub fn update_supabase_credentials(payload: &Value) -> Result<Value, String> {
    let raw_url = crate::value_str(payload, &["supabaseUrl", "supabase_url", "url"])
        .ok_or("Missing required field: supabaseUrl")?;
    let url = normalize_supabase_url(&raw_url)
        .ok_or_else(|| format!("Invalid Supabase URL: {raw_url}"))?;
    let key = crate::value_str(payload, &["supabaseAnonKey", "supabase_anon_key", "anonKey"])
        .ok_or("Missing required field: supabaseAnonKey")?;

    set_credential(KEY_SUPABASE_URL, &url)?;
    set_credential(KEY_SUPABASE_ANON_KEY, &key)?;
    if let Some(station) = crate::value_str(payload, &["stationName", "station_name"]) {
        set_credential(KEY_STATION_NAME, &station)?;
    }

    info!(supabase_url = %url, "backend credentials updated");
    Ok(serde_json::json!({ "success": true, "supabaseUrl": url }))
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset – deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}
