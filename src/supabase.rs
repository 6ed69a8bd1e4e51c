//! Thin PostgREST client for the hosted Supabase project.

use reqwest::Url;
use serde_json::Value;
use std::time::Duration;

use crate::storage;

const REQUEST_TIMEOUT_SECS: u64 = 20;
const HEALTH_TIMEOUT_SECS: u64 = 5;

struct Credentials {
    base: String,
    key: String,
}

fn credentials() -> Result<Credentials, String> {
    let url = storage::get_credential(storage::KEY_SUPABASE_URL)
        .ok_or("Supabase not configured: missing URL")?;
    let key = storage::get_credential(storage::KEY_SUPABASE_ANON_KEY)
        .ok_or("Supabase not configured: missing anon key")?;
    Ok(Credentials {
        base: url.trim_end_matches('/').to_string(),
        key,
    })
}

/// `{base}/rest/v1/{table}?k=v...`
pub(crate) fn rest_url(base: &str, table: &str, params: &[(&str, String)]) -> Result<Url, String> {
    let base = base.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/rest/v1/{table}"))
        .map_err(|e| format!("Invalid Supabase URL: {e}"))?;
    if !params.is_empty() {
        let mut qp = url.query_pairs_mut();
        for (k, v) in params {
            qp.append_pair(k, v);
        }
    }
    Ok(url)
}

fn client(timeout_secs: u64) -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| format!("HTTP client error: {e}"))
}

async fn error_from(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    format!("Supabase error ({status}): {body}")
}

/// GET rows from a table with PostgREST filter params.
pub async fn fetch_rows(table: &str, params: &[(&str, String)]) -> Result<Value, String> {
    let creds = credentials()?;
    let url = rest_url(&creds.base, table, params)?;
    let resp = client(REQUEST_TIMEOUT_SECS)?
        .get(url)
        .header("apikey", &creds.key)
        .header("Authorization", format!("Bearer {}", creds.key))
        .header("Content-Type", "application/json")
        .send()
        .await
        .map_err(|e| format!("Supabase request failed: {e}"))?;
    if !resp.status().is_success() {
        return Err(error_from(resp).await);
    }
    resp.json::<Value>()
        .await
        .map_err(|e| format!("Supabase JSON parse error: {e}"))
}

/// Upsert rows keyed by `id`. Rows already on the server are merged.
pub async fn upsert_rows(table: &str, rows: &[Value]) -> Result<(), String> {
    if rows.is_empty() {
        return Ok(());
    }
    let creds = credentials()?;
    let url = rest_url(&creds.base, table, &[("on_conflict", "id".to_string())])?;
    let resp = client(REQUEST_TIMEOUT_SECS)?
        .post(url)
        .header("apikey", &creds.key)
        .header("Authorization", format!("Bearer {}", creds.key))
        .header("Content-Type", "application/json")
        .header("Prefer", "resolution=merge-duplicates,return=minimal")
        .json(rows)
        .send()
        .await
        .map_err(|e| format!("Supabase request failed: {e}"))?;
    if !resp.status().is_success() {
        return Err(error_from(resp).await);
    }
    Ok(())
}

/// PostgREST `in.(...)` filter value for a list of ids.
pub(crate) fn in_filter(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('"', "")))
        .collect();
    format!("in.({})", quoted.join(","))
}

/// Delete rows by `id`. Missing rows are not an error.
pub async fn delete_rows(table: &str, ids: &[String]) -> Result<(), String> {
    if ids.is_empty() {
        return Ok(());
    }
    let creds = credentials()?;
    let url = rest_url(&creds.base, table, &[("id", in_filter(ids))])?;
    let resp = client(REQUEST_TIMEOUT_SECS)?
        .delete(url)
        .header("apikey", &creds.key)
        .header("Authorization", format!("Bearer {}", creds.key))
        .header("Prefer", "return=minimal")
        .send()
        .await
        .map_err(|e| format!("Supabase request failed: {e}"))?;
    if !resp.status().is_success() {
        return Err(error_from(resp).await);
    }
    Ok(())
}

/// True when the project answers on its REST root. Any HTTP status counts as
/// reachable except server errors.
pub async fn check_connectivity() -> bool {
    let Ok(creds) = credentials() else {
        return false;
    };
    let Ok(url) = rest_url(&creds.base, "", &[]) else {
        return false;
    };
    let Ok(client) = client(HEALTH_TIMEOUT_SECS) else {
        return false;
    };
    match client
        .head(url)
        .header("apikey", &creds.key)
        .header("Authorization", format!("Bearer {}", creds.key))
        .send()
        .await
    {
        Ok(resp) => !resp.status().is_server_error(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_filter_quotes_ids() {
        assert_eq!(
            in_filter(&["c-1".to_string(), "c-2".to_string()]),
            "in.(\"c-1\",\"c-2\")"
        );
        let url = rest_url("https://abc.supabase.co", "carros", &[("id", in_filter(&["c-1".to_string()]))])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://abc.supabase.co/rest/v1/carros?id=in.%28%22c-1%22%29"
        );
    }

    #[test]
    fn test_rest_url_encodes_params() {
        let url = rest_url(
            "https://abc.supabase.co/",
            "messages",
            &[
                ("created_at", "gt.2026-01-01T10:00:00.000Z".to_string()),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://abc.supabase.co/rest/v1/messages?created_at=gt.2026-01-01T10%3A00%3A00.000Z&order=created_at.asc"
        );
    }

    #[test]
    fn test_rest_url_rejects_garbage() {
        assert!(rest_url("not a url", "carros", &[]).is_err());
    }
}
