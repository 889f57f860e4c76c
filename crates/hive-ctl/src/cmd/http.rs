//! Shared HTTP request helpers for CLI commands.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

/// Decode a success body, or turn a `{success:false, error, message}` body
/// into an error.
async fn decode<T: for<'de> Deserialize<'de>>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(e) => bail!("{} ({}): {}", e.error, status, e.message),
            Err(_) => bail!("request failed with {}: {}", status, text),
        }
    }
    resp.json::<T>().await.context("failed to parse response")
}

fn unreachable_hint(url: &str) -> String {
    format!("failed to connect to hived at {}; is it running?", url)
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::get(url)
        .await
        .with_context(|| unreachable_hint(url))?;
    decode(resp).await
}

pub async fn post_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    let resp = reqwest::Client::new()
        .post(url)
        .send()
        .await
        .with_context(|| unreachable_hint(url))?;
    decode(resp).await
}

pub async fn post_json_body<T, R>(url: &str, body: &T) -> Result<R>
where
    T: Serialize,
    R: for<'de> Deserialize<'de>,
{
    let resp = reqwest::Client::new()
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| unreachable_hint(url))?;
    decode(resp).await
}

pub async fn delete_json<R: for<'de> Deserialize<'de>>(
    url: &str,
    query: &[(&str, &str)],
) -> Result<R> {
    let resp = reqwest::Client::new()
        .delete(url)
        .query(query)
        .send()
        .await
        .with_context(|| unreachable_hint(url))?;
    decode(resp).await
}
