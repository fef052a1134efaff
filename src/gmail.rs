//! Pull invoice PDFs out of a linked Gmail inbox.
//!
//! Uses the access token stored on the user's linked `google` account and
//! the Gmail REST API: list candidate messages, walk each message's MIME
//! tree for PDF attachments, download them, and run each one through the
//! normal upload pipeline. Per-attachment failures are counted, not fatal.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use sqlx::SqlitePool;
use std::time::Duration;

use crate::auth;
use crate::config::Config;
use crate::invoices;

const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Search query for candidate messages.
const SEARCH_QUERY: &str = "has:attachment filename:pdf (invoice OR receipt OR bill)";

const MAX_MESSAGES: usize = 25;

#[derive(Debug, serde::Serialize)]
pub struct SyncOutcome {
    /// Messages inspected.
    pub scanned: usize,
    /// Attachments that made it through the upload pipeline (any status).
    pub imported: usize,
    /// Attachments that could not be downloaded or decoded.
    pub failed: usize,
}

pub async fn sync_invoices(
    config: &Config,
    pool: &SqlitePool,
    user_id: &str,
) -> Result<SyncOutcome> {
    let Some(token) = auth::provider_access_token(pool, user_id, "google").await? else {
        bail!("No linked Google account");
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let max_results = MAX_MESSAGES.to_string();
    let listing: serde_json::Value = client
        .get(format!("{}/messages", GMAIL_API))
        .query(&[("q", SEARCH_QUERY), ("maxResults", max_results.as_str())])
        .bearer_auth(&token)
        .send()
        .await?
        .error_for_status()
        .context("Gmail message listing failed")?
        .json()
        .await?;

    let message_ids: Vec<String> = listing
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|msgs| {
            msgs.iter()
                .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                .map(|id| id.to_string())
                .collect()
        })
        .unwrap_or_default();

    let mut outcome = SyncOutcome {
        scanned: 0,
        imported: 0,
        failed: 0,
    };

    for message_id in message_ids {
        outcome.scanned += 1;

        let message: serde_json::Value = match client
            .get(format!("{}/messages/{}", GMAIL_API, message_id))
            .bearer_auth(&token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => match response.json().await {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(message_id, error = %e, "skipping unreadable message");
                    outcome.failed += 1;
                    continue;
                }
            },
            Err(e) => {
                tracing::warn!(message_id, error = %e, "skipping unfetchable message");
                outcome.failed += 1;
                continue;
            }
        };

        for (filename, attachment_id) in pdf_attachments(&message) {
            match fetch_attachment(&client, &token, &message_id, &attachment_id).await {
                Ok(bytes) => {
                    invoices::process_upload(config, pool, user_id, &filename, bytes).await?;
                    outcome.imported += 1;
                }
                Err(e) => {
                    tracing::warn!(message_id, filename, error = %e, "attachment import failed");
                    outcome.failed += 1;
                }
            }
        }
    }

    tracing::info!(
        user_id,
        scanned = outcome.scanned,
        imported = outcome.imported,
        failed = outcome.failed,
        "gmail sync finished"
    );
    Ok(outcome)
}

/// PDF attachments in a message's MIME tree: `(filename, attachment_id)`.
fn pdf_attachments(message: &serde_json::Value) -> Vec<(String, String)> {
    let mut found = Vec::new();
    if let Some(payload) = message.get("payload") {
        collect_pdf_parts(payload, &mut found);
    }
    found
}

fn collect_pdf_parts(part: &serde_json::Value, found: &mut Vec<(String, String)>) {
    let filename = part.get("filename").and_then(|f| f.as_str()).unwrap_or("");
    if filename.to_lowercase().ends_with(".pdf") {
        if let Some(attachment_id) = part
            .get("body")
            .and_then(|b| b.get("attachmentId"))
            .and_then(|id| id.as_str())
        {
            found.push((filename.to_string(), attachment_id.to_string()));
        }
    }

    if let Some(parts) = part.get("parts").and_then(|p| p.as_array()) {
        for child in parts {
            collect_pdf_parts(child, found);
        }
    }
}

async fn fetch_attachment(
    client: &reqwest::Client,
    token: &str,
    message_id: &str,
    attachment_id: &str,
) -> Result<Vec<u8>> {
    let body: serde_json::Value = client
        .get(format!(
            "{}/messages/{}/attachments/{}",
            GMAIL_API, message_id, attachment_id
        ))
        .bearer_auth(token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let data = body
        .get("data")
        .and_then(|d| d.as_str())
        .context("attachment response missing data")?;
    decode_attachment(data)
}

/// Gmail encodes attachment bytes as base64url, sometimes without padding.
fn decode_attachment(data: &str) -> Result<Vec<u8>> {
    general_purpose::URL_SAFE
        .decode(data)
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(data))
        .context("attachment data is not valid base64url")
}
