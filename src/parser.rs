//! Client for the external invoice-parsing service.
//!
//! The service does the actual document AI work; we send it the uploaded
//! file as multipart form data and get back semi-structured JSON with six
//! CSV sections (`vendor_info`, `invoice_details`, `line_items`,
//! `taxes_fees`, `payment_info`, `compliance_flags`).
//!
//! Encrypted PDFs are rejected locally before the upstream call; the service
//! cannot process them either, and the local check gives a stable error
//! message.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::ParserConfig;

/// Stored on the invoice row when an upload is rejected for encryption.
pub const ENCRYPTED_PDF_MSG: &str =
    "Invoice file is encrypted or password-protected. Cannot process encrypted PDFs.";

/// JSON sections every parse result must carry, even when empty.
const REQUIRED_SECTIONS: &[&str] = &[
    "vendor_info",
    "invoice_details",
    "line_items",
    "taxes_fees",
    "payment_info",
    "compliance_flags",
];

/// Detect a password-protected PDF by its `/Encrypt` trailer entry.
///
/// Non-PDF bytes return `false`; the parsing service decides what to do
/// with other formats.
pub fn is_encrypted_pdf(bytes: &[u8]) -> bool {
    if !bytes.starts_with(b"%PDF") {
        return false;
    }
    bytes.windows(8).any(|w| w == b"/Encrypt")
}

/// True when an upstream failure message indicates an encrypted document.
pub fn failure_is_encryption(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("encrypted") || lower.contains("password")
}

/// Send a file to the parsing service and return its normalized JSON result.
///
/// A single failed call fails the upload; there is no retry policy here.
pub async fn parse_invoice(
    config: &ParserConfig,
    filename: &str,
    bytes: Vec<u8>,
) -> Result<serde_json::Value> {
    if is_encrypted_pdf(&bytes) {
        bail!("{}", ENCRYPTED_PDF_MSG);
    }

    let Some(url) = &config.url else {
        bail!("parser.url is not configured");
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let part = reqwest::multipart::Part::bytes(bytes).file_name(filename.to_string());
    let form = reqwest::multipart::Form::new().part("file", part);

    let mut request = client.post(url).multipart(form);
    if let Ok(api_key) = std::env::var("PARSER_API_KEY") {
        request = request.header("Authorization", format!("Bearer {}", api_key));
    }

    let response = request.send().await?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        if failure_is_encryption(&body) {
            bail!("{}", ENCRYPTED_PDF_MSG);
        }
        bail!("Parsing service error {}: {}", status, body);
    }

    let mut json: serde_json::Value = response.json().await?;
    normalize_result(&mut json);
    Ok(json)
}

/// Ensure every expected section exists so downstream field lookups never
/// have to special-case missing keys.
fn normalize_result(json: &mut serde_json::Value) {
    if let Some(obj) = json.as_object_mut() {
        for section in REQUIRED_SECTIONS {
            obj.entry(section.to_string())
                .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_pdf_detected() {
        let mut bytes = b"%PDF-1.7\n".to_vec();
        bytes.extend_from_slice(b"trailer << /Encrypt 5 0 R >>");
        assert!(is_encrypted_pdf(&bytes));
    }

    #[test]
    fn plain_pdf_not_flagged() {
        let bytes = b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj".to_vec();
        assert!(!is_encrypted_pdf(&bytes));
    }

    #[test]
    fn non_pdf_not_flagged() {
        assert!(!is_encrypted_pdf(b"hello /Encrypt world"));
    }

    #[test]
    fn encryption_failure_classified() {
        assert!(failure_is_encryption("PDF is Encrypted"));
        assert!(failure_is_encryption("file is password-protected"));
        assert!(!failure_is_encryption("timeout talking to upstream"));
    }

    #[test]
    fn message_mentions_encryption() {
        assert!(ENCRYPTED_PDF_MSG.contains("encrypted or password-protected"));
    }

    #[test]
    fn normalize_fills_missing_sections() {
        let mut json = serde_json::json!({"vendor_info": [{"data": "Field Name,Value"}]});
        normalize_result(&mut json);
        for section in REQUIRED_SECTIONS {
            assert!(json.get(section).is_some(), "missing {}", section);
        }
        assert_eq!(json["vendor_info"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_url_errors() {
        let config = ParserConfig::default();
        let err = parse_invoice(&config, "a.pdf", b"%PDF-1.4".to_vec())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("parser.url"));
    }

    #[tokio::test]
    async fn encrypted_rejected_before_upstream_call() {
        let config = ParserConfig {
            url: Some("http://127.0.0.1:1/parse-invoices".to_string()),
            timeout_secs: 1,
        };
        let mut bytes = b"%PDF-1.7 ".to_vec();
        bytes.extend_from_slice(b"/Encrypt");
        let err = parse_invoice(&config, "locked.pdf", bytes).await.unwrap_err();
        assert!(err.to_string().contains("encrypted or password-protected"));
    }
}
