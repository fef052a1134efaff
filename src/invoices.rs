//! Invoice pipeline and queries.
//!
//! Upload flow: create a `processing` row → persist the original bytes →
//! parse via the external service → derive flat fields with regex/CSV
//! lookups → embed (non-fatal) → mark `processed`. Any failure is caught,
//! logged, and stored on the row as status `error`; a single upstream
//! failure terminates the request with no retry.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use uuid::Uuid;

use crate::amounts;
use crate::config::Config;
use crate::embedding;
use crate::models::{Invoice, InvoiceSearchHit, InvoiceStatus};
use crate::parser;

/// Result of an upload request, mirrored into the HTTP response.
#[derive(Debug, serde::Serialize)]
pub struct UploadOutcome {
    pub id: String,
    pub filename: String,
    pub status: String,
    pub message: String,
}

/// Run the full upload pipeline for one file.
pub async fn process_upload(
    config: &Config,
    pool: &SqlitePool,
    user_id: &str,
    filename: &str,
    bytes: Vec<u8>,
) -> Result<UploadOutcome> {
    let invoice_id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();

    let original_path = save_original(config, user_id, &invoice_id, filename, &bytes)?;

    sqlx::query(
        r#"
        INSERT INTO invoices (id, user_id, filename, status, original_path, created_at, updated_at)
        VALUES (?, ?, ?, 'processing', ?, ?, ?)
        "#,
    )
    .bind(&invoice_id)
    .bind(user_id)
    .bind(filename)
    .bind(original_path.to_string_lossy().as_ref())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    match run_pipeline(config, filename, bytes).await {
        Ok((extracted, classified, embedding_blob)) => {
            sqlx::query(
                r#"
                UPDATE invoices
                SET status = 'processed', extracted_json = ?, classified_json = ?,
                    embedding = ?, error = NULL, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(extracted.to_string())
            .bind(classified.to_string())
            .bind(embedding_blob)
            .bind(Utc::now().timestamp())
            .bind(&invoice_id)
            .execute(pool)
            .await?;

            tracing::info!(invoice_id = %invoice_id, user_id, "invoice processed");
            Ok(UploadOutcome {
                id: invoice_id,
                filename: filename.to_string(),
                status: InvoiceStatus::Processed.as_str().to_string(),
                message: "Invoice processed successfully".to_string(),
            })
        }
        Err(e) => {
            let message = e.to_string();
            tracing::warn!(invoice_id = %invoice_id, user_id, error = %message, "invoice processing failed");

            sqlx::query("UPDATE invoices SET status = 'error', error = ?, updated_at = ? WHERE id = ?")
                .bind(&message)
                .bind(Utc::now().timestamp())
                .bind(&invoice_id)
                .execute(pool)
                .await?;

            Ok(UploadOutcome {
                id: invoice_id,
                filename: filename.to_string(),
                status: InvoiceStatus::Error.as_str().to_string(),
                message,
            })
        }
    }
}

/// Parse, classify, and embed. Returns the extracted JSON, the derived flat
/// fields, and the embedding blob (None when the provider is disabled or the
/// embedding call failed — embedding failure does not fail the upload).
async fn run_pipeline(
    config: &Config,
    filename: &str,
    bytes: Vec<u8>,
) -> Result<(serde_json::Value, serde_json::Value, Option<Vec<u8>>)> {
    let extracted = parser::parse_invoice(&config.parser, filename, bytes).await?;
    let classified = classify_fields(&extracted);

    let embedding_blob = if config.embedding.is_enabled() {
        let content = embedding_content(filename, &extracted, &classified);
        match embedding::embed_query(&config.embedding, &content).await {
            Ok(vec) => Some(embedding::vec_to_blob(&vec)),
            Err(e) => {
                tracing::warn!(error = %e, "embedding failed; storing invoice without vector");
                None
            }
        }
    } else {
        None
    };

    Ok((extracted, classified, embedding_blob))
}

/// Derive the flat fields the dashboard and chat answers work from.
pub fn classify_fields(extracted: &serde_json::Value) -> serde_json::Value {
    let vendor = amounts::invoice_vendor(extracted);
    let number = amounts::csv_field(extracted, "invoice_details", "Invoice Number");
    let date = amounts::invoice_date(extracted).map(|d| d.format("%Y-%m-%d").to_string());
    let currency = amounts::csv_field(extracted, "invoice_details", "Currency");
    let total = amounts::invoice_total(extracted);

    serde_json::json!({
        "vendor": vendor,
        "invoice_number": number,
        "invoice_date": date,
        "currency": currency,
        "total": total,
    })
}

/// Flatten the parse result into one text blob for the embedding call.
fn embedding_content(
    filename: &str,
    extracted: &serde_json::Value,
    classified: &serde_json::Value,
) -> String {
    let mut parts = vec![format!("filename: {}", filename)];

    if let Some(obj) = extracted.as_object() {
        for (section, entries) in obj {
            if let Some(entries) = entries.as_array() {
                for entry in entries {
                    if let Some(data) = entry.get("data").and_then(|d| d.as_str()) {
                        parts.push(format!("{}: {}", section, data.replace('\n', " ")));
                    }
                }
            }
        }
    }

    if let Some(obj) = classified.as_object() {
        for (key, value) in obj {
            if !value.is_null() {
                parts.push(format!("{}: {}", key, value));
            }
        }
    }

    parts.join(" ")
}

fn save_original(
    config: &Config,
    user_id: &str,
    invoice_id: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    let dir = config.storage.uploads_dir.join(user_id);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}_{}", invoice_id, sanitize_filename(filename)));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ============ Queries ============

pub async fn list_invoices(
    pool: &SqlitePool,
    user_id: &str,
    offset: i64,
    limit: i64,
) -> Result<Vec<Invoice>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, filename, status, extracted_json, classified_json,
               embedding, error, original_path, created_at, updated_at
        FROM invoices
        WHERE user_id = ?
        ORDER BY created_at DESC, id
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(row_to_invoice).collect())
}

pub async fn get_invoice(
    pool: &SqlitePool,
    user_id: &str,
    invoice_id: &str,
) -> Result<Option<Invoice>> {
    let row = sqlx::query(
        r#"
        SELECT id, user_id, filename, status, extracted_json, classified_json,
               embedding, error, original_path, created_at, updated_at
        FROM invoices
        WHERE id = ? AND user_id = ?
        "#,
    )
    .bind(invoice_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(row_to_invoice))
}

fn row_to_invoice(row: &sqlx::sqlite::SqliteRow) -> Invoice {
    let extracted: String = row.get("extracted_json");
    let classified: String = row.get("classified_json");
    Invoice {
        id: row.get("id"),
        user_id: row.get("user_id"),
        filename: row.get("filename"),
        status: row.get("status"),
        extracted_data: serde_json::from_str(&extracted).unwrap_or(serde_json::Value::Null),
        classified_data: serde_json::from_str(&classified).unwrap_or(serde_json::Value::Null),
        embedding: row.get("embedding"),
        error: row.get("error"),
        original_path: row.get("original_path"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

// ============ Search ============

/// Search the user's processed invoices.
///
/// `keyword` does a case-insensitive substring filter over stored JSON and
/// filenames; `semantic` embeds the query and runs a bounded linear cosine
/// scan. Every query is recorded in the `invoice_searches` audit log.
pub async fn search_invoices(
    config: &Config,
    pool: &SqlitePool,
    user_id: &str,
    query: &str,
    mode: &str,
) -> Result<Vec<InvoiceSearchHit>> {
    let hits = match mode {
        "keyword" => keyword_search(pool, user_id, query, config.retrieval.final_limit).await?,
        "semantic" => semantic_search(config, pool, user_id, query).await?,
        other => anyhow::bail!("Unknown search mode: {}. Use keyword or semantic.", other),
    };

    record_search(pool, user_id, query, &hits).await?;
    Ok(hits)
}

async fn keyword_search(
    pool: &SqlitePool,
    user_id: &str,
    query: &str,
    limit: i64,
) -> Result<Vec<InvoiceSearchHit>> {
    let needle = query.to_lowercase();
    if needle.trim().is_empty() {
        return Ok(Vec::new());
    }

    let invoices = list_processed(pool, user_id, i64::MAX).await?;

    let mut hits = Vec::new();
    for invoice in invoices {
        let haystack = format!(
            "{} {} {}",
            invoice.filename.to_lowercase(),
            invoice.extracted_data.to_string().to_lowercase(),
            invoice.classified_data.to_string().to_lowercase(),
        );
        if haystack.contains(&needle) {
            hits.push(InvoiceSearchHit {
                matched_content: matched_content(&invoice),
                invoice_id: invoice.id,
                filename: invoice.filename,
                relevance_score: 1.0,
                extracted_data: invoice.extracted_data,
            });
        }
        if hits.len() as i64 >= limit {
            break;
        }
    }

    Ok(hits)
}

async fn semantic_search(
    config: &Config,
    pool: &SqlitePool,
    user_id: &str,
    query: &str,
) -> Result<Vec<InvoiceSearchHit>> {
    let query_vec = embedding::embed_query(&config.embedding, query).await?;
    let invoices = list_processed(pool, user_id, config.retrieval.max_scan).await?;

    let threshold = config.retrieval.similarity_threshold;
    let mut scored: Vec<(f64, Invoice)> = invoices
        .into_iter()
        .filter_map(|invoice| {
            let blob = invoice.embedding.as_deref()?;
            let vec = embedding::blob_to_vec(blob);
            let similarity = embedding::cosine_similarity(&query_vec, &vec);
            if similarity >= threshold {
                Some((similarity as f64, invoice))
            } else {
                None
            }
        })
        .collect();

    // Sort: similarity desc, then id asc for determinism
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.id.cmp(&b.1.id))
    });
    scored.truncate(config.retrieval.final_limit as usize);

    Ok(scored
        .into_iter()
        .map(|(score, invoice)| InvoiceSearchHit {
            matched_content: matched_content(&invoice),
            invoice_id: invoice.id,
            filename: invoice.filename,
            relevance_score: score,
            extracted_data: invoice.extracted_data,
        })
        .collect())
}

/// The user's processed invoices, newest first, bounded.
async fn list_processed(pool: &SqlitePool, user_id: &str, limit: i64) -> Result<Vec<Invoice>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, filename, status, extracted_json, classified_json,
               embedding, error, original_path, created_at, updated_at
        FROM invoices
        WHERE user_id = ? AND status = 'processed'
        ORDER BY created_at DESC, id
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(row_to_invoice).collect())
}

/// Short display string for a hit: filename plus the derived fields.
fn matched_content(invoice: &Invoice) -> String {
    let mut parts = vec![format!("Filename: {}", invoice.filename)];
    if let Some(obj) = invoice.classified_data.as_object() {
        for (key, value) in obj {
            if !value.is_null() {
                parts.push(format!("{}: {}", key, display_value(value)));
            }
        }
    }
    parts.join(" | ")
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn record_search(
    pool: &SqlitePool,
    user_id: &str,
    query: &str,
    hits: &[InvoiceSearchHit],
) -> Result<()> {
    sqlx::query(
        "INSERT INTO invoice_searches (id, user_id, query, results_json, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(query)
    .bind(serde_json::to_string(hits)?)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Export ============

/// Exported file locations for one invoice.
#[derive(Debug, serde::Serialize)]
pub struct ExportPaths {
    pub json_path: String,
    pub csv_path: String,
}

/// Write the invoice's field tables to the exports directory as JSON + CSV.
pub async fn export_invoice(
    config: &Config,
    pool: &SqlitePool,
    user_id: &str,
    invoice_id: &str,
) -> Result<Option<ExportPaths>> {
    let Some(invoice) = get_invoice(pool, user_id, invoice_id).await? else {
        return Ok(None);
    };

    let dir = config.storage.exports_dir.join(user_id);
    std::fs::create_dir_all(&dir)?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let json_path = dir.join(format!("invoice_{}_{}.json", invoice.id, stamp));
    let csv_path = dir.join(format!("invoice_{}_{}.csv", invoice.id, stamp));

    std::fs::write(&json_path, serde_json::to_string_pretty(&invoice)?)?;
    std::fs::write(&csv_path, export_csv(&invoice))?;

    tracing::info!(invoice_id = %invoice.id, "invoice exported");
    Ok(Some(ExportPaths {
        json_path: json_path.to_string_lossy().into_owned(),
        csv_path: csv_path.to_string_lossy().into_owned(),
    }))
}

/// Field table: derived fields first, then the raw CSV sections.
fn export_csv(invoice: &Invoice) -> String {
    let mut out = String::from("Field,Value\n");

    out.push_str(&format!("Invoice ID,{}\n", csv_escape(&invoice.id)));
    out.push_str(&format!("Filename,{}\n", csv_escape(&invoice.filename)));
    out.push_str(&format!("Status,{}\n", csv_escape(&invoice.status)));

    if let Some(obj) = invoice.classified_data.as_object() {
        for (key, value) in obj {
            if !value.is_null() {
                out.push_str(&format!(
                    "{},{}\n",
                    csv_escape(key),
                    csv_escape(&display_value(value))
                ));
            }
        }
    }

    if let Some(obj) = invoice.extracted_data.as_object() {
        for (section, entries) in obj {
            if let Some(entries) = entries.as_array() {
                for entry in entries {
                    if let Some(data) = entry.get("data").and_then(|d| d.as_str()) {
                        out.push_str(&format!(
                            "{},{}\n",
                            csv_escape(section),
                            csv_escape(&data.replace('\n', "; "))
                        ));
                    }
                }
            }
        }
    }

    out
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db;

    async fn seed_user(pool: &SqlitePool, id: &str) {
        sqlx::query(
            "INSERT INTO users (id, email, name, password_hash, created_at, updated_at) VALUES (?, ?, NULL, NULL, 0, 0)",
        )
        .bind(id)
        .bind(format!("{}@example.com", id))
        .execute(pool)
        .await
        .unwrap();
    }

    pub(crate) async fn seed_invoice(
        pool: &SqlitePool,
        user_id: &str,
        id: &str,
        status: &str,
        vendor: &str,
        total: &str,
        date: &str,
        embedding_text: Option<&str>,
    ) {
        let extracted = serde_json::json!({
            "vendor_info": [{"data": format!("Field Name,Value\nVendor Name,{}", vendor)}],
            "invoice_details": [{"data": format!("Field Name,Value\nInvoice Number,INV-{}\nInvoice Date,{}", id, date)}],
            "payment_info": [{"data": format!("Field Name,Value\nTotal Amount Due,{}", total)}],
            "line_items": [], "taxes_fees": [], "compliance_flags": []
        });
        let classified = classify_fields(&extracted);
        let blob = embedding_text
            .map(|t| crate::embedding::vec_to_blob(&crate::embedding::mock_embedding(t)));

        sqlx::query(
            r#"
            INSERT INTO invoices (id, user_id, filename, status, extracted_json, classified_json, embedding, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(format!("{}.pdf", id))
        .bind(status)
        .bind(extracted.to_string())
        .bind(classified.to_string())
        .bind(blob)
        .bind(id.as_bytes()[0] as i64)
        .bind(0i64)
        .execute(pool)
        .await
        .unwrap();
    }

    #[test]
    fn classify_fields_derives_totals() {
        let extracted = serde_json::json!({
            "vendor_info": [{"data": "Field Name,Value\nVendor Name,ACME Corp"}],
            "invoice_details": [{"data": "Field Name,Value\nInvoice Number,INV-9\nInvoice Date,2026-03-02"}],
            "payment_info": [{"data": "Field Name,Value\nTotal Amount Due,$250.75"}],
        });
        let classified = classify_fields(&extracted);
        assert_eq!(classified["vendor"], "ACME Corp");
        assert_eq!(classified["invoice_number"], "INV-9");
        assert_eq!(classified["invoice_date"], "2026-03-02");
        assert_eq!(classified["total"], 250.75);
    }

    #[test]
    fn csv_escape_quotes() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn keyword_search_filters_and_audits() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        seed_invoice(&pool, "u1", "a1", "processed", "ACME Corp", "$100", "2026-01-05", None).await;
        seed_invoice(&pool, "u1", "b2", "processed", "Globex", "$200", "2026-01-06", None).await;
        seed_invoice(&pool, "u1", "c3", "error", "ACME Corp", "$300", "2026-01-07", None).await;

        let config = crate::config::Config::for_tests();

        let hits = search_invoices(&config, &pool, "u1", "acme", "keyword")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1, "error-status rows are excluded");
        assert_eq!(hits[0].invoice_id, "a1");
        assert!(hits[0].matched_content.contains("ACME Corp"));

        let audited: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM invoice_searches WHERE user_id = 'u1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(audited, 1);
    }

    #[tokio::test]
    async fn semantic_search_ranks_by_similarity() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        // Embeddings seeded from known texts; the query embeds one of them
        // exactly, so it must rank first with similarity 1.0.
        seed_invoice(&pool, "u1", "a1", "processed", "ACME", "$1", "2026-01-01", Some("cloud hosting")).await;
        seed_invoice(&pool, "u1", "b2", "processed", "Globex", "$2", "2026-01-02", Some("office chairs")).await;

        let mut config = crate::config::Config::for_tests();
        config.embedding.provider = "mock".to_string();
        config.retrieval.similarity_threshold = 0.99;

        let hits = search_invoices(&config, &pool, "u1", "cloud hosting", "semantic")
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].invoice_id, "a1");
        assert!((hits[0].relevance_score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unknown_search_mode_errors() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        let config = crate::config::Config::for_tests();
        let err = search_invoices(&config, &pool, "u1", "x", "hybrid")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown search mode"));
    }

    #[tokio::test]
    async fn upload_with_encrypted_pdf_stores_error_status() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;

        let mut config = crate::config::Config::for_tests();
        config.storage.uploads_dir = tmp.path().join("uploads");
        config.storage.exports_dir = tmp.path().join("exports");
        config.parser.url = Some("http://127.0.0.1:1/parse-invoices".to_string());

        let mut bytes = b"%PDF-1.7 ".to_vec();
        bytes.extend_from_slice(b"/Encrypt 5 0 R");

        let outcome = process_upload(&config, &pool, "u1", "locked.pdf", bytes)
            .await
            .unwrap();
        assert_eq!(outcome.status, "error");
        assert!(outcome.message.contains("encrypted or password-protected"));

        let stored: (String, Option<String>) =
            sqlx::query_as("SELECT status, error FROM invoices WHERE id = ?")
                .bind(&outcome.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(stored.0, "error");
        assert!(stored.1.unwrap().contains("encrypted or password-protected"));
    }

    #[tokio::test]
    async fn export_writes_json_and_csv() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        seed_invoice(&pool, "u1", "a1", "processed", "ACME Corp", "$100", "2026-01-05", None).await;

        let mut config = crate::config::Config::for_tests();
        config.storage.exports_dir = tmp.path().join("exports");

        let paths = export_invoice(&config, &pool, "u1", "a1").await.unwrap().unwrap();
        let csv = std::fs::read_to_string(&paths.csv_path).unwrap();
        assert!(csv.starts_with("Field,Value\n"));
        assert!(csv.contains("vendor,ACME Corp"));
        let json = std::fs::read_to_string(&paths.json_path).unwrap();
        assert!(json.contains("\"a1\""));

        // Not owned → None
        let missing = export_invoice(&config, &pool, "u2", "a1").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn list_respects_offset_and_limit() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        seed_invoice(&pool, "u1", "a1", "processed", "A", "$1", "2026-01-01", None).await;
        seed_invoice(&pool, "u1", "b2", "processed", "B", "$2", "2026-01-02", None).await;
        seed_invoice(&pool, "u1", "c3", "processing", "C", "$3", "2026-01-03", None).await;

        let all = list_invoices(&pool, "u1", 0, 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let page = list_invoices(&pool, "u1", 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
    }
}
