//! Core record types stored in SQLite and shaped into API responses.

use serde::Serialize;

/// Application user. `password_hash` is `None` for accounts created through
/// an external provider sign-in that never set a password.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// External-provider identity linked to a [`User`].
#[derive(Debug, Clone)]
pub struct Account {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub provider_account_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Append-only chat message. `role` is either `"user"` or `"assistant"`.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: i64,
}

/// Processing state of an uploaded invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Processing,
    Processed,
    Error,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::Processed => "processed",
            InvoiceStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub id: String,
    pub user_id: String,
    pub filename: String,
    pub status: String,
    pub extracted_data: serde_json::Value,
    pub classified_data: serde_json::Value,
    #[serde(skip_serializing)]
    pub embedding: Option<Vec<u8>>,
    pub error: Option<String>,
    #[serde(skip_serializing)]
    pub original_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One ranked hit from invoice search (keyword or semantic).
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceSearchHit {
    pub invoice_id: String,
    pub filename: String,
    pub relevance_score: f64,
    pub matched_content: String,
    pub extracted_data: serde_json::Value,
}
