//! Chat sessions, message history, and reply building.
//!
//! There is no language model behind the chat. Prompts are classified by
//! keyword ([`crate::classify`]) and answered from the invoice data: the
//! aggregation intents read the dashboard figures, the fallthrough intent
//! runs the semantic search, and everything else gets a canned reply. The
//! server streams the finished reply character by character.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::classify::{classify_prompt, ChatIntent};
use crate::config::Config;
use crate::dashboard;
use crate::invoices;
use crate::models::{ChatSession, Message};

/// Session titles are truncated to this many characters of the first prompt.
const TITLE_CHARS: usize = 32;

const GENERIC_REPLY: &str = "I can help you with questions about your invoices and spending. \
Try asking about your total spend, a vendor breakdown, or a specific invoice.";

// ============ Sessions ============

pub async fn list_sessions(pool: &SqlitePool, user_id: &str) -> Result<Vec<ChatSession>> {
    let rows = sqlx::query(
        "SELECT id, user_id, title, created_at, updated_at FROM chat_sessions WHERE user_id = ? ORDER BY updated_at DESC, id",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_session).collect())
}

pub async fn create_session(pool: &SqlitePool, user_id: &str, title: &str) -> Result<ChatSession> {
    let now = Utc::now().timestamp();
    let session = ChatSession {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        title: truncate_title(title),
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO chat_sessions (id, user_id, title, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&session.id)
    .bind(&session.user_id)
    .bind(&session.title)
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(pool)
    .await?;

    Ok(session)
}

pub async fn get_session(
    pool: &SqlitePool,
    user_id: &str,
    session_id: &str,
) -> Result<Option<ChatSession>> {
    let row = sqlx::query(
        "SELECT id, user_id, title, created_at, updated_at FROM chat_sessions WHERE id = ? AND user_id = ?",
    )
    .bind(session_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_session))
}

/// Delete a session and its messages atomically.
///
/// Returns `false` when the session doesn't exist or belongs to another
/// user; nothing is deleted in that case.
pub async fn delete_session(pool: &SqlitePool, user_id: &str, session_id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let owned: Option<String> =
        sqlx::query_scalar("SELECT id FROM chat_sessions WHERE id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
    if owned.is_none() {
        return Ok(false);
    }

    sqlx::query("DELETE FROM messages WHERE session_id = ?")
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

/// Resolve the session for an incoming chat turn: verify ownership of the
/// given id, or create a fresh session titled after the prompt.
pub async fn ensure_session(
    pool: &SqlitePool,
    user_id: &str,
    session_id: Option<&str>,
    prompt: &str,
) -> Result<ChatSession> {
    if let Some(id) = session_id {
        if let Some(session) = get_session(pool, user_id, id).await? {
            return Ok(session);
        }
    }
    create_session(pool, user_id, prompt).await
}

/// Seed the fixed demo walkthrough session for a user, once.
pub async fn ensure_demo_session(pool: &SqlitePool, user_id: &str) -> Result<ChatSession> {
    const DEMO_TITLE: &str = "Welcome to LedgerBox";

    let existing = sqlx::query(
        "SELECT id, user_id, title, created_at, updated_at FROM chat_sessions WHERE user_id = ? AND title = ?",
    )
    .bind(user_id)
    .bind(DEMO_TITLE)
    .fetch_optional(pool)
    .await?;
    if let Some(row) = existing {
        return Ok(row_to_session(&row));
    }

    let session = create_session(pool, user_id, DEMO_TITLE).await?;
    append_message(
        pool,
        &session.id,
        "assistant",
        "Hi! Upload an invoice and ask me things like \"how much did I spend this month?\" \
or \"which invoice has the highest amount?\".",
    )
    .await?;
    Ok(session)
}

fn truncate_title(prompt: &str) -> String {
    let title: String = prompt.trim().chars().take(TITLE_CHARS).collect();
    if title.is_empty() {
        "New chat".to_string()
    } else {
        title
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> ChatSession {
    ChatSession {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

// ============ Messages ============

pub async fn list_messages(pool: &SqlitePool, session_id: &str) -> Result<Vec<Message>> {
    let rows = sqlx::query(
        "SELECT id, session_id, role, content, created_at FROM messages WHERE session_id = ? ORDER BY created_at, id",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| Message {
            id: row.get("id"),
            session_id: row.get("session_id"),
            role: row.get("role"),
            content: row.get("content"),
            created_at: row.get("created_at"),
        })
        .collect())
}

pub async fn append_message(
    pool: &SqlitePool,
    session_id: &str,
    role: &str,
    content: &str,
) -> Result<Message> {
    let now = Utc::now().timestamp();
    let message = Message {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        role: role.to_string(),
        content: content.to_string(),
        created_at: now,
    };

    sqlx::query(
        "INSERT INTO messages (id, session_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&message.id)
    .bind(&message.session_id)
    .bind(&message.role)
    .bind(&message.content)
    .bind(message.created_at)
    .execute(pool)
    .await?;

    sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(session_id)
        .execute(pool)
        .await?;

    Ok(message)
}

// ============ Reply building ============

/// Build the full assistant reply for a prompt. The server streams the
/// result; this function is where the answer is decided.
pub async fn build_reply(
    config: &Config,
    pool: &SqlitePool,
    user_id: &str,
    prompt: &str,
) -> Result<String> {
    let reply = match classify_prompt(prompt) {
        ChatIntent::Generic => GENERIC_REPLY.to_string(),
        ChatIntent::HighestAmount => match dashboard::highest_invoice(pool, user_id).await? {
            Some((filename, vendor, total)) => format!(
                "Your highest invoice is {} from {} at {}.",
                filename,
                vendor,
                format_amount(total)
            ),
            None => "I couldn't find any processed invoices with an amount yet.".to_string(),
        },
        ChatIntent::TotalThisMonth => {
            let summary = dashboard::summarize(pool, user_id).await?;
            format!(
                "You've spent {} this month across your invoices.",
                format_amount(summary.current_month_spend)
            )
        }
        ChatIntent::InvoiceCount => {
            let summary = dashboard::summarize(pool, user_id).await?;
            format!(
                "You have {} invoices: {} processed, {} processing, {} failed.",
                summary.total_invoices,
                summary.processed_invoices,
                summary.processing_invoices,
                summary.failed_invoices
            )
        }
        ChatIntent::VendorBreakdown => {
            let summary = dashboard::summarize(pool, user_id).await?;
            if summary.by_vendor.is_empty() {
                "No vendor spending to report yet. Upload some invoices first.".to_string()
            } else {
                let mut lines = vec!["Spending by vendor:".to_string()];
                for v in summary.by_vendor.iter().take(10) {
                    lines.push(format!(
                        "- {}: {} ({} invoices)",
                        v.vendor,
                        format_amount(v.total),
                        v.count
                    ));
                }
                lines.join("\n")
            }
        }
        ChatIntent::FindSimilar => similar_invoices_reply(config, pool, user_id, prompt).await?,
    };

    Ok(reply)
}

/// Answer a free-form invoice question with a similarity lookup. Falls back
/// to keyword search when the embedding provider is disabled.
async fn similar_invoices_reply(
    config: &Config,
    pool: &SqlitePool,
    user_id: &str,
    prompt: &str,
) -> Result<String> {
    let mode = if config.embedding.is_enabled() {
        "semantic"
    } else {
        "keyword"
    };

    let hits = invoices::search_invoices(config, pool, user_id, prompt, mode).await?;
    if hits.is_empty() {
        return Ok("I couldn't find any invoices matching that.".to_string());
    }

    let mut lines = vec![format!("I found {} matching invoice(s):", hits.len())];
    for hit in hits.iter().take(5) {
        lines.push(format!("- {}", hit.matched_content));
    }
    Ok(lines.join("\n"))
}

fn format_amount(amount: f64) -> String {
    format!("${:.2}", amount)
}

#[cfg(test)]
mod tests {
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

    #[tokio::test]
    async fn session_title_truncated_to_32_chars() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        let prompt = "This is a very long first message that should become a short title";
        let session = create_session(&pool, "u1", prompt).await.unwrap();
        assert_eq!(session.title.chars().count(), 32);
        assert!(prompt.starts_with(&session.title));
    }

    #[tokio::test]
    async fn empty_title_gets_placeholder() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        let session = create_session(&pool, "u1", "   ").await.unwrap();
        assert_eq!(session.title, "New chat");
    }

    #[tokio::test]
    async fn delete_removes_messages_and_session() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        let session = create_session(&pool, "u1", "hello").await.unwrap();
        append_message(&pool, &session.id, "user", "hello").await.unwrap();
        append_message(&pool, &session.id, "assistant", "hi").await.unwrap();

        assert!(delete_session(&pool, "u1", &session.id).await.unwrap());

        let sessions = list_sessions(&pool, "u1").await.unwrap();
        assert!(sessions.is_empty());
        let messages = list_messages(&pool, &session.id).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn delete_refuses_foreign_session() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        seed_user(&pool, "u2").await;
        let session = create_session(&pool, "u1", "mine").await.unwrap();
        append_message(&pool, &session.id, "user", "mine").await.unwrap();

        assert!(!delete_session(&pool, "u2", &session.id).await.unwrap());
        assert_eq!(list_messages(&pool, &session.id).await.unwrap().len(), 1);
        assert!(get_session(&pool, "u1", &session.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ensure_session_reuses_owned_id() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        let session = create_session(&pool, "u1", "first").await.unwrap();

        let same = ensure_session(&pool, "u1", Some(&session.id), "second prompt")
            .await
            .unwrap();
        assert_eq!(same.id, session.id);

        let fresh = ensure_session(&pool, "u1", None, "second prompt").await.unwrap();
        assert_ne!(fresh.id, session.id);
        assert_eq!(fresh.title, "second prompt");
    }

    #[tokio::test]
    async fn demo_session_seeded_once() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;

        let first = ensure_demo_session(&pool, "u1").await.unwrap();
        let second = ensure_demo_session(&pool, "u1").await.unwrap();
        assert_eq!(first.id, second.id);

        let messages = list_messages(&pool, &first.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "assistant");
    }

    #[tokio::test]
    async fn generic_prompt_gets_canned_reply() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        let config = Config::for_tests();
        let reply = build_reply(&config, &pool, "u1", "tell me a joke").await.unwrap();
        assert!(reply.contains("invoices"));
    }

    #[tokio::test]
    async fn count_reply_reads_dashboard() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        crate::invoices::tests::seed_invoice(
            &pool, "u1", "a1", "processed", "ACME", "$10", "2026-01-01", None,
        )
        .await;
        crate::invoices::tests::seed_invoice(
            &pool, "u1", "b2", "error", "Globex", "$20", "2026-01-02", None,
        )
        .await;

        let config = Config::for_tests();
        let reply = build_reply(&config, &pool, "u1", "how many invoices do I have?")
            .await
            .unwrap();
        assert!(reply.contains("2 invoices"));
        assert!(reply.contains("1 processed"));
        assert!(reply.contains("1 failed"));
    }

    #[tokio::test]
    async fn highest_reply_names_the_invoice() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        crate::invoices::tests::seed_invoice(
            &pool, "u1", "a1", "processed", "ACME", "$100.00", "2026-01-01", None,
        )
        .await;
        crate::invoices::tests::seed_invoice(
            &pool, "u1", "b2", "processed", "Globex", "$900.00", "2026-01-02", None,
        )
        .await;

        let config = Config::for_tests();
        let reply = build_reply(&config, &pool, "u1", "which invoice has the highest amount?")
            .await
            .unwrap();
        assert!(reply.contains("b2.pdf"));
        assert!(reply.contains("Globex"));
        assert!(reply.contains("$900.00"));
    }

    #[tokio::test]
    async fn similar_reply_falls_back_to_keyword_when_disabled() {
        let pool = db::connect_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        crate::invoices::tests::seed_invoice(
            &pool, "u1", "a1", "processed", "CloudCo", "$10", "2026-01-01", None,
        )
        .await;

        let config = Config::for_tests();
        let reply = build_reply(&config, &pool, "u1", "find the invoice from cloudco")
            .await
            .unwrap();
        assert!(reply.contains("CloudCo"));
    }
}
