//! Database statistics and health overview.
//!
//! Quick summary of what's in the database: users, chat activity, invoice
//! counts by status, and embedding coverage. Used by `lbx stats` to confirm
//! uploads and embeddings are flowing.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

/// Per-status invoice counts.
struct StatusStats {
    status: String,
    count: i64,
    embedded_count: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&pool)
        .await?;

    let total_sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_sessions")
        .fetch_one(&pool)
        .await?;

    let total_messages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
        .fetch_one(&pool)
        .await?;

    let total_invoices: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invoices")
        .fetch_one(&pool)
        .await?;

    let total_searches: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM invoice_searches")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("LedgerBox — Database Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Users:       {}", total_users);
    println!("  Sessions:    {}", total_sessions);
    println!("  Messages:    {}", total_messages);
    println!("  Invoices:    {}", total_invoices);
    println!("  Searches:    {}", total_searches);

    let status_rows = sqlx::query(
        r#"
        SELECT
            status,
            COUNT(*) AS count,
            COUNT(embedding) AS embedded_count
        FROM invoices
        GROUP BY status
        ORDER BY count DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let status_stats: Vec<StatusStats> = status_rows
        .iter()
        .map(|row| StatusStats {
            status: row.get("status"),
            count: row.get("count"),
            embedded_count: row.get("embedded_count"),
        })
        .collect();

    if !status_stats.is_empty() {
        println!();
        println!("  By status:");
        println!("  {:<12} {:>8} {:>10}", "STATUS", "COUNT", "EMBEDDED");
        println!("  {}", "-".repeat(34));
        for s in &status_stats {
            println!("  {:<12} {:>8} {:>10}", s.status, s.count, s.embedded_count);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
