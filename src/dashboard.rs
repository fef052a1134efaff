//! Spending aggregation over a user's invoices.
//!
//! Everything is computed from the stored `classified_json` fields at
//! request time; there is no rollup table. Invoices whose amount could not
//! be parsed still count toward `total_invoices` but contribute nothing to
//! the spend figures.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use crate::amounts;

#[derive(Debug, Serialize)]
pub struct DashboardSummary {
    pub total_invoices: i64,
    pub processed_invoices: i64,
    pub processing_invoices: i64,
    pub failed_invoices: i64,
    /// Sum of parseable totals over processed invoices.
    pub total_spend: f64,
    pub current_month_spend: f64,
    pub by_vendor: Vec<VendorSpend>,
    pub by_month: Vec<MonthSpend>,
}

#[derive(Debug, Serialize)]
pub struct VendorSpend {
    pub vendor: String,
    pub total: f64,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct MonthSpend {
    /// `YYYY-MM`.
    pub month: String,
    pub total: f64,
    pub count: i64,
}

pub async fn summarize(pool: &SqlitePool, user_id: &str) -> Result<DashboardSummary> {
    let rows = sqlx::query("SELECT status, classified_json FROM invoices WHERE user_id = ?")
        .bind(user_id)
        .fetch_all(pool)
        .await?;

    let current_month = amounts::month_key(Utc::now().date_naive());

    let mut summary = DashboardSummary {
        total_invoices: rows.len() as i64,
        processed_invoices: 0,
        processing_invoices: 0,
        failed_invoices: 0,
        total_spend: 0.0,
        current_month_spend: 0.0,
        by_vendor: Vec::new(),
        by_month: Vec::new(),
    };

    let mut vendors: BTreeMap<String, (f64, i64)> = BTreeMap::new();
    let mut months: BTreeMap<String, (f64, i64)> = BTreeMap::new();

    for row in &rows {
        let status: String = row.get("status");
        match status.as_str() {
            "processing" => {
                summary.processing_invoices += 1;
                continue;
            }
            "error" => {
                summary.failed_invoices += 1;
                continue;
            }
            _ => summary.processed_invoices += 1,
        }

        let classified: Option<String> = row.get("classified_json");
        let Some(classified) = classified else {
            continue;
        };
        let Ok(fields) = serde_json::from_str::<serde_json::Value>(&classified) else {
            continue;
        };

        // No parseable amount: the invoice counts, its spend doesn't.
        let Some(total) = fields.get("total").and_then(|t| t.as_f64()) else {
            continue;
        };

        summary.total_spend += total;

        let vendor = fields
            .get("vendor")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string();
        let entry = vendors.entry(vendor).or_insert((0.0, 0));
        entry.0 += total;
        entry.1 += 1;

        if let Some(date) = fields
            .get("invoice_date")
            .and_then(|d| d.as_str())
            .and_then(amounts::parse_date)
        {
            let month = amounts::month_key(date);
            if month == current_month {
                summary.current_month_spend += total;
            }
            let entry = months.entry(month).or_insert((0.0, 0));
            entry.0 += total;
            entry.1 += 1;
        }
    }

    summary.by_vendor = vendors
        .into_iter()
        .map(|(vendor, (total, count))| VendorSpend { vendor, total, count })
        .collect();
    // Highest-spending vendor first
    summary
        .by_vendor
        .sort_by(|a, b| b.total.partial_cmp(&a.total).unwrap_or(std::cmp::Ordering::Equal));

    summary.by_month = months
        .into_iter()
        .map(|(month, (total, count))| MonthSpend { month, total, count })
        .collect();

    Ok(summary)
}

/// The user's processed invoice with the largest parseable total.
pub async fn highest_invoice(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Option<(String, String, f64)>> {
    let rows = sqlx::query(
        "SELECT filename, classified_json FROM invoices WHERE user_id = ? AND status = 'processed'",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    let mut best: Option<(String, String, f64)> = None;
    for row in &rows {
        let classified: Option<String> = row.get("classified_json");
        let Some(classified) = classified else {
            continue;
        };
        let Ok(fields) = serde_json::from_str::<serde_json::Value>(&classified) else {
            continue;
        };
        let Some(total) = fields.get("total").and_then(|t| t.as_f64()) else {
            continue;
        };
        if best.as_ref().map(|(_, _, t)| total > *t).unwrap_or(true) {
            let filename: String = row.get("filename");
            let vendor = fields
                .get("vendor")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown")
                .to_string();
            best = Some((filename, vendor, total));
        }
    }
    Ok(best)
}
