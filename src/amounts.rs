//! Tolerant parsing of amounts and fields out of parsed invoice JSON.
//!
//! The parsing service returns free-text CSV blocks grouped into sections
//! (`vendor_info`, `invoice_details`, `payment_info`, ...), each a list of
//! `{"data": "Field Name,Value\n..."}` entries. Values are whatever the
//! document said: currency symbols, thousands separators, parenthesised
//! negatives, or the literal `UNKNOWN`. Everything in this module is
//! best-effort — a field that cannot be parsed yields `None` and the caller
//! decides whether to skip or error.

use chrono::NaiveDate;
use regex::Regex;
use std::sync::OnceLock;

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+(?:\.\d+)?").expect("static regex"))
}

/// Parse a monetary amount out of a raw field value.
///
/// Strips currency symbols and codes, commas, and whitespace; a value in
/// parentheses is treated as negative (accounting convention). Returns
/// `None` for `UNKNOWN`, empty, or otherwise unparsable input.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("unknown") {
        return None;
    }

    let negative = trimmed.starts_with('(') && trimmed.ends_with(')');

    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    let m = number_re().find(&cleaned)?;
    let value: f64 = m.as_str().parse().ok()?;

    Some(if negative { -value.abs() } else { value })
}

/// Look up a `Field Name,Value` row in one CSV section of the extracted JSON.
///
/// Matches the field name case-insensitively against the first CSV column and
/// returns the remainder of the line (so values containing commas survive).
/// Malformed entries and free-text lines without a comma are skipped, not
/// treated as the end of the section.
pub fn csv_field(extracted: &serde_json::Value, section: &str, field: &str) -> Option<String> {
    let entries = extracted.get(section)?.as_array()?;

    for entry in entries {
        let Some(data) = entry.get("data").and_then(|d| d.as_str()) else {
            continue;
        };
        for line in data.lines() {
            let Some((name, value)) = line.split_once(',') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case(field) {
                let value = value.trim();
                if !value.is_empty() && !value.eq_ignore_ascii_case("unknown") {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

/// Total amount of an invoice, trying the payment section's usual field
/// names in order of preference.
pub fn invoice_total(extracted: &serde_json::Value) -> Option<f64> {
    for field in ["Total Amount Due", "Total", "Amount Due", "Balance Due"] {
        if let Some(raw) = csv_field(extracted, "payment_info", field) {
            if let Some(amount) = parse_amount(&raw) {
                return Some(amount);
            }
        }
    }
    None
}

pub fn invoice_vendor(extracted: &serde_json::Value) -> Option<String> {
    csv_field(extracted, "vendor_info", "Vendor Name")
}

pub fn invoice_date(extracted: &serde_json::Value) -> Option<NaiveDate> {
    let raw = csv_field(extracted, "invoice_details", "Invoice Date")?;
    parse_date(&raw)
}

/// Parse a date in the formats invoices actually use.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for fmt in ["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%B %d, %Y", "%d %B %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date);
        }
    }
    None
}

/// `"YYYY-MM"` bucket key for per-month grouping.
pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_amount() {
        assert_eq!(parse_amount("1500"), Some(1500.0));
        assert_eq!(parse_amount("1500.25"), Some(1500.25));
    }

    #[test]
    fn strips_currency_and_commas() {
        assert_eq!(parse_amount("$1,500.00"), Some(1500.0));
        assert_eq!(parse_amount("£ 99.50"), Some(99.5));
        assert_eq!(parse_amount("USD 12,345.67"), Some(12345.67));
    }

    #[test]
    fn parentheses_mean_negative() {
        assert_eq!(parse_amount("($250.00)"), Some(-250.0));
        assert_eq!(parse_amount("(1,000)"), Some(-1000.0));
    }

    #[test]
    fn preserves_explicit_negative() {
        assert_eq!(parse_amount("-42.10"), Some(-42.1));
    }

    #[test]
    fn unknown_and_garbage_are_none() {
        assert_eq!(parse_amount("UNKNOWN"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("n/a"), None);
        assert_eq!(parse_amount("see attached"), None);
    }

    fn sample_extracted() -> serde_json::Value {
        serde_json::json!({
            "vendor_info": [
                {"data": "Field Name,Value\nVendor Name,ACME Corp\nVendor Address,1 Main St"}
            ],
            "invoice_details": [
                {"data": "Field Name,Value\nInvoice Number,INV-001\nInvoice Date,2026-07-14"}
            ],
            "payment_info": [
                {"data": "Field Name,Value\nTotal Amount Due,$1,500.00\nBalance Due,$1,500.00"}
            ],
            "line_items": [],
            "taxes_fees": [],
            "compliance_flags": []
        })
    }

    #[test]
    fn csv_field_lookup() {
        let data = sample_extracted();
        assert_eq!(
            csv_field(&data, "vendor_info", "Vendor Name").as_deref(),
            Some("ACME Corp")
        );
        assert_eq!(
            csv_field(&data, "vendor_info", "vendor name").as_deref(),
            Some("ACME Corp")
        );
        assert_eq!(csv_field(&data, "vendor_info", "Tax ID"), None);
    }

    #[test]
    fn csv_field_skips_free_text_lines() {
        let data = serde_json::json!({
            "vendor_info": [
                {"data": "Field Name,Value\nSee attached notes\nVendor Name,ACME Corp"}
            ]
        });
        assert_eq!(
            csv_field(&data, "vendor_info", "Vendor Name").as_deref(),
            Some("ACME Corp")
        );
    }

    #[test]
    fn csv_field_skips_malformed_entries() {
        // A non-CSV first entry must not end the scan of later entries
        let data = serde_json::json!({
            "payment_info": [
                {"note": "no data key"},
                {"data": 42},
                {"data": "Payment terms are net 30.\nTotal Amount Due,$75.00"}
            ]
        });
        assert_eq!(
            csv_field(&data, "payment_info", "Total Amount Due").as_deref(),
            Some("$75.00")
        );
        assert_eq!(invoice_total(&data), Some(75.0));
    }

    #[test]
    fn csv_field_value_keeps_commas() {
        let data = serde_json::json!({
            "payment_info": [{"data": "Field Name,Value\nTotal Amount Due,$1,500.00"}]
        });
        assert_eq!(
            csv_field(&data, "payment_info", "Total Amount Due").as_deref(),
            Some("$1,500.00")
        );
    }

    #[test]
    fn total_from_payment_section() {
        let data = sample_extracted();
        assert_eq!(invoice_total(&data), Some(1500.0));
    }

    #[test]
    fn total_missing_is_none() {
        let data = serde_json::json!({
            "payment_info": [{"data": "Field Name,Value\nTotal Amount Due,UNKNOWN"}]
        });
        assert_eq!(invoice_total(&data), None);
    }

    #[test]
    fn vendor_and_date() {
        let data = sample_extracted();
        assert_eq!(invoice_vendor(&data).as_deref(), Some("ACME Corp"));
        let date = invoice_date(&data).unwrap();
        assert_eq!(month_key(date), "2026-07");
    }

    #[test]
    fn date_formats() {
        assert!(parse_date("2026-01-31").is_some());
        assert!(parse_date("01/31/2026").is_some());
        assert!(parse_date("January 31, 2026").is_some());
        assert!(parse_date("not a date").is_none());
    }
}
