//! Keyword classification of chat prompts.
//!
//! A prompt is first gated by a fixed invoice-vocabulary list; anything that
//! misses the gate gets the generic canned reply. Invoice-related prompts are
//! then matched against a small set of phrasings for the aggregation
//! questions the dashboard data can answer directly. Everything else falls
//! through to the similarity lookup.

/// Vocabulary that marks a prompt as invoice-related.
const INVOICE_KEYWORDS: &[&str] = &[
    "invoice", "invoices", "vendor", "supplier", "expense", "expenses", "spend", "spending",
    "bill", "bills", "receipt", "receipts", "amount", "paid", "payment", "total",
];

/// What the chat endpoint should do with a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatIntent {
    /// "Which invoice has the highest amount?"
    HighestAmount,
    /// "How much did I spend this month?"
    TotalThisMonth,
    /// "What am I spending per vendor?"
    VendorBreakdown,
    /// "How many invoices do I have?"
    InvoiceCount,
    /// Invoice-related but not an aggregation question; run the
    /// cosine-similarity lookup with the prompt as the query.
    FindSimilar,
    /// Not invoice-related; answer with the canned reply.
    Generic,
}

pub fn classify_prompt(prompt: &str) -> ChatIntent {
    let lower = prompt.to_lowercase();

    let invoice_related = INVOICE_KEYWORDS
        .iter()
        .any(|kw| contains_word(&lower, kw));
    if !invoice_related {
        return ChatIntent::Generic;
    }

    if ["highest", "largest", "biggest", "most expensive"]
        .iter()
        .any(|p| lower.contains(p))
    {
        return ChatIntent::HighestAmount;
    }

    if lower.contains("this month") {
        return ChatIntent::TotalThisMonth;
    }

    if lower.contains("how many") {
        return ChatIntent::InvoiceCount;
    }

    if (lower.contains("vendor") || lower.contains("supplier"))
        && ["by ", "per ", "breakdown", "top", "which", "each"]
            .iter()
            .any(|p| lower.contains(p))
    {
        return ChatIntent::VendorBreakdown;
    }

    ChatIntent::FindSimilar
}

/// Word-boundary containment, so "billing" doesn't trip on "bill" backwards
/// but "bills?" and "invoice," still match.
fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_prompt() {
        assert_eq!(classify_prompt("tell me a joke"), ChatIntent::Generic);
        assert_eq!(classify_prompt("what's the weather?"), ChatIntent::Generic);
    }

    #[test]
    fn highest_amount() {
        assert_eq!(
            classify_prompt("Which invoice has the highest amount?"),
            ChatIntent::HighestAmount
        );
        assert_eq!(
            classify_prompt("show me the most expensive bill"),
            ChatIntent::HighestAmount
        );
    }

    #[test]
    fn total_this_month() {
        assert_eq!(
            classify_prompt("how much did I spend this month"),
            ChatIntent::TotalThisMonth
        );
        assert_eq!(
            classify_prompt("total expenses this month?"),
            ChatIntent::TotalThisMonth
        );
    }

    #[test]
    fn invoice_count() {
        assert_eq!(
            classify_prompt("how many invoices do I have"),
            ChatIntent::InvoiceCount
        );
    }

    #[test]
    fn vendor_breakdown() {
        assert_eq!(
            classify_prompt("spend by vendor please"),
            ChatIntent::VendorBreakdown
        );
        assert_eq!(
            classify_prompt("which supplier costs the most... wait, breakdown per supplier"),
            ChatIntent::VendorBreakdown
        );
    }

    #[test]
    fn similarity_fallthrough() {
        assert_eq!(
            classify_prompt("find the invoice about cloud hosting"),
            ChatIntent::FindSimilar
        );
    }

    #[test]
    fn word_boundaries() {
        // "billing" alone should not trip the "bill" keyword
        assert_eq!(classify_prompt("billing address form"), ChatIntent::Generic);
        // punctuation-adjacent keywords still match
        assert_eq!(
            classify_prompt("about my invoices:"),
            ChatIntent::FindSimilar
        );
    }
}
