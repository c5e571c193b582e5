use crate::invoice::ExtractedInvoice;
use crate::purchase_order::amount_from_text;
use regex::Regex;

/// Main extraction entry point: keyword-anchored patterns for Mexican CFDI invoices.
pub fn extract(text: &str) -> ExtractedInvoice {
    ExtractedInvoice {
        supplier: extract_supplier(text),
        grand_total: extract_grand_total(text),
        currency: extract_currency(text),
        recipient: extract_recipient(text),
        date: extract_date(text),
        folio: extract_folio(text),
    }
}

// ---------------------------------------------------------------------------
// Scalar field extractors
// ---------------------------------------------------------------------------

fn extract_folio(text: &str) -> Option<String> {
    // "Folio: A-1029"; "Folio Fiscal" is the SAT UUID, not the invoice number.
    let re = Regex::new(r"(?i)\bfolio\s*(?:interno|no\.?)?\s*[:#]?\s*([A-Za-z0-9][A-Za-z0-9\-]*)")
        .ok()?;
    re.captures_iter(text)
        .map(|c| c[1].to_string())
        .find(|v| !v.eq_ignore_ascii_case("fiscal"))
}

fn extract_date(text: &str) -> Option<String> {
    let re = Regex::new(
        r"(?i)\bfecha(?:\s+de\s+emisi[oó]n)?\s*:?\s*(\d{4}-\d{2}-\d{2}|\d{1,2}[/\-]\d{1,2}[/\-]\d{4})",
    )
    .ok()?;
    let raw = re.captures(text)?[1].to_string();
    Some(normalize_date(&raw))
}

/// `dd/mm/yyyy` and `dd-mm-yyyy` become `yyyy-mm-dd`; ISO dates pass through.
fn normalize_date(raw: &str) -> String {
    let parts: Vec<&str> = raw.split(['/', '-']).collect();
    match parts.as_slice() {
        [day, month, year] if year.len() == 4 => format!("{year}-{month:0>2}-{day:0>2}"),
        _ => raw.to_string(),
    }
}

fn extract_currency(text: &str) -> Option<String> {
    let re = Regex::new(r"(?i)\b(MXN|USD|EUR)\b").ok()?;
    if let Some(cap) = re.captures(text) {
        return Some(cap[1].to_uppercase());
    }
    let lower = text.to_lowercase();
    if lower.contains("pesos") || lower.contains("m.n.") {
        Some("MXN".to_string())
    } else if lower.contains("dolares") || lower.contains("dólares") {
        Some("USD".to_string())
    } else {
        None
    }
}

fn extract_grand_total(text: &str) -> Option<f64> {
    // `\btotal` never matches inside "Subtotal". The last total wins, since
    // CFDI layouts print the amount to pay at the bottom.
    let re = Regex::new(
        r"(?i)\b(?:gran\s+)?total\b(?:\s+a\s+pagar)?\s*:?\s*\$?\s*(\d[\d,]*(?:\.\d+)?)",
    )
    .ok()?;
    re.captures_iter(text)
        .filter_map(|c| amount_from_text(&c[1]))
        .last()
}

fn extract_supplier(text: &str) -> Option<String> {
    labelled_line(text, r"emisor|proveedor|vendedor")
}

fn extract_recipient(text: &str) -> Option<String> {
    labelled_line(text, r"receptor|cliente|facturar\s+a")
}

/// Rest of the first line that starts with one of `labels`.
fn labelled_line(text: &str, labels: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?im)^\s*(?:{labels})\s*:\s*(.+?)\s*$")).ok()?;
    re.captures(text)
        .map(|c| c[1].to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_date() {
        assert_eq!(normalize_date("2/3/2025"), "2025-03-02");
        assert_eq!(normalize_date("15-11-2024"), "2024-11-15");
        assert_eq!(normalize_date("2025-03-02"), "2025-03-02");
    }

    #[test]
    fn test_folio_skips_fiscal_uuid() {
        assert_eq!(
            extract_folio("Folio Fiscal: 6F1C2A9E\nFolio: 881").as_deref(),
            Some("881")
        );
        assert_eq!(extract_folio("Folio Fiscal: 6F1C2A9E"), None);
    }

    #[test]
    fn test_last_total_wins() {
        let text = "Total: 10.00\nTotal partida\nTotal: 1,500.50";
        assert_eq!(extract_grand_total(text), Some(1500.5));
    }
}
