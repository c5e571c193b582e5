// src/heuristics/mod.rs

mod generic;

use crate::invoice::ExtractedInvoice;

/// Extract invoice fields from raw PDF text without an LLM.
pub fn extract_invoice(text: &str) -> ExtractedInvoice {
    generic::extract(text)
}
