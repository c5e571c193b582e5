// src/invoice.rs

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Key fields pulled from an invoice PDF by an extraction backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedInvoice {
    #[serde(default, alias = "proveedor", deserialize_with = "lenient_text")]
    pub supplier: Option<String>,
    #[serde(default, alias = "gran_total", deserialize_with = "lenient_amount")]
    pub grand_total: Option<f64>,
    #[serde(default, alias = "moneda", deserialize_with = "lenient_text")]
    pub currency: Option<String>,
    #[serde(default, alias = "receptor", deserialize_with = "lenient_text")]
    pub recipient: Option<String>,
    #[serde(default, alias = "fecha", deserialize_with = "lenient_text")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub folio: Option<String>,
}

impl ExtractedInvoice {
    /// (filled, total) field counts.
    pub fn coverage(&self) -> (usize, usize) {
        let filled = [
            self.supplier.is_some(),
            self.grand_total.is_some(),
            self.currency.is_some(),
            self.recipient.is_some(),
            self.date.is_some(),
            self.folio.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count();
        (filled, 6)
    }

    pub fn is_empty(&self) -> bool {
        self.coverage().0 == 0
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn lenient_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64().filter(|v| v.is_finite()),
        Some(Value::String(s)) => crate::purchase_order::amount_from_text(&s),
        _ => None,
    })
}

/// Decode a stored invoice blob into PDF bytes.
///
/// Accepts a bare base64 string or a `data:...;base64,` URI; embedded
/// whitespace (line-wrapped base64) is ignored.
pub fn decode_invoice_blob(blob: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match blob.find(";base64,") {
        Some(pos) if blob.trim_start().starts_with("data:") => &blob[pos + ";base64,".len()..],
        _ => blob,
    };
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact)
}

pub fn encode_invoice_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
