// src/purchase_order.rs

use crate::flexible_json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

// Synonym lists, highest precedence first. The last entry of each list is the
// canonical key, so a normalized order normalizes to itself.
pub const ID_KEYS: &[&str] = &["id", "oc_id", "order_id"];
pub const SUPPLIER_KEYS: &[&str] = &["VendorName", "vendor_name", "proveedor", "supplier"];
pub const COMPANY_KEYS: &[&str] = &["our_company", "empresa", "receptor", "company"];
pub const AMOUNT_KEYS: &[&str] = &["monto", "total", "amount"];
pub const CURRENCY_KEYS: &[&str] = &["moneda", "currency"];
pub const ATTACHED_DATA_KEYS: &[&str] = &["oc_attached_data", "datos_adicionales", "attached_data"];

const CONCEPT_KEYS: &[&str] = &["concepto", "description", "concept"];
const ORDER_DATE_KEYS: &[&str] = &["order_date"];
const SERVICES_KEYS: &[&str] = &["services"];
const AUTHORIZED_BY_KEYS: &[&str] = &["authorized_by"];

// Keys read from the nested attached-data object.
const ATTACHED_CONCEPT_KEYS: &[&str] = &["oc_subject"];
const ATTACHED_ORDER_DATE_KEYS: &[&str] = &["oc_poDate"];
const ATTACHED_SERVICES_KEYS: &[&str] = &["adquired_services", "adquired_serviecs"];
const ATTACHED_AUTHORIZED_BY_KEYS: &[&str] = &["authorized_by"];

pub const DEFAULT_CURRENCY: &str = "MXN";
pub const UNKNOWN: &str = "N/A";

/// A purchase order mapped onto the canonical schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPurchaseOrder {
    pub id: String,
    pub supplier: String,
    pub company: String,
    pub amount: f64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concept: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_data: Option<Map<String, Value>>,
    /// Keys that no synonym list claimed.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Normalize one raw purchase-order object. Never fails.
pub fn normalize(raw: &Map<String, Value>) -> NormalizedPurchaseOrder {
    let amount = match first_present(raw, AMOUNT_KEYS) {
        Some(value) => parse_amount(value),
        None => 0.0,
    };

    let attached = first_present(raw, ATTACHED_DATA_KEYS).and_then(|value| match value {
        Value::Object(map) => Some(map),
        other => {
            warn!(kind = json_kind(other), "Ignoring attached data that is not an object");
            None
        }
    });

    let nested_text = |keys: &[&str]| attached.and_then(|map| first_text(map, keys));

    let services = attached
        .and_then(|map| first_present(map, ATTACHED_SERVICES_KEYS))
        .or_else(|| first_present(raw, SERVICES_KEYS))
        .and_then(text_list);

    let extra = raw
        .iter()
        .filter(|(key, _)| !is_known_key(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    NormalizedPurchaseOrder {
        id: first_text(raw, ID_KEYS).unwrap_or_else(|| UNKNOWN.to_string()),
        supplier: first_text(raw, SUPPLIER_KEYS).unwrap_or_else(|| UNKNOWN.to_string()),
        company: first_text(raw, COMPANY_KEYS).unwrap_or_else(|| UNKNOWN.to_string()),
        amount,
        currency: first_text(raw, CURRENCY_KEYS)
            .map(|c| c.to_uppercase())
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
        concept: nested_text(ATTACHED_CONCEPT_KEYS).or_else(|| first_text(raw, CONCEPT_KEYS)),
        order_date: nested_text(ATTACHED_ORDER_DATE_KEYS)
            .or_else(|| first_text(raw, ORDER_DATE_KEYS)),
        services,
        authorized_by: nested_text(ATTACHED_AUTHORIZED_BY_KEYS)
            .or_else(|| first_text(raw, AUTHORIZED_BY_KEYS)),
        attached_data: attached.cloned(),
        extra,
    }
}

/// Normalize whatever the purchase-order field decoded to.
///
/// An object is a single order, an array is a list of orders (non-object
/// entries are skipped), and a string is decoded once more in case the
/// payload was JSON-encoded twice.
pub fn normalize_list(value: Value) -> Vec<NormalizedPurchaseOrder> {
    match value {
        Value::String(inner) => match flexible_json::parse(&inner) {
            Ok(decoded @ (Value::Object(_) | Value::Array(_))) => normalize_containers(decoded),
            Ok(other) => {
                warn!(kind = json_kind(&other), "Purchase order string did not contain a list");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Purchase order string is not decodable");
                Vec::new()
            }
        },
        other => normalize_containers(other),
    }
}

fn normalize_containers(value: Value) -> Vec<NormalizedPurchaseOrder> {
    match value {
        Value::Object(map) => vec![normalize(&map)],
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .filter_map(|(index, item)| match item {
                Value::Object(map) => Some(normalize(&map)),
                other => {
                    warn!(index, kind = json_kind(&other), "Skipping non-object purchase order");
                    None
                }
            })
            .collect(),
        other => {
            warn!(kind = json_kind(&other), "Purchase orders are neither a list nor an object");
            Vec::new()
        }
    }
}

/// First synonym whose value is neither null nor a blank string.
pub fn first_present<'a>(raw: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| raw.get(*key))
        .find(|value| match value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
}

fn first_text(raw: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| raw.get(*key))
        .find_map(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn text_list(value: &Value) -> Option<Vec<String>> {
    let items: Vec<String> = match value {
        Value::Array(items) => items.iter().filter_map(scalar_text).collect(),
        other => scalar_text(other).into_iter().collect(),
    };
    (!items.is_empty()).then_some(items)
}

fn is_known_key(key: &str) -> bool {
    [
        ID_KEYS,
        SUPPLIER_KEYS,
        COMPANY_KEYS,
        AMOUNT_KEYS,
        CURRENCY_KEYS,
        ATTACHED_DATA_KEYS,
        CONCEPT_KEYS,
        ORDER_DATE_KEYS,
        SERVICES_KEYS,
        AUTHORIZED_BY_KEYS,
    ]
    .iter()
    .any(|keys| keys.contains(&key))
}

/// Coerce a raw amount to `f64`; anything unparseable is `0.0`.
pub fn parse_amount(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        Value::String(s) => amount_from_text(s).unwrap_or_else(|| {
            warn!(raw = %s, "Unparseable purchase order amount, using 0.0");
            0.0
        }),
        other => {
            warn!(kind = json_kind(other), "Purchase order amount is not numeric, using 0.0");
            0.0
        }
    }
}

/// Parse currency-formatted text such as `"$1,200.50"`.
pub fn amount_from_text(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
