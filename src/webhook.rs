// src/webhook.rs
//
// Ingestion endpoint:
//   POST /webhook  multipart (`factura`/`invoice` file, `ordenes_de_compra`/`purchase_orders` text),
//                  url-encoded form fields, or a JSON-ish body with the same fields
//   GET  /health
//
// Every response is JSON.

use crate::config::ServerSection;
use crate::flexible_json::{self, clean_control_characters, unescape_quotes};
use crate::invoice::{decode_invoice_blob, encode_invoice_bytes};
use crate::purchase_order::{NormalizedPurchaseOrder, first_present, json_kind, normalize_list};
use crate::record_db::{NewRecord, RecordStore, StoreError};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

const INVOICE_FIELDS: [&str; 2] = ["factura", "invoice"];
const ORDER_FIELDS: [&str; 2] = ["ordenes_de_compra", "purchase_orders"];
const INVOICE_BASE64_KEYS: [&str; 2] = ["factura_base64", "invoice_base64"];

pub struct AppState {
    pub store: Arc<RecordStore>,
}

/// What one request contributed, after parsing and normalization.
#[derive(Debug, Default)]
pub struct Submission {
    pub invoice_blob: Option<String>,
    pub purchase_orders: Vec<NormalizedPurchaseOrder>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Nothing usable; no row written.
    Ignored,
    Stored(i64),
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("{0}")]
    BadRequest(String),
    /// An axum extractor refused the body (size limit, malformed multipart).
    #[error("{1}")]
    Rejected(StatusCode, String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn json_error(status: StatusCode, detail: &str) -> Response {
    (status, Json(json!({"status": "error", "detail": detail}))).into_response()
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        match &self {
            WebhookError::BadRequest(detail) => json_error(StatusCode::BAD_REQUEST, detail),
            WebhookError::Rejected(status, detail) => json_error(*status, detail),
            WebhookError::Store(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        }
    }
}

pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(handle_health))
        .fallback(handle_not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves; in-flight requests finish first.
pub async fn serve(
    server: &ServerSection,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((server.host.as_str(), server.port)).await?;
    info!(addr = %listener.local_addr()?, "Webhook listening");
    let app = router(state, server.max_body_bytes());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "active"}))
}

async fn handle_not_found() -> Response {
    json_error(StatusCode::NOT_FOUND, "not found")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Multipart,
    UrlEncoded,
    /// Anything else is parsed as (possibly broken) JSON.
    Json,
}

fn body_kind(headers: &HeaderMap) -> BodyKind {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if content_type.starts_with("multipart/form-data") {
        BodyKind::Multipart
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        BodyKind::UrlEncoded
    } else {
        BodyKind::Json
    }
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<Value>, WebhookError> {
    let submission = match body_kind(request.headers()) {
        BodyKind::Multipart => {
            let multipart = Multipart::from_request(request, &state)
                .await
                .map_err(|e| WebhookError::Rejected(e.status(), e.body_text()))?;
            read_multipart(multipart).await?
        }
        BodyKind::UrlEncoded => {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(request, &state)
                .await
                .map_err(|e| WebhookError::Rejected(e.status(), e.body_text()))?;
            read_form_fields(&fields)
        }
        BodyKind::Json => {
            let body = Bytes::from_request(request, &state)
                .await
                .map_err(|e| WebhookError::Rejected(e.status(), e.body_text()))?;
            read_json_body(&body)?
        }
    };

    match ingest(&state.store, submission).await? {
        IngestOutcome::Ignored => Ok(Json(json!({"status": "ignored"}))),
        IngestOutcome::Stored(id) => Ok(Json(json!({"status": "success", "registro_id": id}))),
    }
}

async fn read_multipart(mut multipart: Multipart) -> Result<Submission, WebhookError> {
    let mut submission = Submission::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| WebhookError::Rejected(e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if INVOICE_FIELDS.contains(&name.as_str()) {
            let file_name = field.file_name().unwrap_or("unnamed").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| WebhookError::Rejected(e.status(), e.body_text()))?;
            if bytes.is_empty() {
                warn!(file = %file_name, "Invoice file is empty");
                continue;
            }
            info!(
                file = %file_name,
                bytes = bytes.len(),
                sha256 = %invoice_digest(&bytes),
                "Invoice file received"
            );
            submission.invoice_blob = Some(encode_invoice_bytes(&bytes));
        } else if ORDER_FIELDS.contains(&name.as_str()) {
            let text = field
                .text()
                .await
                .map_err(|e| WebhookError::Rejected(e.status(), e.body_text()))?;
            submission.purchase_orders = parse_purchase_order_field(&text);
        } else {
            debug!(field = %name, "Ignoring form field");
        }
    }
    Ok(submission)
}

fn read_form_fields(fields: &HashMap<String, String>) -> Submission {
    let first = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| fields.get(*key))
            .find(|value| !value.trim().is_empty())
    };
    let ignored: Vec<&str> = fields
        .keys()
        .map(String::as_str)
        .filter(|key| !ORDER_FIELDS.contains(key) && !INVOICE_BASE64_KEYS.contains(key))
        .collect();
    if !ignored.is_empty() {
        debug!(fields = ?ignored, "Ignoring form fields");
    }

    Submission {
        invoice_blob: first(&INVOICE_BASE64_KEYS[..]).and_then(|blob| invoice_from_base64(blob)),
        purchase_orders: first(&ORDER_FIELDS[..])
            .map(|text| parse_purchase_order_field(text))
            .unwrap_or_default(),
    }
}

/// Validate a base64 invoice and re-encode it without prefix or whitespace.
fn invoice_from_base64(blob: &str) -> Option<String> {
    match decode_invoice_blob(blob) {
        Ok(bytes) if !bytes.is_empty() => {
            info!(
                bytes = bytes.len(),
                sha256 = %invoice_digest(&bytes),
                "Invoice base64 received"
            );
            Some(encode_invoice_bytes(&bytes))
        }
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Invoice base64 does not decode, treating as absent");
            None
        }
    }
}

fn read_json_body(body: &[u8]) -> Result<Submission, WebhookError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| WebhookError::BadRequest(format!("body is not UTF-8: {e}")))?;
    if text.trim().is_empty() {
        return Err(WebhookError::BadRequest("empty request body".to_string()));
    }
    let value =
        flexible_json::parse(text).map_err(|e| WebhookError::BadRequest(e.to_string()))?;
    let fields = match value {
        Value::Object(fields) => fields,
        other => {
            return Err(WebhookError::BadRequest(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            )));
        }
    };

    let purchase_orders = match first_present(&fields, &ORDER_FIELDS) {
        Some(Value::String(text)) => parse_purchase_order_field(text),
        Some(value) => normalize_list(value.clone()),
        None => Vec::new(),
    };

    let invoice_blob = match first_present(&fields, &INVOICE_BASE64_KEYS) {
        Some(Value::String(blob)) => invoice_from_base64(blob),
        Some(other) => {
            warn!(kind = json_kind(other), "Invoice field is not a string, treating as absent");
            None
        }
        None => None,
    };

    Ok(Submission {
        invoice_blob,
        purchase_orders,
    })
}

/// Parse a form-encoded purchase-order list, escalating through repairs.
///
/// Direct parse, then with `\"` unescaped, then with control characters
/// stripped as well. Exhausting all three yields no orders.
pub fn parse_purchase_order_field(text: &str) -> Vec<NormalizedPurchaseOrder> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let parsed = flexible_json::parse(text)
        .or_else(|_| {
            flexible_json::parse(&unescape_quotes(text))
                .inspect(|_| warn!("Purchase orders parsed after unescaping quotes"))
        })
        .or_else(|_| {
            flexible_json::parse(&unescape_quotes(&clean_control_characters(text)))
                .inspect(|_| warn!("Purchase orders parsed after removing control characters"))
        });

    match parsed {
        Ok(value) => {
            let orders = normalize_list(value);
            if let Some(first) = orders.first() {
                info!(
                    count = orders.len(),
                    supplier = %first.supplier,
                    amount = first.amount,
                    "Purchase orders parsed"
                );
            }
            orders
        }
        Err(e) => {
            let preview: String = text.chars().take(200).collect();
            error!(error = %e, "Purchase orders could not be parsed");
            debug!(preview = %preview, "Unparseable purchase order text");
            Vec::new()
        }
    }
}

fn invoice_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Persist a submission unless it carries nothing usable.
pub async fn ingest(
    store: &Arc<RecordStore>,
    submission: Submission,
) -> Result<IngestOutcome, StoreError> {
    let record = NewRecord {
        purchase_orders: submission.purchase_orders,
        invoice_blob: submission.invoice_blob,
    };
    if !record.has_invoice() && !record.has_purchase_orders() {
        warn!("Submission ignored: no invoice and no purchase orders");
        return Ok(IngestOutcome::Ignored);
    }
    let id = store.run_blocking(move |s| s.insert_record(&record)).await?;
    Ok(IngestOutcome::Stored(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::multipart::{Form, Part};

    async fn spawn_app() -> (String, Arc<RecordStore>) {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let state = Arc::new(AppState {
            store: Arc::clone(&store),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state, 1024 * 1024);
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}"), store)
    }

    #[test]
    fn test_order_field_direct() {
        let orders = parse_purchase_order_field(r#"[{"id": "OC-1", "monto": "1,200.50"}]"#);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, "OC-1");
        assert_eq!(orders[0].amount, 1200.5);
    }

    #[test]
    fn test_order_field_escaped_quotes() {
        let orders =
            parse_purchase_order_field(r#"[{\"id\": \"OC-2\", \"proveedor\": \"ACME\"}]"#);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].supplier, "ACME");
    }

    #[test]
    fn test_order_field_control_characters() {
        let text = "[{\\\"id\\\": \\\"OC-3\\\", \\\"concepto\\\": \\\"Tubo\nx 3m\\\"}]";
        let orders = parse_purchase_order_field(text);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, "OC-3");
    }

    #[test]
    fn test_order_field_single_object_and_garbage() {
        assert_eq!(parse_purchase_order_field("{id: 'OC-4'}").len(), 1);
        assert!(parse_purchase_order_field("not json at all [").is_empty());
        assert!(parse_purchase_order_field("   ").is_empty());
        assert!(parse_purchase_order_field("42").is_empty());
    }

    #[test]
    fn test_json_body_strips_data_uri() {
        let submission = read_json_body(
            br#"{ordenes_de_compra: [{id: 'OC-1'}], factura_base64: 'data:application/pdf;base64,JVBE Ri0x LjQK'}"#,
        )
        .unwrap();
        assert_eq!(submission.invoice_blob.as_deref(), Some("JVBERi0xLjQK"));
        assert_eq!(submission.purchase_orders.len(), 1);
    }

    #[test]
    fn test_json_body_bad_invoice_is_absent() {
        let submission =
            read_json_body(br#"{"invoice_base64": "%%%not base64", "purchase_orders": "[{\"id\": \"A\"}]"}"#)
                .unwrap();
        assert!(submission.invoice_blob.is_none());
        assert_eq!(submission.purchase_orders[0].id, "A");
    }

    #[test]
    fn test_json_body_rejects_non_objects() {
        assert!(matches!(read_json_body(b"[1, 2]"), Err(WebhookError::BadRequest(_))));
        assert!(matches!(read_json_body(b""), Err(WebhookError::BadRequest(_))));
        assert!(matches!(read_json_body(b"{{{"), Err(WebhookError::BadRequest(_))));
    }

    #[test]
    fn test_body_kind_from_content_type() {
        let kind = |value: &str| {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, value.parse().unwrap());
            body_kind(&headers)
        };
        assert_eq!(kind("multipart/form-data; boundary=x"), BodyKind::Multipart);
        assert_eq!(
            kind("application/x-www-form-urlencoded; charset=UTF-8"),
            BodyKind::UrlEncoded
        );
        assert_eq!(kind("Application/X-WWW-Form-Urlencoded"), BodyKind::UrlEncoded);
        assert_eq!(kind("application/json"), BodyKind::Json);
        assert_eq!(body_kind(&HeaderMap::new()), BodyKind::Json);
    }

    #[test]
    fn test_form_fields_use_first_non_blank_synonym() {
        let fields: HashMap<String, String> = [
            ("ordenes_de_compra", "  "),
            ("purchase_orders", r#"[{\"id\": \"OC-5\"}]"#),
            ("invoice_base64", "JVBERi0xLjQK"),
            ("comentario", "ignored"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let submission = read_form_fields(&fields);
        assert_eq!(submission.purchase_orders.len(), 1);
        assert_eq!(submission.purchase_orders[0].id, "OC-5");
        assert_eq!(submission.invoice_blob.as_deref(), Some("JVBERi0xLjQK"));

        let empty = read_form_fields(&HashMap::new());
        assert!(empty.invoice_blob.is_none());
        assert!(empty.purchase_orders.is_empty());
    }

    #[tokio::test]
    async fn test_ingest_ignores_empty_submission() {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let outcome = ingest(&store, Submission::default()).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Ignored);
        assert_eq!(store.get_counts().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_multipart_submission_is_stored() {
        let (base, store) = spawn_app().await;
        let form = Form::new()
            .part(
                "factura",
                Part::bytes(b"%PDF-1.4 body".to_vec()).file_name("invoice.pdf"),
            )
            .text("ordenes_de_compra", r#"[{\"id\": \"OC-9\", \"total\": 99}]"#);

        let resp = reqwest::Client::new()
            .post(format!("{base}/webhook"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"status": "success", "registro_id": 1}));

        let record = store.get_record(1).unwrap().unwrap();
        assert!(record.has_invoice);
        assert!(record.has_purchase_orders);
        let orders = record.purchase_orders().unwrap();
        assert_eq!(orders[0].id, "OC-9");
        assert_eq!(orders[0].amount, 99.0);
        assert_eq!(
            decode_invoice_blob(record.invoice_blob.as_deref().unwrap()).unwrap(),
            b"%PDF-1.4 body"
        );
    }

    #[tokio::test]
    async fn test_multipart_with_unparseable_orders_keeps_invoice() {
        let (base, store) = spawn_app().await;
        let form = Form::new()
            .part("invoice", Part::bytes(b"%PDF".to_vec()).file_name("a.pdf"))
            .text("purchase_orders", "<<garbage>>");
        let resp = reqwest::Client::new()
            .post(format!("{base}/webhook"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let record = store.get_record(1).unwrap().unwrap();
        assert!(record.has_invoice);
        assert!(!record.has_purchase_orders);
    }

    #[tokio::test]
    async fn test_empty_multipart_is_ignored() {
        let (base, store) = spawn_app().await;
        let form = Form::new()
            .part("factura", Part::bytes(Vec::new()).file_name("empty.pdf"))
            .text("ordenes_de_compra", "[]");
        let resp = reqwest::Client::new()
            .post(format!("{base}/webhook"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"status": "ignored"}));
        assert_eq!(store.get_counts().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_json_submission_and_errors() {
        let (base, store) = spawn_app().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/webhook"))
            .header("content-type", "application/json")
            .body(r#"{"purchase_orders": [{"order_id": "PO-1", "amount": 10}]}"#)
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "success");

        let resp = client
            .post(format!("{base}/webhook"))
            .body("this is not json {")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "error");

        store.execute_raw("DROP TABLE records").unwrap();
        let resp = client
            .post(format!("{base}/webhook"))
            .body(r#"{"purchase_orders": [{"id": "PO-2"}]}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_url_encoded_submission_is_stored() {
        let (base, store) = spawn_app().await;
        let body = format!(
            "ordenes_de_compra={}&factura_base64={}",
            urlencoding::encode(r#"[{"id":"OC-1","monto":"$2,500.00"}]"#),
            urlencoding::encode("JVBERi0x LjQK"),
        );
        let resp = reqwest::Client::new()
            .post(format!("{base}/webhook"))
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"status": "success", "registro_id": 1}));

        let record = store.get_record(1).unwrap().unwrap();
        assert!(record.has_invoice);
        let orders = record.purchase_orders().unwrap();
        assert_eq!(orders[0].id, "OC-1");
        assert_eq!(orders[0].amount, 2500.0);
        assert_eq!(record.invoice_blob.as_deref(), Some("JVBERi0xLjQK"));
    }

    #[tokio::test]
    async fn test_url_encoded_without_usable_fields_is_ignored() {
        let (base, store) = spawn_app().await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/webhook"))
            .header("content-type", "application/x-www-form-urlencoded")
            .body("ordenes_de_compra=&otro=1")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body, json!({"status": "ignored"}));
        assert_eq!(store.get_counts().unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_health_and_not_found() {
        let (base, _store) = spawn_app().await;
        let client = reqwest::Client::new();
        let body: Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body, json!({"status": "active"}));

        let resp = client.get(format!("{base}/nope")).send().await.unwrap();
        assert_eq!(resp.status(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["detail"], "not found");
    }
}
