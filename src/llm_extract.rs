// src/llm_extract.rs

use crate::config::{ComparisonBackend, ExtractionBackend, LlmSection};
use crate::flexible_json;
use crate::heuristics;
use crate::invoice::{ExtractedInvoice, decode_invoice_blob};
use crate::pdf_extract;
use crate::purchase_order::NormalizedPurchaseOrder;
use crate::validator::{InvoiceExtractor, PoComparator};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Upper bound on PDF text sent to a chat model.
const MAX_TEXT_CHARS: usize = 12_000;

/// Amount tolerance used by the local comparator, in currency units.
const AMOUNT_TOLERANCE: f64 = 1.0;

/// Largest order list searched exhaustively for partial combinations.
const MAX_SUBSET_ORDERS: usize = 16;

const EXTRACTION_PROMPT: &str = r#"You are an accounting analyst who audits supplier invoices.
Read the attached invoice and extract the following fields.

1. supplier: legal name of the issuer ("Emisor", "Vendedor").
2. recipient: legal name of the customer ("Receptor", "Cliente", "Facturar a").
3. grand_total: the FINAL amount to pay including taxes. Never the subtotal. Number only, e.g. 1500.50.
4. currency: ISO code (MXN, USD). If absent, infer it from context (a Mexican address means MXN).
5. date: issue date as YYYY-MM-DD.
6. folio: the invoice's own identifier (not the SAT "Folio Fiscal" UUID).

Reply ONLY with this JSON object, using null for anything you cannot find:
{
  "supplier": "string or null",
  "grand_total": number or null,
  "currency": "string or null",
  "recipient": "string or null",
  "date": "YYYY-MM-DD or null",
  "folio": "string or null"
}"#;

const ASSISTANT_INSTRUCTIONS: &str = "You are an expert accountant. Your only job is to extract \
     data from invoices. Always answer with a single valid JSON object.";

const AUDITOR_ROLE: &str = "You are an expert financial auditor.";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unexpected LLM response: {0}")]
    Response(String),
    #[error("invoice is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("pdf error: {0}")]
    Pdf(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("no answer after {0:?}")]
    Timeout(Duration),
    #[error("missing API key: set {0}")]
    MissingApiKey(String),
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Resolved endpoint configuration ready to make API calls.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub base_url: String,
    pub model: String,
    /// Local OpenAI-compatible servers accept requests without one.
    pub api_key: Option<String>,
    pub max_tokens: u32,
}

impl ResolvedEndpoint {
    pub fn from_section(llm: &LlmSection) -> Self {
        let api_key = std::env::var(&llm.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            warn!(env = %llm.api_key_env, "No LLM API key in environment");
        }
        info!(url = %llm.base_url, model = %llm.model, "LLM endpoint");
        Self {
            base_url: llm.base_url.trim_end_matches('/').to_string(),
            model: llm.model.clone(),
            api_key,
            max_tokens: llm.max_tokens,
        }
    }

    fn request(&self, client: &Client, method: Method, path: &str) -> RequestBuilder {
        let request = client.request(method, format!("{}/{path}", self.base_url));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, LlmError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}

/// One system + user exchange over chat completions.
async fn chat_completion(
    client: &Client,
    endpoint: &ResolvedEndpoint,
    system: &str,
    user: String,
    temperature: f64,
) -> Result<String, LlmError> {
    let request = ChatRequest {
        model: endpoint.model.clone(),
        messages: vec![
            ChatMessage {
                role: "system".to_string(),
                content: system.to_string(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: user,
            },
        ],
        temperature,
        max_tokens: endpoint.max_tokens,
    };

    let chat_response: ChatResponse = send_json(
        endpoint
            .request(client, Method::POST, "chat/completions")
            .json(&request),
    )
    .await?;
    chat_response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| LlmError::Response("empty response from LLM".to_string()))
}

/// Decode a model reply into an invoice, tolerating fences, prose and
/// Python-style literals around the JSON object.
pub fn parse_invoice_response(content: &str) -> Result<ExtractedInvoice, LlmError> {
    // Strip markdown fences if the model added them despite instructions
    let json_str = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let json_str = extract_json_object(json_str)?;
    let value = flexible_json::parse(json_str)
        .map_err(|e| LlmError::Response(format!("{e}; raw: {json_str}")))?;
    serde_json::from_value(value)
        .map_err(|e| LlmError::Response(format!("not an invoice object: {e}; raw: {json_str}")))
}

/// Extract the outermost JSON object from a string that may contain
/// surrounding text (e.g. reasoning before the answer).
fn extract_json_object(s: &str) -> Result<&str, LlmError> {
    let start = s
        .find('{')
        .ok_or_else(|| LlmError::Response("no '{' found in LLM response".to_string()))?;
    let end = s
        .rfind('}')
        .ok_or_else(|| LlmError::Response("no '}' found in LLM response".to_string()))?;
    if end <= start {
        return Err(LlmError::Response("malformed JSON in LLM response".to_string()));
    }
    Ok(&s[start..=end])
}

/// At most `max_chars` characters, cut on a char boundary.
fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// `1234.5` -> `"1,234.50"`.
pub fn format_money(amount: f64) -> String {
    let fixed = format!("{:.2}", amount.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, digit) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if amount < 0.0 { "-" } else { "" };
    format!("{sign}{grouped}.{frac_part}")
}

async fn pdf_text_blocking(pdf: Vec<u8>) -> Result<String, LlmError> {
    tokio::task::spawn_blocking(move || pdf_extract::invoice_text(&pdf))
        .await
        .map_err(|e| LlmError::Pdf(format!("text extraction task failed: {e}")))?
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: String,
    #[serde(default)]
    last_error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    text: Option<TextContent>,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    value: String,
}

/// Assistants v2 file-search flow: the model reads the PDF itself.
pub struct AssistantsExtractor {
    client: Client,
    endpoint: ResolvedEndpoint,
    poll_interval: Duration,
    timeout: Duration,
}

impl AssistantsExtractor {
    pub fn new(
        client: Client,
        endpoint: ResolvedEndpoint,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoint,
            poll_interval,
            timeout,
        }
    }

    fn beta(&self, method: Method, path: &str) -> RequestBuilder {
        self.endpoint
            .request(&self.client, method, path)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn upload_file(&self, pdf: Vec<u8>) -> Result<String, LlmError> {
        let name = format!("invoice_{}.pdf", OffsetDateTime::now_utc().unix_timestamp());
        let part = Part::bytes(pdf)
            .file_name(name)
            .mime_str("application/pdf")?;
        let form = Form::new().text("purpose", "assistants").part("file", part);
        let file: IdObject = send_json(
            self.endpoint
                .request(&self.client, Method::POST, "files")
                .multipart(form),
        )
        .await?;
        info!(file_id = %file.id, "Invoice uploaded");
        Ok(file.id)
    }

    async fn create_assistant(&self) -> Result<String, LlmError> {
        let assistant: IdObject = send_json(self.beta(Method::POST, "assistants").json(&json!({
            "name": "Invoice analyst",
            "instructions": ASSISTANT_INSTRUCTIONS,
            "model": self.endpoint.model,
            "tools": [{"type": "file_search"}],
        })))
        .await?;
        debug!(assistant_id = %assistant.id, "Assistant created");
        Ok(assistant.id)
    }

    /// Thread with the file attached, one run, polled until it settles.
    async fn ask(&self, assistant_id: &str, file_id: &str) -> Result<String, LlmError> {
        let thread: IdObject = send_json(self.beta(Method::POST, "threads").json(&json!({
            "messages": [{
                "role": "user",
                "content": EXTRACTION_PROMPT,
                "attachments": [{"file_id": file_id, "tools": [{"type": "file_search"}]}],
            }],
        })))
        .await?;

        let result = self.run_thread(assistant_id, &thread.id).await;
        self.delete(&format!("threads/{}", thread.id)).await;
        result
    }

    async fn run_thread(&self, assistant_id: &str, thread_id: &str) -> Result<String, LlmError> {
        let mut run: RunObject = send_json(
            self.beta(Method::POST, &format!("threads/{thread_id}/runs"))
                .json(&json!({ "assistant_id": assistant_id })),
        )
        .await?;

        let deadline = Instant::now() + self.timeout;
        while !matches!(
            run.status.as_str(),
            "completed" | "failed" | "cancelled" | "expired" | "incomplete"
        ) {
            if Instant::now() >= deadline {
                warn!(run_id = %run.id, status = %run.status, "Assistant run timed out");
                return Err(LlmError::Timeout(self.timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
            run = send_json(self.beta(
                Method::GET,
                &format!("threads/{thread_id}/runs/{}", run.id),
            ))
            .await?;
        }

        if run.status != "completed" {
            return Err(LlmError::Response(format!(
                "assistant run ended as {}: {}",
                run.status,
                run.last_error.map(|e| e.to_string()).unwrap_or_default()
            )));
        }

        let messages: MessageList = send_json(self.beta(
            Method::GET,
            &format!("threads/{thread_id}/messages?order=desc&limit=1"),
        ))
        .await?;
        messages
            .data
            .into_iter()
            .next()
            .and_then(|m| m.content.into_iter().find_map(|c| c.text))
            .map(|t| t.value)
            .ok_or_else(|| LlmError::Response("assistant returned no text".to_string()))
    }

    /// Best-effort cleanup; failures are only logged.
    async fn delete(&self, path: &str) {
        match self.beta(Method::DELETE, path).send().await {
            Ok(resp) if resp.status().is_success() => debug!(path, "Deleted"),
            Ok(resp) => warn!(path, status = %resp.status(), "Cleanup request rejected"),
            Err(e) => warn!(path, error = %e, "Cleanup request failed"),
        }
    }
}

#[async_trait]
impl InvoiceExtractor for AssistantsExtractor {
    async fn extract(&self, invoice_base64: &str) -> Result<ExtractedInvoice, LlmError> {
        let pdf = decode_invoice_blob(invoice_base64)?;
        let file_id = self.upload_file(pdf).await?;

        let answer = match self.create_assistant().await {
            Ok(assistant_id) => {
                let answer = self.ask(&assistant_id, &file_id).await;
                self.delete(&format!("assistants/{assistant_id}")).await;
                answer
            }
            Err(e) => Err(e),
        };
        self.delete(&format!("files/{file_id}")).await;

        parse_invoice_response(&answer?)
    }
}

/// Local text extraction, then a chat-completions call.
pub struct TextChatExtractor {
    client: Client,
    endpoint: ResolvedEndpoint,
}

impl TextChatExtractor {
    pub fn new(client: Client, endpoint: ResolvedEndpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl InvoiceExtractor for TextChatExtractor {
    async fn extract(&self, invoice_base64: &str) -> Result<ExtractedInvoice, LlmError> {
        let text = pdf_text_blocking(decode_invoice_blob(invoice_base64)?).await?;
        let text = truncate_chars(&text, MAX_TEXT_CHARS);
        let reply = chat_completion(
            &self.client,
            &self.endpoint,
            EXTRACTION_PROMPT,
            format!("Extract invoice data from the following PDF text:\n\n{text}"),
            0.0,
        )
        .await?;
        parse_invoice_response(&reply)
    }
}

/// Regex heuristics over the PDF text; no network.
pub struct HeuristicExtractor;

#[async_trait]
impl InvoiceExtractor for HeuristicExtractor {
    async fn extract(&self, invoice_base64: &str) -> Result<ExtractedInvoice, LlmError> {
        let text = pdf_text_blocking(decode_invoice_blob(invoice_base64)?).await?;
        let invoice = heuristics::extract_invoice(&text);
        let (filled, total) = invoice.coverage();
        info!(filled, total, "Heuristic coverage");
        Ok(invoice)
    }
}

// ---------------------------------------------------------------------------
// Comparators
// ---------------------------------------------------------------------------

/// Prompt asking which order(s) justify the invoice.
pub fn comparison_prompt(invoice: &ExtractedInvoice, orders: &[NormalizedPurchaseOrder]) -> String {
    let mut order_lines = String::new();
    for (idx, order) in orders.iter().enumerate() {
        let concept = order.concept.as_deref().unwrap_or("");
        order_lines.push_str(&format!(
            "   [PO #{}] ID: {} | Supplier: {} | Amount: ${} {} | Concept: {}\n",
            idx + 1,
            order.id,
            order.supplier,
            format_money(order.amount),
            order.currency,
            truncate_chars(concept, 50),
        ));
    }
    let sum_all: f64 = orders.iter().map(|o| o.amount).sum();
    let partial_rule = if orders.len() >= 3 {
        "3. PARTIAL MATCH (1 to several): is there a combination of orders whose amounts add up \
         to the invoice total?\n"
    } else {
        ""
    };

    format!(
        "You are given one invoice and a list of candidate purchase orders.\n\
         Decide which order(s), if any, justify the invoice.\n\n\
         INVOICE:\n\
         - Supplier: {supplier}\n\
         - Total: ${total}\n\
         - Currency: {currency}\n\n\
         PURCHASE ORDERS ({count}, sum of all: ${sum_all}):\n\
         {order_lines}\n\
         Check, in order:\n\
         1. SINGLE MATCH (1 to 1): does one order amount equal the invoice total (tolerance +/- $1.00)?\n\
         2. TOTAL MATCH (1 to all): does the sum of ALL orders equal the invoice total?\n\
         {partial_rule}\n\
         Also: the supplier of the matched order(s) must reasonably match the invoice supplier, \
         and the currencies must match.\n\n\
         If you find a valid match, answer \"OK - <short explanation>\", for example \
         \"OK - Matches PO #2 (ID: 12345) by exact amount.\"\n\
         Otherwise answer \"DISCREPANCIA - <detail>\", for example \
         \"DISCREPANCIA - Invoice total ($15,000.00) matches no single order nor the sum ($20,000.00).\"\n\
         Check the numbers carefully before answering.",
        supplier = invoice.supplier.as_deref().unwrap_or("N/A"),
        total = invoice.grand_total.map(format_money).unwrap_or_else(|| "N/A".to_string()),
        currency = invoice.currency.as_deref().unwrap_or("N/A"),
        count = orders.len(),
        sum_all = format_money(sum_all),
    )
}

pub struct ChatComparator {
    client: Client,
    endpoint: ResolvedEndpoint,
}

impl ChatComparator {
    pub fn new(client: Client, endpoint: ResolvedEndpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl PoComparator for ChatComparator {
    async fn compare(
        &self,
        invoice: &ExtractedInvoice,
        orders: &[NormalizedPurchaseOrder],
    ) -> Result<String, LlmError> {
        let prompt = comparison_prompt(invoice, orders);
        let verdict = chat_completion(&self.client, &self.endpoint, AUDITOR_ROLE, prompt, 0.1).await?;
        let verdict = verdict.trim();
        if verdict.is_empty() {
            return Err(LlmError::Response("empty verdict".to_string()));
        }
        Ok(verdict.to_string())
    }
}

/// Amount matching without an LLM: single order, all orders, then any combination.
pub struct AmountComparator;

impl AmountComparator {
    fn verdict(invoice: &ExtractedInvoice, orders: &[NormalizedPurchaseOrder]) -> String {
        let Some(total) = invoice.grand_total else {
            return "DISCREPANCIA - The invoice total could not be read.".to_string();
        };
        let close = |amount: f64| (amount - total).abs() <= AMOUNT_TOLERANCE;

        if let Some(currency) = invoice.currency.as_deref() {
            if !orders.iter().any(|o| o.currency.eq_ignore_ascii_case(currency)) {
                return format!("DISCREPANCIA - No purchase order is in {currency}.");
            }
        }

        if let Some((idx, order)) = orders.iter().enumerate().find(|(_, o)| close(o.amount)) {
            return format!(
                "OK - Matches PO #{} (ID: {}) by amount.",
                idx + 1,
                order.id
            );
        }

        let sum_all: f64 = orders.iter().map(|o| o.amount).sum();
        if orders.len() > 1 && close(sum_all) {
            return "OK - Matches the sum of all purchase orders.".to_string();
        }

        if orders.len() >= 3 {
            if let Some(subset) = matching_subset(orders, total) {
                let labels: Vec<String> = subset.iter().map(|i| format!("#{}", i + 1)).collect();
                return format!("OK - Matches the combination of PO {}.", labels.join(", "));
            }
        }

        format!(
            "DISCREPANCIA - Invoice total (${}) matches no single purchase order nor the sum of all (${}).",
            format_money(total),
            format_money(sum_all)
        )
    }
}

/// Smallest-index-first subset (2..n-1 orders) whose amounts add up to `total`.
fn matching_subset(orders: &[NormalizedPurchaseOrder], total: f64) -> Option<Vec<usize>> {
    if orders.len() > MAX_SUBSET_ORDERS {
        debug!(orders = orders.len(), "Too many orders for combination search");
        return None;
    }
    let n = orders.len();
    let full = (1u32 << n) - 1;
    (1..full)
        .filter(|mask| mask.count_ones() >= 2)
        .find(|mask| {
            let sum: f64 = (0..n)
                .filter(|i| mask & (1 << i) != 0)
                .map(|i| orders[i].amount)
                .sum();
            (sum - total).abs() <= AMOUNT_TOLERANCE
        })
        .map(|mask| (0..n).filter(|i| mask & (1 << i) != 0).collect())
}

#[async_trait]
impl PoComparator for AmountComparator {
    async fn compare(
        &self,
        invoice: &ExtractedInvoice,
        orders: &[NormalizedPurchaseOrder],
    ) -> Result<String, LlmError> {
        Ok(Self::verdict(invoice, orders))
    }
}

// ---------------------------------------------------------------------------
// Construction from config
// ---------------------------------------------------------------------------

fn http_client(llm: &LlmSection) -> Result<Client, LlmError> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(llm.extraction_timeout_secs))
        .build()?)
}

pub fn build_extractor(llm: &LlmSection) -> Result<Arc<dyn InvoiceExtractor>, LlmError> {
    info!(backend = ?llm.extraction, "Invoice extraction backend");
    Ok(match llm.extraction {
        ExtractionBackend::Assistants => {
            let endpoint = ResolvedEndpoint::from_section(llm);
            if endpoint.api_key.is_none() {
                return Err(LlmError::MissingApiKey(llm.api_key_env.clone()));
            }
            Arc::new(AssistantsExtractor::new(
                http_client(llm)?,
                endpoint,
                Duration::from_millis(llm.poll_interval_ms),
                Duration::from_secs(llm.extraction_timeout_secs),
            ))
        }
        ExtractionBackend::Chat => Arc::new(TextChatExtractor::new(
            http_client(llm)?,
            ResolvedEndpoint::from_section(llm),
        )),
        ExtractionBackend::Heuristics => Arc::new(HeuristicExtractor),
    })
}

pub fn build_comparator(llm: &LlmSection) -> Result<Arc<dyn PoComparator>, LlmError> {
    info!(backend = ?llm.comparison, "Purchase order comparison backend");
    Ok(match llm.comparison {
        ComparisonBackend::Llm => Arc::new(ChatComparator::new(
            http_client(llm)?,
            ResolvedEndpoint::from_section(llm),
        )),
        ComparisonBackend::Amounts => Arc::new(AmountComparator),
    })
}
