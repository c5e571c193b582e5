// src/validator.rs

use crate::invoice::ExtractedInvoice;
use crate::llm_extract::LlmError;
use crate::purchase_order::NormalizedPurchaseOrder;
use crate::record_db::{RecordOutcome, RecordStore, StoreError, StoredRecord};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{Instrument, error, info, info_span, warn};

pub const SKIPPED_NO_PURCHASE_ORDER: &str = "Comparison skipped: purchase order missing.";
pub const EXTRACTION_FAILED: &str = "Invoice data extraction failed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AnomalyKind {
    MissingPurchaseOrder,
    MissingInvoice,
    MissingBoth,
    ProcessingError,
    DiscrepanciesFound,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 5] = [
        AnomalyKind::MissingPurchaseOrder,
        AnomalyKind::MissingInvoice,
        AnomalyKind::MissingBoth,
        AnomalyKind::ProcessingError,
        AnomalyKind::DiscrepanciesFound,
    ];

    /// Storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::MissingPurchaseOrder => "missing_purchase_order",
            AnomalyKind::MissingInvoice => "missing_invoice",
            AnomalyKind::MissingBoth => "missing_both",
            AnomalyKind::ProcessingError => "processing_error",
            AnomalyKind::DiscrepanciesFound => "discrepancies_found",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == text)
    }

    /// Human-readable label used in reports.
    pub fn label(self) -> &'static str {
        match self {
            AnomalyKind::MissingPurchaseOrder => "Missing purchase order",
            AnomalyKind::MissingInvoice => "Missing invoice",
            AnomalyKind::MissingBoth => "Missing purchase order and invoice",
            AnomalyKind::ProcessingError => "Invoice processing error",
            AnomalyKind::DiscrepanciesFound => "Discrepancies found",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pulls structured fields out of a base64-encoded invoice PDF.
#[async_trait]
pub trait InvoiceExtractor: Send + Sync {
    async fn extract(&self, invoice_base64: &str) -> Result<ExtractedInvoice, LlmError>;
}

/// Produces a free-text verdict; see [`verdict_is_match`] for how it is read.
#[async_trait]
pub trait PoComparator: Send + Sync {
    async fn compare(
        &self,
        invoice: &ExtractedInvoice,
        orders: &[NormalizedPurchaseOrder],
    ) -> Result<String, LlmError>;
}

/// Everything the report needs about one validated record.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub record_id: i64,
    pub received_at: OffsetDateTime,
    pub processed_at: OffsetDateTime,
    pub has_purchase_orders: bool,
    pub has_invoice: bool,
    pub purchase_order_count: usize,
    pub is_anomaly: bool,
    pub anomaly_kind: Option<AnomalyKind>,
    pub validation_result: Option<String>,
    pub extracted_invoice: Option<ExtractedInvoice>,
    /// Kept so the report can publish the invoice PDF.
    pub invoice_blob: Option<String>,
}

pub struct Validator {
    store: Arc<RecordStore>,
    extractor: Arc<dyn InvoiceExtractor>,
    comparator: Arc<dyn PoComparator>,
}

impl Validator {
    pub fn new(
        store: Arc<RecordStore>,
        extractor: Arc<dyn InvoiceExtractor>,
        comparator: Arc<dyn PoComparator>,
    ) -> Self {
        Self {
            store,
            extractor,
            comparator,
        }
    }

    /// Validate every pending record, oldest first.
    ///
    /// Each outcome is committed before the next record starts. A store
    /// failure ends the batch; a failure inside one record does not.
    pub async fn run_pending_validations(&self) -> Result<Vec<ValidationOutcome>, StoreError> {
        let pending = self.store.run_blocking(|s| s.pending_records()).await?;
        if pending.is_empty() {
            info!("No pending records to validate");
            return Ok(Vec::new());
        }
        info!(count = pending.len(), "Validating pending records");

        let mut outcomes = Vec::with_capacity(pending.len());
        for (index, record) in pending.into_iter().enumerate() {
            let record_id = record.id;
            let span = info_span!("validate", record_id, index = index + 1);
            let outcome = self.decide_isolated(&record).instrument(span.clone()).await;

            let to_store = outcome.clone();
            let written = self
                .store
                .run_blocking(move |s| s.record_outcome(record_id, &to_store))
                .await;
            let processed_at = match written {
                Ok(at) => at,
                Err(StoreError::AlreadyProcessed(id)) => {
                    span.in_scope(|| {
                        warn!(record_id = id, "Record already has an outcome, dropping result")
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            span.in_scope(|| {
                info!(
                    is_anomaly = outcome.is_anomaly,
                    kind = outcome.anomaly_kind.map(AnomalyKind::as_str).unwrap_or("none"),
                    "Record validated"
                )
            });
            outcomes.push(ValidationOutcome {
                record_id,
                received_at: record.received_at,
                processed_at,
                has_purchase_orders: record.has_purchase_orders,
                has_invoice: record.has_invoice,
                purchase_order_count: record.purchase_orders().map(|o| o.len()).unwrap_or(0),
                is_anomaly: outcome.is_anomaly,
                anomaly_kind: outcome.anomaly_kind,
                validation_result: outcome.validation_result,
                extracted_invoice: outcome.extracted_invoice,
                invoice_blob: record.invoice_blob,
            });
        }

        let anomalies = outcomes.iter().filter(|o| o.is_anomaly).count();
        info!(total = outcomes.len(), anomalies, "Validation batch complete");
        Ok(outcomes)
    }

    /// Classify on its own task so a panicking collaborator only fails this record.
    async fn decide_isolated(&self, record: &StoredRecord) -> RecordOutcome {
        let extractor = Arc::clone(&self.extractor);
        let comparator = Arc::clone(&self.comparator);
        let record = record.clone();
        let task = tokio::spawn(
            async move { classify(&record, extractor.as_ref(), comparator.as_ref()).await }
                .in_current_span(),
        );
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Validation task aborted");
                anomaly(
                    AnomalyKind::ProcessingError,
                    Some(format!("Error: validation task aborted: {e}")),
                    None,
                )
            }
        }
    }
}

fn anomaly(
    kind: AnomalyKind,
    validation_result: Option<String>,
    extracted_invoice: Option<ExtractedInvoice>,
) -> RecordOutcome {
    RecordOutcome {
        is_anomaly: true,
        anomaly_kind: Some(kind),
        validation_result,
        extracted_invoice,
    }
}

/// Decide the outcome of one record.
pub async fn classify(
    record: &StoredRecord,
    extractor: &dyn InvoiceExtractor,
    comparator: &dyn PoComparator,
) -> RecordOutcome {
    let orders = match record.purchase_orders() {
        Ok(orders) => orders,
        Err(e) => {
            error!(error = %e, "Stored purchase orders no longer decode");
            return anomaly(AnomalyKind::ProcessingError, Some(format!("Error: {e}")), None);
        }
    };
    let has_orders = record.has_purchase_orders && !orders.is_empty();

    let blob = record
        .invoice_blob
        .as_deref()
        .filter(|blob| record.has_invoice && !blob.is_empty());
    let Some(blob) = blob else {
        let kind = if has_orders {
            AnomalyKind::MissingInvoice
        } else {
            AnomalyKind::MissingBoth
        };
        warn!(kind = kind.as_str(), "Record has no invoice");
        return anomaly(kind, None, None);
    };

    // Extraction runs even without orders so the report can show invoice fields.
    let extracted = match extractor.extract(blob).await {
        Ok(invoice) if invoice.is_empty() => {
            error!("Extraction returned no fields");
            None
        }
        Ok(invoice) => {
            let (filled, total) = invoice.coverage();
            info!(
                filled,
                total,
                supplier = ?invoice.supplier,
                grand_total = ?invoice.grand_total,
                "Invoice data extracted"
            );
            Some(invoice)
        }
        Err(e) => {
            error!(error = %e, "Invoice extraction failed");
            None
        }
    };

    if !has_orders {
        warn!("Record has no purchase orders");
        return anomaly(
            AnomalyKind::MissingPurchaseOrder,
            Some(SKIPPED_NO_PURCHASE_ORDER.to_string()),
            extracted,
        );
    }

    let Some(invoice) = extracted else {
        return anomaly(
            AnomalyKind::ProcessingError,
            Some(EXTRACTION_FAILED.to_string()),
            None,
        );
    };

    info!(orders = orders.len(), "Comparing invoice with purchase orders");
    match comparator.compare(&invoice, &orders).await {
        Ok(verdict) if verdict_is_match(&verdict) => RecordOutcome {
            is_anomaly: false,
            anomaly_kind: None,
            validation_result: Some(verdict),
            extracted_invoice: Some(invoice),
        },
        Ok(verdict) => {
            warn!(verdict = %verdict, "Discrepancies found");
            anomaly(AnomalyKind::DiscrepanciesFound, Some(verdict), Some(invoice))
        }
        Err(e) => {
            error!(error = %e, "Comparison failed");
            anomaly(
                AnomalyKind::ProcessingError,
                Some(format!("Comparison failed: {e}")),
                Some(invoice),
            )
        }
    }
}

/// A verdict is a match when it contains the word `OK` and no word
/// beginning with `DISCREPANC`, compared case-insensitively.
pub fn verdict_is_match(verdict: &str) -> bool {
    let upper = verdict.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words.contains(&"OK") && !words.iter().any(|w| w.starts_with("DISCREPANC"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_db::NewRecord;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;

    enum ExtractBehavior {
        Succeed,
        Fail,
        Empty,
        Panic,
    }

    struct FakeExtractor {
        behavior: ExtractBehavior,
        calls: AtomicUsize,
    }

    impl FakeExtractor {
        fn new(behavior: ExtractBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InvoiceExtractor for FakeExtractor {
        async fn extract(&self, _invoice_base64: &str) -> Result<ExtractedInvoice, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                ExtractBehavior::Succeed => Ok(ExtractedInvoice {
                    supplier: Some("Papeleria SA".to_string()),
                    grand_total: Some(100.0),
                    currency: Some("MXN".to_string()),
                    ..Default::default()
                }),
                ExtractBehavior::Fail => Err(LlmError::Response("unreadable pdf".to_string())),
                ExtractBehavior::Empty => Ok(ExtractedInvoice::default()),
                ExtractBehavior::Panic => panic!("extractor blew up"),
            }
        }
    }

    struct FakeComparator {
        verdict: Result<String, String>,
        seen_orders: Mutex<Vec<usize>>,
    }

    impl FakeComparator {
        fn new(verdict: Result<&str, &str>) -> Arc<Self> {
            Arc::new(Self {
                verdict: verdict.map(str::to_string).map_err(str::to_string),
                seen_orders: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PoComparator for FakeComparator {
        async fn compare(
            &self,
            _invoice: &ExtractedInvoice,
            orders: &[NormalizedPurchaseOrder],
        ) -> Result<String, LlmError> {
            self.seen_orders.lock().unwrap().push(orders.len());
            self.verdict.clone().map_err(LlmError::Response)
        }
    }

    fn order() -> NormalizedPurchaseOrder {
        crate::purchase_order::normalize(json!({"id": "OC-1", "monto": 100}).as_object().unwrap())
    }

    fn record(orders: usize, invoice: bool) -> NewRecord {
        NewRecord {
            purchase_orders: (0..orders).map(|_| order()).collect(),
            invoice_blob: invoice.then(|| "JVBERi0xLjQ=".to_string()),
        }
    }

    fn validator(
        extractor: Arc<FakeExtractor>,
        comparator: Arc<FakeComparator>,
    ) -> (Validator, Arc<RecordStore>) {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        (
            Validator::new(Arc::clone(&store), extractor, comparator),
            store,
        )
    }

    #[test]
    fn test_verdict_rule() {
        assert!(verdict_is_match("OK - matches PO #3"));
        assert!(verdict_is_match("ok, corresponde a la OC #2"));
        assert!(!verdict_is_match("DISCREPANCIA - amount mismatch"));
        assert!(!verdict_is_match("ok discrepancia both present"));
        assert!(!verdict_is_match("OK but DISCREPANCIES in supplier"));
        assert!(!verdict_is_match("BOOKED"));
        assert!(!verdict_is_match("TOKEN mismatch"));
        assert!(!verdict_is_match(""));
    }

    #[test]
    fn test_anomaly_kind_text_round_trip() {
        for kind in AnomalyKind::ALL {
            assert_eq!(AnomalyKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AnomalyKind::parse("sin_oc"), None);
    }

    #[tokio::test]
    async fn test_missing_both_and_missing_invoice_skip_collaborators() {
        let extractor = FakeExtractor::new(ExtractBehavior::Succeed);
        let comparator = FakeComparator::new(Ok("OK"));
        let (validator, store) = validator(Arc::clone(&extractor), Arc::clone(&comparator));
        store.insert_record(&record(0, false)).unwrap();
        store.insert_record(&record(2, false)).unwrap();

        let outcomes = validator.run_pending_validations().await.unwrap();
        assert_eq!(outcomes[0].anomaly_kind, Some(AnomalyKind::MissingBoth));
        assert_eq!(outcomes[1].anomaly_kind, Some(AnomalyKind::MissingInvoice));
        assert_eq!(outcomes[1].purchase_order_count, 2);
        assert!(outcomes.iter().all(|o| o.validation_result.is_none()));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert!(comparator.seen_orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_purchase_order_keeps_extraction() {
        let extractor = FakeExtractor::new(ExtractBehavior::Succeed);
        let comparator = FakeComparator::new(Ok("OK"));
        let (validator, store) = validator(Arc::clone(&extractor), Arc::clone(&comparator));
        let id = store.insert_record(&record(0, true)).unwrap();

        let outcomes = validator.run_pending_validations().await.unwrap();
        let outcome = &outcomes[0];
        assert_eq!(outcome.anomaly_kind, Some(AnomalyKind::MissingPurchaseOrder));
        assert_eq!(
            outcome.validation_result.as_deref(),
            Some(SKIPPED_NO_PURCHASE_ORDER)
        );
        assert!(outcome.extracted_invoice.is_some());
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
        assert!(comparator.seen_orders.lock().unwrap().is_empty());

        let stored = store.get_record(id).unwrap().unwrap();
        assert!(stored.extracted_invoice().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ok_and_discrepancy_verdicts() {
        let (ok_validator, ok_store) = validator(
            FakeExtractor::new(ExtractBehavior::Succeed),
            FakeComparator::new(Ok("OK - matches PO #1")),
        );
        ok_store.insert_record(&record(1, true)).unwrap();
        let ok = ok_validator.run_pending_validations().await.unwrap();
        assert!(!ok[0].is_anomaly);
        assert_eq!(ok[0].anomaly_kind, None);

        let comparator = FakeComparator::new(Ok("DISCREPANCIA - amount mismatch"));
        let (bad_validator, bad_store) = validator(
            FakeExtractor::new(ExtractBehavior::Succeed),
            Arc::clone(&comparator),
        );
        bad_store.insert_record(&record(3, true)).unwrap();
        let bad = bad_validator.run_pending_validations().await.unwrap();
        assert_eq!(bad[0].anomaly_kind, Some(AnomalyKind::DiscrepanciesFound));
        assert_eq!(
            bad[0].validation_result.as_deref(),
            Some("DISCREPANCIA - amount mismatch")
        );
        assert_eq!(*comparator.seen_orders.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_extraction_failure_is_processing_error() {
        for behavior in [ExtractBehavior::Fail, ExtractBehavior::Empty] {
            let comparator = FakeComparator::new(Ok("OK"));
            let (validator, store) =
                validator(FakeExtractor::new(behavior), Arc::clone(&comparator));
            store.insert_record(&record(1, true)).unwrap();
            let outcomes = validator.run_pending_validations().await.unwrap();
            assert_eq!(outcomes[0].anomaly_kind, Some(AnomalyKind::ProcessingError));
            assert_eq!(outcomes[0].validation_result.as_deref(), Some(EXTRACTION_FAILED));
            assert!(outcomes[0].extracted_invoice.is_none());
            assert!(comparator.seen_orders.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_comparator_error_is_processing_error() {
        let (validator, store) = validator(
            FakeExtractor::new(ExtractBehavior::Succeed),
            FakeComparator::new(Err("rate limited")),
        );
        store.insert_record(&record(1, true)).unwrap();
        let outcomes = validator.run_pending_validations().await.unwrap();
        assert_eq!(outcomes[0].anomaly_kind, Some(AnomalyKind::ProcessingError));
        let text = outcomes[0].validation_result.as_deref().unwrap();
        assert!(text.starts_with("Comparison failed:"));
        assert!(text.contains("rate limited"));
        assert!(outcomes[0].extracted_invoice.is_some());
    }

    #[tokio::test]
    async fn test_panicking_extractor_does_not_stop_batch() {
        let (validator, store) = validator(
            FakeExtractor::new(ExtractBehavior::Panic),
            FakeComparator::new(Ok("OK")),
        );
        store.insert_record(&record(1, true)).unwrap();
        store.insert_record(&record(1, false)).unwrap();

        let outcomes = validator.run_pending_validations().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].anomaly_kind, Some(AnomalyKind::ProcessingError));
        assert!(
            outcomes[0]
                .validation_result
                .as_deref()
                .unwrap()
                .starts_with("Error:")
        );
        assert_eq!(outcomes[1].anomaly_kind, Some(AnomalyKind::MissingInvoice));
        assert!(store.pending_records().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_stored_orders_fail_only_that_record() {
        let (validator, store) = validator(
            FakeExtractor::new(ExtractBehavior::Succeed),
            FakeComparator::new(Ok("OK")),
        );
        let broken = store.insert_record(&record(1, true)).unwrap();
        store.insert_record(&record(1, true)).unwrap();
        store
            .execute_raw(&format!(
                "UPDATE records SET purchase_orders = 'not json' WHERE id = {broken}"
            ))
            .unwrap();

        let outcomes = validator.run_pending_validations().await.unwrap();
        assert_eq!(outcomes[0].anomaly_kind, Some(AnomalyKind::ProcessingError));
        assert!(!outcomes[1].is_anomaly);
    }

    #[tokio::test]
    async fn test_outcomes_follow_received_order_and_second_batch_is_empty() {
        let (validator, store) = validator(
            FakeExtractor::new(ExtractBehavior::Succeed),
            FakeComparator::new(Ok("OK")),
        );
        let newest = store
            .insert_record_at(&record(1, true), datetime!(2025-03-03 09:00 UTC))
            .unwrap();
        let oldest = store
            .insert_record_at(&record(1, true), datetime!(2025-03-01 09:00 UTC))
            .unwrap();
        let middle = store
            .insert_record_at(&record(0, false), datetime!(2025-03-02 09:00 UTC))
            .unwrap();

        let ids: Vec<i64> = validator
            .run_pending_validations()
            .await
            .unwrap()
            .iter()
            .map(|o| o.record_id)
            .collect();
        assert_eq!(ids, vec![oldest, middle, newest]);

        assert!(validator.run_pending_validations().await.unwrap().is_empty());
    }
}
