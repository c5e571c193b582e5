// src/pipeline.rs

use crate::chat_notify::Notifier;
use crate::drive::{FileStorage, StorageError};
use crate::invoice::decode_invoice_blob;
use crate::record_db::StoreError;
use crate::report::{
    ReportError, ReportSummary, build_rows, file_stamp, render_xlsx, report_filename, summarize,
};
use crate::scheduler::ScheduledJob;
use crate::validator::{ValidationOutcome, Validator};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Shorter blobs cannot be a real PDF and are not published.
const MIN_PUBLISHED_BLOB_LEN: usize = 100;
const UPLOAD_FAILED: &str = "Upload failed";
const MAX_ERROR_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("report task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing was pending; no report, no notification.
    Idle,
    Published {
        report_path: PathBuf,
        link: String,
        summary: ReportSummary,
    },
    Failed(String),
}

pub struct Pipeline {
    validator: Validator,
    storage: Arc<dyn FileStorage>,
    notifier: Arc<dyn Notifier>,
    reports_dir: PathBuf,
    reports_folder: Option<String>,
    invoices_folder: Option<String>,
}

impl Pipeline {
    pub fn new(
        validator: Validator,
        storage: Arc<dyn FileStorage>,
        notifier: Arc<dyn Notifier>,
        reports_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            validator,
            storage,
            notifier,
            reports_dir: reports_dir.into(),
            reports_folder: None,
            invoices_folder: None,
        }
    }

    pub fn with_folders(mut self, reports: Option<String>, invoices: Option<String>) -> Self {
        self.reports_folder = reports;
        self.invoices_folder = invoices;
        self
    }

    /// Validate, report, publish, notify. Failures are logged and announced, never returned.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let started = OffsetDateTime::now_utc();
        info!("Validation cycle starting");

        match self.try_cycle().await {
            Ok(None) => {
                info!("No records to process");
                CycleOutcome::Idle
            }
            Ok(Some((report_path, link, summary))) => {
                self.notifier.notify(&link, &summary.chat_text()).await;
                let elapsed = OffsetDateTime::now_utc() - started;
                info!(
                    records = summary.total,
                    anomalies = summary.anomalies,
                    elapsed_secs = elapsed.as_seconds_f64(),
                    link = %link,
                    "Validation cycle complete"
                );
                CycleOutcome::Published {
                    report_path,
                    link,
                    summary,
                }
            }
            Err(e) => {
                error!(error = %e, "Validation cycle failed");
                let detail: String = e.to_string().chars().take(MAX_ERROR_CHARS).collect();
                let message = format!("*CRITICAL VALIDATION ERROR*\n\nError: {detail}");
                self.notifier.notify("N/A", &message).await;
                CycleOutcome::Failed(e.to_string())
            }
        }
    }

    async fn try_cycle(&self) -> Result<Option<(PathBuf, String, ReportSummary)>, PipelineError> {
        let outcomes = self.validator.run_pending_validations().await?;
        if outcomes.is_empty() {
            return Ok(None);
        }

        let links = self.publish_invoices(&outcomes).await;
        let rows = build_rows(&outcomes, &links);
        let summary = summarize(&outcomes);

        let report_path = self
            .reports_dir
            .join(report_filename(OffsetDateTime::now_utc()));
        {
            let path = report_path.clone();
            let summary = summary.clone();
            tokio::task::spawn_blocking(move || render_xlsx(&rows, &summary, &path))
                .await
                .map_err(|e| PipelineError::Task(e.to_string()))??;
        }

        let link = self
            .storage
            .upload(&report_path, self.reports_folder.as_deref())
            .await?;
        Ok(Some((report_path, link, summary)))
    }

    /// Publish each invoice PDF; a failed record gets `Upload failed` instead of a link.
    async fn publish_invoices(&self, outcomes: &[ValidationOutcome]) -> HashMap<i64, String> {
        let pdf_dir = self.reports_dir.join("pdf");
        let mut links = HashMap::new();

        for outcome in outcomes {
            let Some(blob) = outcome
                .invoice_blob
                .as_deref()
                .filter(|b| b.len() > MIN_PUBLISHED_BLOB_LEN)
            else {
                continue;
            };
            let name = format!(
                "Invoice_{}_{}.pdf",
                outcome.record_id,
                file_stamp(outcome.received_at)
            );
            let path = pdf_dir.join(name);
            let link = match self.publish_invoice(blob, &path).await {
                Ok(link) => link,
                Err(e) => {
                    error!(record_id = outcome.record_id, error = %e, "Invoice PDF not published");
                    UPLOAD_FAILED.to_string()
                }
            };
            links.insert(outcome.record_id, link);
        }
        links
    }

    async fn publish_invoice(&self, blob: &str, path: &Path) -> Result<String, StorageError> {
        let bytes = decode_invoice_blob(blob)
            .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(path, &bytes).await?;

        let uploaded = self
            .storage
            .upload(path, self.invoices_folder.as_deref())
            .await;
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Temporary PDF not removed");
        }
        uploaded
    }
}

#[async_trait]
impl ScheduledJob for Pipeline {
    async fn run(&self) {
        self.run_cycle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::{ExtractedInvoice, encode_invoice_bytes};
    use crate::llm_extract::LlmError;
    use crate::purchase_order::{NormalizedPurchaseOrder, normalize};
    use crate::record_db::{NewRecord, RecordStore};
    use crate::validator::{InvoiceExtractor, PoComparator};
    use serde_json::json;
    use std::sync::Mutex;

    struct FixedExtractor;

    #[async_trait]
    impl InvoiceExtractor for FixedExtractor {
        async fn extract(&self, _invoice_base64: &str) -> Result<ExtractedInvoice, LlmError> {
            Ok(ExtractedInvoice {
                supplier: Some("ACME".to_string()),
                grand_total: Some(1160.0),
                currency: Some("MXN".to_string()),
                ..ExtractedInvoice::default()
            })
        }
    }

    struct OkComparator;

    #[async_trait]
    impl PoComparator for OkComparator {
        async fn compare(
            &self,
            _invoice: &ExtractedInvoice,
            _orders: &[NormalizedPurchaseOrder],
        ) -> Result<String, LlmError> {
            Ok("OK".to_string())
        }
    }

    #[derive(Default)]
    struct RecordingStorage {
        fail_reports: bool,
        /// File name, folder, and whether the file existed at upload time.
        uploads: Mutex<Vec<(String, Option<String>, bool)>>,
    }

    #[async_trait]
    impl FileStorage for RecordingStorage {
        async fn upload(&self, path: &Path, folder: Option<&str>) -> Result<String, StorageError> {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            self.uploads.lock().unwrap().push((
                name.clone(),
                folder.map(str::to_string),
                path.exists(),
            ));
            if self.fail_reports && name.ends_with(".xlsx") {
                return Err(StorageError::Auth("token revoked".to_string()));
            }
            Ok(format!("https://files.example/{name}"))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, link: &str, summary: &str) {
            self.0
                .lock()
                .unwrap()
                .push((link.to_string(), summary.to_string()));
        }
    }

    struct Fixture {
        store: Arc<RecordStore>,
        storage: Arc<RecordingStorage>,
        notifier: Arc<RecordingNotifier>,
        pipeline: Pipeline,
        _dir: tempfile::TempDir,
        reports_dir: PathBuf,
    }

    fn fixture(fail_reports: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let reports_dir = dir.path().join("reports");
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let storage = Arc::new(RecordingStorage {
            fail_reports,
            ..RecordingStorage::default()
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let validator = Validator::new(
            Arc::clone(&store),
            Arc::new(FixedExtractor),
            Arc::new(OkComparator),
        );
        let pipeline = Pipeline::new(
            validator,
            Arc::clone(&storage) as Arc<dyn FileStorage>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            &reports_dir,
        )
        .with_folders(Some("reports-folder".to_string()), Some("pdf-folder".to_string()));
        Fixture {
            store,
            storage,
            notifier,
            pipeline,
            _dir: dir,
            reports_dir,
        }
    }

    fn order() -> NormalizedPurchaseOrder {
        normalize(json!({"id": "OC-1", "monto": 1160.0}).as_object().unwrap())
    }

    fn pdf_blob() -> String {
        encode_invoice_bytes(&b"%PDF-1.4 invoice body ".repeat(10))
    }

    #[tokio::test]
    async fn test_idle_cycle_sends_nothing() {
        let f = fixture(false);
        assert_eq!(f.pipeline.run_cycle().await, CycleOutcome::Idle);
        assert!(f.notifier.0.lock().unwrap().is_empty());
        assert!(f.storage.uploads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_publishes_report_and_invoices() {
        let f = fixture(false);
        f.store
            .insert_record(&NewRecord {
                purchase_orders: vec![order()],
                invoice_blob: Some(pdf_blob()),
            })
            .unwrap();
        f.store
            .insert_record(&NewRecord {
                purchase_orders: vec![order()],
                invoice_blob: None,
            })
            .unwrap();

        let CycleOutcome::Published {
            report_path,
            link,
            summary,
        } = f.pipeline.run_cycle().await
        else {
            panic!("expected a published report");
        };
        assert!(report_path.exists());
        assert!(link.ends_with(".xlsx"));
        assert_eq!(summary.total, 2);
        assert_eq!(summary.anomalies, 1);

        let uploads = f.storage.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 2);
        let (pdf_name, pdf_folder, pdf_existed) = &uploads[0];
        assert!(pdf_name.starts_with("Invoice_1_"));
        assert_eq!(pdf_folder.as_deref(), Some("pdf-folder"));
        assert!(pdf_existed);
        assert_eq!(uploads[1].1.as_deref(), Some("reports-folder"));

        let pdf_dir = f.reports_dir.join("pdf");
        assert_eq!(std::fs::read_dir(pdf_dir).unwrap().count(), 0);

        let notes = f.notifier.0.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, link);
        assert!(notes[0].1.contains("Processed: *2*"));
    }

    #[tokio::test]
    async fn test_short_blob_is_not_published() {
        let f = fixture(false);
        f.store
            .insert_record(&NewRecord {
                purchase_orders: vec![order()],
                invoice_blob: Some("JVBERi0xLjQ=".to_string()),
            })
            .unwrap();
        f.pipeline.run_cycle().await;

        let uploads = f.storage.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].0.ends_with(".xlsx"));
    }

    #[tokio::test]
    async fn test_failed_upload_notifies_error() {
        let f = fixture(true);
        f.store
            .insert_record(&NewRecord {
                purchase_orders: vec![order()],
                invoice_blob: None,
            })
            .unwrap();

        let outcome = f.pipeline.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Failed(ref e) if e.contains("token revoked")));

        let notes = f.notifier.0.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, "N/A");
        assert!(notes[0].1.contains("CRITICAL VALIDATION ERROR"));

        // The outcome was still committed.
        assert_eq!(f.store.get_counts().unwrap().pending, 0);
    }
}
