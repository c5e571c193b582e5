// src/record_db.rs

use crate::invoice::ExtractedInvoice;
use crate::purchase_order::NormalizedPurchaseOrder;
use crate::validator::AnomalyKind;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};
use tracing::{debug, info};

/// Fixed-width UTC text so that lexical order equals time order.
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]");

const RECORD_COLUMNS: &str = "id, received_at, purchase_orders, invoice_blob, has_purchase_orders, \
     has_invoice, processed, is_anomaly, anomaly_kind, validation_result, \
     extracted_invoice_data, processed_at";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record {0} not found")]
    NotFound(i64),
    #[error("record {0} already has an outcome")]
    AlreadyProcessed(i64),
    #[error("record store lock poisoned")]
    Poisoned,
    #[error("cannot decode column: {0}")]
    Decode(String),
    #[error("background task failed: {0}")]
    Background(String),
}

/// A submission accepted by the webhook, before it gets an id.
#[derive(Debug, Clone, Default)]
pub struct NewRecord {
    pub purchase_orders: Vec<NormalizedPurchaseOrder>,
    pub invoice_blob: Option<String>,
}

impl NewRecord {
    pub fn has_invoice(&self) -> bool {
        self.invoice_blob.as_deref().is_some_and(|b| !b.is_empty())
    }

    pub fn has_purchase_orders(&self) -> bool {
        !self.purchase_orders.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: i64,
    pub received_at: OffsetDateTime,
    /// Raw JSON text; decoded on demand so a corrupt row fails only its own validation.
    pub purchase_orders_json: Option<String>,
    pub invoice_blob: Option<String>,
    pub has_purchase_orders: bool,
    pub has_invoice: bool,
    pub processed: bool,
    pub is_anomaly: bool,
    pub anomaly_kind: Option<AnomalyKind>,
    pub validation_result: Option<String>,
    pub extracted_invoice_json: Option<String>,
    pub processed_at: Option<OffsetDateTime>,
}

impl StoredRecord {
    pub fn purchase_orders(&self) -> Result<Vec<NormalizedPurchaseOrder>, serde_json::Error> {
        match self.purchase_orders_json.as_deref() {
            Some(json) => serde_json::from_str(json),
            None => Ok(Vec::new()),
        }
    }

    pub fn extracted_invoice(&self) -> Result<Option<ExtractedInvoice>, serde_json::Error> {
        self.extracted_invoice_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
    }

    /// `label: value` lines for printing one record.
    pub fn detail_lines(&self) -> Result<Vec<String>, StoreError> {
        let yes_no = |flag: bool| if flag { "yes" } else { "no" };
        let mut lines = vec![
            format!("Record:      {}", self.id),
            format!("Received:    {}", format_timestamp(self.received_at)?),
            format!("Invoice:     {}", yes_no(self.has_invoice)),
        ];
        for order in self.purchase_orders()? {
            lines.push(format!(
                "Order:       {} | {} | {:.2} {}",
                order.id, order.supplier, order.amount, order.currency
            ));
        }

        match self.processed_at {
            Some(at) => lines.push(format!("Processed:   {}", format_timestamp(at)?)),
            None => {
                lines.push("Processed:   pending".to_string());
                return Ok(lines);
            }
        }
        lines.push(format!(
            "Status:      {}",
            self.anomaly_kind.map_or("OK", |kind| kind.label())
        ));
        if let Some(result) = &self.validation_result {
            lines.push(format!("Result:      {result}"));
        }
        if let Some(invoice) = self.extracted_invoice()? {
            let text = |value: &Option<String>| value.clone().unwrap_or_else(|| "N/A".to_string());
            lines.push(format!("Supplier:    {}", text(&invoice.supplier)));
            lines.push(format!("Folio:       {}", text(&invoice.folio)));
            lines.push(format!(
                "Grand total: {} {}",
                invoice
                    .grand_total
                    .map_or_else(|| "N/A".to_string(), |t| format!("{t:.2}")),
                text(&invoice.currency)
            ));
        }
        Ok(lines)
    }
}

/// Result of validating one record, written once.
#[derive(Debug, Clone, Default)]
pub struct RecordOutcome {
    pub is_anomaly: bool,
    pub anomaly_kind: Option<AnomalyKind>,
    pub validation_result: Option<String>,
    pub extracted_invoice: Option<ExtractedInvoice>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub total: usize,
    pub processed: usize,
    pub pending: usize,
    pub anomalies: usize,
}

pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open (or create) the database file, creating its parent directory.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        debug!(journal_mode = %mode, "SQLite journal mode");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                received_at TEXT NOT NULL,
                purchase_orders TEXT,
                invoice_blob TEXT,
                has_purchase_orders INTEGER NOT NULL DEFAULT 0,
                has_invoice INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                is_anomaly INTEGER NOT NULL DEFAULT 0,
                anomaly_kind TEXT,
                validation_result TEXT,
                extracted_invoice_data TEXT,
                processed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_records_processed ON records(processed);
            CREATE INDEX IF NOT EXISTS idx_records_is_anomaly ON records(is_anomaly);
            CREATE INDEX IF NOT EXISTS idx_records_received_at ON records(received_at);
            CREATE INDEX IF NOT EXISTS idx_records_processed_anomaly
                ON records(processed, is_anomaly);
            CREATE INDEX IF NOT EXISTS idx_records_received_processed
                ON records(received_at, processed);",
        )?;
        info!("Record store initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside one transaction; an error drops (rolls back) it.
    fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }

    /// Run a store operation on the blocking pool.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&RecordStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Background(e.to_string()))?
    }

    pub fn insert_record(&self, record: &NewRecord) -> Result<i64, StoreError> {
        self.insert_record_at(record, OffsetDateTime::now_utc())
    }

    pub fn insert_record_at(
        &self,
        record: &NewRecord,
        received_at: OffsetDateTime,
    ) -> Result<i64, StoreError> {
        let purchase_orders = if record.has_purchase_orders() {
            Some(serde_json::to_string(&record.purchase_orders)?)
        } else {
            None
        };
        let invoice_blob = record.invoice_blob.as_deref().filter(|b| !b.is_empty());
        let received_at = format_timestamp(received_at)?;

        let id = self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO records
                    (received_at, purchase_orders, invoice_blob, has_purchase_orders, has_invoice)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    received_at,
                    purchase_orders,
                    invoice_blob,
                    record.has_purchase_orders(),
                    record.has_invoice(),
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })?;
        info!(
            record_id = id,
            purchase_orders = record.purchase_orders.len(),
            has_invoice = record.has_invoice(),
            "Record stored"
        );
        Ok(id)
    }

    /// Unprocessed records, oldest first.
    pub fn pending_records(&self) -> Result<Vec<StoredRecord>, StoreError> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE processed = 0
                 ORDER BY received_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map([], row_to_record)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn get_record(&self, id: i64) -> Result<Option<StoredRecord>, StoreError> {
        self.with_tx(|tx| {
            Ok(tx
                .query_row(
                    &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"),
                    params![id],
                    row_to_record,
                )
                .optional()?)
        })
    }

    /// Write the outcome of a validation. Only an unprocessed record accepts one.
    pub fn record_outcome(
        &self,
        id: i64,
        outcome: &RecordOutcome,
    ) -> Result<OffsetDateTime, StoreError> {
        let extracted = outcome
            .extracted_invoice
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let processed_at = OffsetDateTime::now_utc();
        let processed_at_text = format_timestamp(processed_at)?;

        self.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE records
                 SET processed = 1, is_anomaly = ?2, anomaly_kind = ?3,
                     validation_result = ?4, extracted_invoice_data = ?5, processed_at = ?6
                 WHERE id = ?1 AND processed = 0",
                params![
                    id,
                    outcome.is_anomaly,
                    outcome.anomaly_kind.map(|k| k.as_str()),
                    outcome.validation_result,
                    extracted,
                    processed_at_text,
                ],
            )?;
            if changed == 1 {
                return Ok(());
            }
            let exists = tx
                .query_row("SELECT 1 FROM records WHERE id = ?1", params![id], |_| Ok(()))
                .optional()?
                .is_some();
            Err(if exists {
                StoreError::AlreadyProcessed(id)
            } else {
                StoreError::NotFound(id)
            })
        })?;
        info!(
            record_id = id,
            is_anomaly = outcome.is_anomaly,
            kind = outcome.anomaly_kind.map(|k| k.as_str()).unwrap_or("none"),
            "Outcome stored"
        );
        Ok(processed_at)
    }

    pub fn get_counts(&self) -> Result<RecordCounts, StoreError> {
        self.with_tx(|tx| {
            let (total, processed, anomalies): (usize, usize, usize) = tx.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(processed), 0),
                        COALESCE(SUM(is_anomaly), 0)
                 FROM records",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(RecordCounts {
                total,
                processed,
                pending: total - processed,
                anomalies,
            })
        })
    }

    /// Count of anomalous records per kind, most frequent first.
    pub fn anomaly_breakdown(&self) -> Result<Vec<(AnomalyKind, usize)>, StoreError> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT anomaly_kind, COUNT(*) FROM records
                 WHERE is_anomaly = 1 AND anomaly_kind IS NOT NULL
                 GROUP BY anomaly_kind
                 ORDER BY COUNT(*) DESC, anomaly_kind ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                let text: String = row.get(0)?;
                Ok((parse_kind(0, &text)?, row.get::<_, usize>(1)?))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize, StoreError> {
        self.with_tx(|tx| Ok(tx.execute(sql, [])?))
    }
}

pub fn format_timestamp(ts: OffsetDateTime) -> Result<String, StoreError> {
    ts.to_offset(UtcOffset::UTC)
        .format(TIMESTAMP_FORMAT)
        .map_err(|e| StoreError::Decode(e.to_string()))
}

pub fn parse_timestamp(text: &str) -> Result<OffsetDateTime, StoreError> {
    PrimitiveDateTime::parse(text, TIMESTAMP_FORMAT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|e| StoreError::Decode(format!("{text:?}: {e}")))
}

fn conversion_error(idx: usize, e: StoreError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<OffsetDateTime>> {
    row.get::<_, Option<String>>(idx)?
        .map(|text| parse_timestamp(&text).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn parse_kind(idx: usize, text: &str) -> rusqlite::Result<AnomalyKind> {
    AnomalyKind::parse(text).ok_or_else(|| {
        conversion_error(idx, StoreError::Decode(format!("unknown anomaly kind {text:?}")))
    })
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    let received_at = timestamp_column(row, 1)?
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(1, "received_at".into(), Type::Null))?;
    let anomaly_kind = row
        .get::<_, Option<String>>(8)?
        .map(|text| parse_kind(8, &text))
        .transpose()?;
    Ok(StoredRecord {
        id: row.get(0)?,
        received_at,
        purchase_orders_json: row.get(2)?,
        invoice_blob: row.get(3)?,
        has_purchase_orders: row.get(4)?,
        has_invoice: row.get(5)?,
        processed: row.get(6)?,
        is_anomaly: row.get(7)?,
        anomaly_kind,
        validation_result: row.get(9)?,
        extracted_invoice_json: row.get(10)?,
        processed_at: timestamp_column(row, 11)?,
    })
}
