// src/report.rs

use crate::validator::{AnomalyKind, ValidationOutcome};
use rust_xlsxwriter::{
    Color, Format, FormatAlign, FormatUnderline, Url, Workbook, Worksheet, XlsxError,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tracing::info;

const NOT_AVAILABLE: &str = "N/A";
const MAX_RESULT_CHARS: usize = 200;
const MIN_COLUMN_WIDTH: usize = 12;
const MAX_COLUMN_WIDTH: usize = 60;
const LINK_TEXT: &str = "View PDF";

const DISPLAY_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const FILENAME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day]_[hour][minute][second]");

const HEADERS: [&str; 14] = [
    "Status",
    "Record ID",
    "Received At",
    "Has PO",
    "PO Count",
    "Has Invoice",
    "Invoice Link",
    "Anomaly Type",
    "Supplier",
    "Grand Total",
    "Currency",
    "Recipient",
    "Folio",
    "Validation Result",
];

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("xlsx error: {0}")]
    Xlsx(#[from] XlsxError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Drives the row fill colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Ok,
    Warning,
    Error,
}

impl Severity {
    fn of(outcome: &ValidationOutcome) -> Self {
        match outcome.anomaly_kind {
            _ if !outcome.is_anomaly => Severity::Ok,
            Some(AnomalyKind::ProcessingError | AnomalyKind::MissingBoth) => Severity::Error,
            _ => Severity::Warning,
        }
    }

    fn fill(self) -> Color {
        match self {
            Severity::Ok => Color::RGB(0xE2EFDA),
            Severity::Warning => Color::RGB(0xFFF2CC),
            Severity::Error => Color::RGB(0xF8CBAD),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub status: &'static str,
    pub severity: Severity,
    pub record_id: i64,
    pub received_at: String,
    pub has_purchase_orders: &'static str,
    pub purchase_order_count: usize,
    pub has_invoice: &'static str,
    pub invoice_link: String,
    pub anomaly: String,
    pub supplier: String,
    pub grand_total: Option<f64>,
    pub currency: String,
    pub recipient: String,
    pub folio: String,
    pub validation_result: String,
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "Yes" } else { "No" }
}

fn or_na(value: Option<&String>) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .cloned()
        .unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

pub fn display_time(at: OffsetDateTime) -> String {
    at.format(DISPLAY_FORMAT)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// First `MAX_RESULT_CHARS` characters, with `...` appended when cut.
fn truncate_result(text: &str) -> String {
    match text.char_indices().nth(MAX_RESULT_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// One row per outcome, in the given order. `invoice_links` maps record id to published PDF link.
pub fn build_rows(
    outcomes: &[ValidationOutcome],
    invoice_links: &HashMap<i64, String>,
) -> Vec<ReportRow> {
    outcomes
        .iter()
        .map(|outcome| {
            let invoice = outcome.extracted_invoice.as_ref();
            ReportRow {
                status: if outcome.is_anomaly { "ANOMALY" } else { "OK" },
                severity: Severity::of(outcome),
                record_id: outcome.record_id,
                received_at: display_time(outcome.received_at),
                has_purchase_orders: yes_no(outcome.has_purchase_orders),
                purchase_order_count: outcome.purchase_order_count,
                has_invoice: yes_no(outcome.has_invoice),
                invoice_link: or_na(invoice_links.get(&outcome.record_id)),
                anomaly: outcome
                    .anomaly_kind
                    .map(|k| k.label().to_string())
                    .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
                supplier: or_na(invoice.and_then(|i| i.supplier.as_ref())),
                grand_total: invoice.and_then(|i| i.grand_total),
                currency: or_na(invoice.and_then(|i| i.currency.as_ref())),
                recipient: or_na(invoice.and_then(|i| i.recipient.as_ref())),
                folio: or_na(invoice.and_then(|i| i.folio.as_ref())),
                validation_result: outcome
                    .validation_result
                    .as_deref()
                    .filter(|v| !v.is_empty())
                    .map(truncate_result)
                    .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportSummary {
    pub total: usize,
    pub ok: usize,
    pub anomalies: usize,
    pub percent_ok: f64,
    /// Anomaly label and count, sorted by label.
    pub breakdown: Vec<(String, usize)>,
}

impl ReportSummary {
    /// Short text for the chat notification.
    pub fn chat_text(&self) -> String {
        format!(
            "*Run summary:*\n\
             - Processed: *{}*\n\
             - OK: *{}*\n\
             - Anomalies: *{}*",
            self.total, self.ok, self.anomalies
        )
    }
}

pub fn summarize(outcomes: &[ValidationOutcome]) -> ReportSummary {
    let total = outcomes.len();
    let anomalies = outcomes.iter().filter(|o| o.is_anomaly).count();
    let ok = total - anomalies;
    let percent_ok = if total > 0 {
        ok as f64 * 100.0 / total as f64
    } else {
        0.0
    };

    let mut by_label: BTreeMap<&'static str, usize> = BTreeMap::new();
    for kind in outcomes
        .iter()
        .filter(|o| o.is_anomaly)
        .filter_map(|o| o.anomaly_kind)
    {
        *by_label.entry(kind.label()).or_insert(0) += 1;
    }

    ReportSummary {
        total,
        ok,
        anomalies,
        percent_ok,
        breakdown: by_label
            .into_iter()
            .map(|(label, count)| (label.to_string(), count))
            .collect(),
    }
}

/// `YYYYMMDD_HHMMSS`, for file names.
pub fn file_stamp(at: OffsetDateTime) -> String {
    at.format(FILENAME_FORMAT)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

pub fn report_filename(now: OffsetDateTime) -> String {
    format!("validation_report_{}.xlsx", file_stamp(now))
}

fn header_format() -> Format {
    Format::new()
        .set_bold()
        .set_font_size(11)
        .set_font_color(Color::White)
        .set_background_color(Color::RGB(0x366092))
        .set_align(FormatAlign::Center)
        .set_align(FormatAlign::VerticalCenter)
        .set_text_wrap()
}

fn is_link(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://") || value.starts_with("file://")
}

fn column_width(longest: usize) -> f64 {
    (longest + 2).clamp(MIN_COLUMN_WIDTH, MAX_COLUMN_WIDTH) as f64
}

fn widen(longest: &mut [usize], col: u16, len: usize) {
    let slot = &mut longest[col as usize];
    *slot = (*slot).max(len);
}

fn write_header(sheet: &mut Worksheet, headers: &[&str]) -> Result<(), XlsxError> {
    let format = header_format();
    for (col, header) in headers.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *header, &format)?;
    }
    Ok(())
}

fn write_validation_sheet(sheet: &mut Worksheet, rows: &[ReportRow]) -> Result<(), XlsxError> {
    sheet.set_name("Validation")?;
    write_header(sheet, &HEADERS)?;

    let mut longest: Vec<usize> = HEADERS.iter().map(|h| h.chars().count()).collect();
    for (index, row) in rows.iter().enumerate() {
        let r = index as u32 + 1;
        let fill = row.severity.fill();
        let text = Format::new().set_background_color(fill);
        let number = Format::new()
            .set_background_color(fill)
            .set_num_format("#,##0.00")
            .set_align(FormatAlign::Right);
        let link = Format::new()
            .set_background_color(fill)
            .set_font_color(Color::Blue)
            .set_underline(FormatUnderline::Single);

        let texts: [(u16, &str); 10] = [
            (0, row.status),
            (2, row.received_at.as_str()),
            (3, row.has_purchase_orders),
            (5, row.has_invoice),
            (7, row.anomaly.as_str()),
            (8, row.supplier.as_str()),
            (10, row.currency.as_str()),
            (11, row.recipient.as_str()),
            (12, row.folio.as_str()),
            (13, row.validation_result.as_str()),
        ];
        for (col, value) in texts {
            sheet.write_string_with_format(r, col, value, &text)?;
            widen(&mut longest, col, value.chars().count());
        }

        sheet.write_number_with_format(r, 1, row.record_id as f64, &text)?;
        widen(&mut longest, 1, row.record_id.to_string().len());
        sheet.write_number_with_format(r, 4, row.purchase_order_count as f64, &text)?;

        if is_link(&row.invoice_link) {
            let url = Url::new(row.invoice_link.as_str()).set_text(LINK_TEXT);
            sheet.write_url_with_format(r, 6, url, &link)?;
            widen(&mut longest, 6, LINK_TEXT.len());
        } else {
            sheet.write_string_with_format(r, 6, row.invoice_link.as_str(), &text)?;
            widen(&mut longest, 6, row.invoice_link.chars().count());
        }

        match row.grand_total {
            Some(total) => {
                sheet.write_number_with_format(r, 9, total, &number)?;
                widen(&mut longest, 9, format!("{total:.2}").len() + 2);
            }
            None => {
                sheet.write_string_with_format(r, 9, NOT_AVAILABLE, &text)?;
            }
        }
    }

    for (col, len) in longest.iter().enumerate() {
        sheet.set_column_width(col as u16, column_width(*len))?;
    }
    sheet.set_freeze_panes(1, 0)?;
    Ok(())
}

fn write_summary_sheet(sheet: &mut Worksheet, summary: &ReportSummary) -> Result<(), XlsxError> {
    sheet.set_name("Summary")?;
    write_header(sheet, &["Metric", "Value"])?;

    sheet.write_string(1, 0, "Total records")?;
    sheet.write_number(1, 1, summary.total as f64)?;
    sheet.write_string(2, 0, "Correct records")?;
    sheet.write_number(2, 1, summary.ok as f64)?;
    sheet.write_string(3, 0, "Total anomalies")?;
    sheet.write_number(3, 1, summary.anomalies as f64)?;
    sheet.write_string(4, 0, "Percent correct")?;
    sheet.write_string(4, 1, format!("{:.1}%", summary.percent_ok))?;

    let section = Format::new().set_bold();
    sheet.write_string_with_format(6, 0, "ANOMALY BREAKDOWN", &section)?;
    for (offset, (label, count)) in summary.breakdown.iter().enumerate() {
        let r = 7 + offset as u32;
        sheet.write_string(r, 0, label.as_str())?;
        sheet.write_number(r, 1, *count as f64)?;
    }

    sheet.set_column_width(0, 35)?;
    sheet.set_column_width(1, 20)?;
    Ok(())
}

/// Write the two-sheet workbook to `path`, creating its directory.
pub fn render_xlsx(
    rows: &[ReportRow],
    summary: &ReportSummary,
    path: &Path,
) -> Result<(), ReportError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut workbook = Workbook::new();
    write_validation_sheet(workbook.add_worksheet(), rows)?;
    write_summary_sheet(workbook.add_worksheet(), summary)?;
    workbook.save(path)?;

    info!(path = %path.display(), rows = rows.len(), "Report written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::ExtractedInvoice;
    use time::macros::datetime;

    fn outcome(id: i64, kind: Option<AnomalyKind>) -> ValidationOutcome {
        ValidationOutcome {
            record_id: id,
            received_at: datetime!(2025-03-01 08:15:30 UTC),
            processed_at: datetime!(2025-03-02 09:30:00 UTC),
            has_purchase_orders: kind != Some(AnomalyKind::MissingPurchaseOrder),
            has_invoice: kind != Some(AnomalyKind::MissingInvoice),
            purchase_order_count: 1,
            is_anomaly: kind.is_some(),
            anomaly_kind: kind,
            validation_result: Some("MATCH".to_string()),
            extracted_invoice: None,
            invoice_blob: None,
        }
    }

    #[test]
    fn test_rows_fill_not_available() {
        let rows = build_rows(&[outcome(1, Some(AnomalyKind::MissingInvoice))], &HashMap::new());
        let row = &rows[0];
        assert_eq!(row.status, "ANOMALY");
        assert_eq!(row.severity, Severity::Warning);
        assert_eq!(row.received_at, "2025-03-01 08:15:30");
        assert_eq!(row.has_purchase_orders, "Yes");
        assert_eq!(row.has_invoice, "No");
        assert_eq!(row.invoice_link, "N/A");
        assert_eq!(row.anomaly, "Missing invoice");
        assert_eq!(row.supplier, "N/A");
        assert_eq!(row.grand_total, None);
        assert_eq!(row.folio, "N/A");
    }

    #[test]
    fn test_rows_use_invoice_and_link() {
        let mut ok = outcome(7, None);
        ok.extracted_invoice = Some(ExtractedInvoice {
            supplier: Some("ACME".to_string()),
            grand_total: Some(1160.0),
            currency: Some("MXN".to_string()),
            folio: Some("A-1".to_string()),
            ..ExtractedInvoice::default()
        });
        let links = HashMap::from([(7, "https://drive.google.com/file/d/abc/view".to_string())]);
        let row = &build_rows(&[ok], &links)[0];
        assert_eq!(row.status, "OK");
        assert_eq!(row.severity, Severity::Ok);
        assert_eq!(row.anomaly, "N/A");
        assert_eq!(row.supplier, "ACME");
        assert_eq!(row.grand_total, Some(1160.0));
        assert_eq!(row.recipient, "N/A");
        assert_eq!(row.invoice_link, "https://drive.google.com/file/d/abc/view");
    }

    #[test]
    fn test_validation_result_is_truncated() {
        let mut long = outcome(1, Some(AnomalyKind::DiscrepanciesFound));
        long.validation_result = Some("ñ".repeat(250));
        let row = &build_rows(&[long], &HashMap::new())[0];
        assert_eq!(row.validation_result.chars().count(), 203);
        assert!(row.validation_result.ends_with("ñ..."));

        let mut exact = outcome(2, None);
        exact.validation_result = Some("x".repeat(200));
        let row = &build_rows(&[exact], &HashMap::new())[0];
        assert_eq!(row.validation_result.len(), 200);
    }

    #[test]
    fn test_error_kinds_get_error_severity() {
        let rows = build_rows(
            &[
                outcome(1, Some(AnomalyKind::ProcessingError)),
                outcome(2, Some(AnomalyKind::MissingBoth)),
                outcome(3, Some(AnomalyKind::DiscrepanciesFound)),
            ],
            &HashMap::new(),
        );
        let severities: Vec<_> = rows.iter().map(|r| r.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Error, Severity::Error, Severity::Warning]
        );
    }

    #[test]
    fn test_summarize() {
        let outcomes = vec![
            outcome(1, None),
            outcome(2, Some(AnomalyKind::MissingInvoice)),
            outcome(3, Some(AnomalyKind::DiscrepanciesFound)),
            outcome(4, Some(AnomalyKind::MissingInvoice)),
        ];
        let summary = summarize(&outcomes);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.ok, 1);
        assert_eq!(summary.anomalies, 3);
        assert!((summary.percent_ok - 25.0).abs() < f64::EPSILON);
        assert_eq!(
            summary.breakdown,
            vec![
                ("Discrepancies found".to_string(), 1),
                ("Missing invoice".to_string(), 2),
            ]
        );
        assert!(summary.chat_text().contains("Anomalies: *3*"));
    }

    #[test]
    fn test_summarize_empty() {
        let summary = summarize(&[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.percent_ok, 0.0);
        assert!(summary.breakdown.is_empty());
    }

    #[test]
    fn test_report_filename() {
        assert_eq!(
            report_filename(datetime!(2025-03-02 09:30:05 UTC)),
            "validation_report_20250302_093005.xlsx"
        );
    }

    #[test]
    fn test_render_xlsx_writes_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("report.xlsx");
        let outcomes = vec![outcome(1, None), outcome(2, Some(AnomalyKind::ProcessingError))];
        let links = HashMap::from([(1, "file:///tmp/Invoice_1.pdf".to_string())]);
        let rows = build_rows(&outcomes, &links);
        render_xlsx(&rows, &summarize(&outcomes), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn test_column_width_is_clamped() {
        assert_eq!(column_width(1), 12.0);
        assert_eq!(column_width(20), 22.0);
        assert_eq!(column_width(500), 60.0);
    }
}
