// src/pdf_extract.rs

use crate::llm_extract::LlmError;
use lopdf::{Dictionary, Document, ObjectId};
use tracing::{debug, info, warn};

/// Fewer non-whitespace characters than this means no usable text layer.
const MIN_TEXT_LAYER_CHARS: usize = 30;
/// Share of image-only pages at which the whole file counts as scanned.
const SCANNED_PAGE_RATIO: f64 = 0.8;
/// Page tree depth searched for inherited `Resources`.
const MAX_INHERIT_DEPTH: usize = 8;

/// What an invoice PDF offers to text-based extractors.
#[derive(Debug)]
pub enum InvoicePdf {
    Text(String),
    /// Scanned or image-only; needs a file-reading backend.
    ImageOnly,
    Unreadable(String),
}

pub fn read_invoice_pdf(pdf_bytes: &[u8]) -> InvoicePdf {
    let doc = match Document::load_mem(pdf_bytes) {
        Ok(doc) => doc,
        Err(e) => return InvoicePdf::Unreadable(format!("not a readable PDF: {e}")),
    };

    if is_image_only(&doc) {
        info!("Invoice PDF has image-only pages");
        return InvoicePdf::ImageOnly;
    }

    match pdf_extract::extract_text_from_mem(pdf_bytes) {
        Ok(text) => {
            let visible = text.chars().filter(|c| !c.is_whitespace()).count();
            if visible < MIN_TEXT_LAYER_CHARS {
                info!(chars = visible, "Invoice text layer too thin");
                InvoicePdf::ImageOnly
            } else {
                debug!(chars = visible, "Invoice text layer read");
                InvoicePdf::Text(text)
            }
        }
        Err(e) => {
            warn!(error = %e, "Text extraction failed on a structurally valid PDF");
            InvoicePdf::ImageOnly
        }
    }
}

/// Resource dictionary of a page, following `Parent` links when the page inherits it.
fn page_resources<'a>(doc: &'a Document, page: &'a Dictionary) -> Option<&'a Dictionary> {
    let mut node = page;
    for _ in 0..MAX_INHERIT_DEPTH {
        if let Some(resources) = node
            .get(b"Resources")
            .ok()
            .and_then(|r| doc.dereference(r).ok())
            .and_then(|(_, resolved)| resolved.as_dict().ok())
        {
            return Some(resources);
        }
        let parent: ObjectId = node.get(b"Parent").ok()?.as_reference().ok()?;
        node = doc.get_dictionary(parent).ok()?;
    }
    None
}

fn has_entries(doc: &Document, resources: &Dictionary, key: &[u8]) -> bool {
    resources
        .get(key)
        .ok()
        .and_then(|entry| doc.dereference(entry).ok())
        .and_then(|(_, resolved)| resolved.as_dict().ok())
        .is_some_and(|dict| !dict.is_empty())
}

/// True when most pages draw images but declare no fonts.
fn is_image_only(doc: &Document) -> bool {
    let pages = doc.get_pages();
    if pages.is_empty() {
        return false;
    }

    let image_only = pages
        .values()
        .filter_map(|id| doc.get_dictionary(*id).ok())
        .filter(|page| {
            page_resources(doc, page).is_some_and(|res| {
                has_entries(doc, res, b"XObject") && !has_entries(doc, res, b"Font")
            })
        })
        .count();

    let ratio = image_only as f64 / pages.len() as f64;
    debug!(pages = pages.len(), image_only, ratio, "Page resource scan");
    ratio >= SCANNED_PAGE_RATIO
}

/// Text of an invoice PDF, or an error when there is none to read.
pub fn invoice_text(pdf_bytes: &[u8]) -> Result<String, LlmError> {
    match read_invoice_pdf(pdf_bytes) {
        InvoicePdf::Text(text) => Ok(text),
        InvoicePdf::ImageOnly => Err(LlmError::Unsupported(
            "invoice PDF is scanned and has no text layer".to_string(),
        )),
        InvoicePdf::Unreadable(e) => Err(LlmError::Pdf(e)),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal one-page PDF with a text layer, built with lopdf.
    pub(crate) fn text_pdf(lines: &[&str]) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{Object, Stream, dictionary};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 10.into()]),
            Operation::new("TL", vec![14.into()]),
            Operation::new("Td", vec![50.into(), 750.into()]),
        ];
        for line in lines {
            operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
            operations.push(Operation::new("T*", vec![]));
        }
        operations.push(Operation::new("ET", vec![]));
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_garbage_bytes() {
        let result = read_invoice_pdf(b"this is not a pdf");
        assert!(matches!(result, InvoicePdf::Unreadable(_)));
        assert!(matches!(invoice_text(b"this is not a pdf"), Err(LlmError::Pdf(_))));
    }

    #[test]
    fn test_inherited_fonts_are_found() {
        let pdf = text_pdf(&["Total: $1,160.00"]);
        let doc = Document::load_mem(&pdf).unwrap();
        assert!(!is_image_only(&doc));
        let (_, page_id) = doc.get_pages().into_iter().next().unwrap();
        let page = doc.get_dictionary(page_id).unwrap();
        let resources = page_resources(&doc, page).unwrap();
        assert!(has_entries(&doc, resources, b"Font"));
    }

    #[test]
    fn test_short_text_counts_as_image_only() {
        let pdf = text_pdf(&["A-1"]);
        assert!(matches!(read_invoice_pdf(&pdf), InvoicePdf::ImageOnly));
        assert!(matches!(invoice_text(&pdf), Err(LlmError::Unsupported(_))));
    }

    #[test]
    fn test_text_pdf_is_read() {
        let pdf = text_pdf(&[
            "FACTURA Folio: A-1029",
            "Emisor: Papeleria del Norte SA de CV",
            "Total: $1,160.00 MXN",
        ]);
        let text = invoice_text(&pdf).unwrap();
        assert!(text.contains("A-1029"));
        assert!(text.contains("Papeleria"));
    }
}
