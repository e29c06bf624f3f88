//! lopdf-based text extraction for verification and optional full-text capture.

use anyhow::{Context, Result};
use lopdf::Document as PdfDoc;

/// What the verifier needs to know about a downloaded PDF.
#[derive(Debug, Clone)]
pub struct ParsedPdf {
    pub title: Option<String>,
    /// Text of the leading pages only.
    pub leading_text: String,
    pub page_count: usize,
}

/// Parse a PDF held in memory, extracting text from the first `scan_pages` pages.
pub fn parse_pdf(bytes: &[u8], scan_pages: usize) -> Result<ParsedPdf> {
    let pdf = PdfDoc::load_mem(bytes).context("unreadable PDF structure")?;
    let pages = pdf.get_pages();

    let mut leading_text = String::new();
    for page_num in pages.keys().take(scan_pages) {
        // A page with an odd font should not sink the whole document.
        if let Ok(text) = pdf.extract_text(&[*page_num]) {
            leading_text.push_str(&text);
            leading_text.push('\n');
        }
    }

    Ok(ParsedPdf {
        title: extract_title(&leading_text),
        leading_text,
        page_count: pages.len(),
    })
}

/// Text of every page, in page order.
pub fn extract_full_text(bytes: &[u8]) -> Result<String> {
    let pdf = PdfDoc::load_mem(bytes).context("unreadable PDF structure")?;
    let mut full_text = String::new();
    for page_num in pdf.get_pages().keys() {
        if let Ok(text) = pdf.extract_text(&[*page_num]) {
            full_text.push_str(&text);
            full_text.push('\n');
        }
    }
    Ok(full_text)
}

fn extract_title(text: &str) -> Option<String> {
    // First non-trivial line is usually the title
    text.lines()
        .find(|l| l.trim().len() > 10)
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use litfetch_test_utils::pdf::minimal_pdf;

    #[test]
    fn test_parse_reads_leading_pages() {
        let bytes = minimal_pdf(&["Effects of X on Y", "Jane Doe"]);
        let parsed = parse_pdf(&bytes, 2).unwrap();
        assert_eq!(parsed.page_count, 1);
        assert!(parsed.leading_text.contains("Effects of X on Y"));
        assert_eq!(parsed.title.as_deref(), Some("Effects of X on Y"));
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_pdf(b"%PDF-1.4 truncated nonsense", 2).is_err());
        assert!(extract_full_text(b"<html></html>").is_err());
    }

    #[test]
    fn test_extract_title_skips_short_lines() {
        assert_eq!(extract_title("Vol 3\n\nA sufficiently long title\n"), Some("A sufficiently long title".into()));
        assert_eq!(extract_title("p. 1\n"), None);
    }
}
