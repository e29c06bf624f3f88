//! Small, valid PDFs built with lopdf. Each line is its own text object, so
//! text extraction yields one line per entry.

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};

/// One page with the given lines, top to bottom.
pub fn minimal_pdf(lines: &[&str]) -> Vec<u8> {
    multi_page_pdf(&[lines])
}

pub fn multi_page_pdf(pages: &[&[&str]]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let kids: Vec<Object> = pages
        .iter()
        .map(|lines| page(&mut doc, pages_id, resources_id, lines).into())
        .collect();
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).expect("in-memory PDF write");
    buf
}

fn page(doc: &mut Document, parent: ObjectId, resources: ObjectId, lines: &[&str]) -> ObjectId {
    let mut operations = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let y = 760 - 20 * i as i64;
        operations.extend([
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![72.into(), y.into()]),
            Operation::new("Tj", vec![Object::string_literal(*line)]),
            Operation::new("ET", vec![]),
        ]);
    }
    let content = Content { operations }.encode().expect("content stream encodes");
    let content_id = doc.add_object(Stream::new(dictionary! {}, content));
    doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => parent,
        "Contents" => content_id,
        "Resources" => resources,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_is_a_pdf() {
        let bytes = minimal_pdf(&["Effects of X on Y"]);
        assert!(bytes.starts_with(b"%PDF-1.5"));
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn test_text_is_extractable() {
        let bytes = multi_page_pdf(&[&["First page title here"], &["Second page body"]]);
        let doc = Document::load_mem(&bytes).unwrap();
        assert_eq!(doc.get_pages().len(), 2);
        let text = doc.extract_text(&[1]).unwrap();
        assert!(text.contains("First page title here"), "{text:?}");
    }
}
