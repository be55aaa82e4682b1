//! Plain-text extraction for tutor uploads.
//!
//! The format is chosen from the declared content type, falling back to
//! the file extension:
//!
//! | Format | Detection | Reader |
//! |--------|-----------|--------|
//! | PDF | `application/pdf`, `.pdf` | `pdf-extract` |
//! | DOCX | OOXML word MIME, `.docx` | `zip` + `quick-xml` (`<w:t>`) |
//! | PPTX | OOXML presentation MIME, `.pptx` | `zip` + `quick-xml` (`<a:t>`) |
//! | Text | anything else | UTF-8 (lossy) |

use std::io::Read;
use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";

/// Maximum decompressed bytes read from a single archive entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("Office document extraction failed: {0}")]
    Ooxml(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Pdf,
    Docx,
    Pptx,
    Text,
}

impl UploadFormat {
    pub fn detect(filename: &str, content_type: Option<&str>) -> Self {
        match content_type.map(|c| c.split(';').next().unwrap_or(c).trim()) {
            Some(MIME_PDF) => return Self::Pdf,
            Some(MIME_DOCX) => return Self::Docx,
            Some(MIME_PPTX) => return Self::Pptx,
            _ => {}
        }
        let ext = filename
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            "pptx" => Self::Pptx,
            _ => Self::Text,
        }
    }
}

/// Extract the text of one uploaded file. The result is trimmed; an empty
/// string means the upload carried no text.
pub fn extract_upload(
    filename: &str,
    content_type: Option<&str>,
    bytes: &[u8],
) -> Result<String, ExtractError> {
    let text = match UploadFormat::detect(filename, content_type) {
        UploadFormat::Pdf => {
            pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?
        }
        UploadFormat::Docx => {
            let mut archive = open_archive(bytes)?;
            let xml = read_entry(&mut archive, "word/document.xml")?;
            collect_text_runs(&xml)?
        }
        UploadFormat::Pptx => extract_slides(bytes)?,
        UploadFormat::Text => String::from_utf8_lossy(bytes).into_owned(),
    };
    Ok(text.trim().to_string())
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| ExtractError::Ooxml(e.to_string()))
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!("{} exceeds size limit", name)));
    }
    Ok(out)
}

fn extract_slides(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    slides.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    let mut texts = Vec::new();
    for name in slides {
        let xml = read_entry(&mut archive, &name)?;
        let text = collect_text_runs(&xml)?;
        if !text.is_empty() {
            texts.push(text);
        }
    }
    Ok(texts.join("\n"))
}

/// Concatenate every `<*:t>` text run. Paragraph ends (`</w:p>`, `</a:p>`)
/// become newlines.
fn collect_text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_run = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_run = true,
            Ok(Event::Text(t)) if in_run => {
                out.push_str(&t.unescape().map_err(|e| ExtractError::Ooxml(e.to_string()))?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_run = false,
                b"p" if !out.is_empty() && !out.ends_with('\n') => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(UploadFormat::detect("a.bin", Some(MIME_PDF)), UploadFormat::Pdf);
        assert_eq!(UploadFormat::detect("Course.DOCX", None), UploadFormat::Docx);
        assert_eq!(
            UploadFormat::detect("slides.pptx", Some("application/octet-stream")),
            UploadFormat::Pptx
        );
        assert_eq!(UploadFormat::detect("notes.md", Some("text/markdown")), UploadFormat::Text);
    }

    #[test]
    fn test_text_upload_trimmed() {
        assert_eq!(
            extract_upload("notes.txt", Some("text/plain"), b"  Water cycle\n").unwrap(),
            "Water cycle"
        );
        assert_eq!(extract_upload("empty.txt", None, b"  \n ").unwrap(), "");
    }

    #[test]
    fn test_docx_paragraphs() {
        let xml = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>
<w:p><w:r><w:t>Introduction to </w:t></w:r><w:r><w:t>hydrology</w:t></w:r></w:p>
<w:p><w:r><w:t>Rivers &amp; lakes</w:t></w:r></w:p>
</w:body></w:document>"#;
        let bytes = zip_with(&[("word/document.xml", xml)]);
        let text = extract_upload("course.docx", None, &bytes).unwrap();
        assert_eq!(text, "Introduction to hydrology\nRivers & lakes");
    }

    #[test]
    fn test_pptx_slide_order() {
        let slide = |t: &str| {
            format!(
                r#"<p:sld xmlns:p="p" xmlns:a="a"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>"#,
                t
            )
        };
        let (s2, s10) = (slide("second"), slide("tenth"));
        let bytes = zip_with(&[("ppt/slides/slide10.xml", &s10), ("ppt/slides/slide2.xml", &s2)]);
        assert_eq!(extract_upload("deck.pptx", None, &bytes).unwrap(), "second\ntenth");
    }

    #[test]
    fn test_invalid_binary_formats() {
        assert!(matches!(
            extract_upload("x.pdf", None, b"not a pdf"),
            Err(ExtractError::Pdf(_))
        ));
        assert!(matches!(
            extract_upload("x.docx", None, b"not a zip"),
            Err(ExtractError::Ooxml(_))
        ));
        let bytes = zip_with(&[("other.xml", "<a/>")]);
        assert!(extract_upload("x.docx", None, &bytes).is_err());
    }
}
