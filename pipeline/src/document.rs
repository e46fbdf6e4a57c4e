//! Source documents: discovery, text extraction and windowed slicing.

use quick_xml::events::Event;
use quick_xml::Reader;
use shared::PipelineError;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

const DOCX_BODY: &str = "word/document.xml";
const EXTENSIONS: &[&str] = &["docx", "txt"];

/// `.docx` and `.txt` files directly inside `folder`, sorted by file name.
/// Office lock files (`~$name.docx`) are skipped.
pub fn list_documents(folder: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    if !folder.is_dir() {
        return Err(PipelineError::MissingResource {
            path: folder.to_path_buf(),
        });
    }

    let mut files = Vec::new();
    for ext in EXTENSIONS {
        let pattern = folder.join(format!("*.{}", ext));
        let pattern = pattern.to_string_lossy();
        let entries = glob::glob(&pattern).map_err(|e| PipelineError::Document {
            path: folder.to_path_buf(),
            reason: format!("bad search pattern: {}", e),
        })?;
        for entry in entries {
            let path = entry.map_err(|e| PipelineError::Io(e.into_error()))?;
            let locked = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with("~$"))
                .unwrap_or(false);
            if path.is_file() && !locked {
                files.push(path);
            }
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    debug!(folder = %folder.display(), count = files.len(), "listed documents");
    Ok(files)
}

/// Plain text of a document, chosen by extension.
pub fn read_document(path: &Path) -> Result<String, PipelineError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("docx") => read_docx(path),
        Some(ext) if ext.eq_ignore_ascii_case("txt") => Ok(std::fs::read_to_string(path)?),
        _ => Err(PipelineError::Document {
            path: path.to_path_buf(),
            reason: "unsupported file type".to_string(),
        }),
    }
}

/// Text of a Word document's body paragraphs, joined without a separator.
pub fn read_docx(path: &Path) -> Result<String, PipelineError> {
    let doc_err = |reason: String| PipelineError::Document {
        path: path.to_path_buf(),
        reason,
    };

    let file = File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| doc_err(format!("not a zip archive: {}", e)))?;
    let mut xml = String::new();
    archive
        .by_name(DOCX_BODY)
        .map_err(|e| doc_err(format!("missing {}: {}", DOCX_BODY, e)))?
        .read_to_string(&mut xml)?;

    extract_text_runs(&xml).map_err(doc_err)
}

/// Text of the body's top-level paragraphs, in document order. Tables,
/// text boxes and other nested content are skipped.
fn extract_text_runs(xml: &str) -> Result<String, String> {
    let mut reader = Reader::from_str(xml);
    let mut text = String::new();
    let mut path: Vec<Vec<u8>> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => path.push(e.name().as_ref().to_vec()),
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) if in_paragraph_text(&path) => {
                let chunk = t.unescape().map_err(|e| e.to_string())?;
                text.push_str(&chunk);
            }
            Ok(Event::CData(c)) if in_paragraph_text(&path) => {
                let chunk = std::str::from_utf8(&c).map_err(|e| e.to_string())?;
                text.push_str(chunk);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(format!(
                    "malformed XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                ))
            }
        }
    }
    Ok(text)
}

/// True inside a `w:t` of a paragraph that sits directly in `w:body`, with
/// no paragraph nested between them.
fn in_paragraph_text(path: &[Vec<u8>]) -> bool {
    if path.last().map(Vec::as_slice) != Some(b"w:t".as_slice()) {
        return false;
    }
    let Some(body) = path.iter().position(|name| name.as_slice() == b"w:body") else {
        return false;
    };
    match path.get(body + 1..) {
        Some([paragraph, inner @ ..]) => {
            paragraph.as_slice() == b"w:p"
                && !inner.iter().any(|name| name.as_slice() == b"w:p")
        }
        _ => false,
    }
}

/// One window of a document's text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSlice {
    pub text: String,
    /// Offset in characters from the start of the document text.
    pub offset: usize,
}

/// Windows of `length` characters starting every `step` characters:
/// offsets `0, step, 2*step, ...` while below the text length. Windows near
/// the end are shorter. Empty text yields no windows.
pub fn slice_text(text: &str, length: usize, step: usize) -> Vec<TextSlice> {
    let length = length.max(1);
    let step = step.max(1);

    // Byte position of every char start, plus the end of the text.
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_count = bounds.len() - 1;

    (0..char_count)
        .step_by(step)
        .map(|start| {
            let end = (start + length).min(char_count);
            TextSlice {
                text: text[bounds[start]..bounds[end]].to_string(),
                offset: start,
            }
        })
        .collect()
}
