use crate::error::{RagError, Result};
use docx_rs::{read_docx, DocumentChild, ParagraphChild, RunChild};
use log::{debug, info, warn};
use mime_guess::from_path;
use pdf_extract::extract_text;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A named unit of source text made of ordered sections (shlokas, paragraphs)
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Stable identifier, e.g. `c1-ep4`
    pub id: String,
    pub title: Option<String>,
    pub sections: Vec<String>,
}

impl Document {
    pub fn new(id: impl Into<String>, title: Option<String>, sections: Vec<String>) -> Self {
        Document {
            id: id.into(),
            title,
            sections,
        }
    }

    /// Full text of the document, sections in order
    pub fn text(&self) -> String {
        self.sections.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.trim().is_empty())
    }
}

/// One entry of an episode export: `[{"chapter": 1, "episode": 3, "content": "..."}]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    #[serde(default)]
    pub chapter: Option<u32>,
    pub episode: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub shlokas: Vec<String>,
}

impl EpisodeRecord {
    /// Convert to a document, using `default_chapter` when the record has none
    pub fn into_document(self, default_chapter: u32) -> Document {
        let chapter = self.chapter.unwrap_or(default_chapter);
        let sections: Vec<String> = if self.shlokas.iter().any(|s| !s.trim().is_empty()) {
            self.shlokas
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else {
            vec![self.content.trim().to_string()]
        };

        Document::new(episode_id(chapter, self.episode), self.title, sections)
    }
}

/// Stable id of an episode
pub fn episode_id(chapter: u32, episode: u32) -> String {
    format!("c{}-ep{}", chapter, episode)
}

/// Turn episode records into documents, dropping the ones without text
pub fn documents_from_episodes(records: Vec<EpisodeRecord>, default_chapter: u32) -> Vec<Document> {
    records
        .into_iter()
        .map(|record| record.into_document(default_chapter))
        .filter(|document| {
            if document.is_empty() {
                warn!("Skipping episode {} with no content", document.id);
                false
            } else {
                true
            }
        })
        .collect()
}

/// Parse an episode export
pub fn parse_episodes(json: &str, default_chapter: u32) -> Result<Vec<Document>> {
    let records: Vec<EpisodeRecord> = serde_json::from_str(json)
        .map_err(|e| RagError::invalid_input(format!("Malformed episode JSON: {}", e)))?;
    Ok(documents_from_episodes(records, default_chapter))
}

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Load documents from a file, picking the reader by MIME type
pub fn load_documents<P: AsRef<Path>>(file_path: P, default_chapter: u32) -> Result<Vec<Document>> {
    let path = file_path.as_ref();

    let mime = from_path(path).first_or_octet_stream();
    let mime_type = mime.to_string();
    debug!("Detected MIME type: {}", mime_type);

    match mime_type.as_str() {
        "application/json" => {
            info!("Processing episode JSON: {}", path.display());
            let json = read_to_string(path)?;
            let documents = parse_episodes(&json, default_chapter)?;
            info!("Loaded {} episodes from {}", documents.len(), path.display());
            Ok(documents)
        }
        mime if mime.starts_with("application/pdf") => {
            info!("Processing PDF document: {}", path.display());
            let content = extract_text(path).map_err(|e| {
                RagError::invalid_input(format!(
                    "Failed to extract text from PDF {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Ok(single_document(path, &normalize_whitespace(&content)))
        }
        DOCX_MIME => {
            info!("Processing Word document: {}", path.display());
            let bytes = fs::read(path).map_err(|e| {
                RagError::invalid_input(format!("Failed to read {}: {}", path.display(), e))
            })?;
            Ok(named_document(path, docx_paragraphs(&bytes, path)?))
        }
        mime if mime.starts_with("text/") => {
            info!("Processing text document: {}", path.display());
            let content = read_to_string(path)?;
            Ok(single_document(path, &content))
        }
        _ => Err(RagError::invalid_input(format!(
            "Unsupported document format: {}. Only JSON, text, PDF and Word files are supported.",
            mime_type
        ))),
    }
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| RagError::invalid_input(format!("Failed to read {}: {}", path.display(), e)))
}

/// Text of each non-empty paragraph in a `.docx` body, in order
fn docx_paragraphs(bytes: &[u8], path: &Path) -> Result<Vec<String>> {
    let docx = read_docx(bytes).map_err(|e| {
        RagError::invalid_input(format!("Failed to parse Word document {}: {}", path.display(), e))
    })?;

    let paragraphs = docx
        .document
        .children
        .iter()
        .filter_map(|child| match child {
            DocumentChild::Paragraph(paragraph) => Some(paragraph),
            _ => None,
        })
        .map(|paragraph| {
            let mut text = String::new();
            for child in &paragraph.children {
                if let ParagraphChild::Run(run) = child {
                    for run_child in &run.children {
                        match run_child {
                            RunChild::Text(t) => text.push_str(&t.text),
                            RunChild::Tab(_) => text.push(' '),
                            _ => {}
                        }
                    }
                }
            }
            text.trim().to_string()
        })
        .filter(|text| !text.is_empty())
        .collect();

    Ok(paragraphs)
}

/// Wrap a plain-text file as one document whose sections are its paragraphs
fn single_document(path: &Path, content: &str) -> Vec<Document> {
    let sections: Vec<String> = content
        .split("\n\n")
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    named_document(path, sections)
}

/// One document named after the file stem
fn named_document(path: &Path, sections: Vec<String>) -> Vec<Document> {
    if sections.is_empty() {
        warn!("Document {} contains only whitespace", path.display());
        return Vec::new();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());

    vec![Document::new(sanitize_id(&stem), Some(stem), sections)]
}

/// Replace non-alphanumeric characters with dashes and lowercase the rest
fn sanitize_id(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .to_lowercase()
}

/// Normalize whitespace in text (remove multiple consecutive spaces, newlines, etc.)
fn normalize_whitespace(text: &str) -> String {
    let result = text.replace('\r', "");

    let mut prev_char = ' ';
    let mut newline_count = 0;
    let mut normalized = String::with_capacity(result.len());

    for c in result.chars() {
        if c == '\n' {
            newline_count += 1;
        } else {
            if newline_count > 0 {
                // At most one blank line survives
                if newline_count >= 2 {
                    normalized.push_str("\n\n");
                } else {
                    normalized.push('\n');
                }
                newline_count = 0;
            }

            if !(c == ' ' && prev_char == ' ') {
                normalized.push(c);
            }

            prev_char = c;
        }
    }

    normalized.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalize_whitespace() {
        let text = "This  has   multiple    spaces.\n\n\nAnd multiple newlines.\r\nAnd Windows line endings.";
        let expected =
            "This has multiple spaces.\n\nAnd multiple newlines.\nAnd Windows line endings.";
        assert_eq!(normalize_whitespace(text), expected);
    }

    #[test]
    fn test_parse_episodes_uses_default_chapter_and_skips_empty() {
        let json = r#"[
            {"chapter": 2, "episode": 10, "content": "Sanjaya describes the armies."},
            {"episode": 3, "content": "Arjuna looks at both sides."},
            {"episode": 4, "content": "   "}
        ]"#;

        let documents = parse_episodes(json, 1).unwrap();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].id, "c2-ep10");
        assert_eq!(documents[1].id, "c1-ep3");
        assert_eq!(documents[1].text(), "Arjuna looks at both sides.");
    }

    #[test]
    fn test_shlokas_become_sections() {
        let json = r#"[{"episode": 1, "content": "ignored", "shlokas": ["first verse", " ", "second verse"]}]"#;
        let documents = parse_episodes(json, 1).unwrap();
        assert_eq!(documents[0].sections, vec!["first verse", "second verse"]);
        assert_eq!(documents[0].text(), "first verse\nsecond verse");
    }

    #[test]
    fn test_malformed_json_is_invalid_input() {
        let err = parse_episodes("{not json", 1).unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
    }

    #[test]
    fn test_load_text_file_splits_paragraphs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Chapter One.txt");
        let mut file = fs::File::create(&path).unwrap();
        write!(file, "First paragraph.\n\nSecond paragraph.\n").unwrap();

        let documents = load_documents(&path, 1).unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].id, "chapter-one");
        assert_eq!(documents[0].sections.len(), 2);
    }

    #[test]
    fn test_load_docx_keeps_non_empty_paragraphs() {
        use docx_rs::{Docx, Paragraph, Run};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Ch1 Episode 4.docx");
        let file = fs::File::create(&path).unwrap();
        Docx::new()
            .add_paragraph(Paragraph::new().add_run(Run::new().add_text("Sanjaya said:")))
            .add_paragraph(Paragraph::new())
            .add_paragraph(
                Paragraph::new()
                    .add_run(Run::new().add_text("The armies "))
                    .add_run(Run::new().add_text("assembled at Kurukshetra.")),
            )
            .build()
            .pack(file)
            .unwrap();

        let documents = load_documents(&path, 1).unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].id, "ch1-episode-4");
        assert_eq!(
            documents[0].sections,
            vec![
                "Sanjaya said:".to_string(),
                "The armies assembled at Kurukshetra.".to_string()
            ]
        );
    }

    #[test]
    fn test_corrupt_docx_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.docx");
        fs::write(&path, b"not a zip archive").unwrap();
        assert!(matches!(
            load_documents(&path, 1),
            Err(RagError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("episodes.json");
        fs::write(&path, r#"[{"chapter": 1, "episode": 1, "content": "Dhritarashtra asks."}]"#)
            .unwrap();

        let documents = load_documents(&path, 1).unwrap();
        assert_eq!(documents[0].id, "c1-ep1");
    }

    #[test]
    fn test_unsupported_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.mp3");
        fs::write(&path, b"ID3").unwrap();
        assert!(matches!(
            load_documents(&path, 1),
            Err(RagError::InvalidInput(_))
        ));
    }
}
