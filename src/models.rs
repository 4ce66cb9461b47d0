//! Core data models used throughout the pipeline.
//!
//! These types represent the research documents, outlines, code blocks,
//! artifacts and templates that flow from a topic to a finished deck.

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Research text accumulated from the LLM for one topic.
///
/// Grows chunk by chunk while streaming; frozen once `is_complete` is set.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchDocument {
    pub id: String,
    pub topic: String,
    pub raw_text: String,
    pub is_complete: bool,
    pub created_at: DateTime<Utc>,
}

impl ResearchDocument {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            raw_text: String::new(),
            is_complete: false,
            created_at: Utc::now(),
        }
    }

    /// Build an already-complete document from existing text.
    pub fn from_text(topic: impl Into<String>, text: impl Into<String>) -> Self {
        let mut doc = Self::new(topic);
        doc.raw_text = text.into();
        doc.is_complete = true;
        doc
    }

    /// Append a streamed chunk. Returns `false` (and changes nothing) if the
    /// document is already complete.
    pub fn append(&mut self, chunk: &str) -> bool {
        if self.is_complete {
            return false;
        }
        self.raw_text.push_str(chunk);
        true
    }

    pub fn complete(&mut self) {
        self.is_complete = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlineFormat {
    Markdown,
}

/// Slide-structured markdown derived from a research document.
#[derive(Debug, Clone, Serialize)]
pub struct Outline {
    pub source_document_ref: String,
    pub normalized_text: String,
    /// Byte offsets of each `---` slide-break line in `normalized_text`.
    pub slide_breaks: Vec<usize>,
    pub format: OutlineFormat,
    pub is_complete: bool,
}

impl Outline {
    /// Wrap outline text supplied by a caller (e.g. an edited outline),
    /// normalizing it the same way model output is normalized.
    pub fn from_text(source_document_ref: impl Into<String>, text: &str) -> Self {
        let normalized_text = crate::outline::normalize(text);
        let slide_breaks = crate::outline::slide_break_offsets(&normalized_text);
        Self {
            source_document_ref: source_document_ref.into(),
            normalized_text,
            slide_breaks,
            format: OutlineFormat::Markdown,
            is_complete: true,
        }
    }

    /// Number of slides the outline describes.
    pub fn slide_count(&self) -> usize {
        if self.normalized_text.trim().is_empty() {
            0
        } else {
            self.slide_breaks.len() + 1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    Statistical,
    Other,
}

/// What a statistical code block is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeKind {
    Plot,
    Table,
    Generic,
}

impl CodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeKind::Plot => "plot",
            CodeKind::Table => "table",
            CodeKind::Generic => "generic",
        }
    }

    pub fn mime_type(&self) -> MimeType {
        match self {
            CodeKind::Plot => MimeType::Svg,
            CodeKind::Table => MimeType::Html,
            CodeKind::Generic => MimeType::PlainText,
        }
    }
}

impl fmt::Display for CodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plot" => Ok(CodeKind::Plot),
            "table" => Ok(CodeKind::Table),
            "generic" | "text" => Ok(CodeKind::Generic),
            other => Err(format!("unknown code kind: '{}'", other)),
        }
    }
}

/// A fenced statistical code block found in outline text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: CodeLanguage,
    pub raw_source: String,
    pub kind: CodeKind,
    /// Byte offset of the opening fence in the outline text.
    pub position_in_outline: usize,
    /// Byte length of the whole fenced block, fences included.
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MimeType {
    #[serde(rename = "image/svg+xml")]
    Svg,
    #[serde(rename = "text/html")]
    Html,
    #[serde(rename = "text/plain")]
    PlainText,
}

impl MimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::Svg => "image/svg+xml",
            MimeType::Html => "text/html",
            MimeType::PlainText => "text/plain",
        }
    }
}

/// Rendered output of one code body, keyed by the hash of that body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub content_hash: String,
    pub mime_type: MimeType,
    pub payload: Vec<u8>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(content_hash: impl Into<String>, mime_type: MimeType, payload: Vec<u8>) -> Self {
        let size_bytes = payload.len() as u64;
        Self {
            content_hash: content_hash.into(),
            mime_type,
            payload,
            size_bytes,
            created_at: Utc::now(),
        }
    }

    pub fn payload_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.payload)
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A named colour and font scheme applied to a compiled deck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    pub name: &'static str,
    pub theme: &'static str,
    pub background_color: &'static str,
    pub text_color: &'static str,
    pub accent_color: &'static str,
    pub heading_font: &'static str,
    pub body_font: &'static str,
}
