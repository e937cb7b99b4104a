//! Documents: the parser's output shape consumed by the coordinator, and
//! the registry record tracked for every ingested document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    doc_id::DocumentId,
    error::{Error, Result},
    item::SourceRef,
};

/// A rendered page image as delivered by the parser. The bytes are an
/// encoded image (PNG, JPEG, ...) and are opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ParsedPage {
    /// 1-based page number.
    pub page_number: u32,
    pub image: PageImage,
}

#[derive(Debug, Clone)]
pub struct ParsedChunk {
    pub chunk_index: u32,
    pub text: String,
    /// Byte span of the chunk in the extracted document text.
    pub start: usize,
    pub end: usize,
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ParsedMetadata {
    pub filename: String,
    /// Upstream identifier; falls back to the filename when absent.
    pub source_name: Option<String>,
}

/// Everything the coordinator needs from the external parser.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub pages: Vec<ParsedPage>,
    pub text_chunks: Vec<ParsedChunk>,
    pub metadata: ParsedMetadata,
}

impl ParsedDocument {
    pub fn doc_id(&self) -> DocumentId {
        let name = self
            .metadata
            .source_name
            .as_deref()
            .unwrap_or(&self.metadata.filename);
        DocumentId::new(name)
    }

    pub fn format_class(&self) -> Result<FormatClass> {
        match (self.pages.is_empty(), self.text_chunks.is_empty()) {
            (false, true) => Ok(FormatClass::VisualOnly),
            (true, false) => Ok(FormatClass::TextOnly),
            (false, false) => Ok(FormatClass::Hybrid),
            (true, true) => Err(Error::Validation(format!(
                "parsed document '{}' has neither pages nor text chunks",
                self.metadata.filename
            ))),
        }
    }
}

impl ParsedPage {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef::Page(crate::item::VisualItemMeta {
            page_number: self.page_number,
            width: Some(self.image.width),
            height: Some(self.image.height),
        })
    }
}

impl ParsedChunk {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef::Chunk(crate::item::TextItemMeta {
            chunk_index: self.chunk_index,
            start: self.start,
            end: self.end,
            page_number: self.page_number,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatClass {
    VisualOnly,
    TextOnly,
    Hybrid,
}

/// Processing stage of a document.
///
/// `Queued → Parsing → Embedding → Storing → Completed`, with `Failed`
/// reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Parsing,
    Embedding,
    Storing,
    Completed,
    Failed,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Queued, Parsing)
            | (Parsing, Embedding)
            | (Embedding, Storing)
            | (Storing, Completed) => true,
            // Progress updates within a stage.
            (from, to) if from == to => !from.is_terminal(),
            // Re-ingestion starts over from a finished document.
            (Completed | Failed, Queued) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Parsing => "parsing",
            Stage::Embedding => "embedding",
            Stage::Storing => "storing",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The registry entry for one document, persisted in the config database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: DocumentId,
    pub filename: String,
    pub format_class: FormatClass,
    pub date_added: DateTime<Utc>,
    pub page_count: u32,
    pub chunk_count: u32,
    pub stage: Stage,
    /// Set when at least one branch stored items but another failed.
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn queued(doc: &ParsedDocument) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            doc_id: doc.doc_id(),
            filename: doc.metadata.filename.clone(),
            format_class: doc.format_class()?,
            date_added: now,
            page_count: 0,
            chunk_count: 0,
            stage: Stage::Queued,
            partial: false,
            failure_reason: None,
            updated_at: now,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            Error::Storage(format!("failed to encode document record: {e}"))
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            Error::Storage(format!("failed to decode document record: {e}"))
        })
    }
}
