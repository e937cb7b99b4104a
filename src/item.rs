//! Item-level types shared by storage and search: the two logical
//! collections and the typed source reference each item carries.

use serde::{Deserialize, Serialize};

/// Identifier of a stored page or text chunk. Unique across both
/// collections and allocated monotonically by the item store.
pub type ItemId = u64;

/// The two logical item collections.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Visual,
    Text,
}

impl Collection {
    pub const ALL: [Collection; 2] = [Collection::Visual, Collection::Text];

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Visual => "visual",
            Collection::Text => "text",
        }
    }

    /// The collection that is not `self`.
    pub fn other(self) -> Collection {
        match self {
            Collection::Visual => Collection::Text,
            Collection::Text => Collection::Visual,
        }
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            Collection::Visual => 0,
            Collection::Text => 1,
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a page item came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisualItemMeta {
    /// 1-based page number within the source document.
    pub page_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Where a text chunk came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextItemMeta {
    pub chunk_index: u32,
    /// Byte offset of the chunk start in the extracted document text.
    pub start: usize,
    /// Byte offset one past the chunk end.
    pub end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
}

/// Typed back-reference from an item to its place in the source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRef {
    Page(VisualItemMeta),
    Chunk(TextItemMeta),
}

impl SourceRef {
    pub fn page(page_number: u32) -> Self {
        SourceRef::Page(VisualItemMeta {
            page_number,
            width: None,
            height: None,
        })
    }

    pub fn chunk(chunk_index: u32, start: usize, end: usize) -> Self {
        SourceRef::Chunk(TextItemMeta {
            chunk_index,
            start,
            end,
            page_number: None,
        })
    }

    /// The collection an item with this reference must live in.
    pub fn collection(&self) -> Collection {
        match self {
            SourceRef::Page(_) => Collection::Visual,
            SourceRef::Chunk(_) => Collection::Text,
        }
    }
}

impl std::fmt::Display for SourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceRef::Page(meta) => write!(f, "page {}", meta.page_number),
            SourceRef::Chunk(meta) => match meta.page_number {
                Some(page) => write!(
                    f,
                    "chunk {} [{}..{}] (page {page})",
                    meta.chunk_index, meta.start, meta.end
                ),
                None => write!(
                    f,
                    "chunk {} [{}..{}]",
                    meta.chunk_index, meta.start, meta.end
                ),
            },
        }
    }
}
