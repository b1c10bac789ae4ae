//! Source and destination seams, plus in-memory implementations.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::checkpoint::Position;
use crate::error::{Result, TransformError};
use crate::transform::model::{DestConfig, SourceConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub source: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, source: Value) -> Self {
        Self {
            id: id.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub documents: Vec<Document>,
    /// Where the next read continues. Equal to the input position when the
    /// page is empty.
    pub next_position: Position,
}

#[async_trait]
pub trait SourceReader: Send + Sync + 'static {
    async fn read(&self, source: &SourceConfig, position: &Position, page_size: usize)
        -> Result<Page>;
}

/// Writes must be idempotent by document id.
#[async_trait]
pub trait DestinationWriter: Send + Sync + 'static {
    /// Returns the number of documents indexed.
    async fn write(&self, dest: &DestConfig, documents: &[Document]) -> Result<usize>;
}

/// Append-only in-memory indices. The cursor is the offset of the next
/// document.
#[derive(Debug, Default)]
pub struct VecSource {
    indices: RwLock<HashMap<String, Vec<Document>>>,
}

impl VecSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn append(&self, index: &str, documents: impl IntoIterator<Item = Document>) {
        self.indices
            .write()
            .await
            .entry(index.to_string())
            .or_default()
            .extend(documents);
    }

    pub async fn doc_count(&self, index: &str) -> usize {
        self.indices.read().await.get(index).map_or(0, Vec::len)
    }
}

fn parse_offset(position: &Position) -> Result<usize> {
    match position.cursor() {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| {
            TransformError::Configuration(format!("Unrecognised source cursor [{}]", raw))
        }),
    }
}

#[async_trait]
impl SourceReader for VecSource {
    async fn read(
        &self,
        source: &SourceConfig,
        position: &Position,
        page_size: usize,
    ) -> Result<Page> {
        let offset = parse_offset(position)?;
        let indices = self.indices.read().await;
        let docs = indices
            .get(&source.index)
            .ok_or_else(|| TransformError::NotFound(format!("source index {}", source.index)))?;

        let start = offset.min(docs.len());
        let end = start.saturating_add(page_size).min(docs.len());
        let documents = docs[start..end].to_vec();
        let next_position = if documents.is_empty() {
            position.clone()
        } else {
            Position::at(end.to_string())
        };
        Ok(Page {
            documents,
            next_position,
        })
    }
}

/// Destination that upserts documents by id.
#[derive(Debug, Default)]
pub struct MemoryDestination {
    indices: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn documents(&self, index: &str) -> BTreeMap<String, Value> {
        self.indices
            .read()
            .await
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, index: &str) -> usize {
        self.indices.read().await.get(index).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DestinationWriter for MemoryDestination {
    async fn write(&self, dest: &DestConfig, documents: &[Document]) -> Result<usize> {
        let mut indices = self.indices.write().await;
        let index = indices.entry(dest.index.clone()).or_default();
        for doc in documents {
            index.insert(doc.id.clone(), doc.source.clone());
        }
        Ok(documents.len())
    }
}
