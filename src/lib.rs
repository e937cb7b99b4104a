//! pagebert - two-stage multi-vector retrieval over document pages and
//! text chunks.
//!
//! Every page image and text chunk is stored twice over: a single
//! representative vector that is scanned for fast approximate retrieval,
//! and the compressed full token sequence used to re-rank the surviving
//! candidates with [ColBERT](https://github.com/stanford-futuredata/ColBERT)
//! style late interaction (MaxSim).
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pagebert::{DataDir, Engine, EnginePool, ModelManager};
//! use pagebert::config::DEFAULT_MODEL_ID;
//! use pagebert::search::SearchMode;
//!
//! # async fn run() -> pagebert::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let model = ModelManager::new(DEFAULT_MODEL_ID, Default::default());
//! let engine = Engine::open(&data_dir, Arc::new(EnginePool::single(model)))?;
//!
//! let results = engine.search("quarterly revenue", SearchMode::Hybrid, 10).await?;
//! for r in &results {
//!     println!("{} {} (score: {:.3})", r.doc_id, r.source_ref, r.score);
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod config_db;
pub mod coordinator;
pub mod data_dir;
pub mod doc_id;
pub mod document;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod item;
pub mod item_store;
pub mod model_manager;
pub mod reranker;
pub mod search;
pub mod storage;

pub use config::EngineConfig;
pub use config_db::ConfigDb;
pub use coordinator::Coordinator;
pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use embedding::{EmbeddingEngine, EnginePool, MultiVector};
pub use engine::Engine;
pub use error::{Error, Result};
pub use model_manager::ModelManager;
