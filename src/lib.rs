//! Indexing and search coordination core for a hybrid lexical + tensor
//! vector search engine (see `SPEC_FULL.md`). A library, not a server: the
//! HTTP framing, CLI, and embedding model runtime are external collaborators.

pub mod config;
pub mod data;
pub mod embedder;
pub mod error;
pub mod filter;
pub mod index;
pub mod package;
pub mod pipeline;
pub mod search;
pub mod store;

pub use config::CoreConfig;
pub use error::{BatchResult, CoreError, Outcome, Result};
