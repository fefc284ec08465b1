//! Recuperación multi-documento sobre índices jerárquicos de contenido.

pub mod aggregator;
pub mod api;
pub mod app_state;
pub mod catalog;
pub mod config;
pub mod error;
pub mod indexer;
pub mod llm;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod selector;
pub mod tree_search;
pub mod tree_store;

pub use error::{Error, Result, StageOutcome};
