//! facematch-store: vector store backends for the facematch pipeline.

pub mod milvus;

pub use milvus::{MilvusConfig, MilvusStore};
