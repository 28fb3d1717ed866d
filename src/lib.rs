pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extraction;
pub mod filter;
pub mod index;
pub mod inference;
pub mod ingest;
pub mod lock;
pub mod metadata_store;
pub mod persistence;
pub mod query;
pub mod vector_store;

pub use error::IndexError;
pub use index::{RetrievalIndex, ReloadOutcome, SearchHit};
pub use metadata_store::{Chunk, Tags};
