//! Configuration loading.
//!
//! Centralizes environment variable reading into a single struct.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};

use crate::index::DEFAULT_OVERFETCH_FACTOR;
use crate::query::DEFAULT_TOP_K;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 150;
pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 32;
pub const DEFAULT_HASHING_DIMENSION: usize = 384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Ollama,
    /// Offline feature-hashing embedder.
    Hashing,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "hashing" => Ok(Self::Hashing),
            other => Err(anyhow!("Unknown EMBEDDING_PROVIDER '{other}' (expected ollama or hashing)")),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::Hashing => write!(f, "hashing"),
        }
    }
}

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `vectors.bin` and `metadata.json`
    pub db_dir: PathBuf,
    /// Default folder for batch ingestion
    pub documents_dir: PathBuf,
    pub embedding_provider: String,
    pub ollama_url: String,
    pub embedding_model: String,
    pub embedding_batch_size: usize,
    pub hashing_dimension: usize,
    /// OpenAI-compatible chat-completions base URL
    pub llm_base_url: String,
    pub llm_model: String,
    pub extraction_model: String,
    pub api_key: String,
    /// Probe `<llm_base_url>/health` before each document
    pub llm_is_local: bool,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub overfetch_factor: usize,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    /// Unparseable numbers fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: usize| {
            lookup(key)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(default)
        };

        let llm_model = text("LLM_MODEL", "gemma-3-27b");
        Self {
            db_dir: PathBuf::from(text("MEDICAL_DB_DIR", "medical_db")),
            documents_dir: PathBuf::from(text("DOCUMENTS_DIR", "./raw_records")),
            embedding_provider: text("EMBEDDING_PROVIDER", "ollama"),
            ollama_url: text("OLLAMA_URL", "http://localhost:11434"),
            embedding_model: text("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text"),
            embedding_batch_size: number("EMBEDDING_BATCH_SIZE", DEFAULT_EMBEDDING_BATCH_SIZE),
            hashing_dimension: number("HASHING_DIMENSION", DEFAULT_HASHING_DIMENSION),
            llm_base_url: text("LLM_BASE_URL", "http://localhost:8001"),
            extraction_model: lookup("LLM_EXTRACTION_MODEL").unwrap_or_else(|| llm_model.clone()),
            llm_model,
            api_key: text("OPENAI_API_KEY", "sk-no-key-required"),
            llm_is_local: lookup("LLM_IS_LOCAL")
                .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            chunk_size: number("CHUNK_SIZE", DEFAULT_CHUNK_SIZE),
            chunk_overlap: number("CHUNK_OVERLAP", DEFAULT_CHUNK_OVERLAP),
            top_k: number("RAG_TOP_K", DEFAULT_TOP_K),
            overfetch_factor: number("RAG_OVERFETCH_FACTOR", DEFAULT_OVERFETCH_FACTOR),
            log_level: text("LOG_LEVEL", "info"),
            log_dir: lookup("LOG_DIR").filter(|s| !s.trim().is_empty()).map(PathBuf::from),
        }
    }

    pub fn provider(&self) -> Result<ProviderKind> {
        self.embedding_provider.parse()
    }

    pub fn validate(&self) -> Result<()> {
        self.provider()?;
        if self.chunk_size == 0 {
            bail!("CHUNK_SIZE must be greater than zero");
        }
        if self.chunk_overlap >= self.chunk_size {
            bail!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
                self.chunk_overlap,
                self.chunk_size
            );
        }
        if self.top_k == 0 {
            bail!("RAG_TOP_K must be greater than zero");
        }
        if self.overfetch_factor == 0 {
            bail!("RAG_OVERFETCH_FACTOR must be at least 1");
        }
        if self.hashing_dimension == 0 {
            bail!("HASHING_DIMENSION must be greater than zero");
        }
        Ok(())
    }

    /// Build a summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "DB_DIR={}  DOCS_DIR={}  EMBEDDINGS={}  LLM={} ({})",
            self.db_dir.display(),
            self.documents_dir.display(),
            self.embedding_provider,
            self.llm_model,
            self.llm_base_url
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}
