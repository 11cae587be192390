//! Chunk identity and metadata.
//!
//! A chunk's identity is content-addressed:
//! `sha256(project_id ∥ file_path ∥ start_line ∥ end_line ∥ sha256(text))`,
//! truncated to 16 hex characters. The same project, path, range, and text
//! always produce the same hash, which is what makes re-indexing overwrite
//! in place instead of duplicating points.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Kind of semantic unit a chunk was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SemanticType {
    /// Class declaration
    Class,
    /// Struct declaration
    Struct,
    /// Record declaration
    Record,
    /// Interface declaration
    Interface,
    /// Method or free function
    Method,
    /// Property accessor
    Property,
    /// Field declaration
    Field,
    /// Constructor
    Constructor,
    /// Event declaration
    Event,
    /// Indexer declaration
    Indexer,
    /// Operator overload
    Operator,
    /// Top-level statements outside any type
    TopLevel,
    /// Whole-file fallback unit
    File,
}

impl SemanticType {
    /// Wire representation used in vector payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            SemanticType::Class => "class",
            SemanticType::Struct => "struct",
            SemanticType::Record => "record",
            SemanticType::Interface => "interface",
            SemanticType::Method => "method",
            SemanticType::Property => "property",
            SemanticType::Field => "field",
            SemanticType::Constructor => "constructor",
            SemanticType::Event => "event",
            SemanticType::Indexer => "indexer",
            SemanticType::Operator => "operator",
            SemanticType::TopLevel => "top-level",
            SemanticType::File => "file",
        }
    }

    /// Parse a wire string, falling back to `File`.
    pub fn from_wire(value: &str) -> Self {
        match value {
            "class" => SemanticType::Class,
            "struct" => SemanticType::Struct,
            "record" => SemanticType::Record,
            "interface" => SemanticType::Interface,
            "method" => SemanticType::Method,
            "property" => SemanticType::Property,
            "field" => SemanticType::Field,
            "constructor" => SemanticType::Constructor,
            "event" => SemanticType::Event,
            "indexer" => SemanticType::Indexer,
            "operator" => SemanticType::Operator,
            "top-level" => SemanticType::TopLevel,
            _ => SemanticType::File,
        }
    }
}

/// A contiguous, semantically meaningful slice of a source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Owning project
    pub project_id: Uuid,
    /// Path relative to the extraction root
    pub file_path: String,
    /// First line of the slice, 1-based inclusive
    pub start_line: usize,
    /// Last line of the slice, 1-based inclusive
    pub end_line: usize,
    /// Language key, e.g. `rust`
    pub language: String,
    /// Kind of unit this slice was cut from
    pub semantic_type: SemanticType,
    /// Unit name; never empty (file basename as a last resort)
    pub semantic_name: String,
    /// Position of this chunk within its file, 0-based
    pub chunk_index: usize,
    /// Chunk count for the whole file; at least 1
    pub total_chunks: usize,
    /// Token count of the text
    pub token_count: usize,
    /// Slice text; dropped before persistence when storage opts out
    pub text: Option<String>,
    /// Full sha256 of the text
    pub text_hash: String,
    /// 16-hex content-addressed identity
    pub chunk_hash: String,
}

impl Chunk {
    /// Build a chunk and derive both hashes. `chunk_index`/`total_chunks`
    /// are assigned by the chunker once the whole file has been emitted.
    pub fn new(
        project_id: Uuid,
        file_path: impl Into<String>,
        start_line: usize,
        end_line: usize,
        language: impl Into<String>,
        semantic_type: SemanticType,
        semantic_name: impl Into<String>,
        text: String,
        token_count: usize,
    ) -> Self {
        let file_path = file_path.into();
        let semantic_name = semantic_name.into();
        let text_hash = hex_digest(text.as_bytes());
        let chunk_hash =
            identity_hash(project_id, &file_path, start_line, end_line, &text_hash);

        Self {
            project_id,
            file_path,
            start_line,
            end_line,
            language: language.into(),
            semantic_type,
            semantic_name,
            chunk_index: 0,
            total_chunks: 0,
            token_count,
            text: Some(text),
            text_hash,
            chunk_hash,
        }
    }

    /// Whether index/count invariants hold.
    pub fn invariants_hold(&self) -> bool {
        self.total_chunks >= 1
            && self.chunk_index < self.total_chunks
            && !self.semantic_name.is_empty()
    }
}

/// Full sha256 hex digest.
pub fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content-addressed chunk identity, truncated to 16 hex characters.
pub fn identity_hash(
    project_id: Uuid,
    file_path: &str,
    start_line: usize,
    end_line: usize,
    text_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update(file_path.as_bytes());
    hasher.update(start_line.to_le_bytes());
    hasher.update(end_line.to_le_bytes());
    hasher.update(text_hash.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}
