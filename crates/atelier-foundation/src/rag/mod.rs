//! Retrieval subsystem: chunking, embedding and cosine retrieval over
//! per-judge document collections.

pub mod chunker;
pub mod index;
pub mod similarity;

pub use chunker::{ChunkConfig, TextChunker};
pub use index::{IndexedDocument, RagIndex, Retrieval, RetrievedChunk, EMBED_BATCH_SIZE};
pub use similarity::cosine_similarity;
