//! File-to-segment pipeline: folder indexing, streaming chunking with
//! compression and encryption, small-file packing, and reassembly.

pub mod assemble;
pub mod chunker;
pub mod error;
pub mod indexer;
pub mod packer;

pub use assemble::FileWriter;
pub use chunker::{open_segment, prepare_chunk, ChunkReader, PreparedSegment};
pub use error::{Result, SegmenterError};
pub use indexer::{derive_folder_id, Indexer};
pub use packer::{build_pack_payload, plan_packs, unpack_payload, PackEntry};
