//! # hzidx — hierarchical multi-resolution N-D block storage engine
//!
//! Engine guarantees (frozen in format v1):
//! - All numeric on-disk fields are little-endian; never negotiated
//! - The bitmask fully determines the hz address space: `hz ↔ point` is a
//!   bijection and `{hz < 2^h}` is exactly the level-`h` sample set
//! - Blocks are fixed-size hz ranges; block boundaries always align with
//!   hz power-of-two boundaries and samples inside a block are in
//!   increasing hz order
//! - Every stored payload carries a mandatory CRC32 in the block
//!   directory; corrupt payloads never reach a codec
//! - A block that was never written is a hole: reads return zeros and set
//!   `was_hole`, they never fail
//! - Codec identity is a frozen one-byte id; readers fail hard on an id
//!   they cannot supply — no fallback, no negotiation
//! - The same box query semantics hold over local files and over the HTTP
//!   service; a remote read is byte-equal to the local one

pub mod access;
pub mod bitmask;
pub mod blockfile;
pub mod boxquery;
pub mod cache;
pub mod codec;
pub mod dataset;
pub mod dtype;
pub mod error;
pub mod filter;
pub mod header;
pub mod pool;
pub mod query;
pub mod server;
pub mod space;

// Flat re-exports for the most common types.
pub use access::{
    Access, DiskAccess, IoContext, MosaicAccess, MosaicPiece, MultiplexAccess, RamAccess,
    RemoteAccess, RemoteDataset, WritePolicy,
};
pub use bitmask::Bitmask;
pub use boxquery::{hz_gather, hz_scatter, BoxQuery};
pub use codec::{get_codec, CodecError, CodecTag};
pub use dataset::{Dataset, DatasetId, DatasetRegistry};
pub use dtype::{DType, ScalarKind};
pub use error::{Error, Result};
pub use filter::{Filter, FilterKind};
pub use header::{DatasetHeader, Field, Timesteps};
pub use query::{Aborted, BlockQuery, MergeMode, QueryStatus};
pub use server::{NetService, ServeConfig, ServerHandle};
pub use space::{BoxN, LogicSamples, PointN};
