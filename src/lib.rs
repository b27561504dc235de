//! Archive I/O core: volumes, framed block headers, forward error correction,
//! and the producer/consumer pipelines that move logical blocks through them.
//!
//! # Format guarantees frozen in v1
//!
//! 1. All multi-byte integers on disk are little-endian, no exceptions.
//! 2. A frame's checksum covers its payload only, never `magic`/`archive_id`/`type`.
//! 3. A volume is readable from either its head or its tail descriptor; a
//!    corrupt copy of one does not make the volume unreadable.
//! 4. `block_number` is strictly monotone across an entire archive, splits
//!    across volumes notwithstanding.
//! 5. FEC packet MD5 tags are erasure indicators, not authenticators — they
//!    detect bit-rot, not tampering.
//! 6. A failed write never leaves a partial archive on disk: any error after
//!    the first byte is written triggers deletion of every volume from that
//!    session.
//!
//! Filesystem traversal, compression, encryption, the command-line surface
//! and the in-memory file-name/metadata dictionary are explicitly out of
//! scope; this crate moves opaque fixed-size logical blocks and nothing else.

pub mod error;
pub mod fec;
pub mod fletcher;
pub mod frame;
pub mod pipeline;
pub mod resolver;
pub mod session;
pub mod volume_store;

pub use error::ArchiveError;
pub use fec::{DecodeOutcome, FecCodec, FecMainHeader, FEC_K, FEC_MAINHEAD_COPIES, FEC_N_MAX, PACKET_SIZE};
pub use frame::{Frame, FramePayload, FrameType};
pub use pipeline::{bounded_queue, BlockReceiver, BlockSender, LogicalBlock, ReaderPipeline, WriterPipeline};
pub use resolver::{MissingVolumeResolver, TtyMissingVolumeResolver};
pub use session::SessionContext;
pub use volume_store::{volume_path, VolumeStoreOptions, VolumeStoreReader, VolumeStoreWriter};
