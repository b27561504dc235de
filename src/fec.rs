//! Forward error correction over fixed-size packets.
//!
//! A logical block of `K` packets is expanded to `N = K + ecc_level` coded
//! packets via a systematic Reed-Solomon code (packets `0..K` equal the
//! source, packets `K..N` are redundancy). Each coded packet is immediately
//! followed on disk by a 16-byte MD5 tag used purely as an erasure
//! indicator — a bad-packet detector, not a cryptographic authenticator.

use md5::{Digest, Md5};
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::ArchiveError;

/// Size in bytes of one coded packet, before its MD5 tag.
pub const PACKET_SIZE: usize = 1024;

/// Number of source packets per logical block. Compile-time constant.
pub const FEC_K: usize = 128;

/// Upper bound on `N = K + ecc_level`. `galois_8::ReedSolomon` supports up to
/// 256 total shards, which is exactly this bound.
pub const FEC_N_MAX: usize = 256;

/// Byte length of the MD5 erasure tag appended to each coded packet.
pub const MD5_TAG_LEN: usize = 16;

/// Fixed size, in bytes, of one logical block crossing the pipeline boundary.
pub const LOGICAL_BLOCK_SIZE: usize = FEC_K * PACKET_SIZE;

/// Once-per-archive metadata frame describing the FEC parameters, padded to
/// exactly [`FEC_MAINHEAD_SIZE`] and self-checksummed with MD5 over its
/// variable data region (everything after `magic`/`version`/`md5sum`).
pub const FEC_MAINHEAD_SIZE: usize = 4096;

/// Number of times the FEC main header is written at the start of the
/// archive, for redundancy against corruption of the first copy.
pub const FEC_MAINHEAD_COPIES: usize = 2;

/// On-disk magic for the FEC main header, distinct from [`crate::frame::FRAME_MAGIC`].
pub const FEC_MAINHEAD_MAGIC: u32 = 0x4653_4645; // "FSFE"

pub const FEC_MAINHEAD_VERSION: u16 = 1;

const FEC_MAINHEAD_DATA_SIZE: usize = FEC_MAINHEAD_SIZE - 4 /* magic */ - 2 /* version */ - 16 /* md5 */;

/// The FEC main header: `version` and `fec_n` (the chosen `N` for this archive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecMainHeader {
    pub version: u16,
    pub fec_n: u16,
}

impl FecMainHeader {
    /// Serializes to exactly [`FEC_MAINHEAD_SIZE`] bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; FEC_MAINHEAD_DATA_SIZE];
        data[0..2].copy_from_slice(&self.fec_n.to_le_bytes());

        let md5sum = Md5::digest(&data);

        let mut buf = Vec::with_capacity(FEC_MAINHEAD_SIZE);
        buf.extend_from_slice(&FEC_MAINHEAD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&md5sum);
        buf.extend_from_slice(&data);
        debug_assert_eq!(buf.len(), FEC_MAINHEAD_SIZE);
        buf
    }

    /// Parses a [`FEC_MAINHEAD_SIZE`]-byte buffer. Returns `None` if the
    /// magic doesn't match at all; otherwise returns the header plus whether
    /// its MD5 self-check validated.
    pub fn from_bytes(buf: &[u8]) -> Option<(Self, bool)> {
        if buf.len() < FEC_MAINHEAD_SIZE {
            return None;
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().ok()?);
        if magic != FEC_MAINHEAD_MAGIC {
            return None;
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().ok()?);
        let stored_md5 = &buf[6..22];
        let data = &buf[22..22 + FEC_MAINHEAD_DATA_SIZE];
        let computed = Md5::digest(data);
        let ok = computed.as_slice() == stored_md5;
        let fec_n = u16::from_le_bytes(data[0..2].try_into().ok()?);
        Some((FecMainHeader { version, fec_n }, ok))
    }
}

/// Result of a successful [`FecCodec::decode`].
pub struct DecodeOutcome {
    pub block: Vec<u8>,
    pub bad_packets: usize,
}

/// A configured `(K, N)` erasure coder for one archive.
///
/// `ecc_level == 0` (`n == k`) is identity coding: there are no parity
/// packets to compute, `reed-solomon-erasure` itself rejects a zero-parity
/// configuration, so the coder is simply absent and encode/decode pass
/// packets through verbatim (still MD5-tagged, still erasure-checked).
pub struct FecCodec {
    k: usize,
    n: usize,
    rs: Option<ReedSolomon>,
}

impl FecCodec {
    /// Builds a codec for `ecc_level` redundancy packets (`N = K + ecc_level`).
    pub fn new(ecc_level: u32) -> Result<Self, ArchiveError> {
        Self::with_n(FEC_K + ecc_level as usize)
    }

    /// Builds a codec for an already-known `n` (e.g. one recovered from an
    /// [`FecMainHeader`] on read).
    pub fn with_n(n: usize) -> Result<Self, ArchiveError> {
        if n < FEC_K || n > FEC_N_MAX {
            return Err(ArchiveError::format(format!(
                "fec_n {n} out of bounds [{FEC_K}, {FEC_N_MAX}]"
            )));
        }
        let rs = if n == FEC_K {
            None
        } else {
            let rs = ReedSolomon::new(FEC_K, n - FEC_K)
                .map_err(|e| ArchiveError::format(format!("failed to build reed-solomon coder: {e}")))?;
            Some(rs)
        };
        Ok(FecCodec { k: FEC_K, n, rs })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Byte length of one logical block (`K · PACKET_SIZE`).
    pub fn logical_block_len(&self) -> usize {
        self.k * PACKET_SIZE
    }

    /// Byte length of the on-disk FEC expansion (`N · (PACKET_SIZE + MD5_TAG_LEN)`).
    pub fn expanded_block_len(&self) -> usize {
        self.n * (PACKET_SIZE + MD5_TAG_LEN)
    }

    /// FEC-encodes one logical block (exactly `logical_block_len()` bytes)
    /// into its on-disk expansion (exactly `expanded_block_len()` bytes).
    pub fn encode(&self, block: &[u8]) -> Result<Vec<u8>, ArchiveError> {
        if block.len() != self.logical_block_len() {
            return Err(ArchiveError::format(format!(
                "logical block is {} bytes, expected {}",
                block.len(),
                self.logical_block_len()
            )));
        }

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.n);
        for chunk in block.chunks(PACKET_SIZE) {
            shards.push(chunk.to_vec());
        }
        for _ in self.k..self.n {
            shards.push(vec![0u8; PACKET_SIZE]);
        }

        if let Some(rs) = &self.rs {
            rs.encode(&mut shards)
                .map_err(|e| ArchiveError::format(format!("fec encode failed: {e}")))?;
        }

        let mut out = Vec::with_capacity(self.expanded_block_len());
        for shard in &shards {
            let tag = Md5::digest(shard);
            out.extend_from_slice(shard);
            out.extend_from_slice(&tag);
        }
        Ok(out)
    }

    /// FEC-decodes one on-disk expansion (exactly `expanded_block_len()`
    /// bytes) back into its logical block, verifying each packet's MD5 tag
    /// as an erasure indicator.
    ///
    /// Returns [`ArchiveError::Unrecoverable`] if fewer than `K` packets
    /// verify; otherwise reconstructs via the erasure decoder and reports
    /// how many packets were found bad, for diagnostic logging.
    pub fn decode(&self, expanded: &[u8]) -> Result<DecodeOutcome, ArchiveError> {
        let stride = PACKET_SIZE + MD5_TAG_LEN;
        if expanded.len() != self.n * stride {
            return Err(ArchiveError::format(format!(
                "expanded block is {} bytes, expected {}",
                expanded.len(),
                self.n * stride
            )));
        }

        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(self.n);
        let mut good_count = 0usize;
        for chunk in expanded.chunks(stride) {
            let (packet, tag) = chunk.split_at(PACKET_SIZE);
            let computed = Md5::digest(packet);
            if computed.as_slice() == tag {
                good_count += 1;
                shards.push(Some(packet.to_vec()));
            } else {
                shards.push(None);
            }
        }
        let bad_packets = self.n - good_count;

        if good_count < self.k {
            return Err(ArchiveError::Unrecoverable { needed: self.k, found: good_count });
        }

        if let Some(rs) = &self.rs {
            rs.reconstruct(&mut shards)
                .map_err(|e| ArchiveError::format(format!("fec reconstruct failed: {e}")))?;
        }

        let mut block = Vec::with_capacity(self.logical_block_len());
        for shard in shards.into_iter().take(self.k) {
            block.extend_from_slice(&shard.expect("reconstruct fills every shard"));
        }

        Ok(DecodeOutcome { block, bad_packets })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(len: usize, fill: u8) -> Vec<u8> {
        vec![fill; len]
    }

    #[test]
    fn round_trips_with_no_corruption() {
        let codec = FecCodec::new(4).unwrap();
        let block = sample_block(codec.logical_block_len(), 0x42);
        let expanded = codec.encode(&block).unwrap();
        let outcome = codec.decode(&expanded).unwrap();
        assert_eq!(outcome.block, block);
        assert_eq!(outcome.bad_packets, 0);
    }

    #[test]
    fn corrects_corruption_within_ecc_budget() {
        let codec = FecCodec::new(4).unwrap();
        let block: Vec<u8> = (0..codec.logical_block_len()).map(|i| i as u8).collect();
        let mut expanded = codec.encode(&block).unwrap();

        let stride = PACKET_SIZE + MD5_TAG_LEN;
        for packet_index in [0usize, 5usize] {
            let start = packet_index * stride;
            for b in &mut expanded[start..start + PACKET_SIZE] {
                *b ^= 0xFF;
            }
        }

        let outcome = codec.decode(&expanded).unwrap();
        assert_eq!(outcome.block, block);
        assert_eq!(outcome.bad_packets, 2);
    }

    #[test]
    fn identity_coding_round_trips_with_no_redundancy() {
        let codec = FecCodec::new(0).unwrap();
        assert_eq!(codec.n(), codec.k());
        let block = sample_block(codec.logical_block_len(), 0x99);
        let expanded = codec.encode(&block).unwrap();
        let outcome = codec.decode(&expanded).unwrap();
        assert_eq!(outcome.block, block);
        assert_eq!(outcome.bad_packets, 0);
    }

    #[test]
    fn identity_coding_has_no_redundancy_to_recover_from() {
        let codec = FecCodec::new(0).unwrap();
        let block = sample_block(codec.logical_block_len(), 0x55);
        let mut expanded = codec.encode(&block).unwrap();
        expanded[0] ^= 0xFF;
        let err = codec.decode(&expanded).unwrap_err();
        assert!(matches!(err, ArchiveError::Unrecoverable { needed: 128, found: 127 }));
    }

    #[test]
    fn reports_unrecoverable_beyond_ecc_budget() {
        let codec = FecCodec::new(1).unwrap();
        let block = sample_block(codec.logical_block_len(), 0x7);
        let mut expanded = codec.encode(&block).unwrap();

        let stride = PACKET_SIZE + MD5_TAG_LEN;
        for packet_index in [0usize, 1usize] {
            let start = packet_index * stride;
            expanded[start] ^= 0xFF;
        }

        let err = codec.decode(&expanded).unwrap_err();
        assert!(matches!(err, ArchiveError::Unrecoverable { needed: 128, found: 127 }));
    }

    #[test]
    fn main_header_round_trips() {
        let header = FecMainHeader { version: FEC_MAINHEAD_VERSION, fec_n: 132 };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), FEC_MAINHEAD_SIZE);
        let (parsed, ok) = FecMainHeader::from_bytes(&bytes).unwrap();
        assert!(ok);
        assert_eq!(parsed, header);
    }

    #[test]
    fn main_header_detects_corruption() {
        let header = FecMainHeader { version: FEC_MAINHEAD_VERSION, fec_n: 200 };
        let mut bytes = header.to_bytes();
        bytes[30] ^= 0xFF;
        let (_, ok) = FecMainHeader::from_bytes(&bytes).unwrap();
        assert!(!ok);
    }
}
