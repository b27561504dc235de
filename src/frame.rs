//! Frame ("io-head") format — fixed-size, magic-tagged, Fletcher-32-checksummed
//! records that carry volume descriptors and block headers.
//!
//! # On-disk layout (38 bytes, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic      = 0x4653_4148  ("FSAH", LE u32)
//!    4      4   archive_id archive-wide random id   (LE u32)
//!    8      2   frame_type 1=VolumeDescriptor 2=BlockHeader (LE u16)
//!   10     24   payload    union, discriminated by frame_type
//!   34      4   checksum   Fletcher-32([10..34])  ← over payload only
//! ```
//!
//! `checksum` never covers `magic`, `archive_id` or `frame_type`: those three
//! fields are what the resynchronizing scan matches on *before* it trusts the
//! checksum, so they cannot depend on it.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::fletcher::fletcher32;

/// On-disk magic for every frame. LE u32.
pub const FRAME_MAGIC: u32 = 0x4653_4148; // "FSAH"

/// Fixed byte size of the union payload region.
pub const PAYLOAD_SIZE: usize = 24;

/// Fixed byte size of a whole frame (magic + archive_id + type + payload + checksum).
pub const FRAME_SIZE: usize = 4 + 4 + 2 + PAYLOAD_SIZE + 4;

/// Discriminates the payload carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameType {
    /// `VOLHEAD` — a volume descriptor, written at both ends of a volume.
    VolumeDescriptor = 1,
    /// `BLKHEAD` — a block header, immediately followed on disk by the block payload.
    BlockHeader = 2,
}

impl FrameType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(FrameType::VolumeDescriptor),
            2 => Some(FrameType::BlockHeader),
            _ => None,
        }
    }
}

/// A volume descriptor payload (written twice per volume: head and tail).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeDescriptorPayload {
    pub volume_number: u32,
    /// 64-bit packed major.minor.patch.build, see [`pack_version`].
    pub minimum_reader_version: u64,
    pub ecc_level: u32,
    pub last_volume: bool,
}

/// A block header payload, immediately followed on disk by `bytes_used`-or-fewer
/// valid bytes within a fixed-size block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeaderPayload {
    pub block_number: u64,
    pub bytes_used: u32,
}

/// Packs a `major.minor.patch.build` version quadruplet into the 64-bit field
/// carried by [`VolumeDescriptorPayload::minimum_reader_version`].
pub fn pack_version(major: u8, minor: u8, patch: u8, build: u8) -> u64 {
    ((major as u64) << 24) | ((minor as u64) << 16) | ((patch as u64) << 8) | (build as u64)
}

/// This build's own version, used as the upper bound in the version gate.
pub const IMPLEMENTATION_VERSION: u64 = pack_version(1, 0, 0, 0);

/// The payload carried by a frame, discriminated by [`FrameType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePayload {
    VolumeDescriptor(VolumeDescriptorPayload),
    BlockHeader(BlockHeaderPayload),
}

impl FramePayload {
    pub fn frame_type(&self) -> FrameType {
        match self {
            FramePayload::VolumeDescriptor(_) => FrameType::VolumeDescriptor,
            FramePayload::BlockHeader(_) => FrameType::BlockHeader,
        }
    }

    fn encode(&self) -> [u8; PAYLOAD_SIZE] {
        let mut buf = [0u8; PAYLOAD_SIZE];
        let mut pos = 0;

        macro_rules! put_u32le { ($v:expr) => {{
            buf[pos..pos + 4].copy_from_slice(&($v as u32).to_le_bytes()); pos += 4;
        }}}
        macro_rules! put_u64le { ($v:expr) => {{
            buf[pos..pos + 8].copy_from_slice(&($v as u64).to_le_bytes()); pos += 8;
        }}}
        macro_rules! put_u8 { ($v:expr) => {{
            buf[pos] = $v as u8; pos += 1;
        }}}

        match self {
            FramePayload::VolumeDescriptor(v) => {
                put_u32le!(v.volume_number);
                put_u64le!(v.minimum_reader_version);
                put_u32le!(v.ecc_level);
                put_u8!(v.last_volume as u8);
            }
            FramePayload::BlockHeader(b) => {
                put_u64le!(b.block_number);
                put_u32le!(b.bytes_used);
            }
        }
        let _ = pos;
        buf
    }

    fn decode(frame_type: FrameType, buf: &[u8; PAYLOAD_SIZE]) -> Self {
        match frame_type {
            FrameType::VolumeDescriptor => {
                let volume_number = u32::from_le_bytes(buf[0..4].try_into().unwrap());
                let minimum_reader_version = u64::from_le_bytes(buf[4..12].try_into().unwrap());
                let ecc_level = u32::from_le_bytes(buf[12..16].try_into().unwrap());
                let last_volume = buf[16] != 0;
                FramePayload::VolumeDescriptor(VolumeDescriptorPayload {
                    volume_number,
                    minimum_reader_version,
                    ecc_level,
                    last_volume,
                })
            }
            FrameType::BlockHeader => {
                let block_number = u64::from_le_bytes(buf[0..8].try_into().unwrap());
                let bytes_used = u32::from_le_bytes(buf[8..12].try_into().unwrap());
                FramePayload::BlockHeader(BlockHeaderPayload { block_number, bytes_used })
            }
        }
    }
}

/// A fully parsed frame plus the `archive_id` that stamped it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub archive_id: u32,
    pub payload: FramePayload,
}

impl Frame {
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        let payload_buf = self.payload.encode();
        let checksum = fletcher32(&payload_buf);

        w.write_u32::<LittleEndian>(FRAME_MAGIC)?;
        w.write_u32::<LittleEndian>(self.archive_id)?;
        w.write_u16::<LittleEndian>(self.payload.frame_type() as u16)?;
        w.write_all(&payload_buf)?;
        w.write_u32::<LittleEndian>(checksum)?;
        Ok(())
    }

    /// Parses a raw [`FRAME_SIZE`]-byte buffer without re-validating magic —
    /// callers that already confirmed `magic`/`archive_id` via
    /// [`peek_header`] should use this directly; general callers should use
    /// [`read_resync`].
    fn from_bytes(buf: &[u8; FRAME_SIZE]) -> io::Result<(Self, bool)> {
        let archive_id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let type_raw = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let frame_type = FrameType::from_u16(type_raw).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, format!("unknown frame type tag {type_raw}"))
        })?;
        let payload_buf: [u8; PAYLOAD_SIZE] = buf[10..10 + PAYLOAD_SIZE].try_into().unwrap();
        let stored_checksum = u32::from_le_bytes(buf[10 + PAYLOAD_SIZE..FRAME_SIZE].try_into().unwrap());
        let checksum_ok = fletcher32(&payload_buf) == stored_checksum;
        let payload = FramePayload::decode(frame_type, &payload_buf);
        Ok((Frame { archive_id, payload }, checksum_ok))
    }
}

/// Peeks the `magic` and `archive_id` fields out of a raw frame buffer
/// without touching payload or checksum.
fn peek_header(buf: &[u8; FRAME_SIZE]) -> (u32, u32) {
    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let archive_id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    (magic, archive_id)
}

/// Outcome of [`read_resync`].
pub enum ResyncOutcome {
    Frame {
        frame: Frame,
        checksum_ok: bool,
        bytes_skipped: u64,
    },
    EndOfFile,
}

/// Reads one frame from `r`, resynchronizing past any inserted garbage.
///
/// Implements the algorithm in §4.2 literally: read [`FRAME_SIZE`] bytes; if
/// `magic`/`archive_id` don't match, seek back to `p+1` and retry. This is
/// `O(file_size × FRAME_SIZE)` worst case by design — see the open question
/// on a faster resynchronizing scan; the slow path is kept because it is
/// exactly what guarantees the acceptance semantics below.
pub fn read_resync<R: Read + Seek>(r: &mut R, archive_id: u32) -> io::Result<ResyncOutcome> {
    let mut bytes_skipped = 0u64;
    loop {
        let p = r.stream_position()?;
        let mut buf = [0u8; FRAME_SIZE];
        match read_exact_or_short(r, &mut buf)? {
            false => return Ok(ResyncOutcome::EndOfFile),
            true => {}
        }
        let (magic, read_archive_id) = peek_header(&buf);
        if magic == FRAME_MAGIC && read_archive_id == archive_id {
            let (frame, checksum_ok) = Frame::from_bytes(&buf)?;
            return Ok(ResyncOutcome::Frame { frame, checksum_ok, bytes_skipped });
        }
        r.seek(SeekFrom::Start(p + 1))?;
        bytes_skipped += 1;
    }
}

/// Reads a frame without the archive-id filter, used the first time a volume
/// is opened for read and `archive_id` is not yet known (volume 0's head
/// descriptor establishes it).
pub fn read_resync_unfiltered<R: Read + Seek>(r: &mut R) -> io::Result<ResyncOutcome> {
    let mut bytes_skipped = 0u64;
    loop {
        let p = r.stream_position()?;
        let mut buf = [0u8; FRAME_SIZE];
        if !read_exact_or_short(r, &mut buf)? {
            return Ok(ResyncOutcome::EndOfFile);
        }
        let (magic, _) = peek_header(&buf);
        if magic == FRAME_MAGIC {
            let (frame, checksum_ok) = Frame::from_bytes(&buf)?;
            return Ok(ResyncOutcome::Frame { frame, checksum_ok, bytes_skipped });
        }
        r.seek(SeekFrom::Start(p + 1))?;
        bytes_skipped += 1;
    }
}

/// Reads a frame directly at the current position, with no resynchronization
/// and no magic check — used when the caller already knows exactly where a
/// frame starts (e.g. the head descriptor at offset 0, or the tail descriptor
/// located via a seek from the end of file).
pub fn read_frame_at<R: Read>(r: &mut R) -> io::Result<Option<(Frame, bool)>> {
    let mut buf = [0u8; FRAME_SIZE];
    if !read_exact_or_short(r, &mut buf)? {
        return Ok(None);
    }
    let (magic, _) = peek_header(&buf);
    if magic != FRAME_MAGIC {
        return Ok(None);
    }
    let (frame, checksum_ok) = Frame::from_bytes(&buf)?;
    Ok(Some((frame, checksum_ok)))
}

/// Like `Read::read_exact`, but returns `Ok(false)` on a short/empty read
/// instead of erroring, so callers can distinguish "ran out of frames" from
/// a genuine I/O failure.
fn read_exact_or_short<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled == buf.len())
}
