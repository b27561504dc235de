//! Volume Store — splits a logical archive across one or more self-describing
//! volume files and owns exactly one file handle at a time.
//!
//! Mirrors the reference archiver's `archio_*` family of functions: a single
//! struct wrapping a generic file handle, lazily opened, with writer and
//! reader halves that never share a descriptor.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;
use rand::Rng;

use crate::error::ArchiveError;
use crate::frame::{
    self, BlockHeaderPayload, Frame, FramePayload, ResyncOutcome, VolumeDescriptorPayload, FRAME_SIZE,
    IMPLEMENTATION_VERSION,
};
use crate::resolver::MissingVolumeResolver;

/// Configuration recognized by both halves of the Volume Store.
#[derive(Debug, Clone)]
pub struct VolumeStoreOptions {
    /// Bytes; 0 disables splitting.
    pub split_size: u64,
    /// FEC redundancy count (`N − K`), stamped into every volume descriptor.
    pub ecc_level: u32,
    pub overwrite_existing: bool,
}

impl Default for VolumeStoreOptions {
    fn default() -> Self {
        VolumeStoreOptions { split_size: 0, ecc_level: 0, overwrite_existing: false }
    }
}

/// Given a base path with extension (e.g. `archive.fsa`), returns volume
/// `index`'s path: `archive.fsa` for 0, `archive.f<index>` for `index >= 1`.
pub fn volume_path(base: &Path, index: u32) -> PathBuf {
    if index == 0 {
        base.to_path_buf()
    } else {
        let mut os = base.as_os_str().to_os_string();
        os.push(format!(".f{index}"));
        PathBuf::from(os)
    }
}

/// Returns `Some(free_bytes)` if the underlying filesystem's free space can
/// be determined, used to distinguish [`ArchiveError::NoSpace`] from a
/// generic I/O error on a short write.
#[cfg(unix)]
fn free_bytes(file: &File) -> Option<u64> {
    use std::os::unix::io::AsRawFd;
    nix::sys::statvfs::fstatvfs(&file.as_raw_fd()).ok().map(|s| s.blocks_available() * s.fragment_size())
}

#[cfg(not(unix))]
fn free_bytes(_file: &File) -> Option<u64> {
    None
}

/// Writer half of the Volume Store.
pub struct VolumeStoreWriter {
    base_path: PathBuf,
    archive_id: u32,
    options: VolumeStoreOptions,
    current_volume: u32,
    next_block_number: u64,
    file: Option<File>,
    created_volumes: Vec<PathBuf>,
}

impl VolumeStoreWriter {
    /// Assigns `archive_id`, stores parameters. No I/O.
    pub fn init_write(base_path: impl Into<PathBuf>, options: VolumeStoreOptions) -> Self {
        VolumeStoreWriter {
            base_path: base_path.into(),
            archive_id: rand::thread_rng().gen(),
            options,
            current_volume: 0,
            next_block_number: 0,
            file: None,
            created_volumes: Vec::new(),
        }
    }

    pub fn archive_id(&self) -> u32 {
        self.archive_id
    }

    fn current_path(&self) -> PathBuf {
        volume_path(&self.base_path, self.current_volume)
    }

    fn open_current_volume(&mut self) -> Result<(), ArchiveError> {
        let path = self.current_path();
        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(true);
        if self.options.overwrite_existing {
            open_opts.create(true).truncate(true);
        } else {
            open_opts.create_new(true);
        }
        let file = open_opts.open(&path)?;
        self.created_volumes.push(path);

        let descriptor = self.descriptor_payload(false);
        let frame = Frame { archive_id: self.archive_id, payload: FramePayload::VolumeDescriptor(descriptor) };
        let mut file = file;
        frame.write(&mut file)?;
        self.file = Some(file);
        Ok(())
    }

    fn descriptor_payload(&self, last_volume: bool) -> VolumeDescriptorPayload {
        VolumeDescriptorPayload {
            volume_number: self.current_volume,
            minimum_reader_version: IMPLEMENTATION_VERSION,
            ecc_level: self.options.ecc_level,
            last_volume,
        }
    }

    /// `current_offset + size + FRAME_SIZE > split_size` (pre-write check);
    /// `split_size == 0` disables splitting.
    fn split_needed(&mut self, additional: u64) -> io::Result<bool> {
        if self.options.split_size == 0 {
            return Ok(false);
        }
        let Some(file) = self.file.as_mut() else { return Ok(false) };
        let pos = file.stream_position()?;
        Ok(pos + additional + FRAME_SIZE as u64 > self.options.split_size)
    }

    fn write_low_level(&mut self, bytes: &[u8]) -> Result<(), ArchiveError> {
        let file = self.file.as_mut().expect("volume must be open before writing");
        match file.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(free) = free_bytes(file) {
                    if free < 4096 {
                        return Err(ArchiveError::NoSpace { free_bytes: free });
                    }
                }
                Err(ArchiveError::Io(e))
            }
        }
    }

    /// Writes one block: a `BLOCK_HEADER` frame followed by `payload`,
    /// splitting to a new volume first if needed.
    pub fn write_block(&mut self, bytes_used: u32, payload: &[u8]) -> Result<(), ArchiveError> {
        let total_size = FRAME_SIZE as u64 + payload.len() as u64;

        if self.split_needed(total_size)? {
            self.close_write(false)?;
            self.current_volume += 1;
        }
        if self.file.is_none() {
            self.open_current_volume()?;
        }

        let block_number = self.next_block_number;
        self.next_block_number += 1;

        let frame = Frame {
            archive_id: self.archive_id,
            payload: FramePayload::BlockHeader(BlockHeaderPayload { block_number, bytes_used }),
        };
        let mut header_buf = Vec::with_capacity(FRAME_SIZE);
        frame.write(&mut header_buf)?;
        self.write_low_level(&header_buf)?;
        self.write_low_level(payload)?;
        Ok(())
    }

    pub fn next_block_number(&self) -> u64 {
        self.next_block_number
    }

    /// Writes the tail descriptor at the current position, seeks to 0 and
    /// rewrites the head descriptor with the same fields (including
    /// `last_volume`), fsyncs, and closes the file.
    pub fn close_write(&mut self, last_volume: bool) -> Result<(), ArchiveError> {
        let Some(mut file) = self.file.take() else { return Ok(()) };

        let descriptor = self.descriptor_payload(last_volume);
        let frame = Frame { archive_id: self.archive_id, payload: FramePayload::VolumeDescriptor(descriptor) };
        frame.write(&mut file)?;

        file.seek(SeekFrom::Start(0))?;
        frame.write(&mut file)?;
        file.sync_all()?;
        Ok(())
    }

    /// Unlinks every volume file created during this write session. Used on
    /// abort, so no partial archive is left behind.
    pub fn delete_all(&mut self) -> io::Result<()> {
        self.file = None;
        for path in self.created_volumes.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Outcome of [`VolumeStoreReader::read_block`].
pub enum ReadBlockOutcome {
    Block { bytes_used: u32 },
    EndOfArchive,
}

/// Reader half of the Volume Store.
pub struct VolumeStoreReader {
    base_path: PathBuf,
    archive_id: Option<u32>,
    current_volume: u32,
    ecc_level: u32,
    last_volume_seen: bool,
    file: Option<File>,
    resolver: Box<dyn MissingVolumeResolver>,
}

impl VolumeStoreReader {
    /// Opens volume 0, validates its descriptor(s), and populates
    /// `archive_id`/`ecc_level` for the caller (so the FEC layer can be
    /// configured before any block is read).
    pub fn init_read(
        base_path: impl Into<PathBuf>,
        resolver: Box<dyn MissingVolumeResolver>,
    ) -> Result<Self, ArchiveError> {
        let mut reader = VolumeStoreReader {
            base_path: base_path.into(),
            archive_id: None,
            current_volume: 0,
            ecc_level: 0,
            last_volume_seen: false,
            file: None,
            resolver,
        };
        reader.open_volume_for_read()?;
        Ok(reader)
    }

    pub fn ecc_level(&self) -> u32 {
        self.ecc_level
    }

    pub fn archive_id(&self) -> Option<u32> {
        self.archive_id
    }

    fn current_path(&self) -> PathBuf {
        volume_path(&self.base_path, self.current_volume)
    }

    /// Opens the current volume, validating the tail descriptor first and
    /// falling back to the head descriptor, matching the source's order.
    fn open_volume_for_read(&mut self) -> Result<(), ArchiveError> {
        let mut path = self.current_path();
        while !path.is_file() {
            path = self.resolver.resolve(self.current_volume, &path)?;
        }

        let mut file = File::open(&path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(ArchiveError::format(format!("{} is not a regular file", path.display())));
        }

        let tail = read_descriptor_at_tail(&mut file)?;
        let head = read_descriptor_at_head(&mut file)?;

        let descriptor = match (tail, head) {
            (Some(d), _) if d.1 => Some(d),
            (_, Some(d)) if d.1 => Some(d),
            (Some(d), _) => Some(d),
            (None, Some(d)) => Some(d),
            (None, None) => None,
        };

        let Some((frame, checksum_ok)) = descriptor else {
            return Err(ArchiveError::format(format!("{}: no valid volume descriptor found", path.display())));
        };
        if !checksum_ok {
            warn!("{}: only a checksum-invalid volume descriptor was found", path.display());
        }

        let FramePayload::VolumeDescriptor(descriptor) = frame.payload else {
            return Err(ArchiveError::format("expected a volume descriptor frame"));
        };

        if descriptor.volume_number != self.current_volume {
            return Err(ArchiveError::volume_mismatch(format!(
                "expected volume {}, descriptor says {}",
                self.current_volume, descriptor.volume_number
            )));
        }
        if descriptor.minimum_reader_version > IMPLEMENTATION_VERSION {
            return Err(ArchiveError::VersionMismatch {
                required: descriptor.minimum_reader_version,
                implemented: IMPLEMENTATION_VERSION,
            });
        }

        match self.archive_id {
            None => self.archive_id = Some(frame.archive_id),
            Some(expected) if expected != frame.archive_id => {
                return Err(ArchiveError::volume_mismatch(format!(
                    "volume {} has archive id {:#x}, expected {:#x}",
                    self.current_volume, frame.archive_id, expected
                )));
            }
            Some(_) => {}
        }

        self.ecc_level = descriptor.ecc_level;
        self.last_volume_seen = descriptor.last_volume;
        file.seek(SeekFrom::Start(FRAME_SIZE as u64))?;
        self.file = Some(file);
        Ok(())
    }

    /// Reads one block: calls the resynchronizing frame read, dispatches on
    /// frame type, and fills `dst` with exactly `expected_size` bytes for a
    /// `BLOCK_HEADER`.
    pub fn read_block(&mut self, dst: &mut [u8], expected_size: usize) -> Result<ReadBlockOutcome, ArchiveError> {
        if self.file.is_none() {
            self.open_volume_for_read()?;
        }
        let archive_id = self.archive_id.expect("archive_id set by open_volume_for_read");

        loop {
            let file = self.file.as_mut().expect("checked above");
            let outcome = frame::read_resync(file, archive_id)?;
            let (frame, checksum_ok) = match outcome {
                ResyncOutcome::EndOfFile => {
                    // No tail descriptor survived (e.g. the file was
                    // truncated), but the head descriptor already told us
                    // this is the last volume: treat running out of bytes
                    // here the same as finding `last_volume=true` would.
                    if self.last_volume_seen {
                        self.file = None;
                        return Ok(ReadBlockOutcome::EndOfArchive);
                    }
                    return Err(ArchiveError::format(format!(
                        "{}: unexpected end of file before a volume descriptor",
                        self.current_path().display()
                    )));
                }
                ResyncOutcome::Frame { frame, checksum_ok, .. } => (frame, checksum_ok),
            };

            match frame.payload {
                FramePayload::VolumeDescriptor(descriptor) => {
                    if !checksum_ok {
                        return Err(ArchiveError::checksum("tail volume descriptor checksum mismatch"));
                    }
                    if descriptor.last_volume {
                        self.file = None;
                        return Ok(ReadBlockOutcome::EndOfArchive);
                    }
                    self.file = None;
                    self.current_volume += 1;
                    self.open_volume_for_read()?;
                    continue;
                }
                FramePayload::BlockHeader(header) => {
                    if !checksum_ok {
                        // The header itself is corrupt; unlike a descriptor,
                        // there's no second copy to fall back to. Treat this
                        // one frame as unrecoverable without aborting the
                        // whole read (the reader pipeline logs and moves on).
                        return Err(ArchiveError::checksum(format!(
                            "block header checksum mismatch at block {}",
                            header.block_number
                        )));
                    }
                    if header.bytes_used as usize > expected_size || dst.len() < expected_size {
                        return Err(ArchiveError::format("block payload size does not match expected_size"));
                    }
                    let file = self.file.as_mut().expect("checked above");
                    file.read_exact(&mut dst[..expected_size])?;
                    return Ok(ReadBlockOutcome::Block { bytes_used: header.bytes_used });
                }
            }
        }
    }

    pub fn close_read(&mut self) {
        self.file = None;
    }
}

fn read_descriptor_at_head<R: Read + Seek>(r: &mut R) -> io::Result<Option<(Frame, bool)>> {
    r.seek(SeekFrom::Start(0))?;
    frame::read_frame_at(r)
}

fn read_descriptor_at_tail<R: Read + Seek>(r: &mut R) -> io::Result<Option<(Frame, bool)>> {
    let len = r.seek(SeekFrom::End(0))?;
    if len < FRAME_SIZE as u64 {
        return Ok(None);
    }
    r.seek(SeekFrom::Start(len - FRAME_SIZE as u64))?;
    frame::read_frame_at(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MissingVolumeResolver;
    use tempfile::tempdir;

    struct NeverCalledResolver;
    impl MissingVolumeResolver for NeverCalledResolver {
        fn resolve(&mut self, _expected_number: u32, _last_tried_path: &Path) -> io::Result<PathBuf> {
            panic!("resolver should not be called in this test");
        }
    }

    #[test]
    fn single_volume_round_trip() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("archive.fsa");

        let mut writer = VolumeStoreWriter::init_write(&base, VolumeStoreOptions::default());
        writer.write_block(5, b"hello").unwrap();
        writer.write_block(3, b"abc").unwrap();
        writer.close_write(true).unwrap();

        let mut reader =
            VolumeStoreReader::init_read(&base, Box::new(NeverCalledResolver)).unwrap();

        let mut dst = [0u8; 5];
        match reader.read_block(&mut dst, 5).unwrap() {
            ReadBlockOutcome::Block { bytes_used } => {
                assert_eq!(bytes_used, 5);
                assert_eq!(&dst, b"hello");
            }
            ReadBlockOutcome::EndOfArchive => panic!("expected a block"),
        }

        let mut dst = [0u8; 3];
        match reader.read_block(&mut dst, 3).unwrap() {
            ReadBlockOutcome::Block { bytes_used } => {
                assert_eq!(bytes_used, 3);
                assert_eq!(&dst, b"abc");
            }
            ReadBlockOutcome::EndOfArchive => panic!("expected a block"),
        }

        let mut dst = [0u8; 3];
        assert!(matches!(reader.read_block(&mut dst, 3).unwrap(), ReadBlockOutcome::EndOfArchive));
    }

    #[test]
    fn split_creates_second_volume() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("archive.fsa");

        // Small enough that the second block forces a new volume: one frame
        // header + payload plus the head/tail descriptor, exactly.
        let payload = vec![0xABu8; 16];
        let split_size = 2 * FRAME_SIZE as u64 + (FRAME_SIZE as u64 + payload.len() as u64);

        let mut writer = VolumeStoreWriter::init_write(
            &base,
            VolumeStoreOptions { split_size, ..VolumeStoreOptions::default() },
        );
        writer.write_block(16, &payload).unwrap();
        writer.write_block(16, &payload).unwrap();
        writer.close_write(true).unwrap();

        assert!(base.is_file());
        let second = volume_path(&base, 1);
        assert!(second.is_file());

        let mut reader = VolumeStoreReader::init_read(&base, Box::new(NeverCalledResolver)).unwrap();
        let mut dst = vec![0u8; 16];
        for _ in 0..2 {
            match reader.read_block(&mut dst, 16).unwrap() {
                ReadBlockOutcome::Block { bytes_used } => assert_eq!(bytes_used, 16),
                ReadBlockOutcome::EndOfArchive => panic!("expected a block"),
            }
            assert_eq!(dst, payload);
        }
        assert!(matches!(reader.read_block(&mut dst, 16).unwrap(), ReadBlockOutcome::EndOfArchive));
    }

    #[test]
    fn descriptor_redundancy_tail_corrupt() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("archive.fsa");

        let mut writer = VolumeStoreWriter::init_write(&base, VolumeStoreOptions::default());
        writer.write_block(4, b"data").unwrap();
        writer.close_write(true).unwrap();

        // Zero the head descriptor; the tail copy must still validate.
        let mut file = OpenOptions::new().write(true).open(&base).unwrap();
        file.write_all(&[0u8; FRAME_SIZE]).unwrap();
        drop(file);

        let mut reader = VolumeStoreReader::init_read(&base, Box::new(NeverCalledResolver)).unwrap();
        let mut dst = [0u8; 4];
        match reader.read_block(&mut dst, 4).unwrap() {
            ReadBlockOutcome::Block { bytes_used } => assert_eq!(bytes_used, 4),
            ReadBlockOutcome::EndOfArchive => panic!("expected a block"),
        }
    }

    #[test]
    fn truncated_tail_descriptor_still_yields_clean_eof() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("archive.fsa");

        let mut writer = VolumeStoreWriter::init_write(&base, VolumeStoreOptions::default());
        writer.write_block(4, b"data").unwrap();
        writer.close_write(true).unwrap();

        // Chop off the tail descriptor entirely; the head copy already
        // carries last_volume=true from close_write's rewrite.
        let truncated_len = FRAME_SIZE as u64 + (FRAME_SIZE as u64 + 4);
        let file = OpenOptions::new().write(true).open(&base).unwrap();
        file.set_len(truncated_len).unwrap();
        drop(file);

        let mut reader = VolumeStoreReader::init_read(&base, Box::new(NeverCalledResolver)).unwrap();
        let mut dst = [0u8; 4];
        match reader.read_block(&mut dst, 4).unwrap() {
            ReadBlockOutcome::Block { bytes_used } => assert_eq!(bytes_used, 4),
            ReadBlockOutcome::EndOfArchive => panic!("expected a block"),
        }
        assert!(matches!(reader.read_block(&mut dst, 4).unwrap(), ReadBlockOutcome::EndOfArchive));
    }

    #[test]
    fn version_gate_rejects_future_reader_requirement() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("archive.fsa");

        let mut writer = VolumeStoreWriter::init_write(&base, VolumeStoreOptions::default());
        writer.write_block(4, b"data").unwrap();
        writer.close_write(true).unwrap();

        // Patch both descriptors' minimum_reader_version above what we implement.
        let bumped = Frame {
            archive_id: writer.archive_id(),
            payload: FramePayload::VolumeDescriptor(VolumeDescriptorPayload {
                volume_number: 0,
                minimum_reader_version: IMPLEMENTATION_VERSION + 1,
                ecc_level: 0,
                last_volume: true,
            }),
        };
        let mut file = OpenOptions::new().write(true).open(&base).unwrap();
        bumped.write(&mut file).unwrap();
        let len = file.seek(SeekFrom::End(0)).unwrap();
        file.seek(SeekFrom::Start(len - FRAME_SIZE as u64)).unwrap();
        bumped.write(&mut file).unwrap();
        drop(file);

        let err = VolumeStoreReader::init_read(&base, Box::new(NeverCalledResolver)).unwrap_err();
        assert!(matches!(err, ArchiveError::VersionMismatch { .. }));
    }
}
