//! Writer Pipeline — drains logical blocks from the producer queue, applies
//! FEC, and issues `write_block` calls to the Volume Store (SPEC_FULL.md §4.4).

use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use log::error;

use crate::error::ArchiveError;
use crate::fec::{FecCodec, FecMainHeader, FEC_MAINHEAD_COPIES, FEC_MAINHEAD_VERSION};
use crate::pipeline::BlockReceiver;
use crate::session::SessionContext;
use crate::volume_store::{VolumeStoreOptions, VolumeStoreWriter};

/// Spawns the Writer Pipeline thread.
pub struct WriterPipeline;

impl WriterPipeline {
    /// Starts the dedicated writer thread. `input` is drained until its
    /// senders are all dropped (end-of-stream), at which point the archive
    /// is closed with `last_volume = true`.
    pub fn spawn(
        ctx: SessionContext,
        base_path: PathBuf,
        options: VolumeStoreOptions,
        input: BlockReceiver,
    ) -> JoinHandle<Result<(), ArchiveError>> {
        thread::spawn(move || run(ctx, base_path, options, input))
    }
}

fn run(
    ctx: SessionContext,
    base_path: PathBuf,
    options: VolumeStoreOptions,
    input: BlockReceiver,
) -> Result<(), ArchiveError> {
    let _guard = ctx.thread_enter();

    let ecc_level = options.ecc_level;
    let mut store = VolumeStoreWriter::init_write(base_path, options);
    let fec = FecCodec::new(ecc_level)?;

    if let Err(e) = write_main_header(&mut store, &fec) {
        return abort(&ctx, &mut store, e);
    }

    loop {
        match input.recv() {
            Ok(block) => {
                if let Err(e) = encode_and_write(&mut store, &fec, &block.data, block.bytes_used) {
                    return abort(&ctx, &mut store, e);
                }
            }
            Err(_) => break, // every sender dropped: clean end-of-stream
        }
    }

    store.close_write(true)
}

fn write_main_header(store: &mut VolumeStoreWriter, fec: &FecCodec) -> Result<(), ArchiveError> {
    let header = FecMainHeader { version: FEC_MAINHEAD_VERSION, fec_n: fec.n() as u16 };
    let bytes = header.to_bytes();
    for _ in 0..FEC_MAINHEAD_COPIES {
        store.write_block(bytes.len() as u32, &bytes)?;
    }
    Ok(())
}

fn encode_and_write(
    store: &mut VolumeStoreWriter,
    fec: &FecCodec,
    block: &[u8],
    bytes_used: u32,
) -> Result<(), ArchiveError> {
    let expanded = fec.encode(block)?;
    store.write_block(bytes_used, &expanded)
}

/// Error path (SPEC_FULL.md §4.4, §9 "Cyclic teardown"): stop the producer,
/// close the current volume without marking it final, and delete every
/// volume file from this session so no partial archive is left behind.
fn abort(ctx: &SessionContext, store: &mut VolumeStoreWriter, cause: ArchiveError) -> Result<(), ArchiveError> {
    error!("writer pipeline failed: {cause}; tearing down archive");
    ctx.request_stop_feeding();
    let _ = store.close_write(false);
    let _ = store.delete_all();
    Err(cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{bounded_queue, LogicalBlock};
    use crate::volume_store::{ReadBlockOutcome, VolumeStoreReader};
    use crate::resolver::MissingVolumeResolver;
    use std::io;
    use std::path::Path;
    use tempfile::tempdir;

    struct NeverCalledResolver;
    impl MissingVolumeResolver for NeverCalledResolver {
        fn resolve(&mut self, _expected_number: u32, _last_tried_path: &Path) -> io::Result<std::path::PathBuf> {
            panic!("resolver should not be called in this test");
        }
    }

    #[test]
    fn writes_main_header_then_blocks_then_closes() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("archive.fsa");
        let (tx, rx) = bounded_queue(4);
        let ctx = SessionContext::new();

        let handle = WriterPipeline::spawn(
            ctx,
            base.clone(),
            VolumeStoreOptions { ecc_level: 2, ..VolumeStoreOptions::default() },
            rx,
        );

        let block = LogicalBlock { data: vec![0x11u8; crate::fec::LOGICAL_BLOCK_SIZE], bytes_used: 777 };
        tx.send(block).unwrap();
        drop(tx);
        handle.join().unwrap().unwrap();

        let mut reader = VolumeStoreReader::init_read(&base, Box::new(NeverCalledResolver)).unwrap();
        let fec = FecCodec::new(2).unwrap();

        let mut header_buf = vec![0u8; crate::fec::FEC_MAINHEAD_SIZE];
        for _ in 0..FEC_MAINHEAD_COPIES {
            match reader.read_block(&mut header_buf, crate::fec::FEC_MAINHEAD_SIZE).unwrap() {
                ReadBlockOutcome::Block { .. } => {}
                ReadBlockOutcome::EndOfArchive => panic!("expected the fec main header"),
            }
        }

        let mut expanded = vec![0u8; fec.expanded_block_len()];
        match reader.read_block(&mut expanded, fec.expanded_block_len()).unwrap() {
            ReadBlockOutcome::Block { bytes_used } => assert_eq!(bytes_used, 777),
            ReadBlockOutcome::EndOfArchive => panic!("expected a data block"),
        }
        let outcome = fec.decode(&expanded).unwrap();
        assert_eq!(outcome.block, vec![0x11u8; crate::fec::LOGICAL_BLOCK_SIZE]);
    }
}
