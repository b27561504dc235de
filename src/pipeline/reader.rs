//! Reader Pipeline — calls `read_block`, verifies and inverts FEC, and
//! enqueues reconstructed blocks onto the consumer queue (SPEC_FULL.md §4.5).

use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use log::{error, warn};

use crate::error::ArchiveError;
use crate::fec::{FecCodec, FecMainHeader, FEC_MAINHEAD_COPIES, FEC_MAINHEAD_SIZE};
use crate::pipeline::{BlockSender, LogicalBlock};
use crate::resolver::MissingVolumeResolver;
use crate::session::SessionContext;
use crate::volume_store::{ReadBlockOutcome, VolumeStoreReader};

pub struct ReaderPipeline;

impl ReaderPipeline {
    /// Starts the dedicated reader thread. `output`'s sender is dropped when
    /// the function returns, which signals end-of-stream to the consumer
    /// regardless of whether the pass ended cleanly or with an error.
    pub fn spawn(
        ctx: SessionContext,
        base_path: PathBuf,
        resolver: Box<dyn MissingVolumeResolver>,
        output: BlockSender,
    ) -> JoinHandle<Result<(), ArchiveError>> {
        thread::spawn(move || run(ctx, base_path, resolver, output))
    }
}

fn run(
    ctx: SessionContext,
    base_path: PathBuf,
    resolver: Box<dyn MissingVolumeResolver>,
    output: BlockSender,
) -> Result<(), ArchiveError> {
    let _guard = ctx.thread_enter();

    let mut store = match VolumeStoreReader::init_read(base_path, resolver) {
        Ok(store) => store,
        Err(e) => {
            error!("reader pipeline failed to open archive: {e}");
            return Err(e);
        }
    };

    let fec = match read_main_header(&mut store) {
        Ok(fec) => fec,
        Err(e) => {
            error!("reader pipeline failed to read fec main header: {e}");
            ctx.request_stop_feeding();
            return Err(e);
        }
    };

    let mut expanded = vec![0u8; fec.expanded_block_len()];
    loop {
        match store.read_block(&mut expanded, fec.expanded_block_len()) {
            Ok(ReadBlockOutcome::EndOfArchive) => break,
            Ok(ReadBlockOutcome::Block { bytes_used }) => match fec.decode(&expanded) {
                Ok(outcome) => {
                    if outcome.bad_packets > 0 {
                        warn!("corrected {} bad packet(s) in one block", outcome.bad_packets);
                    }
                    if output.send(LogicalBlock { data: outcome.block, bytes_used }).is_err() {
                        // Consumer went away; nothing more to deliver.
                        break;
                    }
                }
                Err(ArchiveError::Unrecoverable { needed, found }) => {
                    error!("block unrecoverable: needed {needed} good packets, found {found}; skipping");
                }
                Err(e) => {
                    error!("reader pipeline failed decoding a block: {e}");
                    ctx.request_stop_feeding();
                    return Err(e);
                }
            },
            Err(e) => {
                error!("reader pipeline failed reading a block: {e}");
                ctx.request_stop_feeding();
                return Err(e);
            }
        }
    }

    store.close_read();
    Ok(())
}

/// Reads [`FEC_MAINHEAD_COPIES`] header copies, using the last one whose
/// magic and MD5 self-check both validate.
fn read_main_header(store: &mut VolumeStoreReader) -> Result<FecCodec, ArchiveError> {
    let mut chosen: Option<FecMainHeader> = None;
    let mut buf = vec![0u8; FEC_MAINHEAD_SIZE];

    for _ in 0..FEC_MAINHEAD_COPIES {
        match store.read_block(&mut buf, FEC_MAINHEAD_SIZE)? {
            ReadBlockOutcome::EndOfArchive => {
                return Err(ArchiveError::format("archive ended before any fec main header copy"));
            }
            ReadBlockOutcome::Block { .. } => {
                if let Some((header, ok)) = FecMainHeader::from_bytes(&buf) {
                    if ok {
                        chosen = Some(header);
                    }
                }
            }
        }
    }

    let header = chosen.ok_or_else(|| ArchiveError::checksum("no fec main header copy validated"))?;
    FecCodec::with_n(header.fec_n as usize)
}
