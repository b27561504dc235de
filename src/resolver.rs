//! Missing-volume resolution.
//!
//! The reference archiver blocks on a `scanf` prompt when an expected volume
//! file is missing, after draining its output queue to keep terminal output
//! clean. That is unsuitable for embedding, so this is exposed as a callback
//! (see SPEC_FULL.md §4.1, §9 "Missing-volume interaction").

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Resolves the path to a volume that the Volume Store expected to find but
/// didn't.
pub trait MissingVolumeResolver: Send {
    /// Called with the 0-based index of the expected volume and the path
    /// that was tried and not found. Returning a path that still doesn't
    /// exist causes the Volume Store to call this again.
    fn resolve(&mut self, expected_number: u32, last_tried_path: &Path) -> io::Result<PathBuf>;
}

/// Default resolver: prompts on stdin/stdout. If `drain` is set, it is
/// invoked first to empty the consumer queue so the prompt isn't interleaved
/// with other output, matching the source's queue-polling behavior.
pub struct TtyMissingVolumeResolver {
    drain: Option<Box<dyn FnMut() -> bool + Send>>,
}

impl TtyMissingVolumeResolver {
    pub fn new() -> Self {
        TtyMissingVolumeResolver { drain: None }
    }

    /// `is_empty` is polled (with a short sleep between calls) until it
    /// returns `true`, mirroring the source's ~5ms output-queue drain loop.
    pub fn with_drain<F: FnMut() -> bool + Send + 'static>(mut self, is_empty: F) -> Self {
        self.drain = Some(Box::new(is_empty));
        self
    }

    fn drain_output_queue(&mut self) {
        if let Some(is_empty) = &mut self.drain {
            while !is_empty() {
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}

impl Default for TtyMissingVolumeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MissingVolumeResolver for TtyMissingVolumeResolver {
    fn resolve(&mut self, expected_number: u32, last_tried_path: &Path) -> io::Result<PathBuf> {
        self.drain_output_queue();

        println!(
            "volume {} not found at {}; please type the path to it:",
            expected_number,
            last_tried_path.display()
        );
        print!("new path> ");
        io::stdout().flush()?;

        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        Ok(PathBuf::from(line.trim()))
    }
}
