//! Tail reads of run logs that may still be growing.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::errors::Result;
use crate::state::RunRegistry;

pub const DEFAULT_TAIL_KB: u64 = 64;

#[derive(Debug, Clone)]
pub struct LogReader {
    registry: RunRegistry,
}

impl LogReader {
    pub fn new(registry: RunRegistry) -> Self {
        Self { registry }
    }

    /// Last `max_kb` kilobytes of a run's log.
    pub async fn tail(&self, run_id: &str, max_kb: u64) -> Result<String> {
        let log_file = self.registry.get(run_id).await?.log_file;
        let text = tokio::task::spawn_blocking(move || tail_file(&log_file, max_kb))
            .await
            .map_err(|e| anyhow::anyhow!("log reader task failed: {e}"))??;
        Ok(text)
    }
}

/// Read at most `max_kb * 1024` bytes from the end of `path`.
///
/// When the file is larger than the window, the first (partial) line of the
/// window is dropped. A missing file reads as empty. No lock is taken, so the
/// file may grow while it is being read; the window is fixed by the size
/// observed up front.
pub fn tail_file(path: &Path, max_kb: u64) -> io::Result<String> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e),
    };

    let max_bytes = max_kb.saturating_mul(1024);
    let size = file.metadata()?.len();

    let mut buf = Vec::new();
    if size > max_bytes {
        file.seek(SeekFrom::Start(size - max_bytes))?;
        file.take(max_bytes).read_to_end(&mut buf)?;
        let start = buf
            .iter()
            .position(|&b| b == b'\n')
            .map_or(buf.len(), |i| i + 1);
        buf.drain(..start);
    } else {
        file.take(max_bytes).read_to_end(&mut buf)?;
    }

    Ok(decode_within(&buf, max_bytes))
}

/// Decode lossily, then drop leading characters until the text fits in
/// `max_bytes`; each replacement character is wider than the byte it stands
/// for.
fn decode_within(buf: &[u8], max_bytes: u64) -> String {
    let mut text = String::from_utf8_lossy(buf).into_owned();
    let limit = usize::try_from(max_bytes).unwrap_or(usize::MAX);
    if text.len() > limit {
        let mut cut = text.len() - limit;
        while !text.is_char_boundary(cut) {
            cut += 1;
        }
        text.drain(..cut);
    }
    text
}
