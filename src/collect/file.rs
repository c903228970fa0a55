//! Tails per-target access log files (`<dir>/<target>.log`).

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::analysis::Event;
use crate::collect::{parse_access_log, CollectError, LogSource};
use crate::target::Target;

pub struct FileLogSource {
    dir: PathBuf,
    offsets: Mutex<HashMap<String, u64>>,
}

impl FileLogSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            offsets: Mutex::new(HashMap::new()),
        }
    }

    fn path(&self, target: &Target) -> PathBuf {
        self.dir.join(format!("{}.log", target.name))
    }
}

#[async_trait::async_trait]
impl LogSource for FileLogSource {
    /// Returns every complete line appended since the last call. The read
    /// offset already excludes what was handed out before, so `since` is not
    /// applied; whether an event is too late is the aggregator's call.
    async fn collect(&self, target: &Target, _since: DateTime<Utc>) -> Result<Vec<Event>, CollectError> {
        let path = self.path(target);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(service = %target.name, path = %path.display(), "No log file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        let mut offsets = self.offsets.lock().await;
        let offset = offsets.entry(target.name.clone()).or_insert(0);
        if len < *offset {
            info!(service = %target.name, "Log file truncated; reading from start");
            *offset = 0;
        }

        file.seek(SeekFrom::Start(*offset)).await?;
        let mut buf = Vec::with_capacity((len - *offset) as usize);
        file.read_to_end(&mut buf).await?;

        // A trailing partial line is left for the next cycle.
        let complete = match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        };
        *offset += complete as u64;

        let text = String::from_utf8_lossy(&buf[..complete]);
        let parsed = parse_access_log(&text, &target.name);
        if parsed.skipped > 0 {
            debug!(service = %target.name, skipped = parsed.skipped, "Skipped malformed log lines");
        }
        Ok(parsed.events)
    }
}
