//! Log collection -- draining raw access logs into events.

pub mod file;
pub mod health;
pub mod kube;
pub mod parse;

pub use self::file::FileLogSource;
pub use self::health::CollectorHealth;
pub use self::kube::KubeLogSource;
pub use parse::{parse_access_log, parse_line, Parsed};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::analysis::Event;
use crate::target::Target;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log API request failed: {0}")]
    Http(String),
    #[error("no running instance for target '{0}'")]
    NoInstance(String),
}

/// Source of raw request events.
#[async_trait::async_trait]
pub trait LogSource: Send + Sync {
    /// New events for `target`. `since` is the start of the oldest window
    /// still open; sources that query by time must not go back further, and
    /// must not hand out the same line twice.
    async fn collect(&self, target: &Target, since: DateTime<Utc>) -> Result<Vec<Event>, CollectError>;
}

/// In-memory source; events are handed out once.
#[derive(Debug, Default)]
pub struct MemoryLogSource {
    events: std::sync::Mutex<Vec<Event>>,
}

impl MemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, events: impl IntoIterator<Item = Event>) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend(events);
    }
}

#[async_trait::async_trait]
impl LogSource for MemoryLogSource {
    async fn collect(&self, target: &Target, _since: DateTime<Utc>) -> Result<Vec<Event>, CollectError> {
        let mut all = self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (mine, rest): (Vec<Event>, Vec<Event>) =
            all.drain(..).partition(|e| e.target == target.name);
        *all = rest;
        Ok(mine)
    }
}
