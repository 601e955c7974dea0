//! Core types for media-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, FailureRecord, Result};

/// Audio quality tiers offered by providers, highest fidelity first
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// Low bitrate lossy stream
    Low,
    /// High bitrate lossy stream
    High,
    /// CD-quality lossless
    Lossless,
    /// High-resolution lossless
    #[default]
    HiRes,
}

impl Quality {
    /// All qualities in descending preference order
    pub const DESCENDING: [Quality; 4] = [
        Quality::HiRes,
        Quality::Lossless,
        Quality::High,
        Quality::Low,
    ];

    /// The requested quality followed by every lower one
    ///
    /// ```
    /// use media_dl::types::Quality;
    ///
    /// assert_eq!(
    ///     Quality::Lossless.fallback_chain(),
    ///     vec![Quality::Lossless, Quality::High, Quality::Low]
    /// );
    /// ```
    pub fn fallback_chain(self) -> Vec<Quality> {
        Self::DESCENDING
            .iter()
            .copied()
            .filter(|q| *q <= self)
            .collect()
    }

    /// File extension used for content of this quality
    pub fn extension(self) -> &'static str {
        match self {
            Quality::HiRes | Quality::Lossless => "flac",
            Quality::High | Quality::Low => "m4a",
        }
    }

    /// Stable identifier used in cache keys and file names
    pub fn as_str(self) -> &'static str {
        match self {
            Quality::HiRes => "hi_res",
            Quality::Lossless => "lossless",
            Quality::High => "high",
            Quality::Low => "low",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a single download item
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    /// Waiting for a rate-limit admission and a download slot
    #[default]
    Pending,
    /// Holding a slot, resolving metadata and the stream location
    Fetching,
    /// Streaming content to the output file
    Writing,
    /// Output file fully written
    Completed,
    /// Terminal failure
    Failed,
}

impl ItemState {
    /// Whether moving from `self` to `next` is a legal transition
    ///
    /// `Writing -> Fetching` is the rewind taken by a retry after the partial
    /// output has been removed.
    pub fn can_transition_to(self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Writing)
                | (Writing, Completed)
                | (Writing, Fetching)
                | (Pending | Fetching | Writing, Failed)
        )
    }

    /// Completed and Failed are terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Completed | ItemState::Failed)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Pending => "pending",
            ItemState::Fetching => "fetching",
            ItemState::Writing => "writing",
            ItemState::Completed => "completed",
            ItemState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A single piece of media to download
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadItem {
    /// Provider-specific item identity
    pub item_id: String,

    /// Provider tag (e.g., "tidal", "qobuz")
    pub provider: String,

    /// Requested quality; lower qualities are tried if unavailable
    pub quality: Quality,

    /// Naming template for the output file, relative to the batch working directory
    pub path_template: String,

    /// Size in bytes, known once stream headers arrive
    #[serde(default)]
    pub expected_size: Option<u64>,

    /// Current lifecycle state
    #[serde(default)]
    pub state: ItemState,
}

impl DownloadItem {
    /// Create a pending item
    pub fn new(
        item_id: impl Into<String>,
        provider: impl Into<String>,
        quality: Quality,
        path_template: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            provider: provider.into(),
            quality,
            path_template: path_template.into(),
            expected_size: None,
            state: ItemState::Pending,
        }
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: ItemState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                item_id: self.item_id.clone(),
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(item_id = %self.item_id, from = %self.state, to = %next, "item state change");
        self.state = next;
        Ok(())
    }
}

/// Provider metadata for a track
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetadata {
    /// Provider-specific item identity
    pub item_id: String,
    /// Provider tag
    pub provider: String,
    /// Track title
    pub title: String,
    /// Display artist
    pub artist: String,
    /// Album title
    #[serde(default)]
    pub album: Option<String>,
    /// Position on the album
    #[serde(default)]
    pub track_number: Option<u32>,
    /// Duration in seconds
    #[serde(default)]
    pub duration_secs: Option<u32>,
    /// Any further provider fields usable from naming templates
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

/// Signed location of a content stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamLocation {
    /// Signed URL
    pub url: String,
    /// Quality the provider actually resolved
    pub quality: Quality,
    /// When the signature stops being valid
    pub expires_at: DateTime<Utc>,
}

impl StreamLocation {
    /// Remaining validity, zero once expired
    pub fn remaining_validity(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Progress snapshot for one transfer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Item being transferred
    pub item_id: String,
    /// Bytes written so far
    pub bytes_done: u64,
    /// Total bytes when known
    pub bytes_total: Option<u64>,
    /// Average speed since the transfer started
    pub speed_bps: u64,
    /// Time since the transfer started
    pub elapsed: Duration,
}

impl ProgressUpdate {
    /// Percentage complete when the total is known
    pub fn percent(&self) -> Option<f32> {
        match self.bytes_total {
            Some(total) if total > 0 => Some((self.bytes_done as f32 / total as f32) * 100.0),
            _ => None,
        }
    }
}

/// Event emitted during the pipeline lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Item handed to the engine
    ItemQueued {
        /// Item identity
        item_id: String,
    },

    /// Transfer progress (throttled)
    Downloading(ProgressUpdate),

    /// A lower quality was used than requested
    QualityFallback {
        /// Item identity
        item_id: String,
        /// Quality that was requested
        requested: Quality,
        /// Quality that was resolved
        resolved: Quality,
    },

    /// Item finished writing
    ItemComplete {
        /// Item identity
        item_id: String,
        /// Output file
        path: PathBuf,
    },

    /// Item failed terminally
    ItemFailed {
        /// Item identity
        item_id: String,
        /// Error message
        error: String,
    },

    /// Archiving of a batch started
    Archiving {
        /// Batch name
        batch: String,
        /// Number of files being packed
        files: usize,
    },

    /// Archiving of a batch finished
    ArchiveComplete {
        /// Batch name
        batch: String,
        /// Segment paths in creation order
        segments: Vec<PathBuf>,
    },

    /// Batch finished (with or without partial failures)
    BatchComplete {
        /// Batch name
        batch: String,
        /// Items that succeeded
        succeeded: usize,
        /// Items that failed
        failed: usize,
    },
}

/// One orchestration request covering multiple items (album, playlist, artist)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchJob {
    /// Batch name, used as the archive base name
    pub name: String,
    /// Directory holding raw files while the batch is processed
    pub working_dir: PathBuf,
    /// Items in submission order
    pub items: Vec<DownloadItem>,
}

impl BatchJob {
    /// Create a batch job
    pub fn new(name: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            working_dir: working_dir.into(),
            items: Vec::new(),
        }
    }

    /// Append an item
    pub fn with_item(mut self, item: DownloadItem) -> Self {
        self.items.push(item);
        self
    }
}

/// A successfully downloaded item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSuccess {
    /// Item identity
    pub item_id: String,
    /// Output path (deleted after archiving)
    pub path: PathBuf,
}

/// Aggregate outcome of a batch
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchReport {
    /// Batch name
    pub name: String,
    /// Items that succeeded, in submission order
    pub successes: Vec<ItemSuccess>,
    /// Items that failed, in submission order
    pub failures: Vec<FailureRecord>,
    /// Archive segments when archiving ran
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub archive_segments: Vec<PathBuf>,
    /// Wall-clock time of the whole batch
    #[serde(default)]
    pub elapsed: Duration,
}

impl BatchReport {
    /// True when no item failed
    pub fn is_complete_success(&self) -> bool {
        self.failures.is_empty()
    }
}
