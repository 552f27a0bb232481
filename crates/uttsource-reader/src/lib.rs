#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod deserializer;
pub mod epoch;
pub mod packer;
pub mod paging;
pub mod randomizer;

use thiserror::Error;

use uttsource_archive::feature::FeatureFormat;
use uttsource_archive::ArchiveError;
use uttsource_core::config::ConfigError;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    /// Archive read kept failing; the epoch cannot continue.
    #[error("chunk {chunk} failed to page in after {attempts} attempts: {source}")]
    Io {
        chunk: usize,
        attempts: u32,
        #[source]
        source: ArchiveError,
    },
    #[error("feature format changed across chunks: expected {expected}, found {found}")]
    FormatMismatch {
        expected: FeatureFormat,
        found: FeatureFormat,
    },
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("no alignment for utterance '{0}'")]
    MissingAlignment(String),
    #[error("alignment for '{key}' labels {labeled} frames, archive holds {actual}")]
    AlignmentLength {
        key: String,
        labeled: usize,
        actual: usize,
    },
    #[error("stream dim {stream_dim} must be an odd multiple of feature dim {feature_dim}")]
    BadAugmentation {
        stream_dim: usize,
        feature_dim: usize,
    },
    #[error("prefetch worker exited unexpectedly")]
    PrefetchLost,
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}
