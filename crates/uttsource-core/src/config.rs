use serde::Deserialize;
use thiserror::Error;

use crate::types::StreamKind;

/// 48 hours of audio at 100 frames per second.
pub const DEFAULT_RANDOMIZATION_WINDOW: u64 = 48 * 3600 * 100;

pub const BLOCK_RANDOMIZER_NAME: &str = "blockRandomize";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinibatchMode {
    /// Return the short final minibatch of an epoch.
    Partial,
    /// Discard a short final minibatch.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct ContextWindow {
    pub left: usize,
    pub right: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Real,
    Category,
}

impl StreamType {
    pub fn kind(self) -> StreamKind {
        match self {
            StreamType::Real => StreamKind::DenseReal,
            StreamType::Category => StreamKind::Category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    pub dim: usize,
    #[serde(default, rename = "contextWindow")]
    pub context: ContextWindow,
}

/// Enumerated reader configuration. Parsing the surrounding config file is the
/// caller's concern; validation of the enumerated keys happens here, at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderConfig {
    /// Randomization range R, in frames (full window; the half window is R/2).
    #[serde(default = "default_randomization_window")]
    pub randomization_window: u64,
    #[serde(default = "default_randomizer")]
    pub randomizer: String,
    #[serde(default = "default_frame_mode")]
    pub frame_mode: bool,
    /// Parallel sequences per minibatch, indexed by epoch (last entry repeats).
    #[serde(default = "default_utts_per_iter", rename = "nbrUttsInEachRecurrentIter")]
    pub utts_per_recurrent_iter: Vec<usize>,
    #[serde(default = "default_minibatch_mode")]
    pub minibatch_mode: MinibatchMode,
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub verbosity: i32,
}

fn default_randomization_window() -> u64 {
    DEFAULT_RANDOMIZATION_WINDOW
}

fn default_randomizer() -> String {
    BLOCK_RANDOMIZER_NAME.to_string()
}

fn default_frame_mode() -> bool {
    true
}

fn default_utts_per_iter() -> Vec<usize> {
    vec![1]
}

fn default_minibatch_mode() -> MinibatchMode {
    MinibatchMode::Partial
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("randomizer must be '{BLOCK_RANDOMIZER_NAME}', got '{0}'")]
    UnsupportedRandomizer(String),
    #[error("frameMode must be true; utterance-mode reading is not supported here")]
    UtteranceModeUnsupported,
    #[error("nbrUttsInEachRecurrentIter[{epoch}] = {value}; must be 1 in frame mode")]
    BadParallelSequences { epoch: usize, value: usize },
    #[error("randomizationWindow must be at least 1 frame")]
    EmptyRandomizationWindow,
    #[error("at least one stream must be configured")]
    NoStreams,
    #[error("stream '{0}' has dim 0")]
    ZeroDim(String),
    #[error("stream '{0}': context windows apply to 'real' streams only")]
    ContextOnCategory(String),
    #[error("duplicate stream name '{0}'")]
    DuplicateStream(String),
    #[error("worker rank {rank} out of range for {count} workers")]
    BadWorkerRank { rank: usize, count: usize },
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.randomizer != BLOCK_RANDOMIZER_NAME {
            return Err(ConfigError::UnsupportedRandomizer(self.randomizer.clone()));
        }
        if !self.frame_mode {
            return Err(ConfigError::UtteranceModeUnsupported);
        }
        if self.randomization_window == 0 {
            return Err(ConfigError::EmptyRandomizationWindow);
        }
        for (epoch, &value) in self.utts_per_recurrent_iter.iter().enumerate() {
            if value != 1 {
                return Err(ConfigError::BadParallelSequences { epoch, value });
            }
        }
        if self.streams.is_empty() {
            return Err(ConfigError::NoStreams);
        }
        for (i, stream) in self.streams.iter().enumerate() {
            if stream.dim == 0 {
                return Err(ConfigError::ZeroDim(stream.name.clone()));
            }
            if stream.stream_type == StreamType::Category
                && (stream.context.left != 0 || stream.context.right != 0)
            {
                return Err(ConfigError::ContextOnCategory(stream.name.clone()));
            }
            if self.streams[..i].iter().any(|s| s.name == stream.name) {
                return Err(ConfigError::DuplicateStream(stream.name.clone()));
            }
        }
        Ok(())
    }

    /// Parallel sequences for a given epoch; the last configured entry repeats.
    pub fn parallel_sequences(&self, epoch: usize) -> usize {
        let entries = &self.utts_per_recurrent_iter;
        match entries.get(epoch) {
            Some(&n) => n,
            None => entries.last().copied().unwrap_or(1),
        }
    }
}
