#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod feature;
pub mod labels;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("bad archive header in {path}: {reason}")]
    BadHeader { path: String, reason: String },
    #[error("archive {path}: payload is {found} bytes, header promises {expected}")]
    Truncated {
        path: String,
        expected: u64,
        found: u64,
    },
    #[error("destination holds {dst} values, archive {path} holds {needed}")]
    BadDestination {
        path: String,
        needed: usize,
        dst: usize,
    },
    #[error("labels line {line}: {reason}")]
    Labels { line: usize, reason: String },
    #[error("alignment for '{key}' does not tile [0, {expected}): segment [{begin}, {end})")]
    AlignmentGap {
        key: String,
        expected: u64,
        begin: u64,
        end: u64,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
