use std::fmt;
use std::path::Path;

use thiserror::Error;

/// Logical key of an utterance: the archive file name with directory and
/// extension stripped. Used to join feature archives with label alignments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtteranceKey(String);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UtteranceKeyError {
    #[error("path has no file name: {0}")]
    NoFileName(String),
    #[error("utterance key is empty")]
    Empty,
}

impl UtteranceKey {
    pub fn from_path(path: &Path) -> Result<Self, UtteranceKeyError> {
        let stem = path
            .file_stem()
            .ok_or_else(|| UtteranceKeyError::NoFileName(path.display().to_string()))?;
        let stem = stem.to_string_lossy();
        if stem.is_empty() {
            return Err(UtteranceKeyError::Empty);
        }
        Ok(UtteranceKey(stem.into_owned()))
    }

    pub fn parse(input: &str) -> Result<Self, UtteranceKeyError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(UtteranceKeyError::Empty);
        }
        Ok(UtteranceKey(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UtteranceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
