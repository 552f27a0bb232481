//! Label alignment file: per-frame state ids for every utterance key.
//!
//! A single TSV covers the corpus. First non-empty line is
//! `schema_version=1`, then one row per contiguous state segment:
//!
//! ```text
//! <utterance key> \t <begin frame> \t <end frame> \t <class id>
//! ```
//!
//! Ranges are half-open and must tile `[0, num_frames)` per key, in order,
//! without gaps or overlaps.

use std::collections::HashMap;
use std::path::Path;

use uttsource_core::key::UtteranceKey;

use crate::ArchiveError;

pub const LABELS_SCHEMA_VERSION: u32 = 1;

/// Per-frame class-id sequences, keyed by utterance logical key.
#[derive(Debug, Default, Clone)]
pub struct LabelSet {
    by_key: HashMap<UtteranceKey, Vec<u32>>,
}

impl LabelSet {
    pub fn load(path: &Path) -> Result<Self, ArchiveError> {
        let bytes = std::fs::read(path)?;
        parse_alignments_tsv(&bytes)
    }

    pub fn for_key(&self, key: &UtteranceKey) -> Option<&[u32]> {
        self.by_key.get(key).map(|v| v.as_slice())
    }

    pub fn num_keys(&self) -> usize {
        self.by_key.len()
    }

    /// Highest class id seen plus one; the natural dim for a category stream.
    pub fn num_classes(&self) -> usize {
        self.by_key
            .values()
            .flat_map(|frames| frames.iter())
            .map(|&class_id| class_id as usize + 1)
            .max()
            .unwrap_or(0)
    }

    fn insert_segment(
        &mut self,
        line: usize,
        key: UtteranceKey,
        begin: u64,
        end: u64,
        class_id: u32,
    ) -> Result<(), ArchiveError> {
        if end <= begin {
            return Err(ArchiveError::Labels {
                line,
                reason: format!("empty segment [{begin}, {end})"),
            });
        }
        let frames = self.by_key.entry(key.clone()).or_default();
        if frames.len() as u64 != begin {
            return Err(ArchiveError::AlignmentGap {
                key: key.to_string(),
                expected: frames.len() as u64,
                begin,
                end,
            });
        }
        let count = usize::try_from(end - begin).map_err(|_| ArchiveError::Labels {
            line,
            reason: "segment too long".to_string(),
        })?;
        frames.extend(std::iter::repeat(class_id).take(count));
        Ok(())
    }
}

pub fn parse_alignments_tsv(bytes: &[u8]) -> Result<LabelSet, ArchiveError> {
    let s = std::str::from_utf8(bytes).map_err(|e| ArchiveError::Labels {
        line: 0,
        reason: format!("not utf-8: {e}"),
    })?;

    let mut lines = s.lines();
    let first = lines
        .by_ref()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| ArchiveError::Labels {
            line: 1,
            reason: "empty alignment file".to_string(),
        })?;

    let Some((k, v)) = first.split_once('=') else {
        return Err(ArchiveError::Labels {
            line: 1,
            reason: "header must be schema_version=<n>".to_string(),
        });
    };
    if k.trim() != "schema_version" {
        return Err(ArchiveError::Labels {
            line: 1,
            reason: "header must be schema_version=<n>".to_string(),
        });
    }
    let schema_version: u32 = v.trim().parse().map_err(|_| ArchiveError::Labels {
        line: 1,
        reason: "invalid schema_version".to_string(),
    })?;
    if schema_version != LABELS_SCHEMA_VERSION {
        return Err(ArchiveError::Labels {
            line: 1,
            reason: format!("unsupported schema_version {schema_version}"),
        });
    }

    let mut set = LabelSet::default();
    for (i, raw) in lines.enumerate() {
        let line_no = i + 2;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() != 4 {
            return Err(ArchiveError::Labels {
                line: line_no,
                reason: format!("expected 4 columns, got {}", cols.len()),
            });
        }
        let key = UtteranceKey::parse(cols[0]).map_err(|e| ArchiveError::Labels {
            line: line_no,
            reason: e.to_string(),
        })?;
        let begin: u64 = cols[1].trim().parse().map_err(|_| ArchiveError::Labels {
            line: line_no,
            reason: "bad begin frame".to_string(),
        })?;
        let end: u64 = cols[2].trim().parse().map_err(|_| ArchiveError::Labels {
            line: line_no,
            reason: "bad end frame".to_string(),
        })?;
        let class_id: u32 = cols[3].trim().parse().map_err(|_| ArchiveError::Labels {
            line: line_no,
            reason: "bad class id".to_string(),
        })?;
        set.insert_segment(line_no, key, begin, end, class_id)?;
    }

    Ok(set)
}

/// Serializes segments back to the TSV form. Used by the seeding binary.
pub fn write_alignments_tsv(
    path: &Path,
    segments: &[(UtteranceKey, u64, u64, u32)],
) -> Result<(), ArchiveError> {
    let mut out = String::new();
    out.push_str(&format!("schema_version={LABELS_SCHEMA_VERSION}\n"));
    for (key, begin, end, class_id) in segments {
        out.push_str(&format!("{key}\t{begin}\t{end}\t{class_id}\n"));
    }
    std::fs::write(path, out)?;
    Ok(())
}
