//! Feature archive codec.
//!
//! One archive file per utterance, little-endian:
//!
//! ```text
//! magic      [4]u8  = b"UFT1"
//! num_frames u32    (> 0)
//! dim        u16    (> 0)
//! kind       u16    feature-kind code (6 = MFCC, 9 = FBANK, ...)
//! period     u32    sample period in 100 ns units (100_000 = 10 ms)
//! frames     [num_frames][dim] f32, frame-major
//! ```
//!
//! Frame-major payload is column-major as a `dim x num_frames` matrix, so a
//! chunk can concatenate utterance payloads without reshuffling.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use crate::ArchiveError;

pub const MAGIC: [u8; 4] = *b"UFT1";
pub const HEADER_LEN: usize = 16;

/// Header of a feature archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub kind: u16,
    pub dim: u16,
    pub sample_period: u32,
    pub num_frames: u32,
}

impl ArchiveInfo {
    pub fn format(&self) -> FeatureFormat {
        FeatureFormat {
            kind: self.kind,
            dim: self.dim,
            sample_period: self.sample_period,
        }
    }

    pub fn payload_values(&self) -> usize {
        self.num_frames as usize * self.dim as usize
    }
}

/// The per-corpus part of the header: everything but the frame count. Fixed by
/// the first archive read; later archives must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFormat {
    pub kind: u16,
    pub dim: u16,
    pub sample_period: u32,
}

impl FeatureFormat {
    /// Frame shift in milliseconds (sample period is in 100 ns units).
    pub fn frame_shift_ms(&self) -> f64 {
        self.sample_period as f64 / 1e4
    }
}

impl std::fmt::Display for FeatureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kind={} dim={} shift={:.1}ms",
            self.kind,
            self.dim,
            self.frame_shift_ms()
        )
    }
}

fn encode_header(info: &ArchiveInfo) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[0..4].copy_from_slice(&MAGIC);
    h[4..8].copy_from_slice(&info.num_frames.to_le_bytes());
    h[8..10].copy_from_slice(&info.dim.to_le_bytes());
    h[10..12].copy_from_slice(&info.kind.to_le_bytes());
    h[12..16].copy_from_slice(&info.sample_period.to_le_bytes());
    h
}

fn parse_header(path: &Path, h: &[u8; HEADER_LEN]) -> Result<ArchiveInfo, ArchiveError> {
    let bad = |reason: &str| ArchiveError::BadHeader {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };
    if h[0..4] != MAGIC {
        return Err(bad("wrong magic"));
    }
    let num_frames = u32::from_le_bytes([h[4], h[5], h[6], h[7]]);
    let dim = u16::from_le_bytes([h[8], h[9]]);
    let kind = u16::from_le_bytes([h[10], h[11]]);
    let sample_period = u32::from_le_bytes([h[12], h[13], h[14], h[15]]);
    if num_frames == 0 {
        return Err(bad("zero frames"));
    }
    if dim == 0 {
        return Err(bad("zero dimension"));
    }
    Ok(ArchiveInfo {
        kind,
        dim,
        sample_period,
        num_frames,
    })
}

/// Read capability over feature archives. The deserializer consults `info`
/// during enumeration and pulls whole-utterance payloads when paging a chunk
/// in; test doubles inject failures here.
pub trait FeatureArchive: Send + Sync + 'static {
    fn info(&self, path: &Path) -> Result<ArchiveInfo, ArchiveError>;

    /// Copies all frames of the utterance into `dst` (frame-major `f32`,
    /// exactly `num_frames * dim` values) and returns the header.
    fn read_frames(&self, path: &Path, dst: &mut [f32]) -> Result<ArchiveInfo, ArchiveError>;
}

/// Filesystem-backed archives.
#[derive(Debug, Default, Clone)]
pub struct FsFeatureArchive;

impl FeatureArchive for FsFeatureArchive {
    fn info(&self, path: &Path) -> Result<ArchiveInfo, ArchiveError> {
        let mut f = File::open(path)?;
        let mut h = [0u8; HEADER_LEN];
        f.read_exact(&mut h).map_err(|_| ArchiveError::BadHeader {
            path: path.display().to_string(),
            reason: "short header".to_string(),
        })?;
        parse_header(path, &h)
    }

    fn read_frames(&self, path: &Path, dst: &mut [f32]) -> Result<ArchiveInfo, ArchiveError> {
        let mut f = File::open(path)?;
        let mut h = [0u8; HEADER_LEN];
        f.read_exact(&mut h).map_err(|_| ArchiveError::BadHeader {
            path: path.display().to_string(),
            reason: "short header".to_string(),
        })?;
        let info = parse_header(path, &h)?;

        let needed = info.payload_values();
        if dst.len() != needed {
            return Err(ArchiveError::BadDestination {
                path: path.display().to_string(),
                needed,
                dst: dst.len(),
            });
        }

        let mut payload = vec![0u8; needed * 4];
        f.read_exact(&mut payload)
            .map_err(|_| ArchiveError::Truncated {
                path: path.display().to_string(),
                expected: (needed * 4) as u64,
                found: std::fs::metadata(path)
                    .map(|m| m.len().saturating_sub(HEADER_LEN as u64))
                    .unwrap_or(0),
            })?;

        for (value, bytes) in dst.iter_mut().zip(payload.chunks_exact(4)) {
            *value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        }
        Ok(info)
    }
}

/// Writes one utterance archive. Used by the seeding binary and by tests.
pub fn write_archive(
    path: &Path,
    kind: u16,
    sample_period: u32,
    dim: u16,
    frames: &[f32],
) -> Result<(), ArchiveError> {
    if dim == 0 || frames.is_empty() || frames.len() % dim as usize != 0 {
        return Err(ArchiveError::BadHeader {
            path: path.display().to_string(),
            reason: format!("payload of {} values does not tile dim {dim}", frames.len()),
        });
    }
    let num_frames = (frames.len() / dim as usize) as u32;
    let info = ArchiveInfo {
        kind,
        dim,
        sample_period,
        num_frames,
    };

    let mut out = Vec::with_capacity(HEADER_LEN + frames.len() * 4);
    out.extend_from_slice(&encode_header(&info));
    for value in frames {
        out.extend_from_slice(&value.to_le_bytes());
    }

    let mut f = File::create(path)?;
    f.write_all(&out)?;
    f.sync_all()?;
    Ok(())
}
