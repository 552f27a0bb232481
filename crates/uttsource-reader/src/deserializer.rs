use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use uttsource_archive::feature::{FeatureArchive, FeatureFormat};
use uttsource_archive::labels::LabelSet;
use uttsource_archive::ArchiveError;
use uttsource_core::config::StreamConfig;
use uttsource_core::key::UtteranceKey;
use uttsource_core::types::{ChunkShape, ElementType, SequenceDescriptor, StreamDescription};
use uttsource_observe::metrics::{Counter, Gauge};

use crate::ReaderError;

/// 15 minutes at 100 frames per second.
pub const CHUNK_TARGET_FRAMES: u64 = 15 * 60 * 100;
pub const CHUNK_MAX_UTTERANCES: usize = 65_535;

const PAGE_IN_ATTEMPTS: u32 = 5;
const PAGE_IN_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct ChunkingParams {
    pub target_frames: u64,
    pub max_utterances: usize,
}

impl Default for ChunkingParams {
    fn default() -> Self {
        Self {
            target_frames: CHUNK_TARGET_FRAMES,
            max_utterances: CHUNK_MAX_UTTERANCES,
        }
    }
}

#[derive(Debug, Default)]
pub struct PagingMetrics {
    pub chunks_paged_in_total: Counter,
    pub chunks_paged_out_total: Counter,
    pub page_in_retries_total: Counter,
    pub chunks_in_ram: Gauge,
}

#[derive(Debug)]
struct UtteranceEntry {
    id: u64,
    path: PathBuf,
    num_frames: u32,
    /// First frame within the chunk's concatenated matrix.
    first_frame: usize,
    /// First frame on the corpus-order timeline (frame-mode descriptor ids).
    natural_start: u64,
    class_ids: Vec<u32>,
}

#[derive(Debug)]
struct ChunkData {
    utterances: Vec<UtteranceEntry>,
    total_frames: usize,
    /// `dim x total_frames` column-major frame matrix; `None` while paged out.
    payload: Mutex<Option<Vec<f32>>>,
}

/// Enumerates a corpus, partitions it into chunks, and serves chunk payloads.
///
/// Utterances with fewer than 2 frames are dropped at enumeration (context
/// boundary replication needs at least 2). Feature kind / dimension / sample
/// period are discovered on the first successful page-in and are immutable
/// afterwards. Paging operations on distinct chunks are independent; on the
/// same chunk they serialize on the chunk's payload lock.
pub struct ChunkedDeserializer {
    archive: Arc<dyn FeatureArchive>,
    chunks: Vec<ChunkData>,
    format: Mutex<Option<FeatureFormat>>,
    total_frames: u64,
    num_utterances: usize,
    dropped_short: usize,
    verbosity: i32,
    metrics: Arc<PagingMetrics>,
}

impl std::fmt::Debug for ChunkedDeserializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedDeserializer")
            .field("chunks", &self.chunks)
            .field("format", &self.format)
            .field("total_frames", &self.total_frames)
            .field("num_utterances", &self.num_utterances)
            .field("dropped_short", &self.dropped_short)
            .field("verbosity", &self.verbosity)
            .finish()
    }
}

impl ChunkedDeserializer {
    pub fn new(
        archive: Arc<dyn FeatureArchive>,
        feature_paths: &[PathBuf],
        labels: &LabelSet,
        chunking: ChunkingParams,
        verbosity: i32,
    ) -> Result<Self, ReaderError> {
        let mut chunks: Vec<ChunkData> = Vec::new();
        let mut current: Vec<UtteranceEntry> = Vec::new();
        let mut current_frames: u64 = 0;
        let mut total_frames: u64 = 0;
        let mut num_utterances: usize = 0;
        let mut dropped_short: usize = 0;

        let close_chunk = |chunks: &mut Vec<ChunkData>,
                           current: &mut Vec<UtteranceEntry>,
                           current_frames: &mut u64| {
            if !current.is_empty() {
                chunks.push(ChunkData {
                    utterances: std::mem::take(current),
                    total_frames: *current_frames as usize,
                    payload: Mutex::new(None),
                });
                *current_frames = 0;
            }
        };

        for path in feature_paths {
            let info = archive.info(path)?;
            let key = UtteranceKey::from_path(path)
                .map_err(|_| ReaderError::InvalidState("archive path has no file name"))?;
            let num_frames = info.num_frames;

            if num_frames < 2 {
                warn!(%key, frames = num_frames, "skipping utterance with fewer than 2 frames");
                dropped_short += 1;
                continue;
            }

            let class_ids = labels
                .for_key(&key)
                .ok_or_else(|| ReaderError::MissingAlignment(key.to_string()))?;
            if class_ids.len() != num_frames as usize {
                return Err(ReaderError::AlignmentLength {
                    key: key.to_string(),
                    labeled: class_ids.len(),
                    actual: num_frames as usize,
                });
            }

            if !current.is_empty()
                && (current_frames + num_frames as u64 > chunking.target_frames
                    || current.len() >= chunking.max_utterances)
            {
                close_chunk(&mut chunks, &mut current, &mut current_frames);
            }

            current.push(UtteranceEntry {
                id: num_utterances as u64,
                path: path.clone(),
                num_frames,
                first_frame: current_frames as usize,
                natural_start: total_frames,
                class_ids: class_ids.to_vec(),
            });
            current_frames += num_frames as u64;
            total_frames += num_frames as u64;
            num_utterances += 1;
        }
        close_chunk(&mut chunks, &mut current, &mut current_frames);

        if num_utterances > 0 {
            info!(
                utterances = num_utterances,
                dropped = dropped_short,
                chunks = chunks.len(),
                avg_utterances = num_utterances as f64 / chunks.len().max(1) as f64,
                avg_frames = total_frames as f64 / chunks.len().max(1) as f64,
                "grouped utterances into chunks"
            );
        }

        Ok(Self {
            archive,
            chunks,
            format: Mutex::new(None),
            total_frames,
            num_utterances,
            dropped_short,
            verbosity,
            metrics: Arc::new(PagingMetrics::default()),
        })
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn num_utterances(&self) -> usize {
        self.num_utterances
    }

    pub fn dropped_short(&self) -> usize {
        self.dropped_short
    }

    /// Feature format once discovered by the first page-in.
    pub fn format(&self) -> Option<FeatureFormat> {
        self.format.lock().ok().and_then(|slot| *slot)
    }

    pub fn metrics(&self) -> Arc<PagingMetrics> {
        self.metrics.clone()
    }

    pub fn is_paged_in(&self, chunk: usize) -> bool {
        self.chunks
            .get(chunk)
            .and_then(|c| c.payload.lock().ok().map(|p| p.is_some()))
            .unwrap_or(false)
    }

    /// Per-chunk utterance frame counts, the randomizer's view of the corpus.
    pub fn chunk_shapes(&self) -> Vec<ChunkShape> {
        self.chunks
            .iter()
            .map(|c| ChunkShape {
                utterance_frames: c.utterances.iter().map(|u| u.num_frames).collect(),
            })
            .collect()
    }

    /// Lazy enumeration of sequence descriptors: one per frame in frame mode,
    /// one per utterance otherwise.
    pub fn sequences(&self, frame_mode: bool) -> impl Iterator<Item = SequenceDescriptor> + '_ {
        self.chunks.iter().enumerate().flat_map(move |(ci, chunk)| {
            chunk.utterances.iter().flat_map(move |utt| {
                let (count, base, frames_each) = if frame_mode {
                    (utt.num_frames as usize, utt.natural_start, 1)
                } else {
                    (1, utt.id, utt.num_frames)
                };
                (0..count).map(move |k| SequenceDescriptor {
                    id: base + k as u64,
                    chunk: ci,
                    num_frames: frames_each,
                    valid: true,
                })
            })
        })
    }

    pub fn stream_descriptions(
        &self,
        streams: &[StreamConfig],
        element_type: ElementType,
    ) -> Vec<StreamDescription> {
        streams
            .iter()
            .enumerate()
            .map(|(id, s)| StreamDescription {
                id,
                name: s.name.clone(),
                kind: s.stream_type.kind(),
                dim: s.dim,
                element_type,
            })
            .collect()
    }

    /// Epoch boundaries do not concern the deserializer; paging is driven from
    /// the randomizer side.
    pub fn start_epoch(&self) {}

    /// Pages a chunk in. Idempotent. Transient archive I/O errors are retried
    /// up to 5 times with a blocking backoff; the 5th failure surfaces as
    /// [`ReaderError::Io`] and aborts the epoch.
    pub fn require_chunk(&self, chunk: usize) -> Result<(), ReaderError> {
        let data = self
            .chunks
            .get(chunk)
            .ok_or(ReaderError::InvalidState("required a chunk that was never enumerated"))?;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.page_in(data) {
                Ok(true) => {
                    self.metrics.chunks_paged_in_total.inc();
                    self.metrics.chunks_in_ram.add(1);
                    if self.verbosity >= 2 {
                        debug!(chunk, utterances = data.utterances.len(), "chunk paged in");
                    }
                    return Ok(());
                }
                Ok(false) => return Ok(()),
                Err(ReaderError::Archive(ArchiveError::Io(err))) if attempt < PAGE_IN_ATTEMPTS => {
                    self.metrics.page_in_retries_total.inc();
                    warn!(chunk, attempt, error = %err, "chunk page-in failed; retrying");
                    std::thread::sleep(PAGE_IN_BACKOFF * attempt);
                }
                Err(ReaderError::Archive(source @ ArchiveError::Io(_))) => {
                    return Err(ReaderError::Io {
                        chunk,
                        attempts: attempt,
                        source,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pages a chunk out. Idempotent; fails only for a chunk index that was
    /// never enumerated.
    pub fn release_chunk(&self, chunk: usize) -> Result<(), ReaderError> {
        let data = self
            .chunks
            .get(chunk)
            .ok_or(ReaderError::InvalidState("released a chunk that was never enumerated"))?;
        let mut payload = lock_payload(data)?;
        if payload.take().is_some() {
            self.metrics.chunks_paged_out_total.inc();
            self.metrics.chunks_in_ram.sub(1);
            if self.verbosity >= 2 {
                debug!(chunk, "chunk paged out");
            }
        }
        Ok(())
    }

    /// Copies the `(1 + left + right) * dim` sample block for one frame into
    /// `dst`, widening to `element` on the fly. Frames outside the utterance
    /// are clamped to the nearest valid frame (neighbor replication).
    ///
    /// The chunk must be paged in; indices must be in range.
    pub fn get_samples(
        &self,
        chunk: usize,
        utterance: usize,
        frame: usize,
        left: usize,
        right: usize,
        element: ElementType,
        dst: &mut [u8],
    ) -> Result<(), ReaderError> {
        let data = self
            .chunks
            .get(chunk)
            .ok_or(ReaderError::InvalidState("chunk index out of range"))?;
        let utt = data
            .utterances
            .get(utterance)
            .ok_or(ReaderError::InvalidState("utterance index out of range"))?;
        let num_frames = utt.num_frames as usize;
        if frame >= num_frames {
            return Err(ReaderError::InvalidState("frame index out of range"));
        }

        let payload = lock_payload(data)?;
        let frames = payload
            .as_ref()
            .ok_or(ReaderError::InvalidState("get_samples on a paged-out chunk"))?;
        let dim = self
            .format()
            .ok_or(ReaderError::InvalidState("feature format not discovered"))?
            .dim as usize;

        let span = 1 + left + right;
        let column_bytes = dim * element.byte_width();
        if dst.len() != span * column_bytes {
            return Err(ReaderError::InvalidState("sample destination size mismatch"));
        }

        for slot in 0..span {
            let offset = slot as isize - left as isize;
            let src = (frame as isize + offset).clamp(0, num_frames as isize - 1) as usize;
            let column = &frames[(utt.first_frame + src) * dim..][..dim];
            write_values(
                &mut dst[slot * column_bytes..][..column_bytes],
                element,
                column,
            );
        }
        Ok(())
    }

    /// Per-frame state label for one frame of one utterance. Labels are held
    /// in memory from enumeration; no paging is involved.
    pub fn class_id(&self, chunk: usize, utterance: usize, frame: usize) -> Result<u32, ReaderError> {
        let data = self
            .chunks
            .get(chunk)
            .ok_or(ReaderError::InvalidState("chunk index out of range"))?;
        let utt = data
            .utterances
            .get(utterance)
            .ok_or(ReaderError::InvalidState("utterance index out of range"))?;
        utt.class_ids
            .get(frame)
            .copied()
            .ok_or(ReaderError::InvalidState("frame index out of range"))
    }

    fn page_in(&self, data: &ChunkData) -> Result<bool, ReaderError> {
        let mut payload = lock_payload(data)?;
        if payload.is_some() {
            return Ok(false);
        }

        let dim = match self.format() {
            Some(format) => format.dim as usize,
            None => {
                let first = data
                    .utterances
                    .first()
                    .ok_or(ReaderError::InvalidState("page-in of an empty chunk"))?;
                self.archive.info(&first.path)?.dim as usize
            }
        };

        let mut buf = vec![0f32; dim * data.total_frames];
        for utt in &data.utterances {
            let n = utt.num_frames as usize;
            let dst = &mut buf[utt.first_frame * dim..(utt.first_frame + n) * dim];
            let info = self.archive.read_frames(&utt.path, dst)?;
            self.note_format(info.format())?;
        }

        *payload = Some(buf);
        Ok(true)
    }

    fn note_format(&self, found: FeatureFormat) -> Result<(), ReaderError> {
        let mut slot = self
            .format
            .lock()
            .map_err(|_| ReaderError::InvalidState("format lock poisoned"))?;
        match *slot {
            None => {
                info!(
                    kind = found.kind,
                    dim = found.dim,
                    shift_ms = found.frame_shift_ms(),
                    "determined feature format on first page-in"
                );
                *slot = Some(found);
                Ok(())
            }
            Some(expected) if expected == found => Ok(()),
            Some(expected) => Err(ReaderError::FormatMismatch { expected, found }),
        }
    }
}

fn lock_payload(data: &ChunkData) -> Result<std::sync::MutexGuard<'_, Option<Vec<f32>>>, ReaderError> {
    data.payload
        .lock()
        .map_err(|_| ReaderError::InvalidState("chunk payload lock poisoned"))
}

/// Writes `values` into `dst` at the given element width.
pub fn write_values(dst: &mut [u8], element: ElementType, values: &[f32]) {
    match element {
        ElementType::F32 => {
            for (bytes, value) in dst.chunks_exact_mut(4).zip(values) {
                bytes.copy_from_slice(&value.to_ne_bytes());
            }
        }
        ElementType::F64 => {
            for (bytes, value) in dst.chunks_exact_mut(8).zip(values) {
                bytes.copy_from_slice(&(*value as f64).to_ne_bytes());
            }
        }
    }
}

/// Context extent implied by the stream dimension when no explicit window is
/// configured: the stream dim must be an odd multiple of the feature dim, and
/// the extent is symmetric.
pub fn augmentation_extent(feature_dim: usize, stream_dim: usize) -> Result<usize, ReaderError> {
    if feature_dim == 0 {
        return Err(ReaderError::InvalidState("feature dim is zero"));
    }
    if stream_dim == feature_dim {
        return Ok(0);
    }
    let ratio = stream_dim / feature_dim;
    if stream_dim % feature_dim != 0 || ratio % 2 == 0 {
        return Err(ReaderError::BadAugmentation {
            stream_dim,
            feature_dim,
        });
    }
    Ok((ratio - 1) / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    use uttsource_archive::feature::ArchiveInfo;
    use uttsource_archive::labels::parse_alignments_tsv;

    /// In-memory archives keyed by path; frame `f` of utterance `u` holds
    /// `u * 1000 + f` in every dimension slot (plus the slot index / 100).
    struct MemArchive {
        files: HashMap<PathBuf, (ArchiveInfo, Vec<f32>)>,
        fail_reads: AtomicU32,
        read_calls: AtomicU32,
    }

    impl MemArchive {
        fn new(utterance_frames: &[u32], dim: u16) -> (Self, Vec<PathBuf>, LabelSet) {
            let mut files = HashMap::new();
            let mut paths = Vec::new();
            let mut tsv = String::from("schema_version=1\n");
            for (u, &n) in utterance_frames.iter().enumerate() {
                let path = PathBuf::from(format!("utt{u}.uft"));
                let mut frames = Vec::with_capacity(n as usize * dim as usize);
                for f in 0..n {
                    for d in 0..dim {
                        frames.push((u as f32) * 1000.0 + f as f32 + d as f32 / 100.0);
                    }
                }
                let info = ArchiveInfo {
                    kind: 6,
                    dim,
                    sample_period: 100_000,
                    num_frames: n,
                };
                files.insert(path.clone(), (info, frames));
                paths.push(path);
                if n > 0 {
                    for f in 0..n {
                        tsv.push_str(&format!("utt{u}\t{f}\t{}\t{}\n", f + 1, (u * 31 + f as usize) % 17));
                    }
                }
            }
            let labels = parse_alignments_tsv(tsv.as_bytes()).unwrap();
            (
                Self {
                    files,
                    fail_reads: AtomicU32::new(0),
                    read_calls: AtomicU32::new(0),
                },
                paths,
                labels,
            )
        }

        fn fail_next_reads(&self, count: u32) {
            self.fail_reads.store(count, Ordering::SeqCst);
        }
    }

    impl FeatureArchive for MemArchive {
        fn info(&self, path: &Path) -> Result<ArchiveInfo, ArchiveError> {
            self.files
                .get(path)
                .map(|(info, _)| *info)
                .ok_or_else(|| ArchiveError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))
        }

        fn read_frames(&self, path: &Path, dst: &mut [f32]) -> Result<ArchiveInfo, ArchiveError> {
            self.read_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_reads.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_reads.store(remaining - 1, Ordering::SeqCst);
                return Err(ArchiveError::Io(std::io::Error::from(
                    std::io::ErrorKind::Interrupted,
                )));
            }
            let (info, frames) = self
                .files
                .get(path)
                .ok_or_else(|| ArchiveError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)))?;
            dst.copy_from_slice(frames);
            Ok(*info)
        }
    }

    fn deserializer_with(
        utterance_frames: &[u32],
        dim: u16,
        chunking: ChunkingParams,
    ) -> (Arc<MemArchive>, ChunkedDeserializer) {
        let (archive, paths, labels) = MemArchive::new(utterance_frames, dim);
        let archive = Arc::new(archive);
        let deser =
            ChunkedDeserializer::new(archive.clone(), &paths, &labels, chunking, 0).unwrap();
        (archive, deser)
    }

    fn small_chunks(target_frames: u64, max_utterances: usize) -> ChunkingParams {
        ChunkingParams {
            target_frames,
            max_utterances,
        }
    }

    #[test]
    fn partitions_by_frame_target() {
        let (_, deser) = deserializer_with(&[40, 40, 40], 3, small_chunks(100, 100));
        let shapes = deser.chunk_shapes();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0].utterance_frames, vec![40, 40]);
        assert_eq!(shapes[1].utterance_frames, vec![40]);
        assert_eq!(deser.total_frames(), 120);
    }

    #[test]
    fn utterance_cap_is_inclusive() {
        let (_, deser) = deserializer_with(&[2, 2, 2], 3, small_chunks(1000, 3));
        assert_eq!(deser.num_chunks(), 1);

        let (_, deser) = deserializer_with(&[2, 2, 2, 2], 3, small_chunks(1000, 3));
        let shapes = deser.chunk_shapes();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0].num_utterances(), 3);
        assert_eq!(shapes[1].num_utterances(), 1);
    }

    #[test]
    fn drops_short_utterances() {
        let (_, deser) = deserializer_with(&[10, 1, 20], 3, ChunkingParams::default());
        assert_eq!(deser.num_utterances(), 2);
        assert_eq!(deser.dropped_short(), 1);
        assert_eq!(deser.total_frames(), 30);
        let ids: Vec<u64> = deser.sequences(false).map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn frame_mode_sequences_expand_frames() {
        let (_, deser) = deserializer_with(&[3, 2], 3, ChunkingParams::default());
        let descriptors: Vec<SequenceDescriptor> = deser.sequences(true).collect();
        assert_eq!(descriptors.len(), 5);
        assert!(descriptors.iter().all(|d| d.num_frames == 1 && d.valid));
        let ids: Vec<u64> = descriptors.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn missing_alignment_fails_enumeration() {
        let (archive, mut paths, labels) = MemArchive::new(&[10], 3);
        let extra = PathBuf::from("orphan.uft");
        let mut files_archive = archive;
        files_archive.files.insert(
            extra.clone(),
            (
                ArchiveInfo {
                    kind: 6,
                    dim: 3,
                    sample_period: 100_000,
                    num_frames: 4,
                },
                vec![0.0; 12],
            ),
        );
        paths.push(extra);
        let err = ChunkedDeserializer::new(
            Arc::new(files_archive),
            &paths,
            &labels,
            ChunkingParams::default(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, ReaderError::MissingAlignment(key) if key == "orphan"));
    }

    #[test]
    fn require_release_round_trip() {
        let (_, deser) = deserializer_with(&[4, 4], 2, ChunkingParams::default());
        assert!(!deser.is_paged_in(0));
        deser.require_chunk(0).unwrap();
        assert!(deser.is_paged_in(0));
        deser.require_chunk(0).unwrap(); // idempotent
        assert_eq!(deser.metrics().chunks_paged_in_total.get(), 1);

        deser.release_chunk(0).unwrap();
        assert!(!deser.is_paged_in(0));
        deser.release_chunk(0).unwrap(); // idempotent
        assert_eq!(deser.metrics().chunks_paged_out_total.get(), 1);

        let err = deser.release_chunk(99).unwrap_err();
        assert!(matches!(err, ReaderError::InvalidState(_)));
    }

    #[test]
    fn get_samples_requires_paged_in() {
        let (_, deser) = deserializer_with(&[4], 2, ChunkingParams::default());
        let mut dst = vec![0u8; 2 * 4];
        let err = deser
            .get_samples(0, 0, 0, 0, 0, ElementType::F32, &mut dst)
            .unwrap_err();
        assert!(matches!(err, ReaderError::InvalidState(_)));
    }

    #[test]
    fn get_samples_clamps_context_at_boundaries() {
        let (_, deser) = deserializer_with(&[3], 2, ChunkingParams::default());
        deser.require_chunk(0).unwrap();

        // Frame 0 with context (1, 1): left neighbor clamps to frame 0 itself.
        let mut dst = vec![0u8; 3 * 2 * 4];
        deser
            .get_samples(0, 0, 0, 1, 1, ElementType::F32, &mut dst)
            .unwrap();
        let values: Vec<f32> = dst
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        // Columns: clamp(frame -1) = frame 0, frame 0, frame 1.
        assert_eq!(values[0], 0.0);
        assert_eq!(values[2], 0.0);
        assert_eq!(values[4], 1.0);

        // Last frame: right neighbor clamps to the last frame.
        let mut dst = vec![0u8; 3 * 2 * 4];
        deser
            .get_samples(0, 0, 2, 1, 1, ElementType::F32, &mut dst)
            .unwrap();
        let values: Vec<f32> = dst
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(values[0], 1.0);
        assert_eq!(values[2], 2.0);
        assert_eq!(values[4], 2.0);
    }

    #[test]
    fn widens_to_f64_on_demand() {
        let (_, deser) = deserializer_with(&[2], 2, ChunkingParams::default());
        deser.require_chunk(0).unwrap();
        let mut dst = vec![0u8; 2 * 8];
        deser
            .get_samples(0, 0, 1, 0, 0, ElementType::F64, &mut dst)
            .unwrap();
        let values: Vec<f64> = dst
            .chunks_exact(8)
            .map(|b| f64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect();
        assert_eq!(values[0], 1.0);
        assert!((values[1] - 1.01).abs() < 1e-6);
    }

    #[test]
    fn class_ids_follow_alignment() {
        let (_, deser) = deserializer_with(&[5], 2, ChunkingParams::default());
        for f in 0..5 {
            assert_eq!(deser.class_id(0, 0, f).unwrap(), (f as u32) % 17);
        }
        assert!(deser.class_id(0, 0, 5).is_err());
    }

    #[test]
    fn format_discovered_lazily_and_pinned() {
        let (_, deser) = deserializer_with(&[4, 4], 3, small_chunks(4, 100));
        assert_eq!(deser.num_chunks(), 2);
        assert!(deser.format().is_none());
        deser.require_chunk(1).unwrap();
        let format = deser.format().unwrap();
        assert_eq!(format.dim, 3);
        assert_eq!(format.kind, 6);
    }

    #[test]
    fn format_mismatch_across_chunks_is_fatal() {
        let (mut archive, paths, labels) = MemArchive::new(&[4, 4], 3);
        // Second utterance reports a different dimension (payload resized to match).
        if let Some((info, frames)) = archive.files.get_mut(&PathBuf::from("utt1.uft")) {
            info.dim = 5;
            *frames = vec![0.0; 4 * 5];
        }
        let deser = ChunkedDeserializer::new(
            Arc::new(archive),
            &paths,
            &labels,
            small_chunks(4, 100),
            0,
        )
        .unwrap();
        deser.require_chunk(0).unwrap();
        let err = deser.require_chunk(1).unwrap_err();
        assert!(matches!(err, ReaderError::FormatMismatch { .. }));
    }

    #[test]
    fn retries_transient_io_then_succeeds() {
        let (archive, deser) = deserializer_with(&[4], 2, ChunkingParams::default());
        archive.fail_next_reads(4);
        deser.require_chunk(0).unwrap();
        assert_eq!(archive.read_calls.load(Ordering::SeqCst), 5);
        assert_eq!(deser.metrics().page_in_retries_total.get(), 4);
    }

    #[test]
    fn persistent_io_surfaces_after_five_attempts() {
        let (archive, deser) = deserializer_with(&[4], 2, ChunkingParams::default());
        archive.fail_next_reads(5);
        let err = deser.require_chunk(0).unwrap_err();
        assert!(matches!(err, ReaderError::Io { chunk: 0, attempts: 5, .. }));
        assert!(!deser.is_paged_in(0));
    }

    #[test]
    fn augmentation_extent_from_dim_ratio() {
        assert_eq!(augmentation_extent(13, 13).unwrap(), 0);
        assert_eq!(augmentation_extent(13, 39).unwrap(), 1);
        assert_eq!(augmentation_extent(13, 13 * 11).unwrap(), 5);
        assert!(augmentation_extent(13, 26).is_err());
        assert!(augmentation_extent(13, 40).is_err());
    }
}
