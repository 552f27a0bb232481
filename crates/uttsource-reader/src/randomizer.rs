//! Two-level block randomizer.
//!
//! For each sweep, chunks are brought into a seeded pseudo-random order and
//! assigned a dense global timeline. Each randomized chunk gets a window of
//! neighboring ranks (bounded by the randomization range) into which its
//! sequences may move; sequences are then permuted by a constrained-swap pass
//! that never moves a sequence outside its window, so any position can be
//! served with a bounded set of resident chunks.
//!
//! Everything derived here is a pure function of `(sweep, chunk shapes, R)`:
//! two randomizers over the same corpus replay identical streams.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::info;

use uttsource_core::types::{ChunkShape, EpochSlice, ResidencyWindow, SequenceRef};

const CHUNK_SEED_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomizerMode {
    Frame,
    Utterance,
}

#[derive(Debug, Clone)]
struct RandomizedChunk {
    original: usize,
    num_frames: u64,
    num_utterances: usize,
    global_start: u64,
    window: ResidencyWindow,
}

impl RandomizedChunk {
    fn global_end(&self) -> u64 {
        self.global_start + self.num_frames
    }

    fn midpoint(&self) -> u64 {
        self.global_start + self.num_frames / 2
    }
}

/// One entry of a [`SequenceBatch`].
#[derive(Debug, Clone, Copy)]
pub struct BatchItem {
    pub sweep: u64,
    pub position: u64,
    pub sequence: SequenceRef,
    /// Original (deserializer) index of the chunk holding the sequence.
    pub original_chunk: usize,
    /// Randomized-rank window of this position within its sweep.
    pub residency: ResidencyWindow,
}

#[derive(Debug, Clone, Default)]
pub struct SequenceBatch {
    pub items: Vec<BatchItem>,
    /// Union of the items' residency windows, translated to original chunk
    /// indices (sorted, deduplicated). Translation happens while each item's
    /// sweep mapping is live, so batches that straddle a sweep boundary stay
    /// correct.
    pub required_chunks: Vec<usize>,
    pub end_of_epoch: bool,
}

pub struct BlockRandomizer {
    verbosity: i32,
    mode: RandomizerMode,
    shapes: Arc<Vec<ChunkShape>>,
    total_frames: u64,
    num_utterances: usize,
    randomization_range: u64,

    cached_sweep: Option<u64>,
    chunks: Vec<RandomizedChunk>,
    /// Rank of the defining chunk, per utterance position.
    defining_rank: Vec<u32>,
    /// Post-swap sequence refs, per utterance position.
    utterance_refs: Vec<SequenceRef>,
    /// Post-swap global start per utterance position (for seeking and for
    /// mapping frame positions back to utterance positions).
    utterance_starts: Vec<u64>,
    /// Frame-expanded refs; populated in frame mode only.
    frame_refs: Vec<SequenceRef>,

    cursor: u64,
    epoch_end: u64,
}

impl BlockRandomizer {
    pub fn new(
        verbosity: i32,
        mode: RandomizerMode,
        shapes: Arc<Vec<ChunkShape>>,
        randomization_range: u64,
    ) -> Self {
        let total_frames = shapes.iter().map(|s| s.total_frames()).sum();
        let num_utterances = shapes.iter().map(|s| s.num_utterances()).sum();
        Self {
            verbosity,
            mode,
            shapes,
            total_frames,
            num_utterances,
            randomization_range,
            cached_sweep: None,
            chunks: Vec::new(),
            defining_rank: Vec::new(),
            utterance_refs: Vec::new(),
            utterance_starts: Vec::new(),
            frame_refs: Vec::new(),
            cursor: 0,
            epoch_end: 0,
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn num_utterances(&self) -> usize {
        self.num_utterances
    }

    pub fn num_chunks(&self) -> usize {
        self.shapes.len()
    }

    pub fn cached_sweep(&self) -> Option<u64> {
        self.cached_sweep
    }

    /// Original chunk indices in this sweep's randomized order.
    pub fn chunk_order(&self) -> Vec<usize> {
        self.chunks.iter().map(|c| c.original).collect()
    }

    pub fn start_epoch(&mut self, slice: EpochSlice) {
        self.epoch_end = slice.end_frame();
        self.seek(slice.start_frame);
        if self.verbosity >= 1 {
            info!(
                start_frame = slice.start_frame,
                frame_budget = slice.frame_budget,
                "epoch slice started"
            );
        }
    }

    /// Positions the cursor at `global_frame`, re-randomizing when the frame
    /// falls into a different sweep. Idempotent. In utterance mode the cursor
    /// snaps to the start of the sequence containing the frame.
    pub fn seek(&mut self, global_frame: u64) {
        self.cursor = global_frame;
        if self.total_frames == 0 {
            return;
        }
        let offset = self.lazy_randomize(global_frame);
        if self.mode == RandomizerMode::Utterance {
            let position = self.position_for_offset(offset);
            let start = self.utterance_refs[position].global_start;
            self.cursor = (global_frame - offset) + start;
        }
    }

    /// Pulls up to `count` sequence references starting at the cursor,
    /// advancing it. Returns fewer items with `end_of_epoch` set once the
    /// epoch's frame budget is exhausted; the stream itself continues into the
    /// next sweep transparently.
    pub fn next_sequences(&mut self, count: usize) -> SequenceBatch {
        let mut batch = SequenceBatch::default();
        if self.total_frames == 0 {
            batch.end_of_epoch = true;
            return batch;
        }

        let mut required: BTreeSet<usize> = BTreeSet::new();
        while batch.items.len() < count {
            if self.cursor >= self.epoch_end {
                batch.end_of_epoch = true;
                break;
            }
            let offset = self.lazy_randomize(self.cursor);
            let sweep = self.cursor / self.total_frames;
            let position = self.position_for_offset(offset);
            let sequence = match self.mode {
                RandomizerMode::Frame => self.frame_refs[position],
                RandomizerMode::Utterance => self.utterance_refs[position],
            };
            let residency = self.window_for_position(position);
            for rank in residency.ranks() {
                required.insert(self.chunks[rank].original);
            }
            batch.items.push(BatchItem {
                sweep,
                position: position as u64,
                sequence,
                original_chunk: self.chunks[sequence.chunk_rank].original,
                residency,
            });
            let sweep_base = self.cursor - offset;
            self.cursor = sweep_base + sequence.global_end();
        }
        batch.required_chunks = required.into_iter().collect();
        batch
    }

    /// Residency window for a position of the currently randomized sweep.
    pub fn chunk_residency(&self, position: u64) -> Option<ResidencyWindow> {
        if self.cached_sweep.is_none() {
            return None;
        }
        let max = match self.mode {
            RandomizerMode::Frame => self.total_frames,
            RandomizerMode::Utterance => self.utterance_refs.len() as u64,
        };
        if position >= max {
            return None;
        }
        Some(self.window_for_position(position as usize))
    }

    /// Translates a rank window of the currently randomized sweep to original
    /// chunk indices.
    pub fn original_chunks(&self, window: ResidencyWindow) -> impl Iterator<Item = usize> + '_ {
        window.ranks().map(move |rank| self.chunks[rank].original)
    }

    /// Original chunks needed for the next `count` sequences, without moving
    /// the cursor. Clipped to the current sweep and the epoch budget, so it
    /// never triggers a re-randomization; used for prefetch.
    pub fn residency_ahead(&self, count: usize) -> Vec<usize> {
        let mut required: BTreeSet<usize> = BTreeSet::new();
        let Some(sweep) = self.cached_sweep else {
            return Vec::new();
        };
        if self.total_frames == 0 {
            return Vec::new();
        }
        let sweep_base = sweep * self.total_frames;
        let mut cursor = self.cursor;
        let mut taken = 0usize;
        while taken < count && cursor < self.epoch_end {
            if cursor < sweep_base || cursor >= sweep_base + self.total_frames {
                break;
            }
            let offset = cursor - sweep_base;
            let position = self.position_for_offset(offset);
            let sequence = match self.mode {
                RandomizerMode::Frame => self.frame_refs[position],
                RandomizerMode::Utterance => self.utterance_refs[position],
            };
            let window = self.window_for_position(position);
            for rank in window.ranks() {
                required.insert(self.chunks[rank].original);
            }
            cursor = sweep_base + sequence.global_end();
            taken += 1;
        }
        required.into_iter().collect()
    }

    fn lazy_randomize(&mut self, global_frame: u64) -> u64 {
        let sweep = global_frame / self.total_frames;
        let offset = global_frame % self.total_frames;
        if self.cached_sweep != Some(sweep) {
            self.randomize_sweep(sweep);
        }
        offset
    }

    fn position_for_offset(&self, offset: u64) -> usize {
        match self.mode {
            RandomizerMode::Frame => offset as usize,
            RandomizerMode::Utterance => {
                self.utterance_starts.partition_point(|&s| s <= offset) - 1
            }
        }
    }

    fn window_for_position(&self, position: usize) -> ResidencyWindow {
        let utterance_position = match self.mode {
            RandomizerMode::Utterance => position,
            RandomizerMode::Frame => {
                self.utterance_starts
                    .partition_point(|&s| s <= position as u64)
                    - 1
            }
        };
        let rank = self.defining_rank[utterance_position] as usize;
        self.chunks[rank].window
    }

    fn randomize_sweep(&mut self, sweep: u64) {
        let num_chunks = self.shapes.len();

        let mut order: Vec<usize> = (0..num_chunks).collect();
        let mut rng = StdRng::seed_from_u64(sweep ^ CHUNK_SEED_SALT);
        order.shuffle(&mut rng);

        self.chunks.clear();
        self.chunks.reserve(num_chunks);
        let mut global_start = 0u64;
        for &original in &order {
            let shape = &self.shapes[original];
            let num_frames = shape.total_frames();
            self.chunks.push(RandomizedChunk {
                original,
                num_frames,
                num_utterances: shape.num_utterances(),
                global_start,
                window: ResidencyWindow { begin: 0, end: 0 },
            });
            global_start += num_frames;
        }

        // A chunk's window is the maximal rank interval whose midpoints stay
        // within half the randomization range of its own midpoint. Midpoints
        // increase with rank, so both bounds only ever move forward.
        let half = (self.randomization_range / 2).max(1);
        let mut begin = 0usize;
        let mut end = 0usize;
        for rank in 0..num_chunks {
            let mid = self.chunks[rank].midpoint();
            while self.chunks[begin].midpoint() + half <= mid {
                begin += 1;
            }
            if end < rank + 1 {
                end = rank + 1;
            }
            while end < num_chunks && self.chunks[end].midpoint() < mid + half {
                end += 1;
            }
            self.chunks[rank].window = ResidencyWindow { begin, end };
        }

        // Lay sequences out in randomized chunk order; this fixes each
        // utterance position's defining chunk and its pre-swap frame span.
        self.defining_rank.clear();
        self.utterance_refs.clear();
        let mut initial_starts: Vec<u64> = Vec::with_capacity(self.num_utterances);
        let mut start = 0u64;
        for (rank, chunk) in self.chunks.iter().enumerate() {
            let shape = &self.shapes[chunk.original];
            for (utterance, &num_frames) in shape.utterance_frames.iter().enumerate() {
                self.defining_rank.push(rank as u32);
                initial_starts.push(start);
                self.utterance_refs.push(SequenceRef {
                    chunk_rank: rank,
                    utterance,
                    frame: 0,
                    global_start: start,
                    num_frames,
                });
                start += num_frames as u64;
            }
        }

        // Constrained swap: each position draws a partner frame within its
        // window's span; the swap happens only if both sequences stay inside
        // the other position's window.
        let num_positions = self.utterance_refs.len();
        for p in 0..num_positions {
            let window = self.chunks[self.defining_rank[p] as usize].window;
            let lo = self.chunks[window.begin].global_start;
            let hi = self.chunks[window.end - 1].global_end();
            let mut rng = StdRng::seed_from_u64(position_seed(sweep, p as u64));
            let t = rng.gen_range(lo..hi);
            let q = initial_starts.partition_point(|&s| s <= t) - 1;
            if q == p {
                continue;
            }
            let partner_window = self.chunks[self.defining_rank[q] as usize].window;
            if window.contains(self.utterance_refs[q].chunk_rank)
                && partner_window.contains(self.utterance_refs[p].chunk_rank)
            {
                self.utterance_refs.swap(p, q);
            }
        }

        #[cfg(debug_assertions)]
        for p in 0..num_positions {
            let window = self.chunks[self.defining_rank[p] as usize].window;
            debug_assert!(
                window.contains(self.utterance_refs[p].chunk_rank),
                "sequence at position {p} escaped its chunk window"
            );
        }

        // Reassign the global timeline in position order: dense and monotone.
        self.utterance_starts.clear();
        let mut start = 0u64;
        for sequence in self.utterance_refs.iter_mut() {
            sequence.global_start = start;
            self.utterance_starts.push(start);
            start += sequence.num_frames as u64;
        }

        self.frame_refs.clear();
        if self.mode == RandomizerMode::Frame {
            self.frame_refs.reserve(self.total_frames as usize);
            for sequence in &self.utterance_refs {
                for frame in 0..sequence.num_frames {
                    self.frame_refs.push(SequenceRef {
                        chunk_rank: sequence.chunk_rank,
                        utterance: sequence.utterance,
                        frame,
                        global_start: sequence.global_start + frame as u64,
                        num_frames: 1,
                    });
                }
            }
        }

        self.cached_sweep = Some(sweep);
        if self.verbosity >= 1 {
            info!(sweep, chunks = num_chunks, "sweep randomized");
        }
    }
}

/// Mixes `(sweep, position)` into an independent per-position seed so swap
/// decisions are local and deterministic.
fn position_seed(sweep: u64, position: u64) -> u64 {
    let mut z = sweep
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(position)
        .wrapping_add(0x243f_6a88_85a3_08d3);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
