#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use uttsource_archive::feature::{write_archive, FsFeatureArchive};
use uttsource_archive::labels::{write_alignments_tsv, LabelSet};
use uttsource_core::key::UtteranceKey;
use uttsource_reader::deserializer::{ChunkedDeserializer, ChunkingParams};

pub const DIM: u16 = 4;
pub const CLASSES: u32 = 17;
pub const KIND: u16 = 6;
pub const SAMPLE_PERIOD: u32 = 100_000;

/// Value planted at `(utterance, frame, slot)`; lets a test decode which
/// frame landed in a delivered column.
pub fn feature_value(utterance: usize, frame: u32, slot: u16) -> f32 {
    utterance as f32 * 1000.0 + frame as f32 + slot as f32 / 100.0
}

/// Decodes `(utterance, frame)` back out of a slot-0 feature value.
pub fn decode_feature(value: f32) -> (usize, u32) {
    let utterance = (value / 1000.0).floor() as usize;
    let frame = (value - utterance as f32 * 1000.0).round() as u32;
    (utterance, frame)
}

pub fn class_of(utterance: usize, frame: u32) -> u32 {
    ((utterance as u32) * 31 + frame) % CLASSES
}

pub struct Corpus {
    pub root: PathBuf,
    pub paths: Vec<PathBuf>,
    pub labels: LabelSet,
    pub utterance_frames: Vec<u32>,
}

/// Writes one archive per utterance plus a per-frame alignment TSV under a
/// unique temp directory.
pub fn build_corpus(test_name: &str, utterance_frames: &[u32]) -> Corpus {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "uttsource-reader-{test_name}-{}-{}",
        std::process::id(),
        uttsource_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root).unwrap();

    let mut paths = Vec::new();
    let mut segments: Vec<(UtteranceKey, u64, u64, u32)> = Vec::new();
    for (u, &num_frames) in utterance_frames.iter().enumerate() {
        let mut frames = Vec::with_capacity(num_frames as usize * DIM as usize);
        for f in 0..num_frames {
            for slot in 0..DIM {
                frames.push(feature_value(u, f, slot));
            }
        }
        let name = format!("utt{u:03}");
        let path = root.join(format!("{name}.uft"));
        write_archive(&path, KIND, SAMPLE_PERIOD, DIM, &frames).unwrap();
        paths.push(path);

        let key = UtteranceKey::parse(&name).unwrap();
        for f in 0..num_frames {
            segments.push((key.clone(), f as u64, f as u64 + 1, class_of(u, f)));
        }
    }

    let labels_path = root.join("alignment.tsv");
    write_alignments_tsv(&labels_path, &segments).unwrap();
    let labels = LabelSet::load(&labels_path).unwrap();

    Corpus {
        root,
        paths,
        labels,
        utterance_frames: utterance_frames.to_vec(),
    }
}

pub fn chunking(target_frames: u64) -> ChunkingParams {
    ChunkingParams {
        target_frames,
        max_utterances: 65_535,
    }
}

pub fn deserializer(corpus: &Corpus, params: ChunkingParams) -> Arc<ChunkedDeserializer> {
    Arc::new(
        ChunkedDeserializer::new(
            Arc::new(FsFeatureArchive),
            &corpus.paths,
            &corpus.labels,
            params,
            0,
        )
        .unwrap(),
    )
}
