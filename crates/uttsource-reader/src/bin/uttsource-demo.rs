#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Drives the reader end-to-end over a seeded corpus directory and logs
//! delivery and paging metrics per epoch.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use uttsource_archive::feature::{FeatureArchive, FsFeatureArchive};
use uttsource_archive::labels::LabelSet;
use uttsource_core::config::{
    ContextWindow, MinibatchMode, ReaderConfig, StreamConfig, StreamType, BLOCK_RANDOMIZER_NAME,
};
use uttsource_core::types::ElementType;
use uttsource_reader::deserializer::{ChunkedDeserializer, ChunkingParams};
use uttsource_reader::epoch::EpochConfig;
use uttsource_reader::packer::FramePacker;

#[derive(Debug, Parser)]
#[command(name = "uttsource-demo")]
struct Args {
    /// Corpus directory holding `*.uft` archives and `alignment.tsv`.
    #[arg(long, env = "UTTSOURCE_CORPUS_DIR")]
    corpus_dir: PathBuf,

    #[arg(long, env = "UTTSOURCE_MB_SIZE", default_value_t = 256)]
    mb_size: usize,

    #[arg(long, env = "UTTSOURCE_EPOCHS", default_value_t = 2)]
    epochs: usize,

    /// Frames per epoch; 0 means one full sweep.
    #[arg(long, env = "UTTSOURCE_FRAMES_PER_EPOCH", default_value_t = 0)]
    frames_per_epoch: u64,

    /// Randomization range R, in frames.
    #[arg(long, env = "UTTSOURCE_RANDOMIZATION_WINDOW", default_value_t = 17_280_000)]
    randomization_window: u64,

    /// Symmetric context frames per side for the feature stream.
    #[arg(long, env = "UTTSOURCE_CONTEXT", default_value_t = 0)]
    context: usize,

    /// Disable the background prefetch worker.
    #[arg(long, env = "UTTSOURCE_NO_PREFETCH", default_value_t = false)]
    no_prefetch: bool,

    #[arg(long, env = "UTTSOURCE_VERBOSITY", default_value_t = 1)]
    verbosity: i32,
}

fn scan_archives(dir: &PathBuf) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "uft"))
        .collect();
    paths.sort();
    anyhow::ensure!(!paths.is_empty(), "no .uft archives in {}", dir.display());
    Ok(paths)
}

fn main() -> Result<()> {
    uttsource_observe::logging::init_tracing();
    let args = Args::parse();

    let paths = scan_archives(&args.corpus_dir)?;
    let labels = LabelSet::load(&args.corpus_dir.join("alignment.tsv"))?;

    let archive = Arc::new(FsFeatureArchive);
    let feature_dim = archive.info(&paths[0])?.dim as usize;
    let span = 1 + 2 * args.context;

    let config = ReaderConfig {
        randomization_window: args.randomization_window,
        randomizer: BLOCK_RANDOMIZER_NAME.to_string(),
        frame_mode: true,
        utts_per_recurrent_iter: vec![1],
        minibatch_mode: MinibatchMode::Partial,
        streams: vec![
            StreamConfig {
                name: "features".to_string(),
                stream_type: StreamType::Real,
                dim: feature_dim * span,
                context: ContextWindow {
                    left: args.context,
                    right: args.context,
                },
            },
            StreamConfig {
                name: "labels".to_string(),
                stream_type: StreamType::Category,
                dim: labels.num_classes(),
                context: ContextWindow::default(),
            },
        ],
        verbosity: args.verbosity,
    };

    let deserializer = Arc::new(ChunkedDeserializer::new(
        archive,
        &paths,
        &labels,
        ChunkingParams::default(),
        args.verbosity,
    )?);
    let paging_metrics = deserializer.metrics();

    let mut packer = FramePacker::new(config, deserializer, ElementType::F32, !args.no_prefetch)?;
    let metrics = packer.metrics();
    info!(
        total_frames = packer.total_frames(),
        streams = packer.stream_descriptions().len(),
        "reader ready"
    );

    for epoch in 0..args.epochs {
        packer.start_epoch(EpochConfig {
            epoch_index: epoch,
            worker_rank: 0,
            worker_count: 1,
            minibatch_size: args.mb_size,
            frames_per_epoch: args.frames_per_epoch,
        })?;

        let mut minibatches: u64 = 0;
        loop {
            let minibatch = packer.read_minibatch()?;
            if !minibatch.streams.is_empty() {
                minibatches += 1;
            }
            if minibatch.end_of_epoch {
                break;
            }
        }

        let read_time = metrics.minibatch_read_time.snapshot();
        info!(
            epoch,
            minibatches,
            frames_delivered = metrics.frames_delivered_total.get(),
            avg_read_us = read_time.avg_ns() / 1_000,
            max_read_us = read_time.max_ns / 1_000,
            chunks_paged_in = paging_metrics.chunks_paged_in_total.get(),
            chunks_paged_out = paging_metrics.chunks_paged_out_total.get(),
            chunks_in_ram = paging_metrics.chunks_in_ram.get(),
            "epoch complete"
        );
    }
    Ok(())
}
