#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Synthesizes a corpus directory: one feature archive per utterance plus a
//! label alignment TSV, for demos and manual testing.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use uttsource_archive::feature::write_archive;
use uttsource_archive::labels::write_alignments_tsv;
use uttsource_core::key::UtteranceKey;

#[derive(Debug, Parser)]
#[command(name = "uttsource-seed")]
struct Args {
    #[arg(long, env = "UTTSOURCE_OUT_DIR")]
    out_dir: PathBuf,

    #[arg(long, env = "UTTSOURCE_UTTERANCES", default_value_t = 100)]
    utterances: usize,

    #[arg(long, env = "UTTSOURCE_MIN_FRAMES", default_value_t = 50)]
    min_frames: u32,

    #[arg(long, env = "UTTSOURCE_MAX_FRAMES", default_value_t = 600)]
    max_frames: u32,

    #[arg(long, env = "UTTSOURCE_DIM", default_value_t = 40)]
    dim: u16,

    /// Number of distinct state labels.
    #[arg(long, env = "UTTSOURCE_CLASSES", default_value_t = 132)]
    classes: u32,

    #[arg(long, env = "UTTSOURCE_SEED", default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    uttsource_observe::logging::init_tracing();
    let args = Args::parse();
    anyhow::ensure!(args.utterances > 0, "need at least one utterance");
    anyhow::ensure!(args.dim > 0, "dim must be positive");
    anyhow::ensure!(
        2 <= args.min_frames && args.min_frames <= args.max_frames,
        "need 2 <= min_frames <= max_frames"
    );
    anyhow::ensure!(args.classes > 0, "classes must be positive");

    std::fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("create {}", args.out_dir.display()))?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut segments: Vec<(UtteranceKey, u64, u64, u32)> = Vec::new();
    let mut total_frames: u64 = 0;

    for u in 0..args.utterances {
        let num_frames = rng.gen_range(args.min_frames..=args.max_frames);
        let mut frames = Vec::with_capacity(num_frames as usize * args.dim as usize);
        for _ in 0..num_frames as usize * args.dim as usize {
            frames.push(rng.gen_range(-4.0f32..4.0));
        }

        let name = format!("utt{u:05}");
        let path = args.out_dir.join(format!("{name}.uft"));
        write_archive(&path, 6, 100_000, args.dim, &frames)?;

        let key = UtteranceKey::parse(&name)?;
        let mut begin: u64 = 0;
        while begin < num_frames as u64 {
            let span = rng.gen_range(1..=8).min(num_frames as u64 - begin);
            let class_id = rng.gen_range(0..args.classes);
            segments.push((key.clone(), begin, begin + span, class_id));
            begin += span;
        }
        total_frames += num_frames as u64;
    }

    let labels_path = args.out_dir.join("alignment.tsv");
    write_alignments_tsv(&labels_path, &segments)?;

    info!(
        utterances = args.utterances,
        total_frames,
        dim = args.dim,
        classes = args.classes,
        out_dir = %args.out_dir.display(),
        "seeded corpus"
    );
    Ok(())
}
