mod support;

use std::sync::Arc;

use uttsource_core::types::EpochSlice;
use uttsource_reader::randomizer::{BlockRandomizer, RandomizerMode};

/// Reading across the last frame of a sweep continues seamlessly into the
/// next sweep, re-randomized under the new sweep seed.
#[test]
fn batch_crosses_sweep_boundary() {
    let corpus = support::build_corpus("sweep-boundary", &[30, 20, 25, 25]);
    let deserializer = support::deserializer(&corpus, support::chunking(50));
    let shapes = Arc::new(deserializer.chunk_shapes());
    assert_eq!(shapes.len(), 2);

    let mut randomizer = BlockRandomizer::new(0, RandomizerMode::Frame, shapes.clone(), 50);
    assert_eq!(randomizer.total_frames(), 100);

    randomizer.start_epoch(EpochSlice {
        start_frame: 98,
        frame_budget: 200,
    });
    let batch = randomizer.next_sequences(5);
    assert_eq!(batch.items.len(), 5);
    assert!(!batch.end_of_epoch);

    let sweeps: Vec<u64> = batch.items.iter().map(|i| i.sweep).collect();
    assert_eq!(sweeps, vec![0, 0, 1, 1, 1]);
    let starts: Vec<u64> = batch.items.iter().map(|i| i.sequence.global_start).collect();
    assert_eq!(starts, vec![98, 99, 0, 1, 2]);
    assert_eq!(randomizer.cached_sweep(), Some(1));

    // The sweep-1 tail matches a straight pass that begins at sweep 1.
    let mut fresh = BlockRandomizer::new(0, RandomizerMode::Frame, shapes, 50);
    fresh.start_epoch(EpochSlice {
        start_frame: 100,
        frame_budget: 100,
    });
    let head = fresh.next_sequences(3);
    for (crossed, straight) in batch.items[2..].iter().zip(&head.items) {
        assert_eq!(crossed.sequence, straight.sequence);
    }
}

/// The last frame of a sweep arrives alone when requested alone, and the very
/// next pull re-randomizes for the following sweep.
#[test]
fn last_frame_then_rerandomize() {
    let corpus = support::build_corpus("sweep-last-frame", &[30, 20, 25, 25]);
    let deserializer = support::deserializer(&corpus, support::chunking(50));
    let shapes = Arc::new(deserializer.chunk_shapes());

    let mut randomizer = BlockRandomizer::new(0, RandomizerMode::Frame, shapes, 50);
    randomizer.start_epoch(EpochSlice {
        start_frame: 99,
        frame_budget: 10,
    });

    let last = randomizer.next_sequences(1);
    assert_eq!(last.items.len(), 1);
    assert_eq!(last.items[0].sweep, 0);
    assert_eq!(last.items[0].sequence.global_start, 99);
    assert_eq!(randomizer.cached_sweep(), Some(0));

    let next = randomizer.next_sequences(1);
    assert_eq!(next.items.len(), 1);
    assert_eq!(next.items[0].sweep, 1);
    assert_eq!(next.items[0].sequence.global_start, 0);
    assert_eq!(randomizer.cached_sweep(), Some(1));
}
