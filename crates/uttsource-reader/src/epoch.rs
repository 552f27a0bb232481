use uttsource_core::config::ConfigError;
use uttsource_core::types::EpochSlice;

/// What the trainer passes when (re)starting an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochConfig {
    pub epoch_index: usize,
    pub worker_rank: usize,
    pub worker_count: usize,
    /// Requested minibatch size, in frames (frame mode).
    pub minibatch_size: usize,
    /// Frames per epoch across all workers; 0 means one full sweep.
    pub frames_per_epoch: u64,
}

/// Maps `(epoch, worker)` onto the worker's contiguous slice of the randomized
/// stream. Sharding is a stride within the stream, not a separate permutation.
pub fn epoch_slice(config: &EpochConfig, total_frames: u64) -> Result<EpochSlice, ConfigError> {
    if config.worker_count == 0 || config.worker_rank >= config.worker_count {
        return Err(ConfigError::BadWorkerRank {
            rank: config.worker_rank,
            count: config.worker_count,
        });
    }
    let frames_per_epoch = if config.frames_per_epoch == 0 {
        total_frames
    } else {
        config.frames_per_epoch
    };
    let frame_budget = frames_per_epoch / config.worker_count as u64;
    let start_frame =
        config.epoch_index as u64 * frames_per_epoch + config.worker_rank as u64 * frame_budget;
    Ok(EpochSlice {
        start_frame,
        frame_budget,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(epoch_index: usize, worker_rank: usize, worker_count: usize) -> EpochConfig {
        EpochConfig {
            epoch_index,
            worker_rank,
            worker_count,
            minibatch_size: 256,
            frames_per_epoch: 1000,
        }
    }

    #[test]
    fn workers_split_an_epoch_contiguously() {
        let w0 = epoch_slice(&config(0, 0, 2), 1000).unwrap();
        let w1 = epoch_slice(&config(0, 1, 2), 1000).unwrap();
        assert_eq!(w0.start_frame, 0);
        assert_eq!(w0.frame_budget, 500);
        assert_eq!(w1.start_frame, 500);
        assert_eq!(w1.frame_budget, 500);
        assert_eq!(w0.end_frame(), w1.start_frame);
    }

    #[test]
    fn epochs_advance_the_global_cursor() {
        let e3 = epoch_slice(&config(3, 0, 1), 1000).unwrap();
        assert_eq!(e3.start_frame, 3000);
        assert_eq!(e3.frame_budget, 1000);
    }

    #[test]
    fn zero_frames_per_epoch_means_one_sweep() {
        let mut cfg = config(1, 0, 1);
        cfg.frames_per_epoch = 0;
        let slice = epoch_slice(&cfg, 777).unwrap();
        assert_eq!(slice.start_frame, 777);
        assert_eq!(slice.frame_budget, 777);
    }

    #[test]
    fn rejects_bad_worker_rank() {
        assert!(matches!(
            epoch_slice(&config(0, 2, 2), 1000),
            Err(ConfigError::BadWorkerRank { rank: 2, count: 2 })
        ));
        assert!(matches!(
            epoch_slice(&config(0, 0, 0), 1000),
            Err(ConfigError::BadWorkerRank { .. })
        ));
    }
}
