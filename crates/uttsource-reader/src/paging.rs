use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::deserializer::ChunkedDeserializer;
use crate::randomizer::{BlockRandomizer, SequenceBatch};
use crate::ReaderError;

/// Reconciles chunk residency with the randomizer's paging hints.
///
/// Between batches the driver releases chunks that left every touched window
/// and pages in the newly required ones; a batch is handed to the caller only
/// after every chunk it references is resident. With prefetch enabled, the
/// requires for the following batch are issued to a background worker while
/// the caller consumes the current one.
pub struct PagingDriver {
    deserializer: Arc<ChunkedDeserializer>,
    resident: BTreeSet<usize>,
    prefetcher: Option<Prefetcher>,
}

impl PagingDriver {
    pub fn new(deserializer: Arc<ChunkedDeserializer>, prefetch: bool) -> Result<Self, ReaderError> {
        let prefetcher = if prefetch {
            Some(Prefetcher::spawn(deserializer.clone())?)
        } else {
            None
        };
        Ok(Self {
            deserializer,
            resident: BTreeSet::new(),
            prefetcher,
        })
    }

    pub fn resident_chunks(&self) -> Vec<usize> {
        self.resident.iter().copied().collect()
    }

    /// Pulls up to `count` sequences and pages chunks so every returned
    /// reference can be served. Release happens before require so memory use
    /// stays bounded by the window size.
    pub fn next_batch(
        &mut self,
        randomizer: &mut BlockRandomizer,
        count: usize,
    ) -> Result<SequenceBatch, ReaderError> {
        let batch = randomizer.next_sequences(count);
        let needed: BTreeSet<usize> = batch.required_chunks.iter().copied().collect();

        if let Some(prefetcher) = &mut self.prefetcher {
            prefetcher.drain(&mut self.resident)?;
        }

        let stale: Vec<usize> = self.resident.difference(&needed).copied().collect();
        for chunk in stale {
            self.deserializer.release_chunk(chunk)?;
            self.resident.remove(&chunk);
            debug!(chunk, "released chunk that left the window");
        }

        for chunk in needed {
            if self.resident.contains(&chunk) {
                continue;
            }
            if let Some(prefetcher) = &mut self.prefetcher {
                prefetcher.wait_for(chunk, &mut self.resident)?;
                if self.resident.contains(&chunk) {
                    continue;
                }
            }
            self.deserializer.require_chunk(chunk)?;
            self.resident.insert(chunk);
        }

        if let Some(prefetcher) = &mut self.prefetcher {
            for chunk in randomizer.residency_ahead(count) {
                if !self.resident.contains(&chunk) {
                    prefetcher.submit(chunk);
                }
            }
        }

        Ok(batch)
    }
}

/// Single background worker paging chunks in ahead of the consumer, in the
/// manner of a dedicated audio worker thread: jobs in, results out, the
/// channel closing on drop stops the thread.
struct Prefetcher {
    jobs: Option<Sender<usize>>,
    results: Receiver<(usize, Result<(), ReaderError>)>,
    inflight: BTreeSet<usize>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Prefetcher {
    fn spawn(deserializer: Arc<ChunkedDeserializer>) -> Result<Self, ReaderError> {
        let (jobs_tx, jobs_rx) = unbounded::<usize>();
        let (results_tx, results_rx) = unbounded();
        let handle = thread::Builder::new()
            .name("uttsource-prefetch".to_string())
            .spawn(move || {
                while let Ok(chunk) = jobs_rx.recv() {
                    let result = deserializer.require_chunk(chunk);
                    if results_tx.send((chunk, result)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|_| ReaderError::PrefetchLost)?;
        Ok(Self {
            jobs: Some(jobs_tx),
            results: results_rx,
            inflight: BTreeSet::new(),
            handle: Some(handle),
        })
    }

    fn submit(&mut self, chunk: usize) {
        if self.inflight.contains(&chunk) {
            return;
        }
        if let Some(jobs) = &self.jobs {
            if jobs.send(chunk).is_ok() {
                self.inflight.insert(chunk);
            }
        }
    }

    /// Folds finished prefetches into the resident set without blocking.
    fn drain(&mut self, resident: &mut BTreeSet<usize>) -> Result<(), ReaderError> {
        while let Ok((chunk, result)) = self.results.try_recv() {
            self.inflight.remove(&chunk);
            result?;
            resident.insert(chunk);
        }
        Ok(())
    }

    /// Blocks until an in-flight prefetch of `chunk` completes. No-op if the
    /// chunk was never submitted.
    fn wait_for(&mut self, chunk: usize, resident: &mut BTreeSet<usize>) -> Result<(), ReaderError> {
        while self.inflight.contains(&chunk) {
            match self.results.recv() {
                Ok((done, result)) => {
                    self.inflight.remove(&done);
                    result?;
                    resident.insert(done);
                }
                Err(_) => return Err(ReaderError::PrefetchLost),
            }
        }
        Ok(())
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
