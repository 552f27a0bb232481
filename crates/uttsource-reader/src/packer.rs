use std::sync::Arc;
use std::time::Instant;

use uttsource_core::config::{MinibatchMode, ReaderConfig, StreamType};
use uttsource_core::types::{ElementType, Layout, StreamDescription, StreamKind};
use uttsource_observe::metrics::{Counter, DurationAgg};

use crate::deserializer::{augmentation_extent, write_values, ChunkedDeserializer};
use crate::epoch::{epoch_slice, EpochConfig};
use crate::paging::PagingDriver;
use crate::randomizer::{BlockRandomizer, RandomizerMode};
use crate::ReaderError;

#[derive(Debug, Default)]
pub struct PackerMetrics {
    pub minibatches_delivered_total: Counter,
    pub frames_delivered_total: Counter,
    pub minibatch_read_time: DurationAgg,
}

struct PackStream {
    description: StreamDescription,
    /// Effective `(left, right)` context; resolved against the discovered
    /// feature format on the first minibatch.
    context: (usize, usize),
    buffer: Vec<u8>,
}

/// One stream of a delivered minibatch. The buffer view is valid until the
/// next `read_minibatch` call.
pub struct StreamMinibatch<'a> {
    pub description: &'a StreamDescription,
    pub data: &'a [u8],
    pub layout: Layout,
}

pub struct Minibatch<'a> {
    pub streams: Vec<StreamMinibatch<'a>>,
    pub end_of_epoch: bool,
}

/// Pulls randomized frame references and assembles dense column-major
/// minibatch buffers, one per configured stream. Dense-real streams copy
/// context-augmented feature columns; category streams pack one-hot state
/// labels.
pub struct FramePacker {
    config: ReaderConfig,
    deserializer: Arc<ChunkedDeserializer>,
    randomizer: BlockRandomizer,
    driver: PagingDriver,
    streams: Vec<PackStream>,
    element_type: ElementType,
    minibatch_size: usize,
    parallel_sequences: usize,
    contexts_resolved: bool,
    exhausted: bool,
    metrics: Arc<PackerMetrics>,
}

impl FramePacker {
    pub fn new(
        config: ReaderConfig,
        deserializer: Arc<ChunkedDeserializer>,
        element_type: ElementType,
        prefetch: bool,
    ) -> Result<Self, ReaderError> {
        config.validate().map_err(ReaderError::Config)?;

        let shapes = Arc::new(deserializer.chunk_shapes());
        let randomizer = BlockRandomizer::new(
            config.verbosity,
            RandomizerMode::Frame,
            shapes,
            config.randomization_window,
        );
        let driver = PagingDriver::new(deserializer.clone(), prefetch)?;
        let streams = deserializer
            .stream_descriptions(&config.streams, element_type)
            .into_iter()
            .zip(&config.streams)
            .map(|(description, cfg)| PackStream {
                description,
                context: (cfg.context.left, cfg.context.right),
                buffer: Vec::new(),
            })
            .collect();

        Ok(Self {
            config,
            deserializer,
            randomizer,
            driver,
            streams,
            element_type,
            minibatch_size: 0,
            parallel_sequences: 1,
            contexts_resolved: false,
            exhausted: false,
            metrics: Arc::new(PackerMetrics::default()),
        })
    }

    pub fn stream_descriptions(&self) -> Vec<StreamDescription> {
        self.streams.iter().map(|s| s.description.clone()).collect()
    }

    pub fn metrics(&self) -> Arc<PackerMetrics> {
        self.metrics.clone()
    }

    pub fn total_frames(&self) -> u64 {
        self.randomizer.total_frames()
    }

    pub fn start_epoch(&mut self, epoch: EpochConfig) -> Result<(), ReaderError> {
        self.parallel_sequences = self.config.parallel_sequences(epoch.epoch_index);
        self.minibatch_size = epoch.minibatch_size;
        let slice = epoch_slice(&epoch, self.deserializer.total_frames())?;
        self.deserializer.start_epoch();
        self.randomizer.start_epoch(slice);
        self.exhausted = false;
        Ok(())
    }

    /// Assembles the next minibatch. An empty `streams` list with
    /// `end_of_epoch` set signals exhaustion; in `full` minibatch mode a short
    /// final batch is dropped rather than delivered.
    pub fn read_minibatch(&mut self) -> Result<Minibatch<'_>, ReaderError> {
        let started = Instant::now();

        if self.exhausted {
            return Ok(Minibatch {
                streams: Vec::new(),
                end_of_epoch: true,
            });
        }

        let batch = self
            .driver
            .next_batch(&mut self.randomizer, self.minibatch_size)?;
        if batch.end_of_epoch {
            self.exhausted = true;
        }

        let time_steps = batch.items.len();
        let drop_short = time_steps < self.minibatch_size
            && self.config.minibatch_mode == MinibatchMode::Full;
        if time_steps == 0 || drop_short {
            return Ok(Minibatch {
                streams: Vec::new(),
                end_of_epoch: true,
            });
        }

        self.resolve_contexts()?;

        let layout = Layout {
            parallel_sequences: self.parallel_sequences,
            time_steps,
        };
        let element = self.element_type;
        let byte_width = element.byte_width();
        let mut used = Vec::with_capacity(self.streams.len());

        for stream in &mut self.streams {
            let dim = stream.description.dim;
            let column_bytes = dim * byte_width;
            let needed = column_bytes * layout.columns();
            if stream.buffer.len() < needed {
                let grown = needed.max(stream.buffer.len() * 2);
                stream.buffer.resize(grown, 0);
            }

            match stream.description.kind {
                StreamKind::DenseReal => {
                    let (left, right) = stream.context;
                    for (k, item) in batch.items.iter().enumerate() {
                        let column = &mut stream.buffer[k * column_bytes..][..column_bytes];
                        self.deserializer.get_samples(
                            item.original_chunk,
                            item.sequence.utterance,
                            item.sequence.frame as usize,
                            left,
                            right,
                            element,
                            column,
                        )?;
                    }
                }
                StreamKind::Category => {
                    for (k, item) in batch.items.iter().enumerate() {
                        let class = self.deserializer.class_id(
                            item.original_chunk,
                            item.sequence.utterance,
                            item.sequence.frame as usize,
                        )? as usize;
                        if class >= dim {
                            return Err(ReaderError::InvalidState(
                                "class id exceeds label stream dim",
                            ));
                        }
                        let column = &mut stream.buffer[k * column_bytes..][..column_bytes];
                        column.fill(0);
                        write_values(
                            &mut column[class * byte_width..][..byte_width],
                            element,
                            &[1.0],
                        );
                    }
                }
            }
            used.push(needed);
        }

        self.metrics.minibatches_delivered_total.inc();
        self.metrics.frames_delivered_total.inc_by(time_steps as u64);
        self.metrics.minibatch_read_time.record(started.elapsed());

        let end_of_epoch = self.exhausted;
        let streams = self
            .streams
            .iter()
            .zip(used)
            .map(|(stream, bytes)| StreamMinibatch {
                description: &stream.description,
                data: &stream.buffer[..bytes],
                layout,
            })
            .collect();
        Ok(Minibatch {
            streams,
            end_of_epoch,
        })
    }

    /// Pins each real stream's context once the feature format is known: an
    /// explicit context window must tile the stream dim exactly; with no
    /// explicit window the extent is implied by the dim ratio.
    fn resolve_contexts(&mut self) -> Result<(), ReaderError> {
        if self.contexts_resolved {
            return Ok(());
        }
        let format = self.deserializer.format().ok_or(ReaderError::InvalidState(
            "feature format not discovered before packing",
        ))?;
        let feature_dim = format.dim as usize;

        for (stream, cfg) in self.streams.iter_mut().zip(&self.config.streams) {
            match cfg.stream_type {
                StreamType::Real => {
                    let (left, right) = (cfg.context.left, cfg.context.right);
                    if left == 0 && right == 0 {
                        let extent = augmentation_extent(feature_dim, cfg.dim)?;
                        stream.context = (extent, extent);
                    } else {
                        if cfg.dim != feature_dim * (1 + left + right) {
                            return Err(ReaderError::BadAugmentation {
                                stream_dim: cfg.dim,
                                feature_dim,
                            });
                        }
                        stream.context = (left, right);
                    }
                }
                StreamType::Category => {
                    stream.context = (0, 0);
                }
            }
        }
        self.contexts_resolved = true;
        Ok(())
    }
}
