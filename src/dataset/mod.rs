pub mod batch;
pub mod options;

use self::batch::{pad_batch, Batch, ProcessedSample};
use self::options::DatasetOptions;
use crate::augment::Augmenter;
use crate::labels;
use crate::records::{self, Record};
use anyhow::{anyhow, Result};
use imageproc::point::Point;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread;
use std::time::Instant;

/// A validated dataset pass. `batches` spawns the producer thread that walks
/// the record files and keeps `prefetch` padded batches ready; the returned
/// iterator is the consumer end and closes the pipeline when dropped.
#[derive(Debug)]
pub struct Dataset {
    options: DatasetOptions,
}

impl Dataset {
    pub fn new(options: DatasetOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &DatasetOptions {
        &self.options
    }

    pub fn batches(&self) -> Result<BatchIter> {
        let options = self.options.clone();
        let (tx, rx) = sync_channel(self.options.prefetch);
        let handle = thread::Builder::new()
            .name(String::from("dataset-producer"))
            .spawn(move || {
                if let Err(e) = produce_batches(&options, &tx) {
                    error!("dataset producer stopped: {:#}", e);
                }
            })?;
        Ok(BatchIter {
            rx,
            _handle: handle,
        })
    }
}

pub struct BatchIter {
    rx: Receiver<Batch>,
    _handle: thread::JoinHandle<()>,
}

impl Iterator for BatchIter {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        self.rx.recv().ok()
    }
}

fn produce_batches(options: &DatasetOptions, tx: &SyncSender<Batch>) -> Result<()> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.num_readers)
        .thread_name(|i| format!("sample-worker-{}", i))
        .build()?;
    let augmenter = Augmenter::new(options.resize_length, options.crop_size, options.augment);
    let mut epoch_rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut buffer: Vec<ProcessedSample> = Vec::with_capacity(options.shuffle_buffer.min(1 << 16));
    let mut pending: Vec<ProcessedSample> = Vec::with_capacity(options.batch_size);
    let mut sample_seq = 0u64;
    let mut total_batches = 0usize;
    let mut epoch = 0usize;
    loop {
        let epoch_start = Instant::now();
        let mut valid_in_pass = 0usize;
        let mut files = shard_files(
            records::list_record_files(&options.dataset_dir)?,
            options.shard_id,
            options.num_shards,
        );
        if options.shuffle {
            files.shuffle(&mut epoch_rng);
        }
        for file in &files {
            let file_records = match records::read_records(file) {
                Ok(file_records) => file_records,
                Err(e) => {
                    warn!("skipping unreadable record file {}: {:#}", file.display(), e);
                    continue;
                }
            };
            for chunk in file_records.chunks(options.num_readers * 4) {
                let base_seq = sample_seq;
                sample_seq += chunk.len() as u64;
                let processed: Vec<Option<ProcessedSample>> = pool.install(|| {
                    chunk
                        .par_iter()
                        .enumerate()
                        .map(|(offset, record)| {
                            let mut rng = sample_rng(options.seed, base_seq + offset as u64);
                            match process_record(record, options, &augmenter, &mut rng) {
                                Ok(sample) => sample,
                                Err(e) => {
                                    error!(
                                        "dropping record {:?}: {:#}",
                                        record.meta.filename, e
                                    );
                                    None
                                }
                            }
                        })
                        .collect()
                });
                for sample in processed.into_iter().flatten() {
                    valid_in_pass += 1;
                    let ready = if options.shuffle {
                        push_shuffled(&mut buffer, sample, options.shuffle_buffer, &mut epoch_rng)
                    } else {
                        Some(sample)
                    };
                    if let Some(sample) = ready {
                        pending.push(sample);
                        if pending.len() == options.batch_size
                            && !emit(&mut pending, options, tx, &mut total_batches)
                        {
                            return Ok(());
                        }
                    }
                }
            }
        }
        epoch += 1;
        debug!(
            "finished pass {} over {} record files in {} ms",
            epoch,
            files.len(),
            epoch_start.elapsed().as_millis()
        );
        // a pass that produced nothing can never fill a batch, so stop the
        // stream with an error instead of spinning through the files again
        if valid_in_pass == 0 {
            return Err(anyhow!(
                "no usable samples in {}",
                options.dataset_dir.display()
            ));
        }
        if !options.repeat {
            while let Some(sample) = pop_random(&mut buffer, &mut epoch_rng) {
                pending.push(sample);
                if pending.len() == options.batch_size
                    && !emit(&mut pending, options, tx, &mut total_batches)
                {
                    return Ok(());
                }
            }
            // evaluation keeps the smaller final batch
            if !pending.is_empty() && !emit(&mut pending, options, tx, &mut total_batches) {
                return Ok(());
            }
            info!("dataset pass complete after {} batches", total_batches);
            return Ok(());
        }
    }
}

/// Sends the pending batch, false when the consumer hung up.
fn emit(
    pending: &mut Vec<ProcessedSample>,
    options: &DatasetOptions,
    tx: &SyncSender<Batch>,
    total_batches: &mut usize,
) -> bool {
    let batch = pad_batch(pending, options.kernel_num, options.emit_mask);
    pending.clear();
    *total_batches += 1;
    tx.send(batch).is_ok()
}

/// The single eager per-sample pipeline: decode, synthesize, augment, check.
fn process_record<R: Rng>(
    record: &Record,
    options: &DatasetOptions,
    augmenter: &Augmenter,
    rng: &mut R,
) -> Result<Option<ProcessedSample>> {
    let sample = records::decode_record(record)?;
    if sample.width == 0 || sample.height == 0 {
        debug!("filtered empty image {:?}", sample.filename);
        return Ok(None);
    }
    let bboxes = scale_to_pixels(&sample.bboxes, sample.width, sample.height);
    let gt = labels::build_ground_truth(
        &bboxes,
        &sample.tags,
        options.ignore_tag,
        sample.height,
        sample.width,
        options.kernel_num,
        options.min_scale,
    );
    let (image, gt) = augmenter.apply(sample.image, gt, rng);
    let processed = ProcessedSample {
        image,
        gt,
        filename: sample.filename,
    };
    if processed.is_valid() {
        Ok(Some(processed))
    } else {
        debug!("filtered degenerate sample {:?}", processed.filename);
        Ok(None)
    }
}

fn scale_to_pixels(bboxes: &[Vec<[f32; 2]>], width: u32, height: u32) -> Vec<Vec<Point<i32>>> {
    bboxes
        .iter()
        .map(|poly| {
            poly.iter()
                .map(|[x, y]| Point::new((x * width as f32) as i32, (y * height as f32) as i32))
                .collect()
        })
        .collect()
}

fn shard_files(files: Vec<PathBuf>, shard_id: usize, num_shards: usize) -> Vec<PathBuf> {
    if num_shards <= 1 {
        return files;
    }
    files
        .into_iter()
        .enumerate()
        .filter(|(i, _)| i % num_shards == shard_id)
        .map(|(_, file)| file)
        .collect()
}

/// Derives one rng per sample task so augmentation draws never correlate
/// across a batch and reruns with the same seed reproduce exactly.
fn sample_rng(seed: Option<u64>, seq: u64) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ seq.wrapping_mul(0x9e37_79b9_7f4a_7c15)),
        None => StdRng::from_entropy(),
    }
}

fn push_shuffled<T, R: Rng>(
    buffer: &mut Vec<T>,
    element: T,
    capacity: usize,
    rng: &mut R,
) -> Option<T> {
    buffer.push(element);
    if buffer.len() > capacity {
        pop_random(buffer, rng)
    } else {
        None
    }
}

fn pop_random<T, R: Rng>(buffer: &mut Vec<T>, rng: &mut R) -> Option<T> {
    if buffer.is_empty() {
        return None;
    }
    let index = rng.gen_range(0..buffer.len());
    Some(buffer.swap_remove(index))
}
