use crate::labels::IgnoreTag;
use crate::records;
use crate::utils::parse_number;
use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_DATASET_DIR: &str = "records";
pub const DEFAULT_BATCH_SIZE: usize = 16;
pub const DEFAULT_RESIZE_LENGTH: u32 = 1280;
pub const DEFAULT_KERNEL_NUM: usize = 7;
pub const DEFAULT_MIN_SCALE: f64 = 0.4;
pub const DEFAULT_NUM_READERS: usize = 4;
pub const DEFAULT_PREFETCH: usize = 4;
pub const NUM_BATCHES_TO_SHUFFLE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "train" => Ok(Mode::Train),
            "eval" => Ok(Mode::Eval),
            _ => Err(anyhow!(
                "mode should be in (\"train\", \"eval\"), got {:?}",
                value
            )),
        }
    }
}

/// Every knob of one dataset pass. Built once from CLI flags, validated
/// eagerly, then shared immutably with the producer thread.
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub dataset_dir: PathBuf,
    pub mode: Mode,
    pub batch_size: usize,
    pub resize_length: u32,
    pub crop_size: u32,
    pub kernel_num: usize,
    pub min_scale: f64,
    pub num_readers: usize,
    pub shuffle: bool,
    pub repeat: bool,
    pub augment: bool,
    pub shard_id: usize,
    pub num_shards: usize,
    pub prefetch: usize,
    pub shuffle_buffer: usize,
    pub ignore_tag: IgnoreTag,
    pub emit_mask: bool,
    pub seed: Option<u64>,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from(DEFAULT_DATASET_DIR),
            mode: Mode::Train,
            batch_size: DEFAULT_BATCH_SIZE,
            resize_length: DEFAULT_RESIZE_LENGTH,
            crop_size: DEFAULT_RESIZE_LENGTH / 2,
            kernel_num: DEFAULT_KERNEL_NUM,
            min_scale: DEFAULT_MIN_SCALE,
            num_readers: DEFAULT_NUM_READERS,
            shuffle: true,
            repeat: true,
            augment: true,
            shard_id: 0,
            num_shards: 1,
            prefetch: DEFAULT_PREFETCH,
            shuffle_buffer: NUM_BATCHES_TO_SHUFFLE * DEFAULT_BATCH_SIZE + 1,
            ignore_tag: IgnoreTag::default(),
            emit_mask: true,
            seed: None,
        }
    }
}

impl DatasetOptions {
    pub fn new(args: &clap::ArgMatches) -> Result<Self> {
        let mut opts = Self::default();
        if let Some(mode) = args.value_of("mode") {
            opts.mode = mode.parse()?;
            if opts.mode == Mode::Eval {
                opts.shuffle = false;
                opts.repeat = false;
                opts.augment = false;
            }
        }
        if let Some(dir) = args.value_of("dataset-dir") {
            opts.dataset_dir = PathBuf::from(dir);
        }
        if let Some(batch_size) = args.value_of("batch-size") {
            opts.batch_size = parse_number(batch_size, "batch size")?;
        }
        if let Some(resize_length) = args.value_of("resize-length") {
            opts.resize_length = parse_number(resize_length, "resize length")?;
            opts.crop_size = opts.resize_length / 2;
        }
        if let Some(crop_size) = args.value_of("crop-size") {
            opts.crop_size = parse_number(crop_size, "crop size")?;
        }
        if let Some(kernel_num) = args.value_of("kernel-num") {
            opts.kernel_num = parse_number(kernel_num, "kernel num")?;
        }
        if let Some(min_scale) = args.value_of("min-scale") {
            opts.min_scale = parse_number(min_scale, "min scale")?;
        }
        if let Some(num_readers) = args.value_of("num-readers") {
            opts.num_readers = parse_number(num_readers, "num readers")?;
        }
        if let Some(shard_id) = args.value_of("shard-id") {
            opts.shard_id = parse_number(shard_id, "shard id")?;
        }
        if let Some(num_shards) = args.value_of("num-shards") {
            opts.num_shards = parse_number(num_shards, "num shards")?;
        }
        if let Some(prefetch) = args.value_of("prefetch") {
            opts.prefetch = parse_number(prefetch, "prefetch depth")?;
        }
        if let Some(buffer) = args.value_of("shuffle-buffer") {
            opts.shuffle_buffer = parse_number(buffer, "shuffle buffer")?;
        } else {
            opts.shuffle_buffer = NUM_BATCHES_TO_SHUFFLE * opts.batch_size + 1;
        }
        if let Some(ignore_tag) = args.value_of("ignore-tag") {
            opts.ignore_tag = ignore_tag.parse()?;
        }
        if let Some(seed) = args.value_of("seed") {
            opts.seed = Some(parse_number(seed, "seed")?);
        }
        if args.is_present("no-shuffle") {
            opts.shuffle = false;
        }
        if args.is_present("no-repeat") {
            opts.repeat = false;
        }
        if args.is_present("no-augment") {
            opts.augment = false;
        }
        if args.is_present("no-mask") {
            opts.emit_mask = false;
        }
        Ok(opts)
    }

    /// Rejects bad configuration before any data flows. A dataset dir with
    /// no record files fails here too, otherwise a repeating stream would
    /// loop over nothing and never hand the consumer a batch.
    pub fn validate(&self) -> Result<()> {
        if !self.dataset_dir.is_dir() {
            return Err(anyhow!(
                "dataset dir {} doesn't exist",
                self.dataset_dir.display()
            ));
        }
        if records::list_record_files(&self.dataset_dir)?.is_empty() {
            return Err(anyhow!(
                "no record files found in {}",
                self.dataset_dir.display()
            ));
        }
        if self.batch_size == 0 {
            return Err(anyhow!("batch size should be positive"));
        }
        if self.kernel_num < 2 {
            return Err(anyhow!(
                "kernel num should be at least 2, got {}",
                self.kernel_num
            ));
        }
        if self.min_scale <= 0. || self.min_scale >= 1. {
            return Err(anyhow!(
                "min scale should be inside (0, 1), got {}",
                self.min_scale
            ));
        }
        if self.resize_length == 0 || self.crop_size == 0 {
            return Err(anyhow!("resize length and crop size should be positive"));
        }
        if self.num_readers == 0 {
            return Err(anyhow!("num readers should be positive"));
        }
        if self.prefetch == 0 {
            return Err(anyhow!("prefetch depth should be positive"));
        }
        if self.shuffle_buffer == 0 {
            return Err(anyhow!("shuffle buffer should be positive"));
        }
        if self.num_shards == 0 {
            return Err(anyhow!("num shards should be positive"));
        }
        if self.shard_id >= self.num_shards {
            return Err(anyhow!(
                "shard id {} out of range for {} shards",
                self.shard_id,
                self.num_shards
            ));
        }
        Ok(())
    }
}
