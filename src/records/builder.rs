//! Packs a directory of images and ICDAR-style ground truth files into
//! record files. Each `gt_<stem>.txt` pairs with `<stem>.<jpg|jpeg|png>`;
//! samples go round-robin over the output files so every file carries a
//! similar share.

use super::{RecordWriter, SampleMeta, BBOX_SIZE, JPEG_MAGIC, PNG_MAGIC, RECORD_EXTENSION};
use crate::utils::parse_number;
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use rayon::prelude::*;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const DEFAULT_IMAGES_DIR: &str = "images";
pub const DEFAULT_GTS_DIR: &str = "gts";
pub const DEFAULT_OUTPUT_DIR: &str = "records";
pub const DEFAULT_NUM_FILES: usize = 8;
pub const DEFAULT_PREFIX: &str = "samples";

/// Transcription that marks an instance as non-evaluable text.
const IGNORED_TRANSCRIPTION: &str = "###";
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

lazy_static! {
    static ref GT_FILE_NAME_REGEX: Regex = Regex::new(r"^gt_(.+)\.txt$").unwrap();
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub images_dir: PathBuf,
    pub gts_dir: PathBuf,
    pub output_dir: PathBuf,
    pub num_files: usize,
    pub prefix: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            images_dir: PathBuf::from(DEFAULT_IMAGES_DIR),
            gts_dir: PathBuf::from(DEFAULT_GTS_DIR),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            num_files: DEFAULT_NUM_FILES,
            prefix: String::from(DEFAULT_PREFIX),
        }
    }
}

impl BuildOptions {
    pub fn new(args: &clap::ArgMatches) -> Result<Self> {
        let mut opts = Self::default();
        if let Some(dir) = args.value_of("images-dir") {
            opts.images_dir = PathBuf::from(dir);
        }
        if let Some(dir) = args.value_of("gts-dir") {
            opts.gts_dir = PathBuf::from(dir);
        }
        if let Some(dir) = args.value_of("output-dir") {
            opts.output_dir = PathBuf::from(dir);
        }
        if let Some(num_files) = args.value_of("num-files") {
            opts.num_files = parse_number(num_files, "num files")?;
        }
        if let Some(prefix) = args.value_of("prefix") {
            opts.prefix = String::from(prefix);
        }
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.images_dir.is_dir() {
            return Err(anyhow!(
                "images dir {} doesn't exist",
                self.images_dir.display()
            ));
        }
        if !self.gts_dir.is_dir() {
            return Err(anyhow!(
                "ground truth dir {} doesn't exist",
                self.gts_dir.display()
            ));
        }
        if self.num_files == 0 {
            return Err(anyhow!("num files should be positive"));
        }
        Ok(())
    }
}

pub fn build(options: &BuildOptions) -> Result<()> {
    options.validate()?;
    let instant = Instant::now();
    let images = index_images(&options.images_dir)?;
    let gt_files = list_gt_files(&options.gts_dir)?;
    fs::create_dir_all(&options.output_dir).with_context(|| {
        format!("couldn't create output dir {}", options.output_dir.display())
    })?;

    let samples: Vec<Option<(SampleMeta, Vec<u8>)>> = gt_files
        .par_iter()
        .map(|(stem, path)| match prepare_sample(stem, path, &images) {
            Ok(sample) => Some(sample),
            Err(e) => {
                warn!("skipping {}: {:#}", path.display(), e);
                None
            }
        })
        .collect();

    let mut writers = (0..options.num_files)
        .map(|i| {
            RecordWriter::create(options.output_dir.join(format!(
                "{}-{}-of-{}.{}",
                options.prefix, i, options.num_files, RECORD_EXTENSION
            )))
        })
        .collect::<Result<Vec<RecordWriter>>>()?;
    let mut written = 0;
    for (meta, bytes) in samples.into_iter().flatten() {
        writers[written % options.num_files].write_record(&meta, &bytes)?;
        written += 1;
    }
    for writer in writers {
        writer.finish()?;
    }
    info!(
        "wrote {} of {} samples into {} record files in {} ms",
        written,
        gt_files.len(),
        options.num_files,
        instant.elapsed().as_millis()
    );
    Ok(())
}

fn index_images(dir: &Path) -> Result<HashMap<String, PathBuf>> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("couldn't open images dir {}", dir.display()))?;
    let mut images = HashMap::new();
    for entry in entries {
        let path = entry?.path();
        let extension = match path.extension().and_then(|e| e.to_str()) {
            Some(extension) => extension.to_lowercase(),
            None => continue,
        };
        if !IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            continue;
        }
        let stem = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };
        images.insert(stem, path);
    }
    Ok(images)
}

fn list_gt_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("couldn't open ground truth dir {}", dir.display()))?;
    let mut files = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let stem = GT_FILE_NAME_REGEX.captures(name)?.get(1)?.as_str().to_string();
            Some((stem, path))
        })
        .collect::<Vec<(String, PathBuf)>>();
    files.sort();
    Ok(files)
}

fn prepare_sample(
    stem: &str,
    gt_path: &Path,
    images: &HashMap<String, PathBuf>,
) -> Result<(SampleMeta, Vec<u8>)> {
    let image_path = images
        .get(stem)
        .ok_or_else(|| anyhow!("no image found for stem {:?}", stem))?;
    let bytes = fs::read(image_path)
        .with_context(|| format!("couldn't read image {}", image_path.display()))?;
    let format = if bytes.starts_with(&JPEG_MAGIC) {
        "jpeg"
    } else if bytes.starts_with(&PNG_MAGIC) {
        "png"
    } else {
        return Err(anyhow!(
            "unsupported image encoding in {}",
            image_path.display()
        ));
    };
    let (width, height) = image::image_dimensions(image_path)
        .with_context(|| format!("couldn't read dimensions of {}", image_path.display()))?;
    let (mut boxes, tags) = parse_gt_file(gt_path)?;
    for (i, coord) in boxes.iter_mut().enumerate() {
        *coord /= if i % 2 == 0 { width as f32 } else { height as f32 };
    }
    let filename = image_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let count = tags.len();
    Ok((
        SampleMeta {
            filename,
            format: String::from(format),
            height,
            width,
            tags,
            count,
            boxes,
        },
        bytes,
    ))
}

fn parse_gt_file(path: &Path) -> Result<(Vec<f32>, String)> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("couldn't read ground truth file {}", path.display()))?;
    let mut boxes = Vec::new();
    let mut tags = String::new();
    for line in content.split_terminator('\n') {
        if let Some((coords, tag)) = parse_gt_line(line) {
            boxes.extend(coords);
            tags.push(tag);
        }
    }
    Ok((boxes, tags))
}

/// One annotation line: 8 comma-separated pixel coordinates, then the
/// transcription, which may itself contain commas. Files exported on
/// Windows carry a BOM and `\r` line ends, both are stripped.
fn parse_gt_line(line: &str) -> Option<(Vec<f32>, char)> {
    let line = line.trim_start_matches('\u{feff}').trim();
    if line.is_empty() {
        return None;
    }
    let mut fields = line.splitn(BBOX_SIZE + 1, ',');
    let mut coords = Vec::with_capacity(BBOX_SIZE);
    for _ in 0..BBOX_SIZE {
        coords.push(fields.next()?.trim().parse::<f32>().ok()?);
    }
    let text = fields.next().unwrap_or("").trim();
    let tag = if text == IGNORED_TRANSCRIPTION { '1' } else { '0' };
    Some((coords, tag))
}
