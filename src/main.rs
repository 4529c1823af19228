#[macro_use]
extern crate lazy_static;
extern crate log;
extern crate log4rs;

mod augment;
mod dataset;
mod expand;
mod labels;
mod polygon;
mod records;
mod utils;

use crate::dataset::batch::Batch;
use crate::dataset::options::DatasetOptions;
use crate::dataset::Dataset;
use crate::records::builder::{self, BuildOptions};
use crate::utils::parse_number;
use anyhow::Result;
use clap::{App, AppSettings, Arg, SubCommand};
use image::{GrayImage, Luma, Rgb, RgbImage};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

const DEFAULT_PREVIEW_BATCHES: usize = 4;

pub fn cli() -> App<'static, 'static> {
    App::new("psenet-data")
        .version("0.1.0")
        .about("Training data pipeline for progressive scale expansion text detection")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("build-dataset")
                .about("Packs images and ICDAR-style ground truth files into record files")
                .arg(
                    Arg::with_name("images-dir")
                        .long("images-dir")
                        .takes_value(true)
                        .help("Directory holding the jpeg/png images"),
                )
                .arg(
                    Arg::with_name("gts-dir")
                        .long("gts-dir")
                        .takes_value(true)
                        .help("Directory holding the gt_<stem>.txt annotation files"),
                )
                .arg(
                    Arg::with_name("output-dir")
                        .long("output-dir")
                        .takes_value(true)
                        .help("Where the record files are written"),
                )
                .arg(
                    Arg::with_name("num-files")
                        .long("num-files")
                        .takes_value(true)
                        .help("How many record files to spread the samples over"),
                )
                .arg(
                    Arg::with_name("prefix")
                        .long("prefix")
                        .takes_value(true)
                        .help("Record file name prefix"),
                ),
        )
        .subcommand(
            SubCommand::with_name("preview")
                .about("Drains a few batches and reports tensor shapes and timings")
                .arg(
                    Arg::with_name("mode")
                        .long("mode")
                        .takes_value(true)
                        .help("train or eval; eval disables shuffling, repeat and augmentation"),
                )
                .arg(
                    Arg::with_name("dataset-dir")
                        .long("dataset-dir")
                        .takes_value(true)
                        .help("Directory holding the record files"),
                )
                .arg(
                    Arg::with_name("batch-size")
                        .long("batch-size")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("resize-length")
                        .long("resize-length")
                        .takes_value(true)
                        .help("Target longer side after rescaling; also sets crop size to half"),
                )
                .arg(
                    Arg::with_name("crop-size")
                        .long("crop-size")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("kernel-num")
                        .long("kernel-num")
                        .takes_value(true)
                        .help("Total number of kernel scales including the full text map"),
                )
                .arg(
                    Arg::with_name("min-scale")
                        .long("min-scale")
                        .takes_value(true)
                        .help("Shrink rate of the smallest kernel, inside (0, 1)"),
                )
                .arg(
                    Arg::with_name("num-readers")
                        .long("num-readers")
                        .takes_value(true)
                        .help("Worker threads decoding and augmenting samples"),
                )
                .arg(
                    Arg::with_name("shard-id")
                        .long("shard-id")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("num-shards")
                        .long("num-shards")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("prefetch")
                        .long("prefetch")
                        .takes_value(true)
                        .help("Batches buffered ahead of the consumer"),
                )
                .arg(
                    Arg::with_name("shuffle-buffer")
                        .long("shuffle-buffer")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("ignore-tag")
                        .long("ignore-tag")
                        .takes_value(true)
                        .help("Tag character that marks non-evaluable text, 0 or 1"),
                )
                .arg(
                    Arg::with_name("seed")
                        .long("seed")
                        .takes_value(true)
                        .help("Fixes shuffling and augmentation for reproducible runs"),
                )
                .arg(Arg::with_name("no-shuffle").long("no-shuffle"))
                .arg(Arg::with_name("no-repeat").long("no-repeat"))
                .arg(Arg::with_name("no-augment").long("no-augment"))
                .arg(
                    Arg::with_name("no-mask")
                        .long("no-mask")
                        .help("Skip emitting the ignore mask tensor"),
                )
                .arg(
                    Arg::with_name("batches")
                        .long("batches")
                        .takes_value(true)
                        .help("How many batches to pull"),
                )
                .arg(
                    Arg::with_name("out-dir")
                        .long("out-dir")
                        .takes_value(true)
                        .help("Dump the first sample's rasters as PNGs into this directory"),
                ),
        )
}

fn main() -> Result<()> {
    log4rs::init_file("log4rs.yml", Default::default())?;

    let matches = cli().get_matches();
    match matches.subcommand() {
        ("build-dataset", Some(args)) => builder::build(&BuildOptions::new(args)?)?,
        ("preview", Some(args)) => run_preview(args)?,
        _ => {}
    }

    Ok(())
}

fn run_preview(args: &clap::ArgMatches) -> Result<()> {
    let options = DatasetOptions::new(args)?;
    let num_batches = match args.value_of("batches") {
        Some(batches) => parse_number(batches, "batches")?,
        None => DEFAULT_PREVIEW_BATCHES,
    };
    let out_dir = args.value_of("out-dir").map(PathBuf::from);
    let dataset = Dataset::new(options)?;
    info!(
        "previewing {} batches with {:?}",
        num_batches,
        dataset.options()
    );
    let mut batches = dataset.batches()?;
    let mut first = None;
    for i in 0..num_batches {
        let instant = Instant::now();
        let batch = match batches.next() {
            Some(batch) => batch,
            None => {
                info!("stream ended after {} batches", i);
                break;
            }
        };
        info!(
            "batch {}: images {:?}, labels {:?}, mask {}, pulled in {} ms",
            i,
            batch.images.dim(),
            batch.labels.dim(),
            batch
                .masks
                .as_ref()
                .map(|mask| format!("{:?}", mask.dim()))
                .unwrap_or_else(|| String::from("off")),
            instant.elapsed().as_millis()
        );
        if first.is_none() {
            first = Some(batch);
        }
    }
    if let (Some(dir), Some(batch)) = (out_dir, first) {
        dump_sample(&batch, &dir)?;
    }
    Ok(())
}

/// Writes the first sample of the batch as PNGs, each raster scaled up to
/// the visible range, plus the expanded instance map as a growth check.
fn dump_sample(batch: &Batch, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let (_, height, width, _) = batch.images.dim();
    let (w, h) = (width as u32, height as u32);

    let mut image = RgbImage::new(w, h);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        *pixel = Rgb([
            batch.images[[0, y as usize, x as usize, 0]] as u8,
            batch.images[[0, y as usize, x as usize, 1]] as u8,
            batch.images[[0, y as usize, x as usize, 2]] as u8,
        ]);
    }
    image.save(dir.join("image.png"))?;

    let channels = batch.labels.dim().3;
    let mut kernels = Vec::with_capacity(channels.saturating_sub(1));
    for c in 0..channels {
        let mut raster = GrayImage::new(w, h);
        for (x, y, pixel) in raster.enumerate_pixels_mut() {
            *pixel = Luma([(batch.labels[[0, y as usize, x as usize, c]] * 255.) as u8]);
        }
        raster.save(dir.join(format!("label-{}.png", c)))?;
        if c > 0 {
            let mut kernel = GrayImage::new(w, h);
            for (x, y, pixel) in kernel.enumerate_pixels_mut() {
                *pixel = Luma([(batch.labels[[0, y as usize, x as usize, c]] > 0.) as u8]);
            }
            kernels.push(kernel);
        }
    }

    if let Some(mask) = &batch.masks {
        let mut raster = GrayImage::new(w, h);
        for (x, y, pixel) in raster.enumerate_pixels_mut() {
            *pixel = Luma([(mask[[0, y as usize, x as usize]] * 255.) as u8]);
        }
        raster.save(dir.join("mask.png"))?;
    }

    let expanded = expand::expand_kernels(&kernels, expand::MIN_COMPONENT_AREA);
    let max_label = expanded.pixels().map(|p| p.0[0]).max().unwrap_or(0).max(1);
    let mut raster = GrayImage::new(w, h);
    for (x, y, pixel) in raster.enumerate_pixels_mut() {
        let label = expanded.get_pixel(x, y).0[0];
        *pixel = Luma([(label * 255 / max_label) as u8]);
    }
    raster.save(dir.join("instances.png"))?;
    info!("wrote preview rasters to {}", dir.display());
    Ok(())
}
