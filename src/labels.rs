use crate::polygon;
use anyhow::anyhow;
use image::{GrayImage, Luma};
use imageproc::drawing;
use imageproc::point::Point;
use itertools::izip;
use std::iter;
use std::str::FromStr;

/// Which tag character marks an instance as non-evaluable text. The record
/// builder derives `'1'` from the `"###"` transcription, so `One` is the
/// default; `Zero` inverts the convention for datasets encoded the other way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreTag {
    Zero,
    One,
}

impl IgnoreTag {
    pub fn is_ignored(self, tag: char) -> bool {
        match self {
            IgnoreTag::Zero => tag == '0',
            IgnoreTag::One => tag == '1',
        }
    }
}

impl Default for IgnoreTag {
    fn default() -> Self {
        IgnoreTag::One
    }
}

impl FromStr for IgnoreTag {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "0" => Ok(IgnoreTag::Zero),
            "1" => Ok(IgnoreTag::One),
            _ => Err(anyhow!(
                "ignore tag should be in (\"0\", \"1\"), got {:?}",
                value
            )),
        }
    }
}

/// Per-sample segmentation targets. `text` carries 1-based instance ids
/// (saturating at 255), `mask` is 1 where loss applies and 0 over ignored
/// instances, `kernels` hold the shrunk unions in increasing-shrink order.
#[derive(Debug, Clone)]
pub struct GroundTruth {
    pub text: GrayImage,
    pub mask: GrayImage,
    pub kernels: Vec<GrayImage>,
}

pub fn kernel_rate(kernel_num: usize, min_scale: f64, level: usize) -> f64 {
    1. - (1. - min_scale) / (kernel_num as f64 - 1.) * level as f64
}

/// Rasterizes pixel-space polygons into the ground truth set. Later instances
/// draw over earlier ones in `text`; the output always has the requested
/// dimensions, an empty batch just leaves the canvases untouched.
pub fn build_ground_truth(
    bboxes: &[Vec<Point<i32>>],
    tags: &str,
    ignore_tag: IgnoreTag,
    height: u32,
    width: u32,
    kernel_num: usize,
    min_scale: f64,
) -> GroundTruth {
    let mut text = GrayImage::new(width, height);
    let mut mask = GrayImage::from_pixel(width, height, Luma([1]));
    for (pos, (poly, tag)) in izip!(bboxes, tags.chars().chain(iter::repeat(' '))).enumerate() {
        let instance_id = (pos + 1).min(255) as u8;
        draw_filled(&mut text, poly, Luma([instance_id]));
        if ignore_tag.is_ignored(tag) {
            draw_filled(&mut mask, poly, Luma([0]));
        }
    }
    let mut kernels = Vec::with_capacity(kernel_num.saturating_sub(1));
    for level in 1..kernel_num {
        let rate = kernel_rate(kernel_num, min_scale, level);
        let mut kernel = GrayImage::new(width, height);
        for poly in polygon::shrink_boxes(bboxes, rate) {
            draw_filled(&mut kernel, &poly, Luma([1]));
        }
        kernels.push(kernel);
    }
    GroundTruth {
        text,
        mask,
        kernels,
    }
}

// draw_polygon_mut refuses a closed point list, so drop duplicated points
// and skip anything without enough left to fill.
fn draw_filled(canvas: &mut GrayImage, points: &[Point<i32>], color: Luma<u8>) {
    let mut points = points.to_vec();
    points.dedup();
    while points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    if points.len() < 3 {
        return;
    }
    drawing::draw_polygon_mut(canvas, &points, color);
}
