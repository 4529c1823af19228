use crate::labels::GroundTruth;
use image::RgbImage;
use ndarray::{Array3, Array4};

/// One fully processed sample, ready for batching.
#[derive(Debug, Clone)]
pub struct ProcessedSample {
    pub image: RgbImage,
    pub gt: GroundTruth,
    pub filename: String,
}

impl ProcessedSample {
    pub fn is_valid(&self) -> bool {
        let (width, height) = self.image.dimensions();
        width > 0
            && height > 0
            && self.gt.text.dimensions() == (width, height)
            && self.gt.mask.dimensions() == (width, height)
            && self.gt.kernels.iter().all(|k| k.dimensions() == (width, height))
    }
}

/// Tensors for one training step. `labels` packs binarized text presence in
/// channel 0 and the kernels in channels 1..K; everything is zero-padded to
/// this batch's own max height/width.
#[derive(Debug)]
pub struct Batch {
    pub images: Array4<f32>,
    pub masks: Option<Array3<f32>>,
    pub labels: Array4<f32>,
    pub filenames: Vec<String>,
}

pub fn pad_batch(samples: &[ProcessedSample], kernel_num: usize, emit_mask: bool) -> Batch {
    let count = samples.len();
    let max_height = samples.iter().map(|s| s.image.height()).max().unwrap_or(0) as usize;
    let max_width = samples.iter().map(|s| s.image.width()).max().unwrap_or(0) as usize;
    let mut images = Array4::zeros((count, max_height, max_width, 3));
    let mut labels = Array4::zeros((count, max_height, max_width, kernel_num));
    let mut masks = if emit_mask {
        Some(Array3::zeros((count, max_height, max_width)))
    } else {
        None
    };
    for (n, sample) in samples.iter().enumerate() {
        for (x, y, pixel) in sample.image.enumerate_pixels() {
            for (c, value) in pixel.0.iter().enumerate() {
                images[[n, y as usize, x as usize, c]] = *value as f32;
            }
        }
        for (x, y, pixel) in sample.gt.text.enumerate_pixels() {
            labels[[n, y as usize, x as usize, 0]] = if pixel.0[0] > 0 { 1. } else { 0. };
        }
        for (level, kernel) in sample.gt.kernels.iter().take(kernel_num - 1).enumerate() {
            for (x, y, pixel) in kernel.enumerate_pixels() {
                labels[[n, y as usize, x as usize, level + 1]] =
                    if pixel.0[0] > 0 { 1. } else { 0. };
            }
        }
        if let Some(masks) = masks.as_mut() {
            for (x, y, pixel) in sample.gt.mask.enumerate_pixels() {
                masks[[n, y as usize, x as usize]] = if pixel.0[0] > 0 { 1. } else { 0. };
            }
        }
    }
    Batch {
        images,
        masks,
        labels,
        filenames: samples.iter().map(|s| s.filename.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{build_ground_truth, IgnoreTag};
    use image::Rgb;
    use imageproc::point::Point;

    fn sample(width: u32, height: u32, filename: &str) -> ProcessedSample {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 100, 50]));
        let poly = vec![
            Point::new(1, 1),
            Point::new(width as i32 - 2, 1),
            Point::new(width as i32 - 2, height as i32 - 2),
            Point::new(1, height as i32 - 2),
        ];
        let gt = build_ground_truth(&[poly], "0", IgnoreTag::One, height, width, 3, 0.5);
        ProcessedSample {
            image,
            gt,
            filename: String::from(filename),
        }
    }

    #[test]
    fn pad_batch_test() {
        // 10x10 and 14x8 rasters batch into max(10,14) x max(10,8)
        let samples = vec![sample(10, 10, "a"), sample(8, 14, "b")];
        let batch = pad_batch(&samples, 3, true);
        assert_eq!(batch.images.dim(), (2, 14, 10, 3));
        assert_eq!(batch.labels.dim(), (2, 14, 10, 3));
        assert_eq!(batch.masks.as_ref().unwrap().dim(), (2, 14, 10));
        assert_eq!(batch.filenames, vec!["a", "b"]);

        // inside each sample's extent the image carries its pixels
        assert!((batch.images[[0, 5, 5, 0]] - 200.).abs() < f32::EPSILON);
        assert!((batch.images[[1, 12, 5, 1]] - 100.).abs() < f32::EPSILON);
        // outside its extent everything is zero padding
        for c in 0..3 {
            assert_eq!(batch.images[[0, 12, 5, c]], 0.);
            assert_eq!(batch.images[[1, 5, 9, c]], 0.);
        }
        assert_eq!(batch.labels[[0, 12, 5, 0]], 0.);
        assert_eq!(batch.masks.as_ref().unwrap()[[1, 5, 9]], 0.);
    }

    #[test]
    fn pad_batch_test_label_channels() {
        let mut samples = vec![sample(12, 12, "a")];
        // a second instance overlapping the first gives text ids above 1
        let second = vec![
            Point::new(4, 4),
            Point::new(10, 4),
            Point::new(10, 10),
            Point::new(4, 10),
        ];
        let poly = vec![
            Point::new(1, 1),
            Point::new(10, 1),
            Point::new(10, 10),
            Point::new(1, 10),
        ];
        samples[0].gt = build_ground_truth(&[poly, second], "00", IgnoreTag::One, 12, 12, 3, 0.5);
        let batch = pad_batch(&samples, 3, false);
        assert!(batch.masks.is_none());
        // text id 2 still binarizes to 1.0 in channel 0
        assert_eq!(samples[0].gt.text.get_pixel(7, 7).0[0], 2);
        assert_eq!(batch.labels[[0, 7, 7, 0]], 1.);
        assert_eq!(batch.labels[[0, 0, 0, 0]], 0.);
        // kernel channels stay inside the text footprint
        for y in 0..12 {
            for x in 0..12 {
                for level in 1..3 {
                    if batch.labels[[0, y, x, level]] > 0. {
                        assert_eq!(batch.labels[[0, y, x, 0]], 1.);
                    }
                }
            }
        }
    }

    #[test]
    fn is_valid_test() {
        assert!(sample(10, 10, "ok").is_valid());

        let mut broken = sample(10, 10, "broken");
        broken.gt.mask = image::GrayImage::new(5, 5);
        assert!(!broken.is_valid());

        let empty = ProcessedSample {
            image: RgbImage::new(0, 0),
            gt: build_ground_truth(&[], "", IgnoreTag::One, 0, 0, 3, 0.5),
            filename: String::new(),
        };
        assert!(!empty.is_valid());
    }
}
