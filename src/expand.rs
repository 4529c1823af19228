//! Progressive scale expansion. Instances are seeded as connected components
//! of the most shrunk kernel and grown breadth-first through each wider
//! kernel in turn, so instances that touch at full scale keep the separation
//! the kernels encode.

use image::{GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::VecDeque;

/// Components smaller than this many pixels are treated as noise.
pub const MIN_COMPONENT_AREA: u32 = 10;

const NEIGHBORS: [(i32, i32); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

/// Grows instance labels from the last kernel out to the first. Pixels keep
/// the label that reaches them first; growth never leaves the current
/// kernel's footprint.
pub fn expand_kernels(kernels: &[GrayImage], min_area: u32) -> Image<Luma<u32>> {
    let seed = match kernels.last() {
        Some(seed) => seed,
        None => return Image::new(0, 0),
    };
    let (width, height) = seed.dimensions();
    let mut labels = connected_components(seed, Connectivity::Four, Luma([0u8]));

    let max_label = labels.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    let mut areas = vec![0u32; max_label as usize + 1];
    for pixel in labels.pixels() {
        areas[pixel.0[0] as usize] += 1;
    }
    let mut queue = VecDeque::new();
    for y in 0..height {
        for x in 0..width {
            let label = labels.get_pixel(x, y).0[0];
            if label == 0 {
                continue;
            }
            if areas[label as usize] < min_area {
                labels.put_pixel(x, y, Luma([0]));
            } else {
                queue.push_back((x, y));
            }
        }
    }

    for kernel in kernels.iter().rev().skip(1) {
        let mut next = VecDeque::new();
        while let Some((x, y)) = queue.pop_front() {
            let label = labels.get_pixel(x, y).0[0];
            let mut is_edge = true;
            for &(dx, dy) in &NEIGHBORS {
                let nx = x as i32 + dx;
                let ny = y as i32 + dy;
                if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 {
                    continue;
                }
                let (nx, ny) = (nx as u32, ny as u32);
                if kernel.get_pixel(nx, ny).0[0] == 0 || labels.get_pixel(nx, ny).0[0] > 0 {
                    continue;
                }
                labels.put_pixel(nx, ny, Luma([label]));
                queue.push_back((nx, ny));
                is_edge = false;
            }
            // frontier pixels carry over to the next, wider kernel
            if is_edge {
                next.push_back((x, y));
            }
        }
        queue = next;
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::{self, IgnoreTag};
    use imageproc::point::Point;

    fn fill(image: &mut GrayImage, x0: u32, y0: u32, width: u32, height: u32) {
        for y in y0..y0 + height {
            for x in x0..x0 + width {
                image.put_pixel(x, y, Luma([1]));
            }
        }
    }

    #[test]
    fn expand_kernels_test_separate_instances() {
        let mut outer = GrayImage::new(30, 12);
        fill(&mut outer, 1, 1, 12, 10);
        fill(&mut outer, 17, 1, 12, 10);
        let mut seeds = GrayImage::new(30, 12);
        fill(&mut seeds, 5, 4, 3, 3);
        fill(&mut seeds, 21, 4, 3, 3);

        let map = expand_kernels(&[outer.clone(), seeds], 1);
        let left = map.get_pixel(2, 2).0[0];
        let right = map.get_pixel(18, 2).0[0];
        assert!(left > 0);
        assert!(right > 0);
        assert_ne!(left, right);
        for (kernel_px, label_px) in outer.pixels().zip(map.pixels()) {
            assert_eq!(kernel_px.0[0] > 0, label_px.0[0] > 0);
        }
    }

    #[test]
    fn expand_kernels_test_synthesized_kernels() {
        let square = |x0: i32| {
            vec![
                Point::new(x0, 2),
                Point::new(x0 + 10, 2),
                Point::new(x0 + 10, 12),
                Point::new(x0, 12),
            ]
        };
        let gt = labels::build_ground_truth(
            &[square(2), square(20)],
            "00",
            IgnoreTag::One,
            20,
            40,
            3,
            0.5,
        );
        let map = expand_kernels(&gt.kernels, MIN_COMPONENT_AREA);
        let left = map.get_pixel(7, 7).0[0];
        let right = map.get_pixel(25, 7).0[0];
        assert!(left > 0);
        assert!(right > 0);
        assert_ne!(left, right);
        // growth stops at the widest kernel
        for (kernel_px, label_px) in gt.kernels[0].pixels().zip(map.pixels()) {
            assert_eq!(kernel_px.0[0] > 0, label_px.0[0] > 0);
        }
    }

    #[test]
    fn expand_kernels_test_drops_small_components() {
        let mut seed = GrayImage::new(16, 16);
        fill(&mut seed, 4, 4, 2, 2);
        let outer = GrayImage::from_pixel(16, 16, Luma([1]));
        let map = expand_kernels(&[outer, seed], MIN_COMPONENT_AREA);
        assert!(map.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn expand_kernels_test_empty_input() {
        let map = expand_kernels(&[], MIN_COMPONENT_AREA);
        assert_eq!(map.dimensions(), (0, 0));
    }
}
