//! Region-of-interest preprocessing on the producer side: synthetic boxes,
//! bilinear crop-and-resize and per-channel normalization.
//!
//! Images are `(1, 3, H, W)` arrays with values in `[0, 1]`.

use std::path::Path;

use anyhow::{anyhow, ensure, Context, Result};
use ndarray::{s, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rand::Rng;
use rayon::prelude::*;

/// Box corners in input pixel coordinates, `x2`/`y2` exclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Reads interleaved 8-bit RGB (HWC) raw bytes into a `(1, 3, H, W)` image.
pub fn load_raw_rgb(path: impl AsRef<Path>, width: usize, height: usize) -> Result<Array4<f32>> {
    let path = path.as_ref();
    let bytes =
        std::fs::read(path).with_context(|| format!("reading raw image {}", path.display()))?;
    ensure!(
        bytes.len() == width * height * 3,
        "raw image {} holds {} bytes, expected {}x{}x3",
        path.display(),
        bytes.len(),
        width,
        height
    );
    let hwc = Array3::from_shape_vec((height, width, 3), bytes)?;
    let chw = hwc.permuted_axes([2, 0, 1]).mapv(|v| v as f32 / 255.0);
    Ok(chw.insert_axis(Axis(0)).as_standard_layout().into_owned())
}

/// Deterministic gradient image used when no input file is configured.
pub fn synthetic_image(width: usize, height: usize) -> Array4<f32> {
    Array4::from_shape_fn((1, 3, height, width), |(_, c, y, x)| {
        ((x + 2 * y + 37 * c) % 256) as f32 / 255.0
    })
}

/// Uniformly placed `box_w` x `box_h` boxes fully inside a `width` x `height` image.
pub fn generate_synthetic_boxes<R: Rng>(
    rng: &mut R,
    num_boxes: usize,
    height: usize,
    width: usize,
    box_w: usize,
    box_h: usize,
) -> Result<Vec<RoiBox>> {
    if width <= box_w || height <= box_h {
        return Err(anyhow!(
            "{}x{} boxes do not fit in a {}x{} image",
            box_w,
            box_h,
            width,
            height
        ));
    }
    Ok((0..num_boxes)
        .map(|_| {
            let x1 = rng.random_range(0..width - box_w);
            let y1 = rng.random_range(0..height - box_h);
            RoiBox {
                x1: x1 as f32,
                y1: y1 as f32,
                x2: (x1 + box_w) as f32,
                y2: (y1 + box_h) as f32,
            }
        })
        .collect())
}

// Bilinear sample with zero padding outside [-1, size], clamped at the border.
fn bilinear(plane: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
    let (height, width) = plane.dim();
    if y < -1.0 || y > height as f32 || x < -1.0 || x > width as f32 {
        return 0.0;
    }
    let (mut y, mut x) = (y.max(0.0), x.max(0.0));

    let mut y_low = y.floor() as usize;
    let y_high = if y_low >= height - 1 {
        y_low = height - 1;
        y = y_low as f32;
        y_low
    } else {
        y_low + 1
    };
    let mut x_low = x.floor() as usize;
    let x_high = if x_low >= width - 1 {
        x_low = width - 1;
        x = x_low as f32;
        x_low
    } else {
        x_low + 1
    };

    let (ly, lx) = (y - y_low as f32, x - x_low as f32);
    let (hy, hx) = (1.0 - ly, 1.0 - lx);
    hy * hx * plane[[y_low, x_low]]
        + hy * lx * plane[[y_low, x_high]]
        + ly * hx * plane[[y_high, x_low]]
        + ly * lx * plane[[y_high, x_high]]
}

fn crop_one(image: &ArrayView3<f32>, roi: &RoiBox, output: usize) -> Array3<f32> {
    // Pixel centers sit at +0.5, so shift corners by half a pixel.
    let start_x = roi.x1 - 0.5;
    let start_y = roi.y1 - 0.5;
    let bin_w = (roi.x2 - roi.x1) / output as f32;
    let bin_h = (roi.y2 - roi.y1) / output as f32;
    let grid_w = bin_w.ceil().max(1.0) as usize;
    let grid_h = bin_h.ceil().max(1.0) as usize;
    let samples = (grid_w * grid_h) as f32;

    let channels = image.len_of(Axis(0));
    Array3::from_shape_fn((channels, output, output), |(c, ph, pw)| {
        let plane = image.index_axis(Axis(0), c);
        let mut acc = 0.0;
        for iy in 0..grid_h {
            let y = start_y + ph as f32 * bin_h + (iy as f32 + 0.5) * bin_h / grid_h as f32;
            for ix in 0..grid_w {
                let x = start_x + pw as f32 * bin_w + (ix as f32 + 0.5) * bin_w / grid_w as f32;
                acc += bilinear(&plane, y, x);
            }
        }
        acc / samples
    })
}

/// Crops every box out of a `(1, C, H, W)` image and resizes it to
/// `output` x `output`, giving `(N, C, output, output)`. Boxes run in parallel.
pub fn roi_align(image: &Array4<f32>, boxes: &[RoiBox], output: usize) -> Result<Array4<f32>> {
    let (batch, channels, height, width) = image.dim();
    ensure!(batch == 1, "expected a single image, got batch of {}", batch);
    ensure!(height > 0 && width > 0, "empty image");
    ensure!(output > 0, "output size must be positive");
    if boxes.is_empty() {
        return Ok(Array4::zeros((0, channels, output, output)));
    }

    let plane = image.index_axis(Axis(0), 0);
    let crops: Vec<Array3<f32>> = boxes
        .par_iter()
        .map(|roi| crop_one(&plane, roi, output))
        .collect();
    let views: Vec<_> = crops.iter().map(|c| c.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

/// Applies `(x - mean[c]) / std[c]` per channel of an `(N, C, H, W)` tensor.
pub fn normalize(tensor: &mut Array4<f32>, mean: &[f32], std: &[f32]) -> Result<()> {
    let channels = tensor.len_of(Axis(1));
    ensure!(
        mean.len() == channels && std.len() == channels,
        "normalization expects {} channel statistics",
        channels
    );
    for c in 0..channels {
        let (m, sd) = (mean[c], std[c]);
        tensor
            .slice_mut(s![.., c, .., ..])
            .mapv_inplace(|x| (x - m) / sd);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_boxes_stay_inside_image() {
        let mut rng = StdRng::seed_from_u64(7);
        let boxes = generate_synthetic_boxes(&mut rng, 50, 480, 640, 100, 100).unwrap();
        assert_eq!(boxes.len(), 50);
        for b in boxes {
            assert!(b.x1 >= 0.0 && b.y1 >= 0.0);
            assert!(b.x2 <= 640.0 && b.y2 <= 480.0);
            assert_eq!(b.x2 - b.x1, 100.0);
            assert_eq!(b.y2 - b.y1, 100.0);
        }
    }

    #[test]
    fn test_boxes_too_large() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(generate_synthetic_boxes(&mut rng, 1, 50, 50, 100, 10).is_err());
    }

    #[test]
    fn test_roi_align_constant_image() {
        let image = Array4::from_elem((1, 3, 40, 60), 0.25f32);
        let boxes = [
            RoiBox {
                x1: 5.0,
                y1: 5.0,
                x2: 25.0,
                y2: 25.0,
            },
            RoiBox {
                x1: 30.0,
                y1: 10.0,
                x2: 50.0,
                y2: 30.0,
            },
        ];
        let crops = roi_align(&image, &boxes, 8).unwrap();
        assert_eq!(crops.dim(), (2, 3, 8, 8));
        assert!(crops.iter().all(|v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_roi_align_identity_crop_matches_pixels() {
        let image = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| (y * 4 + x) as f32);
        let full = [RoiBox {
            x1: 0.0,
            y1: 0.0,
            x2: 4.0,
            y2: 4.0,
        }];
        let crop = roi_align(&image, &full, 4).unwrap();
        assert_eq!(crop.index_axis(Axis(0), 0), image.index_axis(Axis(0), 0));
    }

    #[test]
    fn test_roi_align_empty_boxes() {
        let image = synthetic_image(32, 16);
        let crops = roi_align(&image, &[], 224).unwrap();
        assert_eq!(crops.dim(), (0, 3, 224, 224));
    }

    #[test]
    fn test_normalize_per_channel() {
        let mut tensor = Array4::from_elem((2, 3, 2, 2), 0.5f32);
        normalize(&mut tensor, &[0.5, 0.0, 1.0], &[1.0, 0.5, 0.25]).unwrap();
        assert!(tensor.slice(s![.., 0, .., ..]).iter().all(|&v| v == 0.0));
        assert!(tensor.slice(s![.., 1, .., ..]).iter().all(|&v| v == 1.0));
        assert!(tensor.slice(s![.., 2, .., ..]).iter().all(|&v| v == -2.0));

        assert!(normalize(&mut tensor, &[0.0], &[1.0]).is_err());
    }

    #[test]
    fn test_load_raw_rgb_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("img.raw");
        // 2x1 image: red pixel then blue pixel
        std::fs::write(&path, [255u8, 0, 0, 0, 0, 255]).unwrap();
        let image = load_raw_rgb(&path, 2, 1).unwrap();
        assert_eq!(image.dim(), (1, 3, 1, 2));
        assert_eq!(image[[0, 0, 0, 0]], 1.0);
        assert_eq!(image[[0, 2, 0, 0]], 0.0);
        assert_eq!(image[[0, 2, 0, 1]], 1.0);

        assert!(load_raw_rgb(&path, 3, 1).is_err());
    }
}
