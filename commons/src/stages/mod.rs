//! Seam for the two model stages. The pipeline only needs their cost and an
//! output tensor, so the built-in stages are deterministic stand-ins with a
//! fixed simulated latency; real backends implement the same trait.

use std::time::Duration;

use anyhow::{ensure, Result};
use log::debug;
use ndarray::{Array2, ArrayD, ArrayViewD, Axis, IxDyn};

pub trait InferenceStage: Send + Sync {
    fn name(&self) -> &str;

    fn infer(&self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>>;
}

/// Detection-style stage: `(1, C, H, W)` image in, `(K, 6)` rows of
/// `[x1, y1, x2, y2, score, class]` out.
pub struct SyntheticDetector {
    latency: Duration,
    max_detections: usize,
}

impl SyntheticDetector {
    pub fn new(latency: Duration, max_detections: usize) -> Self {
        Self {
            latency,
            max_detections,
        }
    }
}

impl InferenceStage for SyntheticDetector {
    fn name(&self) -> &str {
        "detector"
    }

    fn infer(&self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        ensure!(
            input.ndim() == 4,
            "detector expects (1, C, H, W), got {:?}",
            input.shape()
        );
        std::thread::sleep(self.latency);

        let (height, width) = (input.shape()[2] as f32, input.shape()[3] as f32);
        let brightness = input.mean().unwrap_or(0.0);
        let k = self.max_detections;
        let detections = Array2::from_shape_fn((k, 6), |(i, j)| {
            let frac = (i + 1) as f32 / (k + 1) as f32;
            match j {
                0 => frac * width * 0.5,
                1 => frac * height * 0.5,
                2 => frac * width * 0.5 + width * 0.25,
                3 => frac * height * 0.5 + height * 0.25,
                4 => brightness * (1.0 - frac),
                _ => (i % 80) as f32,
            }
        });
        debug!("{} produced {} candidate region(s)", self.name(), k);
        Ok(detections.into_dyn())
    }
}

/// Classification-style stage: `(N, C, H, W)` crops in, `(N, classes)` logits
/// out, computed from per-channel means through a fixed projection.
pub struct SyntheticClassifier {
    latency: Duration,
    num_classes: usize,
}

impl SyntheticClassifier {
    pub fn new(latency: Duration, num_classes: usize) -> Self {
        Self {
            latency,
            num_classes,
        }
    }
}

impl InferenceStage for SyntheticClassifier {
    fn name(&self) -> &str {
        "classifier"
    }

    fn infer(&self, input: ArrayViewD<f32>) -> Result<ArrayD<f32>> {
        ensure!(
            input.ndim() == 4,
            "classifier expects (N, C, H, W), got {:?}",
            input.shape()
        );
        std::thread::sleep(self.latency);

        let batch = input.shape()[0];
        let channels = input.shape()[1];
        let mut logits = ArrayD::<f32>::zeros(IxDyn(&[batch, self.num_classes]));
        for (n, sample) in input.axis_iter(Axis(0)).enumerate() {
            let pooled: Vec<f32> = sample
                .axis_iter(Axis(0))
                .map(|plane| plane.mean().unwrap_or(0.0))
                .collect();
            for class in 0..self.num_classes {
                logits[[n, class]] = pooled
                    .iter()
                    .enumerate()
                    .map(|(c, v)| v * (((class * channels + c) % 17) as f32 - 8.0) / 8.0)
                    .sum();
            }
        }
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_detector_output_shape() {
        let detector = SyntheticDetector::new(Duration::ZERO, 5);
        let image = Array4::<f32>::from_elem((1, 3, 48, 64), 0.5).into_dyn();
        let out = detector.infer(image.view()).unwrap();
        assert_eq!(out.shape(), &[5, 6]);
        assert!(out[[0, 2]] <= 64.0);
    }

    #[test]
    fn test_classifier_is_deterministic() {
        let classifier = SyntheticClassifier::new(Duration::ZERO, 10);
        let crops = Array4::<f32>::from_shape_fn((2, 3, 4, 4), |(n, c, y, x)| {
            (n + c + y + x) as f32 * 0.1
        })
        .into_dyn();
        let a = classifier.infer(crops.view()).unwrap();
        let b = classifier.infer(crops.view()).unwrap();
        assert_eq!(a.shape(), &[2, 10]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_stages_reject_wrong_rank() {
        let flat = ArrayD::<f32>::zeros(IxDyn(&[12]));
        assert!(SyntheticDetector::new(Duration::ZERO, 1)
            .infer(flat.view())
            .is_err());
        assert!(SyntheticClassifier::new(Duration::ZERO, 1)
            .infer(flat.view())
            .is_err());
    }
}
