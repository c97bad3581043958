/*
 * Meeting Companion Server - Video Change Detector
 * Copyright (c) 2024 Meeting Companion Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};

use crate::config::PipelineConfig;
use crate::types::Roi;

/// Per-session detector state. The reference frame is the last confirmed
/// (or first sampled) detection frame, kept as raw grayscale bytes.
#[derive(Debug, Default)]
pub struct VideoDetectorState {
    pub last_sample_ts_ms: i64,
    pub ref_hash: Option<u64>,
    pub ref_small_bytes: Option<Vec<u8>>,
    pub candidate_count: u32,
    pub last_confirm_ts_ms: i64,
}

impl VideoDetectorState {
    pub fn reset_reference(&mut self) {
        self.ref_hash = None;
        self.ref_small_bytes = None;
        self.candidate_count = 0;
    }

    /// Sampling gate: at most one frame per `video_sample_ms` is analyzed.
    /// Passing the gate stamps the sample time.
    pub fn should_sample(&mut self, now_ms: i64, video_sample_ms: i64) -> bool {
        if now_ms - self.last_sample_ts_ms < video_sample_ms {
            return false;
        }
        self.last_sample_ts_ms = now_ms;
        true
    }

    /// Advance the confirmation state machine with a freshly hashed frame.
    pub fn observe(
        &mut self,
        curr_hash: u64,
        detect_frame: &GrayImage,
        now_ms: i64,
        cfg: &PipelineConfig,
    ) -> DetectOutcome {
        let (Some(ref_hash), Some(ref_bytes)) = (self.ref_hash, self.ref_small_bytes.as_deref())
        else {
            self.ref_hash = Some(curr_hash);
            self.ref_small_bytes = Some(detect_frame.as_raw().clone());
            self.candidate_count = 0;
            return DetectOutcome::Initialized;
        };

        let hash_dist = hamming_distance(curr_hash, ref_hash);
        let in_cooldown = now_ms - self.last_confirm_ts_ms < cfg.cooldown_ms;
        if hash_dist > cfg.dhash_threshold && !in_cooldown {
            self.candidate_count += 1;
        } else {
            self.candidate_count = 0;
        }

        if self.candidate_count < cfg.candidate_ticks {
            return DetectOutcome::NoChange {
                candidate: hash_dist > cfg.dhash_threshold,
                hash_dist,
                ssim: 1.0,
            };
        }

        // Candidate streak reached: run the structural-similarity check.
        // The streak resets after every SSIM evaluation regardless of outcome.
        let ssim = ssim_gray(ref_bytes, detect_frame.as_raw());
        self.candidate_count = 0;
        if ssim < cfg.ssim_threshold {
            self.last_confirm_ts_ms = now_ms;
            self.ref_hash = Some(curr_hash);
            self.ref_small_bytes = Some(detect_frame.as_raw().clone());
            let confidence =
                (((hash_dist as f64 / 32.0) + (1.0 - ssim).max(0.0)) / 2.0).clamp(0.0, 1.0);
            DetectOutcome::Confirmed {
                hash_dist,
                ssim,
                confidence,
            }
        } else {
            DetectOutcome::NoChange {
                candidate: true,
                hash_dist,
                ssim,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectOutcome {
    Initialized,
    NoChange {
        candidate: bool,
        hash_dist: u32,
        ssim: f64,
    },
    Confirmed {
        hash_dist: u32,
        ssim: f64,
        confidence: f64,
    },
}

/// Crop to the session ROI clamped to the image, full frame when unset.
pub fn effective_roi(roi: Option<Roi>, img_w: u32, img_h: u32) -> Roi {
    match roi {
        Some(roi) => roi.clamped(img_w, img_h),
        None => Roi::full(img_w, img_h),
    }
}

pub fn crop_roi(image: &DynamicImage, roi: Roi) -> DynamicImage {
    image.crop_imm(roi.x, roi.y, roi.w, roi.h)
}

/// Grayscale detection frame at the configured size with a light blur to
/// suppress compression noise.
pub fn build_detection_frame(image: &DynamicImage, cfg: &PipelineConfig) -> GrayImage {
    let gray = image
        .resize_exact(cfg.detect_width, cfg.detect_height, FilterType::Triangle)
        .to_luma8();
    image::imageops::blur(&gray, 1.0)
}

/// 64-bit differential hash over a 9x8 grid: one bit per horizontal
/// neighbor comparison, row-major, MSB first.
pub fn dhash64(gray: &GrayImage) -> u64 {
    let small = image::imageops::resize(gray, 9, 8, FilterType::Triangle);
    let mut value: u64 = 0;
    for row in 0..8u32 {
        for col in 0..8u32 {
            let left = small.get_pixel(col, row).0[0];
            let right = small.get_pixel(col + 1, row).0[0];
            value = (value << 1) | u64::from(left > right);
        }
    }
    value
}

pub fn hamming_distance(lhs: u64, rhs: u64) -> u32 {
    (lhs ^ rhs).count_ones()
}

/// Global structural similarity over two equally sized grayscale buffers,
/// clamped to `[0, 1]`.
pub fn ssim_gray(a: &[u8], b: &[u8]) -> f64 {
    let n = a.len().min(b.len());
    if n <= 1 {
        return 1.0;
    }
    let a = &a[..n];
    let b = &b[..n];

    let mean_a = a.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let mean_b = b.iter().map(|&v| v as f64).sum::<f64>() / n as f64;

    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov_ab = 0.0;
    for idx in 0..n {
        let da = a[idx] as f64 - mean_a;
        let db = b[idx] as f64 - mean_b;
        var_a += da * da;
        var_b += db * db;
        cov_ab += da * db;
    }
    let denom = (n - 1).max(1) as f64;
    var_a /= denom;
    var_b /= denom;
    cov_ab /= denom;

    let c1 = (0.01f64 * 255.0).powi(2);
    let c2 = (0.03f64 * 255.0).powi(2);
    let numerator = (2.0 * mean_a * mean_b + c1) * (2.0 * cov_ab + c2);
    let denominator = (mean_a * mean_a + mean_b * mean_b + c1) * (var_a + var_b + c2);
    if denominator == 0.0 {
        return 1.0;
    }
    let score = numerator / denominator;
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}
