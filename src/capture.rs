/*
 * Meeting Companion Server - Frame Capturer
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

use anyhow::Result;
use image::imageops::FilterType;
use image::{DynamicImage, ImageOutputFormat};
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::object_store::ObjectStore;
use crate::types::{CapturedFrameMeta, DiffScore, Roi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    Webp,
    Jpeg,
}

impl CaptureFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            CaptureFormat::Webp => "webp",
            CaptureFormat::Jpeg => "jpg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            CaptureFormat::Webp => "image/webp",
            CaptureFormat::Jpeg => "image/jpeg",
        }
    }
}

/// Normalize a confirmed frame to the capture size and encode it,
/// preferring WEBP with a JPEG fallback when the encoder refuses.
pub fn encode_capture(cropped: &DynamicImage, cfg: &PipelineConfig) -> (Vec<u8>, CaptureFormat) {
    let resized = cropped.resize_exact(cfg.capture_width, cfg.capture_height, FilterType::Triangle);
    // WEBP encoding rejects some color layouts; RGB8 is safe for both.
    let rgb = DynamicImage::ImageRgb8(resized.to_rgb8());

    let mut buf = Cursor::new(Vec::new());
    if rgb.write_to(&mut buf, ImageOutputFormat::WebP).is_ok() {
        return (buf.into_inner(), CaptureFormat::Webp);
    }

    let mut buf = Cursor::new(Vec::new());
    if rgb.write_to(&mut buf, ImageOutputFormat::Jpeg(90)).is_ok() {
        return (buf.into_inner(), CaptureFormat::Jpeg);
    }

    // Both encoders failing means a malformed frame; store raw RGB bytes
    // so the checksum/dedupe path still works.
    tracing::warn!("capture encode failed for both WEBP and JPEG");
    (rgb.into_bytes(), CaptureFormat::Jpeg)
}

pub fn checksum_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Encode, checksum, and persist a confirmed frame; returns the metadata
/// row recorded against the session.
pub async fn capture_frame(
    store: &Arc<dyn ObjectStore>,
    cfg: &PipelineConfig,
    session_id: &str,
    frame_id: &str,
    ts_ms: i64,
    cropped: &DynamicImage,
    roi: Roi,
    diff_score: DiffScore,
) -> Result<CapturedFrameMeta> {
    let (bytes, format) = {
        let cropped = cropped.clone();
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || encode_capture(&cropped, &cfg)).await?
    };
    let checksum = checksum_hex(&bytes);

    let key = format!(
        "realtime_captures/{}/{}.{}",
        session_id,
        frame_id,
        format.extension()
    );
    let stored_key = store
        .put_object(&key, &bytes, format.content_type())
        .await?;
    let uri = store.presign_get(&stored_key, 86_400).await?;

    Ok(CapturedFrameMeta {
        frame_id: frame_id.to_string(),
        ts_ms,
        roi,
        checksum,
        uri,
        diff_score,
    })
}
