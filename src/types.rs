/*
 * Meeting Companion Server - Rust Edition
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

use serde::{Deserialize, Serialize};
use std::fmt;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Collapse inner whitespace runs and trim. Empty input stays empty.
pub fn cleanup_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_was_space = true;
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

pub fn format_mmss_from_ms(value_ms: i64) -> String {
    let total_sec = (value_ms / 1000).max(0);
    format!("{:02}:{:02}", total_sec / 60, total_sec % 60)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Roi {
    pub fn full(w: u32, h: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            w: w.max(1),
            h: h.max(1),
        }
    }

    /// Clamp the rectangle into an image of the given dimensions.
    pub fn clamped(&self, img_w: u32, img_h: u32) -> Self {
        let x = self.x.min(img_w.saturating_sub(1));
        let y = self.y.min(img_h.saturating_sub(1));
        let w = self.w.clamp(1, (img_w - x).max(1));
        let h = self.h.clamp(1, (img_h - y).max(1));
        Self { x, y, w, h }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Meeting,
    Course,
}

impl SessionKind {
    /// Derive the session kind from the external meeting type string.
    pub fn from_meeting_type(meeting_type: &str) -> Self {
        match cleanup_text(meeting_type).to_lowercase().as_str() {
            "study_session" | "course" | "learning" | "lesson" | "class" => SessionKind::Course,
            _ => SessionKind::Meeting,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Meeting => write!(f, "meeting"),
            SessionKind::Course => write!(f, "course"),
        }
    }
}

/// Audio format a session expects on its ingest channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub codec: String,
    pub sample_rate_hz: u32,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            codec: "pcm_s16le".to_string(),
            sample_rate_hz: 16000,
            channels: 1,
        }
    }
}

/// A finalized slice of raw PCM audio handed to the batch STT client.
#[derive(Debug, Clone)]
pub struct AudioRecordBlob {
    pub record_id: u64,
    pub start_ts_ms: i64,
    pub end_ts_ms: i64,
    pub pcm_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSeg {
    pub seg_id: String,
    pub speaker: String,
    pub offset: String,
    pub start_ts_ms: i64,
    pub end_ts_ms: Option<i64>,
    pub text: String,
    pub confidence: f64,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub record_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffScore {
    pub hash_dist: f64,
    pub ssim: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedFrameMeta {
    pub frame_id: String,
    pub ts_ms: i64,
    pub roi: Roi,
    pub checksum: String,
    pub uri: String,
    pub diff_score: DiffScore,
}

/// Bookkeeping for an emitted recap window; the id sets decide whether a
/// later emission becomes a new revision.
#[derive(Debug, Clone)]
pub struct WindowMeta {
    pub window_id: String,
    pub start_ts_ms: i64,
    pub end_ts_ms: i64,
    pub revision: u32,
    pub segment_ids: std::collections::BTreeSet<String>,
    pub frame_ids: std::collections::BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryScope {
    #[serde(default)]
    pub web_allowed: bool,
}

#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub proposal_id: String,
    pub query_id: String,
    pub query_text: String,
    pub scope: QueryScope,
    pub created_ts_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Citation {
    Transcript {
        seg_id: String,
        ts_ms: i64,
        speaker: String,
    },
    Image {
        frame_id: String,
        ts_ms: i64,
        uri: String,
    },
    Document {
        source: String,
        snippet: String,
    },
    Web {
        source: String,
        snippet: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierUsed {
    Tier0Session,
    Tier1Docs,
    Tier2Web,
    Blocked,
}

impl fmt::Display for TierUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierUsed::Tier0Session => write!(f, "tier0_session"),
            TierUsed::Tier1Docs => write!(f, "tier1_docs"),
            TierUsed::Tier2Web => write!(f, "tier2_web"),
            TierUsed::Blocked => write!(f, "blocked"),
        }
    }
}

/// Read-only structural summary of a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub meeting_id: String,
    pub started_ts_ms: i64,
    pub paused: bool,
    pub current_record_id: u64,
    pub next_window_start_ts_ms: i64,
    pub transcript_segments: usize,
    pub captured_frames: usize,
    pub emitted_windows: usize,
    pub pending_tool_calls: usize,
    pub roi: Option<Roi>,
}

/// Structured failures surfaced by the realtime service. The wire `code`
/// is what clients key on; none of these close the connection.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::Internal(_) => "server_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_text_collapses_whitespace() {
        assert_eq!(cleanup_text("  hello   world \n"), "hello world");
        assert_eq!(cleanup_text(""), "");
        assert_eq!(cleanup_text(" \t "), "");
    }

    #[test]
    fn format_mmss_handles_negative_and_minutes() {
        assert_eq!(format_mmss_from_ms(13_000), "00:13");
        assert_eq!(format_mmss_from_ms(62_000), "01:02");
        assert_eq!(format_mmss_from_ms(-500), "00:00");
    }

    #[test]
    fn roi_clamps_to_image_bounds() {
        let roi = Roi {
            x: 600,
            y: 20,
            w: 200,
            h: 400,
        };
        let clamped = roi.clamped(640, 360);
        assert_eq!(clamped.x, 600);
        assert_eq!(clamped.w, 40);
        assert_eq!(clamped.h, 340);
    }

    #[test]
    fn session_kind_from_meeting_type() {
        assert_eq!(
            SessionKind::from_meeting_type("study_session"),
            SessionKind::Course
        );
        assert_eq!(SessionKind::from_meeting_type("Lesson"), SessionKind::Course);
        assert_eq!(
            SessionKind::from_meeting_type("project_meeting"),
            SessionKind::Meeting
        );
        assert_eq!(SessionKind::from_meeting_type(""), SessionKind::Meeting);
    }
}
