/*
 * Meeting Companion Server - Batch STT Client
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

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{cleanup_text, format_mmss_from_ms, AudioRecordBlob, TranscriptSeg};

#[derive(Debug, thiserror::Error)]
pub enum AsrServiceError {
    #[error("ASR_URL not configured")]
    NotConfigured,

    #[error("ASR request failed: {0}")]
    Request(String),

    #[error("ASR error {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("Invalid ASR JSON response: {0}")]
    InvalidJson(String),
}

/// HTTP client for the external batch STT service. Batch records can be
/// long; the read timeout is generous on purpose.
pub struct AsrClient {
    client: reqwest::Client,
    asr_url: Option<String>,
}

impl AsrClient {
    pub fn new(asr_url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(1_800))
            .build()
            .context("Failed to build ASR HTTP client")?;
        Ok(Self { client, asr_url })
    }

    pub fn is_configured(&self) -> bool {
        self.asr_url.is_some()
    }

    /// POST a WAV file to `{ASR_URL}/transcribe` as multipart and return
    /// the raw JSON payload.
    pub async fn transcribe_wav(&self, wav_path: &Path) -> Result<Value, AsrServiceError> {
        let asr_url = self.asr_url.as_deref().ok_or(AsrServiceError::NotConfigured)?;

        let file_bytes = tokio::fs::read(wav_path)
            .await
            .map_err(|err| AsrServiceError::Request(format!("read {:?}: {}", wav_path, err)))?;
        let file_name = wav_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("record.wav")
            .to_string();

        let part = reqwest::multipart::Part::bytes(file_bytes)
            .file_name(file_name)
            .mime_str("audio/wav")
            .map_err(|err| AsrServiceError::Request(err.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(format!("{}/transcribe", asr_url))
            .multipart(form)
            .send()
            .await
            .map_err(|err| AsrServiceError::Request(err.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let detail = response.text().await.unwrap_or_default();
            return Err(AsrServiceError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| AsrServiceError::InvalidJson(err.to_string()))
    }
}

/// Write a record's PCM bytes as a single-channel 16 kHz signed-16 WAV
/// under the temp directory. The caller deletes the file after submission.
pub fn write_wav_record(
    temp_dir: &Path,
    session_id: &str,
    record: &AudioRecordBlob,
) -> Result<PathBuf> {
    let dir = temp_dir.join("realtime_audio").join(session_id);
    std::fs::create_dir_all(&dir).context("Failed to create record WAV directory")?;
    let path = dir.join(format!("record_{:06}.wav", record.record_id));

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::create(&path, spec).context("Failed to create WAV writer")?;
    for sample in record.pcm_bytes.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
            .context("Failed to write WAV sample")?;
    }
    writer.finalize().context("Failed to finalize WAV file")?;
    Ok(path)
}

/// Best-effort removal of the temp WAV and its session directory.
pub fn cleanup_wav_record(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        tracing::debug!("temp WAV cleanup failed for {:?}: {}", path, err);
    }
    if let Some(parent) = path.parent() {
        // Only removes the directory once it is empty.
        let _ = std::fs::remove_dir(parent);
    }
}

/// Parse `MM:SS` (optionally `H:MM:SS`, or a bare seconds integer) into ms.
pub fn parse_mmss_to_ms(raw: &str) -> Option<i64> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    let clock = Regex::new(r"^(?:(\d{1,2}):)?(\d{1,2}):(\d{2})$").expect("static regex");
    if let Some(caps) = clock.captures(value) {
        let hours: i64 = caps.get(1).map_or(0, |m| m.as_str().parse().unwrap_or(0));
        let minutes: i64 = caps[2].parse().unwrap_or(0);
        let seconds: i64 = caps[3].parse().unwrap_or(0);
        return Some((hours * 3_600 + minutes * 60 + seconds) * 1_000);
    }
    let bare_seconds = Regex::new(r"^\d{1,6}$").expect("static regex");
    if bare_seconds.is_match(value) {
        return value.parse::<i64>().ok().map(|secs| secs * 1_000);
    }
    None
}

/// Parse whisper-style `HH:MM:SS,mmm` (comma or dot separator) into ms.
pub fn parse_hhmmss_ms_to_ms(raw: &str) -> Option<i64> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    let pattern =
        Regex::new(r"^(?:(\d{1,2}):)?(\d{1,2}):(\d{2})(?:[.,](\d{1,3}))?$").expect("static regex");
    let caps = pattern.captures(value)?;
    let hours: i64 = caps.get(1).map_or(0, |m| m.as_str().parse().unwrap_or(0));
    let minutes: i64 = caps[2].parse().unwrap_or(0);
    let seconds: i64 = caps[3].parse().unwrap_or(0);
    let millis: i64 = caps
        .get(4)
        .map(|m| format!("{:0<3}", m.as_str()).parse().unwrap_or(0))
        .unwrap_or(0);
    Some((hours * 3_600 + minutes * 60 + seconds) * 1_000 + millis)
}

/// Coerce a numeric or string time value into milliseconds. Integers at or
/// above 1000 are already ms; smaller integers and all floats are seconds.
pub fn coerce_seconds_or_ms(value: &Value) -> Option<i64> {
    match value {
        Value::String(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Some(parsed) = parse_mmss_to_ms(trimmed) {
                return Some(parsed);
            }
            let numeric: f64 = trimmed.parse().ok()?;
            if numeric < 0.0 {
                return None;
            }
            Some((numeric * 1_000.0) as i64)
        }
        Value::Number(num) => {
            if let Some(int_value) = num.as_i64() {
                if int_value < 0 {
                    return None;
                }
                if int_value >= 1_000 {
                    Some(int_value)
                } else {
                    Some(int_value * 1_000)
                }
            } else {
                let float_value = num.as_f64()?;
                if float_value < 0.0 {
                    return None;
                }
                Some((float_value * 1_000.0) as i64)
            }
        }
        _ => None,
    }
}

fn as_object(value: Option<&Value>) -> Option<&Map<String, Value>> {
    value.and_then(Value::as_object)
}

fn segments_list(container: &Map<String, Value>) -> Option<Vec<Map<String, Value>>> {
    let list = container.get("segments")?.as_array()?;
    Some(
        list.iter()
            .filter_map(Value::as_object)
            .cloned()
            .collect::<Vec<_>>(),
    )
}

/// Convert a whisper.cpp `transcription[]` list into generic segments with
/// `start`/`end` in milliseconds.
fn convert_transcription(container: &Map<String, Value>) -> Option<Vec<Map<String, Value>>> {
    let list = container.get("transcription")?.as_array()?;
    let mut converted = Vec::new();
    for item in list.iter().filter_map(Value::as_object) {
        let text = cleanup_text(item.get("text").and_then(Value::as_str).unwrap_or(""));
        if text.is_empty() {
            continue;
        }
        let mut seg = Map::new();
        seg.insert("text".to_string(), Value::String(text));
        seg.insert(
            "speaker".to_string(),
            Value::String("SPEAKER_01".to_string()),
        );
        if let Some(offsets) = as_object(item.get("offsets")) {
            if let Some(from) = offsets.get("from") {
                if !from.is_null() {
                    seg.insert("start".to_string(), from.clone());
                }
            }
            if let Some(to) = offsets.get("to") {
                if !to.is_null() {
                    seg.insert("end".to_string(), to.clone());
                }
            }
        }
        if let Some(timestamps) = as_object(item.get("timestamps")) {
            if !seg.contains_key("start") {
                if let Some(parsed) = timestamps
                    .get("from")
                    .and_then(Value::as_str)
                    .and_then(parse_hhmmss_ms_to_ms)
                {
                    seg.insert("start".to_string(), Value::from(parsed));
                }
            }
            if !seg.contains_key("end") {
                if let Some(parsed) = timestamps
                    .get("to")
                    .and_then(Value::as_str)
                    .and_then(parse_hhmmss_ms_to_ms)
                {
                    seg.insert("end".to_string(), Value::from(parsed));
                }
            }
        }
        converted.push(seg);
    }
    if converted.is_empty() {
        None
    } else {
        Some(converted)
    }
}

/// Pull raw segment objects out of any accepted response shape: a flat
/// `segments[]`, the same nested under `data`/`result`, or a whisper.cpp
/// `transcription[]` list.
pub fn extract_asr_segments(payload: &Value) -> Vec<Map<String, Value>> {
    let Some(root) = payload.as_object() else {
        return Vec::new();
    };

    if let Some(found) = segments_list(root) {
        return found;
    }
    if let Some(found) = as_object(root.get("data")).and_then(segments_list) {
        return found;
    }
    if let Some(found) = as_object(root.get("result")).and_then(segments_list) {
        return found;
    }

    for container in [
        Some(root),
        as_object(root.get("data")),
        as_object(root.get("result")),
    ]
    .into_iter()
    .flatten()
    {
        if let Some(converted) = convert_transcription(container) {
            return converted;
        }
    }
    Vec::new()
}

/// Single-text fallback when no structured segments are present.
pub fn extract_asr_text(payload: &Value) -> String {
    let Some(root) = payload.as_object() else {
        return String::new();
    };

    for key in ["text", "transcript"] {
        if let Some(text) = root.get(key).and_then(Value::as_str) {
            let cleaned = cleanup_text(text);
            if !cleaned.is_empty() {
                return cleaned;
            }
        }
    }

    match root.get("result") {
        Some(Value::String(text)) => {
            let cleaned = cleanup_text(text);
            if !cleaned.is_empty() {
                return cleaned;
            }
        }
        Some(Value::Object(result)) => {
            for key in ["text", "transcript"] {
                if let Some(text) = result.get(key).and_then(Value::as_str) {
                    let cleaned = cleanup_text(text);
                    if !cleaned.is_empty() {
                        return cleaned;
                    }
                }
            }
        }
        _ => {}
    }

    if let Some(data) = as_object(root.get("data")) {
        for key in ["text", "transcript", "result"] {
            if let Some(text) = data.get(key).and_then(Value::as_str) {
                let cleaned = cleanup_text(text);
                if !cleaned.is_empty() {
                    return cleaned;
                }
            }
        }
    }

    String::new()
}

fn segment_relative_start_ms(seg: &Map<String, Value>) -> i64 {
    if let Some(offset) = seg.get("offset").and_then(Value::as_str) {
        if let Some(parsed) = parse_mmss_to_ms(offset) {
            return parsed;
        }
    }
    for key in ["start", "start_time", "time_start"] {
        if let Some(value) = seg.get(key) {
            if let Some(parsed) = coerce_seconds_or_ms(value) {
                return parsed;
            }
        }
    }
    0
}

fn segment_relative_end_ms(seg: &Map<String, Value>) -> Option<i64> {
    for key in ["end", "end_time", "time_end"] {
        if let Some(value) = seg.get(key) {
            if let Some(parsed) = coerce_seconds_or_ms(value) {
                return Some(parsed);
            }
        }
    }
    None
}

/// Normalize raw ASR segments into transcript segments with absolute
/// timestamps, ordered by `(start_ts_ms, seg_id)`.
pub fn normalize_asr_segments(
    session_id: &str,
    record: &AudioRecordBlob,
    payload: &Value,
) -> Vec<TranscriptSeg> {
    let raw_segments = extract_asr_segments(payload);
    let mut normalized = Vec::new();

    for (idx, seg) in raw_segments.iter().enumerate() {
        let text = ["text", "transcript", "sentence"]
            .iter()
            .find_map(|key| seg.get(*key).and_then(Value::as_str))
            .map(cleanup_text)
            .unwrap_or_default();
        if text.is_empty() {
            continue;
        }

        let speaker = ["speaker", "speaker_label", "spk"]
            .iter()
            .find_map(|key| seg.get(*key).and_then(Value::as_str))
            .map(cleanup_text)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "SPEAKER_01".to_string());

        let confidence = seg
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);

        let start_ms_rel = segment_relative_start_ms(seg);
        let start_ts_ms = record.start_ts_ms + start_ms_rel;
        let end_ts_ms = segment_relative_end_ms(seg)
            .map(|rel| record.start_ts_ms + rel)
            .map(|end| end.max(start_ts_ms));

        normalized.push(TranscriptSeg {
            seg_id: format!("{}:r{}:s{:03}", session_id, record.record_id, idx),
            speaker,
            offset: format_mmss_from_ms(start_ms_rel),
            start_ts_ms,
            end_ts_ms,
            text,
            confidence,
            record_id: record.record_id,
        });
    }

    normalized.sort_by(|a, b| {
        (a.start_ts_ms, a.seg_id.as_str()).cmp(&(b.start_ts_ms, b.seg_id.as_str()))
    });
    normalized
}

/// When normalization yields nothing but the payload carries a plain text
/// transcript, return one segment spanning the whole record.
pub fn fallback_text_segment(
    session_id: &str,
    record: &AudioRecordBlob,
    payload: &Value,
) -> Option<TranscriptSeg> {
    let text = extract_asr_text(payload);
    if text.is_empty() {
        return None;
    }
    Some(TranscriptSeg {
        seg_id: format!("{}:r{}:s000", session_id, record.record_id),
        speaker: "SPEAKER_01".to_string(),
        offset: "00:00".to_string(),
        start_ts_ms: record.start_ts_ms,
        end_ts_ms: Some(record.end_ts_ms),
        text,
        confidence: 1.0,
        record_id: record.record_id,
    })
}
