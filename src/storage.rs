/*
 * Meeting Companion Server - Persistence Adapter
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
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::qna::{DocHit, DocRetriever};
use crate::recap::{RecapWindowPayload, TopicContext};
use crate::types::{
    cleanup_text, format_mmss_from_ms, AudioRecordBlob, CapturedFrameMeta, Citation, DiffScore,
    QueryScope, Roi, TierUsed, TranscriptSeg,
};

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS session_roi (
        session_id TEXT PRIMARY KEY,
        meeting_id TEXT,
        x INTEGER NOT NULL,
        y INTEGER NOT NULL,
        w INTEGER NOT NULL,
        h INTEGER NOT NULL,
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_session_roi_meeting ON session_roi(meeting_id)",
    "CREATE TABLE IF NOT EXISTS audio_record (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        meeting_id TEXT,
        record_id INTEGER NOT NULL,
        start_ts_ms INTEGER NOT NULL,
        end_ts_ms INTEGER NOT NULL,
        uri TEXT,
        format TEXT DEFAULT 'wav_pcm_s16le_16k_mono',
        checksum TEXT,
        status TEXT DEFAULT 'ready',
        asr_payload TEXT,
        created_at TEXT DEFAULT (datetime('now')),
        UNIQUE(session_id, record_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_audio_record_session ON audio_record(session_id, record_id)",
    "CREATE TABLE IF NOT EXISTS transcript_segment (
        seg_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        meeting_id TEXT,
        record_id INTEGER,
        speaker TEXT NOT NULL DEFAULT 'SPEAKER_01',
        \"offset\" TEXT,
        start_ts_ms INTEGER NOT NULL,
        end_ts_ms INTEGER,
        text TEXT NOT NULL,
        confidence REAL DEFAULT 1.0,
        created_at TEXT DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_transcript_segment_session_time
        ON transcript_segment(session_id, start_ts_ms)",
    "CREATE INDEX IF NOT EXISTS idx_transcript_segment_record
        ON transcript_segment(session_id, record_id)",
    "CREATE TABLE IF NOT EXISTS captured_frame (
        frame_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        meeting_id TEXT,
        ts_ms INTEGER NOT NULL,
        roi TEXT NOT NULL,
        checksum TEXT,
        uri TEXT NOT NULL,
        diff_score TEXT,
        capture_reason TEXT DEFAULT 'change_confirmed',
        created_at TEXT DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_captured_frame_session_time
        ON captured_frame(session_id, ts_ms)",
    "CREATE UNIQUE INDEX IF NOT EXISTS uq_captured_frame_session_checksum
        ON captured_frame(session_id, checksum) WHERE checksum IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS recap_window (
        id TEXT PRIMARY KEY,
        window_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        meeting_id TEXT,
        start_ts_ms INTEGER NOT NULL,
        end_ts_ms INTEGER NOT NULL,
        revision INTEGER NOT NULL DEFAULT 1,
        recap TEXT NOT NULL DEFAULT '[]',
        topics TEXT NOT NULL DEFAULT '[]',
        cheatsheet TEXT NOT NULL DEFAULT '[]',
        citations TEXT NOT NULL DEFAULT '[]',
        status TEXT DEFAULT 'ready',
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now')),
        UNIQUE(window_id, revision)
    )",
    "CREATE INDEX IF NOT EXISTS idx_recap_window_session_time
        ON recap_window(session_id, start_ts_ms)",
    "CREATE TABLE IF NOT EXISTS tool_call_proposal (
        proposal_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        meeting_id TEXT,
        query_id TEXT,
        reason TEXT,
        suggested_queries TEXT NOT NULL DEFAULT '[]',
        risk TEXT,
        approved INTEGER,
        constraints TEXT,
        status TEXT DEFAULT 'pending',
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_tool_call_proposal_session
        ON tool_call_proposal(session_id, created_at DESC)",
    "CREATE TABLE IF NOT EXISTS qna_event_log (
        id TEXT PRIMARY KEY,
        query_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        meeting_id TEXT,
        question TEXT NOT NULL,
        answer TEXT,
        tier_used TEXT,
        citations TEXT NOT NULL DEFAULT '[]',
        created_at TEXT DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_qna_event_log_session
        ON qna_event_log(session_id, created_at DESC)",
    "CREATE TABLE IF NOT EXISTS visual_event (
        id TEXT PRIMARY KEY,
        meeting_id TEXT,
        timestamp REAL,
        image_url TEXT,
        description TEXT,
        event_type TEXT,
        created_at TEXT DEFAULT (datetime('now')),
        updated_at TEXT DEFAULT (datetime('now'))
    )",
    "CREATE TABLE IF NOT EXISTS transcript_chunk (
        id TEXT PRIMARY KEY,
        meeting_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        speaker TEXT,
        text TEXT NOT NULL,
        time_start REAL NOT NULL,
        time_end REAL NOT NULL,
        is_final INTEGER NOT NULL DEFAULT 1,
        lang TEXT,
        confidence REAL,
        created_at TEXT DEFAULT (datetime('now'))
    )",
    "CREATE INDEX IF NOT EXISTS idx_transcript_chunk_meeting
        ON transcript_chunk(meeting_id, seq)",
];

/// Replay unit for frontend reconnects: one record's segments plus the
/// record's time bounds derived from them.
#[derive(Debug, Clone)]
pub struct ReplayRecord {
    pub record_id: u64,
    pub record_start_ts_ms: i64,
    pub record_end_ts_ms: i64,
    pub segments: Vec<TranscriptSeg>,
}

/// SQLite persistence adapter. Every write is idempotent and every
/// failure is logged and swallowed; a broken store must never stop live
/// event emission. Reads return `None` on failure so callers can fall
/// back to in-memory state.
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn connect(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .context("Invalid SQLite path")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::from_options(options).await
    }

    pub async fn connect_in_memory() -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").context("Invalid SQLite URI")?;
        // A single connection keeps the in-memory database alive and shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite")?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    async fn from_options(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// One-shot schema bootstrap; every statement is `IF NOT EXISTS`.
    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| format!("schema statement failed: {}", &statement[..40.min(statement.len())]))?;
        }
        Ok(())
    }

    fn log_write_err(op: &str, err: sqlx::Error) {
        tracing::warn!("persistence write skipped ({}): {}", op, err);
    }

    pub async fn upsert_session_roi(&self, session_id: &str, meeting_id: &str, roi: Roi) {
        let result = sqlx::query(
            "INSERT INTO session_roi (session_id, meeting_id, x, y, w, h)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (session_id) DO UPDATE SET
                meeting_id = excluded.meeting_id,
                x = excluded.x,
                y = excluded.y,
                w = excluded.w,
                h = excluded.h,
                updated_at = datetime('now')",
        )
        .bind(session_id)
        .bind(meeting_id)
        .bind(roi.x as i64)
        .bind(roi.y as i64)
        .bind(roi.w as i64)
        .bind(roi.h as i64)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            Self::log_write_err("session_roi", err);
        }
    }

    pub async fn upsert_audio_record(
        &self,
        session_id: &str,
        meeting_id: &str,
        record: &AudioRecordBlob,
        checksum: Option<&str>,
        status: &str,
        asr_payload: &serde_json::Value,
    ) {
        let payload_json = asr_payload.to_string();
        let result = sqlx::query(
            "INSERT INTO audio_record (
                id, session_id, meeting_id, record_id, start_ts_ms, end_ts_ms,
                uri, format, checksum, status, asr_payload
             )
             VALUES (?, ?, ?, ?, ?, ?, NULL, 'wav_pcm_s16le_16k_mono', ?, ?, ?)
             ON CONFLICT (session_id, record_id) DO UPDATE SET
                checksum = excluded.checksum,
                status = excluded.status,
                asr_payload = excluded.asr_payload",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(meeting_id)
        .bind(record.record_id as i64)
        .bind(record.start_ts_ms)
        .bind(record.end_ts_ms)
        .bind(checksum)
        .bind(status)
        .bind(payload_json)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            Self::log_write_err("audio_record", err);
        }
    }

    pub async fn insert_transcript_segments(
        &self,
        session_id: &str,
        meeting_id: &str,
        segments: &[TranscriptSeg],
    ) {
        for seg in segments {
            let result = sqlx::query(
                "INSERT INTO transcript_segment (
                    seg_id, session_id, meeting_id, record_id, speaker, \"offset\",
                    start_ts_ms, end_ts_ms, text, confidence
                 )
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (seg_id) DO NOTHING",
            )
            .bind(&seg.seg_id)
            .bind(session_id)
            .bind(meeting_id)
            .bind(seg.record_id as i64)
            .bind(&seg.speaker)
            .bind(&seg.offset)
            .bind(seg.start_ts_ms)
            .bind(seg.end_ts_ms)
            .bind(&seg.text)
            .bind(seg.confidence)
            .execute(&self.pool)
            .await;
            if let Err(err) = result {
                Self::log_write_err("transcript_segment", err);
            }
        }
    }

    /// Legacy mirror of a final segment in seconds-based coordinates.
    pub async fn mirror_transcript_chunk(
        &self,
        meeting_id: &str,
        seq: u64,
        seg: &TranscriptSeg,
        started_ts_ms: i64,
    ) {
        let time_start = ((seg.start_ts_ms - started_ts_ms) as f64 / 1000.0).max(0.0);
        let time_end =
            ((seg.end_ts_ms.unwrap_or(seg.start_ts_ms) - started_ts_ms) as f64 / 1000.0).max(0.0);
        let result = sqlx::query(
            "INSERT INTO transcript_chunk (
                id, meeting_id, seq, speaker, text, time_start, time_end,
                is_final, lang, confidence
             )
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, 'en', ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(meeting_id)
        .bind(seq as i64)
        .bind(&seg.speaker)
        .bind(&seg.text)
        .bind(time_start)
        .bind(time_end)
        .bind(seg.confidence)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            Self::log_write_err("transcript_chunk", err);
        }
    }

    /// Insert a captured frame; conflicts on `frame_id` or the
    /// `(session_id, checksum)` unique index are silently deduplicated.
    pub async fn insert_captured_frame(
        &self,
        session_id: &str,
        meeting_id: &str,
        frame: &CapturedFrameMeta,
    ) {
        let roi_json = serde_json::to_string(&frame.roi).unwrap_or_else(|_| "{}".to_string());
        let diff_json =
            serde_json::to_string(&frame.diff_score).unwrap_or_else(|_| "{}".to_string());
        let result = sqlx::query(
            "INSERT INTO captured_frame (
                frame_id, session_id, meeting_id, ts_ms, roi, checksum, uri,
                diff_score, capture_reason
             )
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'change_confirmed')
             ON CONFLICT DO NOTHING",
        )
        .bind(&frame.frame_id)
        .bind(session_id)
        .bind(meeting_id)
        .bind(frame.ts_ms)
        .bind(roi_json)
        .bind(&frame.checksum)
        .bind(&frame.uri)
        .bind(diff_json)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            Self::log_write_err("captured_frame", err);
        }
    }

    /// Lightweight timeline mirror for a confirmed slide change.
    pub async fn insert_visual_event(
        &self,
        meeting_id: &str,
        timestamp_sec: f64,
        image_url: &str,
    ) {
        let result = sqlx::query(
            "INSERT INTO visual_event (id, meeting_id, timestamp, image_url, description, event_type)
             VALUES (?, ?, ?, ?, 'slide/global change confirmed', 'slide_change')",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(meeting_id)
        .bind(timestamp_sec)
        .bind(image_url)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            Self::log_write_err("visual_event", err);
        }
    }

    pub async fn insert_recap_window(
        &self,
        session_id: &str,
        meeting_id: &str,
        payload: &RecapWindowPayload,
    ) {
        let recap = serde_json::to_string(&payload.recap).unwrap_or_else(|_| "[]".to_string());
        let topics = serde_json::to_string(&payload.topics).unwrap_or_else(|_| "[]".to_string());
        let cheatsheet =
            serde_json::to_string(&payload.cheatsheet).unwrap_or_else(|_| "[]".to_string());
        let citations =
            serde_json::to_string(&payload.citations).unwrap_or_else(|_| "[]".to_string());
        let result = sqlx::query(
            "INSERT INTO recap_window (
                id, window_id, session_id, meeting_id, start_ts_ms, end_ts_ms,
                revision, recap, topics, cheatsheet, citations, status
             )
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'ready')
             ON CONFLICT (window_id, revision) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&payload.window_id)
        .bind(session_id)
        .bind(meeting_id)
        .bind(payload.start_ts_ms)
        .bind(payload.end_ts_ms)
        .bind(payload.revision as i64)
        .bind(recap)
        .bind(topics)
        .bind(cheatsheet)
        .bind(citations)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            Self::log_write_err("recap_window", err);
        }
    }

    pub async fn insert_tool_call_proposal(
        &self,
        session_id: &str,
        meeting_id: &str,
        proposal_id: &str,
        query_id: &str,
        query: &str,
        reason: &str,
        risk: &str,
    ) {
        let suggested =
            serde_json::to_string(&vec![query]).unwrap_or_else(|_| "[]".to_string());
        let result = sqlx::query(
            "INSERT INTO tool_call_proposal (
                proposal_id, session_id, meeting_id, query_id, reason,
                suggested_queries, risk, status
             )
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending')
             ON CONFLICT (proposal_id) DO NOTHING",
        )
        .bind(proposal_id)
        .bind(session_id)
        .bind(meeting_id)
        .bind(query_id)
        .bind(reason)
        .bind(suggested)
        .bind(risk)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            Self::log_write_err("tool_call_proposal", err);
        }
    }

    pub async fn update_tool_call_proposal(
        &self,
        proposal_id: &str,
        approved: bool,
        constraints: &serde_json::Value,
    ) {
        let result = sqlx::query(
            "UPDATE tool_call_proposal
             SET approved = ?, constraints = ?, status = ?, updated_at = datetime('now')
             WHERE proposal_id = ?",
        )
        .bind(approved)
        .bind(constraints.to_string())
        .bind(if approved { "approved" } else { "rejected" })
        .bind(proposal_id)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            Self::log_write_err("tool_call_proposal_update", err);
        }
    }

    pub async fn insert_qna_event(
        &self,
        session_id: &str,
        meeting_id: &str,
        query_id: &str,
        question: &str,
        answer: &str,
        tier_used: TierUsed,
        citations: &[Citation],
    ) {
        let citations_json =
            serde_json::to_string(citations).unwrap_or_else(|_| "[]".to_string());
        let result = sqlx::query(
            "INSERT INTO qna_event_log (
                id, query_id, session_id, meeting_id, question, answer, tier_used, citations
             )
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(query_id)
        .bind(session_id)
        .bind(meeting_id)
        .bind(question)
        .bind(answer)
        .bind(tier_used.to_string())
        .bind(citations_json)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            Self::log_write_err("qna_event_log", err);
        }
    }

    fn segment_from_row(row: &sqlx::sqlite::SqliteRow, window_start_ts_ms: i64) -> Option<TranscriptSeg> {
        let text = cleanup_text(&row.try_get::<String, _>("text").ok()?);
        if text.is_empty() {
            return None;
        }
        let start_ts_ms: i64 = row.try_get("start_ts_ms").ok()?;
        let speaker = {
            let raw: Option<String> = row.try_get("speaker").ok()?;
            let cleaned = cleanup_text(&raw.unwrap_or_default());
            if cleaned.is_empty() {
                "SPEAKER_01".to_string()
            } else {
                cleaned
            }
        };
        let offset = {
            let raw: Option<String> = row.try_get("offset").ok()?;
            let cleaned = cleanup_text(&raw.unwrap_or_default());
            if cleaned.is_empty() {
                format_mmss_from_ms((start_ts_ms - window_start_ts_ms).max(0))
            } else {
                cleaned
            }
        };
        Some(TranscriptSeg {
            seg_id: row.try_get("seg_id").ok()?,
            speaker,
            offset,
            start_ts_ms,
            end_ts_ms: row.try_get("end_ts_ms").ok()?,
            text,
            confidence: row
                .try_get::<Option<f64>, _>("confidence")
                .ok()?
                .unwrap_or(1.0)
                .clamp(0.0, 1.0),
            record_id: row
                .try_get::<Option<i64>, _>("record_id")
                .ok()?
                .unwrap_or(0)
                .max(0) as u64,
        })
    }

    pub async fn load_window_segments(
        &self,
        session_id: &str,
        start_ts_ms: i64,
        end_ts_ms: i64,
    ) -> Option<Vec<TranscriptSeg>> {
        let rows = sqlx::query(
            "SELECT seg_id, speaker, \"offset\", start_ts_ms, end_ts_ms, text, confidence, record_id
             FROM transcript_segment
             WHERE session_id = ? AND start_ts_ms BETWEEN ? AND ?
             ORDER BY start_ts_ms ASC, seg_id ASC",
        )
        .bind(session_id)
        .bind(start_ts_ms)
        .bind(end_ts_ms)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => Some(
                rows.iter()
                    .filter_map(|row| Self::segment_from_row(row, start_ts_ms))
                    .collect(),
            ),
            Err(err) => {
                tracing::debug!("window segment load failed: {}", err);
                None
            }
        }
    }

    pub async fn load_window_frames(
        &self,
        session_id: &str,
        start_ts_ms: i64,
        end_ts_ms: i64,
    ) -> Option<Vec<CapturedFrameMeta>> {
        let rows = sqlx::query(
            "SELECT frame_id, ts_ms, roi, checksum, uri, diff_score
             FROM captured_frame
             WHERE session_id = ? AND ts_ms BETWEEN ? AND ?
             ORDER BY ts_ms ASC, frame_id ASC",
        )
        .bind(session_id)
        .bind(start_ts_ms)
        .bind(end_ts_ms)
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                tracing::debug!("window frame load failed: {}", err);
                return None;
            }
        };

        let mut frames = Vec::new();
        for row in rows {
            let Ok(frame_id) = row.try_get::<String, _>("frame_id") else {
                continue;
            };
            let Ok(ts_ms) = row.try_get::<i64, _>("ts_ms") else {
                continue;
            };
            let roi = row
                .try_get::<String, _>("roi")
                .ok()
                .and_then(|raw| serde_json::from_str::<Roi>(&raw).ok())
                .unwrap_or(Roi {
                    x: 0,
                    y: 0,
                    w: 1,
                    h: 1,
                });
            let diff_score = row
                .try_get::<Option<String>, _>("diff_score")
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str::<DiffScore>(&raw).ok())
                .unwrap_or(DiffScore {
                    hash_dist: 0.0,
                    ssim: 0.0,
                });
            frames.push(CapturedFrameMeta {
                frame_id,
                ts_ms,
                roi,
                checksum: row
                    .try_get::<Option<String>, _>("checksum")
                    .ok()
                    .flatten()
                    .unwrap_or_default(),
                uri: row
                    .try_get::<Option<String>, _>("uri")
                    .ok()
                    .flatten()
                    .unwrap_or_default(),
                diff_score,
            });
        }
        Some(frames)
    }

    /// Continuity hint: first topic of the most recent prior window.
    pub async fn load_topic_context(
        &self,
        session_id: &str,
        start_ts_ms: i64,
    ) -> Option<TopicContext> {
        let row = sqlx::query(
            "SELECT topics FROM recap_window
             WHERE session_id = ? AND start_ts_ms < ?
             ORDER BY start_ts_ms DESC, revision DESC
             LIMIT 1",
        )
        .bind(session_id)
        .bind(start_ts_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| tracing::debug!("topic context load failed: {}", err))
        .ok()??;

        let topics: serde_json::Value =
            serde_json::from_str(&row.try_get::<String, _>("topics").ok()?).ok()?;
        for item in topics.as_array()? {
            let topic_id = cleanup_text(item.get("topic_id")?.as_str().unwrap_or(""));
            if topic_id.is_empty() {
                continue;
            }
            let title = {
                let raw = cleanup_text(item.get("title").and_then(|t| t.as_str()).unwrap_or(""));
                if raw.is_empty() {
                    topic_id.clone()
                } else {
                    raw
                }
            };
            let start_t = item
                .get("start_t")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0);
            let end_t = item
                .get("end_t")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(start_t)
                .max(start_t);
            return Some(TopicContext {
                topic_id,
                title,
                start_t,
                end_t,
            });
        }
        None
    }

    /// Every persisted segment of a session grouped by record id, in
    /// record order, for frontend replay.
    pub async fn load_replay_records(&self, session_id: &str) -> Vec<ReplayRecord> {
        let rows = sqlx::query(
            "SELECT seg_id, speaker, \"offset\", start_ts_ms, end_ts_ms, text, confidence, record_id
             FROM transcript_segment
             WHERE session_id = ?
             ORDER BY start_ts_ms ASC, seg_id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                tracing::debug!("replay load failed: {}", err);
                return Vec::new();
            }
        };

        let mut grouped: std::collections::BTreeMap<u64, ReplayRecord> =
            std::collections::BTreeMap::new();
        for row in rows.iter() {
            let Some(seg) = Self::segment_from_row(row, 0) else {
                continue;
            };
            let record_id = if seg.record_id > 0 {
                seg.record_id
            } else {
                parse_record_id_from_seg_id(&seg.seg_id).unwrap_or(0)
            };
            let seg_end = seg.end_ts_ms.unwrap_or(seg.start_ts_ms);
            let entry = grouped.entry(record_id).or_insert_with(|| ReplayRecord {
                record_id,
                record_start_ts_ms: seg.start_ts_ms,
                record_end_ts_ms: seg_end,
                segments: Vec::new(),
            });
            entry.record_start_ts_ms = entry.record_start_ts_ms.min(seg.start_ts_ms);
            entry.record_end_ts_ms = entry.record_end_ts_ms.max(seg_end);
            entry.segments.push(seg);
        }
        grouped.into_values().collect()
    }

    /// Recent captures for a session, newest first.
    pub async fn list_captures(&self, session_id: &str, limit: i64) -> Vec<serde_json::Value> {
        let rows = sqlx::query(
            "SELECT frame_id, ts_ms, uri, roi, diff_score, capture_reason, created_at
             FROM captured_frame
             WHERE session_id = ?
             ORDER BY ts_ms DESC
             LIMIT ?",
        )
        .bind(session_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        rows.iter()
            .map(|row| {
                serde_json::json!({
                    "frame_id": row.try_get::<String, _>("frame_id").unwrap_or_default(),
                    "ts_ms": row.try_get::<i64, _>("ts_ms").unwrap_or_default(),
                    "uri": row.try_get::<Option<String>, _>("uri").ok().flatten(),
                    "roi": row
                        .try_get::<Option<String>, _>("roi")
                        .ok()
                        .flatten()
                        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok()),
                    "diff_score": row
                        .try_get::<Option<String>, _>("diff_score")
                        .ok()
                        .flatten()
                        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok()),
                    "capture_reason": row
                        .try_get::<Option<String>, _>("capture_reason")
                        .ok()
                        .flatten(),
                    "created_at": row.try_get::<Option<String>, _>("created_at").ok().flatten(),
                })
            })
            .collect()
    }

    /// Recent recap windows for a session, newest first.
    pub async fn list_windows(&self, session_id: &str, limit: i64) -> Vec<serde_json::Value> {
        let rows = sqlx::query(
            "SELECT window_id, start_ts_ms, end_ts_ms, revision, recap, topics, cheatsheet,
                    citations, created_at
             FROM recap_window
             WHERE session_id = ?
             ORDER BY start_ts_ms DESC, revision DESC
             LIMIT ?",
        )
        .bind(session_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        let json_column = |row: &sqlx::sqlite::SqliteRow, name: &str| {
            row.try_get::<Option<String>, _>(name)
                .ok()
                .flatten()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
                .unwrap_or(serde_json::Value::Array(Vec::new()))
        };
        rows.iter()
            .map(|row| {
                serde_json::json!({
                    "window_id": row.try_get::<String, _>("window_id").unwrap_or_default(),
                    "start_ts_ms": row.try_get::<i64, _>("start_ts_ms").unwrap_or_default(),
                    "end_ts_ms": row.try_get::<i64, _>("end_ts_ms").unwrap_or_default(),
                    "revision": row.try_get::<i64, _>("revision").unwrap_or_default(),
                    "recap": json_column(row, "recap"),
                    "topics": json_column(row, "topics"),
                    "cheatsheet": json_column(row, "cheatsheet"),
                    "citations": json_column(row, "citations"),
                    "created_at": row.try_get::<Option<String>, _>("created_at").ok().flatten(),
                })
            })
            .collect()
    }

    /// Meeting kind source; the `meeting` table belongs to the CRUD side
    /// of the system, so absence is expected and tolerated.
    pub async fn load_meeting_type(&self, meeting_id: &str) -> Option<String> {
        let row = sqlx::query("SELECT meeting_type FROM meeting WHERE id = ? LIMIT 1")
            .bind(meeting_id)
            .fetch_optional(&self.pool)
            .await
            .ok()??;
        let value = cleanup_text(&row.try_get::<Option<String>, _>("meeting_type").ok()?.unwrap_or_default());
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    pub async fn load_pending_proposal_scope(&self, proposal_id: &str) -> Option<QueryScope> {
        let row = sqlx::query(
            "SELECT status FROM tool_call_proposal WHERE proposal_id = ? LIMIT 1",
        )
        .bind(proposal_id)
        .fetch_optional(&self.pool)
        .await
        .ok()??;
        let status: String = row.try_get("status").ok()?;
        if status == "pending" {
            Some(QueryScope::default())
        } else {
            None
        }
    }
}

/// Tier-1 retrieval over the shared `knowledge_chunk` table. The actual
/// vector index lives in the document pipeline outside this core; here a
/// token LIKE-scan bounded to the meeting stands in, and a missing table
/// simply yields no hits.
pub struct SqlDocRetriever {
    pool: SqlitePool,
}

impl SqlDocRetriever {
    pub fn new(storage: &Storage) -> Self {
        Self {
            pool: storage.pool.clone(),
        }
    }
}

#[async_trait]
impl DocRetriever for SqlDocRetriever {
    async fn retrieve(&self, question: &str, meeting_id: &str) -> Result<Vec<DocHit>> {
        let token = question
            .split_whitespace()
            .max_by_key(|word| word.len())
            .unwrap_or("")
            .to_lowercase();
        if token.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT source, content FROM knowledge_chunk
             WHERE meeting_id = ? AND lower(content) LIKE ?
             LIMIT 5",
        )
        .bind(meeting_id)
        .bind(format!("%{}%", token))
        .fetch_all(&self.pool)
        .await;

        let rows = match rows {
            Ok(rows) => rows,
            // Missing table or schema drift: Tier-1 just has nothing.
            Err(err) => {
                tracing::debug!("tier1 retrieval unavailable: {}", err);
                return Ok(Vec::new());
            }
        };

        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(DocHit {
                    source: row.try_get::<Option<String>, _>("source").ok()?.unwrap_or_else(|| "doc".to_string()),
                    snippet: cleanup_text(&row.try_get::<String, _>("content").ok()?),
                })
            })
            .collect())
    }
}

pub fn parse_record_id_from_seg_id(seg_id: &str) -> Option<u64> {
    seg_id.split(':').find_map(|part| {
        part.strip_prefix('r')
            .filter(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|rest| rest.parse().ok())
    })
}
