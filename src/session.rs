/*
 * Meeting Companion Server - Session Registry
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

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::audio::AudioRecorderState;
use crate::types::{
    AudioFormat, CapturedFrameMeta, PendingToolCall, Roi, SessionKind, SessionSnapshot,
    TranscriptSeg, WindowMeta,
};
use crate::video::VideoDetectorState;

/// All mutable state for one capture session. Owned by the registry,
/// guarded by a single session-scoped mutex held only across short
/// critical sections; async work happens outside the lock.
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub meeting_id: String,
    pub started_ts_ms: i64,
    pub meeting_type: String,
    pub session_kind: SessionKind,
    pub paused: bool,
    pub expected_audio: AudioFormat,
    pub audio: AudioRecorderState,
    pub video: VideoDetectorState,
    pub roi: Option<Roi>,
    pub next_window_start_ts_ms: i64,
    pub next_transcript_index: u64,
    pub transcript_segments: BTreeMap<String, TranscriptSeg>,
    pub captured_frames: BTreeMap<String, CapturedFrameMeta>,
    pub windows: BTreeMap<String, WindowMeta>,
    pub pending_tool_calls: HashMap<String, PendingToolCall>,
    pub last_activity_ts_ms: i64,
    pub stopped_ts_ms: Option<i64>,
}

impl Session {
    fn new(session_id: String, meeting_id: String, started_ts_ms: i64) -> Self {
        Self {
            session_id,
            meeting_id,
            started_ts_ms,
            meeting_type: "project_meeting".to_string(),
            session_kind: SessionKind::Meeting,
            paused: false,
            expected_audio: AudioFormat::default(),
            audio: AudioRecorderState::new(started_ts_ms),
            video: VideoDetectorState::default(),
            roi: None,
            next_window_start_ts_ms: started_ts_ms,
            next_transcript_index: 1,
            transcript_segments: BTreeMap::new(),
            captured_frames: BTreeMap::new(),
            windows: BTreeMap::new(),
            pending_tool_calls: HashMap::new(),
            last_activity_ts_ms: started_ts_ms,
            stopped_ts_ms: None,
        }
    }

    /// Setting a new ROI invalidates the video detector reference so the
    /// next sampled frame re-initializes against the new crop.
    pub fn set_roi(&mut self, roi: Roi) {
        if self.roi != Some(roi) {
            self.roi = Some(roi);
            self.video.reset_reference();
        }
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.last_activity_ts_ms = now_ms;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            meeting_id: self.meeting_id.clone(),
            started_ts_ms: self.started_ts_ms,
            paused: self.paused,
            current_record_id: self.audio.record_id,
            next_window_start_ts_ms: self.next_window_start_ts_ms,
            transcript_segments: self.transcript_segments.len(),
            captured_frames: self.captured_frames.len(),
            emitted_windows: self.windows.len(),
            pending_tool_calls: self.pending_tool_calls.len(),
            roi: self.roi,
        }
    }

    /// Segments in `[start_ts_ms, end_ts_ms]` ordered by `(start_ts_ms, seg_id)`.
    pub fn segments_in_range(&self, start_ts_ms: i64, end_ts_ms: i64) -> Vec<TranscriptSeg> {
        let mut segments: Vec<TranscriptSeg> = self
            .transcript_segments
            .values()
            .filter(|seg| start_ts_ms <= seg.start_ts_ms && seg.start_ts_ms <= end_ts_ms)
            .cloned()
            .collect();
        segments.sort_by(|a, b| {
            (a.start_ts_ms, a.seg_id.as_str()).cmp(&(b.start_ts_ms, b.seg_id.as_str()))
        });
        segments
    }

    /// Frames in `[start_ts_ms, end_ts_ms]` ordered by `(ts_ms, frame_id)`.
    pub fn frames_in_range(&self, start_ts_ms: i64, end_ts_ms: i64) -> Vec<CapturedFrameMeta> {
        let mut frames: Vec<CapturedFrameMeta> = self
            .captured_frames
            .values()
            .filter(|frame| start_ts_ms <= frame.ts_ms && frame.ts_ms <= end_ts_ms)
            .cloned()
            .collect();
        frames.sort_by(|a, b| (a.ts_ms, a.frame_id.as_str()).cmp(&(b.ts_ms, b.frame_id.as_str())));
        frames
    }
}

pub type SharedSession = Arc<Mutex<Session>>;

/// Outcome of an `ensure` call; the service refreshes the meeting kind
/// off the registry lock when the meeting link changed.
pub struct EnsureOutcome {
    pub session: SharedSession,
    pub created: bool,
    pub meeting_changed: bool,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Look up or lazily create a session. Creation initializes the audio
    /// rotator's record start and the window cursor to `now_ms`.
    pub fn ensure(&self, session_id: &str, meeting_id: Option<&str>, now_ms: i64) -> EnsureOutcome {
        {
            let sessions = self.sessions.read();
            if let Some(existing) = sessions.get(session_id) {
                let meeting_changed = {
                    let mut sess = existing.lock();
                    match meeting_id {
                        Some(meeting_id) if sess.meeting_id != meeting_id => {
                            sess.meeting_id = meeting_id.to_string();
                            true
                        }
                        _ => false,
                    }
                };
                return EnsureOutcome {
                    session: existing.clone(),
                    created: false,
                    meeting_changed,
                };
            }
        }

        let mut sessions = self.sessions.write();
        // Another ensure may have raced us between the read and write locks.
        if let Some(existing) = sessions.get(session_id) {
            return EnsureOutcome {
                session: existing.clone(),
                created: false,
                meeting_changed: false,
            };
        }
        let meeting_id = meeting_id.unwrap_or(session_id).to_string();
        let session = Arc::new(Mutex::new(Session::new(
            session_id.to_string(),
            meeting_id,
            now_ms,
        )));
        sessions.insert(session_id.to_string(), session.clone());
        EnsureOutcome {
            session,
            created: true,
            meeting_changed: true,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.write().remove(session_id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Sessions stopped longer ago than `idle_timeout_ms` with no
    /// in-flight records; candidates for teardown.
    pub fn expired_sessions(&self, now_ms: i64, idle_timeout_ms: i64) -> Vec<String> {
        let sessions = self.sessions.read();
        let mut expired = Vec::new();
        for (session_id, session) in sessions.iter() {
            let sess = session.lock();
            if let Some(stopped_ts) = sess.stopped_ts_ms {
                let idle_since = stopped_ts.max(sess.last_activity_ts_ms);
                if now_ms - idle_since >= idle_timeout_ms && sess.audio.inflight_records.is_empty()
                {
                    expired.push(session_id.clone());
                }
            }
        }
        expired
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_once_and_links_meeting() {
        let registry = SessionRegistry::new();
        let first = registry.ensure("s1", None, 1_000);
        assert!(first.created);
        {
            let sess = first.session.lock();
            assert_eq!(sess.meeting_id, "s1");
            assert_eq!(sess.audio.record_start_ts_ms, 1_000);
            assert_eq!(sess.next_window_start_ts_ms, 1_000);
        }

        let second = registry.ensure("s1", Some("m-42"), 2_000);
        assert!(!second.created);
        assert!(second.meeting_changed);
        assert_eq!(second.session.lock().meeting_id, "m-42");

        let third = registry.ensure("s1", Some("m-42"), 3_000);
        assert!(!third.meeting_changed);
    }

    #[test]
    fn range_queries_sort_by_time_then_id() {
        let registry = SessionRegistry::new();
        let ensured = registry.ensure("s1", None, 0);
        let mut sess = ensured.session.lock();
        for (seg_id, start) in [("s1:r1:s001", 500), ("s1:r1:s000", 500), ("s1:r2:s000", 900)] {
            sess.transcript_segments.insert(
                seg_id.to_string(),
                TranscriptSeg {
                    seg_id: seg_id.to_string(),
                    speaker: "SPEAKER_01".to_string(),
                    offset: "00:00".to_string(),
                    start_ts_ms: start,
                    end_ts_ms: None,
                    text: "hello".to_string(),
                    confidence: 1.0,
                    record_id: 1,
                },
            );
        }
        let in_range = sess.segments_in_range(0, 800);
        assert_eq!(in_range.len(), 2);
        assert_eq!(in_range[0].seg_id, "s1:r1:s000");
        assert_eq!(in_range[1].seg_id, "s1:r1:s001");
        drop(sess);
    }

    #[test]
    fn expired_sessions_require_stop_and_idle() {
        let registry = SessionRegistry::new();
        let ensured = registry.ensure("s1", None, 0);
        assert!(registry.expired_sessions(1_000_000, 1_000).is_empty());

        ensured.session.lock().stopped_ts_ms = Some(1_000);
        assert_eq!(registry.expired_sessions(500_000, 1_000), vec!["s1"]);
        assert!(registry.expired_sessions(1_500, 1_000).is_empty());
    }
}
