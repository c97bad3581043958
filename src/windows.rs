/*
 * Meeting Companion Server - Window Scheduler
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

use std::collections::BTreeSet;

use crate::session::Session;

pub fn window_id_for(session_id: &str, start_ts_ms: i64, end_ts_ms: i64) -> String {
    format!("{}:{}:{}", session_id, start_ts_ms, end_ts_ms)
}

/// Advance the session's window cursor and return every `[start, end)`
/// interval that is fully elapsed at `limit`. Successive starts move by
/// the stride, so neighboring windows overlap by `window - stride`.
pub fn collect_due_windows(
    sess: &mut Session,
    limit: i64,
    window_ms: i64,
    stride_ms: i64,
) -> Vec<(i64, i64)> {
    let mut due = Vec::new();
    while sess.next_window_start_ts_ms + window_ms <= limit {
        let start = sess.next_window_start_ts_ms;
        due.push((start, start + window_ms));
        sess.next_window_start_ts_ms += stride_ms;
    }
    due
}

/// Already-emitted windows whose time bounds contain one of the newly
/// committed segments/frames that is absent from the window's recorded id
/// set. Returned in `window_id` order so revisions emit deterministically.
pub fn affected_windows(
    sess: &Session,
    new_segment_ids: &BTreeSet<String>,
    new_frame_ids: &BTreeSet<String>,
) -> Vec<(i64, i64)> {
    let mut affected: BTreeSet<String> = BTreeSet::new();

    for (window_id, meta) in &sess.windows {
        for seg_id in new_segment_ids {
            if meta.segment_ids.contains(seg_id) {
                continue;
            }
            if let Some(seg) = sess.transcript_segments.get(seg_id) {
                if meta.start_ts_ms <= seg.start_ts_ms && seg.start_ts_ms <= meta.end_ts_ms {
                    affected.insert(window_id.clone());
                    break;
                }
            }
        }
        if affected.contains(window_id) {
            continue;
        }
        for frame_id in new_frame_ids {
            if meta.frame_ids.contains(frame_id) {
                continue;
            }
            if let Some(frame) = sess.captured_frames.get(frame_id) {
                if meta.start_ts_ms <= frame.ts_ms && frame.ts_ms <= meta.end_ts_ms {
                    affected.insert(window_id.clone());
                    break;
                }
            }
        }
    }

    affected
        .into_iter()
        .filter_map(|window_id| {
            sess.windows
                .get(&window_id)
                .map(|meta| (meta.start_ts_ms, meta.end_ts_ms))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use crate::types::{CapturedFrameMeta, DiffScore, Roi, TranscriptSeg, WindowMeta};

    fn session_with_start(started: i64) -> crate::session::SharedSession {
        SessionRegistry::new().ensure("s1", None, started).session
    }

    #[test]
    fn due_windows_advance_by_stride() {
        let shared = session_with_start(0);
        let mut sess = shared.lock();

        // window 10s, overlap 2s -> stride 8s
        assert!(collect_due_windows(&mut sess, 9_999, 10_000, 8_000).is_empty());
        let due = collect_due_windows(&mut sess, 26_000, 10_000, 8_000);
        assert_eq!(due, vec![(0, 10_000), (8_000, 18_000), (16_000, 26_000)]);
        assert_eq!(sess.next_window_start_ts_ms, 24_000);

        // Stride invariant between successive windows.
        for pair in due.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, 8_000);
        }
    }

    #[test]
    fn forced_limit_emits_final_partial_interval() {
        let shared = session_with_start(0);
        let mut sess = shared.lock();
        let due = collect_due_windows(&mut sess, 10_000, 10_000, 8_000);
        assert_eq!(due, vec![(0, 10_000)]);
    }

    #[test]
    fn late_segment_marks_containing_window_only() {
        let shared = session_with_start(0);
        let mut sess = shared.lock();
        sess.windows.insert(
            window_id_for("s1", 0, 10_000),
            WindowMeta {
                window_id: window_id_for("s1", 0, 10_000),
                start_ts_ms: 0,
                end_ts_ms: 10_000,
                revision: 1,
                segment_ids: BTreeSet::new(),
                frame_ids: BTreeSet::new(),
            },
        );
        sess.windows.insert(
            window_id_for("s1", 8_000, 18_000),
            WindowMeta {
                window_id: window_id_for("s1", 8_000, 18_000),
                start_ts_ms: 8_000,
                end_ts_ms: 18_000,
                revision: 1,
                segment_ids: BTreeSet::new(),
                frame_ids: BTreeSet::new(),
            },
        );
        sess.transcript_segments.insert(
            "s1:r1:s000".to_string(),
            TranscriptSeg {
                seg_id: "s1:r1:s000".to_string(),
                speaker: "SPEAKER_01".to_string(),
                offset: "00:05".to_string(),
                start_ts_ms: 5_000,
                end_ts_ms: None,
                text: "late arrival".to_string(),
                confidence: 1.0,
                record_id: 1,
            },
        );

        let mut new_ids = BTreeSet::new();
        new_ids.insert("s1:r1:s000".to_string());
        let affected = affected_windows(&sess, &new_ids, &BTreeSet::new());
        assert_eq!(affected, vec![(0, 10_000)]);
    }

    #[test]
    fn segment_already_recorded_does_not_mark_window() {
        let shared = session_with_start(0);
        let mut sess = shared.lock();
        let mut recorded = BTreeSet::new();
        recorded.insert("s1:r1:s000".to_string());
        sess.windows.insert(
            window_id_for("s1", 0, 10_000),
            WindowMeta {
                window_id: window_id_for("s1", 0, 10_000),
                start_ts_ms: 0,
                end_ts_ms: 10_000,
                revision: 1,
                segment_ids: recorded,
                frame_ids: BTreeSet::new(),
            },
        );
        sess.transcript_segments.insert(
            "s1:r1:s000".to_string(),
            TranscriptSeg {
                seg_id: "s1:r1:s000".to_string(),
                speaker: "SPEAKER_01".to_string(),
                offset: "00:05".to_string(),
                start_ts_ms: 5_000,
                end_ts_ms: None,
                text: "already counted".to_string(),
                confidence: 1.0,
                record_id: 1,
            },
        );

        let mut new_ids = BTreeSet::new();
        new_ids.insert("s1:r1:s000".to_string());
        assert!(affected_windows(&sess, &new_ids, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn late_frame_marks_overlapping_windows() {
        let shared = session_with_start(0);
        let mut sess = shared.lock();
        for (start, end) in [(0, 10_000), (8_000, 18_000)] {
            sess.windows.insert(
                window_id_for("s1", start, end),
                WindowMeta {
                    window_id: window_id_for("s1", start, end),
                    start_ts_ms: start,
                    end_ts_ms: end,
                    revision: 1,
                    segment_ids: BTreeSet::new(),
                    frame_ids: BTreeSet::new(),
                },
            );
        }
        sess.captured_frames.insert(
            "f1".to_string(),
            CapturedFrameMeta {
                frame_id: "f1".to_string(),
                ts_ms: 9_000,
                roi: Roi::full(640, 360),
                checksum: "abc".to_string(),
                uri: "/files/x".to_string(),
                diff_score: DiffScore {
                    hash_dist: 20.0,
                    ssim: 0.4,
                },
            },
        );

        let mut frame_ids = BTreeSet::new();
        frame_ids.insert("f1".to_string());
        let affected = affected_windows(&sess, &BTreeSet::new(), &frame_ids);
        // 9000 lies inside both overlapping windows.
        assert_eq!(affected.len(), 2);
    }
}
