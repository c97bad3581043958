/*
 * Meeting Companion Server - Realtime Pipeline Service
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
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ai::{LlmClient, LlmError};
use crate::bus::{EventEnvelope, SessionBus};
use crate::capture;
use crate::config::Config;
use crate::object_store::{LocalFsStore, ObjectStore};
use crate::qna::{
    build_qa_prompt, normalize_doc_hits, search_tier0, web_citations, DocRetriever, HttpWebSearch,
    WebSearch, QA_SYSTEM_PROMPT,
};
use crate::recap::{RecapBuilder, TopicContext, WindowIdentity};
use crate::session::{SessionRegistry, SharedSession};
use crate::storage::{ReplayRecord, SqlDocRetriever, Storage};
use crate::stt::{
    cleanup_wav_record, fallback_text_segment, normalize_asr_segments, write_wav_record, AsrClient,
};
use crate::types::{
    cleanup_text, now_ms, AudioFormat, AudioRecordBlob, Citation, DiffScore, PendingToolCall,
    QueryScope, Roi, ServiceError, SessionKind, SessionSnapshot, TierUsed, TranscriptSeg,
    WindowMeta,
};
use crate::video::{
    build_detection_frame, crop_roi, dhash64, effective_roi, DetectOutcome,
};
use crate::windows::{affected_windows, collect_due_windows, window_id_for};

const PROPOSAL_REASON: &str =
    "Not enough in-session evidence; Tier-2 web search requires approval.";

/// Strip a `data:` URL prefix before decoding base64 payloads.
pub fn normalize_b64_payload(payload: &str) -> &str {
    let value = payload.trim();
    if value.to_lowercase().starts_with("data:") {
        if let Some((_, rest)) = value.split_once(',') {
            return rest.trim();
        }
    }
    value
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RoiInput {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

impl RoiInput {
    pub fn to_roi(self) -> Roi {
        Roi {
            x: self.x.max(0) as u32,
            y: self.y.max(0) as u32,
            w: self.w.max(1) as u32,
            h: self.h.max(1) as u32,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionControlPayload {
    pub action: String,
    #[serde(default)]
    pub meeting_id: Option<String>,
    #[serde(default)]
    pub roi: Option<RoiInput>,
    #[serde(default)]
    pub audio_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioChunkPayload {
    #[serde(default)]
    pub seq: u64,
    pub payload: String,
    #[serde(default)]
    pub ts_hint: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoFramePayload {
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub roi: Option<RoiInput>,
    #[serde(default)]
    pub image_b64: Option<String>,
    #[serde(default)]
    pub ts_hint: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserQueryPayload {
    #[serde(default)]
    pub query_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub scope: QueryScope,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproveToolCallPayload {
    pub proposal_id: String,
    pub approved: bool,
    #[serde(default)]
    pub constraints: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptIngestPayload {
    #[serde(default)]
    pub meeting_id: Option<String>,
    #[serde(default, alias = "text")]
    pub chunk: String,
    #[serde(default = "default_speaker")]
    pub speaker: String,
    #[serde(default)]
    pub time_start: f64,
    #[serde(default)]
    pub time_end: f64,
    #[serde(default = "default_true")]
    pub is_final: bool,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default)]
    pub question: Option<String>,
}

fn default_speaker() -> String {
    "SPEAKER_01".to_string()
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f64 {
    1.0
}

fn default_lang() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionControlAck {
    pub session_id: String,
    pub action: String,
    pub meeting_id: String,
    pub roi: Option<Roi>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AudioIngestAck {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_records: Option<usize>,
}

impl AudioIngestAck {
    fn paused() -> Self {
        Self {
            accepted: false,
            reason: Some("session_paused".to_string()),
            bytes: None,
            record_id: None,
            pending_records: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct VideoFrameAck {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialized: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_dist: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssim: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryAck {
    pub query_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier_used: Option<TierUsed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalAck {
    pub proposal_id: String,
    pub status: String,
}

/// The per-session realtime pipeline: audio rotation and batch STT, video
/// change detection and capture, window scheduling and recap emission, and
/// the tiered Q&A path. One instance owns every live session in the
/// process; external collaborators come in as injected components.
pub struct RealtimeService {
    pub config: Config,
    registry: SessionRegistry,
    bus: SessionBus,
    storage: Arc<Storage>,
    asr: Arc<AsrClient>,
    llm: Arc<LlmClient>,
    recap: RecapBuilder,
    object_store: Arc<dyn ObjectStore>,
    retriever: Arc<dyn DocRetriever>,
    web_search: Arc<dyn WebSearch>,
}

impl RealtimeService {
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let storage = Arc::new(
            Storage::connect(&config.database_path)
                .await
                .context("Failed to open companion database")?,
        );
        let retriever = Arc::new(SqlDocRetriever::new(&storage));
        let object_store = Arc::new(LocalFsStore::new(config.upload_dir.clone()));
        let web_search = Arc::new(HttpWebSearch::new(config.web_search_url.clone())?);
        Self::with_components(config, storage, object_store, retriever, web_search)
    }

    pub fn with_components(
        config: Config,
        storage: Arc<Storage>,
        object_store: Arc<dyn ObjectStore>,
        retriever: Arc<dyn DocRetriever>,
        web_search: Arc<dyn WebSearch>,
    ) -> Result<Arc<Self>> {
        let asr = Arc::new(AsrClient::new(config.asr_url.clone())?);
        let llm = Arc::new(LlmClient::new(config.llm.clone())?);
        let recap = RecapBuilder::new(llm.clone());
        Ok(Arc::new(Self {
            bus: SessionBus::new(config.bus_capacity),
            registry: SessionRegistry::new(),
            storage,
            asr,
            llm,
            recap,
            object_store,
            retriever,
            web_search,
            config,
        }))
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<EventEnvelope> {
        self.bus.subscribe(session_id)
    }

    /// Publish onto the session bus; an unknown session is logged and the
    /// event discarded.
    pub fn publish(&self, session_id: &str, event: &str, payload: Value) -> u64 {
        match self.bus.publish(session_id, event, payload) {
            Ok(envelope) => envelope.seq,
            Err(err) => {
                tracing::warn!("event '{}' dropped: {}", event, err);
                0
            }
        }
    }

    /// Look up or lazily create a session, refreshing the session kind
    /// from the external meeting type whenever the meeting link changes.
    pub async fn ensure_session(
        &self,
        session_id: &str,
        meeting_id: Option<&str>,
    ) -> SharedSession {
        let outcome = self.registry.ensure(session_id, meeting_id, now_ms());
        self.bus.ensure_channel(session_id);

        if outcome.meeting_changed {
            let linked_meeting = outcome.session.lock().meeting_id.clone();
            if let Some(meeting_type) = self.storage.load_meeting_type(&linked_meeting).await {
                let mut sess = outcome.session.lock();
                sess.session_kind = SessionKind::from_meeting_type(&meeting_type);
                sess.meeting_type = meeting_type;
            }
        }
        if outcome.created {
            let sess = outcome.session.lock();
            tracing::info!(
                "session created session_id={} meeting_id={} session_kind={}",
                sess.session_id,
                sess.meeting_id,
                sess.session_kind
            );
        }
        outcome.session
    }

    pub fn get_snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.registry
            .get(session_id)
            .map(|session| session.lock().snapshot())
    }

    pub async fn expected_audio(&self, session_id: &str) -> AudioFormat {
        let session = self.ensure_session(session_id, None).await;
        let format = session.lock().expected_audio.clone();
        format
    }

    pub async fn handle_session_control(
        self: &Arc<Self>,
        session_id: &str,
        payload: SessionControlPayload,
    ) -> Result<SessionControlAck, ServiceError> {
        let action = cleanup_text(&payload.action).to_lowercase();
        if !["start", "pause", "stop"].contains(&action.as_str()) {
            return Err(ServiceError::Validation(
                "session_control.action must be start/pause/stop".to_string(),
            ));
        }

        let meeting_id = payload
            .meeting_id
            .as_deref()
            .filter(|value| !value.is_empty())
            .unwrap_or(session_id)
            .to_string();
        let session = self.ensure_session(session_id, Some(&meeting_id)).await;

        let now = now_ms();
        let roi_to_persist;
        let flush_record;
        let ack;
        {
            let mut sess = session.lock();
            sess.touch(now);
            match action.as_str() {
                "start" => {
                    sess.paused = false;
                    sess.stopped_ts_ms = None;
                    if let Some(roi) = payload.roi {
                        sess.set_roi(roi.to_roi());
                    }
                    flush_record = None;
                }
                "pause" => {
                    sess.paused = true;
                    flush_record = sess.audio.flush(now);
                }
                _ => {
                    sess.paused = true;
                    sess.stopped_ts_ms = Some(now);
                    flush_record = sess.audio.flush(now);
                }
            }
            roi_to_persist = payload.roi.map(|_| (sess.meeting_id.clone(), sess.roi));
            ack = SessionControlAck {
                session_id: session_id.to_string(),
                action: action.clone(),
                meeting_id: sess.meeting_id.clone(),
                roi: sess.roi,
            };
        }

        if let Some((meeting, Some(roi))) = roi_to_persist {
            self.storage
                .upsert_session_roi(session_id, &meeting, roi)
                .await;
        }

        self.publish(
            session_id,
            "session_control_ack",
            json!({
                "session_id": ack.session_id,
                "action": ack.action,
                "meeting_id": ack.meeting_id,
                "roi": ack.roi,
            }),
        );

        if let Some(record) = flush_record {
            self.spawn_record_processing(session_id, record);
        }
        if action == "stop" {
            self.emit_due_windows(session_id, true, now_ms()).await;
        }

        Ok(ack)
    }

    pub async fn set_roi(self: &Arc<Self>, session_id: &str, roi: Roi) -> Result<(), ServiceError> {
        let session = self.ensure_session(session_id, None).await;
        let meeting_id = {
            let mut sess = session.lock();
            sess.set_roi(roi);
            sess.meeting_id.clone()
        };
        self.storage
            .upsert_session_roi(session_id, &meeting_id, roi)
            .await;
        self.publish(
            session_id,
            "roi_updated",
            json!({ "session_id": session_id, "roi": roi }),
        );
        Ok(())
    }

    pub async fn flush_session(self: &Arc<Self>, session_id: &str) -> Result<(), ServiceError> {
        let session = self.ensure_session(session_id, None).await;
        let now = now_ms();
        let record = {
            let mut sess = session.lock();
            sess.touch(now);
            sess.audio.flush(now)
        };
        if let Some(record) = record {
            self.spawn_record_processing(session_id, record);
        }
        self.emit_due_windows(session_id, true, now_ms()).await;
        Ok(())
    }

    pub async fn handle_audio_chunk(
        self: &Arc<Self>,
        session_id: &str,
        payload: AudioChunkPayload,
        now: i64,
    ) -> Result<AudioIngestAck, ServiceError> {
        let raw = payload.payload.trim();
        if raw.is_empty() {
            return Err(ServiceError::Validation(
                "audio_chunk.payload must be non-empty base64".to_string(),
            ));
        }
        let bytes = general_purpose::STANDARD
            .decode(normalize_b64_payload(raw))
            .map_err(|err| {
                ServiceError::Validation(format!("invalid audio_chunk.payload base64: {}", err))
            })?;
        self.handle_audio_chunk_bytes(session_id, &bytes, now).await
    }

    pub async fn handle_audio_chunk_bytes(
        self: &Arc<Self>,
        session_id: &str,
        bytes: &[u8],
        now: i64,
    ) -> Result<AudioIngestAck, ServiceError> {
        let session = self.ensure_session(session_id, None).await;
        if bytes.is_empty() {
            return Err(ServiceError::Validation(
                "audio chunk bytes are empty".to_string(),
            ));
        }

        let (finalized, current_record_id);
        {
            let mut sess = session.lock();
            if sess.paused {
                return Ok(AudioIngestAck::paused());
            }
            sess.touch(now);
            finalized = sess
                .audio
                .append_and_rotate(bytes, now, self.config.pipeline.record_ms);
            current_record_id = sess.audio.record_id;
        }

        let pending = finalized.len();
        for record in finalized {
            self.spawn_record_processing(session_id, record);
        }
        self.emit_due_windows(session_id, false, now).await;

        Ok(AudioIngestAck {
            accepted: true,
            reason: None,
            bytes: Some(bytes.len()),
            record_id: Some(current_record_id),
            pending_records: Some(pending),
        })
    }

    pub async fn handle_video_frame(
        self: &Arc<Self>,
        session_id: &str,
        payload: VideoFramePayload,
        now: i64,
    ) -> Result<VideoFrameAck, ServiceError> {
        let session = self.ensure_session(session_id, None).await;
        {
            let sess = session.lock();
            if sess.paused {
                return Ok(VideoFrameAck {
                    accepted: false,
                    reason: Some("session_paused".to_string()),
                    ..Default::default()
                });
            }
        }

        let frame_id = payload
            .frame_id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| format!("{}-frame-{}", session_id, now));
        let image_b64 = payload
            .image_b64
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                ServiceError::Validation("video_frame_meta.image_b64 is required".to_string())
            })?;
        let image_bytes = general_purpose::STANDARD
            .decode(normalize_b64_payload(&image_b64))
            .map_err(|err| {
                ServiceError::Validation(format!("invalid video frame base64: {}", err))
            })?;

        let image = tokio::task::spawn_blocking(move || image::load_from_memory(&image_bytes))
            .await
            .map_err(|err| ServiceError::Internal(err.into()))?
            .map_err(|err| {
                ServiceError::Validation(format!("cannot decode video frame: {}", err))
            })?;

        let roi;
        {
            let mut sess = session.lock();
            sess.touch(now);
            if let Some(incoming) = payload.roi {
                sess.set_roi(incoming.to_roi());
            }
            roi = effective_roi(sess.roi, image.width(), image.height());
            if !sess
                .video
                .should_sample(now, self.config.pipeline.video_sample_ms)
            {
                return Ok(VideoFrameAck {
                    accepted: true,
                    sampled: Some(false),
                    ..Default::default()
                });
            }
        }

        let pipeline = self.config.pipeline.clone();
        let (cropped, detect_frame, curr_hash) = tokio::task::spawn_blocking(move || {
            let cropped = crop_roi(&image, roi);
            let detect_frame = build_detection_frame(&cropped, &pipeline);
            let curr_hash = dhash64(&detect_frame);
            (cropped, detect_frame, curr_hash)
        })
        .await
        .map_err(|err| ServiceError::Internal(err.into()))?;

        let outcome = {
            let mut sess = session.lock();
            sess.video
                .observe(curr_hash, &detect_frame, now, &self.config.pipeline)
        };

        let (hash_dist, ssim, confidence) = match outcome {
            DetectOutcome::Initialized => {
                return Ok(VideoFrameAck {
                    accepted: true,
                    sampled: Some(true),
                    initialized: Some(true),
                    ..Default::default()
                });
            }
            DetectOutcome::NoChange {
                candidate,
                hash_dist,
                ssim,
            } => {
                return Ok(VideoFrameAck {
                    accepted: true,
                    sampled: Some(true),
                    candidate: Some(candidate),
                    hash_dist: Some(hash_dist),
                    ssim: Some(ssim),
                    ..Default::default()
                });
            }
            DetectOutcome::Confirmed {
                hash_dist,
                ssim,
                confidence,
            } => (hash_dist, ssim, confidence),
        };

        let diff_score = DiffScore {
            hash_dist: hash_dist as f64,
            ssim,
        };
        self.publish(
            session_id,
            "slide_change_event",
            json!({
                "ts_ms": now,
                "frame_id": frame_id,
                "confidence": confidence,
                "diff_score": diff_score,
                "roi": roi,
            }),
        );

        let meta = capture::capture_frame(
            &self.object_store,
            &self.config.pipeline,
            session_id,
            &frame_id,
            now,
            &cropped,
            roi,
            diff_score,
        )
        .await
        .map_err(ServiceError::Internal)?;

        let (meeting_id, started_ts_ms) = {
            let mut sess = session.lock();
            sess.captured_frames
                .insert(frame_id.clone(), meta.clone());
            (sess.meeting_id.clone(), sess.started_ts_ms)
        };
        self.storage
            .insert_captured_frame(session_id, &meeting_id, &meta)
            .await;
        self.storage
            .insert_visual_event(
                &meeting_id,
                ((meta.ts_ms - started_ts_ms) as f64 / 1000.0).max(0.0),
                &meta.uri,
            )
            .await;

        self.publish(
            session_id,
            "captured_frame_ready",
            json!({
                "ts_ms": meta.ts_ms,
                "frame_id": meta.frame_id,
                "uri": meta.uri,
                "roi": meta.roi,
                "reason": "change_confirmed",
            }),
        );

        self.emit_due_windows(session_id, false, now).await;
        let mut frame_ids = BTreeSet::new();
        frame_ids.insert(frame_id.clone());
        self.emit_revisions_for_late_data(session_id, &BTreeSet::new(), &frame_ids)
            .await;

        Ok(VideoFrameAck {
            accepted: true,
            sampled: Some(true),
            confirmed: Some(true),
            frame_id: Some(frame_id),
            uri: Some(meta.uri),
            ..Default::default()
        })
    }

    pub async fn handle_user_query(
        self: &Arc<Self>,
        session_id: &str,
        payload: UserQueryPayload,
    ) -> Result<QueryAck, ServiceError> {
        let session = self.ensure_session(session_id, None).await;
        let query = cleanup_text(&payload.text);
        if query.is_empty() {
            return Err(ServiceError::Validation(
                "user_query.text is required".to_string(),
            ));
        }
        let query_id = payload
            .query_id
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let allow_web = payload.scope.web_allowed;

        let (tier0_citations, transcript_window, meeting_id) = {
            let sess = session.lock();
            let (citations, window) = search_tier0(&sess, &query);
            (citations, window, sess.meeting_id.clone())
        };

        let tier1_citations = match self.retriever.retrieve(&query, &meeting_id).await {
            Ok(hits) => normalize_doc_hits(hits),
            Err(err) => {
                tracing::debug!("tier1 retrieval failed: {}", err);
                Vec::new()
            }
        };

        let mut citations = tier0_citations;
        citations.extend(tier1_citations.iter().cloned());

        if citations.is_empty() && !allow_web {
            let proposal_id = Uuid::new_v4().to_string();
            {
                let mut sess = session.lock();
                sess.pending_tool_calls.insert(
                    proposal_id.clone(),
                    PendingToolCall {
                        proposal_id: proposal_id.clone(),
                        query_id: query_id.clone(),
                        query_text: query.clone(),
                        scope: payload.scope.clone(),
                        created_ts_ms: now_ms(),
                    },
                );
            }
            self.storage
                .insert_tool_call_proposal(
                    session_id,
                    &meeting_id,
                    &proposal_id,
                    &query_id,
                    &query,
                    PROPOSAL_REASON,
                    "medium",
                )
                .await;
            self.publish(
                session_id,
                "tool_call_proposal",
                json!({
                    "proposal_id": proposal_id,
                    "reason": PROPOSAL_REASON,
                    "suggested_queries": [query],
                    "risk": "medium",
                }),
            );
            return Ok(QueryAck {
                query_id,
                status: "proposal_emitted".to_string(),
                proposal_id: Some(proposal_id),
                tier_used: None,
            });
        }

        let mut tier_used = TierUsed::Tier0Session;
        let mut rag_docs: Vec<Citation> = Vec::new();
        if !tier1_citations.is_empty() {
            tier_used = TierUsed::Tier1Docs;
            rag_docs = tier1_citations;
        }
        if allow_web && citations.is_empty() {
            let snippets = self
                .web_search
                .search(&query)
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!("web search failed: {}", err);
                    Vec::new()
                });
            let web = web_citations(&snippets);
            citations.extend(web.iter().cloned());
            tier_used = TierUsed::Tier2Web;
            rag_docs = web;
        }

        let answer = self.answer_question(&query, &transcript_window, &rag_docs).await;
        self.storage
            .insert_qna_event(
                session_id,
                &meeting_id,
                &query_id,
                &query,
                &answer,
                tier_used,
                &citations,
            )
            .await;
        self.publish(
            session_id,
            "qna_answer",
            json!({
                "query_id": query_id,
                "answer": answer,
                "citations": citations,
                "tier_used": tier_used,
            }),
        );

        Ok(QueryAck {
            query_id,
            status: "answered".to_string(),
            proposal_id: None,
            tier_used: Some(tier_used),
        })
    }

    pub async fn handle_tool_approval(
        self: &Arc<Self>,
        session_id: &str,
        payload: ApproveToolCallPayload,
    ) -> Result<ApprovalAck, ServiceError> {
        let session = self.ensure_session(session_id, None).await;
        let proposal_id = cleanup_text(&payload.proposal_id);
        if proposal_id.is_empty() {
            return Err(ServiceError::Validation(
                "approve_tool_call.proposal_id is required".to_string(),
            ));
        }

        let (proposal, meeting_id) = {
            let mut sess = session.lock();
            let proposal = sess.pending_tool_calls.remove(&proposal_id);
            (proposal, sess.meeting_id.clone())
        };
        let proposal = proposal.ok_or_else(|| {
            ServiceError::Validation("proposal_id not found".to_string())
        })?;

        self.storage
            .update_tool_call_proposal(&proposal_id, payload.approved, &payload.constraints)
            .await;

        if !payload.approved {
            let answer =
                "Web search was not approved. Answer remains constrained to session evidence.";
            self.storage
                .insert_qna_event(
                    session_id,
                    &meeting_id,
                    &proposal.query_id,
                    &proposal.query_text,
                    answer,
                    TierUsed::Blocked,
                    &[],
                )
                .await;
            self.publish(
                session_id,
                "qna_answer",
                json!({
                    "query_id": proposal.query_id,
                    "answer": answer,
                    "citations": [],
                    "tier_used": TierUsed::Blocked,
                }),
            );
            return Ok(ApprovalAck {
                proposal_id,
                status: "rejected".to_string(),
            });
        }

        let snippets = self
            .web_search
            .search(&proposal.query_text)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!("web search failed: {}", err);
                Vec::new()
            });
        let citations = web_citations(&snippets);
        let summary = if snippets.is_empty() {
            "No external result.".to_string()
        } else {
            snippets
                .iter()
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join("; ")
        };
        let answer = format!("Web tier executed after approval. {}", summary);

        self.storage
            .insert_qna_event(
                session_id,
                &meeting_id,
                &proposal.query_id,
                &proposal.query_text,
                &answer,
                TierUsed::Tier2Web,
                &citations,
            )
            .await;
        self.publish(
            session_id,
            "qna_answer",
            json!({
                "query_id": proposal.query_id,
                "answer": answer,
                "citations": citations,
                "tier_used": TierUsed::Tier2Web,
            }),
        );

        Ok(ApprovalAck {
            proposal_id,
            status: "approved_executed".to_string(),
        })
    }

    /// Test-channel transcript injection: validate, allocate a bus `seq`
    /// by publishing `transcript_event`, persist the final chunk.
    pub async fn ingest_transcript(
        self: &Arc<Self>,
        session_id: &str,
        payload: TranscriptIngestPayload,
    ) -> Result<u64, ServiceError> {
        let chunk = cleanup_text(&payload.chunk);
        if chunk.is_empty() {
            return Err(ServiceError::Validation(
                "chunk must be non-empty".to_string(),
            ));
        }
        if payload.time_end < payload.time_start {
            return Err(ServiceError::Validation(
                "time_end must be >= time_start".to_string(),
            ));
        }

        let session = self.ensure_session(session_id, None).await;
        let meeting_id = payload
            .meeting_id
            .clone()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| session.lock().meeting_id.clone());

        let seq = self.publish(
            session_id,
            "transcript_event",
            json!({
                "meeting_id": meeting_id,
                "chunk": chunk,
                "speaker": payload.speaker,
                "time_start": payload.time_start,
                "time_end": payload.time_end,
                "is_final": payload.is_final,
                "confidence": payload.confidence,
                "lang": payload.lang,
            }),
        );

        if payload.is_final {
            let seg = TranscriptSeg {
                seg_id: format!("{}:ingest:{}", session_id, seq),
                speaker: payload.speaker.clone(),
                offset: "00:00".to_string(),
                start_ts_ms: (payload.time_start * 1000.0) as i64,
                end_ts_ms: Some((payload.time_end * 1000.0) as i64),
                text: chunk,
                confidence: payload.confidence.clamp(0.0, 1.0),
                record_id: 0,
            };
            self.storage
                .mirror_transcript_chunk(&meeting_id, seq, &seg, 0)
                .await;
        }
        Ok(seq)
    }

    fn spawn_record_processing(self: &Arc<Self>, session_id: &str, record: AudioRecordBlob) {
        let service = self.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            service.process_audio_record(&session_id, record).await;
        });
    }

    /// Batch STT pipeline for one finalized record: WAV encode, submit,
    /// normalize, commit, persist, publish. Upstream failures still emit
    /// `transcript_record_ready` with the error attached.
    pub async fn process_audio_record(
        self: &Arc<Self>,
        session_id: &str,
        record: AudioRecordBlob,
    ) {
        let session = self.ensure_session(session_id, None).await;
        let claimed = {
            let mut sess = session.lock();
            sess.audio.claim_for_processing(record.record_id)
        };
        if !claimed {
            return;
        }

        let result = self.process_audio_record_inner(session_id, &record).await;

        {
            let mut sess = session.lock();
            sess.audio.release_inflight(record.record_id);
            if result.is_ok() {
                sess.audio.mark_processed(record.record_id);
            }
        }
        if let Err(err) = result {
            tracing::error!(
                "audio record processing failed session_id={} record_id={}: {}",
                session_id,
                record.record_id,
                err
            );
            self.publish(
                session_id,
                "error",
                json!({
                    "code": "audio_record_failed",
                    "message": err.to_string(),
                }),
            );
        }
    }

    async fn process_audio_record_inner(
        self: &Arc<Self>,
        session_id: &str,
        record: &AudioRecordBlob,
    ) -> Result<()> {
        let session = self.ensure_session(session_id, None).await;
        let (meeting_id, started_ts_ms) = {
            let sess = session.lock();
            (sess.meeting_id.clone(), sess.started_ts_ms)
        };

        tracing::info!(
            "batch ASR request session_id={} record_id={} bytes={}",
            session_id,
            record.record_id,
            record.pcm_bytes.len()
        );

        let asr_payload = if self.asr.is_configured() {
            match write_wav_record(&self.config.temp_dir, session_id, record) {
                Ok(wav_path) => {
                    let response = self.asr.transcribe_wav(&wav_path).await;
                    cleanup_wav_record(&wav_path);
                    match response {
                        Ok(payload) if payload.is_object() => payload,
                        Ok(other) => json!({ "segments": [], "raw": other }),
                        Err(err) => json!({ "error": err.to_string(), "segments": [] }),
                    }
                }
                Err(err) => json!({ "error": err.to_string(), "segments": [] }),
            }
        } else {
            json!({ "error": "ASR_URL not configured", "segments": [] })
        };

        let asr_error = asr_payload
            .get("error")
            .and_then(Value::as_str)
            .map(cleanup_text)
            .filter(|value| !value.is_empty());

        let mut segments = normalize_asr_segments(session_id, record, &asr_payload);
        if segments.is_empty() {
            if let Some(seg) = fallback_text_segment(session_id, record, &asr_payload) {
                segments.push(seg);
            }
        }

        if !segments.is_empty() {
            {
                let mut sess = session.lock();
                for seg in &segments {
                    sess.transcript_segments.insert(seg.seg_id.clone(), seg.clone());
                }
            }
            self.storage
                .insert_transcript_segments(session_id, &meeting_id, &segments)
                .await;
            for seg in &segments {
                let seq = {
                    let mut sess = session.lock();
                    let seq = sess.next_transcript_index;
                    sess.next_transcript_index += 1;
                    seq
                };
                self.storage
                    .mirror_transcript_chunk(&meeting_id, seq, seg, started_ts_ms)
                    .await;
            }

            let segment_ids: BTreeSet<String> =
                segments.iter().map(|seg| seg.seg_id.clone()).collect();
            self.emit_revisions_for_late_data(session_id, &segment_ids, &BTreeSet::new())
                .await;
        }

        let checksum = if record.pcm_bytes.is_empty() {
            None
        } else {
            let mut hasher = Sha256::new();
            hasher.update(&record.pcm_bytes);
            Some(hex::encode(hasher.finalize()))
        };
        let status = if asr_error.is_some() {
            "processed_temp_deleted_with_error"
        } else {
            "processed_temp_deleted"
        };
        self.storage
            .upsert_audio_record(
                session_id,
                &meeting_id,
                record,
                checksum.as_deref(),
                status,
                &asr_payload,
            )
            .await;

        self.publish(
            session_id,
            "transcript_record_ready",
            json!({
                "record_id": record.record_id,
                "record_start_ts_ms": record.start_ts_ms,
                "record_end_ts_ms": record.end_ts_ms,
                "uri": Value::Null,
                "segments": segments,
                "asr_error": asr_error,
            }),
        );
        if let Some(message) = &asr_error {
            self.publish(
                session_id,
                "error",
                json!({
                    "code": "batch_asr_failed",
                    "message": message,
                    "record_id": record.record_id,
                }),
            );
        }

        self.emit_due_windows(session_id, false, now_ms()).await;
        Ok(())
    }

    /// Emit every window whose end time has passed `limit`; a forced
    /// flush extends the limit to the rotator boundary so the final
    /// partial interval is covered.
    pub async fn emit_due_windows(self: &Arc<Self>, session_id: &str, force: bool, now: i64) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        let due = {
            let mut sess = session.lock();
            let limit = if force {
                now.max(sess.audio.record_start_ts_ms)
            } else {
                now
            };
            collect_due_windows(
                &mut sess,
                limit,
                self.config.pipeline.window_ms,
                self.config.pipeline.window_stride_ms(),
            )
        };
        for (start, end) in due {
            self.emit_window_payload(session_id, start, end).await;
        }
    }

    /// Re-emit already-published windows that newly contain one of the
    /// given segment/frame ids, bumping their revision.
    pub async fn emit_revisions_for_late_data(
        self: &Arc<Self>,
        session_id: &str,
        segment_ids: &BTreeSet<String>,
        frame_ids: &BTreeSet<String>,
    ) {
        if segment_ids.is_empty() && frame_ids.is_empty() {
            return;
        }
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        let affected = {
            let sess = session.lock();
            affected_windows(&sess, segment_ids, frame_ids)
        };
        for (start, end) in affected {
            self.emit_window_payload(session_id, start, end).await;
        }
    }

    async fn emit_window_payload(self: &Arc<Self>, session_id: &str, start_ts_ms: i64, end_ts_ms: i64) {
        let Some(session) = self.registry.get(session_id) else {
            return;
        };
        let window_id = window_id_for(session_id, start_ts_ms, end_ts_ms);

        let db_segments = self
            .storage
            .load_window_segments(session_id, start_ts_ms, end_ts_ms)
            .await;
        let db_frames = self
            .storage
            .load_window_frames(session_id, start_ts_ms, end_ts_ms)
            .await;
        let (segments, frames) = match (db_segments, db_frames) {
            (Some(segments), Some(frames)) => (segments, frames),
            _ => {
                let sess = session.lock();
                (
                    sess.segments_in_range(start_ts_ms, end_ts_ms),
                    sess.frames_in_range(start_ts_ms, end_ts_ms),
                )
            }
        };

        let segment_ids: BTreeSet<String> =
            segments.iter().map(|seg| seg.seg_id.clone()).collect();
        let frame_ids: BTreeSet<String> =
            frames.iter().map(|frame| frame.frame_id.clone()).collect();

        let identity = {
            let sess = session.lock();
            let revision = match sess.windows.get(&window_id) {
                Some(prev) => {
                    if prev.segment_ids == segment_ids && prev.frame_ids == frame_ids {
                        return;
                    }
                    prev.revision + 1
                }
                None => 1,
            };
            WindowIdentity {
                window_id: window_id.clone(),
                start_ts_ms,
                end_ts_ms,
                revision,
                started_ts_ms: sess.started_ts_ms,
                session_kind: sess.session_kind,
                meeting_type: sess.meeting_type.clone(),
            }
        };

        let topic_context = self
            .storage
            .load_topic_context(session_id, start_ts_ms)
            .await
            .unwrap_or_else(TopicContext::default);

        let payload = self
            .recap
            .build_window_payload(&identity, &segments, &frames, &topic_context)
            .await;

        let meeting_id = {
            let mut sess = session.lock();
            sess.windows.insert(
                window_id.clone(),
                WindowMeta {
                    window_id: window_id.clone(),
                    start_ts_ms,
                    end_ts_ms,
                    revision: identity.revision,
                    segment_ids,
                    frame_ids,
                },
            );
            sess.meeting_id.clone()
        };

        self.storage
            .insert_recap_window(session_id, &meeting_id, &payload)
            .await;
        let event_payload = match serde_json::to_value(&payload) {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("recap payload serialization failed: {}", err);
                return;
            }
        };
        self.publish(session_id, "recap_window_ready", event_payload);

        tracing::info!(
            "window emitted session_id={} window_id={} revision={} segments={} frames={}",
            session_id,
            window_id,
            payload.revision,
            payload.citations.len(),
            payload.course_highlights.len()
        );
    }

    async fn answer_question(
        &self,
        question: &str,
        transcript_window: &str,
        rag_docs: &[Citation],
    ) -> String {
        let prompt = build_qa_prompt(question, transcript_window, rag_docs);
        let answer = match self
            .llm
            .simple_completion(QA_SYSTEM_PROMPT, &prompt, 512)
            .await
        {
            Ok(text) => cleanup_text(&text),
            Err(LlmError::NotConfigured) => String::new(),
            Err(err @ LlmError::Auth { .. }) => {
                tracing::error!("QA LLM call unusable: {}", err);
                String::new()
            }
            Err(err) => {
                tracing::warn!("QA LLM call failed: {}", err);
                String::new()
            }
        };
        if answer.is_empty() {
            "I could not produce an answer with the available evidence.".to_string()
        } else {
            answer
        }
    }

    pub async fn load_replay_records(&self, session_id: &str) -> Vec<ReplayRecord> {
        self.storage.load_replay_records(session_id).await
    }

    /// Flush and process outstanding audio for every live session; used on
    /// graceful shutdown.
    pub async fn flush_all_sessions(self: &Arc<Self>) {
        for session_id in self.registry.session_ids() {
            if let Err(err) = self.flush_session(&session_id).await {
                tracing::warn!("shutdown flush failed for {}: {}", session_id, err);
            }
        }
    }

    fn teardown_session(&self, session_id: &str) {
        self.registry.remove(session_id);
        self.bus.remove(session_id);
        tracing::info!("session torn down session_id={}", session_id);
    }

    /// Periodically tear down sessions that were stopped and have been
    /// idle past the configured timeout.
    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let expired = self
                        .registry
                        .expired_sessions(now_ms(), self.config.session_idle_timeout_ms);
                    for session_id in expired {
                        self.teardown_session(&session_id);
                    }
                }
            }
        }
    }
}
