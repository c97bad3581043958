/*
 * Meeting Companion Server - WebSocket Channels
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

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::auth::verify_ingest_token;
use crate::bus::EventEnvelope;
use crate::server::AppState;
use crate::service::{
    ApproveToolCallPayload, AudioChunkPayload, RealtimeService, SessionControlPayload,
    TranscriptIngestPayload, UserQueryPayload, VideoFramePayload,
};
use crate::storage::ReplayRecord;
use crate::types::{now_ms, AudioFormat, ServiceError};

const CLOSE_UNSUPPORTED: u16 = 1003;
const CLOSE_POLICY_VIOLATION: u16 = 1008;

type WsSender = SplitSink<WebSocket, Message>;

/// First client message on the audio channel.
#[derive(Debug, Deserialize)]
pub struct AudioStartMessage {
    pub audio: AudioFormat,
}

pub fn audio_format_matches(expected: &AudioFormat, offered: &AudioFormat) -> bool {
    expected.codec == offered.codec
        && expected.sample_rate_hz == offered.sample_rate_hz
        && expected.channels == offered.channels
}

/// Typed ingress events for the multiplexed realtime-av channel.
#[derive(Debug)]
pub enum IngressEvent {
    SessionControl(SessionControlPayload),
    AudioChunk(AudioChunkPayload),
    VideoFrameMeta(VideoFramePayload),
    UserQuery(UserQueryPayload),
    ApproveToolCall(ApproveToolCallPayload),
}

#[derive(Debug)]
pub enum IngressParseError {
    InvalidJson(String),
    UnsupportedEvent(String),
    Validation(String),
}

impl IngressParseError {
    pub fn code(&self) -> &'static str {
        match self {
            IngressParseError::InvalidJson(_) => "invalid_json",
            IngressParseError::UnsupportedEvent(_) => "unsupported_event",
            IngressParseError::Validation(_) => "validation_error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            IngressParseError::InvalidJson(msg)
            | IngressParseError::UnsupportedEvent(msg)
            | IngressParseError::Validation(msg) => msg,
        }
    }
}

/// Strict decode at the boundary: the event name selects the payload
/// shape, and a `payload` object is preferred over flattened fields.
pub fn parse_ingress(text: &str) -> Result<IngressEvent, IngressParseError> {
    let obj: Value = serde_json::from_str(text)
        .map_err(|err| IngressParseError::InvalidJson(err.to_string()))?;
    if !obj.is_object() {
        return Err(IngressParseError::InvalidJson(
            "message must be a JSON object".to_string(),
        ));
    }

    let event_name = obj
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    let payload = if obj.get("payload").map(Value::is_object).unwrap_or(false) {
        obj.get("payload").cloned().unwrap_or(Value::Null)
    } else {
        obj
    };

    fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, IngressParseError> {
        serde_json::from_value(payload)
            .map_err(|err| IngressParseError::Validation(err.to_string()))
    }

    match event_name.as_str() {
        "session_control" => Ok(IngressEvent::SessionControl(decode(payload)?)),
        "audio_chunk" => Ok(IngressEvent::AudioChunk(decode(payload)?)),
        "video_frame_meta" => Ok(IngressEvent::VideoFrameMeta(decode(payload)?)),
        "user_query" => Ok(IngressEvent::UserQuery(decode(payload)?)),
        "approve_tool_call" => Ok(IngressEvent::ApproveToolCall(decode(payload)?)),
        other => Err(IngressParseError::UnsupportedEvent(format!(
            "Unsupported event: {}",
            if other.is_empty() { "<empty>" } else { other }
        ))),
    }
}

/// Per-segment legacy `transcript_event` stream derived from one
/// `transcript_record_ready` payload. Times are seconds relative to the
/// earliest record start seen on this connection.
pub fn build_transcript_compat(
    session_id: &str,
    bus_seq: u64,
    payload: &Value,
    timeline_origin_ms: &mut Option<i64>,
) -> Vec<Value> {
    let record_start = payload.get("record_start_ts_ms").and_then(Value::as_i64);
    if let Some(record_start) = record_start {
        *timeline_origin_ms = Some(match *timeline_origin_ms {
            Some(existing) => existing.min(record_start),
            None => record_start,
        });
    }
    let origin = timeline_origin_ms.unwrap_or_else(now_ms);

    let mut compat = Vec::new();
    let segments = payload
        .get("segments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for (idx, seg) in segments.iter().enumerate() {
        let text = seg
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string();
        if text.is_empty() {
            continue;
        }
        let start_ts_ms = seg.get("start_ts_ms").and_then(Value::as_i64);
        let end_ts_ms = seg.get("end_ts_ms").and_then(Value::as_i64);
        let time_start = ((start_ts_ms.unwrap_or(origin) - origin) as f64 / 1000.0).max(0.0);
        let time_end =
            ((end_ts_ms.or(start_ts_ms).unwrap_or(origin) - origin) as f64 / 1000.0).max(0.0);
        compat.push(json!({
            "event": "transcript_event",
            "seq": bus_seq * 1000 + idx as u64,
            "payload": {
                "meeting_id": session_id,
                "chunk": text,
                "speaker": seg.get("speaker").and_then(Value::as_str).unwrap_or("SPEAKER_01"),
                "time_start": time_start,
                "time_end": time_end,
                "is_final": true,
                "confidence": seg.get("confidence").and_then(Value::as_f64).unwrap_or(1.0),
                "lang": "en",
            },
        }));
    }
    compat
}

/// Legacy `state` event summarizing one `recap_window_ready` payload for
/// old frontends.
pub fn build_state_compat(payload: &Value) -> Value {
    let recap_text = payload
        .get("recap")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    let first_topic = payload
        .get("topics")
        .and_then(Value::as_array)
        .and_then(|topics| topics.first())
        .cloned()
        .unwrap_or(Value::Null);
    let topic_id = first_topic
        .get("topic_id")
        .and_then(Value::as_str)
        .unwrap_or("T0")
        .to_string();
    let topic_title = first_topic
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or(&topic_id)
        .to_string();

    json!({
        "event": "state",
        "payload": {
            "stage": "in",
            "intent": "tick",
            "live_recap": recap_text,
            "recap": recap_text,
            "current_topic_id": topic_id,
            "topic": { "topic_id": topic_id, "title": topic_title },
            "topic_segments": [{
                "topic_id": topic_id,
                "title": topic_title,
                "start_t": 0.0,
                "end_t": 0.0,
            }],
            "actions": [],
            "decisions": [],
            "risks": [],
            "debug_info": {
                "window_id": payload.get("window_id").cloned().unwrap_or(Value::Null),
                "revision": payload.get("revision").cloned().unwrap_or(Value::Null),
            },
        },
    })
}

pub fn replay_event(record: &ReplayRecord) -> Value {
    json!({
        "event": "transcript_record_ready",
        "payload": {
            "record_id": record.record_id,
            "record_start_ts_ms": record.record_start_ts_ms,
            "record_end_ts_ms": record.record_end_ts_ms.max(record.record_start_ts_ms),
            "uri": Value::Null,
            "segments": record.segments,
            "asr_error": Value::Null,
            "replay": true,
        },
    })
}

async fn send_json(sender: &mut WsSender, value: &Value) -> bool {
    match serde_json::to_string(value) {
        Ok(text) => sender.send(Message::Text(text)).await.is_ok(),
        Err(err) => {
            tracing::error!("outbound event serialization failed: {}", err);
            true
        }
    }
}

async fn send_error(sender: &mut WsSender, code: &str, message: &str) -> bool {
    send_json(
        sender,
        &json!({
            "event": "error",
            "payload": { "code": code, "message": message },
        }),
    )
    .await
}

async fn close_with(sender: &mut WsSender, code: u16, reason: &'static str) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

// ─────────────────────────────────────────────────────────────────────────
// Multiplexed realtime-av channel
// ─────────────────────────────────────────────────────────────────────────

pub async fn realtime_av_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_realtime_av(socket, state.service, session_id))
}

async fn handle_realtime_av(socket: WebSocket, service: Arc<RealtimeService>, session_id: String) {
    let (mut sender, mut receiver) = socket.split();
    service.ensure_session(&session_id, None).await;
    let mut bus_rx = service.subscribe(&session_id);

    if !send_json(
        &mut sender,
        &json!({ "event": "connected", "channel": "realtime-av", "session_id": session_id }),
    )
    .await
    {
        return;
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        handle_realtime_av_text(&mut sender, &service, &session_id, &text).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        // Raw binary mode: treat the frame as an audio chunk.
                        if bytes.is_empty() {
                            continue;
                        }
                        match service
                            .handle_audio_chunk_bytes(&session_id, &bytes, now_ms())
                            .await
                        {
                            Ok(ack) => {
                                send_json(&mut sender, &json!({
                                    "event": "audio_chunk_ack",
                                    "session_id": session_id,
                                    "payload": ack,
                                })).await;
                            }
                            Err(err) => {
                                send_error(&mut sender, err.code(), &err.to_string()).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            event = bus_rx.recv() => {
                if !forward_bus_event(&mut sender, &session_id, event).await {
                    break;
                }
            }
        }
    }
}

async fn handle_realtime_av_text(
    sender: &mut WsSender,
    service: &Arc<RealtimeService>,
    session_id: &str,
    text: &str,
) {
    let event = match parse_ingress(text) {
        Ok(event) => event,
        Err(err) => {
            send_error(sender, err.code(), err.message()).await;
            return;
        }
    };

    // A handler failure answers with an `error` event; it never tears the
    // connection down.
    let result: Result<(&'static str, Value), ServiceError> = match event {
        IngressEvent::SessionControl(payload) => service
            .handle_session_control(session_id, payload)
            .await
            .and_then(|ack| {
                serde_json::to_value(ack).map_err(|err| ServiceError::Internal(err.into()))
            })
            .map(|value| ("session_control_received", value)),
        IngressEvent::AudioChunk(payload) => service
            .handle_audio_chunk(session_id, payload, now_ms())
            .await
            .and_then(|ack| {
                serde_json::to_value(ack).map_err(|err| ServiceError::Internal(err.into()))
            })
            .map(|value| ("audio_chunk_ack", value)),
        IngressEvent::VideoFrameMeta(payload) => service
            .handle_video_frame(session_id, payload, now_ms())
            .await
            .and_then(|ack| {
                serde_json::to_value(ack).map_err(|err| ServiceError::Internal(err.into()))
            })
            .map(|value| ("video_frame_ack", value)),
        IngressEvent::UserQuery(payload) => service
            .handle_user_query(session_id, payload)
            .await
            .and_then(|ack| {
                serde_json::to_value(ack).map_err(|err| ServiceError::Internal(err.into()))
            })
            .map(|value| ("user_query_ack", value)),
        IngressEvent::ApproveToolCall(payload) => service
            .handle_tool_approval(session_id, payload)
            .await
            .and_then(|ack| {
                serde_json::to_value(ack).map_err(|err| ServiceError::Internal(err.into()))
            })
            .map(|value| ("approve_tool_call_ack", value)),
    };

    match result {
        Ok((ack_event, payload)) => {
            send_json(
                sender,
                &json!({
                    "event": ack_event,
                    "session_id": session_id,
                    "payload": payload,
                }),
            )
            .await;
        }
        Err(err) => {
            send_error(sender, err.code(), &err.to_string()).await;
        }
    }
}

async fn forward_bus_event(
    sender: &mut WsSender,
    session_id: &str,
    event: Result<EventEnvelope, broadcast::error::RecvError>,
) -> bool {
    match event {
        Ok(envelope) => {
            let value = match serde_json::to_value(&envelope) {
                Ok(value) => value,
                Err(_) => return true,
            };
            send_json(sender, &value).await
        }
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            tracing::warn!(
                "subscriber lagged on session {}: dropped {} events",
                session_id,
                skipped
            );
            true
        }
        Err(broadcast::error::RecvError::Closed) => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Audio ingest channel
// ─────────────────────────────────────────────────────────────────────────

pub async fn audio_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let token_ok = params
        .get("token")
        .map(|token| {
            verify_ingest_token(&state.service.config.ingest_token_secret, &session_id, token)
        })
        .unwrap_or(false);
    ws.on_upgrade(move |socket| handle_audio(socket, state.service, session_id, token_ok))
}

async fn handle_audio(
    socket: WebSocket,
    service: Arc<RealtimeService>,
    session_id: String,
    token_ok: bool,
) {
    let (mut sender, mut receiver) = socket.split();
    if !token_ok {
        close_with(&mut sender, CLOSE_POLICY_VIOLATION, "unauthorized").await;
        return;
    }

    service.ensure_session(&session_id, Some(&session_id)).await;
    if !send_json(
        &mut sender,
        &json!({ "event": "connected", "channel": "audio", "session_id": session_id }),
    )
    .await
    {
        return;
    }

    // First message must describe the audio format.
    let start_raw = match receiver.next().await {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            send_json(
                &mut sender,
                &json!({
                    "event": "error",
                    "session_id": session_id,
                    "message": "invalid_start: expected audio_start JSON",
                }),
            )
            .await;
            close_with(&mut sender, CLOSE_UNSUPPORTED, "invalid_start").await;
            return;
        }
    };
    let start_msg: AudioStartMessage = match serde_json::from_str(&start_raw) {
        Ok(msg) => msg,
        Err(err) => {
            send_json(
                &mut sender,
                &json!({
                    "event": "error",
                    "session_id": session_id,
                    "message": format!("invalid_start: {}", err),
                }),
            )
            .await;
            close_with(&mut sender, CLOSE_UNSUPPORTED, "invalid_start").await;
            return;
        }
    };

    let expected = service.expected_audio(&session_id).await;
    if !audio_format_matches(&expected, &start_msg.audio) {
        send_json(
            &mut sender,
            &json!({
                "event": "error",
                "session_id": session_id,
                "message": "audio_format_mismatch",
                "expected_audio": expected,
            }),
        )
        .await;
        close_with(&mut sender, CLOSE_UNSUPPORTED, "audio_format_mismatch").await;
        return;
    }

    send_json(
        &mut sender,
        &json!({
            "event": "audio_start_ack",
            "session_id": session_id,
            "accepted_audio": expected,
            "stt_enabled": true,
            "stt_mode": "batch_asr_record",
            "record_ms": service.config.pipeline.record_ms,
        }),
    )
    .await;

    let mut ingest_ok_sent = false;
    let mut received_bytes: u64 = 0;
    let mut received_frames: u64 = 0;
    let mut stop_requested = false;
    let mut last_status_push_ms: i64 = 0;

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Binary(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                received_bytes += chunk.len() as u64;
                received_frames += 1;
                if !ingest_ok_sent {
                    ingest_ok_sent = true;
                    send_json(
                        &mut sender,
                        &json!({
                            "event": "audio_ingest_ok",
                            "session_id": session_id,
                            "received_bytes": received_bytes,
                            "received_frames": received_frames,
                        }),
                    )
                    .await;
                }

                let ack = match service
                    .handle_audio_chunk_bytes(&session_id, &chunk, now_ms())
                    .await
                {
                    Ok(ack) => ack,
                    Err(err) => {
                        send_json(
                            &mut sender,
                            &json!({
                                "event": "error",
                                "session_id": session_id,
                                "message": format!("audio_chunk_failed: {}", err),
                            }),
                        )
                        .await;
                        continue;
                    }
                };
                if !ack.accepted {
                    send_json(
                        &mut sender,
                        &json!({
                            "event": "error",
                            "session_id": session_id,
                            "message": format!(
                                "audio_chunk_rejected: {}",
                                ack.reason.as_deref().unwrap_or("unknown")
                            ),
                        }),
                    )
                    .await;
                }

                let ts = now_ms();
                if received_frames == 1 || ts - last_status_push_ms >= 1_000 {
                    last_status_push_ms = ts;
                    service.publish(
                        &session_id,
                        "audio_ingest_status",
                        json!({
                            "session_id": session_id,
                            "ts_ms": ts,
                            "received_bytes": received_bytes,
                            "received_frames": received_frames,
                            "accepted": ack.accepted,
                            "reason": ack.reason,
                        }),
                    );
                }
            }
            Ok(Message::Text(text)) => {
                if let Ok(obj) = serde_json::from_str::<Value>(&text) {
                    if obj.get("type").and_then(Value::as_str) == Some("stop") {
                        stop_requested = true;
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    if stop_requested || received_frames > 0 {
        if let Err(err) = service.flush_session(&session_id).await {
            tracing::warn!("audio flush failed for {}: {}", session_id, err);
        }
    }
    let _ = sender.close().await;
}

// ─────────────────────────────────────────────────────────────────────────
// Test-only transcript ingest channel
// ─────────────────────────────────────────────────────────────────────────

pub async fn ingest_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ingest(socket, state.service, session_id))
}

async fn handle_ingest(socket: WebSocket, service: Arc<RealtimeService>, session_id: String) {
    let (mut sender, mut receiver) = socket.split();
    service.ensure_session(&session_id, None).await;
    if !send_json(
        &mut sender,
        &json!({ "event": "connected", "channel": "ingest", "session_id": session_id }),
    )
    .await
    {
        return;
    }

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        let payload: TranscriptIngestPayload = match serde_json::from_str(&text) {
            Ok(payload) => payload,
            Err(err) => {
                send_json(
                    &mut sender,
                    &json!({
                        "event": "error",
                        "session_id": session_id,
                        "message": err.to_string(),
                    }),
                )
                .await;
                continue;
            }
        };
        match service.ingest_transcript(&session_id, payload).await {
            Ok(seq) => {
                send_json(
                    &mut sender,
                    &json!({ "event": "ingest_ack", "session_id": session_id, "seq": seq }),
                )
                .await;
            }
            Err(err) => {
                send_json(
                    &mut sender,
                    &json!({
                        "event": "error",
                        "session_id": session_id,
                        "message": err.to_string(),
                    }),
                )
                .await;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Read-only frontend channel
// ─────────────────────────────────────────────────────────────────────────

pub async fn frontend_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_frontend(socket, state.service, session_id))
}

async fn handle_frontend(socket: WebSocket, service: Arc<RealtimeService>, session_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut bus_rx = service.subscribe(&session_id);

    if !send_json(
        &mut sender,
        &json!({ "event": "connected", "channel": "frontend", "session_id": session_id }),
    )
    .await
    {
        return;
    }

    // Replay persisted history in record order before any live event.
    let mut timeline_origin_ms: Option<i64> = None;
    let replay_records = service.load_replay_records(&session_id).await;
    if !replay_records.is_empty() {
        tracing::info!(
            "frontend transcript replay session_id={} records={}",
            session_id,
            replay_records.len()
        );
    }
    for record in &replay_records {
        let event = replay_event(record);
        if !send_json(&mut sender, &event).await {
            return;
        }
        let payload = event.get("payload").cloned().unwrap_or(Value::Null);
        for compat in build_transcript_compat(&session_id, 0, &payload, &mut timeline_origin_ms) {
            if !send_json(&mut sender, &compat).await {
                return;
            }
        }
    }

    loop {
        tokio::select! {
            event = bus_rx.recv() => {
                match event {
                    Ok(envelope) => {
                        if !forward_frontend_event(
                            &mut sender,
                            &session_id,
                            &envelope,
                            &mut timeline_origin_ms,
                        )
                        .await
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "frontend subscriber lagged on session {}: dropped {} events",
                            session_id,
                            skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Read-only channel: everything else is ignored.
                    _ => {}
                }
            }
        }
    }
}

async fn forward_frontend_event(
    sender: &mut WsSender,
    session_id: &str,
    envelope: &EventEnvelope,
    timeline_origin_ms: &mut Option<i64>,
) -> bool {
    let mut outbound = match serde_json::to_value(envelope) {
        Ok(value) => value,
        Err(_) => return true,
    };

    match envelope.event.as_str() {
        "transcript_event" => {
            // Keep the frontend contract minimal; strip internal fields.
            if let Some(payload) = outbound.get_mut("payload").and_then(Value::as_object_mut) {
                payload.remove("transcript_window");
                payload.remove("source");
                payload.remove("question");
            }
            send_json(sender, &outbound).await
        }
        "transcript_record_ready" => {
            if !send_json(sender, &outbound).await {
                return false;
            }
            for compat in build_transcript_compat(
                session_id,
                envelope.seq,
                &envelope.payload,
                timeline_origin_ms,
            ) {
                if !send_json(sender, &compat).await {
                    return false;
                }
            }
            true
        }
        "recap_window_ready" => {
            if !send_json(sender, &outbound).await {
                return false;
            }
            send_json(sender, &build_state_compat(&envelope.payload)).await
        }
        _ => send_json(sender, &outbound).await,
    }
}
