/*
 * Meeting Companion Server - Recap Builder
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

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::ai::{LlmClient, LlmError};
use crate::types::{
    cleanup_text, format_mmss_from_ms, CapturedFrameMeta, Citation, SessionKind, TranscriptSeg,
};

const MAX_RECAP_LINES: usize = 6;
const MAX_TOPICS: usize = 5;
const MAX_CHEATSHEET: usize = 8;
const MAX_COURSE_HIGHLIGHTS: usize = 10;
const MAX_TRANSCRIPT_CITATIONS: usize = 8;
const MAX_FRAME_CITATIONS: usize = 4;

const RECAP_SYSTEM_PROMPT: &str = "You are the live recap engine of a meeting companion. \
You receive one transcript window from one active session and must return JSON only, \
with double quotes and no markdown fences.";

const RECAP_USER_PROMPT: &str = r#"Summarize the transcript window below.

Rules:
- Use ONLY the provided transcript text; never invent names, dates, or commitments.
- Leave fields empty when the transcript gives no evidence.
- Do not copy raw transcript tags or timestamps such as [SPEAKER_01 00:13].
- Recap lines are semantic paraphrase, not a transcript dump.
- Topic titles are at most 8 words; start_t/end_t stay within [window_start, window_end].

Return JSON with exactly these keys:
{
  "recap_lines": ["..."],
  "topics": [{"topic_id": "T1", "title": "...", "description": "...", "start_t": 0.0, "end_t": 0.0}],
  "cheatsheet": [{"term": "...", "definition": "..."}],
  "adr": {
    "actions": [{"task": "...", "owner": "", "due_date": "", "priority": "medium", "source_text": "..."}],
    "decisions": [{"title": "...", "rationale": "", "impact": "", "source_text": "..."}],
    "risks": [{"desc": "...", "severity": "low|medium|high", "mitigation": "", "owner": "", "source_text": "..."}]
  },
  "course_highlights": [{"kind": "concept|formula|example|note", "title": "...", "bullet": "...", "formula": ""}]
}

When session_kind is "meeting", course_highlights must be [].
When session_kind is "course", adr.actions/decisions/risks must all be []."#;

#[derive(Debug, Clone, Serialize)]
pub struct RecapItem {
    pub id: String,
    pub text: String,
    pub topic_id: String,
    pub topic: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanonicalTopic {
    pub new_topic: bool,
    pub topic_id: String,
    pub title: String,
    pub start_t: f64,
    pub end_t: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicPayload {
    pub topic_id: String,
    pub title: String,
    pub description: String,
    pub start_t: f64,
    pub end_t: f64,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheatsheetItem {
    pub term: String,
    pub definition: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionItem {
    pub id: String,
    pub task: String,
    pub owner: String,
    pub due_date: String,
    pub priority: String,
    pub source_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionItem {
    pub id: String,
    pub title: String,
    pub rationale: String,
    pub impact: String,
    pub source_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskItem {
    pub id: String,
    pub desc: String,
    pub severity: String,
    pub mitigation: String,
    pub owner: String,
    pub source_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseHighlight {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub bullet: String,
    pub formula: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentPayload {
    pub label: String,
    pub slots: HashMap<String, Value>,
}

impl Default for IntentPayload {
    fn default() -> Self {
        Self {
            label: "NO_INTENT".to_string(),
            slots: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecapDebug {
    pub parse_ok: bool,
    pub llm_latency_ms: u64,
}

/// The fully assembled `recap_window_ready` payload.
#[derive(Debug, Clone, Serialize)]
pub struct RecapWindowPayload {
    pub window_id: String,
    pub start_ts_ms: i64,
    pub end_ts_ms: i64,
    pub revision: u32,
    pub session_kind: SessionKind,
    pub meeting_type: String,
    pub model_name: String,
    pub recap: Vec<RecapItem>,
    pub topic: CanonicalTopic,
    pub topics: Vec<TopicPayload>,
    pub cheatsheet: Vec<CheatsheetItem>,
    pub citations: Vec<Citation>,
    pub actions: Vec<ActionItem>,
    pub decisions: Vec<DecisionItem>,
    pub risks: Vec<RiskItem>,
    pub course_highlights: Vec<CourseHighlight>,
    pub intent_payload: IntentPayload,
    pub debug_info: RecapDebug,
}

/// Continuity hint carried from the most recent prior window.
#[derive(Debug, Clone)]
pub struct TopicContext {
    pub topic_id: String,
    pub title: String,
    pub start_t: f64,
    pub end_t: f64,
}

impl Default for TopicContext {
    fn default() -> Self {
        Self {
            topic_id: "T0".to_string(),
            title: "General".to_string(),
            start_t: 0.0,
            end_t: 0.0,
        }
    }
}

/// Identity of the window being built, in both absolute ms and
/// session-relative seconds.
#[derive(Debug, Clone)]
pub struct WindowIdentity {
    pub window_id: String,
    pub start_ts_ms: i64,
    pub end_ts_ms: i64,
    pub revision: u32,
    pub started_ts_ms: i64,
    pub session_kind: SessionKind,
    pub meeting_type: String,
}

impl WindowIdentity {
    fn start_sec(&self) -> f64 {
        ((self.start_ts_ms - self.started_ts_ms) as f64 / 1000.0).max(0.0)
    }

    fn end_sec(&self) -> f64 {
        ((self.end_ts_ms - self.started_ts_ms) as f64 / 1000.0).max(0.0)
    }
}

fn as_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => cleanup_text(text),
        _ => String::new(),
    }
}

fn as_float(value: Option<&Value>, default: f64) -> f64 {
    match value {
        Some(Value::Number(num)) => num.as_f64().unwrap_or(default),
        Some(Value::String(text)) => text.trim().parse().unwrap_or(default),
        _ => default,
    }
}

fn clamp_span(start_t: f64, end_t: f64, window_start: f64, window_end: f64) -> (f64, f64) {
    let start = start_t.clamp(window_start, window_end);
    let end = end_t.clamp(start, window_end);
    (start, end)
}

fn transcript_tag_re() -> Regex {
    Regex::new(r"\[[^\]]*\d{1,2}:\d{2}(?::\d{2})?[^\]]*\]").expect("static regex")
}

fn speaker_tag_re() -> Regex {
    Regex::new(r"(?i)\bSPEAKER[_\s-]*\d+\s*:?").expect("static regex")
}

/// Strip transcript tags and speaker labels before any recap text is
/// derived from the raw window.
fn sanitize_transcript(text: &str) -> String {
    let without_tags = transcript_tag_re().replace_all(text, " ");
    let without_speakers = speaker_tag_re().replace_all(&without_tags, " ");
    cleanup_text(&without_speakers)
}

fn sanitize_recap_line(line: &str) -> String {
    let mut value = sanitize_transcript(line);
    if value.chars().count() > 420 {
        value = value.chars().take(420).collect::<String>().trim_end().to_string() + "...";
    }
    value
}

/// Deterministic recap when the model output is unusable: the first
/// sentence of the sanitized excerpt, truncated, behind a status prefix.
fn fallback_recap_line(excerpt: &str) -> String {
    let body = sanitize_transcript(excerpt);
    if body.is_empty() {
        return "Status: No transcript in window".to_string();
    }
    let sentence = Regex::new(r"[.!?]\s+")
        .expect("static regex")
        .splitn(&body, 2)
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    let mut sentence = sentence;
    if sentence.chars().count() > 180 {
        sentence = sentence.chars().take(180).collect::<String>().trim_end().to_string() + "...";
    }
    if sentence.is_empty() {
        sentence = "No transcript in window".to_string();
    }
    format!("Status: {}", sentence)
}

/// Frequent long-ish words from the window, stopword-filtered; used as
/// cheatsheet terms when the model returns none.
fn extract_terms(segments: &[TranscriptSeg]) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "the", "and", "for", "that", "this", "with", "from", "have", "about", "will", "they",
        "there", "their", "what", "when", "were", "been", "into",
    ];
    let word_re = Regex::new(r"[\p{L}\p{N}_]{4,}").expect("static regex");
    let mut freq: HashMap<String, usize> = HashMap::new();
    for seg in segments {
        for token in word_re.find_iter(&seg.text) {
            let word = token.as_str().to_lowercase();
            if STOPWORDS.contains(&word.as_str()) {
                continue;
            }
            *freq.entry(word).or_insert(0) += 1;
        }
    }
    let mut terms: Vec<(String, usize)> = freq.into_iter().collect();
    terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    terms.into_iter().take(10).map(|(term, _)| term).collect()
}

/// Up to 8 transcript citations followed by up to 4 frame citations.
pub fn build_citation_bundle(
    segments: &[TranscriptSeg],
    frames: &[CapturedFrameMeta],
) -> Vec<Citation> {
    let mut citations = Vec::new();
    for seg in segments.iter().take(MAX_TRANSCRIPT_CITATIONS) {
        citations.push(Citation::Transcript {
            seg_id: seg.seg_id.clone(),
            ts_ms: seg.start_ts_ms,
            speaker: seg.speaker.clone(),
        });
    }
    for frame in frames.iter().take(MAX_FRAME_CITATIONS) {
        citations.push(Citation::Image {
            frame_id: frame.frame_id.clone(),
            ts_ms: frame.ts_ms,
            uri: frame.uri.clone(),
        });
    }
    citations
}

pub struct RecapBuilder {
    llm: Arc<LlmClient>,
}

impl RecapBuilder {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }

    /// Gather-phase output goes in; a typed recap payload comes out. The
    /// LLM response is parsed leniently; anything that is not a JSON
    /// object falls back to the deterministic shape.
    pub async fn build_window_payload(
        &self,
        identity: &WindowIdentity,
        segments: &[TranscriptSeg],
        frames: &[CapturedFrameMeta],
        topic_context: &TopicContext,
    ) -> RecapWindowPayload {
        let window_start = identity.start_sec();
        let window_end = identity.end_sec();

        let excerpt = segments
            .iter()
            .map(|seg| format!("{}: {}", seg.speaker, cleanup_text(&seg.text)))
            .collect::<Vec<_>>()
            .join("\n");

        let started = std::time::Instant::now();
        let raw = if excerpt.is_empty() {
            String::new()
        } else {
            let user_prompt = format!(
                "{}\n\nsession_kind: {}\ncurrent_topic_id: {}\nwindow_start: {:.2}\nwindow_end: {:.2}\nTranscript window:\n{}",
                RECAP_USER_PROMPT,
                identity.session_kind,
                topic_context.topic_id,
                window_start,
                window_end,
                excerpt
            );
            match self
                .llm
                .simple_completion(RECAP_SYSTEM_PROMPT, &user_prompt, 512)
                .await
            {
                Ok(text) => text,
                // No provider is the normal degraded mode; stay quiet.
                Err(LlmError::NotConfigured) => String::new(),
                Err(err @ (LlmError::Auth { .. } | LlmError::MalformedResponse(_))) => {
                    tracing::error!(
                        "recap LLM call unusable for {}: {}",
                        identity.window_id,
                        err
                    );
                    String::new()
                }
                Err(err) => {
                    tracing::warn!(
                        "recap LLM call failed for {}: {}",
                        identity.window_id,
                        err
                    );
                    String::new()
                }
            }
        };
        let llm_latency_ms = started.elapsed().as_millis() as u64;

        let parsed: Option<Value> = serde_json::from_str::<Value>(&raw)
            .ok()
            .filter(Value::is_object);
        let parse_ok = parsed.is_some();
        let summary = parsed.unwrap_or_else(|| Value::Object(Default::default()));

        self.assemble(
            identity,
            segments,
            frames,
            topic_context,
            &summary,
            &excerpt,
            RecapDebug {
                parse_ok,
                llm_latency_ms,
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        identity: &WindowIdentity,
        segments: &[TranscriptSeg],
        frames: &[CapturedFrameMeta],
        topic_context: &TopicContext,
        summary: &Value,
        excerpt: &str,
        debug_info: RecapDebug,
    ) -> RecapWindowPayload {
        let window_start = identity.start_sec();
        let window_end = identity.end_sec();
        let window_id = &identity.window_id;
        let base_citations = build_citation_bundle(segments, frames);
        let lead_citations: Vec<Citation> = base_citations.iter().take(2).cloned().collect();

        // Recap lines: model output, else fallback sentence, else placeholder.
        let mut recap_lines: Vec<String> = match summary.get("recap_lines") {
            Some(Value::Array(lines)) => lines
                .iter()
                .map(|line| sanitize_recap_line(line.as_str().unwrap_or("")))
                .filter(|line| !line.is_empty())
                .collect(),
            Some(Value::String(text)) => text
                .lines()
                .map(sanitize_recap_line)
                .filter(|line| !line.is_empty())
                .collect(),
            _ => Vec::new(),
        };
        if recap_lines.is_empty() && !excerpt.is_empty() {
            recap_lines = vec![fallback_recap_line(excerpt)];
        }
        if recap_lines.is_empty() {
            recap_lines = vec!["No transcript available for this window.".to_string()];
        }
        recap_lines.truncate(MAX_RECAP_LINES);

        // Topics: model list (or single `topic` object), else the current
        // topic spanning the whole window.
        let raw_topics: Vec<&Value> = match summary.get("topics") {
            Some(Value::Array(items)) => items.iter().filter(|item| item.is_object()).collect(),
            _ => summary
                .get("topic")
                .filter(|topic| topic.is_object())
                .into_iter()
                .collect(),
        };
        let mut topics: Vec<TopicPayload> = Vec::new();
        for (idx, item) in raw_topics.iter().enumerate() {
            let fallback_id = if idx == 0 {
                topic_context.topic_id.clone()
            } else {
                format!("T{}", idx + 1)
            };
            let topic_id = {
                let value = as_text(item.get("topic_id"));
                if value.is_empty() {
                    fallback_id
                } else {
                    value
                }
            };
            let title = {
                let value = as_text(item.get("title"));
                if value.is_empty() {
                    if idx == 0 {
                        topic_context.title.clone()
                    } else {
                        topic_id.clone()
                    }
                } else {
                    value
                }
            };
            let description = {
                let value = as_text(item.get("description"));
                if value.is_empty() {
                    title.clone()
                } else {
                    value
                }
            };
            let (start_t, end_t) = clamp_span(
                as_float(item.get("start_t"), window_start),
                as_float(item.get("end_t"), window_end),
                window_start,
                window_end,
            );
            topics.push(TopicPayload {
                topic_id,
                title,
                description,
                start_t,
                end_t,
                citations: lead_citations.clone(),
            });
        }
        if topics.is_empty() {
            topics.push(TopicPayload {
                topic_id: topic_context.topic_id.clone(),
                title: topic_context.title.clone(),
                description: recap_lines[0].clone(),
                start_t: window_start,
                end_t: window_end,
                citations: lead_citations.clone(),
            });
        }
        topics.truncate(MAX_TOPICS);

        let primary = &topics[0];
        let topic = CanonicalTopic {
            new_topic: primary.topic_id != topic_context.topic_id,
            topic_id: primary.topic_id.clone(),
            title: primary.title.clone(),
            start_t: primary.start_t,
            end_t: primary.end_t,
        };

        let recap: Vec<RecapItem> = recap_lines
            .iter()
            .enumerate()
            .map(|(idx, line)| RecapItem {
                id: format!("{}:recap:{}", window_id, idx),
                text: line.clone(),
                topic_id: topic.topic_id.clone(),
                topic: topic.title.clone(),
                citations: lead_citations.clone(),
            })
            .collect();

        // Cheatsheet: model entries, else frequent-term fallback.
        let cheat_citations: Vec<Citation> = base_citations.iter().take(1).cloned().collect();
        let mut cheatsheet: Vec<CheatsheetItem> = match summary.get("cheatsheet") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| {
                    let term = as_text(item.get("term"));
                    let definition = as_text(item.get("definition"));
                    if term.is_empty() || definition.is_empty() {
                        return None;
                    }
                    Some(CheatsheetItem {
                        term,
                        definition,
                        citations: cheat_citations.clone(),
                    })
                })
                .collect(),
            _ => Vec::new(),
        };
        if cheatsheet.is_empty() {
            let span = format!(
                "{}-{}",
                format_mmss_from_ms(identity.start_ts_ms - identity.started_ts_ms),
                format_mmss_from_ms(identity.end_ts_ms - identity.started_ts_ms)
            );
            cheatsheet = extract_terms(segments)
                .into_iter()
                .take(5)
                .map(|term| CheatsheetItem {
                    definition: format!("Mentioned concept in window {}.", span),
                    term,
                    citations: cheat_citations.clone(),
                })
                .collect();
        }
        cheatsheet.truncate(MAX_CHEATSHEET);

        let adr = summary.get("adr").and_then(Value::as_object);
        let mut actions = Vec::new();
        let mut decisions = Vec::new();
        let mut risks = Vec::new();
        if let Some(adr) = adr {
            if let Some(items) = adr.get("actions").and_then(Value::as_array) {
                for item in items {
                    let task = {
                        let task = as_text(item.get("task"));
                        if task.is_empty() {
                            as_text(item.get("description"))
                        } else {
                            task
                        }
                    };
                    if task.is_empty() {
                        continue;
                    }
                    let due_date = {
                        let due = as_text(item.get("due_date"));
                        if due.is_empty() {
                            as_text(item.get("deadline"))
                        } else {
                            due
                        }
                    };
                    let priority = {
                        let value = as_text(item.get("priority"));
                        if value.is_empty() {
                            "medium".to_string()
                        } else {
                            value
                        }
                    };
                    actions.push(ActionItem {
                        id: format!("{}:a:{}", window_id, actions.len()),
                        task,
                        owner: as_text(item.get("owner")),
                        due_date,
                        priority,
                        source_text: as_text(item.get("source_text")),
                    });
                }
            }
            if let Some(items) = adr.get("decisions").and_then(Value::as_array) {
                for item in items {
                    let title = {
                        let title = as_text(item.get("title"));
                        if title.is_empty() {
                            as_text(item.get("description"))
                        } else {
                            title
                        }
                    };
                    if title.is_empty() {
                        continue;
                    }
                    decisions.push(DecisionItem {
                        id: format!("{}:d:{}", window_id, decisions.len()),
                        title,
                        rationale: as_text(item.get("rationale")),
                        impact: as_text(item.get("impact")),
                        source_text: as_text(item.get("source_text")),
                    });
                }
            }
            if let Some(items) = adr.get("risks").and_then(Value::as_array) {
                for item in items {
                    let desc = {
                        let desc = as_text(item.get("desc"));
                        if desc.is_empty() {
                            as_text(item.get("description"))
                        } else {
                            desc
                        }
                    };
                    if desc.is_empty() {
                        continue;
                    }
                    let severity = {
                        let value = as_text(item.get("severity")).to_lowercase();
                        if ["low", "medium", "high"].contains(&value.as_str()) {
                            value
                        } else {
                            "medium".to_string()
                        }
                    };
                    risks.push(RiskItem {
                        id: format!("{}:r:{}", window_id, risks.len()),
                        desc,
                        severity,
                        mitigation: as_text(item.get("mitigation")),
                        owner: as_text(item.get("owner")),
                        source_text: as_text(item.get("source_text")),
                    });
                }
            }
        }

        let mut course_highlights: Vec<CourseHighlight> = match summary.get("course_highlights") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| {
                    let kind = {
                        let value = as_text(item.get("kind")).to_lowercase();
                        if ["concept", "formula", "example", "note"].contains(&value.as_str()) {
                            value
                        } else {
                            "concept".to_string()
                        }
                    };
                    let title = as_text(item.get("title"));
                    let bullet = as_text(item.get("bullet"));
                    if title.is_empty() && bullet.is_empty() {
                        return None;
                    }
                    Some((kind, title, bullet, as_text(item.get("formula"))))
                })
                .enumerate()
                .map(|(idx, (kind, title, bullet, formula))| CourseHighlight {
                    id: format!("{}:h:{}", window_id, idx),
                    kind,
                    title: if title.is_empty() {
                        bullet.clone()
                    } else {
                        title.clone()
                    },
                    bullet: if bullet.is_empty() { title } else { bullet },
                    formula,
                    citations: lead_citations.clone(),
                })
                .collect(),
            _ => Vec::new(),
        };

        // Session-kind shaping: meetings carry ADR, courses carry highlights.
        match identity.session_kind {
            SessionKind::Course => {
                actions.clear();
                decisions.clear();
                risks.clear();
                if course_highlights.is_empty() {
                    course_highlights = cheatsheet
                        .iter()
                        .take(5)
                        .enumerate()
                        .map(|(idx, item)| CourseHighlight {
                            id: format!("{}:h:{}", window_id, idx),
                            kind: "concept".to_string(),
                            title: item.term.clone(),
                            bullet: item.definition.clone(),
                            formula: String::new(),
                            citations: item.citations.clone(),
                        })
                        .collect();
                }
            }
            SessionKind::Meeting => {
                course_highlights.clear();
            }
        }
        course_highlights.truncate(MAX_COURSE_HIGHLIGHTS);

        RecapWindowPayload {
            window_id: window_id.clone(),
            start_ts_ms: identity.start_ts_ms,
            end_ts_ms: identity.end_ts_ms,
            revision: identity.revision,
            session_kind: identity.session_kind,
            meeting_type: identity.meeting_type.clone(),
            model_name: if self.llm.is_configured() {
                self.llm.model_name().to_string()
            } else {
                "LLM".to_string()
            },
            recap,
            topic,
            topics,
            cheatsheet,
            citations: base_citations,
            actions,
            decisions,
            risks,
            course_highlights,
            intent_payload: IntentPayload::default(),
            debug_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use crate::types::{DiffScore, Roi};
    use serde_json::json;

    fn builder() -> RecapBuilder {
        // Unconfigured client: every build exercises the fallback path.
        RecapBuilder::new(Arc::new(LlmClient::new(LlmConfig::default()).unwrap()))
    }

    fn identity(kind: SessionKind) -> WindowIdentity {
        WindowIdentity {
            window_id: "s1:1000:121000".to_string(),
            start_ts_ms: 1_000,
            end_ts_ms: 121_000,
            revision: 1,
            started_ts_ms: 1_000,
            session_kind: kind,
            meeting_type: "project_meeting".to_string(),
        }
    }

    fn seg(seg_id: &str, start: i64, text: &str) -> TranscriptSeg {
        TranscriptSeg {
            seg_id: seg_id.to_string(),
            speaker: "SPEAKER_01".to_string(),
            offset: "00:00".to_string(),
            start_ts_ms: start,
            end_ts_ms: None,
            text: text.to_string(),
            confidence: 1.0,
            record_id: 1,
        }
    }

    fn frame(frame_id: &str, ts: i64) -> CapturedFrameMeta {
        CapturedFrameMeta {
            frame_id: frame_id.to_string(),
            ts_ms: ts,
            roi: Roi::full(640, 360),
            checksum: "deadbeef".to_string(),
            uri: format!("/files/realtime_captures/s1/{}.webp", frame_id),
            diff_score: DiffScore {
                hash_dist: 20.0,
                ssim: 0.5,
            },
        }
    }

    #[tokio::test]
    async fn empty_window_gets_placeholder_recap() {
        let payload = builder()
            .build_window_payload(
                &identity(SessionKind::Meeting),
                &[],
                &[],
                &TopicContext::default(),
            )
            .await;

        assert_eq!(payload.recap.len(), 1);
        assert_eq!(
            payload.recap[0].text,
            "No transcript available for this window."
        );
        assert_eq!(payload.topics.len(), 1);
        assert_eq!(payload.topics[0].topic_id, "T0");
        assert!(payload.citations.is_empty());
        assert!(!payload.debug_info.parse_ok);
    }

    #[tokio::test]
    async fn fallback_recap_uses_first_sentence_with_status_prefix() {
        let segments = vec![seg(
            "s1:r1:s000",
            2_000,
            "The deployment plan moves to Tuesday. Further detail follows here.",
        )];
        let payload = builder()
            .build_window_payload(
                &identity(SessionKind::Meeting),
                &segments,
                &[],
                &TopicContext::default(),
            )
            .await;

        assert!(payload.recap[0].text.starts_with("Status: "));
        assert!(payload.recap[0].text.contains("deployment plan"));
        assert!(!payload.recap[0].text.contains("Further detail"));
    }

    #[tokio::test]
    async fn citations_cap_at_eight_transcript_and_four_frames() {
        let segments: Vec<TranscriptSeg> = (0..12)
            .map(|idx| {
                seg(
                    &format!("s1:r1:s{:03}", idx),
                    2_000 + idx as i64,
                    "topic words here",
                )
            })
            .collect();
        let frames: Vec<CapturedFrameMeta> =
            (0..6).map(|idx| frame(&format!("f{}", idx), 3_000 + idx as i64)).collect();

        let payload = builder()
            .build_window_payload(
                &identity(SessionKind::Meeting),
                &segments,
                &frames,
                &TopicContext::default(),
            )
            .await;

        assert_eq!(payload.citations.len(), 12);
        let transcript_count = payload
            .citations
            .iter()
            .filter(|c| matches!(c, Citation::Transcript { .. }))
            .count();
        assert_eq!(transcript_count, 8);
        // Each recap line and topic carries the first two citations.
        assert_eq!(payload.recap[0].citations.len(), 2);
        assert_eq!(payload.topics[0].citations.len(), 2);
    }

    #[tokio::test]
    async fn course_kind_synthesizes_highlights_and_drops_adr() {
        let segments = vec![
            seg("s1:r1:s000", 2_000, "Entropy measures disorder in systems"),
            seg("s1:r1:s001", 3_000, "Entropy increases in isolated systems"),
        ];
        let payload = builder()
            .build_window_payload(
                &identity(SessionKind::Course),
                &segments,
                &[],
                &TopicContext::default(),
            )
            .await;

        assert!(payload.actions.is_empty());
        assert!(payload.decisions.is_empty());
        assert!(payload.risks.is_empty());
        assert!(!payload.course_highlights.is_empty());
        assert_eq!(payload.course_highlights[0].kind, "concept");
    }

    #[test]
    fn assemble_clamps_llm_topic_spans_and_caps_lists() {
        let builder = builder();
        let identity = identity(SessionKind::Meeting);
        let summary = json!({
            "recap_lines": ["one", "two", "three", "four", "five", "six", "seven"],
            "topics": (0..9).map(|idx| json!({
                "topic_id": format!("T{}", idx),
                "title": "Topic",
                "start_t": -50.0,
                "end_t": 9_999.0,
            })).collect::<Vec<_>>(),
            "cheatsheet": (0..12).map(|idx| json!({
                "term": format!("term{}", idx),
                "definition": "meaning",
            })).collect::<Vec<_>>(),
            "adr": {
                "actions": [{"task": "follow up", "priority": "weird"}],
                "decisions": [{"title": "ship it"}],
                "risks": [{"desc": "may slip", "severity": "catastrophic"}],
            },
        });

        let payload = builder.assemble(
            &identity,
            &[],
            &[],
            &TopicContext::default(),
            &summary,
            "",
            RecapDebug {
                parse_ok: true,
                llm_latency_ms: 5,
            },
        );

        assert_eq!(payload.recap.len(), 6);
        assert_eq!(payload.topics.len(), 5);
        assert_eq!(payload.cheatsheet.len(), 8);
        for topic in &payload.topics {
            assert!(topic.start_t >= 0.0);
            assert!(topic.end_t <= 120.0);
            assert!(topic.end_t >= topic.start_t);
        }
        assert_eq!(payload.actions[0].priority, "weird");
        assert_eq!(payload.risks[0].severity, "medium");
        assert!(payload.topic.new_topic);
    }

    #[test]
    fn sanitizers_strip_tags_and_speakers() {
        assert_eq!(
            sanitize_transcript("[SPEAKER_01 00:13] hello SPEAKER_02: world"),
            "hello world"
        );
        let line = fallback_recap_line("[SPEAKER_01 00:13] the plan is ready. next part");
        assert_eq!(line, "Status: the plan is ready");
    }

    #[test]
    fn term_extraction_filters_stopwords_and_sorts_by_frequency() {
        let segments = vec![
            seg("a", 0, "entropy entropy gradient with that this"),
            seg("b", 0, "entropy gradient"),
        ];
        let terms = extract_terms(&segments);
        assert_eq!(terms[0], "entropy");
        assert_eq!(terms[1], "gradient");
        assert!(!terms.contains(&"that".to_string()));
    }
}
