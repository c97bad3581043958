/*
 * Meeting Companion Server - Q&A Tiered Retriever
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
use regex::Regex;
use serde_json::Value;
use std::time::Duration;

use crate::session::Session;
use crate::types::{format_mmss_from_ms, Citation};

const MAX_DOC_HITS: usize = 5;
const TIER0_FALLBACK_SEGMENTS: usize = 10;
const MAX_TIER0_CITATIONS: usize = 8;
const RECENT_FRAME_CITATIONS: usize = 3;

pub const QA_SYSTEM_PROMPT: &str = "You answer questions during a live meeting. \
Use the transcript first, then the retrieved snippets. Be concise. \
If the evidence is insufficient, say so clearly. Do not invent facts. \
Output short answer text with no markdown.";

/// A Tier-1 document hit, already normalized for citations.
#[derive(Debug, Clone)]
pub struct DocHit {
    pub source: String,
    pub snippet: String,
}

/// Tier-1 retrieval seam: documents scoped to one meeting.
#[async_trait]
pub trait DocRetriever: Send + Sync {
    async fn retrieve(&self, question: &str, meeting_id: &str) -> Result<Vec<DocHit>>;
}

/// Tier-2 web search seam, only reachable through the approval flow or an
/// explicit `web_allowed` scope.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<String>>;
}

/// Web search over a configurable HTTP endpoint returning a JSON array of
/// snippet strings. Unset endpoint means no results, never an error.
pub struct HttpWebSearch {
    client: reqwest::Client,
    url: Option<String>,
}

impl HttpWebSearch {
    pub fn new(url: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build web search HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl WebSearch for HttpWebSearch {
    async fn search(&self, query: &str) -> Result<Vec<String>> {
        let Some(url) = self.url.as_deref() else {
            return Ok(Vec::new());
        };
        let response = self
            .client
            .get(url)
            .query(&[("q", query)])
            .send()
            .await
            .context("web search request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("web search error: {}", response.status());
        }
        let payload: Value = response.json().await.context("web search returned non-JSON")?;
        let snippets = payload
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(snippets)
    }
}

pub fn normalize_doc_hits(hits: Vec<DocHit>) -> Vec<Citation> {
    hits.into_iter()
        .take(MAX_DOC_HITS)
        .map(|hit| Citation::Document {
            source: hit.source,
            snippet: hit.snippet,
        })
        .collect()
}

pub fn web_citations(snippets: &[String]) -> Vec<Citation> {
    snippets
        .iter()
        .map(|snippet| Citation::Web {
            source: "web".to_string(),
            snippet: snippet.clone(),
        })
        .collect()
}

/// Tier-0 evidence: transcript segments containing any query token
/// (case-insensitive), the last 10 segments when nothing matches, plus the
/// most recent captured frames. Returns citations and the transcript
/// window excerpt used for prompting.
pub fn search_tier0(sess: &Session, query: &str) -> (Vec<Citation>, String) {
    let token_re = Regex::new(r"[\p{L}\p{N}_]{2,}").expect("static regex");
    let tokens: Vec<String> = token_re
        .find_iter(&query.to_lowercase())
        .map(|token| token.as_str().to_string())
        .collect();

    let mut segments: Vec<_> = sess.transcript_segments.values().collect();
    segments.sort_by(|a, b| {
        (a.start_ts_ms, a.seg_id.as_str()).cmp(&(b.start_ts_ms, b.seg_id.as_str()))
    });

    let mut matches: Vec<_> = if tokens.is_empty() {
        Vec::new()
    } else {
        segments
            .iter()
            .filter(|seg| {
                let haystack = seg.text.to_lowercase();
                tokens.iter().any(|token| haystack.contains(token))
            })
            .copied()
            .collect()
    };
    if matches.is_empty() {
        let skip = segments.len().saturating_sub(TIER0_FALLBACK_SEGMENTS);
        matches = segments.into_iter().skip(skip).collect();
    }

    let transcript_window = matches
        .iter()
        .map(|seg| {
            format!(
                "[{} {}] {}",
                seg.speaker,
                format_mmss_from_ms((seg.start_ts_ms - sess.started_ts_ms).max(0)),
                seg.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut citations: Vec<Citation> = matches
        .iter()
        .take(MAX_TIER0_CITATIONS)
        .map(|seg| Citation::Transcript {
            seg_id: seg.seg_id.clone(),
            ts_ms: seg.start_ts_ms,
            speaker: seg.speaker.clone(),
        })
        .collect();

    let mut frames: Vec<_> = sess.captured_frames.values().collect();
    frames.sort_by(|a, b| (a.ts_ms, a.frame_id.as_str()).cmp(&(b.ts_ms, b.frame_id.as_str())));
    let skip = frames.len().saturating_sub(RECENT_FRAME_CITATIONS);
    for frame in frames.into_iter().skip(skip) {
        citations.push(Citation::Image {
            frame_id: frame.frame_id.clone(),
            ts_ms: frame.ts_ms,
            uri: frame.uri.clone(),
        });
    }

    (citations, transcript_window)
}

/// Prompt body for the external QA call.
pub fn build_qa_prompt(question: &str, transcript_window: &str, docs: &[Citation]) -> String {
    let mut snippet = transcript_window.to_string();
    if snippet.chars().count() > 1_600 {
        snippet = snippet.chars().take(1_600).collect::<String>() + "...";
    }
    let doc_lines = docs
        .iter()
        .filter_map(|citation| match citation {
            Citation::Document { source, snippet } | Citation::Web { source, snippet } => {
                Some(format!("- ({}) {}", source, snippet))
            }
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Question: {}\n\nTranscript window:\n{}\n\nRetrieved snippets:\n{}",
        question, snippet, doc_lines
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use crate::types::{CapturedFrameMeta, DiffScore, Roi, TranscriptSeg};

    fn seeded_session() -> crate::session::SharedSession {
        let registry = SessionRegistry::new();
        let shared = registry.ensure("s1", None, 0).session;
        {
            let mut sess = shared.lock();
            for (idx, text) in [
                "we agreed to ship the parser on Friday",
                "the cache layer needs a rewrite",
                "unrelated chatter about lunch",
            ]
            .iter()
            .enumerate()
            {
                let seg_id = format!("s1:r1:s{:03}", idx);
                sess.transcript_segments.insert(
                    seg_id.clone(),
                    TranscriptSeg {
                        seg_id,
                        speaker: "SPEAKER_01".to_string(),
                        offset: "00:00".to_string(),
                        start_ts_ms: (idx as i64 + 1) * 1_000,
                        end_ts_ms: None,
                        text: text.to_string(),
                        confidence: 1.0,
                        record_id: 1,
                    },
                );
            }
            for idx in 0..5 {
                let frame_id = format!("f{}", idx);
                sess.captured_frames.insert(
                    frame_id.clone(),
                    CapturedFrameMeta {
                        frame_id,
                        ts_ms: idx * 500,
                        roi: Roi::full(640, 360),
                        checksum: format!("sum{}", idx),
                        uri: format!("/files/f{}.webp", idx),
                        diff_score: DiffScore {
                            hash_dist: 18.0,
                            ssim: 0.5,
                        },
                    },
                );
            }
        }
        shared
    }

    #[test]
    fn tier0_matches_tokens_case_insensitively() {
        let shared = seeded_session();
        let sess = shared.lock();
        let (citations, window) = search_tier0(&sess, "What about the PARSER?");
        let transcript_citations: Vec<_> = citations
            .iter()
            .filter(|c| matches!(c, Citation::Transcript { .. }))
            .collect();
        assert_eq!(transcript_citations.len(), 1);
        assert!(window.contains("parser"));
        // The last three frames ride along as citations.
        let image_citations = citations
            .iter()
            .filter(|c| matches!(c, Citation::Image { .. }))
            .count();
        assert_eq!(image_citations, 3);
    }

    #[test]
    fn tier0_falls_back_to_recent_segments() {
        let shared = seeded_session();
        let sess = shared.lock();
        let (citations, window) = search_tier0(&sess, "zzz qqq");
        let transcript_citations = citations
            .iter()
            .filter(|c| matches!(c, Citation::Transcript { .. }))
            .count();
        assert_eq!(transcript_citations, 3);
        assert!(window.contains("lunch"));
    }

    #[test]
    fn tier0_on_empty_session_has_no_citations() {
        let registry = SessionRegistry::new();
        let shared = registry.ensure("empty", None, 0).session;
        let sess = shared.lock();
        let (citations, window) = search_tier0(&sess, "anything");
        assert!(citations.is_empty());
        assert!(window.is_empty());
    }

    #[test]
    fn doc_hits_cap_at_five() {
        let hits: Vec<DocHit> = (0..9)
            .map(|idx| DocHit {
                source: format!("doc{}", idx),
                snippet: "text".to_string(),
            })
            .collect();
        assert_eq!(normalize_doc_hits(hits).len(), 5);
    }

    #[test]
    fn qa_prompt_includes_docs_and_truncates_window() {
        let docs = vec![Citation::Document {
            source: "spec.pdf".to_string(),
            snippet: "the parser handles unicode".to_string(),
        }];
        let long_window = "x".repeat(2_000);
        let prompt = build_qa_prompt("does it handle unicode?", &long_window, &docs);
        assert!(prompt.contains("spec.pdf"));
        assert!(prompt.contains("..."));
        assert!(prompt.len() < 2_000 + 400);
    }

    #[tokio::test]
    async fn http_web_search_without_url_returns_empty() {
        let search = HttpWebSearch::new(None).unwrap();
        assert!(search.search("anything").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn http_web_search_parses_snippet_array() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Regex(r"^/search".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"["first result", "second result"]"#)
            .create_async()
            .await;

        let search = HttpWebSearch::new(Some(format!("{}/search", server.url()))).unwrap();
        let results = search.search("query").await.unwrap();
        assert_eq!(results, vec!["first result", "second result"]);
    }
}
