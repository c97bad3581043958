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

use anyhow::{Context, Result};
use dirs::home_dir;
use std::env;
use std::path::PathBuf;

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .unwrap_or_default()
        .parse::<i64>()
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .unwrap_or_default()
        .parse::<u32>()
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name)
        .unwrap_or_default()
        .parse::<f64>()
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub record_ms: i64,
    pub window_ms: i64,
    pub window_overlap_ms: i64,
    pub video_sample_ms: i64,
    pub dhash_threshold: u32,
    pub candidate_ticks: u32,
    pub ssim_threshold: f64,
    pub cooldown_ms: i64,
    pub capture_width: u32,
    pub capture_height: u32,
    pub detect_width: u32,
    pub detect_height: u32,
}

impl PipelineConfig {
    pub fn window_stride_ms(&self) -> i64 {
        (self.window_ms - self.window_overlap_ms).max(1_000)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            record_ms: 30_000,
            window_ms: 120_000,
            window_overlap_ms: 15_000,
            video_sample_ms: 1_000,
            dhash_threshold: 16,
            candidate_ticks: 2,
            ssim_threshold: 0.90,
            cooldown_ms: 2_000,
            capture_width: 960,
            capture_height: 540,
            detect_width: 320,
            detect_height: 180,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            max_tokens: 1024,
            temperature: 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub llm: LlmConfig,
    pub asr_url: Option<String>,
    pub web_search_url: Option<String>,
    pub database_path: PathBuf,
    pub upload_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub ingest_token_secret: String,
    pub bind_addr: String,
    pub bus_capacity: usize,
    pub session_idle_timeout_ms: i64,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let pipeline = PipelineConfig {
            record_ms: env_i64("RECORD_MS", 30_000).max(1_000),
            window_ms: env_i64("WINDOW_MS", 120_000).max(10_000),
            window_overlap_ms: env_i64("WINDOW_OVERLAP_MS", 15_000).max(0),
            video_sample_ms: env_i64("VIDEO_SAMPLE_MS", 1_000).max(200),
            dhash_threshold: env_u32("DHASH_THRESHOLD", 16).max(1),
            candidate_ticks: env_u32("CANDIDATE_TICKS", 2).max(1),
            ssim_threshold: env_f64("SSIM_THRESHOLD", 0.90),
            cooldown_ms: env_i64("COOLDOWN_MS", 2_000).max(0),
            capture_width: env_u32("CAPTURE_WIDTH", 960).max(160),
            capture_height: env_u32("CAPTURE_HEIGHT", 540).max(90),
            detect_width: env_u32("DETECTION_WIDTH", 320).max(64),
            detect_height: env_u32("DETECTION_HEIGHT", 180).max(36),
        };

        let llm = LlmConfig {
            api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
            model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            base_url: env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            max_tokens: env_u32("OPENAI_MAX_TOKENS", 1024),
            temperature: env_f64("OPENAI_TEMPERATURE", 0.3),
        };

        let asr_url = env::var("ASR_URL")
            .ok()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let web_search_url = env::var("WEB_SEARCH_URL")
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        let base_dir = home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".meeting-companion");

        let database_path = env::var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("companion.db"));

        let upload_dir = env::var("UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./uploaded_files"));

        let temp_dir = env::var("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base_dir.join("temp"));

        std::fs::create_dir_all(&temp_dir).context("Failed to create temporary directory")?;
        std::fs::create_dir_all(&upload_dir).context("Failed to create upload directory")?;
        if let Some(parent) = database_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let ingest_token_secret = env::var("INGEST_TOKEN_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production".to_string());

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8900".to_string());

        let bus_capacity = env_i64("BUS_CAPACITY", 256).max(16) as usize;
        let session_idle_timeout_ms = env_i64("SESSION_IDLE_TIMEOUT_MS", 600_000).max(10_000);

        Ok(Config {
            pipeline,
            llm,
            asr_url,
            web_search_url,
            database_path,
            upload_dir,
            temp_dir,
            ingest_token_secret,
            bind_addr,
            bus_capacity,
            session_idle_timeout_ms,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            llm: LlmConfig::default(),
            asr_url: None,
            web_search_url: None,
            database_path: PathBuf::from("companion.db"),
            upload_dir: PathBuf::from("./uploaded_files"),
            temp_dir: std::env::temp_dir(),
            ingest_token_secret: "dev-secret-change-in-production".to_string(),
            bind_addr: "127.0.0.1:8900".to_string(),
            bus_capacity: 256,
            session_idle_timeout_ms: 600_000,
        }
    }
}
