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
use clap::{Parser, Subcommand};
use colored::*;

use meeting_companion_rs::auth::mint_ingest_token;
use meeting_companion_rs::config::Config;
use meeting_companion_rs::server;
use meeting_companion_rs::service::RealtimeService;

/// Meeting Companion Server - real-time audio/video ingest and recap pipeline
#[derive(Parser)]
#[command(name = "meeting-companion")]
#[command(version = "0.1.0")]
#[command(about = "Real-time meeting companion: streaming transcripts, slide capture, live recaps, evidence-backed Q&A")]
#[command(long_about = "
Meeting Companion Server - Rust Edition

A per-session audio/video ingest and recap pipeline:
• Streaming PCM audio rotated into fixed-duration records for batch STT
• Slide-change detection via perceptual hashing with SSIM confirmation
• Overlapping recap windows with revisions when late data arrives
• Evidence-constrained Q&A with human-approved web-search escalation

WebSocket channels per session:
• /ws/audio/{session_id}       - token-gated PCM ingest
• /ws/in-meeting/{session_id}  - test-only transcript injection
• /ws/frontend/{session_id}    - read-only event stream with replay
• /ws/realtime-av/{session_id} - multiplexed control/audio/video/query
")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the companion server (default)
    Serve,

    /// Show configuration and external-service status
    Status,

    /// Mint a signed ingest token for a session id
    Token {
        /// Session id the token is bound to
        session_id: String,
    },
}

async fn setup_logging() -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meeting-companion")
        .join("logs");

    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "meeting-companion.log");

    // File gets everything, stderr stays at info and above.
    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("meeting_companion_rs=debug".parse()?)
                        .add_directive("debug".parse()?),
                ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .with_thread_ids(false)
                .compact()
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("meeting_companion_rs=info".parse()?)
                        .add_directive("info".parse()?),
                ),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    tracing::info!("Logging system initialized");
    Ok(())
}

async fn show_status(config: &Config) -> Result<()> {
    let asr_status = if config.asr_url.is_some() {
        "✅".green()
    } else {
        "❌".red()
    };
    let llm_status = if !config.llm.api_key.is_empty() {
        "✅".green()
    } else {
        "❌".red()
    };
    let web_status = if config.web_search_url.is_some() {
        "✅".green()
    } else {
        "❌".red()
    };

    println!("   🎤 Batch STT (ASR_URL): {}", asr_status);
    println!("   🤖 LLM provider: {} ({})", llm_status, config.llm.model);
    println!("   🔎 Web search tier: {}", web_status);
    println!("   💾 Database: {}", config.database_path.display());
    println!("   📁 Uploads: {}", config.upload_dir.display());
    println!("   🔌 Bind address: {}", config.bind_addr);
    println!();
    println!(
        "   Records: {}ms | Windows: {}ms (overlap {}ms) | Video sample: {}ms",
        config.pipeline.record_ms,
        config.pipeline.window_ms,
        config.pipeline.window_overlap_ms,
        config.pipeline.video_sample_ms
    );

    if config.asr_url.is_none() {
        println!();
        println!(
            "{}",
            "⚠️  ASR_URL not set - audio records will carry a batch_asr_failed error".yellow()
        );
    }
    if config.llm.api_key.is_empty() {
        println!(
            "{}",
            "⚠️  OPENAI_API_KEY not set - recaps fall back to deterministic summaries".yellow()
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Status) => {
            let config = Config::load()?;
            show_status(&config).await?;
        }
        Some(Commands::Token { session_id }) => {
            let config = Config::load()?;
            println!(
                "{}",
                mint_ingest_token(&config.ingest_token_secret, &session_id)
            );
        }
        Some(Commands::Serve) | None => {
            setup_logging().await?;
            let config = Config::load()?;
            tracing::info!(
                "starting meeting companion server on {} (db: {})",
                config.bind_addr,
                config.database_path.display()
            );
            let service = RealtimeService::new(config).await?;
            server::run(service).await?;
        }
    }

    Ok(())
}
