//! Service entry point for the jukestream broadcaster.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{error, info, warn};

use jukestream::{
    CommandSurface, Database, EncoderProfile, Moderator, Queue, RtmpBroadcaster, Settings, Worker,
    YtDlpFetcher,
};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("jukestream starting");

    let settings = Settings::from_env().context("invalid configuration")?;

    std::fs::create_dir_all(&settings.media_dir).with_context(|| {
        format!(
            "failed to create media directory {}",
            settings.media_dir.display()
        )
    })?;
    if let Some(parent) = settings.database_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("failed to create database directory {}", parent.display())
        })?;
    }

    let db = Database::new(&settings.database_path)
        .await
        .context("failed to open database")?;
    let queue = Queue::new(db);

    // Crash repair must complete before the first dequeue
    let repaired = queue
        .repair_interrupted()
        .await
        .context("startup repair failed")?;
    if repaired > 0 {
        warn!(repaired, "marked interrupted items from a previous run as failed");
    }

    let moderator = Moderator::new(
        settings.model_dir.clone(),
        settings.content_filter_script.clone(),
        settings.ffmpeg_bin.clone(),
    );

    // Load the classifier eagerly so the first submission does not pay the
    // model-load latency, and so a dead-on-arrival gate is caught now.
    let model_ready = moderator.ensure_loaded().await;
    if !model_ready && !moderator.has_fallback() {
        bail!("classifier model unavailable and no CONTENT_FILTER_SCRIPT configured");
    }
    if !model_ready {
        warn!("classifier model unavailable, moderation will use the fallback script");
    }

    let fetcher = Arc::new(YtDlpFetcher::new(
        settings.ytdlp_bin.clone(),
        settings.media_dir.clone(),
        settings.max_duration_seconds,
        settings.max_file_size_mb,
    ));
    let broadcaster = Arc::new(RtmpBroadcaster::new(
        settings.ffmpeg_bin.clone(),
        settings.rtmp_url.clone(),
        settings.idle_image.clone(),
        EncoderProfile {
            bitrate_video: settings.stream_bitrate_video.clone(),
            bitrate_audio: settings.stream_bitrate_audio.clone(),
            preset: settings.stream_preset.clone(),
        },
    ));

    let worker = Arc::new(Worker::new(
        queue.clone(),
        fetcher,
        Arc::new(moderator),
        broadcaster,
    ));

    // The chat adapter attaches here; the surface is handed to it out of
    // process scope, so just keep it alive for the worker's lifetime.
    let _surface = CommandSurface::new(queue, Arc::clone(&worker));

    let worker_task = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.run().await })
    };

    shutdown_signal().await;
    info!("shutdown requested, draining");
    worker.stop();

    if let Err(err) = worker_task.await {
        error!(error = %err, "worker task panicked");
    }

    info!("jukestream stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
