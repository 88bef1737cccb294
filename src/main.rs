//! Entry point for the manga reader.
//!
//! Responsibilities here are intentionally minimal:
//! - Parse command-line arguments.
//! - Load user configuration from `conf/config.toml` plus cached overrides.
//! - Wire the page directory, analysis service and speech engine into a
//!   reading session.
//! - Run the stdin command loop until the reader quits.

mod cache;
mod config;
mod gemini;
mod pages;
mod shortcuts;
mod speech;
mod text_utils;

use crate::cache::{Bookmark, load_bookmark, load_source_config, save_bookmark, save_source_config};
use crate::config::{AppConfig, load_config};
use crate::gemini::GeminiAnalysisService;
use crate::pages::DirectoryPages;
use crate::shortcuts::{Shortcut, help_text, parse_line};
use crate::speech::CommandSpeechEngine;
use anyhow::{Context, Result, anyhow};
use koma_core::cancellation::CancellationToken;
use koma_core::{
    CacheHandle, CacheUpdate, PageStatus, PlaybackState, ReaderSession, ReaderSnapshot,
    TextNormalizer,
};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

type ReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

#[tokio::main]
async fn main() {
    let reload_handle = init_tracing();
    if let Err(err) = run(&reload_handle).await {
        error!("{err:?}");
        std::process::exit(1);
    }
}

async fn run(reload_handle: &ReloadHandle) -> Result<()> {
    let source_dir = parse_args()?;
    let base_config = load_config(Path::new("conf/config.toml"));
    let config = match load_source_config(&source_dir) {
        Some(overrides) => {
            info!("Loaded per-source overrides from cache");
            base_config.with_overrides(overrides)
        }
        None => base_config,
    };
    set_log_level(reload_handle, config.log_level.as_filter_str());
    info!(
        path = %source_dir.display(),
        level = %config.log_level,
        "Starting manga reader"
    );
    info!(
        batch_size = config.batch_size,
        prefetch_delay_ms = config.prefetch_delay_ms,
        model = %config.analysis_model,
        speech = %config.speech_command,
        "Active pipeline configuration"
    );

    let pages = Arc::new(DirectoryPages::open(&source_dir, config.max_image_dimension)?);
    let page_count = pages.files().len();
    let start_page = match load_bookmark(&source_dir) {
        Some(bookmark) => {
            info!(page = bookmark.page, "Resuming from cached page");
            bookmark.page.min(page_count.saturating_sub(1))
        }
        None => 0,
    };

    let service = Arc::new(
        GeminiAnalysisService::from_config(&config).context("Failed to build analysis client")?,
    );
    let engine = Arc::new(CommandSpeechEngine::from_config(&config));
    let mut session = ReaderSession::start(
        config.session_settings(start_page),
        service,
        pages.clone(),
        engine,
        TextNormalizer::load_default(),
    );

    let quit = CancellationToken::new();
    {
        let quit = quit.clone();
        ctrlc::set_handler(move || quit.cancel()).context("Failed to install Ctrl-C handler")?;
    }
    let echo = tokio::spawn(echo_highlights(
        session.subscribe_playback(),
        session.cache().clone(),
    ));

    println!("{}", help_text(&config));
    show_page(&session.snapshot(), &pages);
    command_loop(&mut session, &config, &pages, &quit).await;

    echo.abort();
    save_bookmark(
        &source_dir,
        &Bookmark {
            page: session.current_page(),
        },
    );
    let failed = session.coordinator().snapshot().pages_with(PageStatus::Error);
    if !failed.is_empty() {
        let numbers: Vec<usize> = failed.iter().map(|page| page + 1).collect();
        warn!(pages = ?numbers, "Some pages could not be analyzed this session");
    }
    let last = session.snapshot();
    save_source_config(
        &source_dir,
        &config.with_session_state(last.analysis_enabled, last.speech_enabled),
    );
    session.close();
    Ok(())
}

async fn command_loop(
    session: &mut ReaderSession,
    config: &AppConfig,
    pages: &DirectoryPages,
    quit: &CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut updates = session.subscribe_updates();

    loop {
        tokio::select! {
            _ = quit.cancelled() => {
                info!("Interrupted; saving and exiting");
                break;
            }
            update = updates.recv() => match update {
                Ok(update) => report_update(session, pages, &update),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("Failed to read from stdin: {err}");
                        break;
                    }
                };
                match parse_line(config, &line) {
                    Ok(None) => {}
                    Ok(Some(Shortcut::Quit)) => break,
                    Ok(Some(Shortcut::Help)) => println!("{}", help_text(config)),
                    Ok(Some(Shortcut::ShowPage)) => show_page(&session.snapshot(), pages),
                    Ok(Some(Shortcut::Session(command))) => {
                        let event = session.apply_command(command);
                        info!(action = event.action, page = event.snapshot.current_page, "Command applied");
                        show_page(&event.snapshot, pages);
                    }
                    Err(err) => println!("{err}; type `help` for commands"),
                }
            }
        }
    }
}

fn report_update(session: &ReaderSession, pages: &DirectoryPages, update: &CacheUpdate) {
    if update.page != session.current_page() {
        return;
    }
    match update.entry.status {
        PageStatus::Complete | PageStatus::Error => show_page(&session.snapshot(), pages),
        PageStatus::Loading | PageStatus::Pending => {}
    }
}

async fn echo_highlights(mut playback: watch::Receiver<PlaybackState>, cache: CacheHandle) {
    while playback.changed().await.is_ok() {
        let state = *playback.borrow_and_update();
        let (Some(page), Some(idx)) = (state.spoken_for_page, state.currently_spoken_bubble) else {
            continue;
        };
        if let Some(bubble) = cache.entry(page).and_then(|entry| entry.bubbles.get(idx).cloned()) {
            println!("  >> [{}] {}", idx + 1, bubble.text.replace('\n', " "));
        }
    }
}

fn show_page(snapshot: &ReaderSnapshot, pages: &DirectoryPages) {
    print_page(snapshot, pages.dimensions(snapshot.current_page));
}

/// Bubble boxes are shown in pixels when the page size is known, otherwise on
/// the 0-1000 scale.
fn print_page(snapshot: &ReaderSnapshot, page_size: Option<(u32, u32)>) {
    let on_off = |flag: bool| if flag { "on" } else { "off" };
    println!(
        "Page {}/{} (batch {}) [{}] analysis:{} speech:{} in-flight:{:?}",
        snapshot.current_page + 1,
        snapshot.total_pages,
        snapshot.current_batch + 1,
        snapshot.status,
        on_off(snapshot.analysis_enabled),
        on_off(snapshot.speech_enabled),
        snapshot.in_flight_batches,
    );
    for (idx, bubble) in snapshot.bubbles.iter().enumerate() {
        let marker = if snapshot.highlighted_bubble == Some(idx) {
            '>'
        } else {
            ' '
        };
        let text = bubble.text.replace('\n', " ");
        match page_size {
            Some((width, height)) => {
                let rect = bubble.bbox.to_pixels(width, height);
                println!(
                    "  {marker}{:>2}. {text}  ({}x{} at {},{})",
                    idx + 1,
                    rect.width,
                    rect.height,
                    rect.left,
                    rect.top,
                );
            }
            None => println!(
                "  {marker}{:>2}. {text}  (y {}-{}, x {}-{})",
                idx + 1,
                bubble.bbox.ymin(),
                bubble.bbox.ymax(),
                bubble.bbox.xmin(),
                bubble.bbox.xmax(),
            ),
        }
    }
}

fn parse_args() -> Result<PathBuf> {
    let mut args = env::args().skip(1);
    let path = args
        .next()
        .ok_or_else(|| anyhow!("Usage: koma-reader <page-directory>"))?;

    let path = PathBuf::from(path);
    if !path.is_dir() {
        return Err(anyhow!("Not a directory: {}", path.as_path().display()));
    }
    Ok(path)
}

fn init_tracing() -> ReloadHandle {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let (filter_layer, handle) = reload::Layer::new(env_filter);
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(std::io::stderr)
                .with_filter(filter_layer),
        )
        .init();
    warn!("Logging initialized; override level with config.log_level or RUST_LOG");
    handle
}

fn set_log_level(handle: &ReloadHandle, level: &str) {
    let parsed = EnvFilter::builder()
        .parse(level)
        .unwrap_or_else(|_| EnvFilter::new("debug"));
    if let Err(err) = handle.modify(|filter| *filter = parsed.clone()) {
        warn!(%level, "Failed to update log level from config: {err}");
    } else {
        info!(%level, "Applied log level from config");
    }
}
