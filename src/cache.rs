//! Small per-source cache: the last viewed page and config overrides.
//!
//! Files are stored under `.cache/` using a hash of the source directory path
//! as the folder name to avoid filesystem issues. Nothing about bubble
//! analysis is persisted; that lives only as long as the session.

use crate::config::{AppConfig, parse_config, serialize_config};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CACHE_DIR: &str = ".cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub page: usize,
}

pub fn load_bookmark(source: &Path) -> Option<Bookmark> {
    load_bookmark_in(Path::new(CACHE_DIR), source)
}

/// Persist the current page. Errors are ignored to keep the session
/// responsive.
pub fn save_bookmark(source: &Path, bookmark: &Bookmark) {
    save_bookmark_in(Path::new(CACHE_DIR), source, bookmark);
}

pub fn load_source_config(source: &Path) -> Option<AppConfig> {
    load_source_config_in(Path::new(CACHE_DIR), source)
}

pub fn save_source_config(source: &Path, config: &AppConfig) {
    save_source_config_in(Path::new(CACHE_DIR), source, config);
}

pub fn hash_dir(root: &Path, source: &Path) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(source.as_os_str().to_string_lossy().as_bytes());
    let hash = format!("{:x}", hasher.finalize());
    root.join(hash)
}

fn load_bookmark_in(root: &Path, source: &Path) -> Option<Bookmark> {
    let data = fs::read_to_string(hash_dir(root, source).join("bookmark.toml")).ok()?;
    toml::from_str(&data).ok()
}

fn save_bookmark_in(root: &Path, source: &Path, bookmark: &Bookmark) {
    let dir = hash_dir(root, source);
    let _ = fs::create_dir_all(&dir);
    if let Ok(contents) = toml::to_string(bookmark) {
        if let Err(err) = fs::write(dir.join("bookmark.toml"), contents) {
            debug!(path = %source.display(), "Could not save bookmark: {err}");
        }
    }
}

fn load_source_config_in(root: &Path, source: &Path) -> Option<AppConfig> {
    let data = fs::read_to_string(hash_dir(root, source).join("config.toml")).ok()?;
    parse_config(&data).ok()
}

fn save_source_config_in(root: &Path, source: &Path, config: &AppConfig) {
    let dir = hash_dir(root, source);
    let _ = fs::create_dir_all(&dir);
    if let Ok(contents) = serialize_config(config) {
        let _ = fs::write(dir.join("config.toml"), contents);
    }
}
