//! Page images read from a directory on disk.
//!
//! Every `jpg`, `jpeg`, `png` or `webp` file in the directory is a page, in
//! natural filename order. Oversized scans are downscaled and re-encoded as
//! JPEG before they are sent for analysis.

use crate::text_utils::natural_cmp;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use image::ImageReader;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use koma_core::{AnalysisError, PageImage, PageIndex, PageSource};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];
const JPEG_QUALITY: u8 = 85;

pub struct DirectoryPages {
    files: Vec<PathBuf>,
    max_dimension: u32,
}

impl DirectoryPages {
    /// Scan `dir` for page images. `max_dimension` of 0 disables downscaling.
    pub fn open(dir: &Path, max_dimension: u32) -> Result<Self> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read page directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file() && is_page_image(path))
            .collect();
        if files.is_empty() {
            bail!("No page images found in {}", dir.display());
        }
        files.sort_by(|a, b| natural_cmp(&file_name(a), &file_name(b)));
        info!(
            dir = %dir.display(),
            pages = files.len(),
            "Loaded page list"
        );
        Ok(Self {
            files,
            max_dimension,
        })
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Natural size of a page, read from the image header only.
    pub fn dimensions(&self, page: PageIndex) -> Option<(u32, u32)> {
        let path = self.files.get(page)?;
        match image::image_dimensions(path) {
            Ok(size) => Some(size),
            Err(err) => {
                debug!(page, path = %path.display(), "Could not read page size: {err}");
                None
            }
        }
    }
}

#[async_trait]
impl PageSource for DirectoryPages {
    fn page_count(&self) -> usize {
        self.files.len()
    }

    async fn load(&self, page: PageIndex) -> Result<PageImage, AnalysisError> {
        let path = self
            .files
            .get(page)
            .cloned()
            .ok_or_else(|| AnalysisError::PageLoad {
                page,
                reason: "page index out of range".to_string(),
            })?;
        let max_dimension = self.max_dimension;
        let (mime_type, data) =
            tokio::task::spawn_blocking(move || encode_page(&path, max_dimension))
                .await
                .map_err(|err| AnalysisError::PageLoad {
                    page,
                    reason: err.to_string(),
                })?
                .map_err(|err| AnalysisError::PageLoad {
                    page,
                    reason: format!("{err:#}"),
                })?;
        debug!(page, bytes = data.len(), %mime_type, "Page image ready");
        Ok(PageImage {
            page,
            mime_type,
            data,
        })
    }
}

fn encode_page(path: &Path, max_dimension: u32) -> Result<(String, Vec<u8>)> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mime_type = mime_for(path).to_string();
    if max_dimension == 0 {
        return Ok((mime_type, bytes));
    }

    let (width, height) = ImageReader::new(Cursor::new(&bytes))
        .with_guessed_format()?
        .into_dimensions()
        .with_context(|| format!("Unreadable image {}", path.display()))?;
    if width.max(height) <= max_dimension {
        return Ok((mime_type, bytes));
    }

    let image = image::load_from_memory(&bytes)
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    let resized = image
        .resize(max_dimension, max_dimension, FilterType::Triangle)
        .to_rgb8();
    debug!(
        path = %path.display(),
        from = ?(width, height),
        to = ?resized.dimensions(),
        "Downscaled page"
    );
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(&resized)
        .context("Failed to re-encode page as JPEG")?;
    Ok(("image/jpeg".to_string(), out))
}

fn is_page_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}
