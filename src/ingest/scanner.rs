use walkdir::{WalkDir, DirEntry};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use anyhow::{Result, Context, bail};
use tracing::{debug, warn};

use crate::media::mimetype;

/// A source video and the identifier its artifacts are stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Video {
    pub id: String,
    pub path: PathBuf,
}

impl Video {
    pub fn from_path(path: &Path) -> Option<Self> {
        let id = path.file_stem()?.to_str()?.to_string();
        if id.is_empty() {
            return None;
        }
        Some(Self { id, path: path.to_path_buf() })
    }
}

/// Lists the videos directly inside `root`, sorted by id.
///
/// Hidden files and files that do not sniff as `video/*` are skipped. Two
/// files mapping to the same id abort the scan, since their artifacts would
/// collide.
pub fn scan_directory(root: &Path) -> Result<Vec<Video>> {
    let walker = WalkDir::new(root).min_depth(1).max_depth(1).into_iter();

    let mut videos = Vec::new();
    for entry in walker.filter_entry(|e| !is_hidden(e)) {
        let entry = entry.with_context(|| format!("Failed to scan {:?}", root))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        match mimetype::is_video(path) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Skipping non-video file {:?}", path);
                continue;
            }
            Err(e) => {
                warn!("Skipping {:?}: {}", path, e);
                continue;
            }
        }
        match Video::from_path(path) {
            Some(video) => videos.push(video),
            None => warn!("Skipping {:?}: file name is not a usable identifier", path),
        }
    }

    let mut seen: HashMap<&str, &Path> = HashMap::new();
    for video in &videos {
        if let Some(previous) = seen.insert(&video.id, &video.path) {
            bail!(
                "Duplicate video identifier '{}' ({:?} and {:?})",
                video.id,
                previous,
                video.path
            );
        }
    }

    videos.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(videos)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name()
         .to_str()
         .map(|s| s.starts_with('.'))
         .unwrap_or(false)
}
