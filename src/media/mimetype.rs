use std::path::Path;
use anyhow::{Result, Context};

pub fn detect_mimetype(path: &Path) -> Result<String> {
    let kind = infer::get_from_path(path)
        .with_context(|| format!("Failed to read {:?} for mimetype detection", path))?;

    match kind {
        Some(k) => Ok(k.mime_type().to_string()),
        None => Ok("application/octet-stream".to_string()),
    }
}

pub fn is_video(path: &Path) -> Result<bool> {
    Ok(detect_mimetype(path)?.starts_with("video/"))
}
