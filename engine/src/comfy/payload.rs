use std::{
    io::Write,
    path::{Path, PathBuf},
};

use base64::{Engine, prelude::BASE64_STANDARD};
use color_eyre::Result;
use tempfile::NamedTempFile;

use super::ComfyError;

const DEFAULT_EXTENSION: &str = "png";

#[derive(Debug, PartialEq, Eq)]
pub struct DecodedImage {
    pub bytes: Vec<u8>,
    pub extension: &'static str,
}

/// Decodes `[<format marker>,]<base64>`, e.g. `data:image/png;base64,iVBO...`.
pub fn decode_image(blob: &str) -> Result<DecodedImage, ComfyError> {
    let (marker, data) = match blob.split_once(',') {
        Some((marker, data)) => (Some(marker), data),
        None => (None, blob),
    };

    let bytes = BASE64_STANDARD
        .decode(data.trim())
        .map_err(|e| ComfyError::BadImagePayload(e.to_string()))?;
    if bytes.is_empty() {
        return Err(ComfyError::BadImagePayload("empty image".into()));
    }

    Ok(DecodedImage {
        bytes,
        extension: marker.map_or(DEFAULT_EXTENSION, extension_for),
    })
}

/// Maps a format marker or file name onto the extension we save under.
pub fn extension_for(hint: &str) -> &'static str {
    let hint = hint.to_ascii_lowercase();
    if hint.contains("jpeg") || hint.contains("jpg") {
        "jpg"
    } else if hint.contains("webp") {
        "webp"
    } else if hint.contains("gif") {
        "gif"
    } else {
        DEFAULT_EXTENSION
    }
}

/// Writes the bytes to a temp file in `dir` and syncs it. Dropping the
/// returned file deletes it; `persist` moves it into place.
pub fn stage_image(dir: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Writes `<dir>/<stem>.<extension>`. The final path only ever holds a
/// complete image.
pub fn write_image(dir: &Path, stem: &str, image: &DecodedImage) -> Result<PathBuf> {
    let path = image_path(dir, stem, image.extension);
    stage_image(dir, &image.bytes)?.persist(&path)?;
    Ok(path)
}

pub fn image_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    dir.join(format!("{stem}.{extension}"))
}
