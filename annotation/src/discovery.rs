//! Image discovery for a task's input directory

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use tracing::{info, warn};

/// Extensions accepted as input images (compared case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Errors from resolving the image set
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Input directory does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Input path is not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Result type for discovery
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|i| i.eq_ignore_ascii_case(ext)))
}

/// Sorted image files under `input_dir`, truncated to `max_files`.
///
/// Hidden entries are skipped; `.gitignore` rules are not applied since data
/// directories are routinely ignored by the surrounding repository.
pub fn find_images(input_dir: &Path, recursive: bool, max_files: Option<usize>) -> DiscoveryResult<Vec<PathBuf>> {
    if !input_dir.exists() {
        return Err(DiscoveryError::NotFound(input_dir.to_path_buf()));
    }
    if !input_dir.is_dir() {
        return Err(DiscoveryError::NotADirectory(input_dir.to_path_buf()));
    }

    let mut builder = WalkBuilder::new(input_dir);
    builder.standard_filters(false).hidden(true);
    if !recursive {
        builder.max_depth(Some(1));
    }

    let mut images: Vec<PathBuf> = builder
        .build()
        .flatten()
        .map(|entry| entry.into_path())
        .filter(|path| path.is_file() && is_image(path))
        .collect();
    images.sort();

    if let Some(limit) = max_files {
        images.truncate(limit);
    }

    if images.is_empty() {
        warn!(dir = %input_dir.display(), "No image files found");
    } else {
        info!(dir = %input_dir.display(), count = images.len(), recursive, "Found images");
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"img").unwrap();
    }

    #[test]
    fn test_find_images_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.webp", ".hidden.png"] {
            touch(&dir.path().join(name));
        }
        touch(&dir.path().join("nested/d.jpeg"));

        let flat = find_images(dir.path(), false, None).unwrap();
        let names: Vec<_> = flat
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.webp"]);

        let deep = find_images(dir.path(), true, None).unwrap();
        assert_eq!(deep.len(), 4);
        assert!(deep.iter().any(|p| p.ends_with("nested/d.jpeg")));

        let limited = find_images(dir.path(), true, Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_find_images_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            find_images(&dir.path().join("missing"), false, None),
            Err(DiscoveryError::NotFound(_))
        ));

        let file = dir.path().join("file.png");
        touch(&file);
        assert!(matches!(
            find_images(&file, false, None),
            Err(DiscoveryError::NotADirectory(_))
        ));
    }
}
