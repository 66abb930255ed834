use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

pub const SUPPORTED_IMAGE_EXTENSIONS: [&str; 7] =
    ["jpg", "jpeg", "png", "bmp", "gif", "tiff", "webp"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_IMAGE_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

/// All image files under `directory`, recursively, sorted by path.
///
/// Entries that cannot be read are logged and left out, so a directory
/// without images yields an empty list rather than an error.
pub fn get_image_files(directory: impl AsRef<Path>) -> Vec<PathBuf> {
    let mut image_files = WalkDir::new(directory.as_ref())
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.into_path()),
            Err(e) => {
                warn!("failed to read directory entry: {}", e);
                None
            }
        })
        .filter(|path| path.is_file() && is_supported_image(path))
        .collect::<Vec<_>>();

    image_files.sort();
    image_files
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, b"").expect("write file");
    }

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_image(Path::new("a.png")));
        assert!(is_supported_image(Path::new("a.JPEG")));
        assert!(is_supported_image(Path::new("dir/b.WebP")));
        assert!(!is_supported_image(Path::new("c.txt")));
        assert!(!is_supported_image(Path::new("png")));
        assert!(!is_supported_image(Path::new("archive.png.zip")));
    }

    #[test]
    fn test_get_image_files_filters_and_sorts() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path();
        for name in ["b.jpg", "a.png", "c.txt", "nested/d.TIFF", "nested/e.md", "Z.GIF"] {
            touch(&root.join(name));
        }
        // a directory with an image-like name is not a file
        fs::create_dir_all(root.join("folder.png")).expect("create dir");

        let files = get_image_files(root);
        assert_eq!(
            files,
            vec![
                root.join("Z.GIF"),
                root.join("a.png"),
                root.join("b.jpg"),
                root.join("nested/d.TIFF"),
            ]
        );
        assert!(files.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(get_image_files(root), files);
    }

    #[test]
    fn test_empty_and_missing_directories() {
        let dir = tempfile::tempdir().expect("temp dir");
        touch(&dir.path().join("notes.txt"));
        assert!(get_image_files(dir.path()).is_empty());
        assert!(get_image_files(dir.path().join("missing")).is_empty());
    }
}
