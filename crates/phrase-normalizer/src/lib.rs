mod error;

pub use error::{NormalizeError, NormalizeResult};

use regex::{NoExpand, Regex, RegexBuilder};
use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};
use tracing::info;

/// Phrases rewritten to "video", longest forms first so "a photograph" wins
/// over "photograph".
pub const DEFAULT_PHRASES: [&str; 10] = [
    "a photograph",
    "a image",
    "a picture",
    "a photo",
    "an image",
    "an photo",
    "an picture",
    "photograph",
    "photo",
    "picture",
];

pub const VIDEO: &str = "video";
pub const ARTICLE_VIDEO: &str = "a video";

const TEXT_FILE_SUFFIX: &str = ".txt";

struct Rule {
    pattern: Regex,
    replacement: &'static str,
}

impl Rule {
    fn compile(phrase: &str) -> NormalizeResult<Self> {
        let pattern = RegexBuilder::new(&format!(r"\b{}\b", regex::escape(phrase)))
            .case_insensitive(true)
            .build()?;
        let replacement = if phrase.contains(char::is_whitespace) {
            ARTICLE_VIDEO
        } else {
            VIDEO
        };
        Ok(Self {
            pattern,
            replacement,
        })
    }
}

/// Case-insensitive whole-word phrase rewriter for caption files.
pub struct PhraseNormalizer {
    rules: Vec<Rule>,
}

impl PhraseNormalizer {
    /// Phrases with an article are replaced by "a video", bare nouns by
    /// "video". Rules apply in the given order.
    pub fn new<'a>(phrases: impl IntoIterator<Item = &'a str>) -> NormalizeResult<Self> {
        let rules = phrases
            .into_iter()
            .map(Rule::compile)
            .collect::<NormalizeResult<Vec<_>>>()?;

        Ok(Self { rules })
    }

    pub fn with_default_phrases() -> NormalizeResult<Self> {
        Self::new(DEFAULT_PHRASES)
    }

    pub fn normalize(&self, text: &str) -> String {
        let mut content = text.to_string();
        for rule in self.rules.iter() {
            let replaced = match rule.pattern.replace_all(&content, NoExpand(rule.replacement)) {
                Cow::Owned(replaced) => Some(replaced),
                Cow::Borrowed(_) => None,
            };
            if let Some(replaced) = replaced {
                content = replaced;
            }
        }
        content
    }

    /// Rewrites `path` in place.
    pub fn normalize_file(&self, path: impl AsRef<Path>) -> NormalizeResult<()> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| io_error(path, source))?;
        let normalized = self.normalize(&content);
        std::fs::write(path, normalized).map_err(|source| io_error(path, source))
    }

    /// Rewrites every `.txt` file directly inside `directory`, in name order.
    /// Subdirectories are not visited.
    pub fn normalize_directory(&self, directory: impl AsRef<Path>) -> NormalizeResult<Vec<PathBuf>> {
        let directory = directory.as_ref();
        let mut text_files = Vec::new();
        for entry in std::fs::read_dir(directory).map_err(|source| io_error(directory, source))? {
            let entry = entry.map_err(|source| io_error(directory, source))?;
            let path = entry.path();
            let is_text_file = entry
                .file_name()
                .to_str()
                .map(|name| name.ends_with(TEXT_FILE_SUFFIX))
                .unwrap_or(false);
            if is_text_file && path.is_file() {
                text_files.push(path);
            }
        }
        text_files.sort();

        for path in text_files.iter() {
            self.normalize_file(path)?;
            info!("Processed file: {}", path.display());
        }

        Ok(text_files)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> NormalizeError {
    NormalizeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn normalizer() -> PhraseNormalizer {
        PhraseNormalizer::with_default_phrases().expect("default phrases")
    }

    #[test]
    fn test_article_phrases_keep_article() {
        let normalizer = normalizer();
        assert_eq!(
            normalizer.normalize("I took a photo of a Photo"),
            "I took a video of a video"
        );
        assert_eq!(
            normalizer.normalize("AN IMAGE of a Photograph"),
            "a video of a video"
        );
    }

    #[test]
    fn test_bare_nouns() {
        let normalizer = normalizer();
        assert_eq!(
            normalizer.normalize("Picture perfect photo, the photograph."),
            "video perfect video, the video."
        );
    }

    #[test]
    fn test_whole_words_only() {
        let normalizer = normalizer();
        for text in ["photography", "photos", "pictures", "aphoto", "telephoto"] {
            assert_eq!(normalizer.normalize(text), text);
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let normalizer = normalizer();
        let once = normalizer.normalize("a picture of an image next to a photo, picture.");
        assert_eq!(normalizer.normalize(&once), once);
    }

    #[test]
    fn test_custom_phrases() {
        let normalizer = PhraseNormalizer::new(["a snapshot", "still"]).expect("normalizer");
        assert_eq!(
            normalizer.normalize("A snapshot and a still"),
            "a video and a video"
        );
    }

    #[test_log::test]
    fn test_normalize_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path();
        fs::write(root.join("b.txt"), "a photo").expect("write b");
        fs::write(root.join("a.txt"), "one picture").expect("write a");
        fs::write(root.join("c.md"), "a photo").expect("write c");
        fs::create_dir_all(root.join("nested")).expect("create nested");
        fs::write(root.join("nested/d.txt"), "a photo").expect("write d");

        let processed = normalizer()
            .normalize_directory(root)
            .expect("normalize");

        assert_eq!(processed, vec![root.join("a.txt"), root.join("b.txt")]);
        assert_eq!(fs::read_to_string(root.join("a.txt")).expect("a"), "one video");
        assert_eq!(fs::read_to_string(root.join("b.txt")).expect("b"), "a video");
        assert_eq!(fs::read_to_string(root.join("c.md")).expect("c"), "a photo");
        assert_eq!(fs::read_to_string(root.join("nested/d.txt")).expect("d"), "a photo");
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let result = normalizer().normalize_directory(dir.path().join("missing"));
        assert!(matches!(result, Err(NormalizeError::Io { .. })));
    }
}
