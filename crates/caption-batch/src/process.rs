use crate::{
    discover::get_image_files,
    error::{BatchError, BatchResult},
};
use ai::{CaptionBackend, CaptionSession};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{error, info, warn};

pub const DEFAULT_PROMPT: &str = "Write a descriptive caption for this image.";
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 5;
pub const CAPTION_FILE_EXTENSION: &str = "txt";

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub input_dir: PathBuf,
    /// Defaults to `input_dir`.
    pub output_dir: Option<PathBuf>,
    pub prompt: String,
    pub skip_existing: bool,
    pub timeout_minutes: u64,
    pub trigger_word: Option<String>,
    pub model_id: String,
}

impl ProcessOptions {
    pub fn new(input_dir: impl Into<PathBuf>, model_id: impl Into<String>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_dir: None,
            prompt: DEFAULT_PROMPT.to_string(),
            skip_existing: true,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            trigger_word: None,
            model_id: model_id.into(),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errored: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The input directory does not exist, nothing was done.
    InputMissing,
    /// No image files were found, no model was loaded.
    NoImages,
    Finished(RunSummary),
}

/// `<output_dir>/<stem>.txt`. Dots inside the stem are kept, so `cat.1.png`
/// and `cat.2.png` get separate caption files.
pub fn caption_path(output_dir: &Path, image_file: &Path) -> PathBuf {
    let mut file_name = image_file.file_stem().unwrap_or_default().to_os_string();
    file_name.push(".");
    file_name.push(CAPTION_FILE_EXTENSION);
    output_dir.join(file_name)
}

pub fn apply_trigger_word(caption: String, trigger_word: Option<&str>) -> String {
    match trigger_word {
        Some(trigger_word) if !trigger_word.is_empty() => format!("{trigger_word}, {caption}"),
        _ => caption,
    }
}

/// Captions every image under `options.input_dir`.
///
/// One session serves the whole run. Failures on a single image are logged
/// and counted, they never stop the batch. The model is unloaded and the idle
/// timer cancelled once the loop is done.
pub async fn process_images<B: CaptionBackend>(
    backend: B,
    options: &ProcessOptions,
) -> BatchResult<RunOutcome> {
    let input_path = options.input_dir.as_path();
    let output_path = options.output_dir.as_deref().unwrap_or(input_path);

    if !input_path.exists() {
        error!("Input directory does not exist: {}", input_path.display());
        return Ok(RunOutcome::InputMissing);
    }

    std::fs::create_dir_all(output_path).map_err(|source| BatchError::CreateOutputDir {
        path: output_path.to_path_buf(),
        source,
    })?;

    let image_files = get_image_files(input_path);
    if image_files.is_empty() {
        warn!("No image files found in {}", input_path.display());
        return Ok(RunOutcome::NoImages);
    }

    info!("Found {} image files to process", image_files.len());

    let session = CaptionSession::new(backend, options.model_id.clone(), options.idle_timeout())?;
    let summary = caption_files(&session, &image_files, output_path, options).await;

    session.shutdown().await;

    log_summary(&summary);
    Ok(RunOutcome::Finished(summary))
}

async fn caption_files(
    session: &CaptionSession,
    image_files: &[PathBuf],
    output_path: &Path,
    options: &ProcessOptions,
) -> RunSummary {
    let total = image_files.len();
    let mut summary = RunSummary {
        total,
        ..Default::default()
    };

    for (index, image_file) in image_files.iter().enumerate() {
        let progress = format!("[{}/{}]", index + 1, total);
        let file_name = display_name(image_file);
        let caption_file = caption_path(output_path, image_file);

        if options.skip_existing && caption_file.exists() {
            info!("{progress} Skipping {file_name} - caption file already exists");
            summary.skipped += 1;
            continue;
        }

        info!("{progress} Processing {file_name}");

        match caption_file_for(session, image_file, &caption_file, options).await {
            Ok(()) => {
                info!("{progress} Saved caption to {}", display_name(&caption_file));
                summary.processed += 1;
            }
            Err(e) => {
                error!("{progress} Error processing {file_name}: {e:#}");
                summary.errored += 1;
            }
        }
    }

    summary
}

async fn caption_file_for(
    session: &CaptionSession,
    image_file: &Path,
    caption_file: &Path,
    options: &ProcessOptions,
) -> anyhow::Result<()> {
    let image = image::open(image_file)?;
    let caption = session.generate_caption(image, &options.prompt).await?;
    let caption = apply_trigger_word(caption, options.trigger_word.as_deref());
    std::fs::write(caption_file, caption.as_bytes())?;
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn log_summary(summary: &RunSummary) {
    let rule = "=".repeat(50);
    info!("{rule}");
    info!("PROCESSING SUMMARY");
    info!("{rule}");
    info!("Total images found: {}", summary.total);
    info!("Successfully processed: {}", summary.processed);
    info!("Skipped (already exists): {}", summary.skipped);
    info!("Errors: {}", summary.errored);
    info!("{rule}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ai::testing::ScriptedBackend;
    use image::{DynamicImage, ImageFormat};
    use std::fs;

    fn write_image(path: &Path, width: u32) {
        let format = ImageFormat::from_path(path).expect("image format");
        DynamicImage::new_rgb8(width, 8)
            .save_with_format(path, format)
            .expect("save image");
    }

    fn options(input_dir: &Path) -> ProcessOptions {
        ProcessOptions::new(input_dir, "test/model")
    }

    #[test]
    fn test_caption_path() {
        assert_eq!(
            caption_path(Path::new("/out"), Path::new("/in/nested/photo.final.png")),
            PathBuf::from("/out/photo.final.txt")
        );
        assert_eq!(
            caption_path(Path::new("/out"), Path::new("/in/cat.png")),
            PathBuf::from("/out/cat.txt")
        );
        assert_eq!(
            caption_path(Path::new("/out"), Path::new("/in/archive")),
            PathBuf::from("/out/archive.txt")
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_dotted_names_get_separate_captions() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_image(&dir.path().join("cat.1.png"), 8);
        write_image(&dir.path().join("cat.2.png"), 8);

        let backend = ScriptedBackend::new("a cat");
        let outcome = process_images(backend.clone(), &options(dir.path()))
            .await
            .expect("run");

        assert_eq!(
            outcome,
            RunOutcome::Finished(RunSummary {
                total: 2,
                processed: 2,
                skipped: 0,
                errored: 0,
            })
        );
        assert_eq!(backend.generations(), 2);
        assert_eq!(fs::read_to_string(dir.path().join("cat.1.txt")).expect("cat.1.txt"), "a cat");
        assert_eq!(fs::read_to_string(dir.path().join("cat.2.txt")).expect("cat.2.txt"), "a cat");
        assert!(!dir.path().join("cat.txt").exists());
    }

    #[test]
    fn test_apply_trigger_word() {
        assert_eq!(apply_trigger_word("a cat".into(), Some("sks")), "sks, a cat");
        assert_eq!(apply_trigger_word("a cat".into(), None), "a cat");
        assert_eq!(apply_trigger_word("a cat".into(), Some("")), "a cat");
    }

    #[test_log::test(tokio::test)]
    async fn test_process_images_end_to_end() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_image(&dir.path().join("a.png"), 8);
        write_image(&dir.path().join("b.jpg"), 8);
        fs::write(dir.path().join("c.txt"), "notes").expect("write notes");

        let backend = ScriptedBackend::new("a red square");
        let outcome = process_images(backend.clone(), &options(dir.path()))
            .await
            .expect("run");

        assert_eq!(
            outcome,
            RunOutcome::Finished(RunSummary {
                total: 2,
                processed: 2,
                skipped: 0,
                errored: 0,
            })
        );
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).expect("a.txt"), "a red square");
        assert_eq!(fs::read_to_string(dir.path().join("b.txt")).expect("b.txt"), "a red square");
        assert_eq!(fs::read_to_string(dir.path().join("c.txt")).expect("c.txt"), "notes");
        assert_eq!(backend.loads(), 1);
        assert_eq!(backend.releases(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_skip_existing_keeps_caption() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_image(&dir.path().join("a.png"), 8);
        fs::write(dir.path().join("a.txt"), "hand written").expect("write caption");

        let backend = ScriptedBackend::new("generated");
        let outcome = process_images(backend.clone(), &options(dir.path()))
            .await
            .expect("run");

        assert_eq!(
            outcome,
            RunOutcome::Finished(RunSummary {
                total: 1,
                processed: 0,
                skipped: 1,
                errored: 0,
            })
        );
        assert_eq!(backend.generations(), 0);
        assert_eq!(backend.loads(), 0);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.txt")).expect("a.txt"),
            "hand written"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_no_skip_existing_overwrites_caption() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_image(&dir.path().join("a.png"), 8);
        fs::write(dir.path().join("a.txt"), "stale").expect("write caption");

        let backend = ScriptedBackend::new("fresh");
        let options = ProcessOptions {
            skip_existing: false,
            ..options(dir.path())
        };
        let outcome = process_images(backend.clone(), &options).await.expect("run");

        assert!(matches!(outcome, RunOutcome::Finished(RunSummary { processed: 1, .. })));
        assert_eq!(backend.generations(), 1);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).expect("a.txt"), "fresh");
    }

    #[test_log::test(tokio::test)]
    async fn test_trigger_word_and_output_dir() {
        let dir = tempfile::tempdir().expect("temp dir");
        let input_dir = dir.path().join("images");
        let output_dir = dir.path().join("captions/nested");
        fs::create_dir_all(input_dir.join("sub")).expect("create input");
        write_image(&input_dir.join("sub/x.webp"), 8);

        let options = ProcessOptions {
            output_dir: Some(output_dir.clone()),
            trigger_word: Some("ohwx".to_string()),
            ..options(&input_dir)
        };
        process_images(ScriptedBackend::new("a dog"), &options)
            .await
            .expect("run");

        assert_eq!(
            fs::read_to_string(output_dir.join("x.txt")).expect("x.txt"),
            "ohwx, a dog"
        );
        assert!(!input_dir.join("sub/x.txt").exists());
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_generation_is_counted() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_image(&dir.path().join("broken.png"), 13);

        let backend = ScriptedBackend::new("never").failing_on_width(13);
        let outcome = process_images(backend.clone(), &options(dir.path()))
            .await
            .expect("run");

        assert_eq!(
            outcome,
            RunOutcome::Finished(RunSummary {
                total: 1,
                processed: 0,
                skipped: 0,
                errored: 1,
            })
        );
        assert!(!dir.path().join("broken.txt").exists());
        // cleanup still ran
        assert_eq!(backend.releases(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_errors_do_not_stop_the_batch() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_image(&dir.path().join("a.png"), 13);
        fs::write(dir.path().join("b.png"), b"not an image").expect("write junk");
        write_image(&dir.path().join("c.png"), 8);

        let backend = ScriptedBackend::new("fine").failing_on_width(13);
        let outcome = process_images(backend, &options(dir.path()))
            .await
            .expect("run");

        assert_eq!(
            outcome,
            RunOutcome::Finished(RunSummary {
                total: 3,
                processed: 1,
                skipped: 0,
                errored: 2,
            })
        );
        assert!(dir.path().join("c.txt").exists());
    }

    #[test_log::test(tokio::test)]
    async fn test_load_failure_counts_every_image() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_image(&dir.path().join("a.png"), 8);
        write_image(&dir.path().join("b.png"), 8);

        let outcome = process_images(ScriptedBackend::new("x").failing_load(), &options(dir.path()))
            .await
            .expect("run");

        assert!(matches!(
            outcome,
            RunOutcome::Finished(RunSummary { processed: 0, errored: 2, .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_input_and_no_images() {
        let dir = tempfile::tempdir().expect("temp dir");
        let backend = ScriptedBackend::new("x");

        let outcome = process_images(backend.clone(), &options(&dir.path().join("missing")))
            .await
            .expect("run");
        assert_eq!(outcome, RunOutcome::InputMissing);

        let outcome = process_images(backend.clone(), &options(dir.path()))
            .await
            .expect("run");
        assert_eq!(outcome, RunOutcome::NoImages);
        assert_eq!(backend.loads(), 0);
    }
}
