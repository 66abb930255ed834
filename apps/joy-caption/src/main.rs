use ai::{joycaption::JoyCaptionBackend, llava::LlavaBackend};
use caption_batch::{process_images, ProcessOptions, DEFAULT_PROMPT, DEFAULT_TIMEOUT_MINUTES};
use clap::{Parser, ValueEnum};
use file_downloader::{FileDownload, FileDownloadConfig};
use std::path::PathBuf;
use tracing::info;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    /// LLaVA layout with a SigLIP vision tower and a Llama text model
    Joycaption,
    /// LLaVA layout with a CLIP vision tower, as candle's LLaVA loads it
    Llava,
}

impl Backend {
    fn default_model_id(&self) -> &'static str {
        match self {
            Self::Joycaption => ai::joycaption::DEFAULT_MODEL_ID,
            Self::Llava => ai::llava::DEFAULT_MODEL_ID,
        }
    }
}

/// Caption every image in a directory, one `.txt` file per image.
#[derive(Parser, Debug)]
#[command(name = "joy-caption-batch", version)]
struct Args {
    /// Directory containing the images, searched recursively
    input_dir: PathBuf,

    /// Where caption files are written, defaults to the input directory
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Prepended to every caption as "<trigger word>, "
    #[arg(long)]
    trigger_word: Option<String>,

    /// Regenerate captions that already exist
    #[arg(long)]
    no_skip_existing: bool,

    /// Minutes of inactivity before the model is unloaded
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MINUTES)]
    timeout: u64,

    #[arg(long, env = "CAPTION_BACKEND", value_enum, default_value_t = Backend::Joycaption)]
    backend: Backend,

    /// Hub repository of the checkpoint, defaults to the backend's model
    #[arg(long, env = "CAPTION_MODEL_ID")]
    model_id: Option<String>,

    /// Model files are downloaded here
    #[arg(long, env = "CAPTION_RESOURCES_DIR", default_value = "resources")]
    resources_dir: PathBuf,

    #[arg(long, env = "CAPTION_LOG_FILE", default_value = "joy_caption_batch.log")]
    log_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // before parsing, so env backed arguments see .env
    analytics_tracing::load_env();
    let args = Args::parse();
    analytics_tracing::init_tracing_to_stdout_and_file(&args.log_file);

    let options = ProcessOptions {
        input_dir: args.input_dir,
        output_dir: args.output_dir,
        prompt: args.prompt,
        skip_existing: !args.no_skip_existing,
        timeout_minutes: args.timeout,
        trigger_word: args.trigger_word,
        model_id: args
            .model_id
            .unwrap_or_else(|| args.backend.default_model_id().to_string()),
    };

    info!(
        "captioning {} with {}",
        options.input_dir.display(),
        options.model_id
    );

    let download = FileDownload::new(FileDownloadConfig::from_env(args.resources_dir));
    let outcome = match args.backend {
        Backend::Joycaption => process_images(JoyCaptionBackend::new(download), &options).await?,
        Backend::Llava => process_images(LlavaBackend::new(download), &options).await?,
    };
    tracing::debug!("run finished: {:?}", outcome);

    Ok(())
}

#[test]
fn test_args() {
    let args = Args::parse_from([
        "joy-caption-batch",
        "images",
        "--trigger-word",
        "ohwx",
        "--no-skip-existing",
        "--timeout",
        "2",
    ]);
    assert_eq!(args.input_dir, PathBuf::from("images"));
    assert_eq!(args.output_dir, None);
    assert_eq!(args.prompt, DEFAULT_PROMPT);
    assert_eq!(args.trigger_word.as_deref(), Some("ohwx"));
    assert!(args.no_skip_existing);
    assert_eq!(args.timeout, 2);
    assert_eq!(args.backend, Backend::Joycaption);
    assert_eq!(args.model_id, None);
    assert_eq!(
        args.backend.default_model_id(),
        "fancyfeast/llama-joycaption-beta-one-hf-llava"
    );
}

#[test]
fn test_llava_backend_args() {
    let args = Args::parse_from([
        "joy-caption-batch",
        "images",
        "--backend",
        "llava",
        "--model-id",
        "org/other-llava",
    ]);
    assert_eq!(args.backend, Backend::Llava);
    assert_eq!(args.model_id.as_deref(), Some("org/other-llava"));
    assert_eq!(args.backend.default_model_id(), ai::llava::DEFAULT_MODEL_ID);
}
