use clap::Parser;
use phrase_normalizer::PhraseNormalizer;
use std::path::PathBuf;
use tracing::info;

/// Rewrite "photo" and "picture" style phrases to "video" in caption files.
#[derive(Parser, Debug)]
#[command(name = "txt-replace", version)]
struct Args {
    /// Directory holding the `.txt` caption files, not searched recursively
    #[arg(env = "TXT_REPLACE_DIR")]
    directory: PathBuf,
}

fn main() -> anyhow::Result<()> {
    analytics_tracing::load_env();
    let args = Args::parse();
    analytics_tracing::init_tracing_to_stdout();

    let normalizer = PhraseNormalizer::with_default_phrases()?;
    let processed = normalizer.normalize_directory(&args.directory)?;
    info!("{} files processed in {}", processed.len(), args.directory.display());

    Ok(())
}
