mod cli;
mod input;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use glossa_ml::chat::read_template_file;
use glossa_ml::{ChatMessage, VlmPipeline};
use tracing_subscriber::fmt::format::FmtSpan;

use crate::cli::Cli;
use crate::input::Input;

// label only, the pixels are passed to the pipeline separately
const IMAGE_PLACEHOLDER: &str = "sample_image.png";

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn read_input(cli: &Cli) -> Result<Input> {
    match (&cli.text, &cli.image) {
        (Some(path), _) => Input::read_text(path),
        (None, Some(path)) => Input::read_image(path),
        (None, None) => anyhow::bail!("either --text or --image is required"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if let Some(cache_dir) = &cli.cache_dir {
        glossa_core::set_cache_dir(cache_dir.clone())?;
    }

    let input = read_input(&cli)?;
    tracing::info!(kind = input.kind(), "input loaded");

    let model_dir = glossa_core::resolve_model_dir(&cli.model_dir).await?;
    let device = glossa_ml::device(cli.device)?;
    let mut pipeline = VlmPipeline::load(&model_dir, &device, &cli.load_options())?;

    let (source, target) = (cli.source_lang_code.clone(), cli.target_lang_code.clone());
    let messages = match &input {
        Input::Text(text) => vec![ChatMessage::translate_text(source, target, text.as_str())],
        Input::Image(_) => vec![ChatMessage::translate_image(
            source,
            target,
            IMAGE_PLACEHOLDER,
        )],
    };
    println!("Messages:\n{}\n", serde_json::to_string_pretty(&messages)?);

    if let Some(path) = &cli.chat_template {
        override_chat_template(&mut pipeline, path)?;
    }

    let prompt = pipeline.render_prompt(&messages)?;
    println!("Prompt:\n{prompt}\n");

    let opts = cli.generate_options();
    let output = match input {
        Input::Text(_) => pipeline.generate(&prompt, &[], &opts)?,
        Input::Image(image) => pipeline.generate(&prompt, &[image], &opts)?,
    };
    println!("Output:\n{output}\n");

    Ok(())
}

/// Swaps the pipeline tokenizer's template for the one in `path`, for
/// checkpoints whose own template the pipeline cannot handle.
fn override_chat_template(pipeline: &mut VlmPipeline, path: &Path) -> Result<()> {
    let template = read_template_file(path)?;
    pipeline.tokenizer_mut().set_chat_template(template);
    tracing::info!(path = %path.display(), "chat template replaced");
    Ok(())
}
