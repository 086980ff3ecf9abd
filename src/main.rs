use std::io::{self, Read, Write};

use adaptive_inference::models::StreamStatus;
use adaptive_inference::{
    plan_execution_config, CandleLoader, GenerationRequest, InferenceService, ResourceProfiler, Settings,
    TokenEvent,
};
use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let mut settings = match std::env::args_os().nth(1) {
        Some(path) => Settings::from_file(&path)?,
        None => Settings::default(),
    };
    settings.apply_env()?;

    let profile = ResourceProfiler::system().profile();
    let config = plan_execution_config(&profile, &settings.plan_overrides())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "profile": &*profile,
            "execution": config,
        }))?
    );

    if settings.model.is_none() {
        tracing::info!("no [model] configured; profile only");
        return Ok(());
    }

    let service = InferenceService::load(&settings, profile, &CandleLoader).context("model load failed")?;

    let mut prompt = String::new();
    io::stdin()
        .read_to_string(&mut prompt)
        .context("failed to read prompt from stdin")?;
    let prompt = prompt.trim();
    if prompt.is_empty() {
        tracing::warn!("empty prompt on stdin; nothing to generate");
        return Ok(());
    }

    let (request_id, stream) = service.start_generation(GenerationRequest::user(prompt))?;
    tracing::debug!(request_id, "streaming reply");

    let mut stdout = io::stdout().lock();
    let mut status = StreamStatus::Failed;
    for event in stream {
        match event {
            TokenEvent::Text(text) => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
            }
            TokenEvent::Error(err) => tracing::error!(error = %err, "generation failed"),
            TokenEvent::Finished(s) => status = s,
        }
    }
    writeln!(stdout)?;

    if status != StreamStatus::Completed {
        anyhow::bail!("generation ended with status {:?}", status);
    }
    Ok(())
}
