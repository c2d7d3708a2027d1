//! Turnkeeper - talk to a voice agent through the default PulseAudio devices
//!
//! Needs GROQ_API_KEY and CARTESIA_API_KEY in the environment or in `.env`.
//! Set RUST_LOG to change the log level (defaults to `turnkeeper=info`).

#![forbid(unsafe_code)]

use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use turnkeeper::audio::{PulseOutput, PulseSource};
use turnkeeper::cartesia::CartesiaTts;
use turnkeeper::config::AgentConfig;
use turnkeeper::groq_client::GroqClient;
use turnkeeper::session::Session;

const APP_NAME: &str = "turnkeeper";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("turnkeeper=info")),
        )
        .init();

    let config = AgentConfig::from_env().context("loading configuration")?;

    let groq = Arc::new(GroqClient::new(config.chat.clone()).context("creating Groq client")?);
    let tts = Arc::new(CartesiaTts::new(config.tts.clone()));
    let output = Arc::new(PulseOutput::new(APP_NAME, config.tts.sample_rate));
    let source = PulseSource::new(
        APP_NAME,
        None,
        config.seg.sample_rate,
        config.frame_samples,
    )
    .context("opening microphone")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            info!("Ctrl-C received, shutting down");
            shutdown.cancel();
        }
    });

    println!("Listening. Press Ctrl+C to exit.");
    let session = Session::new(config, groq.clone(), groq, tts, output);
    session.run(source, shutdown).await?;

    Ok(())
}
