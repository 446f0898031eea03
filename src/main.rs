use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use kubewhisper::audio::{Microphone, NoCapture, SilentSink, Speaker};
use kubewhisper::{Config, Orchestrator};

/// Talk to your Kubernetes cluster.
#[derive(Parser, Debug)]
#[command(name = "kubewhisper")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Realtime model to connect to
    #[arg(long)]
    model: Option<String>,

    /// Assistant voice
    #[arg(long)]
    voice: Option<String>,

    /// Text prompt sent before listening (repeatable)
    #[arg(short, long = "prompt", value_name = "TEXT")]
    prompts: Vec<String>,

    /// Append timings as JSON lines to this file
    #[arg(long, value_name = "FILE")]
    latency_log: Option<PathBuf>,

    /// Exchange text only: no microphone, no speaker
    #[arg(long)]
    text_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(model) = cli.model {
        config = config.model(model);
    }
    if let Some(voice) = cli.voice {
        config = config.voice(voice);
    }
    if let Some(path) = cli.latency_log {
        config = config.latency_log(path);
    }
    for prompt in cli.prompts {
        config = config.prompt(prompt);
    }
    if cli.text_only {
        config = config.text_only();
    }

    let orchestrator = if cli.text_only {
        Orchestrator::websocket(config)
            .capture(NoCapture)
            .playback(SilentSink)
            .on_transcript(|delta| print!("{delta}"))
    } else {
        let (rate, chunk) = (config.sample_rate, config.chunk_frames);
        Orchestrator::websocket(config)
            .capture(Microphone::new(rate, chunk))
            .playback(Speaker::new(rate))
            .on_transcript(|delta| print!("{delta}"))
    };

    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.trigger();
        }
    });

    orchestrator.run().await.context("Voice session failed")?;
    Ok(())
}
