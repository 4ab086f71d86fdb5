use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use parli_realtime::{
    CredentialProvider, CredentialSource, DefaultTransportFactory, DualSessionCoordinator,
    OrchestratorConfig, ServerEvent, SessionDirection, SessionEvent, TurnController, TurnSignal,
    TurnState,
    core::audio::{SAMPLE_RATE, pcm16_duration, pcm16_to_samples, samples_to_pcm16},
};

/// 20ms of 16kHz PCM16
const CHUNK_BYTES: usize = 640;

/// Parli - bidirectional realtime speech translation
#[derive(Parser, Debug)]
#[command(name = "parli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mint an ephemeral credential and print its type and expiry
    Token,

    /// Connect both directions, print their status and disconnect
    Check,

    /// Translate one push-to-talk turn from a WAV file
    Translate {
        /// Translation direction (forward: A→B, reverse: B→A)
        #[arg(short = 'd', long = "direction", default_value = "forward")]
        direction: SessionDirection,

        /// Input WAV (16kHz mono PCM16)
        #[arg(short = 'i', long = "input")]
        input: PathBuf,

        /// Output WAV for the translated speech
        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        /// Give up waiting for the translation after this many seconds
        #[arg(long = "timeout", default_value_t = 30)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from {}", config_path.display());
        OrchestratorConfig::from_file(config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        OrchestratorConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    let provider = CredentialProvider::new(config.credential_provider_config())
        .context("Failed to create credential provider")?;

    match cli.command {
        Commands::Token => run_token(&provider).await,
        Commands::Check => run_check(&config, provider).await,
        Commands::Translate {
            direction,
            input,
            output,
            timeout_secs,
        } => {
            run_translate(
                &config,
                provider,
                direction,
                &input,
                &output,
                Duration::from_secs(timeout_secs),
            )
            .await
        }
    }
}

async fn run_token(provider: &CredentialProvider) -> anyhow::Result<()> {
    let credential = provider
        .get_credential()
        .await
        .context("Failed to mint credential")?;
    println!("token_type: {}", credential.token_type());
    println!("expires_at: {}", credential.expires_at());
    println!("valid_for:  {}s", credential.remaining().as_secs());
    provider.clear().await;
    Ok(())
}

fn build_coordinator(
    config: &OrchestratorConfig,
    provider: CredentialProvider,
) -> DualSessionCoordinator {
    let factory = DefaultTransportFactory::new(config.transport_options());
    DualSessionCoordinator::new(
        config.coordinator_config(),
        Arc::new(provider),
        Arc::new(factory),
    )
}

async fn run_check(config: &OrchestratorConfig, provider: CredentialProvider) -> anyhow::Result<()> {
    let coordinator = build_coordinator(config, provider);
    let result = coordinator.initialize().await;

    for direction in SessionDirection::ALL {
        let status = coordinator.status(direction);
        println!(
            "{:<8} {:<12} transport={:<6} failed_over={}{}",
            direction,
            status.state,
            status.transport,
            status.failed_over,
            status
                .error
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        );
    }

    coordinator.close().await?;
    result.context("Session initialization failed")?;
    Ok(())
}

async fn run_translate(
    config: &OrchestratorConfig,
    provider: CredentialProvider,
    direction: SessionDirection,
    input: &PathBuf,
    output: &PathBuf,
    wait: Duration,
) -> anyhow::Result<()> {
    let pcm = read_wav(input)?;
    info!(
        "Loaded {} ({:.2}s of audio)",
        input.display(),
        pcm16_duration(pcm.len(), SAMPLE_RATE).as_secs_f64()
    );

    let coordinator = build_coordinator(config, provider);
    coordinator
        .initialize()
        .await
        .context("Session initialization failed")?;

    let turns = TurnController::new(coordinator.clone(), config.turn_options());
    let mut events = coordinator.subscribe();
    let mut signals = turns.signals();

    let outcome = async {
        turns.press(direction).await?;
        for chunk in pcm.chunks(CHUNK_BYTES) {
            turns.push_audio(Bytes::copy_from_slice(chunk)).await?;
        }
        turns.release().await?;

        let mut translated: Vec<u8> = Vec::new();
        let collect = async {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) if event.direction == direction => match event.event {
                            SessionEvent::Audio(chunk) => translated.extend_from_slice(&chunk.data),
                            // Ordered after every audio delta of the response
                            SessionEvent::Message(ServerEvent::ResponseDone { .. }) => return Ok(()),
                            SessionEvent::Message(_) => {}
                        },
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => warn!("Dropped {} events", n),
                        Err(RecvError::Closed) => return Err(anyhow!("Session closed")),
                    },
                    signal = signals.recv() => match signal {
                        Ok(TurnSignal::State(TurnState::Idle)) => return Ok(()),
                        Ok(TurnSignal::Error { error, .. }) => return Err(anyhow!(error)),
                        Ok(_) => {}
                        Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => return Err(anyhow!("Turn controller closed")),
                    },
                }
            }
        };
        tokio::time::timeout(wait, collect)
            .await
            .map_err(|_| anyhow!("Timed out waiting for translation"))??;
        turns.playback_complete();
        anyhow::Ok(translated)
    }
    .await;

    turns.shutdown();
    coordinator.close().await?;

    let translated = outcome?;
    if translated.is_empty() {
        println!("No translated audio received");
        return Ok(());
    }
    write_wav(output, &translated)?;
    println!(
        "Wrote {} ({:.2}s of audio)",
        output.display(),
        pcm16_duration(translated.len(), SAMPLE_RATE).as_secs_f64()
    );
    Ok(())
}

fn read_wav(path: &PathBuf) -> anyhow::Result<Vec<u8>> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.sample_rate != SAMPLE_RATE || spec.bits_per_sample != 16 {
        anyhow::bail!(
            "Expected 16kHz mono 16-bit WAV, got {}Hz {}ch {}-bit",
            spec.sample_rate,
            spec.channels,
            spec.bits_per_sample
        );
    }
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to read WAV samples")?;
    Ok(samples_to_pcm16(&samples).to_vec())
}

fn write_wav(path: &PathBuf, pcm: &[u8]) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for sample in pcm16_to_samples(pcm) {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}
