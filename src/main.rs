use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use duplex_voice::client::{self, DeviceProfile, Player, SPEECH_THRESHOLD, frame_level};
use duplex_voice::generation::openrouter::OpenRouterClient;
use duplex_voice::recognition::deepgram::DeepgramRecognizer;
use duplex_voice::session::{Services, SessionRegistry};
use duplex_voice::synthesis::{SynthesisClient, providers};
use duplex_voice::voice::{AudioCapture, SAMPLE_RATE, SpeakerPlayer, samples_to_wav};
use duplex_voice::{Config, api};

/// Duplex - full-duplex spoken conversation gateway
#[derive(Parser)]
#[command(name = "duplex", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Run the conversation server
    Serve {
        /// Port to listen on
        #[arg(long, env = "PORT")]
        port: Option<u16>,
        /// Directory with a web client to serve
        #[arg(long, env = "DUPLEX_STATIC_DIR")]
        static_dir: Option<PathBuf>,
    },
    /// Talk to a server through the local microphone and speakers
    Talk {
        /// Server WebSocket URL
        #[arg(long, default_value = "ws://127.0.0.1:3001/ws")]
        url: String,
        /// Use mobile echo settings (longer barge-in grace period)
        #[arg(long)]
        mobile: bool,
        /// Generation engine to request
        #[arg(long)]
        model: Option<String>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Save the captured audio as WAV
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "你好！有咩可以幫到你？")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,duplex_voice=info",
        1 => "info,duplex_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve { port, static_dir } => serve(port, static_dir).await,
        Command::Talk { url, mobile, model } => {
            let profile = if mobile {
                DeviceProfile::Mobile
            } else {
                DeviceProfile::Desktop
            };
            client::talk(&url, profile, model).await?;
            Ok(())
        }
        Command::TestMic { duration, output } => test_mic(duration, output.as_deref()).await,
        Command::TestTts { text } => test_tts(&text).await,
    }
}

async fn serve(port: Option<u16>, static_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = Config::load();
    if let Some(port) = port {
        config.server.port = port;
    }
    if static_dir.is_some() {
        config.server.static_dir = static_dir;
    }
    tracing::debug!(?config, "loaded configuration");

    let services = build_services(&config)?;

    let warmed = services
        .synthesis
        .warm_up(&config.synthesis.warmup_phrases)
        .await;
    tracing::info!(
        warmed,
        total = config.synthesis.warmup_phrases.len(),
        "synthesis cache warmed"
    );

    let registry = Arc::new(SessionRegistry::new(config.session.idle_timeout));
    let sweeper = registry.spawn_sweeper(config.session.sweep_interval);

    tracing::info!(
        port = config.server.port,
        model = %config.generation.default_model,
        "starting duplex voice gateway"
    );

    let server = api::ApiServer::new(services, Arc::clone(&registry), config.server.port)
        .static_dir(config.server.static_dir.clone());
    let result = server.run(api::shutdown_signal()).await;

    sweeper.abort();
    result?;
    Ok(())
}

fn build_services(config: &Config) -> anyhow::Result<Services> {
    let keys = &config.api_keys;

    let recognizer = DeepgramRecognizer::new(
        config.recognition.clone(),
        require_key(keys.deepgram.as_ref(), "DEEPGRAM_API_KEY")?,
    )?;
    let generator = OpenRouterClient::new(
        config.generation.base_url.clone(),
        require_key(keys.openrouter.as_ref(), "OPENROUTER_API_KEY")?,
    )?;
    let synthesizer = providers::from_config(&config.synthesis, keys)?;

    Ok(Services {
        recognizer: Arc::new(recognizer),
        generator: Arc::new(generator),
        synthesis: Arc::new(SynthesisClient::new(synthesizer, &config.synthesis)),
        generation: config.generation.clone(),
        session: config.session.clone(),
        reconnect: config.reconnect.clone(),
    })
}

fn require_key<'a>(key: Option<&'a SecretString>, name: &str) -> anyhow::Result<&'a str> {
    key.map(ExposeSecret::expose_secret)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| anyhow::anyhow!("{name} is not set"))
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(duration: u64, output: Option<&std::path::Path>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new()?;
    capture.start()?;

    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("Barge-in threshold: {SPEECH_THRESHOLD}");
    println!("---");

    let mut recording = Vec::new();
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.take_buffer();
        let level = frame_level(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (level * 500.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
        let speech = if level > SPEECH_THRESHOLD { "speech" } else { "" };

        println!("[{:2}s] Level: {level:.4} | Peak: {peak:.4} | [{meter}] {speech}", i + 1);

        if output.is_some() {
            recording.extend(samples);
        }
    }

    capture.stop();

    if let Some(path) = output {
        let wav = samples_to_wav(&recording, SAMPLE_RATE)?;
        std::fs::write(path, wav)?;
        println!("\nSaved {} samples to {}", recording.len(), path.display());
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the level stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test TTS output with the configured synthesis provider
async fn test_tts(text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load();
    let synthesizer = providers::from_config(&config.synthesis, &config.api_keys)?;
    let synthesis = SynthesisClient::new(synthesizer, &config.synthesis);

    println!("Synthesizing speech...");
    let mp3_data = synthesis.synthesize(text).await?;
    println!("Got {} bytes of audio data", mp3_data.len());

    println!("Playing audio...");
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel();
    let mut player = SpeakerPlayer::new(ended_tx)?;
    player.play(1, &mp3_data)?;
    ended_rx.recv().await;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}
