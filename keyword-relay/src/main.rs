/// Keyword relay service binary
///
/// `run` relays the named pipe into an in-memory shared buffer and logs
/// notifications; `feed` plays a WAV file into the pipe as a test producer.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use keyword_relay::{
    init_logging, AudioFormat, AudioStream, KeywordDetector, LoggingObserver, ReaderPolicy,
    RelayConfig, SharedAudioBuffer,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kwd-relay")]
#[command(about = "Relay named-pipe audio into a shared buffer with keyword notifications", long_about = None)]
#[command(version = keyword_relay::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Named pipe path (overrides config and KWD_FIFO_PATH)
    #[arg(long, global = true)]
    fifo: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until Ctrl-C
    Run(RunArgs),

    /// Stream a 16-bit WAV file into the named pipe
    Feed(FeedArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Write the buffered audio to this WAV file on exit
    #[arg(long)]
    dump_wav: Option<PathBuf>,
}

#[derive(Args)]
struct FeedArgs {
    /// WAV file to play into the pipe
    #[arg(long)]
    wav: PathBuf,

    /// Audio sent per write, in milliseconds
    #[arg(long, default_value_t = 32)]
    chunk_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), cli.fifo)?;

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Feed(args) => feed(config, args).await,
    }
}

/// Defaults, then the config file, then environment, then CLI flags
fn load_config(path: Option<&Path>, fifo: Option<PathBuf>) -> Result<RelayConfig> {
    let mut config = match path {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::default(),
    };

    config.apply_env().context("applying KWD_* environment")?;

    if let Some(fifo) = fifo {
        config.fifo_path = fifo;
    }

    config.validate()?;
    Ok(config)
}

async fn run(config: RelayConfig, args: RunArgs) -> Result<()> {
    info!("Starting keyword relay v{}", keyword_relay::VERSION);

    let format = config.audio_format;
    let buffer = SharedAudioBuffer::with_capacity(config.buffer_capacity_samples(&format))?;
    let fifo_path = config.fifo_path.clone();

    let detector = KeywordDetector::builder()
        .stream(Arc::new(buffer.clone()))
        .keyword_observer(Arc::new(LoggingObserver))
        .state_observer(Arc::new(LoggingObserver))
        .config(config)
        .build()
        .context("starting keyword detector")?;

    info!("Relay running, waiting for audio on {}", fifo_path.display());

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    let stats = tokio::task::spawn_blocking(move || detector.shutdown()).await?;
    info!(
        samples_written = stats.samples_written,
        keep_alive_samples = stats.keep_alive_samples,
        detections = stats.detections,
        stalls = stats.stalls,
        read_errors = stats.read_errors,
        "Relay stopped"
    );

    if let Some(path) = args.dump_wav {
        let written = dump_wav(&buffer, &format, &path)?;
        info!("Wrote {} samples to {}", written, path.display());
    }

    Ok(())
}

/// Copy everything still retained in the buffer into a WAV file
fn dump_wav(buffer: &SharedAudioBuffer, format: &AudioFormat, path: &Path) -> Result<usize> {
    let mut reader = buffer.create_reader(ReaderPolicy::NonBlocking)?;
    reader.seek_to(buffer.oldest_index())?;

    let spec = hound::WavSpec {
        channels: format.num_channels as u16,
        sample_rate: format.sample_rate_hz,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut wav = hound::WavWriter::create(path, spec)
        .with_context(|| format!("creating {}", path.display()))?;

    let mut chunk = vec![0i16; 4096];
    let mut total = 0;
    loop {
        let n = reader.read(&mut chunk, Duration::ZERO)?;
        if n == 0 {
            break;
        }
        for &sample in &chunk[..n] {
            wav.write_sample(sample)?;
        }
        total += n;
    }

    reader.close();
    wav.finalize()?;
    Ok(total)
}

async fn feed(config: RelayConfig, args: FeedArgs) -> Result<()> {
    let mut wav = hound::WavReader::open(&args.wav)
        .with_context(|| format!("opening {}", args.wav.display()))?;
    let spec = wav.spec();

    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        bail!("only 16-bit integer WAV files can be fed, got {:?}", spec);
    }

    if spec.sample_rate != config.audio_format.sample_rate_hz {
        warn!(
            "WAV sample rate {} Hz differs from relay format {} Hz",
            spec.sample_rate, config.audio_format.sample_rate_hz
        );
    }

    let samples = wav.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
    let chunk_samples =
        (spec.sample_rate as u64 * args.chunk_ms / 1000) as usize * spec.channels as usize;

    info!("Waiting for the relay to open {}", config.fifo_path.display());
    let fifo_path = config.fifo_path.clone();
    let file = tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new().write(true).open(fifo_path)
    })
    .await?
    .with_context(|| format!("opening {}", config.fifo_path.display()))?;
    let mut sender = pipe::Sender::from_file(file)?;

    let mut ticker = tokio::time::interval(Duration::from_millis(args.chunk_ms.max(1)));
    for chunk in samples.chunks(chunk_samples.max(1)) {
        ticker.tick().await;
        let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_ne_bytes()).collect();
        sender.write_all(&bytes).await?;
    }

    info!("Fed {} samples from {}", samples.len(), args.wav.display());
    Ok(())
}
