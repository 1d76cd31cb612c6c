use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mstream::{Client, ClientConfig, Origin, Scheme, StreamResult, SubtestKind};

#[derive(Parser, Debug)]
#[command(name = "mstream-client", version, about = "Runs multi-stream goodput measurements against a server")]
struct Args {
    /// Server address (host:port).
    #[arg(long, default_value = "localhost:8080")]
    server: String,

    /// Subtest direction to run.
    #[arg(long, value_enum, default_value_t = Direction::Both)]
    direction: Direction,

    /// Number of parallel streams.
    #[arg(long, default_value_t = 1)]
    streams: usize,

    /// Measurement duration in seconds.
    #[arg(long, default_value_t = 10)]
    duration: u64,

    /// Delay between stream launches, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// Congestion control algorithm to request from the server.
    #[arg(long, default_value = "bbr")]
    cc: String,

    /// Measurement id grouping the streams; generated when absent.
    #[arg(long)]
    mid: Option<String>,

    /// Connect over TLS (wss).
    #[arg(long)]
    secure: bool,

    /// Skip TLS certificate verification.
    #[arg(long, requires = "secure")]
    insecure: bool,

    /// Directory receiving one JSON record per stream.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Direction {
    Download,
    Upload,
    Both,
}

fn main() -> anyhow::Result<()> {
    set_logger();
    let args = Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mid = args.mid.clone().unwrap_or_else(generate_mid);
    let config = ClientConfig {
        scheme: if args.secure { Scheme::Wss } else { Scheme::Ws },
        congestion_control: args.cc.clone(),
        duration: Duration::from_secs(args.duration),
        streams_delay: Duration::from_millis(args.delay),
        insecure: args.insecure,
        output_dir: args.output.clone(),
        ..ClientConfig::default()
    };
    let client = Client::with_config(args.server.clone(), config);

    let kinds: &[SubtestKind] = match args.direction {
        Direction::Download => &[SubtestKind::Download],
        Direction::Upload => &[SubtestKind::Upload],
        Direction::Both => &[SubtestKind::Download, SubtestKind::Upload],
    };

    for &kind in kinds {
        tracing::info!(%kind, streams = args.streams, %mid, "starting subtest");
        let results = client
            .start_n(kind, args.streams, &mid)
            .await
            .with_context(|| format!("{kind} subtest failed"))?;
        for result in &results {
            summarize(result);
        }
    }
    Ok(())
}

fn summarize(result: &StreamResult) {
    let bytes = result
        .server_measurements
        .iter()
        .chain(result.client_measurements.iter())
        .filter(|m| m.origin == Origin::Receiver)
        .map(|m| m.app_info.num_bytes)
        .max()
        .unwrap_or(0);
    let elapsed = (result.end_time - result.start_time)
        .to_std()
        .unwrap_or_default()
        .as_secs_f64();
    let mbps = if elapsed > 0.0 {
        bytes as f64 * 8.0 / elapsed / 1e6
    } else {
        0.0
    };
    tracing::info!(
        uuid = %result.uuid,
        kind = %result.sub_type,
        cc = %result.congestion_control,
        bytes,
        goodput_mbps = mbps,
        "stream finished"
    );
}

fn generate_mid() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("{:08x}-{:08x}", rng.gen::<u32>(), rng.gen::<u32>())
}

fn set_logger() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
