//! Standalone driver for the sink engine.
//!
//! Constructs the engine, configures its target and sources, and drives the event loop by
//! replaying a framed packet stream against it. Matches the teacher's `main.rs` shape
//! (`tracing_subscriber` init, a tight loop driving the core, `anyhow` at the edges) without
//! the async runtime, since the core here is intentionally synchronous.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use smallvec::SmallVec;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use dnssim_sink::{Engine, ObjectChain, PacketObject, Transport};

/// Replays a framed stream of DNS query packets against a target resolver.
#[derive(Parser, Debug)]
#[command(name = "dnssim-sink", version, about)]
struct Args {
    /// Target resolver address.
    #[arg(long, env = "DNSSIM_TARGET_IP")]
    target_ip: String,

    /// Target resolver port.
    #[arg(long, env = "DNSSIM_TARGET_PORT", default_value_t = 53)]
    target_port: u16,

    /// Number of per-client accounting slots.
    #[arg(long, env = "DNSSIM_MAX_CLIENTS", default_value_t = 1024)]
    max_clients: u32,

    /// Per-request timeout in milliseconds.
    #[arg(long, env = "DNSSIM_TIMEOUT_MS", default_value_t = 2000)]
    timeout_ms: u64,

    /// Local address to bind queries from; may be repeated to build a rotating ring.
    #[arg(long = "source")]
    sources: Vec<String>,

    /// Take an independent owned copy of each payload instead of sharing the input buffer.
    #[arg(long)]
    free_after_use: bool,

    /// Emit an aggregate stats line on this interval, in milliseconds.
    #[arg(long)]
    stat_interval_ms: Option<u64>,

    /// Framed packet stream to replay; reads stdin if omitted.
    ///
    /// Framing is `[4-byte big-endian destination IPv4][4-byte big-endian payload length][payload]`,
    /// repeated until EOF.
    input: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let mut engine = Engine::new(args.max_clients);
    engine
        .set_transport(Transport::UdpOnly)
        .context("failed to configure transport")?;
    engine
        .set_target(&args.target_ip, args.target_port)
        .with_context(|| format!("failed to set target `{}`", args.target_ip))?;
    engine.set_timeout(Duration::from_millis(args.timeout_ms));
    engine.set_free_after_use(args.free_after_use);

    for source in &args.sources {
        engine
            .bind_source(source)
            .with_context(|| format!("failed to bind source `{source}`"))?;
    }

    if let Some(interval_ms) = args.stat_interval_ms {
        engine.stat_collect(Duration::from_millis(interval_ms));
    }

    let mut reader: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut exhausted = false;
    loop {
        if !exhausted {
            match read_one_frame(&mut reader)? {
                Some((dst, payload)) => {
                    let chain = packet_chain(dst, payload);
                    engine.receive(&chain);
                }
                None => {
                    exhausted = true;
                    tracing::info!("input exhausted; draining in-flight requests");
                }
            }
        }

        engine.run_nowait();

        if exhausted && engine.in_flight() == 0 {
            break;
        }

        if exhausted {
            // Nothing left to feed in; sleep until the next armed timeout or stats tick
            // instead of spinning.
            let wake_in = engine
                .next_wake()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(1));
            std::thread::sleep(wake_in.max(Duration::from_millis(1)));
        }
    }

    engine.stat_finish();

    let sum = engine.stats().sum();
    tracing::info!(
        processed = engine.stats().processed(),
        discarded = engine.stats().discarded(),
        total = sum.total,
        answered = sum.answered,
        noerror = sum.noerror,
        "final statistics"
    );

    Ok(())
}

fn read_one_frame(reader: &mut impl Read) -> Result<Option<(Ipv4Addr, Vec<u8>)>> {
    let mut header = [0u8; 8];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(error) => return Err(error).context("failed to read frame header"),
    }

    let dst = Ipv4Addr::new(header[0], header[1], header[2], header[3]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .context("truncated frame payload")?;

    Ok(Some((dst, payload)))
}

fn packet_chain(dst: Ipv4Addr, payload: Vec<u8>) -> ObjectChain {
    let mut chain: ObjectChain = SmallVec::new();
    chain.push(PacketObject::Ip(dst));
    chain.push(PacketObject::Payload(Arc::from(payload)));
    chain
}
