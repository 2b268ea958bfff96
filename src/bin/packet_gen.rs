/// Synthetic update packet generator.
///
/// Writes `<output_dir>/input_packets.bin` (a replayable capture) and
/// optionally sends every packet as a UDP datagram to a multicast group.

use std::net::UdpSocket;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use score_relay::capture::write_capture;
use score_relay::synthetic::{PacketGenerator, SyntheticConfig};

#[derive(Parser, Debug)]
#[command(name = "packet_gen", about = "Generate synthetic book update packets")]
struct Args {
    /// Directory for input_packets.bin.
    output_dir: PathBuf,
    /// Packets to generate.
    num_packets: usize,

    /// Distinct subjects.
    #[arg(long, default_value_t = 5)]
    subjects: usize,
    /// Fixed RNG seed.
    #[arg(long)]
    seed: Option<u64>,
    /// Also send each packet to this UDP address (e.g. 239.255.0.1:30001).
    #[arg(long)]
    send: Option<String>,
    /// Pause between sent packets.
    #[arg(long, default_value_t = 1)]
    delay_ms: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();
    let cfg = SyntheticConfig {
        num_subjects: args.subjects,
        seed: args.seed,
        ..Default::default()
    };
    let mut generator = PacketGenerator::new(&cfg);
    info!(subjects = ?generator.subjects(), "generating {} packets", args.num_packets);

    let packets = (0..args.num_packets)
        .map(|_| generator.next_packet())
        .collect::<Result<Vec<_>, _>>()
        .context("encoding packets")?;

    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("creating {}", args.output_dir.display()))?;
    let path = args.output_dir.join("input_packets.bin");
    let written = write_capture(&path, packets.iter().map(Vec::as_slice))
        .with_context(|| format!("writing {}", path.display()))?;
    info!("wrote {written} packets to {}", path.display());

    if let Some(addr) = &args.send {
        let socket = UdpSocket::bind("0.0.0.0:0").context("binding UDP socket")?;
        socket.set_multicast_ttl_v4(1)?;
        let delay = Duration::from_millis(args.delay_ms);
        for p in &packets {
            socket.send_to(p, addr).with_context(|| format!("sending to {addr}"))?;
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        info!("sent {} packets to {addr}", packets.len());
    }
    Ok(())
}
