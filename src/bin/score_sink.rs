/// Test destination for the relay.
///
/// Accepts one TCP connection, reads 12-byte score records until the peer
/// closes, and writes them as `subject_id,scaled_score` CSV rows.

use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use score_relay::score::to_real;
use score_relay::wire::{decode_score, SCORE_LEN};

#[derive(Parser, Debug)]
#[command(name = "score_sink", about = "Receive and log forwarded composite scores")]
struct Args {
    /// Port to listen on.
    #[arg(default_value_t = 9000)]
    port: u16,
    /// Output CSV.
    #[arg(long, default_value = "test_results/tcp_sent.csv")]
    output: PathBuf,
    /// Print each record as it arrives.
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .with_context(|| format!("binding port {}", args.port))?;
    info!("listening on {}", listener.local_addr()?);

    let (mut stream, peer) = listener.accept().context("accepting connection")?;
    info!("connection from {peer}");

    if let Some(dir) = args.output.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let mut out = BufWriter::new(
        File::create(&args.output).with_context(|| format!("creating {}", args.output.display()))?,
    );
    writeln!(out, "subject_id,scaled_score")?;

    let mut buf = [0u8; SCORE_LEN];
    let mut count = 0u64;
    loop {
        match stream.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context("reading score record"),
        }
        let msg = decode_score(&buf);
        writeln!(out, "{},{}", msg.subject_id, msg.score)?;
        out.flush()?;
        if args.verbose {
            println!("SID={} Composite-score={:.9}", msg.subject_id, to_real(msg.score));
        }
        count += 1;
    }

    info!("peer closed after {count} records → {}", args.output.display());
    Ok(())
}
