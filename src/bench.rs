/// Dedicated benchmark binary for the score relay.
///
/// Measures:
/// 1. Packet decode throughput
/// 2. Book update + composite score throughput (no queues, no I/O)
/// 3. End-to-end dispatcher throughput (queues + workers + change detection)
/// 4. Receive → send latency distribution

use std::sync::Arc;

use score_relay::error::SendError;
use score_relay::forwarder::{Forwarder, ScoreSink};
use score_relay::metrics::Metrics;
use score_relay::orderbook::BookRegistry;
use score_relay::pipeline::{Dispatcher, PacketHandler, Pipeline};
use score_relay::recorder::LatencyRecorder;
use score_relay::score::composite_score;
use score_relay::synthetic::{PacketGenerator, SyntheticConfig};
use score_relay::wire;

const WARMUP_ITERATIONS: usize = 5;
const BENCH_ITERATIONS: usize = 20;
const DEFAULT_PACKETS: usize = 100_000;

/// Swallows frames; isolates the pipeline from socket cost.
struct NullSink;

impl ScoreSink for NullSink {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SendError> {
        std::hint::black_box(buf);
        Ok(())
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_packets = args
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PACKETS);

    println!("╔══════════════════════════════════════════════════════╗");
    println!("║        SCORE RELAY: BENCHMARK SUITE                  ║");
    println!("╚══════════════════════════════════════════════════════╝\n");

    let clock = quanta::Clock::new();
    let cfg = SyntheticConfig {
        num_subjects: 64,
        seed: Some(42),
        ..Default::default()
    };
    let mut generator = PacketGenerator::new(&cfg);
    let packets: Vec<Vec<u8>> = (0..num_packets)
        .map(|_| generator.next_packet().expect("Failed to encode synthetic packet"))
        .collect();

    // ── Benchmark 1: Decode ───────────────────────────────────────
    println!("── Benchmark 1: Packet Decode ────────────────────────");
    for _ in 0..WARMUP_ITERATIONS {
        for p in &packets {
            std::hint::black_box(wire::decode(p).ok());
        }
    }
    let mut decode_times_ns = Vec::with_capacity(BENCH_ITERATIONS);
    for _ in 0..BENCH_ITERATIONS {
        let start = clock.raw();
        for p in &packets {
            std::hint::black_box(wire::decode(p).ok());
        }
        decode_times_ns.push(clock.delta_as_nanos(start, clock.raw()));
    }
    let (avg_decode_ns, min_decode_ns) = avg_min(&decode_times_ns);
    let decode_throughput = per_sec(packets.len(), min_decode_ns);

    println!("  Packets:           {}", packets.len());
    println!("  Avg decode time:   {:.2} µs", avg_decode_ns as f64 / 1000.0);
    println!("  Min decode time:   {:.2} µs", min_decode_ns as f64 / 1000.0);
    println!("  Decode throughput: {:.0} packets/sec (best run)\n", decode_throughput);

    // ── Benchmark 2: Book + Score (isolated) ──────────────────────
    println!("── Benchmark 2: Book Update + Score (isolated) ───────");
    let decoded: Vec<_> = packets.iter().filter_map(|p| wire::decode(p).ok()).collect();
    let run_books = |registry: &BookRegistry| {
        for msg in &decoded {
            let book = registry.get_or_create(msg.subject_id);
            let (_, top) = book.apply_and_snapshot(&msg.updates);
            std::hint::black_box(composite_score(&top));
        }
    };
    for _ in 0..WARMUP_ITERATIONS {
        run_books(&BookRegistry::new());
    }
    let mut book_times_ns = Vec::with_capacity(BENCH_ITERATIONS);
    for _ in 0..BENCH_ITERATIONS {
        let registry = BookRegistry::new();
        let start = clock.raw();
        run_books(&registry);
        book_times_ns.push(clock.delta_as_nanos(start, clock.raw()));
    }
    let (avg_book_ns, min_book_ns) = avg_min(&book_times_ns);
    let per_packet_ns = min_book_ns as f64 / decoded.len().max(1) as f64;
    let book_throughput = per_sec(decoded.len(), min_book_ns);

    println!("  Avg time:          {:.2} µs", avg_book_ns as f64 / 1000.0);
    println!("  Min time:          {:.2} µs", min_book_ns as f64 / 1000.0);
    println!("  Per-packet:        {:.0} ns", per_packet_ns);
    println!("  Throughput:        {:.0} packets/sec (best run)\n", book_throughput);

    // ── Benchmark 3: End-to-End Dispatcher ────────────────────────
    println!("── Benchmark 3: End-to-End (ingress + workers + forward) ──");
    let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(4);
    let mut e2e_times_ns = Vec::with_capacity(BENCH_ITERATIONS);
    let mut last_pipeline = None;
    for _ in 0..BENCH_ITERATIONS {
        let pipeline = Arc::new(Pipeline::new(
            Arc::new(BookRegistry::new()),
            Arc::new(Forwarder::new(NullSink, clock.clone())),
            Arc::new(LatencyRecorder::new(Box::new(std::io::sink()), false)),
            Arc::new(Metrics::new()),
            clock.clone(),
        ));
        let dispatcher = Dispatcher::start(Arc::clone(&pipeline), workers, 4096)
            .expect("Failed to start dispatcher");
        let ingress = dispatcher.ingress();

        let start = clock.raw();
        for p in &packets {
            let _ = ingress.handle(p.clone());
        }
        drop(ingress);
        dispatcher.drain();
        e2e_times_ns.push(clock.delta_as_nanos(start, clock.raw()));
        last_pipeline = Some(pipeline);
    }
    let (avg_e2e_ns, min_e2e_ns) = avg_min(&e2e_times_ns);
    let e2e_throughput = per_sec(packets.len(), min_e2e_ns);

    println!("  Workers:           {}", workers);
    println!("  Avg e2e time:      {:.2} µs", avg_e2e_ns as f64 / 1000.0);
    println!("  Min e2e time:      {:.2} µs", min_e2e_ns as f64 / 1000.0);
    println!("  E2E throughput:    {:.0} packets/sec (best run)\n", e2e_throughput);

    // ── Benchmark 4: Latency Distribution ─────────────────────────
    println!("── Benchmark 4: Receive → Send Latency ───────────────");
    if let Some(pipeline) = &last_pipeline {
        let m = pipeline.metrics().snapshot();
        let lat = pipeline.recorder().summary();
        println!("  Forwarded:         {}", m.forwarded);
        println!("  Suppressed:        {}", m.suppressed);
        println!("  Queue-full stalls: {}", m.queue_full);
        println!("  Samples:           {}", lat.count);
        println!("  Min latency:       {} ns", lat.min_ns);
        println!("  Max latency:       {} ns", lat.max_ns);
        println!("  Avg latency:       {} ns", lat.avg_ns);
        println!("  Median (P50):      {} ns", lat.median_ns);
        println!("  P99 latency:       {} ns", lat.p99_ns);
        println!("  P99.9 latency:     {} ns", lat.p999_ns);
    }

    println!("\n╔══════════════════════════════════════════════════════╗");
    println!("║                   SUMMARY                            ║");
    println!("╠══════════════════════════════════════════════════════╣");
    println!("║  Decode throughput:  {:>12.0} packets/sec        ║", decode_throughput);
    println!("║  Book+score:         {:>12.0} packets/sec        ║", book_throughput);
    println!("║  E2E throughput:     {:>12.0} packets/sec        ║", e2e_throughput);
    println!("║  Per-packet (book):  {:>9.0} ns                  ║", per_packet_ns);
    if let Some(pipeline) = &last_pipeline {
        let lat = pipeline.recorder().summary();
        println!("║  Median latency:     {:>9} ns                  ║", lat.median_ns);
        println!("║  P99 latency:        {:>9} ns                  ║", lat.p99_ns);
    }
    println!("╚══════════════════════════════════════════════════════╝");
}

fn avg_min(times: &[u64]) -> (u64, u64) {
    let avg = times.iter().sum::<u64>() / times.len().max(1) as u64;
    let min = times.iter().copied().min().unwrap_or(0);
    (avg, min)
}

fn per_sec(count: usize, ns: u64) -> f64 {
    if ns == 0 {
        return 0.0;
    }
    (count as f64 / ns as f64) * 1_000_000_000.0
}
