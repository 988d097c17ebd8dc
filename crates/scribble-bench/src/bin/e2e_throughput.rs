//! End-to-end throughput benchmark for Scribble.
//!
//! Every client joins the same board and draws as fast as it can; the
//! benchmark counts strokes relayed back by the server over real sockets.
//!
//! ```bash
//! e2e_throughput [clients] [url]
//! ```

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use scribble_bench::{pen, spiral_segment};
use scribble_protocol::{codec, Frame};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws";
const BOARD: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type ClientResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| DEFAULT_URL.to_string());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║         Scribble End-to-End Throughput Benchmark             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Make sure the server is running: cargo run --release        ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    run_board_benchmark(num_clients, url).await;
}

async fn run_board_benchmark(num_clients: usize, url: String) {
    println!("📊 Shared board benchmark: {} clients on '{}'", num_clients, BOARD);
    println!("   Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let sent = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let sent = Arc::clone(&sent);
        let received = Arc::clone(&received);
        let barrier = Arc::clone(&barrier);
        let url = url.clone();

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(&url, sent, received, barrier).await {
                eprintln!("Client {} error: {}", client_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("✓ All {} clients joined", num_clients);

    println!("⏳ Warming up for {}s...", WARMUP_SECS);
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    sent.store(0, Ordering::SeqCst);
    received.store(0, Ordering::SeqCst);
    let start = Instant::now();

    println!("📈 Measuring for {}s...", BENCH_SECS);
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed().as_secs_f64();
    let total_sent = sent.load(Ordering::SeqCst);
    let total_received = received.load(Ordering::SeqCst);

    // Every stroke should reach the other clients on the board.
    let expected = total_sent * num_clients.saturating_sub(1) as u64;
    let delivery = if expected == 0 {
        100.0
    } else {
        total_received as f64 * 100.0 / expected as f64
    };

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                         RESULTS                              ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Clients:              {:>10}                           ║", num_clients);
    println!("║  Duration:             {:>10.2}s                          ║", elapsed);
    println!("║  Strokes drawn:        {:>10}                           ║", total_sent);
    println!("║  Strokes relayed:      {:>10}                           ║", total_received);
    println!(
        "║  Draw rate:            {:>10.0} strokes/s                ║",
        total_sent as f64 / elapsed
    );
    println!(
        "║  Relay rate:           {:>10.0} strokes/s                ║",
        total_received as f64 / elapsed
    );
    println!("║  Delivered:            {:>10.1}%                          ║", delivery);
    println!("╚══════════════════════════════════════════════════════════════╝");

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    url: &str,
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> ClientResult<()> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();
    let mut buf = BytesMut::with_capacity(65536);

    // Connected
    next_frame(&mut receiver, &mut buf).await?;

    let join = codec::encode(&Frame::join(1, BOARD, None))?;
    sender.send(Message::Binary(join.to_vec())).await?;

    // History arrives first; wait for the joined frame.
    loop {
        match next_frame(&mut receiver, &mut buf).await? {
            Frame::Joined { .. } => break,
            Frame::Error { code, message, .. } => {
                return Err(format!("join failed ({code}): {message}").into());
            }
            _ => {}
        }
    }

    barrier.wait().await;

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Binary(data) = msg {
                buf.extend_from_slice(&data);
                while let Ok(Some(frame)) = codec::decode_from(&mut buf) {
                    if matches!(frame, Frame::Stroke { .. }) {
                        received.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    });

    let style = Some(pen());
    let mut i = 0;
    loop {
        let (from, to) = spiral_segment(i);
        i += 1;
        let draw = Frame::Draw {
            id: None,
            from,
            to,
            style: style.clone(),
        };
        let bytes = codec::encode(&draw)?;
        if sender.send(Message::Binary(bytes.to_vec())).await.is_err() {
            break;
        }
        sent.fetch_add(1, Ordering::Relaxed);
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}

async fn next_frame<S>(receiver: &mut S, buf: &mut BytesMut) -> ClientResult<Frame>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        if let Some(frame) = codec::decode_from(buf)? {
            return Ok(frame);
        }
        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => buf.extend_from_slice(&data),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err("connection closed".into()),
        }
    }
}
