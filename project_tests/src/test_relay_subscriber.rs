//! Diagnostic subscriber for the data receiver's public surface.
//!
//! Connects, counts the significant moves it receives and prints a rate summary at a fixed
//! interval, together with the last price and the largest gap between two moves.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Public surface of the data receiver
    #[clap(short, long, default_value = "ws://127.0.0.1:8081/public")]
    url: String,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct MoveMessage {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(rename = "p")]
    price: String,
}

#[derive(Default)]
struct Stats {
    timestamps: VecDeque<DateTime<Utc>>,
    total: u64,
    malformed: u64,
    last_price: Option<String>,
    last_at: Option<DateTime<Utc>>,
    longest_gap_secs: i64,
}

impl Stats {
    fn record(&mut self, now: DateTime<Utc>, price: String) {
        if let Some(prev) = self.last_at {
            self.longest_gap_secs = self.longest_gap_secs.max((now - prev).num_seconds());
        }
        self.timestamps.push_back(now);
        self.total += 1;
        self.last_price = Some(price);
        self.last_at = Some(now);
    }

    /// Moves seen during the last minute.
    fn rate(&mut self, now: DateTime<Utc>) -> usize {
        let one_minute_ago = now - Duration::minutes(1);
        while self.timestamps.front().is_some_and(|&t| t < one_minute_ago) {
            self.timestamps.pop_front();
        }
        self.timestamps.len()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let interval = std::time::Duration::from_secs(args.report_interval_seconds.max(1));
    tokio::spawn(async move {
        loop {
            sleep(interval).await;
            let mut data = stats_reporter.lock().expect("stats lock poisoned");
            let rate = data.rate(Utc::now());

            println!("\n----- Relay Summary -----");
            println!("Rate: {} moves/min", rate);
            println!("Total: {} (malformed: {})", data.total, data.malformed);
            println!("Last price: {}", data.last_price.as_deref().unwrap_or("n/a"));
            println!("Longest gap: {}s", data.longest_gap_secs);
            println!("-------------------------\n");
        }
    });

    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;
    let (_write, mut read) = ws_stream.split();
    println!("Connected. Press Ctrl+C to stop.");

    while let Some(msg) = read.next().await {
        match msg? {
            Message::Text(text) => {
                let now = Utc::now();
                let mut data = stats.lock().expect("stats lock poisoned");
                match serde_json::from_str::<MoveMessage>(&text) {
                    Ok(parsed) if parsed.msg_type == "S" => data.record(now, parsed.price),
                    _ => data.malformed += 1,
                }
            }
            Message::Close(frame) => {
                println!("Closed by server: {:?}", frame);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
