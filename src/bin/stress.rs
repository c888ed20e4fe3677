// src/bin/stress.rs
//
// Load generator for the ingestion server: N concurrent connections sending
// framed JSON batches as fast as they can for a fixed duration, with a
// latency/throughput report at the end.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use txflow::framing::{read_frame, write_frame};
use txflow::types::unix_secs;

struct StressConfig {
    addr: String,
    concurrency: usize,
    duration: Duration,
    batch_rows: usize,
    auth_token: Option<String>,
}

fn parse_args() -> Result<StressConfig, String> {
    let mut config = StressConfig {
        addr: "127.0.0.1:50051".to_string(),
        concurrency: 10,
        duration: Duration::from_secs(30),
        batch_rows: 50,
        auth_token: None,
    };

    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        let mut value = |name: &str| {
            args.next().ok_or_else(|| format!("missing value for {name}"))
        };
        match flag.as_str() {
            "-addr" => config.addr = value("-addr")?,
            "-c" => {
                config.concurrency = value("-c")?
                    .parse()
                    .map_err(|_| "invalid -c".to_string())?
            }
            "-d" => {
                let secs: u64 = value("-d")?
                    .parse()
                    .map_err(|_| "invalid -d".to_string())?;
                config.duration = Duration::from_secs(secs);
            }
            "-rows" => {
                config.batch_rows = value("-rows")?
                    .parse()
                    .map_err(|_| "invalid -rows".to_string())?
            }
            "-token" => config.auth_token = Some(value("-token")?),
            other => return Err(format!("unknown flag: {other}")),
        }
    }
    if config.concurrency == 0 || config.batch_rows == 0 {
        return Err("-c and -rows must be at least 1".to_string());
    }
    Ok(config)
}

fn batch_body(worker: usize, seq: u64, rows: usize) -> String {
    let now = unix_secs();
    let items: Vec<String> = (0..rows)
        .map(|i| {
            format!(
                r#"{{"entity_id":"stress-{worker}-{seq}-{i}","event":"load","timestamp":{now}}}"#
            )
        })
        .collect();
    format!("[{}]", items.join(","))
}

struct Totals {
    requests: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
    latency_us: AtomicU64,
    max_latency_us: AtomicU64,
}

async fn run_worker(
    worker: usize,
    config: Arc<StressConfig>,
    totals: Arc<Totals>,
    stop: Arc<AtomicBool>,
) {
    let mut conn = match TcpStream::connect(&config.addr).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("worker {worker}: connect failed: {e}");
            return;
        }
    };

    if let Some(token) = &config.auth_token {
        let hello = format!(r#"{{"type":"auth","token":"{token}"}}"#);
        if write_frame(&mut conn, hello.as_bytes()).await.is_err() {
            return;
        }
        match read_frame(&mut conn).await {
            Ok(resp) if resp.starts_with(b"{\"success\":true") => {}
            _ => {
                eprintln!("worker {worker}: auth refused");
                return;
            }
        }
    }

    let mut seq = 0u64;
    while !stop.load(Ordering::Relaxed) {
        let body = batch_body(worker, seq, config.batch_rows);
        seq += 1;

        let started = Instant::now();
        totals.requests.fetch_add(1, Ordering::Relaxed);
        if write_frame(&mut conn, body.as_bytes()).await.is_err() {
            totals.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match read_frame(&mut conn).await {
            Ok(resp) if resp == b"OK" => {
                let us = started.elapsed().as_micros() as u64;
                totals.ok.fetch_add(1, Ordering::Relaxed);
                totals.latency_us.fetch_add(us, Ordering::Relaxed);
                totals.max_latency_us.fetch_max(us, Ordering::Relaxed);
            }
            Ok(_) => {
                totals.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                totals.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let config = match parse_args() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("usage: stress [-addr host:port] [-c workers] [-d secs] [-rows n] [-token t]");
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    println!("=== txflow ingest stress ===");
    println!("target:      {}", config.addr);
    println!("workers:     {}", config.concurrency);
    println!("duration:    {:?}", config.duration);
    println!("rows/batch:  {}", config.batch_rows);
    println!();

    let totals = Arc::new(Totals {
        requests: AtomicU64::new(0),
        ok: AtomicU64::new(0),
        failed: AtomicU64::new(0),
        latency_us: AtomicU64::new(0),
        max_latency_us: AtomicU64::new(0),
    });
    let stop = Arc::new(AtomicBool::new(false));

    let started = Instant::now();
    let mut joins = Vec::with_capacity(config.concurrency);
    for worker in 0..config.concurrency {
        joins.push(tokio::spawn(run_worker(
            worker,
            config.clone(),
            totals.clone(),
            stop.clone(),
        )));
    }

    tokio::time::sleep(config.duration).await;
    stop.store(true, Ordering::Relaxed);
    for join in joins {
        let _ = join.await;
    }
    let elapsed = started.elapsed();

    let requests = totals.requests.load(Ordering::Relaxed);
    let ok = totals.ok.load(Ordering::Relaxed);
    let failed = totals.failed.load(Ordering::Relaxed);
    let avg_ms = if ok > 0 {
        totals.latency_us.load(Ordering::Relaxed) as f64 / ok as f64 / 1000.0
    } else {
        0.0
    };

    println!("requests:    {requests}");
    println!("succeeded:   {ok}");
    println!("failed:      {failed}");
    println!("elapsed:     {elapsed:?}");
    println!("avg latency: {avg_ms:.2} ms");
    println!(
        "max latency: {:.2} ms",
        totals.max_latency_us.load(Ordering::Relaxed) as f64 / 1000.0
    );
    println!(
        "throughput:  {:.0} req/s ({:.0} tx/s)",
        requests as f64 / elapsed.as_secs_f64(),
        (ok as f64 * config.batch_rows as f64) / elapsed.as_secs_f64()
    );
}
