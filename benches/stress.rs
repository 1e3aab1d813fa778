use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage};
use ulid::Ulid;

async fn connect(host: &str, port: u16, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(db)
        .user("seatline")
        .password("seatline");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn create_resource(client: &Client, capacity: u32) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, capacity) VALUES ('{rid}', {capacity})"
        ))
        .await
        .unwrap();
    rid
}

/// Request a seat and return the reservation id.
async fn reserve(client: &Client, rid: Ulid, subject: &str) -> String {
    let msgs = client
        .simple_query(&format!(
            "INSERT INTO reservations (resource_id, subject_id) VALUES ('{rid}', '{subject}')"
        ))
        .await
        .unwrap();
    msgs.into_iter()
        .find_map(|m| match m {
            SimpleQueryMessage::Row(r) => r.get("id").map(str::to_string),
            _ => None,
        })
        .expect("reservation row")
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &format!("bench_{}", Ulid::new())).await;
    let rid = create_resource(&client, 1000).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        reserve(&client, rid, &format!("seq-{i}")).await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} requests in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("request latency", &mut latencies);
}

/// Many connections racing for the same few seats on one tenant.
async fn phase2_contended(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &db).await;
    let capacity = 50;
    let rid = create_resource(&setup, capacity).await;

    let n_tasks = 20;
    let n_per_task = 100;
    let start = Instant::now();
    let mut handles = Vec::new();
    for t in 0..n_tasks {
        let host = host.to_string();
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut latencies = Vec::with_capacity(n_per_task);
            for j in 0..n_per_task {
                let t0 = Instant::now();
                reserve(&client, rid, &format!("c{t}-{j}")).await;
                latencies.push(t0.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in handles {
        all.extend(h.await.unwrap());
    }
    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    println!(
        "  {n_tasks} tasks x {n_per_task} requests = {total} total in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    print_latency("contended request latency", &mut all);

    let avail = setup
        .simple_query(&format!("SELECT * FROM availability WHERE resource_id = '{rid}'"))
        .await
        .unwrap();
    for m in avail {
        if let SimpleQueryMessage::Row(r) = m {
            println!(
                "  confirmed={} waitlisted={}",
                r.get("confirmed_count").unwrap_or("?"),
                r.get("waitlist_length").unwrap_or("?")
            );
        }
    }
}

/// Cancel confirmed seats while the waitlist is deep, so every cancel promotes.
async fn phase3_cancel_churn(host: &str, port: u16) {
    let client = connect(host, port, &format!("bench_{}", Ulid::new())).await;
    let rid = create_resource(&client, 10).await;

    let n = 1000;
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        ids.push((format!("churn-{i}"), reserve(&client, rid, &format!("churn-{i}")).await));
    }

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for (subject, id) in &ids {
        let t = Instant::now();
        client
            .batch_execute(&format!(
                "DELETE FROM reservations WHERE id = '{id}' AND acting_subject = '{subject}'"
            ))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} cancellations in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("cancel + promote latency", &mut latencies);
}

async fn phase4_read_under_load(host: &str, port: u16) {
    let db = format!("bench_{}", Ulid::new());
    let setup = connect(host, port, &db).await;
    let rid = create_resource(&setup, 25).await;

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let db = db.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let subject = format!("w{w}-{i}");
                let id = reserve(&client, rid, &subject).await;
                let _ = client
                    .batch_execute(&format!(
                        "DELETE FROM reservations WHERE id = '{id}' AND acting_subject = '{subject}'"
                    ))
                    .await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut readers = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let db = db.clone();
        readers.push(tokio::spawn(async move {
            let client = connect(&host, port, &db).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .batch_execute(&format!(
                        "SELECT * FROM availability WHERE resource_id = '{rid}'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("availability query", &mut all);
}

async fn phase5_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let success = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &format!("bench_{}", Ulid::new())).await;
            let rid = create_resource(&client, 5).await;
            for i in 0..ops_per_conn {
                reserve(&client, rid, &format!("s{i}")).await;
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("SEATLINE_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("SEATLINE_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid SEATLINE_PORT");

    println!("=== seatline stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential admission throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended admissions on one resource");
    phase2_contended(&host, port).await;

    println!("\n[phase 3] cancellation with promotion");
    phase3_cancel_churn(&host, port).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(&host, port).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port).await;

    println!("\n=== done ===");
}
