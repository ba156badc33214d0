use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bookd::clock::ManualClock;
use bookd::engine::{Engine, EngineError};
use bookd::model::{Ms, Status};
use bookd::notify::NotifyHub;
use bookd::store::{BookingRepository, LocalStore};
use ulid::Ulid;

const HOUR: Ms = 3_600_000; // 1 hour in ms
const T0: Ms = 1_000_000_000_000; // Sep 2001

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
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

fn engine_over(store: Arc<dyn BookingRepository>) -> Arc<Engine> {
    Arc::new(Engine::with_clock(
        store,
        Arc::new(NotifyHub::new()),
        Arc::new(ManualClock::new(T0)),
    ))
}

/// Slot `i` of a provider's calendar, one hour long, back to back.
fn slot(i: usize) -> (Ms, Ms) {
    let s = T0 + 3 * HOUR + (i as Ms) * HOUR;
    (s, s + HOUR)
}

async fn phase1_sequential(engine: &Engine) {
    let provider = Ulid::new();
    let requester = Ulid::new();
    let n = 2000;
    let mut request_lat = Vec::with_capacity(n);
    let mut confirm_lat = Vec::with_capacity(n);

    let start = Instant::now();
    for i in 0..n {
        let (s, e) = slot(i);
        let t = Instant::now();
        let b = engine
            .request_booking(provider, requester, s, e, None)
            .await
            .expect("request failed");
        request_lat.push(t.elapsed());

        let t = Instant::now();
        engine
            .transition_booking(b.id, Status::Confirmed, provider)
            .await
            .expect("confirm failed");
        confirm_lat.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = (2 * n) as f64 / elapsed.as_secs_f64();
    println!("  {n} request+confirm pairs in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("request latency", &mut request_lat);
    print_latency("confirm latency", &mut confirm_lat);
}

async fn phase2_concurrent(engine: Arc<Engine>) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            // One provider per task: no contention on the provider lock.
            let provider = Ulid::new();
            for j in 0..n_per_task {
                let (s, e) = slot(j);
                engine
                    .request_booking(provider, Ulid::new(), s, e, None)
                    .await
                    .expect("request failed");
            }
        }));
    }
    for h in handles {
        h.await.expect("task panicked");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contention(engine: Arc<Engine>) {
    let n_tasks = 50;
    let n_rounds = 40;
    let provider = Ulid::new();
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    for round in 0..n_rounds {
        let (s, e) = slot(round);
        let mut handles = Vec::new();
        for _ in 0..n_tasks {
            let engine = engine.clone();
            let won = won.clone();
            let lost = lost.clone();
            handles.push(tokio::spawn(async move {
                match engine.request_booking(provider, Ulid::new(), s, e, None).await {
                    Ok(_) => won.fetch_add(1, Ordering::Relaxed),
                    Err(EngineError::Conflict(_)) => lost.fetch_add(1, Ordering::Relaxed),
                    Err(err) => panic!("unexpected error: {err}"),
                };
            }));
        }
        for h in handles {
            h.await.expect("task panicked");
        }
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_rounds} slots x {n_tasks} racers: {won} won, {} conflicted in {:.2}s",
        lost.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
    assert_eq!(won, n_rounds, "double booking detected");
}

async fn phase4_read_under_load(engine: Arc<Engine>) {
    let provider = Ulid::new();
    for i in 0..200 {
        let (s, e) = slot(i);
        engine
            .request_booking(provider, Ulid::new(), s, e, None)
            .await
            .expect("prefill failed");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..5 {
        let engine = engine.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let provider = Ulid::new();
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let (s, e) = slot(i);
                let _ = engine.request_booking(provider, Ulid::new(), s, e, None).await;
                i += 1;
            }
            i
        }));
    }

    let n = 2000;
    let mut list_lat = Vec::with_capacity(n);
    let mut check_lat = Vec::with_capacity(n);
    for i in 0..n {
        let t = Instant::now();
        let _ = engine.bookings_for_provider(provider, &Status::ACTIVE).await;
        list_lat.push(t.elapsed());

        let (s, e) = slot(i % 400);
        let t = Instant::now();
        let _ = engine.find_conflicts(provider, s, e).await;
        check_lat.push(t.elapsed());
    }

    stop.store(true, Ordering::Relaxed);
    let mut written = 0;
    for w in writers {
        written += w.await.expect("writer panicked");
    }
    println!("  background writers created {written} bookings");
    print_latency("list latency", &mut list_lat);
    print_latency("conflict check latency", &mut check_lat);
}

#[tokio::main]
async fn main() {
    let dir = std::env::temp_dir().join(format!("bookd_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");

    println!("=== bookd stress benchmark ===");
    println!("wal dir: {}\n", dir.display());

    println!("[phase 1] sequential request + confirm (WAL)");
    let store = LocalStore::open(dir.join("phase1.wal")).expect("open wal");
    phase1_sequential(&engine_over(Arc::new(store))).await;

    println!("\n[phase 2] concurrent requests, distinct providers (WAL)");
    let store = LocalStore::open(dir.join("phase2.wal")).expect("open wal");
    phase2_concurrent(engine_over(Arc::new(store))).await;

    println!("\n[phase 3] racing requests for the same slot (in-memory)");
    phase3_contention(engine_over(Arc::new(LocalStore::in_memory()))).await;

    println!("\n[phase 4] read latency under write load (in-memory)");
    phase4_read_under_load(engine_over(Arc::new(LocalStore::in_memory()))).await;

    let _ = std::fs::remove_dir_all(&dir);
    println!("\n=== benchmark complete ===");
}
