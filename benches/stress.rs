use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

use slotkeeper::calendar::MemoryCalendar;
use slotkeeper::config::EngineConfig;
use slotkeeper::notify::LogNotifier;
use slotkeeper::tenant::TenantManager;
use slotkeeper::wire;

const HOUR: i64 = 3_600_000;
/// 2031-01-07T00:00:00Z, a Tuesday.
const BASE: i64 = 1_925_510_400_000;

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    let dir = std::env::temp_dir().join(format!("slotkeeper_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create data dir");
    let tm = Arc::new(TenantManager::new(
        dir,
        100_000,
        Duration::from_secs(3600),
        Arc::new(MemoryCalendar::new()),
        Arc::new(LogNotifier),
        EngineConfig::default(),
    ));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotkeeper".into(), None).await;
            });
        }
    });
    addr
}

async fn connect(addr: SocketAddr, tenant: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(tenant)
        .user("slotkeeper")
        .password("slotkeeper");

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

/// One professional with a one-hour service.
struct Fixture {
    tenant: String,
    professional: Ulid,
    service: Ulid,
}

async fn setup(addr: SocketAddr) -> Fixture {
    let tenant = format!("bench_{}", Ulid::new());
    let client = connect(addr, &tenant).await;
    let professional = Ulid::new();
    let service = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO professionals (id, email, name) VALUES ('{professional}', 'pro@example.com', 'Pro')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, professional_id, name, duration, price) VALUES ('{service}', '{professional}', 'Session', 60, 5000)"
        ))
        .await
        .unwrap();
    Fixture {
        tenant,
        professional,
        service,
    }
}

fn booking_sql(f: &Fixture, start: i64, client: usize) -> String {
    format!(
        "INSERT INTO bookings (professional_id, service_id, start, client_name, client_email) VALUES ('{}', '{}', {start}, 'Client {client}', 'client{client}@example.com')",
        f.professional, f.service
    )
}

async fn phase1_sequential(addr: SocketAddr) {
    let f = setup(addr).await;
    let client = connect(addr, &f.tenant).await;

    let n = 1000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(&f, BASE + i as i64 * HOUR, i))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    println!(
        "  {n} bookings in {:.2}s ({:.0} bookings/s)",
        elapsed.as_secs_f64(),
        n as f64 / elapsed.as_secs_f64()
    );
    print_latency("booking", &mut latencies);
}

/// Every client races for the same slot. Exactly one may win; the rest must
/// see an exclusion violation.
async fn phase2_contention(addr: SocketAddr) {
    let rounds = 20;
    let contenders = 32;
    let f = Arc::new(setup(addr).await);
    let mut latencies = Vec::new();

    for round in 0..rounds {
        let slot = BASE + round as i64 * 2 * HOUR;
        let winners = Arc::new(AtomicUsize::new(0));
        let losers = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(contenders);
        for c in 0..contenders {
            let f = f.clone();
            let winners = winners.clone();
            let losers = losers.clone();
            handles.push(tokio::spawn(async move {
                let client = connect(addr, &f.tenant).await;
                let t = Instant::now();
                match client.batch_execute(&booking_sql(&f, slot, c)).await {
                    Ok(()) => {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) if e.code() == Some(&SqlState::EXCLUSION_VIOLATION) => {
                        losers.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => panic!("unexpected booking error: {e}"),
                }
                t.elapsed()
            }));
        }
        for h in handles {
            latencies.push(h.await.unwrap());
        }
        let won = winners.load(Ordering::SeqCst);
        assert_eq!(won, 1, "round {round}: {won} winners for one slot");
        assert_eq!(losers.load(Ordering::SeqCst), contenders - 1);
    }
    println!("  {rounds} rounds x {contenders} contenders: exactly one winner each");
    print_latency("contended booking", &mut latencies);
}

async fn phase3_read_under_load(addr: SocketAddr) {
    let f = Arc::new(setup(addr).await);
    let stop = Arc::new(AtomicBool::new(false));

    let mut writers = Vec::new();
    for w in 0..4 {
        let f = f.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(addr, &f.tenant).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let start = BASE + (w * 10_000 + i) * HOUR;
                let _ = client.batch_execute(&booking_sql(&f, start, w as usize)).await;
                i += 1;
            }
        }));
    }

    let mut readers = Vec::new();
    for _ in 0..8 {
        let f = f.clone();
        readers.push(tokio::spawn(async move {
            let client = connect(addr, &f.tenant).await;
            let mut latencies = Vec::with_capacity(300);
            for _ in 0..300 {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM availability WHERE professional_id = '{}' AND service_id = '{}' AND date = '2031-01-07'",
                        f.professional, f.service
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

async fn phase4_connection_storm(addr: SocketAddr) {
    let n_conns = 50;
    let f = Arc::new(setup(addr).await);
    let success = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for c in 0..n_conns {
        let f = f.clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr, &f.tenant).await;
            client
                .batch_execute(&booking_sql(&f, BASE + c as i64 * HOUR, c))
                .await
                .unwrap();
            client
                .simple_query(&format!(
                    "SELECT * FROM booking_stats WHERE professional_id = '{}'",
                    f.professional
                ))
                .await
                .unwrap();
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let addr = start_server().await;
    println!("=== slotkeeper stress benchmark ===");
    println!("server: {addr}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(addr).await;

    println!("\n[phase 2] single-slot contention");
    phase2_contention(addr).await;

    println!("\n[phase 3] availability latency under booking load");
    phase3_read_under_load(addr).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(addr).await;

    println!("\n=== benchmark complete ===");
}
