use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clinic::timestamp::format_ms;
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

const SLOT: i64 = 30 * 60_000;
/// 2030-01-01T00:00:00Z, far enough ahead for any booking rule.
const EPOCH: i64 = 1_893_456_000_000;

async fn connect(host: &str, port: u16, clinic: &str) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(clinic)
        .user("bench")
        .password(std::env::var("CLINIC_PASSWORD").unwrap_or_else(|_| "clinic".into()));

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_clinic() -> String {
    format!("bench_{}", Ulid::new())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len().max(1) as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().copied().unwrap_or_default().as_secs_f64() * 1000.0,
    );
}

struct Staff {
    doctor: Ulid,
    patient: Ulid,
}

/// One doctor and one patient in the connected clinic.
async fn hire(client: &Client) -> Staff {
    let doctor = Ulid::new();
    let patient = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO doctors (id, license, first_name, last_name, email) \
                 VALUES ('{doctor}', 'L-{doctor}', 'Bench', 'Doctor', '{doctor}@bench.example');
             INSERT INTO patients (id, national_id, first_name, last_name, birth_date) \
                 VALUES ('{patient}', 'N-{patient}', 'Bench', 'Patient', '1980-01-01')"
        ))
        .await
        .unwrap();
    Staff { doctor, patient }
}

async fn book(client: &Client, staff: &Staff, slot: i64) -> Result<(), tokio_postgres::Error> {
    client
        .batch_execute(&format!(
            "INSERT INTO appointments (doctor_id, patient_id, start) VALUES ('{}', '{}', '{}')",
            staff.doctor,
            staff.patient,
            format_ms(EPOCH + slot * SLOT)
        ))
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_clinic()).await;
    let staff = hire(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        book(&client, &staff, i as i64).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many connections race for the same slots of one doctor. Exactly one
/// booking per slot may win.
async fn phase2_contention(host: &str, port: u16) {
    let n_tasks = 10;
    let n_slots = 200;
    let clinic = fresh_clinic();

    let setup = connect(host, port, &clinic).await;
    let staff = Arc::new(hire(&setup).await);

    let won = Arc::new(AtomicUsize::new(0));
    let refused = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let clinic = clinic.clone();
        let staff = staff.clone();
        let won = won.clone();
        let refused = refused.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &clinic).await;
            for slot in 0..n_slots {
                match book(&client, &staff, slot).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.as_db_error().is_some_and(|db| db.code().code() == "23P01") => {
                        refused.fetch_add(1, Ordering::Relaxed)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_slots as usize;
    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_slots} slots = {total} attempts in {:.2}s ({:.0} ops/sec)",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!("    booked={won}, refused={}", refused.load(Ordering::Relaxed));
    assert_eq!(won, n_slots as usize, "double booking detected");
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let clinic = fresh_clinic();
    let setup = connect(host, port, &clinic).await;
    let reader_staff = hire(&setup).await;
    for i in 0..200 {
        book(&setup, &reader_staff, i).await.unwrap();
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let clinic = clinic.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &clinic).await;
            let staff = hire(&client).await;
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let _ = book(&client, &staff, i).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let host = host.to_string();
        let clinic = clinic.clone();
        let doctor = reader_staff.doctor;
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &clinic).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT id, start, status FROM appointments \
                         WHERE doctor_id = '{doctor}' AND status = 'PENDING'"
                    ))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("agenda query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_clinic()).await;
            let staff = hire(&client).await;
            for i in 0..ops_per_conn {
                book(&client, &staff, i).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("CLINIC_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("CLINIC_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid CLINIC_PORT");

    println!("=== clinic stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended booking on one doctor");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] agenda reads under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
