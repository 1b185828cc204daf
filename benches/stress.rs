use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use ulid::Ulid;

use tutorsched::engine::{CreateScheduleEntry, Engine, EngineOptions, EntryFilter};
use tutorsched::index::Scope;
use tutorsched::model::*;
use tutorsched::tenant::TenantManager;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 7, 0, 0, 0).unwrap()
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
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// One location with a room per tutor.
struct Org {
    engine: Arc<Engine>,
    location: Ulid,
    service: Ulid,
    tutors: Vec<(Ulid, Ulid)>,
}

impl Org {
    fn session(&self, tutor: usize, start: DateTime<Utc>) -> CreateScheduleEntry {
        let (tutor_id, room_id) = self.tutors[tutor % self.tutors.len()];
        CreateScheduleEntry {
            location_id: self.location,
            tutor_id,
            service_offered_id: self.service,
            start_at: start,
            duration_minutes: Some(60),
            room_ids: vec![room_id],
            ..Default::default()
        }
    }
}

async fn setup(tm: &TenantManager, name: &str, n_tutors: usize) -> Org {
    let engine = tm.get_or_create(name).unwrap();
    let record = |detail| CatalogEntry {
        id: Ulid::new(),
        name: None,
        archived_at: None,
        detail,
    };

    let location = record(CatalogDetail::Location { kind: LocationKind::InPerson });
    let service = record(CatalogDetail::Service {
        capacity: 10,
        buffer_minutes: 10,
    });
    let location_id = location.id;
    let service_id = service.id;
    engine.upsert_catalog(location).await.unwrap();
    engine.upsert_catalog(service).await.unwrap();

    let mut tutors = Vec::with_capacity(n_tutors);
    for _ in 0..n_tutors {
        let tutor = record(CatalogDetail::Tutor);
        let room = record(CatalogDetail::Room { location_id });
        tutors.push((tutor.id, room.id));
        engine.upsert_catalog(tutor).await.unwrap();
        engine.upsert_catalog(room).await.unwrap();
    }

    Org {
        engine,
        location: location_id,
        service: service_id,
        tutors,
    }
}

async fn phase1_sequential(tm: &TenantManager) {
    let org = setup(tm, "bench_sequential", 1).await;
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let req = org.session(0, base() + TimeDelta::hours(2 * i as i64));
        let t = Instant::now();
        org.engine.create_schedule_entries(req).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} entries in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create latency", &mut latencies);
}

async fn phase2_concurrent(tm: &TenantManager) {
    let n_tasks = 10;
    let n_per_task = 200;
    let org = Arc::new(setup(tm, "bench_concurrent", n_tasks).await);

    let start = Instant::now();
    let mut handles = Vec::new();
    for task in 0..n_tasks {
        let org = org.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                let req = org.session(task, base() + TimeDelta::hours(2 * j as i64));
                org.engine.create_schedule_entries(req).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tutors x {n_per_task} entries = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_series(tm: &TenantManager) {
    let n_tutors = 20;
    let org = setup(tm, "bench_series", n_tutors).await;
    let mut latencies = Vec::with_capacity(n_tutors);

    for tutor in 0..n_tutors {
        let req = CreateScheduleEntry {
            recurrence_type: RecurrenceType::Weekly,
            recurrence_interval: Some(1),
            recurrence_days_of_week: vec![1, 3, 5],
            occurrence_count: Some(300),
            ..org.session(tutor, base() + TimeDelta::hours(9))
        };
        let t = Instant::now();
        let created = org.engine.create_schedule_entries(req).await.unwrap();
        latencies.push(t.elapsed());
        assert_eq!(created.entries.len(), 300);
    }
    print_latency("300-occurrence series", &mut latencies);

    // The same series again clashes on its first occurrence.
    let mut rejections = Vec::with_capacity(n_tutors);
    for tutor in 0..n_tutors {
        let req = CreateScheduleEntry {
            recurrence_type: RecurrenceType::Weekly,
            recurrence_interval: Some(1),
            recurrence_days_of_week: vec![1, 3, 5],
            occurrence_count: Some(300),
            ..org.session(tutor, base() + TimeDelta::hours(9))
        };
        let t = Instant::now();
        assert!(org.engine.create_schedule_entries(req).await.is_err());
        rejections.push(t.elapsed());
    }
    print_latency("rejected series", &mut rejections);
}

async fn phase4_read_under_load(tm: &TenantManager) {
    let n_writers = 5;
    let org = Arc::new(setup(tm, "bench_reads", n_writers + 1).await);

    // Pre-fill the reader's tutor.
    for i in 0..200 {
        let req = org.session(n_writers, base() + TimeDelta::hours(2 * i));
        org.engine.create_schedule_entries(req).await.unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..n_writers {
        let org = org.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let req = org.session(w, base() + TimeDelta::hours(2 * i));
                let _ = org.engine.create_schedule_entries(req).await;
                i += 1;
            }
        }));
    }

    let (reader_tutor, _) = org.tutors[n_writers];
    let filter = EntryFilter {
        window: Span::new(
            base().timestamp_millis(),
            (base() + TimeDelta::days(30)).timestamp_millis(),
        ),
        scope: Scope::tutor(reader_tutor),
        include_archived: false,
    };
    let mut latencies = Vec::with_capacity(5000);
    for _ in 0..5000 {
        let t = Instant::now();
        org.engine.list_entries(&filter).await.unwrap();
        latencies.push(t.elapsed());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("tutor listing (30 days)", &mut latencies);
}

#[tokio::main]
async fn main() {
    let dir = std::env::temp_dir().join(format!("tutorsched_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = TenantManager::new(dir.clone(), u64::MAX, EngineOptions::default());

    println!("=== tutorsched stress benchmark ===");
    println!("data_dir: {}\n", dir.display());

    // Each phase uses its own organization to avoid interference

    println!("[phase 1] sequential creation throughput");
    phase1_sequential(&tm).await;

    println!("\n[phase 2] concurrent creation throughput");
    phase2_concurrent(&tm).await;

    println!("\n[phase 3] recurring series expansion");
    phase3_series(&tm).await;

    println!("\n[phase 4] listing latency under write load");
    phase4_read_under_load(&tm).await;

    let _ = std::fs::remove_dir_all(&dir);
    println!("\n=== benchmark complete ===");
}
