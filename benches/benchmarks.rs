//! Benchmark suite for steward subsystems.
//!
//! This module provides performance benchmarks for:
//! - Snapshot replay (event fold)
//! - Event decoding (log reads)
//! - Patch planning (drafts vs. worktree hashing)
//! - Steady-state patch application (everything already applied)
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//!
//! # Save baseline for comparison
//! cargo bench -- --save-baseline main
//!
//! # Compare against baseline
//! cargo bench -- --baseline main
//! ```

use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::fs;
use tempfile::TempDir;
use uuid::Uuid;

use steward::events::{replay, Event, EventKind, WorkStatus};
use steward::patch::{generate_patches, PatchEngine, PathPolicy};

// ============================================================================
// Replay Benchmarks
// ============================================================================

/// A run with `workers` workers of ten sections each.
fn synthetic_events(workers: usize) -> Vec<Event> {
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default();
    let mut events = Vec::new();
    let mut push = |kind: EventKind| {
        let n = events.len();
        events.push(Event::new(
            Uuid::from_u128(n as u128 + 1),
            "bench",
            start + Duration::milliseconds(n as i64),
            kind,
            "trace",
            format!("{n:016x}"),
        ));
    };

    for w in 0..workers {
        let worker = format!("worker-{w}");
        push(EventKind::WorkItemStarted {
            worker: worker.clone(),
            item_id: None,
        });
        for s in 0..10 {
            let item_id = Some(format!("{worker}/section-{s}"));
            push(EventKind::WorkItemStarted {
                worker: worker.clone(),
                item_id: item_id.clone(),
            });
            push(EventKind::ArtifactWritten {
                name: format!("{worker}-{s}"),
                path: format!("artifacts/{worker}-{s}.json"),
                content_hash: format!("{:064x}", s),
            });
            push(EventKind::WorkItemFinished {
                worker: worker.clone(),
                item_id,
                status: WorkStatus::Succeeded,
                error: None,
            });
        }
        push(EventKind::WorkItemFinished {
            worker,
            item_id: None,
            status: WorkStatus::Succeeded,
            error: None,
        });
    }
    push(EventKind::RunCompleted {});
    events
}

fn bench_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");

    for workers in [1, 10, 100] {
        let events = synthetic_events(workers);
        group.throughput(Throughput::Elements(events.len() as u64));
        group.bench_with_input(BenchmarkId::new("fold", workers), &events, |b, events| {
            b.iter(|| black_box(replay("bench", black_box(events))));
        });
    }

    group.finish();
}

fn bench_event_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_decode");

    let lines: Vec<String> = synthetic_events(10)
        .iter()
        .filter_map(|e| e.to_line().ok())
        .collect();
    group.throughput(Throughput::Elements(lines.len() as u64));
    group.bench_function("from_line", |b| {
        b.iter(|| {
            for line in &lines {
                black_box(Event::from_line(black_box(line)).ok());
            }
        });
    });

    group.finish();
}

// ============================================================================
// Patch Benchmarks
// ============================================================================

/// Run directory with `pages` drafts and an empty worktree.
fn create_drafts(pages: usize) -> TempDir {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let drafts = temp_dir.path().join("drafts");
    fs::create_dir_all(drafts.join("guide")).expect("Failed to create drafts");
    fs::create_dir_all(temp_dir.path().join("worktree")).expect("Failed to create worktree");

    for i in 0..pages {
        let content = format!(
            "---\ntitle: Page {i}\n---\n# Page {i}\n\n{}\n",
            "Some generated prose for this page. ".repeat(20)
        );
        fs::write(drafts.join(format!("guide/page_{i}.md")), content)
            .expect("Failed to write draft");
    }

    temp_dir
}

fn bench_patch_planning(c: &mut Criterion) {
    let mut group = c.benchmark_group("patch_planning");

    for pages in [10, 100] {
        let temp_dir = create_drafts(pages);
        let drafts = temp_dir.path().join("drafts");
        let policy = PathPolicy::new(temp_dir.path().join("worktree"));

        group.throughput(Throughput::Elements(pages as u64));
        group.bench_with_input(BenchmarkId::new("generate", pages), &pages, |b, _| {
            b.iter(|| black_box(generate_patches(&drafts, &policy, None).ok()));
        });
    }

    group.finish();
}

/// The dominant rerun path: every patch is already applied.
fn bench_patch_steady_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("patch_steady_state");

    for pages in [10, 100] {
        let temp_dir = create_drafts(pages);
        let drafts = temp_dir.path().join("drafts");
        let policy = PathPolicy::new(temp_dir.path().join("worktree"));
        let bundle = generate_patches(&drafts, &policy, None).expect("Failed to plan");
        let engine = PatchEngine::new(policy);
        engine
            .apply_batch(&bundle.patches)
            .expect("Failed to apply");

        group.throughput(Throughput::Elements(pages as u64));
        group.bench_with_input(
            BenchmarkId::new("apply_batch", pages),
            &bundle.patches,
            |b, patches| {
                b.iter(|| black_box(engine.apply_batch(black_box(patches)).ok()));
            },
        );
    }

    group.finish();
}

criterion_group!(replay_benches, bench_replay, bench_event_decode);

criterion_group!(patch_benches, bench_patch_planning, bench_patch_steady_state);

criterion_main!(replay_benches, patch_benches);
