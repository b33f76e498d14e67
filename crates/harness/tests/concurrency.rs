use std::sync::{Arc, Barrier};
use std::thread;

use folio_core::{AccessReason, SessionId, SessionOutcome, Timestamp, UserId};
use folio_engine::{Editor, Engine, EngineError, MemoryBlobStore, PermissionGate, SaveRequest};
use folio_harness::{ScriptedGate, TestBench};
use folio_storage::{NewSession, SqliteStorage, Storage, StorageError};

const WRITERS: usize = 4;
const SAVES_PER_WRITER: usize = 10;

fn open_engine(bench_dir: &std::path::Path) -> Result<Engine, EngineError> {
    let gate: Arc<dyn PermissionGate> = Arc::new(ScriptedGate::new());
    Ok(Engine::new(
        SqliteStorage::open(TestBench::db_path(bench_dir))?,
        gate,
        Arc::new(MemoryBlobStore::new()),
    ))
}

#[test]
fn concurrent_snapshots_get_contiguous_numbers() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut bench = TestBench::file_backed(dir.path())?;
    let owner = TestBench::editor("owner");
    let task = bench.task(&owner)?;

    // Open every connection up front; each writer then owns its engine.
    let engines = (0..WRITERS)
        .map(|_| open_engine(dir.path()))
        .collect::<Result<Vec<_>, _>>()?;
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = engines
        .into_iter()
        .enumerate()
        .map(|(w, mut engine)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<Vec<u32>, EngineError> {
                let editor = Editor::new(UserId::new(), format!("writer-{w}"));
                barrier.wait();
                let mut numbers = Vec::with_capacity(SAVES_PER_WRITER);
                for i in 0..SAVES_PER_WRITER {
                    // A fresh session per save forces a new snapshot every time.
                    let saved = engine.save(SaveRequest::new(
                        task,
                        format!("w{w}-s{i}"),
                        editor.clone(),
                        format!("writer {w} save {i}"),
                    ))?;
                    assert!(saved.is_new_snapshot);
                    numbers.push(saved.version_number);
                }
                Ok(numbers)
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        let numbers = handle.join().map_err(|_| "writer panicked")??;
        assert!(numbers.windows(2).all(|w| w[0] < w[1]));
        all.extend(numbers);
    }
    all.sort_unstable();

    let expected: Vec<u32> = (0..(WRITERS * SAVES_PER_WRITER) as u32).collect();
    assert_eq!(all, expected);
    assert_eq!(bench.version_numbers(task)?, expected);
    assert_eq!(bench.latest_rows(task)?, 1);
    assert_eq!(
        bench.engine.get_latest(task)?.version_number,
        (WRITERS * SAVES_PER_WRITER - 1) as u32
    );

    Ok(())
}

#[test]
fn racing_closes_have_one_winner() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut bench = TestBench::file_backed(dir.path())?;
    let ana = TestBench::editor("ana");
    let task = bench.task(&ana)?;
    bench.save(task, "S1", &ana, "contested")?;

    let engines = (0..WRITERS)
        .map(|_| open_engine(dir.path()))
        .collect::<Result<Vec<_>, _>>()?;
    let barrier = Arc::new(Barrier::new(WRITERS));
    let outcomes = [
        SessionOutcome::Completed,
        SessionOutcome::Cancelled,
        SessionOutcome::Completed,
        SessionOutcome::Cancelled,
    ];

    let handles: Vec<_> = engines
        .into_iter()
        .zip(outcomes)
        .map(|(mut engine, outcome)| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                engine.end_session("S1", outcome, None).map(|s| s.outcome())
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut already_closed = 0;
    for handle in handles {
        match handle.join().map_err(|_| "closer panicked")? {
            Ok(outcome) => winners.push(outcome),
            Err(EngineError::AlreadyClosed(_)) => already_closed += 1,
            Err(other) => return Err(other.into()),
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(already_closed, WRITERS - 1);
    assert_eq!(bench.engine.get_session("S1")?.outcome(), winners[0]);

    Ok(())
}

#[test]
fn duplicate_session_creation_has_one_winner() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut bench = TestBench::file_backed(dir.path())?;
    let ana = TestBench::editor("ana");
    let task = bench.task(&ana)?;

    let connections = (0..WRITERS)
        .map(|_| SqliteStorage::open(TestBench::db_path(dir.path())))
        .collect::<Result<Vec<_>, _>>()?;
    let barrier = Arc::new(Barrier::new(WRITERS));
    let session_id = SessionId::parse("S-shared")?;

    let handles: Vec<_> = connections
        .into_iter()
        .enumerate()
        .map(|(w, mut storage)| {
            let barrier = Arc::clone(&barrier);
            // Each caller proposes its own start time; only the first insert sticks.
            let new = NewSession {
                session_id: session_id.clone(),
                task_id: task,
                user_id: ana.user_id,
                username: ana.username.clone(),
                access_reason: AccessReason::Owner,
                started_at: Timestamp::from_secs(w as i64),
            };
            thread::spawn(move || -> Result<_, StorageError> {
                barrier.wait();
                storage.create_or_get_session(&new)
            })
        })
        .collect();

    let mut rows = Vec::new();
    let mut inserted = 0;
    for handle in handles {
        let (row, created) = handle.join().map_err(|_| "creator panicked")??;
        if created {
            inserted += 1;
        }
        rows.push(row);
    }
    assert_eq!(inserted, 1);
    assert!(rows.windows(2).all(|pair| pair[0] == pair[1]));
    assert!(rows.iter().all(|r| r.started_at == rows[0].started_at));

    let stored = bench.engine.get_session("S-shared")?;
    assert_eq!(stored, rows[0]);
    assert_eq!(stored.autosave_count, 0);

    Ok(())
}
