use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use folio_core::{ManualClock, TaskId, Timestamp, UserId};
use folio_engine::{
    Editor, Engine, EngineConfig, EngineError, MemoryBlobStore, SaveOutcome, SaveRequest,
};
use folio_storage::SqliteStorage;

use crate::ScriptedGate;

/// An engine wired to a manual clock, a scripted gate and an in-memory blob
/// store. The clock starts at the epoch.
pub struct TestBench {
    pub engine: Engine,
    pub clock: ManualClock,
    pub gate: Arc<ScriptedGate>,
    pub blobs: Arc<MemoryBlobStore>,
}

impl TestBench {
    pub fn new() -> Result<Self, EngineError> {
        Self::build(SqliteStorage::open_in_memory()?, EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Result<Self, EngineError> {
        Self::build(SqliteStorage::open_in_memory()?, config)
    }

    /// Backed by `folio.db` under `dir`, so other connections can share it.
    pub fn file_backed(dir: &Path) -> Result<Self, EngineError> {
        Self::build(SqliteStorage::open(Self::db_path(dir))?, EngineConfig::default())
    }

    pub fn db_path(dir: &Path) -> std::path::PathBuf {
        dir.join("folio.db")
    }

    fn build(storage: SqliteStorage, config: EngineConfig) -> Result<Self, EngineError> {
        crate::init_logging();
        let clock = ManualClock::new(Timestamp::EPOCH);
        let gate = Arc::new(ScriptedGate::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let engine = Engine::new(storage, gate.clone(), blobs.clone())
            .with_clock(Arc::new(clock.clone()))
            .with_config(config)?;
        Ok(Self {
            engine,
            clock,
            gate,
            blobs,
        })
    }

    /// Register a task owned by `owner`.
    pub fn task(&mut self, owner: &Editor) -> Result<TaskId, EngineError> {
        let task_id = TaskId::new();
        self.engine.register_task(task_id, owner.user_id, "task")?;
        self.gate.set_owner(task_id, owner.user_id);
        Ok(task_id)
    }

    pub fn editor(name: &str) -> Editor {
        Editor::new(UserId::new(), name)
    }

    /// Move the clock to `secs` after the epoch.
    pub fn at(&self, secs: i64) {
        self.clock.set(Timestamp::from_secs(secs));
    }

    pub fn advance(&self, d: Duration) -> Timestamp {
        self.clock.advance(d)
    }

    pub fn save(
        &mut self,
        task_id: TaskId,
        session_id: &str,
        editor: &Editor,
        content: &str,
    ) -> Result<SaveOutcome, EngineError> {
        self.engine
            .save(SaveRequest::new(task_id, session_id, editor.clone(), content))
    }

    /// Rows flagged latest for the task, counted straight from the database.
    pub fn latest_rows(&self, task_id: TaskId) -> Result<i64, EngineError> {
        Ok(self
            .engine
            .storage()
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM versions WHERE task_id = ?1 AND is_latest = 1",
                [task_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .map_err(folio_storage::StorageError::from)?)
    }

    /// Version numbers of the task, ascending.
    pub fn version_numbers(&self, task_id: TaskId) -> Result<Vec<u32>, EngineError> {
        let conn = self.engine.storage().conn();
        let mut stmt = conn
            .prepare("SELECT version_number FROM versions WHERE task_id = ?1 ORDER BY version_number")
            .map_err(folio_storage::StorageError::from)?;
        let numbers = stmt
            .query_map([task_id.as_bytes().as_slice()], |row| row.get(0))
            .and_then(|rows| rows.collect::<Result<Vec<u32>, _>>())
            .map_err(folio_storage::StorageError::from)?;
        Ok(numbers)
    }
}
