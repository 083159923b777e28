//! Speculative and committed executions.
//!
//! Every snippet runs on its own freshly borrowed kernel from the pool, so
//! each "current" execution sees exactly the committed history and nothing
//! else. Selecting one commits its code to the "previous" list, which is the
//! preamble every pooled kernel is rebuilt with; the other current executions
//! are discarded.
//!
//! Pool rebuilds triggered here are queued while the state lock is held, so
//! they apply in the same order as the mutations that caused them, and are
//! only awaited after the lock is released.

use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};

use kernel_client::{
    ExceptionRecord, KernelError, KernelSession, PreloadedPool, Result, ResultRecord,
};
use futures::future::join_all;
use log::{info, warn};
use serde::Serialize;
use tokio::sync::{watch, Mutex};

/// What an execution produced once it finished.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordOutcome {
    pub results: Vec<ResultRecord>,
    pub exceptions: Vec<ExceptionRecord>,
    /// Set when the kernel could not run the code at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Id, code and kernel of a record, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordSummary {
    pub id: i64,
    pub code: String,
    pub kernel_id: String,
}

/// One submitted snippet and, eventually, its outcome.
pub struct ExecutionRecord {
    id: i64,
    code: String,
    kernel_id: String,
    session: StdMutex<Option<Arc<KernelSession>>>,
    outcome: OnceLock<RecordOutcome>,
    completed: watch::Sender<bool>,
}

impl ExecutionRecord {
    fn new(id: i64, code: &str, session: Arc<KernelSession>) -> Self {
        let (completed, _) = watch::channel(false);
        Self {
            id,
            code: code.to_string(),
            kernel_id: session.id().to_string(),
            session: StdMutex::new(Some(session)),
            outcome: OnceLock::new(),
            completed,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            id: self.id,
            code: self.code.clone(),
            kernel_id: self.kernel_id.clone(),
        }
    }

    pub fn is_complete(&self) -> bool {
        *self.completed.borrow()
    }

    /// The outcome, if the execution has finished.
    pub fn outcome(&self) -> Option<&RecordOutcome> {
        self.outcome.get()
    }

    /// Wait until the execution finishes. Any number of callers may wait.
    pub async fn wait_for_result(&self) -> &RecordOutcome {
        let mut completed = self.completed.subscribe();
        // The sender lives in `self`, so this only returns once completed.
        let _ = completed.wait_for(|done| *done).await;
        self.outcome.get_or_init(RecordOutcome::default)
    }

    fn complete(&self, outcome: RecordOutcome) {
        let _ = self.outcome.set(outcome);
        self.completed.send_replace(true);
    }

    fn take_session(&self) -> Option<Arc<KernelSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Close the kernel this record ran on, if it is still held.
    async fn close_session(&self) {
        if let Some(session) = self.take_session() {
            session.close().await;
        }
    }
}

impl std::fmt::Debug for ExecutionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRecord")
            .field("id", &self.id)
            .field("code", &self.code)
            .field("kernel_id", &self.kernel_id)
            .field("complete", &self.is_complete())
            .finish()
    }
}

#[derive(Default)]
struct StateInner {
    current: Vec<Arc<ExecutionRecord>>,
    previous: Vec<Arc<ExecutionRecord>>,
    next_id: i64,
}

impl StateInner {
    fn preamble(&self) -> String {
        self.previous
            .iter()
            .map(|record| record.code())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The REPL session: current executions, committed history, and the pool
/// they run on.
pub struct ExecutionState {
    pool: PreloadedPool,
    inner: Mutex<StateInner>,
}

fn rebuild_dropped() -> KernelError {
    KernelError::Transport("kernel pool stopped before rebuilding".into())
}

/// Close the kernels of discarded records without making the caller wait.
fn close_in_background(records: Vec<Arc<ExecutionRecord>>) {
    if records.is_empty() {
        return;
    }
    tokio::spawn(async move {
        join_all(records.iter().map(|record| record.close_session())).await;
    });
}

impl ExecutionState {
    pub fn new(pool: PreloadedPool) -> Self {
        Self {
            pool,
            inner: Mutex::new(StateInner::default()),
        }
    }

    pub fn pool(&self) -> &PreloadedPool {
        &self.pool
    }

    /// Run code on a fresh kernel and return the new record's id.
    ///
    /// Returns as soon as the code is submitted; use [`get_state`] and
    /// [`ExecutionRecord::wait_for_result`] to collect the outcome.
    ///
    /// [`get_state`]: ExecutionState::get_state
    pub async fn execute(&self, code: &str) -> Result<i64> {
        let session = self.pool.get().await?;

        let record = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_id;
            inner.next_id += 1;
            let record = Arc::new(ExecutionRecord::new(id, code, session.clone()));
            inner.current.push(record.clone());
            record
        };
        info!(
            "[state] Executing #{} on kernel {}",
            record.id(),
            record.kernel_id()
        );

        let id = record.id();
        tokio::spawn(async move {
            let outcome = match session.execute_code(record.code()).await {
                Ok(output) => RecordOutcome {
                    results: output.results,
                    exceptions: output.exceptions,
                    error: None,
                },
                Err(e) => {
                    warn!("[state] Execution #{} failed: {}", record.id(), e);
                    RecordOutcome {
                        error: Some(e.to_string()),
                        ..Default::default()
                    }
                }
            };
            record.complete(outcome);
            record.close_session().await;
        });

        Ok(id)
    }

    /// Commit a current execution and discard the others.
    ///
    /// Returns once the pool has been rebuilt with the new preamble.
    pub async fn select(&self, id: i64) -> Result<()> {
        let (rebuilt, discarded) = {
            let mut inner = self.inner.lock().await;
            let Some(pos) = inner.current.iter().position(|r| r.id() == id) else {
                return Err(KernelError::NotFound(id));
            };

            let selected = inner.current.remove(pos);
            let discarded = std::mem::take(&mut inner.current);
            inner.previous.push(selected);
            (self.pool.request_rebuild(inner.preamble()), discarded)
        };
        info!(
            "[state] Selected #{}, discarding {} other execution(s)",
            id,
            discarded.len()
        );

        close_in_background(discarded);
        rebuilt.await.map_err(|_| rebuild_dropped())
    }

    /// Drop a current execution. Returns `false` if there is none with `id`.
    pub async fn remove_state(&self, id: i64) -> bool {
        let removed = {
            let mut inner = self.inner.lock().await;
            match inner.current.iter().position(|r| r.id() == id) {
                Some(pos) => inner.current.remove(pos),
                None => return false,
            }
        };

        close_in_background(vec![removed]);
        true
    }

    /// Drop a committed execution and rebuild the pool without it.
    ///
    /// The rebuild runs in the background.
    pub async fn remove_previous_state(&self, id: i64) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(pos) = inner.previous.iter().position(|r| r.id() == id) else {
            return false;
        };

        inner.previous.remove(pos);
        info!("[state] Removed #{} from history", id);
        drop(self.pool.request_rebuild(inner.preamble()));
        true
    }

    /// Forget everything and rebuild the pool with an empty preamble.
    pub async fn reset(&self) -> Result<()> {
        let (rebuilt, discarded) = {
            let mut inner = self.inner.lock().await;
            if inner.current.is_empty() && inner.previous.is_empty() {
                return Ok(());
            }
            inner.previous.clear();
            let discarded = std::mem::take(&mut inner.current);
            (self.pool.request_rebuild(String::new()), discarded)
        };
        info!("[state] Reset");

        close_in_background(discarded);
        rebuilt.await.map_err(|_| rebuild_dropped())
    }

    /// Summaries of the current (`true`) or previous (`false`) executions.
    pub async fn list_states(&self, current: bool) -> Vec<RecordSummary> {
        let inner = self.inner.lock().await;
        let records = if current {
            &inner.current
        } else {
            &inner.previous
        };
        records.iter().map(|record| record.summary()).collect()
    }

    pub async fn get_state(&self, id: i64) -> Option<Arc<ExecutionRecord>> {
        let inner = self.inner.lock().await;
        inner
            .current
            .iter()
            .chain(inner.previous.iter())
            .find(|record| record.id() == id)
            .cloned()
    }

    /// Committed code, one record per line block.
    pub async fn preamble(&self) -> String {
        self.inner.lock().await.preamble()
    }

    /// Close the pool and every kernel still held by a current execution.
    pub async fn close(&self) {
        self.pool.close().await;

        let current = std::mem::take(&mut self.inner.lock().await.current);
        for record in current {
            record.close_session().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_client::testing::FakeLauncher;
    use kernel_client::PoolConfig;
    use serde_json::json;
    use std::time::Duration;

    async fn state() -> (ExecutionState, Arc<FakeLauncher>) {
        let launcher = FakeLauncher::new();
        let pool = PreloadedPool::start(launcher.clone(), PoolConfig { pool_size: 2 }).await;
        (ExecutionState::new(pool), launcher)
    }

    async fn run(state: &ExecutionState, code: &str) -> Arc<ExecutionRecord> {
        let id = state.execute(code).await.unwrap();
        let record = state.get_state(id).await.unwrap();
        record.wait_for_result().await;
        record
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let (state, _) = state().await;

        let a = state.execute("1+1").await.unwrap();
        let b = state.execute("2+2").await.unwrap();
        assert!(state.remove_state(b).await);
        let c = state.execute("3+3").await.unwrap();

        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[tokio::test]
    async fn test_execute_sum() {
        let (state, _) = state().await;
        let record = run(&state, "1+1").await;

        let outcome = record.outcome().unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].data["text/plain"], json!("2"));
        assert!(outcome.exceptions.is_empty());
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_execute_raise() {
        let (state, _) = state().await;
        let record = run(&state, "raise ValueError('x')").await;

        let outcome = record.outcome().unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.exceptions.len(), 1);
        assert_eq!(outcome.exceptions[0].ename, "ValueError");
    }

    #[tokio::test]
    async fn test_execute_empty_code() {
        let (state, _) = state().await;
        let record = run(&state, "").await;

        let outcome = record.outcome().unwrap();
        assert!(outcome.results.is_empty());
        assert!(outcome.exceptions.is_empty());
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_each_execution_gets_its_own_kernel() {
        let (state, _) = state().await;
        let a = run(&state, "1+1").await;
        let b = run(&state, "1+2").await;

        assert_ne!(a.kernel_id(), b.kernel_id());
    }

    #[tokio::test]
    async fn test_select_unknown_id_changes_nothing() {
        let (state, _) = state().await;
        state.execute("1+1").await.unwrap();
        let before = state.pool().status().await.generation;

        let result = state.select(42).await;

        assert!(matches!(result, Err(KernelError::NotFound(42))));
        assert_eq!(state.list_states(true).await.len(), 1);
        assert!(state.list_states(false).await.is_empty());
        assert_eq!(state.pool().status().await.generation, before);
    }

    #[tokio::test]
    async fn test_select_commits_code_to_preamble() {
        let (state, _) = state().await;
        let a = state.execute("a = 1").await.unwrap();
        state.execute("b = 2").await.unwrap();

        state.select(a).await.unwrap();
        assert!(state.list_states(true).await.is_empty());
        assert_eq!(state.preamble().await, "a = 1");
        assert_eq!(state.pool().preamble().await, "a = 1");

        let c = state.execute("c = 3").await.unwrap();
        state.select(c).await.unwrap();

        assert_eq!(state.preamble().await, "a = 1\nc = 3");
        let previous: Vec<i64> = state.list_states(false).await.iter().map(|s| s.id).collect();
        assert_eq!(previous, vec![a, c]);

        let session = state.pool().get().await.unwrap();
        assert_eq!(session.preamble(), Some("a = 1\nc = 3"));
    }

    #[tokio::test]
    async fn test_select_discards_running_executions() {
        let (state, _) = state().await;
        let slow = state.execute("while True: pass").await.unwrap();
        let quick = state.execute("1+1").await.unwrap();

        state.select(quick).await.unwrap();

        let record = state.get_state(slow).await;
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn test_discarded_execution_reports_error() {
        let (state, _) = state().await;
        let slow = state.execute("while True: pass").await.unwrap();
        let record = state.get_state(slow).await.unwrap();
        let quick = state.execute("1+1").await.unwrap();

        state.select(quick).await.unwrap();

        let outcome = record.wait_for_result().await;
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_select_and_reset_do_not_wait_for_kernel_teardown() {
        let launcher = FakeLauncher::new();
        launcher.set_close_stalls(true);
        let pool = PreloadedPool::start(launcher.clone(), PoolConfig { pool_size: 2 }).await;
        let state = ExecutionState::new(pool);

        let slow = state.execute("while True: pass").await.unwrap();
        let quick = state.execute("1+1").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), state.select(quick))
            .await
            .expect("select waited for discarded kernels to close")
            .unwrap();
        assert!(state.get_state(slow).await.is_none());

        state.execute("while True: pass").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), state.reset())
            .await
            .expect("reset waited for discarded kernels to close")
            .unwrap();
        assert!(state.list_states(true).await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_on_empty_state_skips_rebuild() {
        let (state, _) = state().await;
        let before = state.pool().status().await.generation;

        state.reset().await.unwrap();

        assert_eq!(state.pool().status().await.generation, before);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let (state, _) = state().await;
        let a = state.execute("a = 1").await.unwrap();
        state.select(a).await.unwrap();
        state.execute("1+1").await.unwrap();

        state.reset().await.unwrap();

        assert!(state.list_states(true).await.is_empty());
        assert!(state.list_states(false).await.is_empty());
        assert_eq!(state.preamble().await, "");
        assert_eq!(state.pool().preamble().await, "");
    }

    #[tokio::test]
    async fn test_remove_state() {
        let (state, _) = state().await;
        let id = state.execute("1+1").await.unwrap();

        assert!(!state.remove_state(99).await);
        assert!(state.remove_state(id).await);
        assert!(!state.remove_state(id).await);
        assert!(state.get_state(id).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_previous_state_rebuilds_pool() {
        let (state, _) = state().await;
        let a = state.execute("a = 1").await.unwrap();
        state.select(a).await.unwrap();
        let b = state.execute("b = 2").await.unwrap();
        state.select(b).await.unwrap();

        assert!(!state.remove_previous_state(a + 100).await);
        assert!(state.remove_previous_state(a).await);
        assert_eq!(state.preamble().await, "b = 2");

        for _ in 0..100 {
            if state.pool().preamble().await == "b = 2" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool was not rebuilt");
    }

    #[tokio::test]
    async fn test_get_state_searches_previous() {
        let (state, _) = state().await;
        let a = state.execute("a = 1").await.unwrap();
        state.select(a).await.unwrap();

        let record = state.get_state(a).await.unwrap();
        assert_eq!(record.code(), "a = 1");
    }

    #[tokio::test]
    async fn test_pooled_kernels_replay_history() {
        let (state, launcher) = state().await;
        let a = state.execute("a = 1").await.unwrap();
        state.select(a).await.unwrap();

        let record = run(&state, "1+1").await;
        let replayed = launcher
            .sessions()
            .into_iter()
            .find(|(session, _)| session.id() == record.kernel_id())
            .map(|(_, kernel)| kernel.executed())
            .unwrap();
        assert_eq!(replayed, vec!["a = 1".to_string(), "1+1".to_string()]);
    }

    #[tokio::test]
    async fn test_close_closes_running_kernels() {
        let (state, launcher) = state().await;
        let id = state.execute("while True: pass").await.unwrap();
        let record = state.get_state(id).await.unwrap();

        state.close().await;

        assert!(record.wait_for_result().await.error.is_some());
        let held = launcher
            .sessions()
            .into_iter()
            .find(|(session, _)| session.id() == record.kernel_id())
            .unwrap();
        assert!(held.0.is_closed());
    }
}
