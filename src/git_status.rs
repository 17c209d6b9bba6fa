//! Working-tree status poller
//!
//! Keeps a `git status` snapshot per tracked session fresh without blocking
//! event dispatch. Each tick spawns one query per tracked session on the
//! Tokio runtime; a session whose previous query is still running is skipped
//! for that tick, so slow repositories never pile up `git` processes.
//!
//! Failed queries are logged and leave the previous snapshot in place.

use crate::ManagedSession;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Default time between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default limit for a single `git status` call
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Shortest accepted poll interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Error)]
pub enum GitStatusError {
    #[error("directory does not exist: {0}")]
    MissingDirectory(PathBuf),
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("git status timed out after {0:?}")]
    Timeout(Duration),
}

/// One changed path in the working tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    /// Two-letter porcelain code: index then worktree (`M.`, `.M`, `??`, `UU`)
    pub code: String,
}

/// Repository status of a session's working directory
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatus {
    /// Current branch, `None` when HEAD is detached
    pub branch: Option<String>,
    pub upstream: Option<String>,
    pub ahead: u32,
    pub behind: u32,
    pub staged: u32,
    pub unstaged: u32,
    pub untracked: u32,
    pub conflicted: u32,
    pub files: Vec<FileChange>,
    /// Epoch milliseconds of the refresh that produced this snapshot
    pub last_updated: i64,
}

impl GitStatus {
    pub fn is_dirty(&self) -> bool {
        !self.files.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.files.len()
    }

    /// Equal in everything but `last_updated`
    pub fn same_content(&self, other: &GitStatus) -> bool {
        self.branch == other.branch
            && self.upstream == other.upstream
            && self.ahead == other.ahead
            && self.behind == other.behind
            && self.staged == other.staged
            && self.unstaged == other.unstaged
            && self.untracked == other.untracked
            && self.conflicted == other.conflicted
            && self.files == other.files
    }
}

/// Count the index/worktree columns of an `XY` code
fn count_xy(status: &mut GitStatus, xy: &str) {
    let mut chars = xy.chars();
    if chars.next().is_some_and(|c| c != '.') {
        status.staged += 1;
    }
    if chars.next().is_some_and(|c| c != '.') {
        status.unstaged += 1;
    }
}

/// Parse `git status --porcelain=v2 --branch` output.
///
/// `last_updated` is left at zero.
pub fn parse_porcelain_v2(output: &str) -> GitStatus {
    let mut status = GitStatus::default();

    for line in output.lines() {
        if let Some(header) = line.strip_prefix("# ") {
            let (key, value) = header.split_once(' ').unwrap_or((header, ""));
            match key {
                "branch.head" => {
                    status.branch = (value != "(detached)").then(|| value.to_string());
                }
                "branch.upstream" => status.upstream = Some(value.to_string()),
                "branch.ab" => {
                    for part in value.split_whitespace() {
                        if let Some(n) = part.strip_prefix('+') {
                            status.ahead = n.parse().unwrap_or(0);
                        } else if let Some(n) = part.strip_prefix('-') {
                            status.behind = n.parse().unwrap_or(0);
                        }
                    }
                }
                _ => {}
            }
            continue;
        }

        let (kind, rest) = line.split_once(' ').unwrap_or((line, ""));
        let change = match kind {
            // 1 XY sub mH mI mW hH hI path
            "1" => {
                let fields: Vec<&str> = rest.splitn(8, ' ').collect();
                let (Some(xy), Some(path)) = (fields.first(), fields.get(7)) else {
                    continue;
                };
                count_xy(&mut status, xy);
                FileChange {
                    path: path.to_string(),
                    code: xy.to_string(),
                }
            }
            // 2 XY sub mH mI mW hH hI Xscore path<TAB>origPath
            "2" => {
                let fields: Vec<&str> = rest.splitn(9, ' ').collect();
                let (Some(xy), Some(paths)) = (fields.first(), fields.get(8)) else {
                    continue;
                };
                count_xy(&mut status, xy);
                let path = paths.split('\t').next().unwrap_or(paths);
                FileChange {
                    path: path.to_string(),
                    code: xy.to_string(),
                }
            }
            // u XY sub m1 m2 m3 mW h1 h2 h3 path
            "u" => {
                let fields: Vec<&str> = rest.splitn(10, ' ').collect();
                let (Some(xy), Some(path)) = (fields.first(), fields.get(9)) else {
                    continue;
                };
                status.conflicted += 1;
                FileChange {
                    path: path.to_string(),
                    code: xy.to_string(),
                }
            }
            "?" if !rest.is_empty() => {
                status.untracked += 1;
                FileChange {
                    path: rest.to_string(),
                    code: "??".to_string(),
                }
            }
            _ => continue,
        };
        status.files.push(change);
    }

    status
}

/// Something that can report the repository status of a directory.
pub trait StatusSource: Send + Sync + 'static {
    fn query(&self, dir: &Path) -> impl Future<Output = Result<GitStatus, GitStatusError>> + Send;
}

/// Queries status by running the `git` CLI
#[derive(Debug, Clone)]
pub struct GitCli {
    timeout: Duration,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_TIMEOUT)
    }
}

impl GitCli {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl StatusSource for GitCli {
    async fn query(&self, dir: &Path) -> Result<GitStatus, GitStatusError> {
        if !tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(GitStatusError::MissingDirectory(dir.to_path_buf()));
        }

        let output = Command::new("git")
            .args(["status", "--porcelain=v2", "--branch"])
            .current_dir(dir)
            // Polling must not contend for index.lock with the agent's own git calls.
            .env("GIT_OPTIONAL_LOCKS", "0")
            .env("LC_ALL", "C")
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| GitStatusError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("not a git repository") {
                return Err(GitStatusError::NotARepository(dir.to_path_buf()));
            }
            return Err(GitStatusError::Failed {
                code: output.status.code(),
                stderr,
            });
        }

        let mut status = parse_porcelain_v2(&String::from_utf8_lossy(&output.stdout));
        status.last_updated = crate::now_millis();
        Ok(status)
    }
}

/// Called whenever a session's snapshot materially changes
pub type UpdateHandler = Arc<dyn Fn(&str, &GitStatus) + Send + Sync>;

/// Releases a session's in-flight slot when the query task ends, even on panic
struct InFlightSlot {
    set: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.session_id);
    }
}

struct Shared<S> {
    source: S,
    tracked: Mutex<HashMap<String, PathBuf>>,
    statuses: RwLock<HashMap<String, GitStatus>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    on_update: RwLock<Option<UpdateHandler>>,
    /// Bumped by `stop()`; queries started under an older generation are discarded
    generation: AtomicU64,
}

impl<S: StatusSource> Shared<S> {
    fn spawn_queries(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let Ok(runtime) = Handle::try_current() else {
            warn!("git status poll requested outside a Tokio runtime");
            return Vec::new();
        };

        let generation = self.generation.load(Ordering::Acquire);
        let targets: Vec<(String, PathBuf)> = lock(&self.tracked)
            .iter()
            .map(|(id, dir)| (id.clone(), dir.clone()))
            .collect();

        let mut handles = Vec::with_capacity(targets.len());
        for (session_id, dir) in targets {
            if !lock(&self.in_flight).insert(session_id.clone()) {
                trace!(%session_id, "previous git status query still running, skipping");
                continue;
            }
            let slot = InFlightSlot {
                set: Arc::clone(&self.in_flight),
                session_id: session_id.clone(),
            };
            let shared = Arc::clone(self);
            handles.push(runtime.spawn(async move {
                let _slot = slot;
                shared.refresh(session_id, dir, generation).await;
            }));
        }
        handles
    }

    async fn refresh(&self, session_id: String, dir: PathBuf, generation: u64) {
        let result = self.source.query(&dir).await;

        if self.generation.load(Ordering::Acquire) != generation {
            debug!(%session_id, "poller stopped, discarding git status result");
            return;
        }

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                warn!(%session_id, dir = %dir.display(), error = %e, "git status query failed, keeping previous snapshot");
                return;
            }
        };

        let changed = {
            // Held across the write so a concurrent untrack or stop cannot be undone.
            let tracked = lock(&self.tracked);
            if self.generation.load(Ordering::Acquire) != generation {
                debug!(%session_id, "poller stopped, discarding git status result");
                return;
            }
            if tracked.get(&session_id) != Some(&dir) {
                debug!(%session_id, "session untracked during query, discarding result");
                return;
            }
            let mut statuses = self.statuses.write().unwrap_or_else(PoisonError::into_inner);
            let changed = statuses
                .get(&session_id)
                .is_none_or(|previous| !previous.same_content(&status));
            statuses.insert(session_id.clone(), status.clone());
            changed
        };

        if !changed {
            trace!(%session_id, "git status unchanged");
            return;
        }

        debug!(%session_id, branch = ?status.branch, dirty = status.dirty_count(), "git status changed");
        let handler = self
            .on_update
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler(&session_id, &status);
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct GitStatusPoller<S = GitCli> {
    shared: Arc<Shared<S>>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl Default for GitStatusPoller<GitCli> {
    fn default() -> Self {
        Self::new(GitCli::default(), DEFAULT_POLL_INTERVAL)
    }
}

impl<S> GitStatusPoller<S> {
    /// Stop the timer. In-flight queries finish but their results are dropped.
    pub fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        {
            // Bumped under the tracked lock so no result can be written mid-stop.
            let _tracked = lock(&self.shared.tracked);
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
        }
        let _ = running.shutdown.send(true);
        running.task.abort();
        info!("git status polling stopped");
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }
}

impl<S> Drop for GitStatusPoller<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<S: StatusSource> GitStatusPoller<S> {
    /// Intervals below [`MIN_POLL_INTERVAL`] are raised to it.
    pub fn new(source: S, interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                tracked: Mutex::new(HashMap::new()),
                statuses: RwLock::new(HashMap::new()),
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                on_update: RwLock::new(None),
                generation: AtomicU64::new(0),
            }),
            interval: interval.max(MIN_POLL_INTERVAL),
            running: Mutex::new(None),
        }
    }

    /// Start (or retarget) tracking `directory` for `session_id`.
    ///
    /// Retargeting drops the snapshot taken from the old directory.
    pub fn track(&self, session_id: &str, directory: impl Into<PathBuf>) {
        let directory = directory.into();
        let mut tracked = lock(&self.shared.tracked);
        let previous = tracked.insert(session_id.to_string(), directory.clone());
        if previous.as_ref().is_some_and(|old| old != &directory) {
            self.shared
                .statuses
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(session_id);
        }
        if previous.as_ref() != Some(&directory) {
            debug!(%session_id, dir = %directory.display(), "tracking git status");
        }
    }

    /// Stop tracking `session_id` and forget its snapshot.
    pub fn untrack(&self, session_id: &str) {
        let mut tracked = lock(&self.shared.tracked);
        if tracked.remove(session_id).is_some() {
            debug!(%session_id, "untracking git status");
        }
        self.shared
            .statuses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }

    /// Track every session with a working directory and untrack the rest.
    pub fn sync_sessions(&self, sessions: &[ManagedSession]) {
        let wanted: HashMap<&str, &str> = sessions
            .iter()
            .filter_map(|s| s.cwd.as_deref().map(|cwd| (s.id.as_str(), cwd)))
            .collect();

        for id in self.tracked_sessions() {
            if !wanted.contains_key(id.as_str()) {
                self.untrack(&id);
            }
        }
        for (id, cwd) in wanted {
            self.track(id, cwd);
        }
    }

    pub fn tracked_sessions(&self) -> Vec<String> {
        lock(&self.shared.tracked).keys().cloned().collect()
    }

    /// Last successful snapshot, or `None` if never refreshed
    pub fn get_status(&self, session_id: &str) -> Option<GitStatus> {
        self.shared
            .statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    pub fn get_all_statuses(&self) -> HashMap<String, GitStatus> {
        self.shared
            .statuses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the update callback
    pub fn set_update_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &GitStatus) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_update
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// Number of queries currently running
    pub fn in_flight(&self) -> usize {
        lock(&self.shared.in_flight).len()
    }

    /// Fire one poll pass without waiting for it.
    ///
    /// Returns the number of queries started; sessions with a query still
    /// running are skipped.
    pub fn tick(&self) -> usize {
        self.shared.spawn_queries().len()
    }

    /// Fire one poll pass and wait for the queries it started.
    pub async fn poll_once(&self) -> usize {
        let handles = self.shared.spawn_queries();
        let started = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "git status query task failed");
            }
        }
        started
    }

    /// Start the recurring poll timer. Calling it while running does nothing.
    ///
    /// The first poll happens immediately.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.is_some() {
            debug!("git status polling already running");
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("cannot start git status polling outside a Tokio runtime");
            return;
        };

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let period = self.interval;
        let generation = shared.generation.load(Ordering::Acquire);

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if shared.generation.load(Ordering::Acquire) != generation {
                            break;
                        }
                        shared.spawn_queries();
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            trace!("git status poll loop exited");
        });

        *running = Some(Running { shutdown, task });
        info!(interval_ms = period.as_millis() as u64, "git status polling started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    const SAMPLE: &str = "\
# branch.oid 1a2b3c4d
# branch.head main
# branch.upstream origin/main
# branch.ab +2 -1
1 M. N... 100644 100644 100644 abc123 def456 src/lib.rs
1 .M N... 100644 100644 100644 abc123 def456 src/main.rs
2 R. N... 100644 100644 100644 abc123 def456 R100 src/new name.rs\tsrc/old.rs
u UU N... 100644 100644 100644 100644 a1 b2 c3 Cargo.lock
? notes.txt
! target/
";

    #[test]
    fn parses_branch_headers() {
        let status = parse_porcelain_v2(SAMPLE);
        assert_eq!(status.branch.as_deref(), Some("main"));
        assert_eq!(status.upstream.as_deref(), Some("origin/main"));
        assert_eq!(status.ahead, 2);
        assert_eq!(status.behind, 1);
        assert_eq!(status.last_updated, 0);
    }

    #[test]
    fn parses_entries() {
        let status = parse_porcelain_v2(SAMPLE);
        assert_eq!(status.staged, 2);
        assert_eq!(status.unstaged, 1);
        assert_eq!(status.conflicted, 1);
        assert_eq!(status.untracked, 1);
        assert_eq!(status.dirty_count(), 5);

        let paths: Vec<&str> = status.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "src/lib.rs",
                "src/main.rs",
                "src/new name.rs",
                "Cargo.lock",
                "notes.txt"
            ]
        );
        assert_eq!(status.files[3].code, "UU");
        assert_eq!(status.files[4].code, "??");
    }

    #[test]
    fn parses_detached_clean_tree() {
        let status = parse_porcelain_v2("# branch.oid abc\n# branch.head (detached)\n");
        assert!(status.branch.is_none());
        assert!(status.upstream.is_none());
        assert!(!status.is_dirty());
    }

    #[test]
    fn same_content_ignores_timestamp() {
        let a = parse_porcelain_v2(SAMPLE);
        let mut b = a.clone();
        b.last_updated = 42;
        assert!(a.same_content(&b));

        b.ahead += 1;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let mut status = parse_porcelain_v2(SAMPLE);
        status.last_updated = 7;
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"lastUpdated\":7"));
        assert!(json.contains("\"branch\":\"main\""));
    }

    /// Scripted source: per-directory results, optional gate, call counter
    #[derive(Default)]
    struct FakeSource {
        results: Mutex<HashMap<PathBuf, Result<GitStatus, ()>>>,
        gate: Option<Arc<Notify>>,
        calls: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn set(&self, dir: &str, result: Result<GitStatus, ()>) {
            lock(&self.results).insert(PathBuf::from(dir), result);
        }
    }

    impl StatusSource for FakeSource {
        async fn query(&self, dir: &Path) -> Result<GitStatus, GitStatusError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let result = lock(&self.results).get(dir).cloned();
            match result {
                Some(Ok(status)) => Ok(status),
                _ => Err(GitStatusError::NotARepository(dir.to_path_buf())),
            }
        }
    }

    fn branch(name: &str) -> GitStatus {
        GitStatus {
            branch: Some(name.into()),
            last_updated: crate::now_millis(),
            ..Default::default()
        }
    }

    fn poller(source: FakeSource) -> GitStatusPoller<FakeSource> {
        GitStatusPoller::new(source, Duration::from_secs(1))
    }

    fn update_counter(poller: &GitStatusPoller<FakeSource>) -> Arc<AtomicUsize> {
        let updates = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&updates);
        poller.set_update_handler(move |_id: &str, _status: &GitStatus| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        updates
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn track_and_untrack() {
        let poller = poller(FakeSource::default());
        assert!(poller.get_status("unknown").is_none());
        assert!(poller.get_all_statuses().is_empty());

        poller.track("session-1", "/test/dir");
        assert!(poller.get_status("session-1").is_none());
        assert_eq!(poller.tracked_sessions(), vec!["session-1"]);

        poller.untrack("session-1");
        assert!(poller.get_status("session-1").is_none());
        assert!(poller.tracked_sessions().is_empty());
    }

    #[test]
    fn sync_sessions_follows_snapshot() {
        let poller = poller(FakeSource::default());
        poller.track("gone", "/old");
        let sessions = vec![
            ManagedSession::local("local", "Local", Some("/repo".into())),
            ManagedSession::remote("remote", "Remote", "task-1", None),
        ];

        poller.sync_sessions(&sessions);
        assert_eq!(poller.tracked_sessions(), vec!["local"]);
    }

    #[test]
    fn tick_outside_runtime_is_noop() {
        let poller = poller(FakeSource::default());
        poller.track("session-1", "/repo");
        assert_eq!(poller.tick(), 0);
        poller.start();
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn successful_poll_stores_and_notifies() {
        let source = FakeSource::default();
        source.set("/repo", Ok(branch("main")));
        let poller = poller(source);
        let updates = update_counter(&poller);
        poller.track("session-1", "/repo");

        assert_eq!(poller.poll_once().await, 1);
        assert_eq!(
            poller.get_status("session-1").unwrap().branch.as_deref(),
            Some("main")
        );
        assert_eq!(updates.load(Ordering::SeqCst), 1);

        // Same content again: snapshot replaced, no update.
        poller.poll_once().await;
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(poller.get_all_statuses().len(), 1);
    }

    #[tokio::test]
    async fn changed_content_notifies_again() {
        let source = FakeSource::default();
        source.set("/repo", Ok(branch("main")));
        let poller = poller(source);
        let updates = update_counter(&poller);
        poller.track("session-1", "/repo");
        poller.poll_once().await;

        poller.shared.source.set("/repo", Ok(branch("feature")));
        poller.poll_once().await;
        assert_eq!(updates.load(Ordering::SeqCst), 2);
        assert_eq!(
            poller.get_status("session-1").unwrap().branch.as_deref(),
            Some("feature")
        );
    }

    #[tokio::test]
    async fn failed_poll_keeps_previous_snapshot() {
        let source = FakeSource::default();
        source.set("/repo", Ok(branch("main")));
        let poller = poller(source);
        let updates = update_counter(&poller);
        poller.track("session-1", "/repo");
        poller.poll_once().await;
        let before = poller.get_status("session-1");

        poller.shared.source.set("/repo", Err(()));
        poller.poll_once().await;

        assert_eq!(poller.get_status("session-1"), before);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_first_poll_leaves_none() {
        let poller = poller(FakeSource::default());
        let updates = update_counter(&poller);
        poller.track("session-1", "/missing");

        poller.poll_once().await;
        assert!(poller.get_status("session-1").is_none());
        assert_eq!(updates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn slow_query_is_coalesced() {
        let gate = Arc::new(Notify::new());
        let source = FakeSource {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        source.set("/repo", Ok(branch("main")));
        let calls = Arc::clone(&source.calls);
        let poller = poller(source);
        poller.track("session-1", "/repo");

        assert_eq!(poller.tick(), 1);
        assert_eq!(poller.tick(), 0);
        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
        assert_eq!(poller.tick(), 0);
        assert_eq!(poller.in_flight(), 1);

        gate.notify_one();
        wait_until(|| poller.in_flight() == 0).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(poller.get_status("session-1").is_some());

        assert_eq!(poller.tick(), 1);
        gate.notify_one();
        wait_until(|| poller.in_flight() == 0).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn untrack_during_query_discards_result() {
        let gate = Arc::new(Notify::new());
        let source = FakeSource {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        source.set("/repo", Ok(branch("main")));
        let poller = poller(source);
        poller.track("session-1", "/repo");

        poller.tick();
        poller.untrack("session-1");
        gate.notify_one();
        wait_until(|| poller.in_flight() == 0).await;

        assert!(poller.get_status("session-1").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_store_discards_result() {
        let gate = Arc::new(Notify::new());
        let source = FakeSource {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        source.set("/repo", Ok(branch("main")));
        let calls = Arc::clone(&source.calls);
        let poller = poller(source);
        poller.track("session-1", "/repo");

        poller.tick();
        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;

        {
            // The query finishes while the store path is blocked on this guard.
            let _tracked = lock(&poller.shared.tracked);
            gate.notify_one();
            std::thread::sleep(Duration::from_millis(100));
            poller.shared.generation.fetch_add(1, Ordering::AcqRel);
        }

        wait_until(|| poller.in_flight() == 0).await;
        assert!(poller.get_status("session-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_and_stop_halts_ticks() {
        let source = FakeSource::default();
        source.set("/repo", Ok(branch("main")));
        let calls = Arc::clone(&source.calls);
        let poller = poller(source);
        poller.track("session-1", "/repo");

        poller.start();
        poller.start();
        assert!(poller.is_running());

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let ticked = calls.load(Ordering::SeqCst);
        // One timer fires at 0s, 1s, 2s and 3s; a second timer would double that.
        assert!((3..=5).contains(&ticked), "unexpected tick count {ticked}");

        poller.stop();
        poller.stop();
        assert!(!poller.is_running());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), ticked);
    }

    #[tokio::test]
    async fn stop_discards_in_flight_results() {
        let gate = Arc::new(Notify::new());
        let source = FakeSource {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        };
        source.set("/repo", Ok(branch("main")));
        let calls = Arc::clone(&source.calls);
        let poller = poller(source);
        poller.track("session-1", "/repo");

        poller.start();
        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
        poller.stop();

        gate.notify_one();
        wait_until(|| poller.in_flight() == 0).await;
        assert!(poller.get_status("session-1").is_none());

        // A fresh start polls normally again.
        poller.start();
        wait_until(|| calls.load(Ordering::SeqCst) == 2).await;
        gate.notify_one();
        wait_until(|| poller.get_status("session-1").is_some()).await;
        poller.stop();
    }
}
