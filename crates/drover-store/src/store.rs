//! The durable store.
//!
//! Layout under `data_dir`:
//!
//! ```text
//! runs/<run_id>/run.json
//! runs/<run_id>/events.ndjson
//! runs/<run_id>/artifacts/<step_id>/<name>
//! sessions/<sid>/session.json
//! sessions/<sid>/events.ndjson
//! sessions/<sid>/attachments/<name>
//! sessions/<sid>/artifacts/<turn_id>/<name>
//! ```
//!
//! In-memory maps are the source of truth for reads; every mutation is
//! persisted before it is observable. Event fan-out goes through per-id
//! broadcast channels so a slow subscriber lags without ever blocking the
//! appender.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};

use drover_domain::cancel::{CancelToken, WeakCancelToken};
use drover_domain::id::{new_attachment_id, new_run_id, new_session_id, new_turn_id};
use drover_domain::paths;
use drover_domain::{Error, Result};

use crate::models::{Event, Run, RunStatus};
use crate::session::{
    ApprovalDecision, Message, Session, SessionEvent, SessionMode, SessionStatus, Turn, TurnStatus,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One-shot receiver handed to the engine by `require_*_approval`.
pub type ApprovalReceiver = oneshot::Receiver<ApprovalDecision>;

/// A saved attachment reference, always relative to the session directory.
#[derive(Debug, Clone, Serialize)]
pub struct SavedAttachment {
    #[serde(rename = "ref")]
    pub reference: String,
    pub mime_type: String,
}

pub struct Store {
    data_dir: PathBuf,
    runs: RwLock<HashMap<String, Run>>,
    sessions: RwLock<HashMap<String, Session>>,
    run_streams: RwLock<HashMap<String, broadcast::Sender<Event>>>,
    session_streams: RwLock<HashMap<String, broadcast::Sender<SessionEvent>>>,
    run_approvals: Mutex<HashMap<(String, String), oneshot::Sender<ApprovalDecision>>>,
    session_approvals: Mutex<HashMap<(String, String), oneshot::Sender<ApprovalDecision>>>,
    run_cancels: Mutex<HashMap<String, WeakCancelToken>>,
    session_cancels: Mutex<HashMap<String, WeakCancelToken>>,
}

impl Store {
    /// Open (or create) the store, loading every persisted run and session.
    /// Unparseable records are skipped with a warning; nothing auto-resumes.
    pub fn open(data_dir: &Path) -> Result<Self> {
        if data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidInput("data_dir is empty".into()));
        }
        std::fs::create_dir_all(data_dir.join("runs"))?;
        std::fs::create_dir_all(data_dir.join("sessions"))?;

        let store = Self {
            data_dir: data_dir.to_path_buf(),
            runs: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            run_streams: RwLock::new(HashMap::new()),
            session_streams: RwLock::new(HashMap::new()),
            run_approvals: Mutex::new(HashMap::new()),
            session_approvals: Mutex::new(HashMap::new()),
            run_cancels: Mutex::new(HashMap::new()),
            session_cancels: Mutex::new(HashMap::new()),
        };
        store.load_existing();
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn load_existing(&self) {
        let mut runs = self.runs.write();
        for entry in list_subdirs(&self.data_dir.join("runs")) {
            match read_json::<Run>(&entry.join("run.json")) {
                Ok(run) => {
                    runs.insert(run.id.clone(), run);
                }
                Err(err) => {
                    tracing::warn!(path = %entry.display(), error = %err, "skipping unreadable run");
                }
            }
        }
        drop(runs);

        let mut sessions = self.sessions.write();
        for entry in list_subdirs(&self.data_dir.join("sessions")) {
            match read_json::<Session>(&entry.join("session.json")) {
                Ok(session) => {
                    sessions.insert(session.id.clone(), session);
                }
                Err(err) => {
                    tracing::warn!(path = %entry.display(), error = %err, "skipping unreadable session");
                }
            }
        }
    }

    // ── Paths ──────────────────────────────────────────────────────

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(run_id)
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    fn run_events_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("events.ndjson")
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(session_id)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("session.json")
    }

    fn session_events_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("events.ndjson")
    }

    fn session_attachments_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("attachments")
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Runs
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn create_run(&self, workspace_path: &str, spec_path: &str) -> Result<Run> {
        if workspace_path.trim().is_empty() {
            return Err(Error::InvalidInput("workspace_path is empty".into()));
        }
        if spec_path.trim().is_empty() {
            return Err(Error::InvalidInput("spec_path is empty".into()));
        }
        let now = Utc::now();
        let run = Run {
            id: new_run_id(),
            created_at: now,
            updated_at: now,
            status: RunStatus::Queued,
            workspace_path: workspace_path.to_owned(),
            spec_path: spec_path.to_owned(),
            model_canonical: None,
            steps: Vec::new(),
            error: None,
        };

        std::fs::create_dir_all(self.run_dir(&run.id))?;
        std::fs::write(self.run_events_path(&run.id), "")?;
        self.save_run(&run)?;
        self.runs.write().insert(run.id.clone(), run.clone());

        self.append_event(
            &run.id,
            Event::new(&run.id, "run_created").with_data(serde_json::json!({
                "workspace_path": workspace_path,
                "spec_path": spec_path,
            })),
        )?;
        Ok(run)
    }

    fn save_run(&self, run: &Run) -> Result<()> {
        write_json(&self.run_path(&run.id), run)
    }

    pub fn update_run(&self, mut run: Run) -> Result<()> {
        run.updated_at = Utc::now();
        self.save_run(&run)?;
        self.runs.write().insert(run.id.clone(), run);
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        self.runs
            .read()
            .get(run_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("run not found: {run_id}")))
    }

    /// All runs, newest first.
    pub fn list_runs(&self) -> Vec<Run> {
        let mut runs: Vec<Run> = self.runs.read().values().cloned().collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs
    }

    pub fn append_event(&self, run_id: &str, mut event: Event) -> Result<()> {
        event.ts = normalize_ts(&event.ts);
        if event.run_id.is_empty() {
            event.run_id = run_id.to_owned();
        }
        append_line(&self.run_events_path(run_id), &event)?;
        if let Some(tx) = self.run_streams.read().get(run_id) {
            let _ = tx.send(event);
        }
        Ok(())
    }

    /// Live event stream. Subscribers only see events appended after this
    /// call; historical replay is the caller's job via `read_events`.
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<Event> {
        self.run_streams
            .write()
            .entry(run_id.to_owned())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// First `max_items` events (all when `max_items <= 0`). Malformed
    /// lines are skipped.
    pub fn read_events(&self, run_id: &str, max_items: i64) -> Vec<Event> {
        read_ndjson(&self.run_events_path(run_id), max_items)
    }

    pub fn write_run_artifact(
        &self,
        run_id: &str,
        step_id: &str,
        name: &str,
        content: &str,
    ) -> Result<String> {
        let dir = self.run_dir(run_id).join("artifacts").join(step_id);
        std::fs::create_dir_all(&dir)?;
        let mut text = content.to_owned();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        std::fs::write(dir.join(name), text)?;
        Ok(format!("artifacts/{step_id}/{name}"))
    }

    pub fn export_run(&self, run_id: &str) -> Result<Vec<u8>> {
        let dir = self.run_dir(run_id);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("run not found: {run_id}")));
        }
        export_archive(
            &[
                ("run.json", self.run_path(run_id)),
                ("events.ndjson", self.run_events_path(run_id)),
            ],
            &[("artifacts", dir.join("artifacts"))],
        )
    }

    // ── Run approvals & cancellation ───────────────────────────────

    pub fn require_approval(&self, run_id: &str, step_id: &str) -> Result<ApprovalReceiver> {
        require_waiter(&self.run_approvals, run_id, step_id, "step")
    }

    pub fn approve(&self, run_id: &str, step_id: &str, decision: ApprovalDecision) -> Result<()> {
        resolve_waiter(&self.run_approvals, run_id, step_id, "step", decision)
    }

    /// Block until the waiter resolves or the token trips. Polls the token
    /// at a 100 ms cadence; on cancel, surfaces the cancel cause.
    pub async fn wait_for_approval(
        mut rx: ApprovalReceiver,
        cancel: &CancelToken,
    ) -> Result<ApprovalDecision> {
        loop {
            tokio::select! {
                decision = &mut rx => {
                    return decision
                        .map_err(|_| Error::Other("approval waiter dropped".into()));
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                    if cancel.is_cancelled() {
                        return Err(Error::Canceled(cancel.reason()));
                    }
                }
            }
        }
    }

    pub fn set_run_cancel(&self, run_id: &str, token: &CancelToken) {
        self.run_cancels
            .lock()
            .insert(run_id.to_owned(), token.downgrade());
    }

    /// Trigger a run's cancel token. Unknown or expired ids are a no-op.
    pub fn cancel_run(&self, run_id: &str) {
        let token = self.run_cancels.lock().get(run_id).cloned();
        if let Some(token) = token.and_then(|w| w.upgrade()) {
            token.cancel();
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Sessions
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn create_session(
        &self,
        workspace_path: &str,
        system_prompt: &str,
        mode: SessionMode,
        spec_path: &str,
    ) -> Result<Session> {
        if workspace_path.trim().is_empty() {
            return Err(Error::InvalidInput("workspace_path is empty".into()));
        }
        let now = Utc::now();
        let session = Session {
            id: new_session_id(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::Active,
            mode,
            workspace_path: workspace_path.to_owned(),
            system_prompt: some_trimmed(system_prompt),
            spec_path: some_trimmed(spec_path),
            last_turn_id: None,
            messages: Vec::new(),
            turns: Vec::new(),
            cost: None,
            error: None,
        };

        std::fs::create_dir_all(self.session_dir(&session.id))?;
        std::fs::write(self.session_events_path(&session.id), "")?;
        self.save_session(&session)?;
        self.sessions
            .write()
            .insert(session.id.clone(), session.clone());

        self.append_session_event(
            &session.id,
            SessionEvent::new(&session.id, "session_created")
                .with_data(serde_json::json!({ "workspace_path": workspace_path })),
        )?;
        Ok(session)
    }

    fn save_session(&self, session: &Session) -> Result<()> {
        write_json(&self.session_path(&session.id), session)
    }

    pub fn update_session(&self, mut session: Session) -> Result<()> {
        session.updated_at = Utc::now();
        self.save_session(&session)?;
        self.sessions.write().insert(session.id.clone(), session);
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session not found: {session_id}")))
    }

    /// All sessions, newest first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }

    /// Append to the strictly append-only transcript.
    pub fn append_message(&self, session_id: &str, msg: Message) -> Result<Session> {
        let mut session = self.get_session(session_id)?;
        session.messages.push(msg);
        self.update_session(session.clone())?;
        Ok(session)
    }

    /// Register a fresh pending turn and return its id.
    pub fn add_turn(&self, session_id: &str) -> Result<String> {
        let mut session = self.get_session(session_id)?;
        let turn = Turn {
            id: new_turn_id(),
            status: TurnStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        };
        let turn_id = turn.id.clone();
        session.turns.push(turn);
        session.last_turn_id = Some(turn_id.clone());
        self.update_session(session)?;
        Ok(turn_id)
    }

    pub fn append_session_event(&self, session_id: &str, mut event: SessionEvent) -> Result<()> {
        event.ts = normalize_ts(&event.ts);
        if event.session_id.is_empty() {
            event.session_id = session_id.to_owned();
        }
        append_line(&self.session_events_path(session_id), &event)?;
        if let Some(tx) = self.session_streams.read().get(session_id) {
            let _ = tx.send(event);
        }
        Ok(())
    }

    pub fn subscribe_session(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.session_streams
            .write()
            .entry(session_id.to_owned())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn read_session_events(&self, session_id: &str, max_items: i64) -> Vec<SessionEvent> {
        read_ndjson(&self.session_events_path(session_id), max_items)
    }

    // ── Attachments & artifacts ────────────────────────────────────

    /// Persist an uploaded attachment under `attachments/`, sanitizing the
    /// name and dodging collisions with a fresh id.
    pub fn save_session_attachment(
        &self,
        session_id: &str,
        filename: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<SavedAttachment> {
        if session_id.is_empty() {
            return Err(Error::InvalidInput("session_id required".into()));
        }
        self.get_session(session_id)?;
        let dir = self.session_attachments_dir(session_id);
        std::fs::create_dir_all(&dir)?;

        let mut name = Path::new(filename.trim())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.is_empty() || name == "." {
            name = new_attachment_id();
        }
        if Path::new(&name).extension().is_none() {
            name.push_str(".bin");
        }

        let mut target = dir.join(&name);
        if target.exists() {
            let ext = Path::new(&name)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default();
            name = format!("{}{ext}", new_attachment_id());
            target = dir.join(&name);
        }
        std::fs::write(&target, content)?;

        let mime_type = if mime_type.trim().is_empty() {
            "application/octet-stream".to_owned()
        } else {
            mime_type.to_owned()
        };
        Ok(SavedAttachment {
            reference: format!("attachments/{name}"),
            mime_type,
        })
    }

    /// Resolve an attachment ref against the session directory, rejecting
    /// traversal.
    pub fn session_attachment_path(&self, session_id: &str, reference: &str) -> Result<PathBuf> {
        let base = self.session_dir(session_id);
        let rel = reference.trim_start_matches('/');
        paths::ensure_within(&base, Path::new(rel))
    }

    pub fn session_artifacts_dir(&self, session_id: &str, turn_id: &str) -> PathBuf {
        self.session_dir(session_id).join("artifacts").join(turn_id)
    }

    pub fn export_session(&self, session_id: &str) -> Result<Vec<u8>> {
        let dir = self.session_dir(session_id);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("session not found: {session_id}")));
        }
        export_archive(
            &[
                ("session.json", self.session_path(session_id)),
                ("events.ndjson", self.session_events_path(session_id)),
            ],
            &[
                ("attachments", dir.join("attachments")),
                ("artifacts", dir.join("artifacts")),
            ],
        )
    }

    // ── Session approvals & cancellation ───────────────────────────

    pub fn require_session_approval(
        &self,
        session_id: &str,
        tool_call_id: &str,
    ) -> Result<ApprovalReceiver> {
        require_waiter(&self.session_approvals, session_id, tool_call_id, "tool call")
    }

    pub fn resolve_session_approval(
        &self,
        session_id: &str,
        tool_call_id: &str,
        decision: ApprovalDecision,
    ) -> Result<()> {
        resolve_waiter(
            &self.session_approvals,
            session_id,
            tool_call_id,
            "tool call",
            decision,
        )
    }

    pub fn set_session_cancel(&self, session_id: &str, token: &CancelToken) {
        self.session_cancels
            .lock()
            .insert(session_id.to_owned(), token.downgrade());
    }

    /// Trigger the session's cancel token and flip a non-terminal session
    /// to `canceled`.
    pub fn cancel_session(&self, session_id: &str) {
        let token = self.session_cancels.lock().get(session_id).cloned();
        if let Some(token) = token.and_then(|w| w.upgrade()) {
            token.cancel();
        }
        let Ok(mut session) = self.get_session(session_id) else {
            return;
        };
        if matches!(
            session.status,
            SessionStatus::Active | SessionStatus::WaitingApproval
        ) {
            session.status = SessionStatus::Canceled;
            if session.error.is_none() {
                session.error = Some("canceled".into());
            }
            if let Err(err) = self.update_session(session) {
                tracing::warn!(session_id, error = %err, "failed to persist canceled session");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn some_trimmed(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn list_subdirs(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value)?;
    payload.push('\n');
    std::fs::write(path, payload)?;
    Ok(())
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let line = serde_json::to_string(value)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

fn read_ndjson<T: serde::de::DeserializeOwned>(path: &Path, max_items: i64) -> Vec<T> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str(line) {
            out.push(value);
        }
        if max_items > 0 && out.len() as i64 >= max_items {
            break;
        }
    }
    out
}

/// Normalize to UTC RFC 3339; malformed timestamps are replaced with now.
fn normalize_ts(ts: &str) -> String {
    match DateTime::parse_from_rfc3339(ts) {
        Ok(parsed) => parsed.with_timezone(&Utc).to_rfc3339(),
        Err(_) => Utc::now().to_rfc3339(),
    }
}

fn require_waiter(
    map: &Mutex<HashMap<(String, String), oneshot::Sender<ApprovalDecision>>>,
    id: &str,
    key: &str,
    what: &str,
) -> Result<ApprovalReceiver> {
    if id.is_empty() || key.is_empty() {
        return Err(Error::InvalidInput("id and approval key required".into()));
    }
    let mut waiters = map.lock();
    let map_key = (id.to_owned(), key.to_owned());
    if waiters.contains_key(&map_key) {
        return Err(Error::Conflict(format!(
            "approval already pending for {what} {key}"
        )));
    }
    let (tx, rx) = oneshot::channel();
    waiters.insert(map_key, tx);
    Ok(rx)
}

fn resolve_waiter(
    map: &Mutex<HashMap<(String, String), oneshot::Sender<ApprovalDecision>>>,
    id: &str,
    key: &str,
    what: &str,
    decision: ApprovalDecision,
) -> Result<()> {
    let tx = map
        .lock()
        .remove(&(id.to_owned(), key.to_owned()))
        .ok_or_else(|| Error::NotFound(format!("no approval pending for {what} {key}")))?;
    let _ = tx.send(decision);
    Ok(())
}

/// Build a gzipped tarball from named files plus recursively-added dirs.
fn export_archive(files: &[(&str, PathBuf)], dirs: &[(&str, PathBuf)]) -> Result<Vec<u8>> {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut archive = tar::Builder::new(encoder);
    for (name, path) in files {
        if path.is_file() {
            archive.append_path_with_name(path, name)?;
        }
    }
    for (name, path) in dirs {
        if path.is_dir() {
            archive.append_dir_all(name, path)?;
        }
    }
    let encoder = archive
        .into_inner()
        .map_err(|e| Error::Other(format!("building export archive: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Other(format!("compressing export archive: {e}")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use drover_domain::tool::{MessagePart, Role};
    use std::io::Read;

    fn make_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_and_get_run() {
        let (_dir, store) = make_store();
        let run = store.create_run("/ws", "/ws/spec.md").unwrap();
        assert_eq!(run.status, RunStatus::Queued);

        let fetched = store.get_run(&run.id).unwrap();
        assert_eq!(fetched.workspace_path, "/ws");

        let events = store.read_events(&run.id, 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "run_created");
    }

    #[test]
    fn create_run_rejects_empty_inputs() {
        let (_dir, store) = make_store();
        assert!(store.create_run("", "/spec").is_err());
        assert!(store.create_run("/ws", "  ").is_err());
    }

    #[test]
    fn update_run_persists_and_reloads() {
        let (dir, store) = make_store();
        let mut run = store.create_run("/ws", "/spec").unwrap();
        run.status = RunStatus::Succeeded;
        store.update_run(run.clone()).unwrap();

        let reopened = Store::open(dir.path()).unwrap();
        let loaded = reopened.get_run(&run.id).unwrap();
        assert_eq!(loaded.status, RunStatus::Succeeded);
        assert!(loaded.updated_at >= run.created_at);
    }

    #[test]
    fn unreadable_records_are_skipped_on_startup() {
        let (dir, store) = make_store();
        let run = store.create_run("/ws", "/spec").unwrap();
        let bad_dir = dir.path().join("runs").join("run_bad");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join("run.json"), "{ not json").unwrap();

        let reopened = Store::open(dir.path()).unwrap();
        assert!(reopened.get_run(&run.id).is_ok());
        assert!(reopened.get_run("run_bad").is_err());
    }

    #[test]
    fn events_append_in_order_and_skip_malformed() {
        let (_dir, store) = make_store();
        let run = store.create_run("/ws", "/spec").unwrap();
        for i in 0..5 {
            store
                .append_event(&run.id, Event::new(&run.id, format!("step_{i}")))
                .unwrap();
        }
        // Corrupt one line by hand.
        let path = store.run_events_path(&run.id);
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("not json\n");
        std::fs::write(&path, raw).unwrap();

        let events = store.read_events(&run.id, 0);
        assert_eq!(events.len(), 6); // run_created + 5
        for (i, ev) in events.iter().skip(1).enumerate() {
            assert_eq!(ev.event_type, format!("step_{i}"));
        }
        // Bounded reads return a prefix.
        assert_eq!(store.read_events(&run.id, 2).len(), 2);
    }

    #[test]
    fn malformed_ts_is_replaced() {
        let (_dir, store) = make_store();
        let run = store.create_run("/ws", "/spec").unwrap();
        let mut event = Event::new(&run.id, "weird");
        event.ts = "yesterday-ish".into();
        store.append_event(&run.id, event).unwrap();

        let events = store.read_events(&run.id, 0);
        let stored = events.last().unwrap();
        assert!(DateTime::parse_from_rfc3339(&stored.ts).is_ok());
    }

    #[tokio::test]
    async fn subscribers_only_see_later_events() {
        let (_dir, store) = make_store();
        let run = store.create_run("/ws", "/spec").unwrap();
        store
            .append_event(&run.id, Event::new(&run.id, "before"))
            .unwrap();

        let mut rx = store.subscribe(&run.id);
        store
            .append_event(&run.id, Event::new(&run.id, "after"))
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type, "after");
    }

    #[test]
    fn approval_waiter_is_one_shot() {
        let (_dir, store) = make_store();
        let _rx = store.require_approval("run_1", "step_1").unwrap();
        // Duplicate registration must fail.
        assert!(matches!(
            store.require_approval("run_1", "step_1"),
            Err(Error::Conflict(_))
        ));

        store
            .approve("run_1", "step_1", ApprovalDecision::approve())
            .unwrap();
        // Second resolution must fail.
        assert!(store
            .approve("run_1", "step_1", ApprovalDecision::approve())
            .is_err());
    }

    #[tokio::test]
    async fn wait_for_approval_resolves_with_decision() {
        let (_dir, store) = make_store();
        let rx = store.require_session_approval("sess_1", "call_1").unwrap();
        store
            .resolve_session_approval("sess_1", "call_1", ApprovalDecision::deny(Some("no".into())))
            .unwrap();

        let token = CancelToken::new();
        let decision = Store::wait_for_approval(rx, &token).await.unwrap();
        assert!(decision.is_denied());
        assert_eq!(decision.reason.as_deref(), Some("no"));
    }

    #[tokio::test]
    async fn wait_for_approval_honors_cancellation() {
        let (_dir, store) = make_store();
        let rx = store.require_session_approval("sess_1", "call_1").unwrap();
        let token = CancelToken::new();
        token.cancel_with_reason("user gave up");

        let err = Store::wait_for_approval(rx, &token).await.unwrap_err();
        match err {
            Error::Canceled(reason) => assert_eq!(reason, "user gave up"),
            other => panic!("expected Canceled, got {other}"),
        }
    }

    #[test]
    fn cancel_registry_is_weak() {
        let (_dir, store) = make_store();
        let token = CancelToken::new();
        store.set_run_cancel("run_1", &token);
        store.cancel_run("run_1");
        assert!(token.is_cancelled());

        let token2 = CancelToken::new();
        store.set_run_cancel("run_2", &token2);
        let probe = token2.downgrade();
        drop(token2);
        // Token dropped by the engine: cancel becomes a no-op.
        store.cancel_run("run_2");
        assert!(probe.upgrade().is_none());
        // Unknown ids are a no-op too.
        store.cancel_run("run_unknown");
    }

    #[test]
    fn cancel_session_flips_status() {
        let (_dir, store) = make_store();
        let session = store
            .create_session("/ws", "", SessionMode::Chat, "")
            .unwrap();
        store.cancel_session(&session.id);
        let loaded = store.get_session(&session.id).unwrap();
        assert_eq!(loaded.status, SessionStatus::Canceled);
        assert_eq!(loaded.error.as_deref(), Some("canceled"));
    }

    #[test]
    fn messages_and_turns_append() {
        let (_dir, store) = make_store();
        let session = store
            .create_session("/ws", "be terse", SessionMode::Chat, "")
            .unwrap();
        assert_eq!(session.system_prompt.as_deref(), Some("be terse"));

        let msg = Message::new(
            "msg_1".into(),
            Role::User,
            vec![MessagePart::text("hi")],
        );
        let updated = store.append_message(&session.id, msg).unwrap();
        assert_eq!(updated.messages.len(), 1);

        let turn_id = store.add_turn(&session.id).unwrap();
        let loaded = store.get_session(&session.id).unwrap();
        assert_eq!(loaded.last_turn_id.as_deref(), Some(turn_id.as_str()));
        assert_eq!(loaded.turns[0].status, TurnStatus::Pending);
    }

    #[test]
    fn attachments_are_sanitized_and_collision_free() {
        let (_dir, store) = make_store();
        let session = store
            .create_session("/ws", "", SessionMode::Chat, "")
            .unwrap();

        // Traversal components are stripped down to the file name.
        let saved = store
            .save_session_attachment(&session.id, "../../etc/passwd", "", b"data")
            .unwrap();
        assert_eq!(saved.reference, "attachments/passwd.bin");
        assert_eq!(saved.mime_type, "application/octet-stream");

        // Same name again: a fresh id is minted.
        let again = store
            .save_session_attachment(&session.id, "passwd", "text/plain", b"data2")
            .unwrap();
        assert_ne!(again.reference, saved.reference);
        assert!(again.reference.starts_with("attachments/"));

        // Refs resolve inside the session dir; traversal refs do not.
        assert!(store
            .session_attachment_path(&session.id, &saved.reference)
            .is_ok());
        assert!(store
            .session_attachment_path(&session.id, "../other/session.json")
            .is_err());
        assert!(store
            .session_attachment_path(&session.id, "/etc/passwd")
            .is_err());
    }

    #[test]
    fn export_run_round_trips_run_json() {
        let (_dir, store) = make_store();
        let mut run = store.create_run("/ws", "/spec").unwrap();
        run.status = RunStatus::Running;
        store.update_run(run.clone()).unwrap();
        store
            .write_run_artifact(&run.id, "step_1", "command.json", "{}")
            .unwrap();

        let archive = store.export_run(&run.id).unwrap();
        let decoder = flate2::read::GzDecoder::new(&archive[..]);
        let mut tar = tar::Archive::new(decoder);

        let mut names = Vec::new();
        let mut run_json = String::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            if name == "run.json" {
                entry.read_to_string(&mut run_json).unwrap();
            }
            names.push(name);
        }
        assert!(names.contains(&"run.json".to_owned()));
        assert!(names.contains(&"events.ndjson".to_owned()));
        assert!(names.iter().any(|n| n.ends_with("command.json")));

        let exported: Run = serde_json::from_str(&run_json).unwrap();
        let current = store.get_run(&run.id).unwrap();
        assert_eq!(exported.status, current.status);
        assert_eq!(exported.id, current.id);
    }

    #[test]
    fn export_session_contains_attachments() {
        let (_dir, store) = make_store();
        let session = store
            .create_session("/ws", "", SessionMode::Chat, "")
            .unwrap();
        store
            .save_session_attachment(&session.id, "shot.png", "image/png", b"png")
            .unwrap();

        let archive = store.export_session(&session.id).unwrap();
        let decoder = flate2::read::GzDecoder::new(&archive[..]);
        let mut tar = tar::Archive::new(decoder);
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"session.json".to_owned()));
        assert!(names.iter().any(|n| n.contains("attachments")));
    }
}
