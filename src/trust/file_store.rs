//! JSON-file-backed trust store.
//!
//! Records live in memory; persistence is debounced, written atomically
//! under an exclusive lockfile, and reconciled with external writers through
//! mtime comparison. This is the only mediator for multiple processes
//! sharing one trust file.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::AbortHandle;

use crate::errors::{BtpsError, Result};
use crate::trust::{trust_record_id, NewTrustRecord, TrustRecord, TrustRecordPatch, TrustStore};

const LOCK_ATTEMPTS: u32 = 5;
const LOCK_BASE_DELAY: Duration = Duration::from_millis(100);
const LOCK_MAX_DELAY: Duration = Duration::from_secs(1);
const LOCK_BACKOFF_FACTOR: f64 = 1.5;
const LOCK_STALE_AFTER: Duration = Duration::from_secs(5);

/// Debounce window between a mutation and its write.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_secs(1);

/// Construction options for [`FileTrustStore`].
#[derive(Debug, Clone)]
pub struct FileTrustStoreOptions {
    pub path: PathBuf,
    /// When set, the on-disk container is `{ "<entityName>": [ … ] }`
    /// instead of a bare array.
    pub entity_name: Option<String>,
    pub flush_delay: Duration,
}

impl FileTrustStoreOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entity_name: None,
            flush_delay: DEFAULT_FLUSH_DELAY,
        }
    }

    pub fn entity_name(mut self, name: impl Into<String>) -> Self {
        self.entity_name = Some(name.into());
        self
    }

    pub fn flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }
}

/// File-backed [`TrustStore`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FileTrustStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    tmp_path: PathBuf,
    lock_path: PathBuf,
    entity_name: Option<String>,
    flush_delay: Duration,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    records: HashMap<String, TrustRecord>,
    /// Ids deleted locally since the last successful sync; kept so a merge
    /// with an external write does not resurrect them.
    deleted: HashSet<String>,
    dirty: bool,
    /// Bumped on every mutation. The dirty flag only clears when a write of
    /// the same generation lands, so a cancelled or raced flush never makes
    /// unpersisted records look clean.
    generation: u64,
    loaded: bool,
    last_mtime: Option<SystemTime>,
    flush_task: Option<AbortHandle>,
}

impl FileTrustStore {
    pub fn new(options: FileTrustStoreOptions) -> Self {
        let mut tmp_path = options.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        let mut lock_path = options.path.clone().into_os_string();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);
        Self {
            inner: Arc::new(Inner {
                path: options.path,
                tmp_path,
                lock_path,
                entity_name: options.entity_name,
                flush_delay: options.flush_delay,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Flush pending writes and cancel the debounce timer. Applications
    /// should call this from their own shutdown path; the store installs no
    /// process-wide handlers.
    pub async fn close(&self) -> Result<()> {
        let result = Inner::flush(&self.inner).await;
        if let Some(task) = self.inner.state.lock().flush_task.take() {
            task.abort();
        }
        result
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().flush_task.take() {
            task.abort();
        }
    }
}

impl Inner {
    /// Lazy initialization plus external-change detection, run before every
    /// operation.
    async fn sync(self: &Arc<Self>) -> Result<()> {
        if !self.state.lock().loaded {
            if tokio::fs::metadata(&self.path).await.is_err() {
                let empty = self.container_bytes(Vec::new())?;
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|err| store_error("create dir", err))?;
                    }
                }
                tokio::fs::write(&self.path, empty)
                    .await
                    .map_err(|err| store_error("initialize file", err))?;
            }
            self.reload().await?;
            return Ok(());
        }

        let mtime = file_mtime(&self.path).await;
        let drifted = {
            let state = self.state.lock();
            mtime.is_some() && mtime != state.last_mtime
        };
        if drifted {
            if self.state.lock().dirty {
                Inner::flush(self).await?;
            }
            self.reload().await?;
        }
        Ok(())
    }

    async fn reload(self: &Arc<Self>) -> Result<()> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| store_error("read file", err))?;
        let records = self.parse_container(&text)?;
        let mtime = file_mtime(&self.path).await;

        let mut state = self.state.lock();
        state.records = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        state.deleted.clear();
        state.dirty = false;
        state.loaded = true;
        state.last_mtime = mtime;
        Ok(())
    }

    /// Mark the map dirty and arm the debounced flush unless one is already
    /// pending. Marks inside the window do not re-arm the timer.
    fn schedule_flush(self: &Arc<Self>, state: &mut State) {
        state.dirty = true;
        state.generation += 1;
        self.arm_timer(state);
    }

    fn arm_timer(self: &Arc<Self>, state: &mut State) {
        if state
            .flush_task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
        {
            return;
        }

        let inner = Arc::clone(self);
        let delay = self.flush_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = Inner::flush(&inner).await {
                tracing::warn!(?err, "scheduled trust store flush failed");
            }
        });
        state.flush_task = Some(handle.abort_handle());
    }

    /// Write the current map to disk under the file lock, merging in any
    /// records another process flushed since our last sync.
    async fn flush(self: &Arc<Self>) -> Result<()> {
        let (snapshot, tombstones, last_mtime, generation) = {
            let state = self.state.lock();
            if !state.dirty {
                return Ok(());
            }
            (
                state.records.clone(),
                state.deleted.clone(),
                state.last_mtime,
                state.generation,
            )
        };

        let result = self
            .write_snapshot(snapshot, &tombstones, last_mtime)
            .await;

        let mut state = self.state.lock();
        match &result {
            Ok((merged, mtime)) => {
                for (id, record) in merged {
                    if !state.records.contains_key(id) && !state.deleted.contains(id) {
                        state.records.insert(id.clone(), record.clone());
                    }
                }
                for id in &tombstones {
                    state.deleted.remove(id);
                }
                state.last_mtime = Some(*mtime);
                if state.generation == generation {
                    state.dirty = false;
                } else {
                    // A mutation raced this flush; arm another pass.
                    self.arm_timer(&mut state);
                }
            }
            // The dirty flag was never cleared, so the failed write stays
            // pending and surfaces again on the next flush.
            Err(_) => {}
        }

        result.map(|_| ())
    }

    async fn write_snapshot(
        self: &Arc<Self>,
        snapshot: HashMap<String, TrustRecord>,
        tombstones: &HashSet<String>,
        last_mtime: Option<SystemTime>,
    ) -> Result<(HashMap<String, TrustRecord>, SystemTime)> {
        self.acquire_lock().await?;
        let outcome = async {
            let mut merged = snapshot;

            // Another process may have replaced the file since we last read
            // it; fold its records in so nothing it created is lost.
            let disk_mtime = file_mtime(&self.path).await;
            if disk_mtime.is_some() && disk_mtime != last_mtime {
                if let Ok(text) = tokio::fs::read_to_string(&self.path).await {
                    for record in self.parse_container(&text)? {
                        if !tombstones.contains(&record.id) {
                            merged.entry(record.id.clone()).or_insert(record);
                        }
                    }
                }
            }

            let mut records: Vec<&TrustRecord> = merged.values().collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));
            let bytes = self.container_bytes(records)?;

            tokio::fs::write(&self.tmp_path, bytes)
                .await
                .map_err(|err| store_error("write tmp file", err))?;
            tokio::fs::rename(&self.tmp_path, &self.path)
                .await
                .map_err(|err| store_error("rename tmp file", err))?;

            let mtime = file_mtime(&self.path)
                .await
                .ok_or_else(|| BtpsError::TrustStore("file vanished after rename".into()))?;
            Ok((merged, mtime))
        }
        .await;

        let _ = tokio::fs::remove_file(&self.lock_path).await;
        outcome
    }

    /// Exclusive advisory lock via `O_CREAT|O_EXCL` on `<file>.lock`,
    /// retried with exponential backoff; a lock older than the stale
    /// timeout is broken.
    async fn acquire_lock(&self) -> Result<()> {
        let mut delay = LOCK_BASE_DELAY;
        for attempt in 0..LOCK_ATTEMPTS {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let stale = tokio::fs::metadata(&self.lock_path)
                        .await
                        .ok()
                        .and_then(|meta| meta.modified().ok())
                        .and_then(|mtime| mtime.elapsed().ok())
                        .map(|age| age > LOCK_STALE_AFTER)
                        .unwrap_or(false);
                    if stale {
                        tracing::warn!(path = ?self.lock_path, "breaking stale trust store lock");
                        let _ = tokio::fs::remove_file(&self.lock_path).await;
                        continue;
                    }
                    if attempt + 1 < LOCK_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        let next = (delay.as_millis() as f64 * LOCK_BACKOFF_FACTOR) as u64;
                        delay = Duration::from_millis(next).min(LOCK_MAX_DELAY);
                    }
                }
                Err(err) => return Err(store_error("create lock file", err)),
            }
        }
        Err(BtpsError::TrustStore(format!(
            "could not acquire lock at {}",
            self.lock_path.display()
        )))
    }

    fn container_bytes(&self, records: Vec<&TrustRecord>) -> Result<Vec<u8>> {
        let array = serde_json::to_value(&records)?;
        let container = match &self.entity_name {
            None => array,
            Some(name) => {
                let mut object = serde_json::Map::new();
                object.insert(name.clone(), array);
                Value::Object(object)
            }
        };
        let mut bytes = serde_json::to_vec_pretty(&container)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// A file that does not match the configured container shape is
    /// corrupt, which is terminal.
    fn parse_container(&self, text: &str) -> Result<Vec<TrustRecord>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| BtpsError::TrustStore(format!("corrupt trust file: {err}")))?;
        let array = match (&self.entity_name, value) {
            (None, Value::Array(array)) => Value::Array(array),
            (Some(name), Value::Object(mut object)) => object.remove(name).ok_or_else(|| {
                BtpsError::TrustStore(format!("trust file is missing the `{name}` entity"))
            })?,
            _ => {
                return Err(BtpsError::TrustStore(
                    "trust file does not match the configured container shape".into(),
                ));
            }
        };
        serde_json::from_value(array)
            .map_err(|err| BtpsError::TrustStore(format!("corrupt trust record: {err}")))
    }
}

#[async_trait]
impl TrustStore for FileTrustStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<TrustRecord>> {
        self.inner.sync().await?;
        Ok(self.inner.state.lock().records.get(id).cloned())
    }

    async fn create(&self, record: NewTrustRecord, id: Option<String>) -> Result<TrustRecord> {
        self.inner.sync().await?;
        let id = id.unwrap_or_else(|| trust_record_id(&record.sender_id, &record.receiver_id));
        let record = record.into_record(id.clone());

        let mut state = self.inner.state.lock();
        if state.records.contains_key(&id) {
            return Err(BtpsError::TrustStoreConflict(id));
        }
        state.deleted.remove(&id);
        state.records.insert(id, record.clone());
        self.inner.schedule_flush(&mut state);
        Ok(record)
    }

    async fn update(&self, id: &str, patch: TrustRecordPatch) -> Result<TrustRecord> {
        self.inner.sync().await?;

        let mut state = self.inner.state.lock();
        let record = state
            .records
            .get_mut(id)
            .ok_or_else(|| BtpsError::TrustStoreNotFound(id.to_string()))?;
        patch.apply(record);
        let updated = record.clone();
        self.inner.schedule_flush(&mut state);
        Ok(updated)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner.sync().await?;

        let mut state = self.inner.state.lock();
        if state.records.remove(id).is_none() {
            return Err(BtpsError::TrustStoreNotFound(id.to_string()));
        }
        state.deleted.insert(id.to_string());
        self.inner.schedule_flush(&mut state);
        Ok(())
    }

    async fn get_all(&self, receiver_id: Option<&str>) -> Result<Vec<TrustRecord>> {
        self.inner.sync().await?;

        let state = self.inner.state.lock();
        let mut records: Vec<TrustRecord> = state
            .records
            .values()
            .filter(|record| receiver_id.map_or(true, |rid| record.receiver_id == rid))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn flush_now(&self) -> Result<()> {
        self.inner.sync().await?;
        // A pending debounce timer is left alone; once this flush lands it
        // will find a clean map and return without touching the file.
        Inner::flush(&self.inner).await
    }

    async fn flush_and_reload(&self) -> Result<()> {
        self.flush_now().await?;
        self.inner.reload().await
    }
}

fn store_error(action: &str, err: io::Error) -> BtpsError {
    BtpsError::TrustStore(format!("{action}: {err}"))
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    use crate::trust::TrustStatus;

    fn new_record(sender: &str, receiver: &str) -> NewTrustRecord {
        NewTrustRecord {
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            status: TrustStatus::Requested,
            issued_at: "2026-08-01T10:00:00Z".into(),
            decided_at: None,
            expires_at: None,
            policy: None,
        }
    }

    fn store_at(dir: &TempDir, delay_ms: u64) -> FileTrustStore {
        FileTrustStore::new(
            FileTrustStoreOptions::new(dir.path().join("trust.json"))
                .flush_delay(Duration::from_millis(delay_ms)),
        )
    }

    #[tokio::test]
    async fn create_update_delete_reflect_in_get_all() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, 10);

        let a = store
            .create(new_record("alice$a.example", "bob$b.example"), None)
            .await
            .unwrap();
        let b = store
            .create(new_record("carol$c.example", "bob$b.example"), None)
            .await
            .unwrap();
        store
            .create(new_record("alice$a.example", "dave$d.example"), None)
            .await
            .unwrap();

        assert_eq!(store.get_all(None).await.unwrap().len(), 3);
        assert_eq!(
            store.get_all(Some("bob$b.example")).await.unwrap().len(),
            2
        );

        store
            .update(
                &a.id,
                TrustRecordPatch {
                    status: Some(TrustStatus::Accepted),
                    decided_at: Some("2026-08-02T09:00:00Z".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let fetched = store.get_by_id(&a.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TrustStatus::Accepted);

        store.delete(&b.id).await.unwrap();
        assert!(store.get_by_id(&b.id).await.unwrap().is_none());
        assert_eq!(store.get_all(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deterministic_id_is_used_when_none_given() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, 10);

        let record = store
            .create(new_record("alice$a.example", "bob$b.example"), None)
            .await
            .unwrap();
        assert_eq!(
            record.id,
            trust_record_id("alice$a.example", "bob$b.example")
        );
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, 10);

        store
            .create(new_record("alice$a.example", "bob$b.example"), None)
            .await
            .unwrap();
        let err = store
            .create(new_record("alice$a.example", "bob$b.example"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BtpsError::TrustStoreConflict(_)));
    }

    #[tokio::test]
    async fn update_and_delete_unknown_ids_fail() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, 10);

        let err = store
            .update("missing", TrustRecordPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BtpsError::TrustStoreNotFound(_)));

        let err = store.delete("missing").await.unwrap_err();
        assert!(matches!(err, BtpsError::TrustStoreNotFound(_)));
    }

    #[tokio::test]
    async fn state_survives_a_process_restart() {
        let dir = TempDir::new().unwrap();
        {
            let store = store_at(&dir, 10);
            store
                .create(new_record("alice$a.example", "bob$b.example"), None)
                .await
                .unwrap();
            store.flush_now().await.unwrap();
        }

        let reopened = store_at(&dir, 10);
        let records = reopened.get_all(None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sender_id, "alice$a.example");
    }

    #[tokio::test]
    async fn debounce_coalesces_writes() {
        let dir = TempDir::new().unwrap();
        let store = store_at(&dir, 200);

        store
            .create(new_record("alice$a.example", "bob$b.example"), None)
            .await
            .unwrap();
        store
            .create(new_record("carol$c.example", "bob$b.example"), None)
            .await
            .unwrap();

        // Before the window elapses the file still holds the empty container.
        let text = tokio::fs::read_to_string(dir.path().join("trust.json"))
            .await
            .unwrap();
        assert_eq!(serde_json::from_str::<Vec<TrustRecord>>(&text).unwrap().len(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        let text = tokio::fs::read_to_string(dir.path().join("trust.json"))
            .await
            .unwrap();
        assert_eq!(serde_json::from_str::<Vec<TrustRecord>>(&text).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn external_changes_are_picked_up_by_mtime() {
        let dir = TempDir::new().unwrap();
        let writer = store_at(&dir, 10);
        let reader = store_at(&dir, 10);

        assert!(reader.get_all(None).await.unwrap().is_empty());

        writer
            .create(new_record("alice$a.example", "bob$b.example"), None)
            .await
            .unwrap();
        writer.flush_now().await.unwrap();

        let seen = reader.get_all(None).await.unwrap();
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn interleaved_writers_lose_no_records() {
        let dir = TempDir::new().unwrap();
        let a = store_at(&dir, 50);
        let b = store_at(&dir, 50);

        for index in 0..100 {
            a.create(
                new_record(&format!("a{index}$a.example"), "bob$b.example"),
                None,
            )
            .await
            .unwrap();
            b.create(
                new_record(&format!("b{index}$b.example"), "bob$b.example"),
                None,
            )
            .await
            .unwrap();
        }

        a.flush_and_reload().await.unwrap();
        b.flush_and_reload().await.unwrap();
        a.flush_and_reload().await.unwrap();

        assert_eq!(a.get_all(None).await.unwrap().len(), 200);
        assert_eq!(b.get_all(None).await.unwrap().len(), 200);

        // The final file parses as valid JSON with every record present.
        let text = tokio::fs::read_to_string(dir.path().join("trust.json"))
            .await
            .unwrap();
        let records: Vec<TrustRecord> = serde_json::from_str(&text).unwrap();
        assert_eq!(records.len(), 200);
    }

    #[tokio::test]
    async fn entity_name_selects_the_container_shape() {
        let dir = TempDir::new().unwrap();
        let store = FileTrustStore::new(
            FileTrustStoreOptions::new(dir.path().join("trust.json"))
                .entity_name("trustedSenders")
                .flush_delay(Duration::from_millis(10)),
        );

        store
            .create(new_record("alice$a.example", "bob$b.example"), None)
            .await
            .unwrap();
        store.flush_now().await.unwrap();

        let text = tokio::fs::read_to_string(dir.path().join("trust.json"))
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert!(value["trustedSenders"].is_array());
        assert_eq!(value["trustedSenders"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_file_is_terminal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trust.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = FileTrustStore::new(
            FileTrustStoreOptions::new(path).flush_delay(Duration::from_millis(10)),
        );
        let err = store.get_all(None).await.unwrap_err();
        assert!(matches!(err, BtpsError::TrustStore(_)));
        assert!(err.is_terminal());
    }
}
