//! In-memory ResourceStore for unit testing
//!
//! Behaves like a single-kind API server: objects get increasing resource
//! versions, every write is appended to an event log, and `watch` replays the
//! log after the given cursor before following live writes. Tests can also
//! queue scripted watch sessions to simulate disconnects and expired cursors,
//! and make writes fail to exercise the fault branches.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::cursor::WatchCursor;
use crate::error::StoreError;
use crate::event::WatchEvent;
use crate::store::{EventStream, Listing, ResourceStore};

type Session<K> = Result<Vec<Result<WatchEvent<K>, StoreError>>, StoreError>;

struct State<K> {
    objects: BTreeMap<(String, String), K>,
    log: Vec<(u64, WatchEvent<K>)>,
    last_rv: u64,
}

/// Mock store for testing
pub struct MemoryStore<K> {
    state: Mutex<State<K>>,
    live: broadcast::Sender<WatchEvent<K>>,
    sessions: Mutex<VecDeque<Session<K>>>,
    watch_cursors: Mutex<Vec<String>>,
    fail_writes: AtomicBool,
    lists: AtomicUsize,
    creates: AtomicUsize,
    patches: AtomicUsize,
    replaces: AtomicUsize,
    deletes: AtomicUsize,
}

impl<K> std::fmt::Debug for MemoryStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl<K> Default for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn key_of<K: Resource>(object: &K) -> (String, String) {
    let meta = object.meta();
    (
        meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        meta.name.clone().unwrap_or_default(),
    )
}

/// RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create an empty store
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                log: Vec::new(),
                last_rv: 0,
            }),
            live,
            sessions: Mutex::new(VecDeque::new()),
            watch_cursors: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            lists: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            patches: AtomicUsize::new(0),
            replaces: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Stores an object directly, as if another client had written it.
    /// Emits `ADDED` or `MODIFIED` like a real write.
    pub fn insert(&self, object: K) -> K {
        let mut state = self.state.lock().unwrap();
        let key = key_of(&object);
        let added = !state.objects.contains_key(&key);
        self.commit(&mut state, key, object, added)
    }

    /// Current state of one object (for test assertions)
    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// All stored objects
    pub fn objects(&self) -> Vec<K> {
        self.state.lock().unwrap().objects.values().cloned().collect()
    }

    /// Queues a scripted watch session. The next `watch` call returns these
    /// items and then ends the stream.
    pub fn push_session(&self, items: Vec<Result<WatchEvent<K>, StoreError>>) {
        self.sessions.lock().unwrap().push_back(Ok(items));
    }

    /// Makes the next `watch` call fail to open.
    pub fn push_watch_error(&self, error: StoreError) {
        self.sessions.lock().unwrap().push_back(Err(error));
    }

    /// Cursors passed to `watch`, in call order
    pub fn watch_cursors(&self) -> Vec<String> {
        self.watch_cursors.lock().unwrap().clone()
    }

    /// Makes create/patch/replace/delete fail with a 500 until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `list` calls
    pub fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    /// Number of successful creates
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Number of successful patches
    pub fn patches(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    /// Number of successful replaces
    pub fn replaces(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    /// Number of successful deletes
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn commit(&self, state: &mut State<K>, key: (String, String), mut object: K, added: bool) -> K {
        state.last_rv += 1;
        let rv = state.last_rv;
        object.meta_mut().resource_version = Some(rv.to_string());
        object.meta_mut().namespace = Some(key.0.clone());
        state.objects.insert(key, object.clone());
        let event = if added {
            WatchEvent::Added(object.clone())
        } else {
            WatchEvent::Modified(object.clone())
        };
        state.log.push((rv, event.clone()));
        let _ = self.live.send(event);
        object
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Api {
                code: 500,
                message: "injected write failure".to_string(),
            });
        }
        Ok(())
    }
}

fn not_found(namespace: &str, name: &str) -> StoreError {
    StoreError::NotFound(format!("{namespace}/{name}"))
}

#[async_trait]
impl<K> ResourceStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Listing<K>, StoreError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Ok(Listing {
            items: state.objects.values().cloned().collect(),
            resource_version: state.last_rv.to_string(),
        })
    }

    async fn watch(&self, cursor: &WatchCursor) -> Result<EventStream<K>, StoreError> {
        self.watch_cursors
            .lock()
            .unwrap()
            .push(cursor.as_str().to_string());

        if let Some(session) = self.sessions.lock().unwrap().pop_front() {
            return Ok(stream::iter(session?).boxed());
        }

        let since: u64 = cursor.as_str().parse().unwrap_or(0);
        let state = self.state.lock().unwrap();
        let receiver = self.live.subscribe();
        let backlog: Vec<Result<WatchEvent<K>, StoreError>> = state
            .log
            .iter()
            .filter(|(rv, _)| *rv > since)
            .map(|(_, event)| Ok(event.clone()))
            .collect();
        drop(state);

        let live = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(event) => Some((Ok(event), receiver)),
                // Missed events cannot be replayed from a live channel
                Err(broadcast::error::RecvError::Lagged(_)) => Some((
                    Err(StoreError::Gone("watch consumer lagged".to_string())),
                    receiver,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });
        Ok(stream::iter(backlog).chain(live).boxed())
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        self.object(namespace, name)
            .ok_or_else(|| not_found(namespace, name))
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, StoreError> {
        self.check_writable()?;
        let name = object.meta().name.clone().unwrap_or_default();
        let key = (namespace.to_string(), name);
        let mut state = self.state.lock().unwrap();
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("{}/{}", key.0, key.1)));
        }
        let mut object = object.clone();
        object.meta_mut().resource_version = None;
        let created = self.commit(&mut state, key, object, true);
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(created)
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<K, StoreError> {
        self.check_writable()?;
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.state.lock().unwrap();
        let existing = state
            .objects
            .get(&key)
            .ok_or_else(|| not_found(namespace, name))?;
        // A resourceVersion in the patch body is a precondition
        if let Some(rv) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if existing.meta().resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict(format!(
                    "{namespace}/{name}: object has been modified"
                )));
            }
        }
        let mut value = serde_json::to_value(existing)?;
        merge_patch(&mut value, patch);
        let patched: K = serde_json::from_value(value)?;
        let patched = self.commit(&mut state, key, patched, false);
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(patched)
    }

    async fn replace(&self, namespace: &str, name: &str, object: &K) -> Result<K, StoreError> {
        self.check_writable()?;
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.state.lock().unwrap();
        let existing = state
            .objects
            .get(&key)
            .ok_or_else(|| not_found(namespace, name))?;
        // Same optimistic check as the API server: a stale version is rejected
        if let Some(rv) = object.meta().resource_version.as_deref() {
            if existing.meta().resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict(format!(
                    "{namespace}/{name}: object has been modified"
                )));
            }
        }
        let replaced = self.commit(&mut state, key, object.clone(), false);
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(replaced)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: Option<u32>,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let key = (namespace.to_string(), name.to_string());
        let mut state = self.state.lock().unwrap();
        let mut removed = state
            .objects
            .remove(&key)
            .ok_or_else(|| not_found(namespace, name))?;
        state.last_rv += 1;
        let rv = state.last_rv;
        removed.meta_mut().resource_version = Some(rv.to_string());
        let event = WatchEvent::Deleted(removed);
        state.log.push((rv, event.clone()));
        let _ = self.live.send(event);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
