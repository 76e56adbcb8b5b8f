//! Keyed persistence of compiled routes.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::error::AgentError;
use crate::types::{ROUTE_SCHEMA_VERSION, Route};

#[async_trait]
pub trait RouteStore: Send + Sync {
    async fn load(&self, workflow_id: &str) -> Result<Option<Route>, AgentError>;

    /// Replace the stored route for `route.workflow_id`. Readers see either
    /// the old document or the new one, never a mix.
    async fn save(&self, route: &Route) -> Result<(), AgentError>;

    async fn remove(&self, workflow_id: &str) -> Result<bool, AgentError>;
}

/// One pretty-printed JSON document per workflow under `dir`.
pub struct JsonRouteStore {
    dir: PathBuf,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JsonRouteStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(workflow_id)))
    }

    fn write_lock(&self, workflow_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(workflow_id.to_string()).or_default().clone()
    }
}

/// Keep ids readable on disk while mapping distinct ids to distinct names.
fn file_stem(workflow_id: &str) -> String {
    let mut out = String::with_capacity(workflow_id.len());
    for c in workflow_id.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{:02X}", b));
            }
        }
    }
    out
}

fn read_route(path: &Path, workflow_id: &str) -> Result<Option<Route>, AgentError> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AgentError::Store(format!("{}: {}", path.display(), e))),
    };
    let raw: serde_json::Value = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| AgentError::Store(format!("{}: {}", path.display(), e)))?;

    // Check the version before decoding the rest: an older document may not
    // even have the current shape.
    let found = raw
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    if u32::try_from(found).ok() != Some(ROUTE_SCHEMA_VERSION) {
        return Err(AgentError::RouteSchemaMismatch {
            workflow_id: workflow_id.to_string(),
            found,
            expected: ROUTE_SCHEMA_VERSION,
        });
    }

    let route: Route = serde_json::from_value(raw)
        .map_err(|e| AgentError::Store(format!("{}: {}", path.display(), e)))?;
    if route.workflow_id != workflow_id {
        return Err(AgentError::Store(format!(
            "{} holds route for '{}', expected '{}'",
            path.display(),
            route.workflow_id,
            workflow_id
        )));
    }
    Ok(Some(route))
}

/// Distinguishes temp files of writes that overlap within one process.
static WRITE_SEQ: AtomicU64 = AtomicU64::new(0);

fn temp_path(path: &Path) -> PathBuf {
    let seq = WRITE_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_extension(format!("json.tmp-{}-{}", std::process::id(), seq))
}

fn write_route(dir: &Path, path: &Path, route: &Route) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let tmp = temp_path(path);
    {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, route)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    // rename is atomic on the same filesystem
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl RouteStore for JsonRouteStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<Route>, AgentError> {
        let path = self.path_for(workflow_id);
        let id = workflow_id.to_string();
        tokio::task::spawn_blocking(move || read_route(&path, &id))
            .await
            .map_err(|e| AgentError::Store(format!("load task panicked: {}", e)))?
    }

    async fn save(&self, route: &Route) -> Result<(), AgentError> {
        // The guard travels with the blocking write, so a save abandoned by
        // its caller still holds the lock until the file is in place.
        let guard = self.write_lock(&route.workflow_id).lock_owned().await;

        let dir = self.dir.clone();
        let path = self.path_for(&route.workflow_id);
        let route = route.clone();
        let id = route.workflow_id.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            write_route(&dir, &path, &route)
        })
        .await
        .map_err(|e| AgentError::Store(format!("save task panicked: {}", e)))?
        .map_err(|e| AgentError::Store(format!("saving '{}': {}", id, e)))?;
        debug!("[Store] Saved route for '{}'", id);
        Ok(())
    }

    async fn remove(&self, workflow_id: &str) -> Result<bool, AgentError> {
        let _guard = self.write_lock(workflow_id).lock_owned().await;

        match tokio::fs::remove_file(self.path_for(workflow_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AgentError::Store(format!("removing '{}': {}", workflow_id, e))),
        }
    }
}

/// Process-local store, for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryRouteStore {
    routes: Mutex<HashMap<String, Route>>,
}

impl MemoryRouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(route: Route) -> Self {
        let store = Self::new();
        store.put(route);
        store
    }

    /// Insert without going through the async interface.
    pub fn put(&self, route: Route) {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(route.workflow_id.clone(), route);
    }

    pub fn get(&self, workflow_id: &str) -> Option<Route> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(workflow_id)
            .cloned()
    }
}

#[async_trait]
impl RouteStore for MemoryRouteStore {
    async fn load(&self, workflow_id: &str) -> Result<Option<Route>, AgentError> {
        let route = self.get(workflow_id);
        match route {
            Some(r) if r.schema_version != ROUTE_SCHEMA_VERSION => Err(AgentError::RouteSchemaMismatch {
                workflow_id: workflow_id.to_string(),
                found: r.schema_version.into(),
                expected: ROUTE_SCHEMA_VERSION,
            }),
            other => Ok(other),
        }
    }

    async fn save(&self, route: &Route) -> Result<(), AgentError> {
        self.put(route.clone());
        Ok(())
    }

    async fn remove(&self, workflow_id: &str) -> Result<bool, AgentError> {
        Ok(self
            .routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(workflow_id)
            .is_some())
    }
}
