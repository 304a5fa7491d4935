use crate::error::ProxyError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// What to spawn for one backend key.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub executable: String,
    pub args: Vec<String>,
    /// parallel requests one child may serve
    pub concurrency: u16,
}

pub struct ChildProcess {
    pub socket_path: PathBuf,
    busy: AtomicU32,
    _child: Mutex<Child>,
}

/// Keyed pool of spawned backend children (LHTTP / WAS workers). Each
/// child listens on a private unix socket passed via `LISTEN_PATH`; a
/// child serves up to `concurrency` requests at once, and new children
/// are spawned up to `children_per_key`.
pub struct ChildStock {
    socket_dir: PathBuf,
    children_per_key: usize,
    slots: Mutex<HashMap<String, Vec<Arc<ChildProcess>>>>,
    counter: AtomicU32,
}

impl ChildStock {
    pub fn new(socket_dir: PathBuf, children_per_key: usize) -> Self {
        Self {
            socket_dir,
            children_per_key: children_per_key.max(1),
            slots: Mutex::new(HashMap::new()),
            counter: AtomicU32::new(0),
        }
    }

    /// Borrow a child for `key`, spawning one if all existing children
    /// are saturated and the per-key limit allows.
    pub async fn get(&self, key: &str, spec: &ChildSpec) -> Result<ChildGuard, ProxyError> {
        let concurrency = spec.concurrency.max(1) as u32;

        if let Some(child) = self.pick_idle(key, concurrency) {
            return Ok(ChildGuard { child });
        }

        let child = self.spawn(key, spec).await?;
        child.busy.fetch_add(1, Ordering::Relaxed);
        self.slots
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push(child.clone());
        Ok(ChildGuard { child })
    }

    fn pick_idle(&self, key: &str, concurrency: u32) -> Option<Arc<ChildProcess>> {
        let mut slots = self.slots.lock().unwrap();
        let children = slots.get_mut(key)?;
        // drop children whose process died
        children.retain(|c| {
            let alive = c
                ._child
                .lock()
                .unwrap()
                .try_wait()
                .map(|status| status.is_none())
                .unwrap_or(false);
            if !alive {
                debug!("child: reaping dead child, key={}", key);
                let _ = std::fs::remove_file(&c.socket_path);
            }
            alive
        });
        for child in children.iter() {
            let busy = child.busy.load(Ordering::Relaxed);
            if busy < concurrency {
                child.busy.fetch_add(1, Ordering::Relaxed);
                return Some(child.clone());
            }
        }
        if children.len() >= self.children_per_key {
            // saturated but at the limit; overload the least busy one
            let child = children
                .iter()
                .min_by_key(|c| c.busy.load(Ordering::Relaxed))?
                .clone();
            child.busy.fetch_add(1, Ordering::Relaxed);
            return Some(child);
        }
        None
    }

    async fn spawn(&self, key: &str, spec: &ChildSpec) -> Result<Arc<ChildProcess>, ProxyError> {
        std::fs::create_dir_all(&self.socket_dir)?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let socket_path = self
            .socket_dir
            .join(format!("child-{:08x}-{}.sock", twox_hash::XxHash64::oneshot(0, key.as_bytes()) as u32, n));
        let _ = std::fs::remove_file(&socket_path);

        let child = Command::new(&spec.executable)
            .args(&spec.args)
            .env("LISTEN_PATH", &socket_path)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!("child: failed to spawn {}: {}", spec.executable, e);
                ProxyError::Io(e)
            })?;

        // wait for the child to bind its socket
        for _ in 0..100 {
            if socket_path.exists() {
                return Ok(Arc::new(ChildProcess {
                    socket_path,
                    busy: AtomicU32::new(0),
                    _child: Mutex::new(child),
                }));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Err(ProxyError::Internal(format!(
            "child {} did not bind its socket",
            spec.executable
        )))
    }
}

/// Scoped borrow of a child; releases the concurrency slot on drop.
pub struct ChildGuard {
    child: Arc<ChildProcess>,
}

impl ChildGuard {
    pub async fn connect(&self) -> Result<UnixStream, ProxyError> {
        UnixStream::connect(&self.child.socket_path)
            .await
            .map_err(ProxyError::Io)
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.child.busy.fetch_sub(1, Ordering::Relaxed);
    }
}
