use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::{child_prefix, parent_paths, CoordBackend, Node};
use crate::error::{PipelineError, Result};

/// Process-local coordination store.
///
/// Used by tests and by `COORD_BACKEND=memory`. `set_available` and
/// `fail_next` inject outages so the session state machine can be driven
/// without a real service.
pub struct MemoryBackend {
    nodes: Mutex<BTreeMap<String, Node>>,
    available: AtomicBool,
    fail_next: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Toggle a simulated outage
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `CoordUnavailable`
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(PipelineError::CoordUnavailable("memory backend offline".into()));
        }
        let pending = self.fail_next.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::SeqCst);
            return Err(PipelineError::CoordUnavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordBackend for MemoryBackend {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn create(&self, path: &str, value: &[u8], owner: Option<u64>) -> Result<()> {
        self.check()?;
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(path) {
            return Err(PipelineError::NodeExists(path.to_string()));
        }
        for parent in parent_paths(path) {
            nodes.entry(parent).or_insert_with(|| Node {
                value: Vec::new(),
                version: 0,
                ephemeral_owner: None,
            });
        }
        nodes.insert(
            path.to_string(),
            Node {
                value: value.to_vec(),
                version: 0,
                ephemeral_owner: owner,
            },
        );
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Node>> {
        self.check()?;
        Ok(self.nodes.lock().await.get(path).cloned())
    }

    async fn update(&self, path: &str, value: &[u8], version: Option<i64>) -> Result<i64> {
        self.check()?;
        let mut nodes = self.nodes.lock().await;
        let node = nodes
            .get_mut(path)
            .ok_or_else(|| PipelineError::NotFound(path.to_string()))?;
        if let Some(expected) = version {
            if node.version != expected {
                return Err(PipelineError::BadVersion(path.to_string()));
            }
        }
        node.value = value.to_vec();
        node.version += 1;
        Ok(node.version)
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        self.check()?;
        let mut nodes = self.nodes.lock().await;
        let prefix = child_prefix(path);
        let has_children = nodes.keys().any(|k| k.starts_with(&prefix));
        if has_children && !recursive {
            return Err(PipelineError::Conflict(format!("{} has children", path)));
        }
        nodes.remove(path);
        if recursive {
            nodes.retain(|k, _| !k.starts_with(&prefix));
        }
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.check()?;
        let nodes = self.nodes.lock().await;
        let prefix = child_prefix(path);
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check()?;
        Ok(self.nodes.lock().await.contains_key(path))
    }

    async fn release_owner(&self, owner: u64) -> Result<usize> {
        self.check()?;
        let mut nodes = self.nodes.lock().await;
        let before = nodes.len();
        nodes.retain(|_, n| n.ephemeral_owner != Some(owner));
        Ok(before - nodes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_makes_parents() {
        let backend = MemoryBackend::new();
        backend.create("/base/id_alloc/ae/0000000127", b"pr:esi", None).await.unwrap();
        assert!(backend.exists("/base/id_alloc").await.unwrap());
        assert_eq!(
            backend.children("/base/id_alloc/ae").await.unwrap(),
            vec!["0000000127".to_string()]
        );
        assert_eq!(backend.children("/base").await.unwrap(), vec!["id_alloc".to_string()]);
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let backend = MemoryBackend::new();
        backend.create("/a", b"x", None).await.unwrap();
        let err = backend.create("/a", b"y", None).await.unwrap_err();
        assert_eq!(err.kind(), "node_exists");
    }

    #[tokio::test]
    async fn test_versioned_update() {
        let backend = MemoryBackend::new();
        backend.create("/c", b"0", None).await.unwrap();
        assert_eq!(backend.update("/c", b"1", Some(0)).await.unwrap(), 1);
        let err = backend.update("/c", b"2", Some(0)).await.unwrap_err();
        assert_eq!(err.kind(), "bad_version");
        assert_eq!(backend.update("/c", b"2", None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_recursive_and_idempotent() {
        let backend = MemoryBackend::new();
        backend.create("/a/b/c", b"", None).await.unwrap();
        assert!(backend.delete("/a", false).await.is_err());
        backend.delete("/a", true).await.unwrap();
        assert!(!backend.exists("/a/b/c").await.unwrap());
        backend.delete("/a", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_owner_drops_ephemerals() {
        let backend = MemoryBackend::new();
        backend.create("/locks/x", b"me", Some(7)).await.unwrap();
        backend.create("/locks/y", b"other", Some(8)).await.unwrap();
        assert_eq!(backend.release_owner(7).await.unwrap(), 1);
        assert!(!backend.exists("/locks/x").await.unwrap());
        assert!(backend.exists("/locks/y").await.unwrap());
    }

    #[tokio::test]
    async fn test_fail_next() {
        let backend = MemoryBackend::new();
        backend.fail_next(2);
        assert!(backend.ping().await.is_err());
        assert!(backend.ping().await.is_err());
        assert!(backend.ping().await.is_ok());
    }
}
