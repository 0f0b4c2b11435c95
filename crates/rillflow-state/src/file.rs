use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use error_stack::ResultExt as _;
use futures::future::{BoxFuture, FutureExt as _};
use rillflow_core::ValueRef;
use tokio::sync::RwLock;

use crate::{Result, StateError, StateStore};

/// File-backed implementation of [`StateStore`].
///
/// Each namespace maps to one JSON document under the state directory.
/// Writes rewrite the whole document atomically (temp file + rename), so
/// a crash mid-write never leaves a truncated document behind.
pub struct FileStateStore {
    path: PathBuf,
    entries: Arc<RwLock<HashMap<String, ValueRef>>>,
}

impl FileStateStore {
    /// Open (or lazily create) the store for `namespace` under `state_dir`.
    ///
    /// The namespace is chosen by the caller, typically derived from the
    /// workflow's relative path.
    pub async fn open(state_dir: &Path, namespace: &str) -> Result<Self> {
        tokio::fs::create_dir_all(state_dir)
            .await
            .change_context_lazy(|| StateError::WriteFile(state_dir.to_path_buf()))?;

        let path = state_dir.join(format!("{}.json", sanitize(namespace)));
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<HashMap<String, serde_json::Value>>(&content)
                .change_context_lazy(|| StateError::InvalidDocument(path.clone()))?
                .into_iter()
                .map(|(k, v)| (k, ValueRef::new(v)))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(error_stack::Report::from(e)
                    .change_context(StateError::ReadFile(path.clone())))
            }
        };

        tracing::debug!(path = %path.display(), "Opened state store");

        Ok(Self {
            path,
            entries: Arc::new(RwLock::new(entries)),
        })
    }

    async fn flush(path: &Path, entries: &HashMap<String, ValueRef>) -> Result<()> {
        let document: HashMap<&str, &serde_json::Value> = entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_ref()))
            .collect();
        let content =
            serde_json::to_string_pretty(&document).change_context(StateError::Internal)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .change_context_lazy(|| StateError::WriteFile(tmp.clone()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .change_context_lazy(|| StateError::WriteFile(path.to_path_buf()))?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<ValueRef>>> {
        let entries = self.entries.clone();
        let key = key.to_string();
        async move { Ok(entries.read().await.get(&key).cloned()) }.boxed()
    }

    fn set(&self, key: &str, value: ValueRef) -> BoxFuture<'_, Result<()>> {
        let entries = self.entries.clone();
        let path = self.path.clone();
        let key = key.to_string();
        async move {
            let mut entries = entries.write().await;
            entries.insert(key, value);
            Self::flush(&path, &entries).await
        }
        .boxed()
    }
}

/// Map a namespace to a safe file stem.
fn sanitize(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
