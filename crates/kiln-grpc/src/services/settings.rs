//! Settings service over a shared JSON document.
//!
//! The same store backs the RPC surface and the daemon's own defaults (the
//! configured listen port comes from `daemon.port`). Keys are dotted paths
//! into the document; values are arbitrary JSON.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use tonic::{Request, Response, Status};

use crate::error::ConfigError;
use crate::proto::{self, settings_server};

/// Shared settings document.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    inner: Arc<RwLock<serde_json::Value>>,
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(serde_json::json!({}))
    }
}

impl SettingsStore {
    /// Store over `initial`; anything that is not a JSON object becomes an
    /// empty one.
    pub fn new(initial: serde_json::Value) -> Self {
        let value = if initial.is_object() {
            initial
        } else {
            serde_json::json!({})
        };
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Load from a JSON file. A missing file is an empty document; an
    /// unreadable or malformed one is a startup error.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Self::new)
                .map_err(|source| ConfigError::Settings {
                    path: path.to_path_buf(),
                    source,
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::SettingsRead {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// A copy of the whole document.
    pub async fn get_all(&self) -> serde_json::Value {
        self.inner.read().await.clone()
    }

    /// Value at a dotted key, if present.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let doc = self.inner.read().await;
        let mut current = &*doc;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current.clone())
    }

    /// Set the value at a dotted key, creating intermediate objects.
    pub async fn set(&self, key: &str, value: serde_json::Value) {
        let mut doc = self.inner.write().await;
        let mut parts: Vec<&str> = key.split('.').collect();
        let Some(last) = parts.pop() else {
            return;
        };
        let mut current = &mut *doc;
        for part in parts {
            let Some(obj) = current.as_object_mut() else {
                return;
            };
            let slot = obj
                .entry(part.to_string())
                .or_insert_with(|| serde_json::json!({}));
            if !slot.is_object() {
                *slot = serde_json::json!({});
            }
            current = slot;
        }
        if let Some(obj) = current.as_object_mut() {
            obj.insert(last.to_string(), value);
        }
    }

    /// Deep-merge `patch` into the document: objects merge recursively,
    /// everything else replaces.
    pub async fn merge(&self, patch: serde_json::Value) {
        let mut doc = self.inner.write().await;
        merge_value(&mut doc, patch);
    }

    /// Persist the current document as pretty JSON.
    pub async fn write(&self, path: &Path) -> std::io::Result<()> {
        let doc = self.inner.read().await;
        let bytes = serde_json::to_vec_pretty(&*doc).map_err(std::io::Error::other)?;
        tokio::fs::write(path, bytes).await
    }

    /// The configured daemon port (`daemon.port`), if any.
    pub async fn daemon_port(&self) -> Option<String> {
        match self.get("daemon.port").await? {
            serde_json::Value::String(port) => Some(port),
            serde_json::Value::Number(port) => Some(port.to_string()),
            _ => None,
        }
    }
}

fn merge_value(target: &mut serde_json::Value, patch: serde_json::Value) {
    match patch {
        serde_json::Value::Object(patch_map) => {
            if let serde_json::Value::Object(target_map) = target {
                for (key, value) in patch_map {
                    match target_map.get_mut(&key) {
                        Some(slot) => merge_value(slot, value),
                        None => {
                            target_map.insert(key, value);
                        }
                    }
                }
            } else {
                *target = serde_json::Value::Object(patch_map);
            }
        }
        other => *target = other,
    }
}

/// The Settings gRPC service.
#[derive(Debug, Clone)]
pub struct SettingsService {
    store: SettingsStore,
}

impl SettingsService {
    /// Service over `store`.
    pub fn new(store: SettingsStore) -> Self {
        Self { store }
    }
}

#[tonic::async_trait]
impl settings_server::Settings for SettingsService {
    async fn get_all(
        &self,
        _request: Request<proto::SettingsGetAllRequest>,
    ) -> Result<Response<proto::SettingsGetAllResponse>, Status> {
        let doc = self.store.get_all().await;
        let json_data = serde_json::to_string(&doc).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(proto::SettingsGetAllResponse { json_data }))
    }

    async fn get_value(
        &self,
        request: Request<proto::SettingsGetValueRequest>,
    ) -> Result<Response<proto::SettingsGetValueResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key cannot be empty"));
        }
        let value = self
            .store
            .get(&req.key)
            .await
            .ok_or_else(|| Status::not_found(format!("no setting named {:?}", req.key)))?;
        let json_data =
            serde_json::to_string(&value).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(proto::SettingsGetValueResponse {
            key: req.key,
            json_data,
        }))
    }

    async fn set_value(
        &self,
        request: Request<proto::SettingsSetValueRequest>,
    ) -> Result<Response<proto::SettingsSetValueResponse>, Status> {
        let req = request.into_inner();
        if req.key.is_empty() {
            return Err(Status::invalid_argument("key cannot be empty"));
        }
        let value: serde_json::Value = serde_json::from_str(&req.json_data)
            .map_err(|e| Status::invalid_argument(format!("invalid JSON value: {e}")))?;
        self.store.set(&req.key, value).await;
        Ok(Response::new(proto::SettingsSetValueResponse {}))
    }

    async fn merge(
        &self,
        request: Request<proto::SettingsMergeRequest>,
    ) -> Result<Response<proto::SettingsMergeResponse>, Status> {
        let req = request.into_inner();
        let patch: serde_json::Value = serde_json::from_str(&req.json_data)
            .map_err(|e| Status::invalid_argument(format!("invalid JSON document: {e}")))?;
        self.store.merge(patch).await;
        Ok(Response::new(proto::SettingsMergeResponse {}))
    }

    async fn write(
        &self,
        request: Request<proto::SettingsWriteRequest>,
    ) -> Result<Response<proto::SettingsWriteResponse>, Status> {
        let req = request.into_inner();
        if req.file_path.is_empty() {
            return Err(Status::invalid_argument("file_path cannot be empty"));
        }
        self.store
            .write(Path::new(&req.file_path))
            .await
            .map_err(|e| Status::internal(format!("writing settings: {e}")))?;
        Ok(Response::new(proto::SettingsWriteResponse {}))
    }
}
