//! Durable storage for gateway state that must outlive the gateway process.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gateway_sidecar_error::SidecarError;
use serde_json::{Map, Value};

use crate::gateway_logs::LogRecorder;
use crate::paths::Resource;

pub const PERSIST_BODY_LIMIT: usize = 512 * 1024;
const EMPTY_OBJECT: &[u8] = b"{}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistedValue {
    /// Raw stored bytes, or `{}` when nothing was written yet.
    Document(Vec<u8>),
    /// Keys of the stored sessions.
    SessionKeys(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct PersistService {
    state_dir: PathBuf,
    logs: Arc<LogRecorder>,
}

impl PersistService {
    pub fn new(state_dir: impl Into<PathBuf>, logs: Arc<LogRecorder>) -> Self {
        Self {
            state_dir: state_dir.into(),
            logs,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn read(&self, logical: &str) -> Result<PersistedValue, SidecarError> {
        let resource = self.resolve(logical)?;
        self.logs.system(format!("persist: GET path={logical}"));
        let path = resource.physical_path(&self.state_dir);

        if resource.is_collection() {
            let keys = list_session_keys(&path).map_err(|err| {
                self.logs
                    .system(format!("persist: GET sessions list error: {err}"));
                tracing::warn!(path = %path.display(), error = %err, "failed to list sessions");
                SidecarError::io("failed to list sessions", &err)
            })?;
            self.logs
                .system(format!("persist: GET sessions ok ({} keys)", keys.len()));
            return Ok(PersistedValue::SessionKeys(keys));
        }

        match fs::read(&path) {
            Ok(bytes) => {
                self.logs
                    .system(format!("persist: GET {resource} ok ({} bytes)", bytes.len()));
                Ok(PersistedValue::Document(bytes))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.logs
                    .system(format!("persist: GET {resource} (not found, return {{}})"));
                Ok(PersistedValue::Document(EMPTY_OBJECT.to_vec()))
            }
            Err(err) => {
                self.logs
                    .system(format!("persist: GET {resource} error: {err}"));
                tracing::warn!(path = %path.display(), error = %err, "failed to read persisted resource");
                Err(SidecarError::io("failed to read resource", &err))
            }
        }
    }

    /// Stores `bytes` under `logical`, returning the number of bytes written.
    pub fn write(&self, logical: &str, bytes: &[u8]) -> Result<usize, SidecarError> {
        let resource = self.resolve(logical)?;
        if resource.is_collection() {
            self.logs.system("persist: PUT sessions (rejected)");
            return Err(SidecarError::invalid_request(
                "cannot write the sessions collection; address sessions/<key>",
            ));
        }
        if bytes.len() > PERSIST_BODY_LIMIT {
            self.record_oversize(logical);
            return Err(SidecarError::PayloadTooLarge {
                message: format!("{resource} body exceeds {PERSIST_BODY_LIMIT} bytes"),
                limit: PERSIST_BODY_LIMIT,
            });
        }
        self.logs.system(format!("persist: PUT path={logical}"));

        let normalized;
        let payload = if resource == Resource::Config {
            normalized = normalize_gateway_config(bytes);
            normalized.as_slice()
        } else {
            bytes
        };

        let path = resource.physical_path(&self.state_dir);
        write_private(&path, payload).map_err(|err| {
            self.logs
                .system(format!("persist: PUT {resource} error: {err}"));
            tracing::warn!(path = %path.display(), error = %err, "failed to write persisted resource");
            SidecarError::io("failed to write resource", &err)
        })?;
        self.logs
            .system(format!("persist: PUT {resource} ok ({} bytes)", payload.len()));
        Ok(payload.len())
    }

    /// Audits a PUT whose body exceeded [`PERSIST_BODY_LIMIT`], including
    /// bodies refused before they were fully read.
    pub fn record_oversize(&self, logical: &str) {
        self.logs.system(format!(
            "persist: PUT {logical} rejected (body exceeds {PERSIST_BODY_LIMIT} bytes)"
        ));
    }

    fn resolve(&self, logical: &str) -> Result<Resource, SidecarError> {
        if logical.is_empty() {
            self.logs.system("persist: missing path");
            return Err(SidecarError::invalid_request("missing path"));
        }
        Resource::parse(logical).ok_or_else(|| {
            self.logs
                .system(format!("persist: invalid path {logical:?}"));
            SidecarError::InvalidPath {
                path: logical.to_string(),
            }
        })
    }
}

/// Shapes a configuration blob into the object the gateway loads.
///
/// A lone `{"config": {...}}` envelope is unwrapped and the top-level
/// `heartbeat` key, which the gateway's schema forbids, is dropped. Input that
/// is not a JSON object passes through untouched.
pub fn normalize_gateway_config(raw: &[u8]) -> Vec<u8> {
    let mut document = match serde_json::from_slice::<Map<String, Value>>(raw) {
        Ok(map) => map,
        Err(_) => return raw.to_vec(),
    };

    if document.len() == 1 {
        if let Some(inner) = document.remove("config") {
            match inner {
                Value::Object(inner) => document = inner,
                other => return serde_json::to_vec(&other).unwrap_or_else(|_| raw.to_vec()),
            }
        }
    }

    document.remove("heartbeat");
    serde_json::to_vec(&document).unwrap_or_else(|_| raw.to_vec())
}

/// Writes `bytes` readable by the owner only, creating parent directories.
pub(crate) fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.flush()
}

fn list_session_keys(dir: &Path) -> std::io::Result<Vec<String>> {
    fs::create_dir_all(dir)?;
    let mut keys = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.len() > 5 && name.to_ascii_lowercase().ends_with(".json") {
            keys.push(name[..name.len() - 5].to_string());
        }
    }
    keys.sort();
    Ok(keys)
}
