use log::debug;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

/// Remote object storage errors
#[derive(Debug)]
pub enum RemoteError {
    /// Network-level failure (connect, timeout, transport)
    Network(String),
    /// Server answered with a non-success status
    Status { code: u16, body: String },
    /// Response could not be decoded
    Decode(String),
    /// Requested object does not exist
    NotFound(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Network(msg) => write!(f, "network error: {}", msg),
            RemoteError::Status { code, body } => {
                write!(f, "remote returned status {}: {}", code, body)
            }
            RemoteError::Decode(msg) => write!(f, "failed to decode response: {}", msg),
            RemoteError::NotFound(key) => write!(f, "object not found: {}", key),
        }
    }
}

impl StdError for RemoteError {}

/// Object storage consumed by the sync engine and the processing pipeline
pub trait ObjectStore: Send + Sync {
    fn put_object(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), RemoteError>;
    /// Object names under a prefix, sorted ascending
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;
    fn get_object(&self, key: &str) -> Result<Vec<u8>, RemoteError>;
    /// Remove every object under a prefix; returns the number removed
    fn delete_prefix(&self, prefix: &str) -> Result<u64, RemoteError>;
}

/// File extension derived from the chunk media type
pub fn extension_for_media_type(media_type: &str) -> &'static str {
    if media_type.contains("webm") {
        "webm"
    } else {
        "ogg"
    }
}

/// Deterministic, user-scoped object key for a chunk. Re-uploading the same
/// index overwrites instead of duplicating. Single-file uploads use index 0.
pub fn chunk_object_key(
    user_id: &str,
    session_id: &str,
    chunk_index: u32,
    media_type: &str,
) -> String {
    format!(
        "users/{}/recordings/{}/chunk_{:06}.{}",
        user_id,
        session_id,
        chunk_index,
        extension_for_media_type(media_type)
    )
}

/// Prefix under which a session's chunks live
pub fn session_prefix(user_id: &str, session_id: &str) -> String {
    format!("users/{}/recordings/{}/", user_id, session_id)
}

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectList {
    objects: Vec<ObjectEntry>,
}

/// HTTP-backed object store.
///
/// Layout: PUT/GET/DELETE `{base}/{key}`, listing via
/// `GET {base}/?prefix={prefix}` returning `{"objects": [{"name": ...}]}`.
pub struct HttpObjectStore {
    base_url: String,
    auth_token: Option<String>,
    client: Client,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            client,
        })
    }

    fn authorize(
        &self,
        req: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

impl ObjectStore for HttpObjectStore {
    fn put_object(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), RemoteError> {
        let url = format!("{}/{}", self.base_url, key);
        let response = self
            .authorize(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data.to_vec())
            .send()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                code: response.status().as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        debug!("uploaded {} ({} bytes)", key, data.len());
        Ok(())
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let url = format!("{}/?prefix={}", self.base_url, prefix);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                code: response.status().as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let list: ObjectList = response
            .json()
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        let mut names: Vec<String> = list.objects.into_iter().map(|o| o.name).collect();
        names.sort();
        Ok(names)
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, RemoteError> {
        let url = format!("{}/{}", self.base_url, key);
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        if response.status().as_u16() == 404 {
            return Err(RemoteError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                code: response.status().as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let bytes = response
            .bytes()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, RemoteError> {
        let names = self.list_objects(prefix)?;
        let mut deleted = 0u64;
        for name in names {
            let url = format!("{}/{}", self.base_url, name);
            let response = self
                .authorize(self.client.delete(&url))
                .send()
                .map_err(|e| RemoteError::Network(e.to_string()))?;
            if !response.status().is_success() {
                return Err(RemoteError::Status {
                    code: response.status().as_u16(),
                    body: response.text().unwrap_or_default(),
                });
            }
            deleted += 1;
        }
        Ok(deleted)
    }
}

/// In-memory object store, used for tests and for simulated uploads when no
/// remote is configured.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, (String, Vec<u8>)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put_object(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), RemoteError> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), (content_type.to_string(), data.to_vec()));
        Ok(())
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, RemoteError> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| RemoteError::NotFound(key.to_string()))
    }

    fn delete_prefix(&self, prefix: &str) -> Result<u64, RemoteError> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            objects.remove(key);
        }
        Ok(keys.len() as u64)
    }
}
