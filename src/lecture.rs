use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::remote::RemoteError;

/// Lecture processing status, monotonic through the pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LectureStatus {
    Uploading,
    Transcribing,
    Cleaning,
    Completed,
    Failed,
}

impl LectureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LectureStatus::Uploading => "uploading",
            LectureStatus::Transcribing => "transcribing",
            LectureStatus::Cleaning => "cleaning",
            LectureStatus::Completed => "completed",
            LectureStatus::Failed => "failed",
        }
    }
}

/// Merge-update for a lecture record: only set fields are written, so
/// concurrently-read fields are preserved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LectureUpdate {
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LectureStatus>,
    #[serde(rename = "totalChunks", skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<u32>,
    #[serde(rename = "transcribedChunks", skip_serializing_if = "Option::is_none")]
    pub transcribed_chunks: Option<u32>,
    #[serde(rename = "transcriptRaw", skip_serializing_if = "Option::is_none")]
    pub transcript_raw: Option<String>,
    #[serde(rename = "transcriptClean", skip_serializing_if = "Option::is_none")]
    pub transcript_clean: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(rename = "topicAnalysis", skip_serializing_if = "Option::is_none")]
    pub topic_analysis: Option<String>,
    /// Duration in seconds
    #[serde(rename = "duration", skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "folderId", skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
    #[serde(rename = "failedAt", skip_serializing_if = "Option::is_none")]
    pub failed_at_ms: Option<i64>,
}

/// Document store holding per-user lecture records, written via merge-update
pub trait LectureStore: Send + Sync {
    fn merge_update(
        &self,
        user_id: &str,
        session_id: &str,
        update: &LectureUpdate,
    ) -> Result<(), RemoteError>;
}

/// HTTP-backed lecture store: PATCH `{base}/users/{user}/lectures/{session}`
/// with a JSON body containing only the set fields.
pub struct HttpLectureStore {
    base_url: String,
    auth_token: Option<String>,
    client: Client,
}

impl HttpLectureStore {
    pub fn new(base_url: &str, auth_token: Option<String>) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RemoteError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
            client,
        })
    }
}

impl LectureStore for HttpLectureStore {
    fn merge_update(
        &self,
        user_id: &str,
        session_id: &str,
        update: &LectureUpdate,
    ) -> Result<(), RemoteError> {
        let url = format!(
            "{}/users/{}/lectures/{}",
            self.base_url, user_id, session_id
        );
        let mut request = self.client.patch(&url).json(update);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RemoteError::Status {
                code: response.status().as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// In-memory lecture store for tests and for runs without a metadata
/// backend. Records the full update history so status sequences can be
/// asserted.
#[derive(Default)]
pub struct MemoryLectureStore {
    records: Mutex<HashMap<(String, String), Value>>,
    history: Mutex<Vec<LectureUpdate>>,
}

impl MemoryLectureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The merged record for one lecture, if any
    pub fn get(&self, user_id: &str, session_id: &str) -> Option<Value> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(user_id.to_string(), session_id.to_string()))
            .cloned()
    }

    /// Status strings in the order they were written
    pub fn status_history(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|u| u.status.map(|s| s.as_str().to_string()))
            .collect()
    }

    pub fn update_count(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl LectureStore for MemoryLectureStore {
    fn merge_update(
        &self,
        user_id: &str,
        session_id: &str,
        update: &LectureUpdate,
    ) -> Result<(), RemoteError> {
        let patch = serde_json::to_value(update)
            .map_err(|e| RemoteError::Decode(format!("failed to serialize update: {}", e)))?;

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let entry = records
            .entry((user_id.to_string(), session_id.to_string()))
            .or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(fields) = patch {
            if let Value::Object(record) = entry {
                for (key, value) in fields {
                    record.insert(key, value);
                }
            }
        }
        drop(records);

        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(update.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_update_only_touches_set_fields() {
        let store = MemoryLectureStore::new();

        store
            .merge_update(
                "u1",
                "s1",
                &LectureUpdate {
                    session_id: Some("s1".to_string()),
                    status: Some(LectureStatus::Transcribing),
                    total_chunks: Some(3),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .merge_update(
                "u1",
                "s1",
                &LectureUpdate {
                    status: Some(LectureStatus::Completed),
                    notes: Some("# Notes".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let record = store.get("u1", "s1").unwrap();
        assert_eq!(record["status"], "completed");
        assert_eq!(record["totalChunks"], 3); // preserved across the merge
        assert_eq!(record["notes"], "# Notes");
        assert_eq!(
            store.status_history(),
            vec!["transcribing", "completed"]
        );
    }

    #[test]
    fn update_serializes_without_unset_fields() {
        let update = LectureUpdate {
            status: Some(LectureStatus::Failed),
            error: Some("boom".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&update).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 2);
        assert_eq!(object["status"], "failed");
        assert_eq!(object["error"], "boom");
    }
}
