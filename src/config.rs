use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_server_port() -> u16 {
    8080
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o".to_string()
}

fn default_transcribe_model() -> String {
    "whisper-1".to_string()
}

/// Application configuration file structure (TOML)
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Local storage settings
    pub storage: StorageConfig,
    /// Remote object store; omit to use simulated in-memory uploads
    pub remote: Option<RemoteConfig>,
    /// Lecture metadata store; omit to keep results in memory only
    pub lectures: Option<LecturesConfig>,
    /// Transcription and text-generation service
    #[serde(default)]
    pub openai: OpenAiConfig,
    /// Trigger server settings
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the chunk database and the recording lock file
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the object store
    pub base_url: String,
    /// Optional bearer token
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LecturesConfig {
    /// Base URL of the lecture metadata store
    pub base_url: String,
    /// Optional bearer token
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    /// OpenAI-compatible API base (default: https://api.openai.com/v1)
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    /// Model for cleanup and note generation (default: gpt-4o)
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    /// Model for transcription (default: whisper-1)
    #[serde(default = "default_transcribe_model")]
    pub transcribe_model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            chat_model: default_chat_model(),
            transcribe_model: default_transcribe_model(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Port for the trigger endpoint (default: 8080)
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: AppConfig = toml::from_str(&raw)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate().map_err(|e| format!("Invalid config: {}", e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.storage.data_dir.as_os_str().is_empty() {
            return Err("storage.data_dir must not be empty".to_string());
        }
        if let Some(remote) = &self.remote {
            if remote.base_url.is_empty() {
                return Err("remote.base_url must not be empty".to_string());
            }
        }
        if let Some(lectures) = &self.lectures {
            if lectures.base_url.is_empty() {
                return Err("lectures.base_url must not be empty".to_string());
            }
        }
        Ok(())
    }

    /// Path of the local chunk database
    pub fn store_path(&self) -> PathBuf {
        self.storage.data_dir.join("chunks.sqlite")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [storage]
            data_dir = "tmp"
            "#,
        )
        .unwrap();

        assert!(config.remote.is_none());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.openai.chat_model, "gpt-4o");
        assert_eq!(config.openai.transcribe_model, "whisper-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_remote_url_is_rejected() {
        let config: AppConfig = toml::from_str(
            r#"
            [storage]
            data_dir = "tmp"
            [remote]
            base_url = ""
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
