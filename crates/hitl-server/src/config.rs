use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use hitl_engine::{CheckpointStore, EngineConfig, FileCheckpointStore, MemoryCheckpointStore};
use hitl_types::{HitlError, Result};

/// Server settings. Read from the environment by [`ServerConfig::from_env`];
/// the CLI overrides individual fields.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Checkpoints are kept in memory when unset.
    pub checkpoint_dir: Option<PathBuf>,
    /// Allowed CORS origins; empty allows any origin.
    pub cors_origins: Vec<String>,
    pub max_steps: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            checkpoint_dir: None,
            cors_origins: Vec::new(),
            max_steps: EngineConfig::default().max_steps,
        }
    }
}

impl ServerConfig {
    /// `HITL_HOST`, `HITL_PORT`, `HITL_CHECKPOINT_DIR`, `HITL_CORS_ORIGINS`
    /// (comma separated), `HITL_MAX_STEPS`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("HITL_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("HITL_PORT") {
            config.port = parse_number("HITL_PORT", &port)?;
        }
        if let Ok(dir) = std::env::var("HITL_CHECKPOINT_DIR") {
            if !dir.trim().is_empty() {
                config.checkpoint_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(origins) = std::env::var("HITL_CORS_ORIGINS") {
            config.cors_origins = parse_origins(&origins);
        }
        if let Ok(steps) = std::env::var("HITL_MAX_STEPS") {
            config.max_steps = parse_number("HITL_MAX_STEPS", &steps)?;
        }
        Ok(config)
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| HitlError::Other(format!("invalid listen address: {e}")))
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_steps: self.max_steps,
        }
    }

    pub fn checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        match &self.checkpoint_dir {
            Some(dir) => Arc::new(FileCheckpointStore::new(dir)),
            None => Arc::new(MemoryCheckpointStore::new()),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| HitlError::Other(format!("{key} must be a number, got '{raw}'")))
}

pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty() && *o != "*")
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_split_and_wildcard_means_any() {
        assert_eq!(
            parse_origins("http://a.test, http://b.test,"),
            vec!["http://a.test", "http://b.test"]
        );
        assert!(parse_origins("*").is_empty());
    }

    #[test]
    fn default_address() {
        let config = ServerConfig::default();
        assert_eq!(config.addr().unwrap().port(), 8000);
        assert_eq!(config.engine().max_steps, 200);
    }

    #[tokio::test]
    async fn checkpoint_dir_selects_file_store() {
        use hitl_types::{Checkpoint, Cursor, WorkflowState};

        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..ServerConfig::default()
        };
        let cp = Checkpoint::new("t1", "review", WorkflowState::new(), Cursor::next("draft"));
        config.checkpoint_store().put(&cp).await.unwrap();

        let reopened = config.checkpoint_store().get("t1").await.unwrap().unwrap();
        assert_eq!(reopened.cursor, Cursor::next("draft"));
    }

    #[test]
    fn bad_number_rejected() {
        assert!(parse_number::<u16>("HITL_PORT", "eighty").is_err());
        assert_eq!(parse_number::<u16>("HITL_PORT", " 9000 ").unwrap(), 9000);
    }
}
