// crates/flowcli/src/config.rs

use anyhow::{Context, Result};
use clap::Args;
use flowruntime::RuntimeConfig;
use std::path::PathBuf;

/// Runtime settings shared by every command.
///
/// A `--config` JSON file is read first; flags (or their `FLOW_*`
/// environment variables) override individual fields of it.
#[derive(Debug, Clone, Args)]
pub struct RuntimeArgs {
    /// JSON file holding a full runtime configuration
    #[arg(long, env = "FLOW_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Worker id written into claimed queue items
    #[arg(long, env = "FLOW_WORKER_ID", global = true)]
    pub worker_id: Option<String>,

    /// Dispatch loop poll interval in milliseconds
    #[arg(long, env = "FLOW_POLL_INTERVAL_MS", global = true)]
    pub poll_interval_ms: Option<u64>,

    /// Maximum number of runs executing at once
    #[arg(long, env = "FLOW_MAX_CONCURRENT_RUNS", global = true)]
    pub max_concurrent_runs: Option<usize>,

    /// Run timeout applied when neither the request nor the workflow sets one
    #[arg(long, env = "FLOW_DEFAULT_TIMEOUT_SECONDS", global = true)]
    pub default_timeout_seconds: Option<u64>,
}

impl RuntimeArgs {
    pub fn load(&self) -> Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                RuntimeConfig::from_json(&json)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => RuntimeConfig::default(),
        };

        if let Some(worker_id) = &self.worker_id {
            config.worker_id = worker_id.clone();
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        if let Some(runs) = self.max_concurrent_runs {
            config.max_concurrent_runs = runs;
        }
        if let Some(seconds) = self.default_timeout_seconds {
            config.default_timeout_seconds = seconds;
        }

        if config.max_concurrent_runs == 0 {
            anyhow::bail!("max_concurrent_runs must be at least 1");
        }
        if config.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be at least 1");
        }
        if config.event_buffer_size == 0 {
            anyhow::bail!("event_buffer_size must be at least 1");
        }

        tracing::debug!(
            "Runtime config: worker {}, poll {}ms, {} concurrent runs, default timeout {}s",
            config.worker_id,
            config.poll_interval_ms,
            config.max_concurrent_runs,
            config.default_timeout_seconds
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_for(config: Option<PathBuf>) -> RuntimeArgs {
        RuntimeArgs {
            config,
            worker_id: None,
            poll_interval_ms: None,
            max_concurrent_runs: None,
            default_timeout_seconds: None,
        }
    }

    #[test]
    fn zero_sized_settings_are_rejected() {
        let path = std::env::temp_dir().join(format!("flow-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"event_buffer_size": 0}"#).unwrap();
        let error = args_for(Some(path.clone())).load().unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(error.to_string().contains("event_buffer_size"), "{}", error);

        let mut args = args_for(None);
        args.max_concurrent_runs = Some(0);
        assert!(args.load().is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let mut args = args_for(None);
        args.worker_id = Some("edge-1".to_string());
        args.poll_interval_ms = Some(25);
        let config = args.load().unwrap();
        assert_eq!(config.worker_id, "edge-1");
        assert_eq!(config.poll_interval_ms, 25);
        assert_eq!(config.event_buffer_size, 1000);
    }
}
