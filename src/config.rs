//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// How to launch a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Extra environment for the worker (inherits the supervisor's otherwise).
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Re-run the current executable in worker mode.
    pub fn current_exe() -> Result<Self, ConfigError> {
        let program = std::env::current_exe().map_err(|e| ConfigError::InvalidValue {
            key: "worker.program".to_string(),
            message: e.to_string(),
        })?;
        Ok(Self::new(program).arg("worker"))
    }
}

/// Step executor (supervisor) configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker process to spawn.
    pub worker: WorkerCommand,
    /// Default time a single `execute()` may take.
    pub call_timeout: Duration,
    /// Time a fresh worker has to report readiness.
    pub start_timeout: Duration,
    /// Whether a crashed worker is replaced automatically.
    pub auto_restart: bool,
    /// Pause before each respawn attempt.
    pub restart_delay: Duration,
    /// Respawn attempts per crash before giving up.
    pub max_restart_attempts: u32,
}

impl ExecutorConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        Self {
            worker,
            call_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(10),
            auto_restart: true,
            restart_delay: Duration::from_millis(250),
            max_restart_attempts: 5,
        }
    }
}

/// Settings for the capability object built per execution.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Upper bound for a single app/device info lookup.
    pub capability_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            capability_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything the `step-sandbox` binary needs.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub store_path: PathBuf,
    pub config_service_url: Option<String>,
    pub config_service_token: Option<SecretString>,
    pub executor: ExecutorConfig,
    pub context: ContextConfig,
}

impl SandboxConfig {
    /// Defaults overlaid with `STEP_SANDBOX_*` environment variables.
    pub fn from_env(worker: WorkerCommand) -> Result<Self, ConfigError> {
        Self::from_lookup(worker, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        worker: WorkerCommand,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut executor = ExecutorConfig::new(worker);
        let mut context = ContextConfig::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "STEP_SANDBOX_CALL_TIMEOUT_MS")? {
            executor.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "STEP_SANDBOX_START_TIMEOUT_MS")? {
            executor.start_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "STEP_SANDBOX_RESTART_DELAY_MS")? {
            executor.restart_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "STEP_SANDBOX_MAX_RESTART_ATTEMPTS")? {
            executor.max_restart_attempts = n;
        }
        if let Some(on) = parse_var::<bool>(&lookup, "STEP_SANDBOX_AUTO_RESTART")? {
            executor.auto_restart = on;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "STEP_SANDBOX_CAPABILITY_TIMEOUT_MS")? {
            context.capability_timeout = Duration::from_millis(ms);
        }

        let store_path = lookup("STEP_SANDBOX_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/step-sandbox.json"));

        let config_service_url = lookup("STEP_SANDBOX_CONFIG_URL").filter(|s| !s.is_empty());
        let config_service_token = lookup("STEP_SANDBOX_CONFIG_TOKEN")
            .filter(|s| !s.is_empty())
            .map(SecretString::from);
        if config_service_token.is_some() && config_service_url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "STEP_SANDBOX_CONFIG_URL".to_string(),
                hint: "A config service token was given without a URL".to_string(),
            });
        }

        Ok(Self {
            store_path,
            config_service_url,
            config_service_token,
            executor,
            context,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<SandboxConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SandboxConfig::from_lookup(WorkerCommand::new("worker-bin"), |key| {
            vars.get(key).cloned()
        })
    }

    #[test]
    fn defaults_without_env() {
        let config = load(&[]).unwrap();
        assert_eq!(config.executor.call_timeout, Duration::from_secs(30));
        assert!(config.executor.auto_restart);
        assert_eq!(config.store_path, PathBuf::from("./data/step-sandbox.json"));
        assert!(config.config_service_url.is_none());
    }

    #[test]
    fn env_overrides() {
        let config = load(&[
            ("STEP_SANDBOX_CALL_TIMEOUT_MS", "100"),
            ("STEP_SANDBOX_AUTO_RESTART", "false"),
            ("STEP_SANDBOX_STORE_PATH", "/tmp/s.json"),
            ("STEP_SANDBOX_CONFIG_URL", "http://localhost:9000"),
        ])
        .unwrap();
        assert_eq!(config.executor.call_timeout, Duration::from_millis(100));
        assert!(!config.executor.auto_restart);
        assert_eq!(config.store_path, PathBuf::from("/tmp/s.json"));
        assert_eq!(config.config_service_url.as_deref(), Some("http://localhost:9000"));
    }

    #[test]
    fn invalid_number_is_rejected() {
        let err = load(&[("STEP_SANDBOX_START_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "STEP_SANDBOX_START_TIMEOUT_MS"));
    }

    #[test]
    fn token_requires_url() {
        let err = load(&[("STEP_SANDBOX_CONFIG_TOKEN", "secret")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));
    }

    #[test]
    fn worker_command_builder() {
        let cmd = WorkerCommand::new("/bin/worker").arg("worker").env("RUST_LOG", "debug");
        assert_eq!(cmd.args, vec!["worker".to_string()]);
        assert_eq!(cmd.env, vec![("RUST_LOG".to_string(), "debug".to_string())]);
    }
}
