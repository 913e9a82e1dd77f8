use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Runtime tuning loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarshalConfig {
    /// Async worker threads for `RuntimeExecutor`.
    pub worker_threads: usize,
    /// Upper bound on the blocking pool used for parallel work.
    pub max_blocking_threads: usize,
    /// Name prefix for executor threads.
    pub thread_name: String,
    /// Name of the shared timer thread.
    pub timer_thread_name: String,
    /// How long `run_until_shutdown` waits for work before re-checking.
    pub pump_interval: Duration,
    /// Default limit for bounded cross-thread sends.
    pub send_timeout: Duration,
}

impl Default for MarshalConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            max_blocking_threads: 16,
            thread_name: "marshal-worker".to_string(),
            timer_thread_name: "marshal-timer".to_string(),
            pump_interval: Duration::from_millis(16),
            send_timeout: Duration::from_secs(30),
        }
    }
}

impl MarshalConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup, falling back to
    /// defaults for missing keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let worker_threads = match lookup("MARSHAL_WORKER_THREADS") {
            Some(raw) => raw
                .parse()
                .context("MARSHAL_WORKER_THREADS must be a valid number")?,
            None => defaults.worker_threads,
        };
        let max_blocking_threads = match lookup("MARSHAL_MAX_BLOCKING_THREADS") {
            Some(raw) => raw
                .parse()
                .context("MARSHAL_MAX_BLOCKING_THREADS must be a valid number")?,
            None => defaults.max_blocking_threads,
        };
        let pump_interval = match lookup("MARSHAL_PUMP_INTERVAL_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse()
                    .context("MARSHAL_PUMP_INTERVAL_MS must be a valid number")?,
            ),
            None => defaults.pump_interval,
        };
        let send_timeout = match lookup("MARSHAL_SEND_TIMEOUT_MS") {
            Some(raw) => Duration::from_millis(
                raw.parse()
                    .context("MARSHAL_SEND_TIMEOUT_MS must be a valid number")?,
            ),
            None => defaults.send_timeout,
        };

        if worker_threads == 0 {
            anyhow::bail!("MARSHAL_WORKER_THREADS must be at least 1");
        }
        if max_blocking_threads == 0 {
            anyhow::bail!("MARSHAL_MAX_BLOCKING_THREADS must be at least 1");
        }

        Ok(Self {
            worker_threads,
            max_blocking_threads,
            thread_name: lookup("MARSHAL_THREAD_NAME").unwrap_or(defaults.thread_name),
            timer_thread_name: lookup("MARSHAL_TIMER_THREAD_NAME")
                .unwrap_or(defaults.timer_thread_name),
            pump_interval,
            send_timeout,
        })
    }
}
