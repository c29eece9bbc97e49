use super::NodeId;
use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tessera_core::util::parse_bytes;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub plan: PlanConfig,
    pub executor: ExecutorConfig,
}

impl Config {
    pub fn new(plan: PlanConfig, executor: ExecutorConfig) -> Self {
        Self { plan, executor }
    }

    pub fn from_env() -> Self {
        Self {
            plan: PlanConfig::from_env(),
            executor: ExecutorConfig::from_env(),
        }
    }
}

/// Memory limits and fusion settings used while building and optimizing a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Upper bound on the memory a single task may use, including `reserved_mem`.
    pub allowed_mem: u64,

    /// Memory each worker needs before running any task.
    pub reserved_mem: u64,
    pub fusion: FusionConfig,
}

impl PlanConfig {
    pub fn new(allowed_mem: u64, reserved_mem: u64) -> Self {
        Self {
            allowed_mem,
            reserved_mem,
            fusion: default(),
        }
    }

    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Some(n) = parse_env("TESSERA_ALLOWED_MEM", parse_bytes) {
            out.allowed_mem = n;
        }

        if let Some(n) = parse_env("TESSERA_RESERVED_MEM", parse_bytes) {
            out.reserved_mem = n;
        }

        out.fusion = FusionConfig::from_env();
        out
    }
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self::new(2_000_000_000, 100_000_000)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub enabled: bool,

    /// Maximum number of distinct source arrays a fused node may read. Only enforced when the
    /// consuming node has more than one distinct input. `None` means unlimited.
    pub max_total_source_arrays: Option<usize>,

    /// If set, only these nodes may absorb their predecessors.
    pub only_fuse: Option<Vec<NodeId>>,

    /// These nodes are never fused into a consumer.
    pub never_fuse: Vec<NodeId>,
}

impl FusionConfig {
    /// Fuse as much as the memory limit allows.
    pub fn fuse_all() -> Self {
        Self {
            max_total_source_arrays: None,
            ..default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..default()
        }
    }

    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Some(flag) = parse_env("TESSERA_FUSION", parse_flag) {
            out.enabled = flag;
        }

        if let Ok(value) = env::var("TESSERA_MAX_SOURCE_ARRAYS") {
            match value.trim() {
                "" | "none" | "unlimited" => out.max_total_source_arrays = None,
                s => match s.parse::<usize>() {
                    Ok(n) => out.max_total_source_arrays = Some(n),
                    Err(_) => warn!("invalid value for TESSERA_MAX_SOURCE_ARRAYS: {:?}", s),
                },
            }
        }

        out
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_total_source_arrays: Some(4),
            only_fuse: None,
            never_fuse: vec![],
        }
    }
}

/// What the executor does with the rest of the graph once a node fails.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop launching new work as soon as any node fails.
    FailFast,

    /// Keep running nodes that do not depend on a failed node.
    ContinueIndependent,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::FailFast
    }
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "fail_fast" | "fail-fast" => Ok(FailurePolicy::FailFast),
            "continue" | "continue_independent" | "continue-independent" => {
                Ok(FailurePolicy::ContinueIndependent)
            }
            other => bail!("unknown failure policy {:?}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Attempts per task in the retry chain, including the first one.
    pub max_attempts: u32,
    pub stragglers_enabled: bool,

    /// A task is a straggler once it has run longer than this multiple of the mean duration of
    /// its already finished siblings.
    pub straggler_threshold_multiplier: f64,
    pub task_timeout: Option<Duration>,
    pub poll_interval: Duration,

    /// Base delay before a failed task is resubmitted. Grows linearly with the attempt number
    /// and is jittered by up to 50%.
    pub retry_backoff: Duration,
    pub failure_policy: FailurePolicy,
    pub trace_file: Option<PathBuf>,
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let mut out = Self::default();

        if let Some(n) = parse_env("TESSERA_MAX_ATTEMPTS", |s| Ok(s.parse::<u32>()?)) {
            out.max_attempts = max(n, 1);
        }

        if let Some(flag) = parse_env("TESSERA_STRAGGLERS", parse_flag) {
            out.stragglers_enabled = flag;
        }

        if let Some(m) = parse_env("TESSERA_STRAGGLER_MULTIPLIER", parse_multiplier) {
            out.straggler_threshold_multiplier = m;
        }

        if let Some(d) = parse_env("TESSERA_TASK_TIMEOUT", parse_seconds) {
            out.task_timeout = Some(d);
        }

        if let Some(d) = parse_env("TESSERA_POLL_INTERVAL", parse_seconds) {
            out.poll_interval = d;
        }

        if let Some(d) = parse_env("TESSERA_RETRY_BACKOFF", parse_seconds) {
            out.retry_backoff = d;
        }

        if let Some(policy) = parse_env("TESSERA_FAILURE_POLICY", |s| s.parse::<FailurePolicy>()) {
            out.failure_policy = policy;
        }

        if let Ok(filename) = env::var("TESSERA_TRACE") {
            let filename = filename.trim();

            if !filename.is_empty() {
                info!("writing trace to {:?}", filename);
                out.trace_file = Some(filename.into());
            }
        }

        out
    }

    /// Check the settings the executor cannot run with.
    pub fn validate(&self) -> Result {
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }

        let m = self.straggler_threshold_multiplier;
        if !(m.is_finite() && m > 0.0) {
            bail!("straggler_threshold_multiplier must be a positive number, found {}", m);
        }

        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            stragglers_enabled: false,
            straggler_threshold_multiplier: 3.0,
            task_timeout: None,
            poll_interval: Duration::from_millis(10),
            retry_backoff: Duration::from_millis(100),
            failure_policy: default(),
            trace_file: None,
        }
    }
}

/// Read and parse an environment variable. Unparsable values are reported and ignored.
fn parse_env<T, F>(key: &str, parse: F) -> Option<T>
where
    F: FnOnce(&str) -> Result<T>,
{
    let value = env::var(key).ok()?;

    match parse(value.trim()) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("ignoring invalid value {:?} for {}: {}", value, key, e);
            None
        }
    }
}

fn parse_flag(s: &str) -> Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, found {:?}", other),
    }
}

fn parse_seconds(s: &str) -> Result<Duration> {
    let secs: f64 = s.parse()?;
    if !(secs >= 0.0 && secs.is_finite()) {
        bail!("expected a non-negative number of seconds");
    }

    Ok(Duration::from_secs_f64(secs))
}

fn parse_multiplier(s: &str) -> Result<f64> {
    let m: f64 = s.parse()?;
    if !(m.is_finite() && m > 0.0) {
        bail!("expected a positive multiplier");
    }

    Ok(m)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_helpers() {
        assert!(parse_flag("Yes").unwrap());
        assert!(!parse_flag("0").unwrap());
        assert!(parse_flag("maybe").is_err());
        assert_eq!(parse_seconds("1.5").unwrap(), Duration::from_millis(1500));
        assert!(parse_seconds("-1").is_err());
        assert_eq!(parse_multiplier("2.5").unwrap(), 2.5);
        assert!(parse_multiplier("-2").is_err());
        assert!(parse_multiplier("0").is_err());
        assert!(parse_multiplier("NaN").is_err());
        assert_eq!(
            "continue".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::ContinueIndependent
        );
    }

    #[test]
    fn test_from_env() {
        env::set_var("TESSERA_ALLOWED_MEM", "1GB");
        env::set_var("TESSERA_MAX_ATTEMPTS", "five");
        env::set_var("TESSERA_MAX_SOURCE_ARRAYS", "unlimited");
        env::set_var("TESSERA_STRAGGLER_MULTIPLIER", "-2");

        let config = Config::from_env();
        assert_eq!(config.plan.allowed_mem, 1_000_000_000);
        assert_eq!(config.executor.max_attempts, 3);
        assert_eq!(config.executor.straggler_threshold_multiplier, 3.0);
        assert_eq!(config.plan.fusion.max_total_source_arrays, None);
        assert!(config.executor.validate().is_ok());

        env::remove_var("TESSERA_ALLOWED_MEM");
        env::remove_var("TESSERA_MAX_ATTEMPTS");
        env::remove_var("TESSERA_MAX_SOURCE_ARRAYS");
        env::remove_var("TESSERA_STRAGGLER_MULTIPLIER");
    }

    #[test]
    fn test_validate_executor() {
        assert!(ExecutorConfig::default().validate().is_ok());

        for m in &[-1.0, 0.0, f64::NAN, f64::INFINITY] {
            let config = ExecutorConfig {
                straggler_threshold_multiplier: *m,
                ..default()
            };
            assert!(config.validate().is_err());
        }

        let config = ExecutorConfig {
            max_attempts: 0,
            ..default()
        };
        assert!(config.validate().is_err());
    }
}
