//! JIT configuration
//!
//! Settings come from three places, lowest priority first: `Default`,
//! a TOML document, and `SYMTRACE_*` environment variables.
//!
//! ```toml
//! cache_size_limit = 10
//! infer_cache_capacity = 4096    # 0 keeps the cache unbounded
//! reuse_concrete_program = false
//! log_sir = false
//! max_trace_steps = 50000
//! ```

use std::fmt;
use std::num::NonZeroUsize;

use serde::Deserialize;

/// Translator and cache settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JitConfig {
    /// Guarded translations kept per code object before new shapes run untraced
    pub cache_size_limit: usize,
    /// Bound of the shape-inference cache, 0 for unbounded
    pub infer_cache_capacity: usize,
    /// Reuse a compiled program's concrete specialization across calls with
    /// identical input metadata instead of re-deriving it on every call
    pub reuse_concrete_program: bool,
    /// Log every statement program at debug level when it is compiled
    pub log_sir: bool,
    /// Instructions simulated per translation before the trace gives up
    pub max_trace_steps: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            cache_size_limit: 10,
            infer_cache_capacity: 0,
            reuse_concrete_program: false,
            log_sir: false,
            max_trace_steps: 50_000,
        }
    }
}

/// Errors raised while loading configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Toml(String),
    InvalidEnv { var: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Toml(msg) => write!(f, "Invalid configuration: {}", msg),
            ConfigError::InvalidEnv { var, value } => {
                write!(f, "Invalid value '{}' for environment variable {}", value, var)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

const ENV_CACHE_SIZE_LIMIT: &str = "SYMTRACE_CACHE_SIZE_LIMIT";
const ENV_INFER_CACHE_CAPACITY: &str = "SYMTRACE_INFER_CACHE_CAPACITY";
const ENV_REUSE_CONCRETE_PROGRAM: &str = "SYMTRACE_REUSE_CONCRETE_PROGRAM";
const ENV_LOG_SIR: &str = "SYMTRACE_LOG_SIR";
const ENV_MAX_TRACE_STEPS: &str = "SYMTRACE_MAX_TRACE_STEPS";

impl JitConfig {
    /// Defaults overridden by any `SYMTRACE_*` variables that are set
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        toml::from_str(source).map_err(|e| ConfigError::Toml(e.to_string()))
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// [`JitConfig::from_env`])
    pub fn with_overrides(mut self, lookup: impl Fn(&'static str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_CACHE_SIZE_LIMIT) {
            self.cache_size_limit = parse_usize(ENV_CACHE_SIZE_LIMIT, &value)?;
        }
        if let Some(value) = lookup(ENV_INFER_CACHE_CAPACITY) {
            self.infer_cache_capacity = parse_usize(ENV_INFER_CACHE_CAPACITY, &value)?;
        }
        if let Some(value) = lookup(ENV_REUSE_CONCRETE_PROGRAM) {
            self.reuse_concrete_program = parse_flag(ENV_REUSE_CONCRETE_PROGRAM, &value)?;
        }
        if let Some(value) = lookup(ENV_LOG_SIR) {
            self.log_sir = parse_flag(ENV_LOG_SIR, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_TRACE_STEPS) {
            self.max_trace_steps = parse_usize(ENV_MAX_TRACE_STEPS, &value)?;
        }
        Ok(self)
    }

    /// LRU bound for the shape-inference cache, `None` when unbounded
    pub fn infer_cache_bound(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.infer_cache_capacity)
    }
}

fn parse_usize(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
    })
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}
