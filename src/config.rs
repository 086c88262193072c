//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::bootstrap::{BootstrapError, BootstrapTemplate};
use crate::polling::PollPolicy;
use crate::provider::HttpProviderConfig;
use crate::readiness::ReadinessPolicy;
use crate::run::RunSettings;
use crate::selector::{Constraints, CostCap};
use crate::submit::SubmitPolicy;

const CONFIG_FILE: &str = "spotrun.toml";
const SECTION: &str = "spotrun";

/// Provider credentials, offer constraints and phase budgets, merged from
/// defaults, configuration files, environment variables and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(
    prefix = "SPOTRUN",
    discovery(
        app_name = "spotrun",
        env_var = "SPOTRUN_CONFIG_PATH",
        config_file_name = "spotrun.toml",
        dotfile_name = ".spotrun.toml",
        project_file_name = "spotrun.toml"
    )
)]
pub struct SpotrunConfig {
    /// Base URL of the provider API.
    pub provider_url: String,
    /// Bearer token for the provider API.
    pub provider_token: String,
    /// Upper bound on every HTTP request, in seconds.
    #[ortho_config(default = 30)]
    pub request_timeout_secs: u64,
    /// Minimum spacing between provider calls, in milliseconds.
    #[ortho_config(default = 250)]
    pub provider_min_spacing_ms: u64,
    /// Maximum concurrent provider calls.
    #[ortho_config(default = 4)]
    pub provider_max_in_flight: u32,
    /// Minimum GPU memory in gigabytes.
    #[ortho_config(default = 16)]
    pub min_gpu_memory_gb: u32,
    /// Required compute class, if any.
    pub compute_class: Option<String>,
    /// Maximum price per hour.
    #[ortho_config(default = 1.0)]
    pub price_ceiling: f64,
    /// Minimum host reliability score.
    #[ortho_config(default = 0.95)]
    pub min_reliability: f64,
    /// Maximum projected cost of a run at its worst-case duration.
    pub max_run_cost: Option<f64>,
    /// Bootstrap script template; the built-in ComfyUI script otherwise.
    pub bootstrap_template_file: Option<String>,
    /// Port the engine listens on inside the instance.
    #[ortho_config(default = 8188)]
    pub engine_port: u16,
    /// Budget for the provider to report running, in seconds.
    #[ortho_config(default = 600)]
    pub infra_timeout_secs: u64,
    /// Interval between describe calls, in seconds.
    #[ortho_config(default = 10)]
    pub infra_poll_secs: u64,
    /// Budget for the engine to answer its health call, in seconds.
    #[ortho_config(default = 300)]
    pub app_timeout_secs: u64,
    /// Interval between health probes, in seconds.
    #[ortho_config(default = 5)]
    pub app_poll_secs: u64,
    /// Budget for the job to reach a terminal state, in seconds.
    #[ortho_config(default = 1800)]
    pub job_timeout_secs: u64,
    /// Interval between job status queries, in seconds.
    #[ortho_config(default = 5)]
    pub job_poll_secs: u64,
    /// Submission attempts when the engine cannot be reached.
    #[ortho_config(default = 3)]
    pub submit_attempts: u32,
    /// Delay before the first submission retry, in milliseconds.
    #[ortho_config(default = 500)]
    pub submit_backoff_ms: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn guidance(&self) -> String {
        format!(
            "set {} or add {} to [{SECTION}] in {CONFIG_FILE}",
            self.env_var, self.toml_key
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// The bootstrap template could not be loaded.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

impl SpotrunConfig {
    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("spotrun")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.guidance()
            )));
        }
        Ok(())
    }

    fn require(
        valid: bool,
        problem: &str,
        metadata: &FieldMetadata,
    ) -> Result<(), ConfigError> {
        if valid {
            return Ok(());
        }
        Err(ConfigError::InvalidValue(format!(
            "{} {problem}: {}",
            metadata.description,
            metadata.guidance()
        )))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and configuration key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required value is empty
    /// and [`ConfigError::InvalidValue`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = FieldMetadata::new("provider API URL", "SPOTRUN_PROVIDER_URL", "provider_url");
        Self::require_field(&self.provider_url, &url)?;
        Self::require(
            self.provider_url.starts_with("http://") || self.provider_url.starts_with("https://"),
            "must start with http:// or https://",
            &url,
        )?;
        Self::require_field(
            &self.provider_token,
            &FieldMetadata::new(
                "provider API token",
                "SPOTRUN_PROVIDER_TOKEN",
                "provider_token",
            ),
        )?;
        Self::require(
            self.price_ceiling.is_finite() && self.price_ceiling > 0.0,
            "must be a positive number",
            &FieldMetadata::new("price ceiling", "SPOTRUN_PRICE_CEILING", "price_ceiling"),
        )?;
        Self::require(
            (0.0..=1.0).contains(&self.min_reliability),
            "must be between 0 and 1",
            &FieldMetadata::new(
                "minimum reliability",
                "SPOTRUN_MIN_RELIABILITY",
                "min_reliability",
            ),
        )?;
        Self::require(
            self.max_run_cost.is_none_or(|cap| cap.is_finite() && cap > 0.0),
            "must be a positive number",
            &FieldMetadata::new("maximum run cost", "SPOTRUN_MAX_RUN_COST", "max_run_cost"),
        )?;
        if let Some(path) = &self.bootstrap_template_file {
            Self::require_field(
                path,
                &FieldMetadata::new(
                    "bootstrap template path",
                    "SPOTRUN_BOOTSTRAP_TEMPLATE_FILE",
                    "bootstrap_template_file",
                ),
            )?;
        }
        Self::require(
            self.engine_port != 0,
            "must be non-zero",
            &FieldMetadata::new("engine port", "SPOTRUN_ENGINE_PORT", "engine_port"),
        )?;
        Self::require(
            self.submit_attempts != 0,
            "must be at least 1",
            &FieldMetadata::new(
                "submit attempts",
                "SPOTRUN_SUBMIT_ATTEMPTS",
                "submit_attempts",
            ),
        )?;
        self.validate_durations()
    }

    fn validate_durations(&self) -> Result<(), ConfigError> {
        let durations = [
            (
                self.request_timeout_secs,
                "request timeout",
                "SPOTRUN_REQUEST_TIMEOUT_SECS",
                "request_timeout_secs",
            ),
            (
                self.infra_timeout_secs,
                "infrastructure timeout",
                "SPOTRUN_INFRA_TIMEOUT_SECS",
                "infra_timeout_secs",
            ),
            (
                self.infra_poll_secs,
                "infrastructure poll interval",
                "SPOTRUN_INFRA_POLL_SECS",
                "infra_poll_secs",
            ),
            (
                self.app_timeout_secs,
                "application timeout",
                "SPOTRUN_APP_TIMEOUT_SECS",
                "app_timeout_secs",
            ),
            (
                self.app_poll_secs,
                "application poll interval",
                "SPOTRUN_APP_POLL_SECS",
                "app_poll_secs",
            ),
            (
                self.job_timeout_secs,
                "job timeout",
                "SPOTRUN_JOB_TIMEOUT_SECS",
                "job_timeout_secs",
            ),
            (
                self.job_poll_secs,
                "job poll interval",
                "SPOTRUN_JOB_POLL_SECS",
                "job_poll_secs",
            ),
        ];
        for (value, description, env_var, toml_key) in durations {
            Self::require(
                value != 0,
                "must be non-zero",
                &FieldMetadata::new(description, env_var, toml_key),
            )?;
        }
        Ok(())
    }

    /// Phase budgets derived from the configured timeouts and intervals.
    #[must_use]
    pub const fn run_settings(&self) -> RunSettings {
        RunSettings {
            readiness: ReadinessPolicy {
                infra: PollPolicy::new(
                    Duration::from_secs(self.infra_poll_secs),
                    Duration::from_secs(self.infra_timeout_secs),
                ),
                app: PollPolicy::new(
                    Duration::from_secs(self.app_poll_secs),
                    Duration::from_secs(self.app_timeout_secs),
                ),
            },
            job: PollPolicy::new(
                Duration::from_secs(self.job_poll_secs),
                Duration::from_secs(self.job_timeout_secs),
            ),
            submit: SubmitPolicy {
                attempts: self.submit_attempts,
                initial_backoff: Duration::from_millis(self.submit_backoff_ms),
            },
            engine_port: self.engine_port,
        }
    }

    /// Offer constraints, including the pre-flight cost cap when one is
    /// configured.
    #[must_use]
    pub fn constraints(&self) -> Constraints {
        Constraints {
            min_gpu_memory_gb: self.min_gpu_memory_gb,
            compute_class: self
                .compute_class
                .as_deref()
                .map(str::trim)
                .filter(|class| !class.is_empty())
                .map(str::to_owned),
            price_ceiling: self.price_ceiling,
            min_reliability: self.min_reliability,
            cost_cap: self.max_run_cost.map(|max_cost| CostCap {
                max_cost,
                budget: self.run_settings().billable_budget(),
            }),
        }
    }

    /// Upper bound on every HTTP request.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Connection settings for the provider adapter.
    #[must_use]
    pub fn provider_config(&self) -> HttpProviderConfig {
        HttpProviderConfig {
            base_url: self.provider_url.trim_end_matches('/').to_owned(),
            token: self.provider_token.clone(),
            request_timeout: self.request_timeout(),
            min_spacing: Duration::from_millis(self.provider_min_spacing_ms),
            max_in_flight: usize::try_from(self.provider_max_in_flight).unwrap_or(usize::MAX),
        }
    }

    /// Loads the configured bootstrap template or the built-in default.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Bootstrap`] when the template file cannot be
    /// read or is empty.
    pub fn bootstrap_template(&self) -> Result<BootstrapTemplate, ConfigError> {
        match &self.bootstrap_template_file {
            Some(path) => Ok(BootstrapTemplate::from_file(path)?),
            None => Ok(BootstrapTemplate::default()),
        }
    }
}
