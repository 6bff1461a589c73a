//! Reconciler configuration.
//!
//! Loaded from `POLEX_*` environment variables through [`ReconcilerConfig::from_env`],
//! or assembled programmatically with the `with_*` builder methods.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::ConfigError;
use crate::kinds::KindExpansion;

pub const DEFAULT_REQUEUE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_MAX_JITTER_PERCENT: u32 = 10;
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_RECONFIRM_INTERVAL_SECS: u64 = 600;

/// Configuration for the reconciliation engine and its controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Policy categories whose results are considered.
    pub target_categories: BTreeSet<String>,

    /// Workload kinds whose reports are considered.
    pub target_workloads: BTreeSet<String>,

    /// Namespaces whose reports are ignored.
    pub exclude_namespaces: BTreeSet<String>,

    /// Namespace drafts are written to. `None` writes next to the resource.
    pub destination_namespace: Option<String>,

    /// Policy mode under which failures produce drafts.
    pub accepted_mode: String,

    /// Base delay before an indeterminate or failed key is retried. Never 0.
    pub requeue_interval_ms: u64,

    /// Requeue delays are spread by +/- this percentage (0..=100).
    pub max_jitter_percent: u32,

    /// Number of concurrent reconcile workers.
    pub worker_concurrency: usize,

    /// Deadline for a single store call.
    pub store_timeout_ms: u64,

    /// Interval of the pass that re-enqueues every known key. 0 disables it.
    pub reconfirm_interval_secs: u64,

    /// Ownership-chain table used to build draft target kinds.
    pub kind_expansion: KindExpansion,
}

impl ReconcilerConfig {
    /// Minimal configuration with defaults for everything except the accepted mode.
    pub fn new(accepted_mode: impl Into<String>) -> Self {
        Self {
            target_categories: BTreeSet::new(),
            target_workloads: BTreeSet::new(),
            exclude_namespaces: BTreeSet::new(),
            destination_namespace: None,
            accepted_mode: accepted_mode.into(),
            requeue_interval_ms: DEFAULT_REQUEUE_INTERVAL_SECS * 1000,
            max_jitter_percent: DEFAULT_MAX_JITTER_PERCENT,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            reconfirm_interval_secs: DEFAULT_RECONFIRM_INTERVAL_SECS,
            kind_expansion: KindExpansion::default(),
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    ///
    /// Tests supply variables this way without touching process-global state.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let accepted_mode = reader("POLEX_ACCEPTED_MODE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingVar("POLEX_ACCEPTED_MODE".into()))?;

        let destination_namespace = reader("POLEX_DESTINATION_NAMESPACE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let mut kind_expansion = KindExpansion::default();
        if let Ok(raw) = reader("POLEX_KIND_CHILDREN") {
            for pair in split_list(&raw) {
                let (kind, child) = pair
                    .split_once('=')
                    .map(|(k, c)| (k.trim(), c.trim()))
                    .filter(|(k, c)| !k.is_empty() && !c.is_empty())
                    .ok_or_else(|| {
                        ConfigError::InvalidValue(
                            "POLEX_KIND_CHILDREN".into(),
                            format!("expected Kind=Child, got '{pair}'"),
                        )
                    })?;
                kind_expansion = kind_expansion.with_child(kind, child);
            }
        }

        let config = Self {
            target_categories: read_list(&reader, "POLEX_TARGET_CATEGORIES"),
            target_workloads: read_list(&reader, "POLEX_TARGET_WORKLOADS"),
            exclude_namespaces: read_list(&reader, "POLEX_EXCLUDE_NAMESPACES"),
            destination_namespace,
            accepted_mode,
            requeue_interval_ms: read_number::<_, u64>(
                &reader,
                "POLEX_REQUEUE_INTERVAL_SECS",
                DEFAULT_REQUEUE_INTERVAL_SECS,
            )?
            .saturating_mul(1000),
            max_jitter_percent: read_number(
                &reader,
                "POLEX_MAX_JITTER_PERCENT",
                DEFAULT_MAX_JITTER_PERCENT,
            )?,
            worker_concurrency: read_number(
                &reader,
                "POLEX_WORKER_CONCURRENCY",
                DEFAULT_WORKER_CONCURRENCY,
            )?,
            store_timeout_ms: read_number(
                &reader,
                "POLEX_STORE_TIMEOUT_MS",
                DEFAULT_STORE_TIMEOUT_MS,
            )?,
            reconfirm_interval_secs: read_number(
                &reader,
                "POLEX_RECONFIRM_INTERVAL_SECS",
                DEFAULT_RECONFIRM_INTERVAL_SECS,
            )?,
            kind_expansion,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accepted_mode.trim().is_empty() {
            return Err(ConfigError::MissingVar("POLEX_ACCEPTED_MODE".into()));
        }
        if self.max_jitter_percent > 100 {
            return Err(ConfigError::InvalidValue(
                "POLEX_MAX_JITTER_PERCENT".into(),
                format!("{} is outside 0..=100", self.max_jitter_percent),
            ));
        }
        if self.requeue_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "POLEX_REQUEUE_INTERVAL_SECS".into(),
                "must be greater than zero".into(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "POLEX_WORKER_CONCURRENCY".into(),
                "must be at least 1".into(),
            ));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "POLEX_STORE_TIMEOUT_MS".into(),
                "must be at least 1".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_target_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_target_workloads<I, S>(mut self, workloads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_workloads = workloads.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_exclude_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_destination_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.destination_namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn with_requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_max_jitter_percent(mut self, percent: u32) -> Self {
        self.max_jitter_percent = percent;
        self
    }

    #[must_use]
    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers;
        self
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub fn with_reconfirm_interval(mut self, interval: Duration) -> Self {
        self.reconfirm_interval_secs = interval.as_secs();
        self
    }

    #[must_use]
    pub fn with_kind_expansion(mut self, table: KindExpansion) -> Self {
        self.kind_expansion = table;
        self
    }

    /// Base requeue delay.
    #[must_use]
    pub fn requeue_interval(&self) -> Duration {
        Duration::from_millis(self.requeue_interval_ms)
    }

    /// Store call deadline.
    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Reconfirmation cadence, `None` when disabled.
    #[must_use]
    pub fn reconfirm_interval(&self) -> Option<Duration> {
        (self.reconfirm_interval_secs > 0).then(|| Duration::from_secs(self.reconfirm_interval_secs))
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn read_list<F>(reader: &F, key: &str) -> BTreeSet<String>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    reader(key)
        .map(|raw| split_list(&raw).map(str::to_string).collect())
        .unwrap_or_default()
}

fn read_number<F, T>(reader: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match reader(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string())),
        _ => Ok(default),
    }
}
