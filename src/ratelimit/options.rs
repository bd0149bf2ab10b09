//! Per-limiter options and their validation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LimiterDefaults;
use crate::error::{Result, TollgateError};
use crate::store::CounterStore;

/// A key namespace, given either as text or as a number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Namespace {
    Text(String),
    Number(i64),
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Text(s) => f.write_str(s),
            Namespace::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for Namespace {
    fn from(s: &str) -> Self {
        Namespace::Text(s.to_string())
    }
}

impl From<String> for Namespace {
    fn from(s: String) -> Self {
        Namespace::Text(s)
    }
}

impl From<i64> for Namespace {
    fn from(n: i64) -> Self {
        Namespace::Number(n)
    }
}

impl From<u32> for Namespace {
    fn from(n: u32) -> Self {
        Namespace::Number(n as i64)
    }
}

/// Options for one limiter.
///
/// Every field is optional. Unset fields are filled from a set of defaults
/// when the limiter is built; fields set here always win.
#[derive(Clone, Default)]
pub struct LimiterOptions {
    /// Prefix placed before every key of the limiter
    pub namespace: Option<Namespace>,
    /// Trials allowed per window
    pub limit: Option<i64>,
    /// Window length in milliseconds
    pub period_ms: Option<i64>,
    /// Wait per excess trial in milliseconds; 0 rejects at the limit
    pub delay_ms: Option<i64>,
    /// Store holding the windows
    pub store: Option<Arc<dyn CounterStore>>,
}

impl fmt::Debug for LimiterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterOptions")
            .field("namespace", &self.namespace)
            .field("limit", &self.limit)
            .field("period_ms", &self.period_ms)
            .field("delay_ms", &self.delay_ms)
            .field("store", &self.store.as_ref().map(|_| "<store>"))
            .finish()
    }
}

impl LimiterOptions {
    /// Empty options.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn namespace(mut self, namespace: impl Into<Namespace>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn period_ms(mut self, period_ms: i64) -> Self {
        self.period_ms = Some(period_ms);
        self
    }

    pub fn delay_ms(mut self, delay_ms: i64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fill every unset field from `base`.
    pub fn merged_over(self, base: &LimiterOptions) -> LimiterOptions {
        LimiterOptions {
            namespace: self.namespace.or_else(|| base.namespace.clone()),
            limit: self.limit.or(base.limit),
            period_ms: self.period_ms.or(base.period_ms),
            delay_ms: self.delay_ms.or(base.delay_ms),
            store: self.store.or_else(|| base.store.clone()),
        }
    }

    /// Check every field and produce the settings a limiter runs with.
    pub fn resolve(self) -> Result<ResolvedOptions> {
        let store = self.store.ok_or_else(|| {
            TollgateError::Config("counter store is not defined (options.store)".to_string())
        })?;

        let limit = self.limit.unwrap_or(LimiterDefaults::DEFAULT_LIMIT);
        if limit <= 0 {
            return Err(TollgateError::Config(format!(
                "limit must be greater than 0 (options.limit = {})",
                limit
            )));
        }

        let period_ms = self.period_ms.unwrap_or(LimiterDefaults::DEFAULT_PERIOD_MS);
        if period_ms <= 0 {
            return Err(TollgateError::Config(format!(
                "period must be greater than 0 (options.period_ms = {})",
                period_ms
            )));
        }

        let delay_ms = self.delay_ms.unwrap_or(LimiterDefaults::DEFAULT_DELAY_MS);
        if delay_ms < 0 {
            return Err(TollgateError::Config(format!(
                "delay must be greater than or equal to 0 (options.delay_ms = {})",
                delay_ms
            )));
        }

        Ok(ResolvedOptions {
            namespace: self.namespace.map(|ns| ns.to_string()),
            limit,
            period: Duration::from_millis(period_ms as u64),
            delay: Duration::from_millis(delay_ms as u64),
            store,
        })
    }
}

impl From<&LimiterDefaults> for LimiterOptions {
    fn from(defaults: &LimiterDefaults) -> Self {
        LimiterOptions {
            namespace: Some(Namespace::Text(defaults.namespace.clone())),
            limit: Some(defaults.limit),
            period_ms: Some(defaults.period_ms),
            delay_ms: Some(defaults.delay_ms),
            store: None,
        }
    }
}

/// Validated limiter settings.
#[derive(Clone)]
pub struct ResolvedOptions {
    pub namespace: Option<String>,
    pub limit: i64,
    pub period: Duration,
    pub delay: Duration,
    pub store: Arc<dyn CounterStore>,
}
