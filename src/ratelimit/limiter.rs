//! Limiter construction and the check pipeline.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace};

use super::key::{Identity, KeyCodec};
use super::options::LimiterOptions;
use super::policy::{Decision, DecisionPolicy};
use super::tracker::WindowTracker;
use crate::config::LimiterDefaults;
use crate::error::Result;
use crate::store::CounterStore;

/// A fixed-window rate limiter.
///
/// Settings are validated and frozen at construction. Window state lives in
/// the counter store only, so a limiter can be shared freely between tasks
/// and any number of processes can share the same windows.
pub struct Limiter {
    name: String,
    codec: KeyCodec,
    tracker: WindowTracker,
    policy: DecisionPolicy,
}

impl Limiter {
    /// Create a limiter, filling unset options from the built-in defaults.
    pub fn new(name: &str, options: LimiterOptions) -> Result<Self> {
        Self::with_defaults(name, options, &LimiterOptions::from(&LimiterDefaults::default()))
    }

    /// Create a limiter, filling unset options from `defaults`.
    pub fn with_defaults(
        name: &str,
        options: LimiterOptions,
        defaults: &LimiterOptions,
    ) -> Result<Self> {
        let resolved = options.merged_over(defaults).resolve()?;
        let codec = KeyCodec::new(name, resolved.namespace.as_deref())?;

        debug!(
            name = %name,
            prefix = %codec.prefix(),
            limit = resolved.limit,
            period_ms = resolved.period.as_millis() as u64,
            delay_ms = resolved.delay.as_millis() as u64,
            "Limiter created"
        );

        Ok(Self {
            name: name.to_string(),
            codec,
            tracker: WindowTracker::new(resolved.store, resolved.period),
            policy: DecisionPolicy::new(resolved.limit, resolved.delay),
        })
    }

    /// The limiter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The part shared by every key of this limiter.
    pub fn prefix(&self) -> &str {
        self.codec.prefix()
    }

    /// Trials allowed per window.
    pub fn limit(&self) -> i64 {
        self.policy.limit()
    }

    /// Window length.
    pub fn period(&self) -> Duration {
        self.tracker.period()
    }

    /// Wait applied per excess trial.
    pub fn delay(&self) -> Duration {
        self.policy.delay()
    }

    /// Record a trial for `identity` and decide whether it may proceed.
    ///
    /// With a delay configured, a caller over the limit is suspended for
    /// `excess * delay` before the decision is returned.
    #[instrument(skip(self, identity), fields(limiter = %self.name))]
    pub async fn check(&self, identity: impl Into<Identity>) -> Result<Decision> {
        let key = self.codec.encode(&identity.into())?;
        let state = self.tracker.track(&key).await?;

        trace!(
            key = %key,
            count = state.count,
            reset_ms = state.reset.as_millis() as u64,
            "Trial recorded"
        );

        let decision = self.policy.decide(state).await;
        if decision.remaining < 0 {
            debug!(
                key = %key,
                remaining = decision.remaining,
                throttled = decision.uses_delay,
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }

    /// Run [`check`](Self::check) and hand the outcome to `callback`.
    pub async fn check_with_callback<F>(&self, identity: impl Into<Identity>, callback: F)
    where
        F: FnOnce(Result<Decision>),
    {
        callback(self.check(identity).await)
    }

    /// Run a check on a background task and hand the outcome to `callback`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_check<F>(self: &Arc<Self>, identity: impl Into<Identity>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Decision>) + Send + 'static,
    {
        let limiter = Arc::clone(self);
        let identity = identity.into();
        tokio::spawn(async move {
            callback(limiter.check(identity).await);
        })
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.name)
            .field("prefix", &self.codec.prefix())
            .field("limit", &self.policy.limit())
            .field("period", &self.tracker.period())
            .field("delay", &self.policy.delay())
            .finish()
    }
}

/// Builds limiters from a shared, replaceable set of defaults.
///
/// Replacing the defaults only affects limiters created afterwards.
pub struct LimiterFactory {
    defaults: RwLock<LimiterOptions>,
}

impl LimiterFactory {
    /// Create a factory starting from `defaults`.
    pub fn new(defaults: &LimiterDefaults) -> Self {
        Self {
            defaults: RwLock::new(LimiterOptions::from(defaults)),
        }
    }

    /// Create a factory whose limiters default to `store`.
    pub fn with_store(defaults: &LimiterDefaults, store: Arc<dyn CounterStore>) -> Self {
        let factory = Self::new(defaults);
        factory.defaults.write().store = Some(store);
        factory
    }

    /// Merge `options` over the current defaults.
    pub fn set_defaults(&self, options: LimiterOptions) {
        let mut defaults = self.defaults.write();
        *defaults = options.merged_over(&*defaults);
    }

    /// A copy of the current defaults.
    pub fn defaults(&self) -> LimiterOptions {
        self.defaults.read().clone()
    }

    /// Create a limiter, filling unset options from the current defaults.
    pub fn create(&self, name: &str, options: LimiterOptions) -> Result<Limiter> {
        let defaults = self.defaults.read().clone();
        Limiter::with_defaults(name, options, &defaults)
    }
}

impl Default for LimiterFactory {
    fn default() -> Self {
        Self::new(&LimiterDefaults::default())
    }
}
