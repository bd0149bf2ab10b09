//! Fixed-window rate limiting.
//!
//! A check runs through four stages: the identity is turned into a window
//! key, the [`WindowTracker`] records the trial in the counter store, and
//! the [`DecisionPolicy`] turns the window count into a [`Decision`].

mod key;
mod limiter;
mod options;
mod policy;
mod tracker;

pub use key::{is_valid_segment, Identity, KeyCodec, Token, WindowKey, SEPARATOR};
pub use limiter::{Limiter, LimiterFactory};
pub use options::{LimiterOptions, Namespace, ResolvedOptions};
pub use policy::{Decision, DecisionPolicy};
pub use tracker::{WindowState, WindowTracker};
