//! Structured tracing of reclamation activity.
//!
//! When the `tracing` feature is enabled, this module provides spans and
//! events for collection passes, review rounds, and epoch advances. Call
//! sites are feature-gated; with the feature off this module is empty.

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use tracing::{span, Level};

    /// Span covering one collection pass on a core.
    pub fn trace_collect(core: usize) -> span::EnteredSpan {
        span!(Level::DEBUG, "collect", core).entered()
    }

    /// Span covering one full review-token circulation.
    pub fn trace_review_round() -> span::EnteredSpan {
        span!(Level::DEBUG, "review_round").entered()
    }

    /// Log a successful global epoch advance.
    pub fn log_epoch_advance(epoch: u64) {
        tracing::debug!(epoch, "epoch_advance");
    }

    /// Log a completed eager transition.
    pub fn log_eagerify() {
        tracing::trace!("eagerify");
    }
}
