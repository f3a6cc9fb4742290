//! Scavenge run context injection
//!
//! This module provides thread-local storage for the scavenge run a thread is
//! working on, so that every log entry of a run can be tied back to its
//! scavenge point and phase.

use std::cell::RefCell;

use tracing::{Span, field, info_span};
use uuid::Uuid;

/// Name of the span entered for each scavenge phase
pub const PHASE_SPAN: &str = "phase";

/// Scavenge context data stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScavengeContextData {
    /// Unique ID of this run (a resumed scavenge gets a new one)
    pub run_id: Uuid,
    /// Event number of the scavenge point being processed
    pub scavenge_point: u64,
    /// Phase the run is currently in
    pub phase: Option<&'static str>,
}

thread_local! {
    static SCAVENGE_CONTEXT: RefCell<Option<ScavengeContextData>> = const { RefCell::new(None) };
}

/// RAII guard for scavenge context
///
/// When this guard is created, it sets the scavenge context for the current
/// thread. When it's dropped, it restores the previous context (if any).
///
/// # Example
///
/// ```ignore
/// use tidelog_logging::context::ScavengeContextGuard;
///
/// let _run = ScavengeContextGuard::new(sp.event_number);
/// let _phase = ScavengeContextGuard::enter_phase("calculating");
/// tracing::info!("Calculating discard points");
/// ```
pub struct ScavengeContextGuard {
    previous: Option<ScavengeContextData>,
}

impl ScavengeContextGuard {
    /// Start a new run context for a scavenge point
    pub fn new(scavenge_point: u64) -> Self {
        Self::with_data(ScavengeContextData {
            run_id: Uuid::new_v4(),
            scavenge_point,
            phase: None,
        })
    }

    /// Install a specific context, e.g. one captured on another thread
    pub fn with_data(data: ScavengeContextData) -> Self {
        let previous = SCAVENGE_CONTEXT.with(|ctx| ctx.replace(Some(data)));
        Self { previous }
    }

    /// Narrow the current run context to a phase
    ///
    /// Without an active run context the phase is recorded against a fresh
    /// run ID.
    pub fn enter_phase(phase: &'static str) -> Self {
        let data = match Self::current() {
            Some(current) => ScavengeContextData {
                phase: Some(phase),
                ..current
            },
            None => ScavengeContextData {
                run_id: Uuid::new_v4(),
                scavenge_point: 0,
                phase: Some(phase),
            },
        };
        Self::with_data(data)
    }

    /// Get the current scavenge context (if any)
    pub fn current() -> Option<ScavengeContextData> {
        SCAVENGE_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    /// Get the current run ID (if set)
    pub fn current_run_id() -> Option<Uuid> {
        Self::current().map(|ctx| ctx.run_id)
    }

    /// Get the current phase (if set)
    pub fn current_phase() -> Option<&'static str> {
        Self::current().and_then(|ctx| ctx.phase)
    }
}

impl Drop for ScavengeContextGuard {
    fn drop(&mut self) {
        SCAVENGE_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

/// Span around the work of one phase on the current thread
///
/// Records the phase name and, when a run context is installed, the run ID
/// and scavenge point, so JSONL records of every thread of a run carry them.
/// Per-phase level overrides match this span.
pub fn phase_span(phase: &'static str) -> Span {
    let span = info_span!(
        PHASE_SPAN,
        phase,
        run_id = field::Empty,
        scavenge_point = field::Empty
    );
    if let Some(ctx) = ScavengeContextGuard::current() {
        span.record("run_id", field::display(ctx.run_id));
        span.record("scavenge_point", ctx.scavenge_point);
    }
    span
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scavenge_context_guard() {
        // No context initially
        assert!(ScavengeContextGuard::current().is_none());

        {
            let _guard = ScavengeContextGuard::new(7);

            let ctx = ScavengeContextGuard::current().unwrap();
            assert_eq!(ctx.scavenge_point, 7);
            assert!(ctx.phase.is_none());
        }

        // Context should be cleared after guard drops
        assert!(ScavengeContextGuard::current().is_none());
    }

    #[test]
    fn test_phase_keeps_run_id() {
        let _run = ScavengeContextGuard::new(3);
        let run_id = ScavengeContextGuard::current_run_id().unwrap();

        {
            let _phase = ScavengeContextGuard::enter_phase("accumulating");
            assert_eq!(ScavengeContextGuard::current_phase(), Some("accumulating"));
            assert_eq!(ScavengeContextGuard::current_run_id(), Some(run_id));
        }

        // Should restore the run context after the phase guard drops
        assert!(ScavengeContextGuard::current_phase().is_none());
        assert_eq!(ScavengeContextGuard::current_run_id(), Some(run_id));
    }

    #[test]
    fn test_with_data_crosses_threads() {
        let _run = ScavengeContextGuard::new(9);
        let captured = ScavengeContextGuard::current().unwrap();

        std::thread::spawn(move || {
            assert!(ScavengeContextGuard::current().is_none());
            let _guard = ScavengeContextGuard::with_data(captured.clone());
            assert_eq!(ScavengeContextGuard::current(), Some(captured));
        })
        .join()
        .unwrap();
    }
}
