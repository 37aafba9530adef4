//! Job orchestration: dispatch, the chapter barrier, status folding and
//! re-dispatch of undispatched jobs.

pub mod aggregator;
pub mod dispatcher;
pub mod gate;
pub mod reconciler;

pub use aggregator::{RecomputeOutcome, StatusAggregator};
pub use dispatcher::{DispatchOutcome, WorkDispatcher};
pub use gate::{ChapterCompletionGate, GateOutcome};
pub use reconciler::{ReconcileReport, Reconciler};
