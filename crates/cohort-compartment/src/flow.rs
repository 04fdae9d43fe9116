//! Upstream flow control.

/// Receives pause/resume signals from a compartment whose queue crossed its
/// watermarks.
pub trait FlowController: Send + Sync {
    /// Ask upstream producers to pause.
    fn lock_flow(&self);

    /// Allow upstream producers to resume.
    fn unlock_flow(&self);
}

/// Flow controller that ignores all signals.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFlowController;

impl FlowController for NoFlowController {
    fn lock_flow(&self) {}

    fn unlock_flow(&self) {}
}
