//! Multi-step progress and cancellation feedback.
//!
//! A [`MultiStepFeedback`] tracks a fixed set of named, weighted steps for
//! one publish run. Each step is driven by the worker that executes it;
//! the aggregate (overall progress, overall state, first failure) is
//! derived on demand and broadcast to subscribers as a
//! [`FeedbackSnapshot`] over a `watch` channel.
//!
//! ## Cancellation
//!
//! Cancellation is advisory. [`MultiStepFeedback::cancel`] marks every
//! non-terminal step `cancelled` and trips the run's [`CancellationToken`];
//! workers observe the token at their own checkpoints (before a layer,
//! before an upload part, before finalize) and stop there. Once the run
//! has entered its commit point ([`MultiStepFeedback::enter_commit`]),
//! cancellation is ignored.
//!
//! ```text
//!   begin(steps) ──► pending ──report_progress──► running ──complete_step──► succeeded
//!                       │                            │
//!                       │                            └──fail_step──► failed ──► siblings cancelled
//!                       └──────── cancel() ─────────────────────────► cancelled
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::DomainError;

// ============================================================================
// Step and overall state
// ============================================================================

/// Lifecycle state of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepState {
    /// Returns true for `succeeded`, `failed` and `cancelled`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Cancelled
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Aggregate state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for OverallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallState::Running => "running",
            OverallState::Succeeded => "succeeded",
            OverallState::Failed => "failed",
            OverallState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One named unit of work within a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackStep {
    pub name: String,
    pub weight: f64,
    /// Fraction complete, always within `[0, 1]` and never decreasing
    pub progress: f64,
    pub state: StepState,
    /// Failure message, set only when `state` is `failed`
    pub error: Option<String>,
}

/// Point-in-time view of a run, as broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackSnapshot {
    pub steps: Vec<FeedbackStep>,
    pub overall_progress: f64,
    pub overall_state: OverallState,
    pub cancel_requested: bool,
}

// ============================================================================
// MultiStepFeedback
// ============================================================================

#[derive(Default)]
struct Inner {
    steps: Vec<FeedbackStep>,
    index: HashMap<String, usize>,
    cancel_requested: bool,
    committed: bool,
    first_failure: Option<usize>,
}

impl Inner {
    fn position(&self, name: &str) -> Result<usize, DomainError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| DomainError::UnknownStep(name.to_string()))
    }

    fn overall_state(&self) -> OverallState {
        if self.first_failure.is_some() {
            return OverallState::Failed;
        }
        if !self.steps.is_empty() && self.steps.iter().all(|s| s.state == StepState::Succeeded) {
            return OverallState::Succeeded;
        }
        if self.cancel_requested {
            return OverallState::Cancelled;
        }
        OverallState::Running
    }

    fn overall_progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let total_weight: f64 = self.steps.iter().map(|s| s.weight).sum();
        if total_weight <= 0.0 {
            let sum: f64 = self.steps.iter().map(|s| s.progress).sum();
            return sum / self.steps.len() as f64;
        }
        let weighted: f64 = self.steps.iter().map(|s| s.weight * s.progress).sum();
        (weighted / total_weight).clamp(0.0, 1.0)
    }

    fn cancel_open_steps(&mut self) {
        for step in self.steps.iter_mut().filter(|s| !s.state.is_terminal()) {
            step.state = StepState::Cancelled;
        }
    }

    fn snapshot(&self) -> FeedbackSnapshot {
        FeedbackSnapshot {
            steps: self.steps.clone(),
            overall_progress: self.overall_progress(),
            overall_state: self.overall_state(),
            cancel_requested: self.cancel_requested,
        }
    }
}

/// Progress, cancellation and failure aggregation for one run
///
/// All methods take `&self`; share it behind an `Arc` between the
/// orchestrator and its workers.
pub struct MultiStepFeedback {
    inner: Mutex<Inner>,
    cancel_token: CancellationToken,
    snapshot_tx: watch::Sender<FeedbackSnapshot>,
}

impl MultiStepFeedback {
    /// Creates an empty feedback object with no steps
    pub fn new() -> Self {
        let inner = Inner::default();
        let (snapshot_tx, _) = watch::channel(inner.snapshot());
        Self {
            inner: Mutex::new(inner),
            cancel_token: CancellationToken::new(),
            snapshot_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot_tx.send_replace(inner.snapshot());
    }

    /// Registers the run's steps, all `pending`
    ///
    /// Replaces any previously registered steps. If the run was already
    /// cancelled the steps are created `cancelled`.
    ///
    /// # Errors
    /// Returns `DuplicateStep` if a name repeats and `ValidationFailed`
    /// for a negative or non-finite weight. Nothing is registered on error.
    pub fn begin<I, S>(&self, steps: I) -> Result<(), DomainError>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut list = Vec::new();
        let mut index = HashMap::new();
        for (name, weight) in steps {
            let name = name.into();
            if !weight.is_finite() || weight < 0.0 {
                return Err(DomainError::ValidationFailed(format!(
                    "step '{name}' has invalid weight {weight}"
                )));
            }
            if index.insert(name.clone(), list.len()).is_some() {
                return Err(DomainError::DuplicateStep(name));
            }
            list.push(FeedbackStep {
                name,
                weight,
                progress: 0.0,
                state: StepState::Pending,
                error: None,
            });
        }

        let mut inner = self.lock();
        inner.steps = list;
        inner.index = index;
        inner.first_failure = None;
        inner.committed = false;
        if inner.cancel_requested {
            inner.cancel_open_steps();
        }
        debug!(steps = inner.steps.len(), "Feedback steps registered");
        self.publish(&inner);
        Ok(())
    }

    /// Marks a pending step `running` without changing its progress
    pub fn start_step(&self, name: &str) -> Result<(), DomainError> {
        let mut inner = self.lock();
        let pos = inner.position(name)?;
        let step = &mut inner.steps[pos];
        if step.state == StepState::Pending {
            step.state = StepState::Running;
            self.publish(&inner);
        }
        Ok(())
    }

    /// Records progress for a step
    ///
    /// The fraction is clamped into `[0, 1]` and never moves backwards.
    /// The first report moves the step from `pending` to `running`.
    /// Reports for terminal steps are ignored.
    ///
    /// # Errors
    /// Returns `UnknownStep` if the name was not registered.
    pub fn report_progress(&self, name: &str, fraction: f64) -> Result<(), DomainError> {
        let mut inner = self.lock();
        let pos = inner.position(name)?;
        let step = &mut inner.steps[pos];
        if step.state.is_terminal() {
            return Ok(());
        }
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        step.progress = step.progress.max(fraction);
        step.state = StepState::Running;
        self.publish(&inner);
        Ok(())
    }

    /// Marks a step `succeeded` with full progress
    ///
    /// No-op if the step already reached a terminal state (for example it
    /// was cancelled while its worker was finishing).
    pub fn complete_step(&self, name: &str) -> Result<(), DomainError> {
        let mut inner = self.lock();
        let pos = inner.position(name)?;
        let step = &mut inner.steps[pos];
        if step.state.is_terminal() {
            debug!(step = name, state = %step.state, "Ignoring completion of terminal step");
            return Ok(());
        }
        step.state = StepState::Succeeded;
        step.progress = 1.0;
        self.publish(&inner);
        Ok(())
    }

    /// Marks a step `failed`
    ///
    /// The first failure wins: it cancels every other non-terminal step and
    /// trips the run's cancellation token. Failing a step that is already
    /// terminal is ignored.
    pub fn fail_step(&self, name: &str, error: impl fmt::Display) -> Result<(), DomainError> {
        let mut inner = self.lock();
        let pos = inner.position(name)?;
        if inner.steps[pos].state.is_terminal() {
            debug!(step = name, "Ignoring failure of terminal step");
            return Ok(());
        }

        let message = error.to_string();
        warn!(step = name, error = %message, "Step failed");
        {
            let step = &mut inner.steps[pos];
            step.state = StepState::Failed;
            step.error = Some(message);
        }

        if inner.first_failure.is_none() {
            inner.first_failure = Some(pos);
            inner.cancel_open_steps();
            self.cancel_token.cancel();
        }
        self.publish(&inner);
        Ok(())
    }

    /// Requests cancellation of the run
    ///
    /// Marks all non-terminal steps `cancelled` and trips the cancellation
    /// token. Idempotent, and a no-op once [`enter_commit`](Self::enter_commit)
    /// has succeeded.
    pub fn cancel(&self) {
        let mut inner = self.lock();
        if inner.committed {
            debug!("Cancel ignored: run already committed");
            return;
        }
        if inner.cancel_requested {
            return;
        }
        inner.cancel_requested = true;
        inner.cancel_open_steps();
        self.cancel_token.cancel();
        debug!("Run cancellation requested");
        self.publish(&inner);
    }

    /// Enters the run's commit point
    ///
    /// Returns `false` if the run was cancelled or has failed, in which case
    /// the caller must not commit. After a `true` return, `cancel()` has no
    /// effect.
    pub fn enter_commit(&self) -> bool {
        let mut inner = self.lock();
        if inner.cancel_requested || inner.first_failure.is_some() {
            return false;
        }
        inner.committed = true;
        true
    }

    /// Returns true once the run was cancelled or a step failed
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Returns true if `cancel()` was invoked (as opposed to a failure)
    pub fn cancel_requested(&self) -> bool {
        self.lock().cancel_requested
    }

    /// The run-level cancellation token observed at worker checkpoints
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn overall_state(&self) -> OverallState {
        self.lock().overall_state()
    }

    /// Weighted progress: `Σ(weight × progress) / Σ(weight)`
    pub fn overall_progress(&self) -> f64 {
        self.lock().overall_progress()
    }

    pub fn step(&self, name: &str) -> Option<FeedbackStep> {
        let inner = self.lock();
        inner.index.get(name).map(|&pos| inner.steps[pos].clone())
    }

    pub fn steps(&self) -> Vec<FeedbackStep> {
        self.lock().steps.clone()
    }

    /// Name and message of the first failed step, if any
    pub fn first_failure(&self) -> Option<(String, String)> {
        let inner = self.lock();
        inner.first_failure.map(|pos| {
            let step = &inner.steps[pos];
            (step.name.clone(), step.error.clone().unwrap_or_default())
        })
    }

    pub fn snapshot(&self) -> FeedbackSnapshot {
        self.lock().snapshot()
    }

    /// Subscribes to snapshot updates
    ///
    /// The receiver observes the latest snapshot; intermediate updates may
    /// be coalesced.
    pub fn subscribe(&self) -> watch::Receiver<FeedbackSnapshot> {
        self.snapshot_tx.subscribe()
    }
}

impl Default for MultiStepFeedback {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MultiStepFeedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("MultiStepFeedback")
            .field("steps", &inner.steps.len())
            .field("overall_state", &inner.overall_state())
            .field("cancel_requested", &inner.cancel_requested)
            .field("committed", &inner.committed)
            .finish()
    }
}
