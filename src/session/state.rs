//! Session state axes.
//!
//! Two independent axes describe a session: the model lifecycle and the
//! generation lifecycle.  Each axis is a `watch` channel (latest state, for
//! status displays) plus an entry in the shared `broadcast` event log (every
//! transition, in order, for subscribers that keep up).  Transitions outside
//! the tables below are refused and leave the axis untouched.

use std::fmt;

use tokio::sync::{broadcast, watch};
use tracing::trace;

use super::types::{GenerationId, ModelInfo};
use crate::error::SessionError;

/// Event log capacity.  Lagging subscribers skip ahead; the watch channels
/// still carry the final state.
pub const EVENT_CAPACITY: usize = 256;

// ── States ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelState {
    NoModel,
    Loading,
    Loaded,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationState {
    Idle,
    Generating,
    Error,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelState::NoModel => "no-model",
            ModelState::Loading => "loading",
            ModelState::Loaded => "loaded",
            ModelState::Error => "error",
        })
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GenerationState::Idle => "idle",
            GenerationState::Generating => "generating",
            GenerationState::Error => "error",
        })
    }
}

/// A state with an exhaustive transition table.
pub trait AxisState: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    fn allows(self, next: Self) -> bool;
    fn changed(from: Self, to: Self) -> SessionEvent;
}

impl AxisState for ModelState {
    fn allows(self, next: Self) -> bool {
        use ModelState::*;
        matches!(
            (self, next),
            (NoModel, Loading)
                | (Loading, Loaded)
                | (Loading, Error)
                | (Loading, NoModel)
                | (Loaded, NoModel)
                | (Loaded, Error)
                | (Error, Loading)
                | (Error, NoModel)
        )
    }

    fn changed(from: Self, to: Self) -> SessionEvent {
        SessionEvent::ModelState { from, to }
    }
}

impl AxisState for GenerationState {
    fn allows(self, next: Self) -> bool {
        use GenerationState::*;
        matches!(
            (self, next),
            (Idle, Generating) | (Generating, Idle) | (Generating, Error) | (Error, Idle)
        )
    }

    fn changed(from: Self, to: Self) -> SessionEvent {
        SessionEvent::GenerationState { from, to }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Everything observable about a session, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ModelState { from: ModelState, to: ModelState },
    GenerationState { from: GenerationState, to: GenerationState },
    ModelLoaded(ModelInfo),
    LoadFailed(SessionError),
    GenerationStarted { id: GenerationId, message_id: u64 },
    GenerationResolved { id: GenerationId, outcome: &'static str },
}

// ── Axis ──────────────────────────────────────────────────────────────────────

/// One observable state axis.
#[derive(Debug)]
pub struct StateAxis<S> {
    state: watch::Sender<S>,
    events: broadcast::Sender<SessionEvent>,
}

impl<S: AxisState> StateAxis<S> {
    pub fn new(initial: S, events: broadcast::Sender<SessionEvent>) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state, events }
    }

    pub fn get(&self) -> S {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.state.subscribe()
    }

    /// Move to `to` if the table allows it.  On refusal returns the current state.
    pub fn transition(&self, to: S) -> Result<S, S> {
        let mut from = None;
        self.state.send_if_modified(|cur| {
            if cur.allows(to) {
                from = Some(*cur);
                *cur = to;
                true
            } else {
                false
            }
        });
        match from {
            Some(from) => {
                trace!(%from, %to, "state transition");
                // No receivers is fine; the watch channel holds the state.
                let _ = self.events.send(S::changed(from, to));
                Ok(from)
            }
            None => Err(self.get()),
        }
    }
}

// ── Machine ───────────────────────────────────────────────────────────────────

/// Both axes plus the shared event log.
#[derive(Debug)]
pub struct SessionStateMachine {
    pub model: StateAxis<ModelState>,
    pub generation: StateAxis<GenerationState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateMachine {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            model: StateAxis::new(ModelState::NoModel, events.clone()),
            generation: StateAxis::new(GenerationState::Idle, events.clone()),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
