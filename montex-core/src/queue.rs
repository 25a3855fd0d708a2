//! The serialized action queue consumed by the composition's update task.
//!
//! Everything that touches the object lists or the active stack is
//! expressed as an [`Action`] and executed one at a time on the dedicated
//! controller thread. Enqueueing is cheap and thread-safe; the queue also
//! carries the task's running/paused flags so the pause-and-resume
//! protocol and cooperative shutdown share one condvar.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::composition::UpdateReason;
use crate::flow::{Event, EventPayload, Seqnum};
use crate::object::TimedObject;

/// A unit of controller work.
#[derive(Clone)]
pub enum Action {
    /// Translate pending timing to live for every object, reconcile
    /// pending adds/removes and update the stack if needed.
    Commit { seqnum: Seqnum },
    /// Recompute the stack for the current playhead.
    Update { seqnum: Seqnum, reason: UpdateReason },
    /// Apply a seek event coming from downstream (or the stored
    /// stack-initialization seek).
    Seek { event: Event },
    /// First transition from stopped to ready-to-play.
    InitializeStack { seqnum: Seqnum },
    AddObject { object: Arc<TimedObject> },
    RemoveObject { object: Arc<TimedObject> },
    /// Raise the `committed` signal now that the stack is ready.
    EmitCommitted { changed: bool },
}

/// Discriminant of [`Action`], used for targeted removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Commit,
    Update,
    Seek,
    InitializeStack,
    AddObject,
    RemoveObject,
    EmitCommitted,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Commit { .. } => ActionKind::Commit,
            Action::Update { .. } => ActionKind::Update,
            Action::Seek { .. } => ActionKind::Seek,
            Action::InitializeStack { .. } => ActionKind::InitializeStack,
            Action::AddObject { .. } => ActionKind::AddObject,
            Action::RemoveObject { .. } => ActionKind::RemoveObject,
            Action::EmitCommitted { .. } => ActionKind::EmitCommitted,
        }
    }

    fn seek_seqnum(&self) -> Option<Seqnum> {
        match self {
            Action::Seek { event } => Some(event.seqnum),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Commit { seqnum } => write!(f, "commit({seqnum})"),
            Action::Update { seqnum, reason } => write!(f, "update({seqnum}, {reason})"),
            Action::Seek { event } => write!(f, "seek({})", event.seqnum),
            Action::InitializeStack { seqnum } => write!(f, "initialize-stack({seqnum})"),
            Action::AddObject { object } => write!(f, "add-object({})", object.name()),
            Action::RemoveObject { object } => write!(f, "remove-object({})", object.name()),
            Action::EmitCommitted { changed } => write!(f, "emit-committed({changed})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionPriority {
    Default,
    High,
}

struct QueueInner {
    items: VecDeque<Action>,
    running: bool,
    paused: bool,
    /// Seqnum of the seek action currently executing, for idempotence.
    current_seek: Option<Seqnum>,
}

pub struct ActionQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ActionQueue")
            .field("len", &inner.items.len())
            .field("running", &inner.running)
            .field("paused", &inner.paused)
            .finish()
    }
}

impl ActionQueue {
    pub fn new() -> ActionQueue {
        ActionQueue {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                running: false,
                paused: false,
                current_seek: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, priority: ActionPriority, action: Action) {
        let mut inner = self.inner.lock();
        trace!(?action, ?priority, pending = inner.items.len(), "queueing action");
        match priority {
            ActionPriority::High => inner.items.push_front(action),
            ActionPriority::Default => inner.items.push_back(action),
        }
        self.cond.notify_all();
    }

    /// Queue a seek unless one with the same seqnum is already queued, in
    /// flight, or was the most recently scheduled one (`next_eos`).
    /// Returns whether the seek was accepted.
    pub fn push_seek_idempotent(&self, event: Event, next_eos: Seqnum) -> bool {
        debug_assert!(matches!(event.payload, EventPayload::Seek(_)));
        let mut inner = self.inner.lock();
        let seqnum = event.seqnum;
        if next_eos.is_some() && seqnum == next_eos {
            debug!(%seqnum, "dropping seek, same seqnum as scheduled one");
            return false;
        }
        if inner
            .items
            .iter()
            .any(|action| action.seek_seqnum() == Some(seqnum))
        {
            debug!(%seqnum, "dropping seek, already queued");
            return false;
        }
        if inner.current_seek == Some(seqnum) {
            debug!(%seqnum, "dropping seek, currently being handled");
            return false;
        }
        inner.items.push_back(Action::Seek { event });
        self.cond.notify_all();
        true
    }

    /// Strip every queued action of the given kind. Used to coalesce
    /// queued updates when a fresh seek arrives.
    pub fn remove_kind(&self, kind: ActionKind) {
        let mut inner = self.inner.lock();
        let before = inner.items.len();
        inner.items.retain(|action| action.kind() != kind);
        let removed = before - inner.items.len();
        if removed > 0 {
            debug!(?kind, removed, "removed queued actions");
        }
    }

    pub fn set_running(&self, running: bool) {
        let mut inner = self.inner.lock();
        inner.running = running;
        if running {
            inner.paused = false;
        }
        self.cond.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Park the consumer after the current action completes; items keep
    /// queueing up meanwhile.
    pub fn pause(&self) {
        self.inner.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.paused = false;
        self.cond.notify_all();
    }

    /// Block for the next action. Returns `None` once the queue stops
    /// running.
    pub fn wait_next(&self) -> Option<Action> {
        let mut inner = self.inner.lock();
        loop {
            if !inner.running {
                return None;
            }
            if !inner.paused {
                if let Some(action) = inner.items.pop_front() {
                    inner.current_seek = action.seek_seqnum();
                    return Some(action);
                }
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Clear the current-action slot once its execution finished.
    pub fn finish_current(&self) {
        self.inner.lock().current_seek = None;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}
