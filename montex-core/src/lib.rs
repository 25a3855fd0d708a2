//! Non-linear composition engine for streaming media timelines.
//!
//! A [`Composition`] holds a set of time-placed, priority-ordered
//! [`TimedObject`]s (sources and operations) and exposes a single output
//! pad whose stream is the time-ordered concatenation of those objects. As
//! the playhead crosses object boundaries, or whenever the timeline is
//! mutated or seeked, the engine tears down the currently active object
//! graph (the *stack*), builds the next one and re-primes it with an
//! initializing seek so that playback continues seamlessly in the
//! downstream coordinate system.
//!
//! The crate is organized around the parts of that control problem:
//!
//! - [`flow`]: the minimal streaming-plane vocabulary the engine drives,
//!   pads, events, segments, buffers, queries, elements and bins.
//! - [`object`]: timed objects wrapping stream elements, with live and
//!   pending timing.
//! - [`edge`]: the time-translation contract applied at every object
//!   boundary.
//! - [`queue`]: the serialized action queue consumed by the controller.
//! - [`stack`]: selection of the active object tree for a playhead
//!   position.
//! - [`composition`]: the controller state machine tying it all together.

pub mod composition;
pub mod edge;
pub mod flow;
pub mod object;
pub mod queue;
pub mod stack;

pub use composition::{BusMessage, Composition, UpdateReason};
pub use object::{ObjectKind, TimedObject};
