//! Shared data model for the Montex composition engine.
//!
//! This crate holds the plain data vocabulary used across the engine:
//! stream-time arithmetic, the live/pending timing state carried by every
//! timed object, seek descriptors and the engine error kinds. It has no
//! threads and no graph machinery; everything here is cheap to copy or
//! clone and (optionally) serde-serializable.

pub mod error;
pub mod seek;
pub mod time;
pub mod timing;

pub use error::{EngineError, Result};
pub use seek::{SeekBound, SeekDescriptor, SeekFlags};
pub use time::StreamTime;
pub use timing::{EXPANDABLE_PRIORITY, Timing, TimingPair};
