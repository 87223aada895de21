//! Core data structures: event buffers, order deques, the frequency sketch,
//! and the timer wheel.

pub mod buffer;
pub mod deque;
pub mod sketch;
pub mod timer_wheel;

pub use buffer::{OfferResult, ReadBuffer, WriteBuffer};
pub use deque::{Lane, NodeArena, OrderDeque, SlotId};
pub use sketch::FrequencySketch;
pub use timer_wheel::{TimerEntry, TimerWheel};
