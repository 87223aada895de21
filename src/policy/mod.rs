//! Policy components: admission, adaptation, expiration, and pacing.

pub mod admission;
pub mod climber;
pub mod expiration;
pub mod pacer;

pub use admission::TinyLfu;
pub use climber::HillClimber;
pub use expiration::{ExpirationPolicy, EXPIRE_WRITE_TOLERANCE};
pub use pacer::Pacer;
