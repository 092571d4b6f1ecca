//! # Pulse Core
//!
//! Shared identifiers, configuration, errors, the clock abstraction and the
//! collaborator traits used by the Pulse schedule engine.

pub mod clock;
pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::PulseConfig;
pub use error::{PulseError, Result};
