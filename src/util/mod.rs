//! Shared utilities.

pub mod clock;
pub mod encoding;
pub mod telemetry;

pub use clock::*;
pub use encoding::*;
pub use telemetry::*;
