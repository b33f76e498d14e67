pub mod access;
pub mod clock;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod outcome;

pub use access::{AccessReason, PermissionDecision};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use error::CoreError;
pub use ids::*;
pub use metrics::ContentMetrics;
pub use outcome::SessionOutcome;
