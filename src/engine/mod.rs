//! Purchase engine: per-target scheduling, admission control, quantity
//! reservation and preflight memoization.

pub mod limits;
pub mod preflight;
pub mod reservation;
pub mod scheduler;

pub use limits::{AccountLock, AccountRing, InFlightBound, RateLimiters};
pub use preflight::{PreflightBackoff, PreflightCache};
pub use reservation::ReservationLedger;
pub use scheduler::{Engine, EngineBuilder};
