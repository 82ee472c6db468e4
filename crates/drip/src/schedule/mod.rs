//! Scheduling primitives
//!
//! - [`BusinessHours`] - pushes instants outside the local delivery window forward
//! - [`DelayRange`] - `"<min> to <max>"` ranges delays are drawn from

mod business_hours;
mod delay;

pub use business_hours::{BusinessHours, InvalidWindow};
pub use delay::{DelayRange, DelayRangeError, MAX_DELAY_SECS};
