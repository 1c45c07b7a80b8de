//! Dispatch engine: per-delivery state machine and the consumer pool.

pub mod control;
pub mod dispatch;

pub use control::{ControlConfig, ControlPlane};
pub use dispatch::{Disposition, Dispatcher};
