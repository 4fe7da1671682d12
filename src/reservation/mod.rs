//! Reservation lifecycle: state machine, registry and controller.

pub mod controller;
pub mod state;

pub use controller::{CleanupReport, LifecycleController, StopOutcome};
pub use state::{BoundPorts, LifecycleState, Reservation, ReservationRegistry, TestRunHandle};
