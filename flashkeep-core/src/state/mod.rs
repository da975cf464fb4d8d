//! Controller state machine
//!
//! The coordinator's controller state is explicit and finite. Every change
//! goes through [`ControllerState::transition`].

pub mod events;
pub mod machine;

pub use events::ControllerEvent;
pub use machine::{ControllerState, ErrorKind};
