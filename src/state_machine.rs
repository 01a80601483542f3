//! Random chat session state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions.
//! The runtime feeds events in and executes the returned effects.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;


pub use effect::{Effect, SearchTimer};
pub use event::Event;
pub use state::{
    AttemptId, CallMedia, ChatMessage, ChatMode, ChatStatus, Episode, FaceVerification, GateState,
    SearchStage, Sender, SessionContext, SessionPhase, SessionState,
};
pub use transition::{transition, TransitionError, TransitionResult};
