//! Voice call flow: TwiML rendering and the question state machine.

pub mod flow;
pub mod twiml;

pub use flow::{Capture, Question, VoiceFlow};
