use crate::compiler::CompileError;
use crate::link::LinkError;
use crate::session::SessionPhase;
use thiserror::Error;

/// Errors surfaced by a debug session.
///
/// Apart from [`Error::NoSession`] and [`Error::InvalidPhase`], every error tears down the
/// session it occurred in and a fresh start is needed to retry. [`Error::Compile`] is raised
/// before the device is touched.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Compilation failed")]
    Compile(#[from] CompileError),
    #[error("An error occured while talking to the device")]
    Link(#[from] LinkError),
    #[error("The compiler produced an empty breakpoint table")]
    NoBreakpoints,
    #[error("The breakpoint table has no entry breakpoint after the reserved first entry")]
    NoEntryBreakpoint,
    #[error("There is no active debug session")]
    NoSession,
    #[error("Operation requires the session to be {expected:?}, but it is {actual:?}")]
    InvalidPhase {
        expected: SessionPhase,
        actual: SessionPhase,
    },
    #[error("The halt wait was superseded by a newer session or resume")]
    Superseded,
}

impl Error {
    /// Returns `true` if the error was caused by the transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Link(_))
    }
}
