//! # Source-level debugging for HF2 devices
//!
//! `hf2-debug` correlates the debug metadata a program compiler emits (the breakpoint
//! table, per-procedure locals and the call graph) with the live state of a device
//! reachable over a command/response link, and exposes a halt/resume/step surface plus
//! symbolic snapshots of the program's globals.
//!
//! ## Running a session against the in-memory device
//!
//! ```no_run
//! # async fn run() -> Result<(), hf2_debug::Error> {
//! use std::sync::Arc;
//! use hf2_debug::{
//!     compiler::ArtifactCompiler, link::fake::FakeLink, DebugSessionController,
//!     DebuggerCommand, SessionConfig,
//! };
//!
//! let link = Arc::new(FakeLink::new());
//! let compiler = ArtifactCompiler::new("debug-info.json", "binary.uf2");
//! let mut controller = DebugSessionController::new(link, compiler, SessionConfig::default());
//!
//! // Compile, arm the entry breakpoint, flash and wait for the first halt.
//! let hit = controller.start_debug().await?;
//! println!("halted at breakpoint {}", hit.breakpoint_id);
//!
//! controller.handle_command(DebuggerCommand::StepOver).await?;
//! let hit = controller.wait_for_halt().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The crate is built around four pieces: the [`HardwareLink`](link::HardwareLink)
//! capability interface, the [`CompiledDebugIndex`], the [`BreakpointTable`] resolver
//! and the [`DebugSessionController`] state machine.

pub mod breakpoints;
pub mod compiler;
pub mod debug_info;
mod error;
pub mod halt;
pub mod image;
pub mod index;
pub mod link;
pub mod message;
pub mod protocol;
mod session;
pub mod snapshot;

pub use crate::breakpoints::BreakpointTable;
pub use crate::debug_info::{Breakpoint, CallEdge, CompiledDebugInfo, LocalInfo, ProcDebugInfo};
pub use crate::error::Error;
pub use crate::halt::{HaltLatch, HaltNotice, HaltStrategy};
pub use crate::index::{CallInfo, CompiledDebugIndex};
pub use crate::message::{BreakpointMessage, DebuggerCommand};
pub use crate::protocol::DebugStatus;
pub use crate::session::{DebugSessionController, Session, SessionConfig, SessionPhase};
pub use crate::snapshot::{GlobalSnapshot, StaticState};

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u128(duration.as_millis())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
