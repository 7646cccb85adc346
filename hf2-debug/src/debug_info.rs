//! Debug metadata emitted by the program compiler.
//!
//! The field names follow the compiler's JSON output (`binAddr`, `procDebugInfo`, ...), so
//! a debug-info file can be deserialized directly into [`DebugMetadata`].

use serde::{Deserialize, Serialize};

use crate::image::BinaryImage;

/// A compiler-assigned stop location in the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    /// The logical breakpoint ID, referenced by the editor and by `successors`.
    pub id: u32,
    /// The device code address this breakpoint maps to.
    pub bin_addr: u32,
    /// Breakpoints reachable by continuing execution one statement forward.
    #[serde(default)]
    pub successors: Vec<u32>,
}

/// A named variable slot of a procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalInfo {
    pub name: String,
    /// Position of the variable's word. When absent, the position in `locals` is used.
    #[serde(default)]
    pub slot: Option<u32>,
}

/// A call site inside a procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEdge {
    /// Device address of the call instruction.
    pub addr: u32,
    /// Index of the callee in the procedure table.
    pub proc_index: u32,
    /// Stack depth the call introduces.
    pub stack: u32,
}

/// Per-procedure debug information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcDebugInfo {
    pub idx: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub locals: Vec<LocalInfo>,
    #[serde(default)]
    pub calls: Vec<CallEdge>,
    /// Address of the procedure's step-in trampoline, if the compiler emitted one.
    #[serde(default)]
    pub bkpt_loc: Option<u32>,
    /// First instruction of the procedure body proper.
    #[serde(default)]
    pub code_start_loc: Option<u32>,
}

impl ProcDebugInfo {
    /// Returns the slot a local lives in, falling back to its position.
    pub fn local_slots(&self) -> impl Iterator<Item = (u32, &str)> {
        self.locals
            .iter()
            .enumerate()
            .map(|(position, local)| (local.slot.unwrap_or(position as u32), local.name.as_str()))
    }
}

/// The metadata half of the compiler output, as it is stored on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugMetadata {
    pub breakpoints: Vec<Breakpoint>,
    #[serde(default)]
    pub proc_debug_info: Vec<ProcDebugInfo>,
}

impl DebugMetadata {
    /// Parses the compiler's JSON debug output.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// The full compiler output for one session: metadata plus the image to flash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledDebugInfo {
    pub breakpoints: Vec<Breakpoint>,
    pub proc_debug_info: Vec<ProcDebugInfo>,
    pub image: BinaryImage,
}

impl CompiledDebugInfo {
    pub fn new(metadata: DebugMetadata, image: BinaryImage) -> Self {
        Self {
            breakpoints: metadata.breakpoints,
            proc_debug_info: metadata.proc_debug_info,
            image,
        }
    }
}
