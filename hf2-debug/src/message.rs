//! Messages exchanged with the editor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::snapshot::GlobalSnapshot;

/// The only message type this bridge produces or handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Debugger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointSubtype {
    Breakpoint,
}

/// Sent to the editor every time the device halts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub subtype: BreakpointSubtype,
    pub breakpoint_id: u32,
    pub globals: BTreeMap<String, u32>,
    /// Always empty: the stack is not reconstructed.
    pub stackframes: Vec<serde_json::Value>,
}

impl BreakpointMessage {
    pub fn new(breakpoint_id: u32, snapshot: GlobalSnapshot) -> Self {
        Self {
            message_type: MessageType::Debugger,
            subtype: BreakpointSubtype::Breakpoint,
            breakpoint_id,
            globals: snapshot.globals,
            stackframes: Vec::new(),
        }
    }
}

/// A step command from the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerCommand {
    StepOver,
    StepInto,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    subtype: String,
}

impl DebuggerCommand {
    /// Parses an editor message.
    ///
    /// Messages of another type and unknown debugger subtypes yield `Ok(None)`; only
    /// malformed JSON is an error.
    pub fn parse(message: &str) -> Result<Option<Self>, serde_json::Error> {
        let incoming: IncomingMessage = serde_json::from_str(message)?;

        if incoming.message_type != "debugger" {
            tracing::debug!("Ignoring message of type {:?}", incoming.message_type);
            return Ok(None);
        }

        Ok(match incoming.subtype.as_str() {
            "stepover" => Some(Self::StepOver),
            "stepinto" => Some(Self::StepInto),
            other => {
                tracing::debug!("Ignoring debugger message with subtype {:?}", other);
                None
            }
        })
    }

    /// Whether the device should single-step instead of running to the next breakpoint.
    pub fn is_step_into(self) -> bool {
        matches!(self, Self::StepInto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn breakpoint_message_wire_format() {
        let mut globals = BTreeMap::new();
        globals.insert("x".to_string(), 5);
        let message = BreakpointMessage::new(
            1,
            GlobalSnapshot {
                pc: Some(0x2050),
                globals,
            },
        );

        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "debugger",
                "subtype": "breakpoint",
                "breakpointId": 1,
                "globals": { "x": 5 },
                "stackframes": []
            })
        );
    }

    #[test]
    fn parses_step_commands() {
        assert_eq!(
            DebuggerCommand::parse(r#"{"type":"debugger","subtype":"stepover"}"#).unwrap(),
            Some(DebuggerCommand::StepOver)
        );
        assert_eq!(
            DebuggerCommand::parse(r#"{"type":"debugger","subtype":"stepinto"}"#).unwrap(),
            Some(DebuggerCommand::StepInto)
        );
    }

    #[test]
    fn ignores_foreign_messages() {
        assert_eq!(
            DebuggerCommand::parse(r#"{"type":"run","subtype":"stepover"}"#).unwrap(),
            None
        );
        assert_eq!(
            DebuggerCommand::parse(r#"{"type":"debugger","subtype":"pause"}"#).unwrap(),
            None
        );
        assert!(DebuggerCommand::parse("stepover").is_err());
    }
}
