//! An in-memory device for tests and dry runs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::{self, Debug, Formatter};

use parking_lot::Mutex;

use super::{EventHandler, HardwareLink, LinkCapabilities, LinkError};
use crate::image::BinaryImage;
use crate::protocol::{self, DebugStatus};

/// A request the fake device received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Talk { opcode: u32, payload: Vec<u8> },
    ReadWords { address: u32, count: u32 },
    WriteWords { address: u32, words: Vec<u32> },
    Flash { blocks: usize },
    QueryHalt,
}

/// Where the next injected transport failure happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOn {
    Talk(u32),
    ReadWords,
    WriteWords,
    Flash,
    QueryHalt,
}

#[derive(Debug, Default)]
struct DeviceState {
    memory: BTreeMap<u32, u32>,
    num_globals: u32,
    globals_ptr: u32,
    armed: Vec<u32>,
    halted_pc: Option<u32>,
    halt_script: VecDeque<u32>,
    operations: Vec<Operation>,
    failures: Vec<FailOn>,
    flashed: Option<BinaryImage>,
}

impl DeviceState {
    fn take_failure(&mut self, point: FailOn) -> Result<(), LinkError> {
        match self.failures.iter().position(|failure| *failure == point) {
            Some(position) => {
                self.failures.remove(position);
                Err(LinkError::Other(anyhow::anyhow!(
                    "injected transport failure at {point:?}"
                )))
            }
            None => Ok(()),
        }
    }

    /// Starts running and, if a halt is scripted, stops at it right away.
    fn run(&mut self) -> Option<u32> {
        self.halted_pc = self.halt_script.pop_front();
        self.halted_pc
    }
}

/// A scripted device.
///
/// The device keeps a sparse word memory with a globals area, records every operation it
/// receives and halts at PCs queued with [`FakeLink::queue_halt`] whenever it is flashed
/// or resumed. Depending on how it is built it reports halts through the
/// [`EV_DBG_PAUSED`](protocol::EV_DBG_PAUSED) event or only through
/// [`HardwareLink::query_halt`].
pub struct FakeLink {
    capabilities: LinkCapabilities,
    state: Mutex<DeviceState>,
    handlers: Mutex<HashMap<u32, EventHandler>>,
}

impl FakeLink {
    /// A device that pushes halt notifications.
    pub fn new() -> Self {
        Self::with_capabilities(LinkCapabilities {
            events: true,
            status_query: false,
        })
    }

    /// A device that has to be polled for its halt status.
    pub fn polled() -> Self {
        Self::with_capabilities(LinkCapabilities {
            events: false,
            status_query: true,
        })
    }

    pub fn with_capabilities(capabilities: LinkCapabilities) -> Self {
        Self {
            capabilities,
            state: Mutex::new(DeviceState {
                num_globals: 1,
                globals_ptr: 0x2000_0000,
                ..Default::default()
            }),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Places a globals area of `values.len() + 1` words at `globals_ptr`.
    ///
    /// The first word is the debug-status cell and starts out as
    /// [`DebugStatus::Disabled`].
    pub fn with_globals(self, globals_ptr: u32, values: &[u32]) -> Self {
        {
            let mut state = self.state.lock();
            state.globals_ptr = globals_ptr;
            state.num_globals = values.len() as u32 + 1;
            state
                .memory
                .insert(globals_ptr, DebugStatus::Disabled.as_word());
            for (offset, value) in values.iter().enumerate() {
                state.memory.insert(globals_ptr + 4 * (offset as u32 + 1), *value);
            }
        }
        self
    }

    /// Makes the device halt at `pc` the next time it starts running.
    pub fn queue_halt(&self, pc: u32) {
        self.state.lock().halt_script.push_back(pc);
    }

    /// Halts the running device at `pc` immediately.
    pub fn halt_now(&self, pc: u32) {
        self.state.lock().halted_pc = Some(pc);
        self.notify_paused(pc);
    }

    /// Makes the next operation of the given kind fail.
    pub fn inject_failure(&self, point: FailOn) {
        self.state.lock().failures.push(point);
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.state.lock().operations.clone()
    }

    pub fn clear_operations(&self) {
        self.state.lock().operations.clear();
    }

    pub fn armed_breakpoints(&self) -> Vec<u32> {
        self.state.lock().armed.clone()
    }

    /// The current value of the debug-status cell.
    pub fn debug_status(&self) -> u32 {
        let state = self.state.lock();
        state.memory.get(&state.globals_ptr).copied().unwrap_or(0)
    }

    pub fn word(&self, address: u32) -> u32 {
        self.state.lock().memory.get(&address).copied().unwrap_or(0)
    }

    pub fn flashed_image(&self) -> Option<BinaryImage> {
        self.state.lock().flashed.clone()
    }

    pub fn halted_pc(&self) -> Option<u32> {
        self.state.lock().halted_pc
    }

    fn notify_paused(&self, pc: u32) {
        if !self.capabilities.events {
            return;
        }

        let handlers = self.handlers.lock();
        match handlers.get(&protocol::EV_DBG_PAUSED) {
            Some(handler) => handler(&protocol::words_to_bytes(&[pc])),
            None => tracing::debug!("Fake device paused at {:#010x} without a listener", pc),
        }
    }
}

impl Default for FakeLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for FakeLink {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeLink")
            .field("capabilities", &self.capabilities)
            .field("halted_pc", &state.halted_pc)
            .field("armed", &state.armed)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl HardwareLink for FakeLink {
    fn capabilities(&self) -> LinkCapabilities {
        self.capabilities
    }

    async fn talk(&self, opcode: u32, payload: &[u8]) -> Result<Vec<u8>, LinkError> {
        let halted = {
            let mut state = self.state.lock();
            state.operations.push(Operation::Talk {
                opcode,
                payload: payload.to_vec(),
            });
            state.take_failure(FailOn::Talk(opcode))?;

            match opcode {
                protocol::DBG_GET_GLOBAL_STATE => {
                    return Ok(protocol::words_to_bytes(&[
                        state.num_globals,
                        state.globals_ptr,
                    ]));
                }
                protocol::DBG_SET_BREAKPOINTS => {
                    state.armed = protocol::bytes_to_words(payload)?;
                    return Ok(vec![]);
                }
                protocol::DBG_RESUME => state.run(),
                _ => {
                    return Err(LinkError::CommandFailed {
                        command: opcode,
                        status: 1,
                        info: 0,
                    })
                }
            }
        };

        if let Some(pc) = halted {
            self.notify_paused(pc);
        }

        Ok(vec![])
    }

    async fn read_words(&self, address: u32, count: u32) -> Result<Vec<u32>, LinkError> {
        let mut state = self.state.lock();
        state.operations.push(Operation::ReadWords { address, count });
        state.take_failure(FailOn::ReadWords)?;

        Ok((0..count)
            .map(|offset| {
                state
                    .memory
                    .get(&(address + 4 * offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn write_words(&self, address: u32, words: &[u32]) -> Result<(), LinkError> {
        let mut state = self.state.lock();
        state.operations.push(Operation::WriteWords {
            address,
            words: words.to_vec(),
        });
        state.take_failure(FailOn::WriteWords)?;

        for (offset, word) in words.iter().enumerate() {
            state.memory.insert(address + 4 * offset as u32, *word);
        }
        Ok(())
    }

    fn on_event(&self, event_code: u32, handler: EventHandler) {
        self.handlers.lock().insert(event_code, handler);
    }

    async fn flash(&self, image: &BinaryImage) -> Result<(), LinkError> {
        let halted = {
            let mut state = self.state.lock();
            state.operations.push(Operation::Flash {
                blocks: image.blocks.len(),
            });
            state.take_failure(FailOn::Flash)?;

            state.flashed = Some(image.clone());
            let cell = state.globals_ptr;
            state.memory.insert(cell, DebugStatus::Disabled.as_word());
            state.run()
        };

        if let Some(pc) = halted {
            self.notify_paused(pc);
        }

        Ok(())
    }

    async fn query_halt(&self) -> Result<Option<u32>, LinkError> {
        if !self.capabilities.status_query {
            return Err(LinkError::Unsupported("halt status queries"));
        }

        let mut state = self.state.lock();
        state.operations.push(Operation::QueryHalt);
        state.take_failure(FailOn::QueryHalt)?;
        Ok(state.halted_pc)
    }
}
