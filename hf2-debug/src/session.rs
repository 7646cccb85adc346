use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breakpoints::BreakpointTable;
use crate::compiler::{CompileOptions, Compiler};
use crate::debug_info::{Breakpoint, CompiledDebugInfo};
use crate::halt::{HaltLatch, HaltNotice, HaltObserver, HaltStrategy, HaltWait};
use crate::index::CompiledDebugIndex;
use crate::link::{DebugCommands, HardwareLink};
use crate::message::{BreakpointMessage, DebuggerCommand};
use crate::protocol::DebugStatus;
use crate::snapshot::{self, StaticState};
use crate::Error;

/// Lifecycle of a debug session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// No session has been started.
    Idle,
    /// Compiling and preparing the breakpoint tables.
    Starting,
    /// Writing the image to the device.
    Flashing,
    /// The device runs and a halt is awaited.
    Armed,
    /// The device is halted and a step command is awaited.
    Paused,
    /// Arming the next breakpoints and restarting the device.
    Resuming,
    /// The session failed and has to be started again.
    Terminated,
}

/// Tunables of the session controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub halt_strategy: HaltStrategy,
    /// Interval between status queries when polling for halts.
    #[serde(with = "crate::duration_ms")]
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            halt_strategy: HaltStrategy::Auto,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// The live state of one debug session.
///
/// Owns everything that lives exactly as long as the session: the compiler output and the
/// tables built from it, the cached device layout, the last status written to the device
/// and the halt latch together with its observer.
#[derive(Debug)]
pub struct Session {
    phase: SessionPhase,
    debug_info: CompiledDebugInfo,
    index: CompiledDebugIndex,
    breakpoints: BreakpointTable,
    current: Option<Breakpoint>,
    pending_breakpoints: Vec<u32>,
    static_state: Option<StaticState>,
    last_status: Option<DebugStatus>,
    halts_seen: usize,
    latch: HaltLatch,
    wait: Option<HaltWait>,
    observer: Option<HaltObserver>,
}

impl Session {
    fn new(
        debug_info: CompiledDebugInfo,
        breakpoints: BreakpointTable,
        latch: HaltLatch,
        observer: HaltObserver,
    ) -> Self {
        Self {
            phase: SessionPhase::Starting,
            index: CompiledDebugIndex::new(&debug_info),
            debug_info,
            breakpoints,
            current: None,
            pending_breakpoints: Vec::new(),
            static_state: None,
            last_status: None,
            halts_seen: 0,
            latch,
            wait: None,
            observer: Some(observer),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn debug_info(&self) -> &CompiledDebugInfo {
        &self.debug_info
    }

    pub fn index(&self) -> &CompiledDebugIndex {
        &self.index
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    /// The breakpoint the last halt resolved to.
    pub fn current_breakpoint(&self) -> Option<&Breakpoint> {
        self.current.as_ref()
    }

    /// Addresses armed for the current run of the device.
    pub fn pending_breakpoints(&self) -> &[u32] {
        &self.pending_breakpoints
    }

    pub fn static_state(&self) -> Option<StaticState> {
        self.static_state
    }

    fn expect_phase(&self, expected: SessionPhase) -> Result<(), Error> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(Error::InvalidPhase {
                expected,
                actual: self.phase,
            })
        }
    }

    /// Fetches the globals layout on first use.
    async fn fetch_static_state(&mut self, link: &dyn HardwareLink) -> Result<StaticState, Error> {
        if let Some(state) = self.static_state {
            return Ok(state);
        }

        let state = StaticState::fetch(link).await?;
        self.static_state = Some(state);
        Ok(state)
    }

    /// Writes the debug-status cell unless it already holds `status`.
    ///
    /// Returns whether a write was issued.
    async fn write_status(
        &mut self,
        link: &dyn HardwareLink,
        status: DebugStatus,
    ) -> Result<bool, Error> {
        if self.last_status == Some(status) {
            tracing::trace!("Debug status already {:?}, skipping write", status);
            return Ok(false);
        }

        let state = self.fetch_static_state(link).await?;
        link.write_debug_status(state.status_cell(), status).await?;
        self.last_status = Some(status);
        Ok(true)
    }

    /// Arms the entry breakpoint and boots the device into the compiled image.
    async fn flash_and_arm(&mut self, link: &dyn HardwareLink) -> Result<(), Error> {
        let entry = self.breakpoints.entry().ok_or(Error::NoEntryBreakpoint)?;
        tracing::info!(
            "Entry breakpoint is {} at {:#010x}",
            entry.id,
            entry.bin_addr
        );

        self.pending_breakpoints = vec![entry.bin_addr];
        link.set_breakpoints(&self.pending_breakpoints).await?;

        self.phase = SessionPhase::Flashing;
        self.wait = Some(self.latch.arm());
        link.flash(&self.debug_info.image).await?;
        self.latch.set_running();

        self.phase = SessionPhase::Armed;
        Ok(())
    }

    async fn wait_for_halt(&mut self, link: &dyn HardwareLink) -> Result<BreakpointMessage, Error> {
        self.expect_phase(SessionPhase::Armed)?;
        // The wait stays in place until it completes so a dropped call can be retried.
        let wait = self.wait.as_mut().ok_or(Error::Superseded)?;
        let result = wait.await;
        self.wait = None;

        let notice = result?;
        tracing::debug!("Device halted at {:#010x}", notice.pc);
        self.halted(link, notice).await
    }

    async fn halted(
        &mut self,
        link: &dyn HardwareLink,
        notice: HaltNotice,
    ) -> Result<BreakpointMessage, Error> {
        let state = self.fetch_static_state(link).await?;
        let pc = self.correlation_pc(notice.pc);

        let snapshot = snapshot::snapshot(link, &state, &self.index, Some(pc)).await?;
        let breakpoint = self.breakpoints.resolve(pc).clone();
        tracing::info!(
            "Halted at {:#010x}, breakpoint {} ({:#010x})",
            notice.pc,
            breakpoint.id,
            breakpoint.bin_addr
        );

        self.pending_breakpoints.clear();
        let message = BreakpointMessage::new(breakpoint.id, snapshot);
        self.current = Some(breakpoint);

        // The freshly booted runtime starts with debugging disabled.
        if self.halts_seen == 0 {
            self.write_status(link, DebugStatus::Breakpoints).await?;
        }
        self.halts_seen += 1;

        self.phase = SessionPhase::Paused;
        Ok(message)
    }

    /// The PC used to pick a breakpoint.
    ///
    /// A halt on a procedure's step-in trampoline is attributed to the start of the
    /// procedure body.
    fn correlation_pc(&self, pc: u32) -> u32 {
        let Some(proc) = self.index.landing_pad(pc) else {
            return pc;
        };
        let Some(code_start) = proc.code_start_loc else {
            return pc;
        };

        // TODO: restore the machine state at `code_start` once the link can write registers.
        tracing::warn!(
            "Halted on the step-in trampoline of {:?}; reporting {:#010x} without restoring machine state",
            proc.name,
            code_start
        );
        code_start
    }

    async fn step(&mut self, link: &dyn HardwareLink, into: bool) -> Result<(), Error> {
        self.expect_phase(SessionPhase::Paused)?;
        let current = self.current.as_ref().ok_or(Error::InvalidPhase {
            expected: SessionPhase::Paused,
            actual: self.phase,
        })?;

        self.phase = SessionPhase::Resuming;
        self.pending_breakpoints = self.breakpoints.successor_addresses(current);
        link.set_breakpoints(&self.pending_breakpoints).await?;

        let status = if into {
            DebugStatus::SingleStep
        } else {
            DebugStatus::Breakpoints
        };
        self.write_status(link, status).await?;

        self.wait = Some(self.latch.arm());
        link.resume().await?;
        self.latch.set_running();

        self.phase = SessionPhase::Armed;
        Ok(())
    }

    fn terminate(&mut self) {
        self.phase = SessionPhase::Terminated;
        self.wait = None;
        self.latch.disarm();
        self.observer = None;
    }
}

/// Drives debug sessions against one device.
///
/// At most one [`Session`] exists; starting a new one discards the old one together with
/// its pending halt wait. Any transport failure terminates the session; call
/// [`DebugSessionController::start`] again to retry.
pub struct DebugSessionController<C> {
    link: Arc<dyn HardwareLink>,
    compiler: C,
    config: SessionConfig,
    phase: SessionPhase,
    session: Option<Session>,
}

impl<C: Compiler> DebugSessionController<C> {
    pub fn new(link: Arc<dyn HardwareLink>, compiler: C, config: SessionConfig) -> Self {
        Self {
            link,
            compiler,
            config,
            phase: SessionPhase::Idle,
            session: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.session
            .as_ref()
            .map_or(self.phase, |session| session.phase)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn link(&self) -> &Arc<dyn HardwareLink> {
        &self.link
    }

    /// Compiles the program, arms its entry breakpoint and flashes it.
    ///
    /// On success the session is [`SessionPhase::Armed`]; await the first halt with
    /// [`DebugSessionController::wait_for_halt`]. A compile failure terminates the session
    /// before the device is touched.
    pub async fn start(&mut self) -> Result<(), Error> {
        if let Some(previous) = self.session.take() {
            tracing::debug!("Discarding previous session in phase {:?}", previous.phase);
        }
        self.phase = SessionPhase::Starting;

        let debug_info = match self.compiler.compile(CompileOptions::native_debug()).await {
            Ok(debug_info) => debug_info,
            Err(error) => {
                tracing::error!("Compilation failed: {}", error);
                self.phase = SessionPhase::Terminated;
                return Err(error.into());
            }
        };

        let breakpoints = match BreakpointTable::new(debug_info.breakpoints.clone()) {
            Ok(breakpoints) => breakpoints,
            Err(error) => {
                self.phase = SessionPhase::Terminated;
                return Err(error);
            }
        };

        let latch = HaltLatch::new();
        let observer = match HaltObserver::install(
            &self.link,
            &latch,
            self.config.halt_strategy,
            self.config.poll_interval,
        ) {
            Ok(observer) => observer,
            Err(error) => {
                self.phase = SessionPhase::Terminated;
                return Err(error.into());
            }
        };

        let session = self
            .session
            .insert(Session::new(debug_info, breakpoints, latch, observer));
        let result = session.flash_and_arm(self.link.as_ref()).await;
        self.check(result)
    }

    /// Waits for the device to halt and describes where it stopped.
    pub async fn wait_for_halt(&mut self) -> Result<BreakpointMessage, Error> {
        let session = self.session.as_mut().ok_or(Error::NoSession)?;
        let result = session.wait_for_halt(self.link.as_ref()).await;
        self.check(result)
    }

    /// Starts a session and waits for the device to reach the entry breakpoint.
    pub async fn start_debug(&mut self) -> Result<BreakpointMessage, Error> {
        self.start().await?;
        self.wait_for_halt().await
    }

    /// Steps from the current breakpoint to its successors.
    ///
    /// With `into` the device single-steps and also stops inside called procedures.
    pub async fn step(&mut self, into: bool) -> Result<(), Error> {
        let session = self.session.as_mut().ok_or(Error::NoSession)?;
        let result = session.step(self.link.as_ref(), into).await;
        self.check(result)
    }

    pub async fn handle_command(&mut self, command: DebuggerCommand) -> Result<(), Error> {
        tracing::debug!("Handling {:?}", command);
        self.step(command.is_step_into()).await
    }

    /// Writes the debug-status cell, skipping the write if the value is unchanged.
    pub async fn write_debug_status(&mut self, status: DebugStatus) -> Result<bool, Error> {
        let session = self.session.as_mut().ok_or(Error::NoSession)?;
        let result = session.write_status(self.link.as_ref(), status).await;
        self.check(result)
    }

    /// Ends the current session.
    pub fn end(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.terminate();
        }
        self.phase = SessionPhase::Idle;
    }

    /// Tears the session down if `result` is a session-fatal error.
    fn check<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(error) = &result {
            if matches!(error, Error::InvalidPhase { .. } | Error::NoSession) {
                return result;
            }

            if let Some(session) = self.session.as_mut() {
                tracing::error!("Debug session terminated: {}", error);
                session.terminate();
            }
        }
        result
    }
}

impl<C> std::fmt::Debug for DebugSessionController<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSessionController")
            .field("link", &self.link)
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
