// Uniform debugger capability interface
//
// One implementation per host lives under `hosts/`. An adaptor is owned by
// the worker thread and is only ever called from there.

use crate::error::{VoltronError, VoltronResult};
use crate::events::StateNotifier;
use crate::hosts::HostKind;
use crate::types::*;
use std::any::Any;
use std::time::{Duration, Instant};

/// Interval used by the default `wait_for_stop` when a host has no native
/// blocking wait.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub trait DebuggerAdaptor {
    fn host(&self) -> HostKind;

    /// Host debugger version string
    fn host_version(&self) -> String;

    /// Bind to whatever target the host currently has selected.
    fn bind_target(&mut self) -> VoltronResult<TargetInfo>;

    /// Never blocks, never fails. Hosts without a target report `invalid`.
    fn target_state(&mut self) -> TargetState;

    fn registers(&mut self) -> VoltronResult<RegisterSet>;

    /// All-or-nothing read; a range that is not fully readable fails with
    /// `InvalidAddress`.
    fn memory(&mut self, address: u64, length: u64) -> VoltronResult<Vec<u8>>;

    /// Innermost frame first, at most `depth` frames.
    fn stack(&mut self, depth: usize) -> VoltronResult<Vec<StackFrame>>;

    fn disassemble(&mut self, address: u64, count: usize) -> VoltronResult<Vec<Instruction>>;

    fn breakpoints(&mut self) -> VoltronResult<Vec<Breakpoint>>;

    fn set_breakpoint(&mut self, location: &BreakpointLocation) -> VoltronResult<Breakpoint>;

    fn remove_breakpoint(&mut self, id: BreakpointId) -> VoltronResult<()>;

    /// Hook the host's stop/continue/exit notifications. Called once, by the
    /// worker, before any request is served.
    fn install_event_hook(&mut self, notifier: StateNotifier);

    /// Block the calling worker until the target stops or exits.
    fn wait_for_stop(&mut self, timeout: Duration) -> VoltronResult<TargetState> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.target_state();
            if matches!(state.lifecycle, Lifecycle::Stopped | Lifecycle::Exited) {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                return Err(VoltronError::Timeout(timeout));
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn program_counter(&mut self) -> VoltronResult<u64> {
        let regs = self.registers()?;
        regs.first_of(PC_REGISTERS)
            .ok_or_else(|| VoltronError::Unsupported("no program counter register".to_string()))
    }

    fn stack_pointer(&mut self) -> VoltronResult<u64> {
        let regs = self.registers()?;
        regs.first_of(SP_REGISTERS)
            .ok_or_else(|| VoltronError::Unsupported("no stack pointer register".to_string()))
    }
}

/// Constructor supplied by each host plugin.
pub type AdaptorFactory = fn(HostHandle) -> VoltronResult<Box<dyn DebuggerAdaptor>>;

/// Opaque debugger-session handle passed in by the loader. Each host factory
/// downcasts it to that host's native API.
pub struct HostHandle(Box<dyn Any + Send>);

impl HostHandle {
    pub fn new<T: Any + Send>(native: T) -> Self {
        Self(Box::new(native))
    }

    pub fn downcast<T: Any>(self, host: HostKind) -> VoltronResult<T> {
        self.0.downcast::<T>().map(|b| *b).map_err(|_| {
            VoltronError::InvalidArguments(format!("handle does not belong to a {} session", host))
        })
    }
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HostHandle(..)")
    }
}

/// Shared precondition for every capability that needs a stopped target.
pub fn require_stopped(state: TargetState) -> VoltronResult<()> {
    match state.lifecycle {
        Lifecycle::Stopped => Ok(()),
        Lifecycle::Exited | Lifecycle::Detached => Err(VoltronError::TargetGone(format!(
            "target is {}",
            state.lifecycle
        ))),
        other => Err(VoltronError::NotStopped(other)),
    }
}

/// Enforce all-or-nothing reads on hosts that may return short buffers.
pub fn require_full_read(address: u64, length: u64, bytes: Vec<u8>) -> VoltronResult<Vec<u8>> {
    if bytes.len() as u64 != length {
        return Err(VoltronError::InvalidAddress { address, length });
    }
    Ok(bytes)
}

pub fn require_depth(depth: usize) -> VoltronResult<()> {
    if depth == 0 {
        return Err(VoltronError::InvalidArguments(
            "stack depth must be at least 1".to_string(),
        ));
    }
    Ok(())
}
