// LLDB shim
//
// Adapts the subset of the SB API that the views need. LLDB reports errors
// through `SBError` values rather than failing calls, and memory reads may
// come back short.

use crate::adaptor::{require_depth, require_full_read, require_stopped, DebuggerAdaptor, HostHandle};
use crate::error::{VoltronError, VoltronResult};
use crate::events::{HostEvent, StateNotifier};
use crate::hosts::HostKind;
use crate::types::*;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// `lldb::StateType`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateType {
    Invalid,
    Unloaded,
    Connected,
    Attaching,
    Launching,
    Stopped,
    Running,
    Stepping,
    Crashed,
    Detached,
    Exited,
    Suspended,
}

/// `lldb::StopReason`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReasonType {
    Invalid,
    None,
    Trace,
    Breakpoint,
    Watchpoint,
    Signal,
    Exception,
    Exec,
    PlanComplete,
    ThreadExiting,
    Instrumentation,
}

#[derive(Debug, Clone)]
pub struct SBError {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct SBTarget {
    pub index: u32,
    pub triple: String,
    pub executable: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SBFrame {
    pub pc: u64,
    pub fp: u64,
    pub function: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SBInstruction {
    pub address: u64,
    pub byte_size: u32,
    pub mnemonic: String,
    pub operands: String,
}

#[derive(Debug, Clone)]
pub struct SBBreakpoint {
    pub id: i32,
    pub locations: Vec<u64>,
    pub enabled: bool,
    pub hit_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum SBEvent {
    ProcessStateChanged {
        state: StateType,
        reason: StopReasonType,
    },
}

/// The SB API surface used by the shim
pub trait LldbApi: Send {
    fn version(&self) -> String;
    fn selected_target(&mut self) -> Option<SBTarget>;
    fn process_state(&mut self) -> StateType;
    fn stop_reason(&mut self) -> StopReasonType;
    /// General purpose register set of the selected frame
    fn register_values(&mut self) -> Result<Vec<(String, u64)>, SBError>;
    fn read_memory(&mut self, address: u64, size: u64) -> (Vec<u8>, Option<SBError>);
    fn frames(&mut self, max: u32) -> Result<Vec<SBFrame>, SBError>;
    fn read_instructions(&mut self, address: u64, count: u32) -> Result<Vec<SBInstruction>, SBError>;
    fn breakpoints(&mut self) -> Vec<SBBreakpoint>;
    fn breakpoint_create_by_address(&mut self, address: u64) -> Result<SBBreakpoint, SBError>;
    fn breakpoint_create_by_name(&mut self, name: &str) -> Result<SBBreakpoint, SBError>;
    fn breakpoint_delete(&mut self, id: i32) -> bool;
    fn add_listener(&mut self, callback: Box<dyn FnMut(SBEvent) + Send>);
    fn wait_for_event(&mut self, timeout: Duration) -> Option<SBEvent>;
}

pub fn create_adaptor(handle: HostHandle) -> VoltronResult<Box<dyn DebuggerAdaptor>> {
    let api = handle.downcast::<Box<dyn LldbApi>>(HostKind::Lldb)?;
    Ok(Box::new(LldbAdaptor::new(api)))
}

pub struct LldbAdaptor {
    api: Box<dyn LldbApi>,
    /// Locations as requested, keyed by LLDB breakpoint id
    requested: HashMap<i32, BreakpointLocation>,
}

impl LldbAdaptor {
    pub fn new(api: Box<dyn LldbApi>) -> Self {
        Self {
            api,
            requested: HashMap::new(),
        }
    }

    fn stopped(&mut self) -> VoltronResult<()> {
        let state = self.target_state();
        require_stopped(state)
    }

    fn convert_breakpoint(&self, bp: SBBreakpoint) -> VoltronResult<Breakpoint> {
        let id = BreakpointId::try_from(bp.id)
            .map_err(|_| VoltronError::InvalidArguments(format!("invalid lldb breakpoint id {}", bp.id)))?;
        let location = self.requested.get(&bp.id).cloned().unwrap_or_else(|| {
            match bp.locations.first() {
                Some(addr) => BreakpointLocation::Address(*addr),
                None => BreakpointLocation::Symbol(format!("lldb breakpoint {}", bp.id)),
            }
        });
        Ok(Breakpoint {
            id,
            location,
            addresses: bp.locations,
            enabled: bp.enabled,
            hit_count: bp.hit_count,
        })
    }
}

pub fn map_state(state: StateType, reason: StopReasonType) -> TargetState {
    let lifecycle = match state {
        StateType::Invalid | StateType::Unloaded => Lifecycle::Invalid,
        StateType::Connected | StateType::Attaching | StateType::Launching => Lifecycle::Launching,
        StateType::Stopped | StateType::Suspended | StateType::Crashed => Lifecycle::Stopped,
        StateType::Running | StateType::Stepping => Lifecycle::Running,
        StateType::Detached => Lifecycle::Detached,
        StateType::Exited => Lifecycle::Exited,
    };
    let stop_reason = if lifecycle == Lifecycle::Stopped {
        map_stop_reason(reason)
    } else {
        StopReason::None
    };
    TargetState::new(lifecycle, stop_reason)
}

fn map_stop_reason(reason: StopReasonType) -> StopReason {
    match reason {
        StopReasonType::Breakpoint | StopReasonType::Watchpoint => StopReason::Breakpoint,
        StopReasonType::Trace | StopReasonType::PlanComplete => StopReason::Step,
        StopReasonType::Signal | StopReasonType::Exception => StopReason::Signal,
        _ => StopReason::None,
    }
}

/// Translate an SBError. Messages that identify a state problem win over the
/// call-site fallback.
fn translate(err: SBError, fallback: impl FnOnce(String) -> VoltronError) -> VoltronError {
    let msg = err.message.to_ascii_lowercase();
    if msg.contains("is running") || msg.contains("not stopped") {
        VoltronError::NotStopped(Lifecycle::Running)
    } else if msg.contains("invalid process") || msg.contains("process exited") {
        VoltronError::TargetGone(err.message)
    } else {
        fallback(err.message)
    }
}

impl DebuggerAdaptor for LldbAdaptor {
    fn host(&self) -> HostKind {
        HostKind::Lldb
    }

    fn host_version(&self) -> String {
        self.api.version()
    }

    fn bind_target(&mut self) -> VoltronResult<TargetInfo> {
        let target = self
            .api
            .selected_target()
            .ok_or_else(|| VoltronError::TargetGone("no target selected".to_string()))?;
        let arch = target.triple.split('-').next().unwrap_or("unknown").to_string();
        self.requested.clear();
        Ok(TargetInfo {
            id: target.index as u64,
            arch,
            executable: target.executable,
        })
    }

    fn target_state(&mut self) -> TargetState {
        let state = self.api.process_state();
        let reason = if state == StateType::Stopped {
            self.api.stop_reason()
        } else {
            StopReasonType::None
        };
        map_state(state, reason)
    }

    fn registers(&mut self) -> VoltronResult<RegisterSet> {
        self.stopped()?;
        let values = self
            .api
            .register_values()
            .map_err(|e| translate(e, VoltronError::TargetGone))?;
        Ok(values.into_iter().collect())
    }

    fn memory(&mut self, address: u64, length: u64) -> VoltronResult<Vec<u8>> {
        self.stopped()?;
        let (bytes, error) = self.api.read_memory(address, length);
        if let Some(err) = error {
            debug!("lldb memory read at {:#x} failed: {}", address, err.message);
            return Err(translate(err, |_| VoltronError::InvalidAddress { address, length }));
        }
        require_full_read(address, length, bytes)
    }

    fn stack(&mut self, depth: usize) -> VoltronResult<Vec<StackFrame>> {
        require_depth(depth)?;
        self.stopped()?;
        let max = u32::try_from(depth).unwrap_or(u32::MAX);
        let frames = self
            .api
            .frames(max)
            .map_err(|e| translate(e, VoltronError::TargetGone))?;
        Ok(frames
            .into_iter()
            .take(depth)
            .map(|f| StackFrame {
                pc: f.pc,
                fp: f.fp,
                symbol: f.function,
            })
            .collect())
    }

    fn disassemble(&mut self, address: u64, count: usize) -> VoltronResult<Vec<Instruction>> {
        self.stopped()?;
        let count = u32::try_from(count).unwrap_or(u32::MAX);
        let insns = self
            .api
            .read_instructions(address, count)
            .map_err(|e| translate(e, VoltronError::Unsupported))?;
        Ok(insns
            .into_iter()
            .map(|i| Instruction {
                address: i.address,
                size: i.byte_size,
                mnemonic: i.mnemonic,
                operands: i.operands,
            })
            .collect())
    }

    fn breakpoints(&mut self) -> VoltronResult<Vec<Breakpoint>> {
        let bps = self.api.breakpoints();
        Ok(bps
            .into_iter()
            .filter_map(|bp| match self.convert_breakpoint(bp) {
                Ok(bp) => Some(bp),
                Err(e) => {
                    debug!("skipping lldb breakpoint: {}", e);
                    None
                }
            })
            .collect())
    }

    fn set_breakpoint(&mut self, location: &BreakpointLocation) -> VoltronResult<Breakpoint> {
        let created = match location {
            BreakpointLocation::Address(addr) => self.api.breakpoint_create_by_address(*addr),
            BreakpointLocation::Symbol(name) => self.api.breakpoint_create_by_name(name),
        }
        .map_err(|e| translate(e, VoltronError::InvalidArguments))?;
        let native = created.id;
        self.requested.insert(native, location.clone());
        self.convert_breakpoint(created).map_err(|e| {
            self.requested.remove(&native);
            e
        })
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> VoltronResult<()> {
        let native = i32::try_from(id)
            .map_err(|_| VoltronError::NotFound(format!("breakpoint {}", id)))?;
        if !self.api.breakpoint_delete(native) {
            return Err(VoltronError::NotFound(format!("breakpoint {}", id)));
        }
        self.requested.remove(&native);
        Ok(())
    }

    fn install_event_hook(&mut self, notifier: StateNotifier) {
        self.api.add_listener(Box::new(move |event| {
            let SBEvent::ProcessStateChanged { state, reason } = event;
            match map_state(state, reason).lifecycle {
                Lifecycle::Stopped => notifier.notify(HostEvent::Stopped(map_stop_reason(reason))),
                Lifecycle::Running => notifier.notify(HostEvent::Continued),
                Lifecycle::Exited | Lifecycle::Detached => notifier.notify(HostEvent::Exited),
                other => debug!("ignoring lldb state change to {}", other),
            }
        }));
    }

    fn wait_for_stop(&mut self, timeout: Duration) -> VoltronResult<TargetState> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.target_state();
            if matches!(state.lifecycle, Lifecycle::Stopped | Lifecycle::Exited) {
                return Ok(state);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(VoltronError::Timeout(timeout));
            }
            if let Some(event) = self.api.wait_for_event(remaining) {
                debug!("lldb listener woke with {:?}", event);
            }
        }
    }
}
