// VDB shim via vtrace
//
// vtrace keeps no hit counts and raises on reads that cross into unmapped
// pages, so the shim checks the memory map first and counts breakpoint hits
// from the notifier itself.

use crate::adaptor::{require_depth, require_full_read, require_stopped, DebuggerAdaptor, HostHandle};
use crate::error::{VoltronError, VoltronResult};
use crate::events::{HostEvent, StateNotifier};
use crate::hosts::HostKind;
use crate::types::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Clone)]
pub enum VtraceError {
    /// `PlatformException`
    Platform(String),
    /// `SegmentationViolation`
    SegmentationViolation(u64),
    /// envi has no disassembler module for the architecture
    NoArchModule(String),
}

#[derive(Debug, Clone)]
pub struct MemoryMap {
    pub base: u64,
    pub size: u64,
    pub perms: u8,
    pub name: String,
}

impl MemoryMap {
    pub const PERM_READ: u8 = 4;

    fn contains_range(&self, address: u64, length: u64) -> bool {
        address >= self.base
            && address - self.base <= self.size
            && length <= self.size - (address - self.base)
    }
}

#[derive(Debug, Clone)]
pub struct VtraceOp {
    pub va: u64,
    pub size: u32,
    pub repr: String,
}

#[derive(Debug, Clone)]
pub struct VtraceBreakpoint {
    pub id: u32,
    pub address: Option<u64>,
    pub expression: String,
    pub enabled: bool,
}

/// vtrace `NOTIFY_*` events
#[derive(Debug, Clone, Copy)]
pub enum VtraceEvent {
    Break { breakpoint: Option<u32> },
    Step,
    Signal(u32),
    Continue,
    Exit(i32),
    Detach,
}

/// The trace object surface used by the shim
pub trait VtraceApi: Send {
    fn version(&self) -> String;
    fn is_attached(&mut self) -> bool;
    fn is_running(&mut self) -> bool;
    fn has_exited(&mut self) -> bool;
    fn pid(&mut self) -> u32;
    fn exe_name(&mut self) -> Option<String>;
    /// `trace.getMeta("Architecture")`
    fn architecture(&mut self) -> String;
    fn registers(&mut self) -> Result<Vec<(String, u64)>, VtraceError>;
    fn memory_maps(&mut self) -> Vec<MemoryMap>;
    fn read_memory(&mut self, address: u64, size: u64) -> Result<Vec<u8>, VtraceError>;
    /// `(pc, frame pointer)` pairs, innermost first
    fn stack_trace(&mut self) -> Result<Vec<(u64, u64)>, VtraceError>;
    fn symbol_by_addr(&mut self, address: u64) -> Option<String>;
    fn disasm(&mut self, bytes: &[u8], va: u64) -> Result<VtraceOp, VtraceError>;
    fn breakpoints(&mut self) -> Vec<VtraceBreakpoint>;
    fn add_breakpoint(&mut self, expression: &str) -> Result<VtraceBreakpoint, VtraceError>;
    fn remove_breakpoint(&mut self, id: u32) -> Result<(), VtraceError>;
    fn register_notifier(&mut self, notifier: Box<dyn FnMut(VtraceEvent) + Send>);
}

pub fn create_adaptor(handle: HostHandle) -> VoltronResult<Box<dyn DebuggerAdaptor>> {
    let api = handle.downcast::<Box<dyn VtraceApi>>(HostKind::Vdb)?;
    Ok(Box::new(VdbAdaptor::new(api)))
}

#[derive(Debug, Default)]
struct TraceRecord {
    last_stop: Option<StopReason>,
    hits: HashMap<u32, u32>,
}

pub struct VdbAdaptor {
    api: Box<dyn VtraceApi>,
    record: Arc<Mutex<TraceRecord>>,
}

/// Longest x86 instruction; enough bytes for envi to decode one op
const MAX_INSN_BYTES: u64 = 15;

impl VdbAdaptor {
    pub fn new(api: Box<dyn VtraceApi>) -> Self {
        Self {
            api,
            record: Arc::new(Mutex::new(TraceRecord::default())),
        }
    }

    fn record(&self) -> std::sync::MutexGuard<'_, TraceRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stopped(&mut self) -> VoltronResult<()> {
        let state = self.target_state();
        require_stopped(state)
    }

    fn is_mapped(&mut self, address: u64, length: u64) -> bool {
        self.api
            .memory_maps()
            .iter()
            .any(|m| m.perms & MemoryMap::PERM_READ != 0 && m.contains_range(address, length))
    }

    fn convert_breakpoint(&self, bp: VtraceBreakpoint) -> Breakpoint {
        let location = bp
            .expression
            .parse::<BreakpointLocation>()
            .unwrap_or_else(|_| BreakpointLocation::Symbol(bp.expression.clone()));
        Breakpoint {
            id: bp.id,
            location,
            addresses: bp.address.into_iter().collect(),
            enabled: bp.enabled,
            hit_count: self.record().hits.get(&bp.id).copied().unwrap_or(0),
        }
    }
}

fn translate(err: VtraceError, fallback: impl FnOnce(String) -> VoltronError) -> VoltronError {
    match err {
        VtraceError::SegmentationViolation(addr) => VoltronError::InvalidAddress {
            address: addr,
            length: 1,
        },
        VtraceError::NoArchModule(arch) => {
            VoltronError::Unsupported(format!("no disassembler for {}", arch))
        }
        VtraceError::Platform(msg) => {
            if msg.contains("running") {
                VoltronError::NotStopped(Lifecycle::Running)
            } else if msg.contains("not attached") {
                VoltronError::TargetGone(msg)
            } else {
                fallback(msg)
            }
        }
    }
}

impl DebuggerAdaptor for VdbAdaptor {
    fn host(&self) -> HostKind {
        HostKind::Vdb
    }

    fn host_version(&self) -> String {
        self.api.version()
    }

    fn bind_target(&mut self) -> VoltronResult<TargetInfo> {
        if !self.api.is_attached() {
            return Err(VoltronError::TargetGone("trace is not attached".to_string()));
        }
        *self.record() = TraceRecord::default();
        Ok(TargetInfo {
            id: self.api.pid() as u64,
            arch: self.api.architecture(),
            executable: self.api.exe_name(),
        })
    }

    fn target_state(&mut self) -> TargetState {
        if self.api.has_exited() {
            return TargetState::exited();
        }
        if !self.api.is_attached() {
            return TargetState::new(Lifecycle::Detached, StopReason::None);
        }
        if self.api.is_running() {
            return TargetState::running();
        }
        TargetState::stopped(self.record().last_stop.unwrap_or(StopReason::None))
    }

    fn registers(&mut self) -> VoltronResult<RegisterSet> {
        self.stopped()?;
        let regs = self
            .api
            .registers()
            .map_err(|e| translate(e, VoltronError::TargetGone))?;
        Ok(regs.into_iter().collect())
    }

    fn memory(&mut self, address: u64, length: u64) -> VoltronResult<Vec<u8>> {
        self.stopped()?;
        if !self.is_mapped(address, length) {
            return Err(VoltronError::InvalidAddress { address, length });
        }
        let bytes = self
            .api
            .read_memory(address, length)
            .map_err(|_| VoltronError::InvalidAddress { address, length })?;
        require_full_read(address, length, bytes)
    }

    fn stack(&mut self, depth: usize) -> VoltronResult<Vec<StackFrame>> {
        require_depth(depth)?;
        self.stopped()?;
        let trace = self
            .api
            .stack_trace()
            .map_err(|e| translate(e, VoltronError::TargetGone))?;
        Ok(trace
            .into_iter()
            .take(depth)
            .map(|(pc, fp)| StackFrame {
                pc,
                fp,
                symbol: self.api.symbol_by_addr(pc),
            })
            .collect())
    }

    fn disassemble(&mut self, address: u64, count: usize) -> VoltronResult<Vec<Instruction>> {
        self.stopped()?;
        let mut insns = Vec::with_capacity(count);
        let mut va = address;
        for _ in 0..count {
            // read as much of the window as is mapped; stop at the map edge
            let Some(window) = (1..=MAX_INSN_BYTES).rev().find(|len| self.is_mapped(va, *len)) else {
                if insns.is_empty() {
                    return Err(VoltronError::InvalidAddress { address: va, length: 1 });
                }
                break;
            };
            let bytes = self
                .api
                .read_memory(va, window)
                .map_err(|e| translate(e, |_| VoltronError::InvalidAddress { address: va, length: window }))?;
            let op = match self.api.disasm(&bytes, va) {
                Ok(op) => op,
                Err(VtraceError::NoArchModule(arch)) => {
                    return Err(VoltronError::Unsupported(format!("no disassembler for {}", arch)))
                }
                Err(e) if insns.is_empty() => return Err(translate(e, VoltronError::Unsupported)),
                Err(_) => break,
            };
            if op.size == 0 {
                break;
            }
            insns.push(Instruction::from_text(op.va, op.size, &op.repr));
            let Some(next) = op.va.checked_add(op.size as u64) else {
                break;
            };
            va = next;
        }
        Ok(insns)
    }

    fn breakpoints(&mut self) -> VoltronResult<Vec<Breakpoint>> {
        let bps = self.api.breakpoints();
        Ok(bps.into_iter().map(|bp| self.convert_breakpoint(bp)).collect())
    }

    fn set_breakpoint(&mut self, location: &BreakpointLocation) -> VoltronResult<Breakpoint> {
        let expression = location.to_string();
        let bp = self
            .api
            .add_breakpoint(&expression)
            .map_err(|e| translate(e, VoltronError::InvalidArguments))?;
        Ok(self.convert_breakpoint(bp))
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> VoltronResult<()> {
        self.api
            .remove_breakpoint(id)
            .map_err(|e| translate(e, |_| VoltronError::NotFound(format!("breakpoint {}", id))))?;
        self.record().hits.remove(&id);
        Ok(())
    }

    fn install_event_hook(&mut self, notifier: StateNotifier) {
        let record = self.record.clone();
        self.api.register_notifier(Box::new(move |event| {
            let host_event = {
                let mut rec = record.lock().unwrap_or_else(PoisonError::into_inner);
                match event {
                    VtraceEvent::Break { breakpoint } => {
                        if let Some(id) = breakpoint {
                            *rec.hits.entry(id).or_insert(0) += 1;
                        }
                        rec.last_stop = Some(StopReason::Breakpoint);
                        HostEvent::Stopped(StopReason::Breakpoint)
                    }
                    VtraceEvent::Step => {
                        rec.last_stop = Some(StopReason::Step);
                        HostEvent::Stopped(StopReason::Step)
                    }
                    VtraceEvent::Signal(signo) => {
                        debug!("vtrace signal {}", signo);
                        rec.last_stop = Some(StopReason::Signal);
                        HostEvent::Stopped(StopReason::Signal)
                    }
                    VtraceEvent::Continue => HostEvent::Continued,
                    VtraceEvent::Exit(_) | VtraceEvent::Detach => HostEvent::Exited,
                }
            };
            notifier.notify(host_event);
        }));
    }
}
