// GDB shim
//
// Mirrors gdb's Python API: failures are `gdb.error`, `gdb.MemoryError` or
// `NotImplementedError`, registers are read one expression at a time and
// frames are walked by level. gdb does not remember why the inferior last
// stopped, so the shim records it from the stop events.

use crate::adaptor::{require_depth, require_full_read, require_stopped, DebuggerAdaptor, HostHandle};
use crate::error::{VoltronError, VoltronResult};
use crate::events::{HostEvent, StateNotifier};
use crate::hosts::HostKind;
use crate::types::*;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub enum GdbError {
    /// `gdb.error`
    Error(String),
    /// `gdb.MemoryError`
    Memory(String),
    /// `NotImplementedError`
    NotImplemented(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Stopped,
    Exited,
}

#[derive(Debug, Clone)]
pub struct Inferior {
    pub num: u32,
    /// 0 while no process is running
    pub pid: u32,
    pub filename: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GdbFrame {
    pub pc: u64,
    pub frame_address: u64,
    pub function: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GdbInsn {
    pub addr: u64,
    pub asm: String,
    pub length: u32,
}

#[derive(Debug, Clone)]
pub struct GdbBreakpoint {
    pub number: u32,
    pub location: String,
    pub enabled: bool,
    pub hit_count: u32,
    pub pending: bool,
}

#[derive(Debug, Clone)]
pub enum StopKind {
    /// `gdb.BreakpointEvent`
    Breakpoint(Vec<u32>),
    /// `gdb.SignalEvent`
    Signal(String),
    /// plain `gdb.StopEvent`, e.g. after `stepi`
    Plain,
}

#[derive(Debug, Clone)]
pub enum GdbEvent {
    Stop(StopKind),
    Cont,
    Exited { exit_code: Option<i64> },
}

/// The gdb module surface used by the shim
pub trait GdbApi: Send {
    fn version(&self) -> String;
    fn selected_inferior(&mut self) -> Option<Inferior>;
    fn selected_thread_status(&mut self) -> Option<ThreadStatus>;
    fn architecture_name(&mut self) -> Result<String, GdbError>;
    fn register_names(&mut self) -> Result<Vec<String>, GdbError>;
    fn parse_and_eval(&mut self, expression: &str) -> Result<u64, GdbError>;
    fn read_memory(&mut self, address: u64, length: u64) -> Result<Vec<u8>, GdbError>;
    /// `None` once `level` is past the outermost frame
    fn frame(&mut self, level: usize) -> Result<Option<GdbFrame>, GdbError>;
    fn disassemble(&mut self, start: u64, count: usize) -> Result<Vec<GdbInsn>, GdbError>;
    fn breakpoints(&mut self) -> Vec<GdbBreakpoint>;
    fn create_breakpoint(&mut self, spec: &str) -> Result<GdbBreakpoint, GdbError>;
    fn delete_breakpoint(&mut self, number: u32) -> Result<(), GdbError>;
    fn connect_events(&mut self, callback: Box<dyn FnMut(GdbEvent) + Send>);
}

pub fn create_adaptor(handle: HostHandle) -> VoltronResult<Box<dyn DebuggerAdaptor>> {
    let api = handle.downcast::<Box<dyn GdbApi>>(HostKind::Gdb)?;
    Ok(Box::new(GdbAdaptor::new(api)))
}

#[derive(Debug, Default)]
struct StopRecord {
    last_stop: Option<StopReason>,
    exited: bool,
}

pub struct GdbAdaptor {
    api: Box<dyn GdbApi>,
    record: Arc<Mutex<StopRecord>>,
}

impl GdbAdaptor {
    pub fn new(api: Box<dyn GdbApi>) -> Self {
        Self {
            api,
            record: Arc::new(Mutex::new(StopRecord::default())),
        }
    }

    fn record(&self) -> std::sync::MutexGuard<'_, StopRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stopped(&mut self) -> VoltronResult<()> {
        let state = self.target_state();
        require_stopped(state)
    }
}

fn stop_reason(kind: &StopKind) -> StopReason {
    match kind {
        StopKind::Breakpoint(_) => StopReason::Breakpoint,
        StopKind::Signal(name) if name == "SIGTRAP" => StopReason::Step,
        StopKind::Signal(_) => StopReason::Signal,
        StopKind::Plain => StopReason::Step,
    }
}

/// gdb reports architectures as BFD names
fn normalize_arch(name: &str) -> String {
    match name {
        "i386:x86-64" | "i386:x86-64:intel" => "x86_64".to_string(),
        "i386" | "i386:intel" => "i386".to_string(),
        "aarch64" => "aarch64".to_string(),
        other if other.starts_with("arm") => "arm".to_string(),
        other => other.to_string(),
    }
}

fn translate(err: GdbError, fallback: impl FnOnce(String) -> VoltronError) -> VoltronError {
    match err {
        GdbError::Memory(msg) => fallback(msg),
        GdbError::NotImplemented(msg) => VoltronError::Unsupported(msg),
        GdbError::Error(msg) => {
            if msg.contains("is running") {
                VoltronError::NotStopped(Lifecycle::Running)
            } else if msg.contains("not being run") || msg.contains("No registers") {
                VoltronError::TargetGone(msg)
            } else if msg.starts_with("No breakpoint number") {
                VoltronError::NotFound(msg)
            } else {
                fallback(msg)
            }
        }
    }
}

fn parse_location(spec: &str) -> BreakpointLocation {
    spec.strip_prefix('*')
        .and_then(|addr| addr.parse::<BreakpointLocation>().ok())
        .unwrap_or_else(|| BreakpointLocation::Symbol(spec.to_string()))
}

fn convert_breakpoint(bp: GdbBreakpoint) -> Breakpoint {
    let location = parse_location(&bp.location);
    let addresses = match (&location, bp.pending) {
        (BreakpointLocation::Address(addr), false) => vec![*addr],
        _ => Vec::new(),
    };
    Breakpoint {
        id: bp.number,
        location,
        addresses,
        enabled: bp.enabled,
        hit_count: bp.hit_count,
    }
}

impl DebuggerAdaptor for GdbAdaptor {
    fn host(&self) -> HostKind {
        HostKind::Gdb
    }

    fn host_version(&self) -> String {
        self.api.version()
    }

    fn bind_target(&mut self) -> VoltronResult<TargetInfo> {
        let inferior = self
            .api
            .selected_inferior()
            .filter(|inf| inf.pid != 0)
            .ok_or_else(|| VoltronError::TargetGone("The program is not being run.".to_string()))?;
        let arch = self
            .api
            .architecture_name()
            .map_err(|e| translate(e, VoltronError::Unsupported))?;
        *self.record() = StopRecord::default();
        Ok(TargetInfo {
            id: inferior.num as u64,
            arch: normalize_arch(&arch),
            executable: inferior.filename,
        })
    }

    fn target_state(&mut self) -> TargetState {
        let live = self.api.selected_inferior().map(|inf| inf.pid != 0).unwrap_or(false);
        let record = self.record();
        if !live {
            return if record.exited {
                TargetState::exited()
            } else {
                TargetState::INVALID
            };
        }
        let last_stop = record.last_stop.unwrap_or(StopReason::None);
        drop(record);
        match self.api.selected_thread_status() {
            None => TargetState::new(Lifecycle::Launching, StopReason::None),
            Some(ThreadStatus::Running) => TargetState::running(),
            Some(ThreadStatus::Stopped) => TargetState::stopped(last_stop),
            Some(ThreadStatus::Exited) => TargetState::exited(),
        }
    }

    fn registers(&mut self) -> VoltronResult<RegisterSet> {
        self.stopped()?;
        let names = self
            .api
            .register_names()
            .map_err(|e| translate(e, VoltronError::Unsupported))?;
        let mut regs = RegisterSet::new();
        for name in names {
            match self.api.parse_and_eval(&format!("${}", name)) {
                Ok(value) => regs.push(name, value),
                Err(GdbError::Error(msg)) if msg.contains("not available") => {
                    trace!("register {} unavailable", name);
                }
                Err(e) => return Err(translate(e, VoltronError::TargetGone)),
            }
        }
        Ok(regs)
    }

    fn memory(&mut self, address: u64, length: u64) -> VoltronResult<Vec<u8>> {
        self.stopped()?;
        let bytes = self
            .api
            .read_memory(address, length)
            .map_err(|e| translate(e, |_| VoltronError::InvalidAddress { address, length }))?;
        require_full_read(address, length, bytes)
    }

    fn stack(&mut self, depth: usize) -> VoltronResult<Vec<StackFrame>> {
        require_depth(depth)?;
        self.stopped()?;
        let mut frames = Vec::new();
        for level in 0..depth {
            let frame = self
                .api
                .frame(level)
                .map_err(|e| translate(e, VoltronError::TargetGone))?;
            match frame {
                Some(f) => frames.push(StackFrame {
                    pc: f.pc,
                    fp: f.frame_address,
                    symbol: f.function,
                }),
                None => break,
            }
        }
        Ok(frames)
    }

    fn disassemble(&mut self, address: u64, count: usize) -> VoltronResult<Vec<Instruction>> {
        self.stopped()?;
        let insns = self
            .api
            .disassemble(address, count)
            .map_err(|e| translate(e, |_| VoltronError::InvalidAddress { address, length: count as u64 }))?;
        Ok(insns
            .into_iter()
            .map(|i| Instruction::from_text(i.addr, i.length, &i.asm))
            .collect())
    }

    fn breakpoints(&mut self) -> VoltronResult<Vec<Breakpoint>> {
        Ok(self.api.breakpoints().into_iter().map(convert_breakpoint).collect())
    }

    fn set_breakpoint(&mut self, location: &BreakpointLocation) -> VoltronResult<Breakpoint> {
        let spec = match location {
            BreakpointLocation::Address(addr) => format!("*{:#x}", addr),
            BreakpointLocation::Symbol(name) => name.clone(),
        };
        let bp = self
            .api
            .create_breakpoint(&spec)
            .map_err(|e| translate(e, VoltronError::InvalidArguments))?;
        Ok(convert_breakpoint(bp))
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> VoltronResult<()> {
        self.api
            .delete_breakpoint(id)
            .map_err(|e| translate(e, VoltronError::NotFound))
    }

    fn install_event_hook(&mut self, notifier: StateNotifier) {
        let record = self.record.clone();
        self.api.connect_events(Box::new(move |event| {
            let mut rec = record.lock().unwrap_or_else(PoisonError::into_inner);
            let host_event = match event {
                GdbEvent::Stop(kind) => {
                    let reason = stop_reason(&kind);
                    rec.last_stop = Some(reason);
                    HostEvent::Stopped(reason)
                }
                GdbEvent::Cont => HostEvent::Continued,
                GdbEvent::Exited { exit_code } => {
                    debug!("gdb inferior exited with {:?}", exit_code);
                    rec.exited = true;
                    HostEvent::Exited
                }
            };
            drop(rec);
            notifier.notify(host_event);
        }));
    }
}
