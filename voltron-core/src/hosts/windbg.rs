// WinDbg/CDB shim via pykd
//
// pykd exposes the engine as free functions raising `DbgException` or
// `MemoryException`. Register names come from per-CPU tables because the
// engine only answers lookups by name.

use crate::adaptor::{require_depth, require_full_read, require_stopped, DebuggerAdaptor, HostHandle};
use crate::error::{VoltronError, VoltronResult};
use crate::events::{HostEvent, StateNotifier};
use crate::hosts::HostKind;
use crate::types::*;
use tracing::debug;

const AMD64_REGISTERS: &[&str] = &[
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip", "efl", "cs", "ds", "es", "fs", "gs", "ss",
];

const I386_REGISTERS: &[&str] = &[
    "eax", "ebx", "ecx", "edx", "esi", "edi", "ebp", "esp", "eip", "efl", "cs", "ds", "es", "fs",
    "gs", "ss",
];

const ARM64_REGISTERS: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "fp", "lr", "sp", "pc", "cpsr",
];

#[derive(Debug, Clone)]
pub enum PykdError {
    DbgException(String),
    MemoryException(u64),
}

/// `pykd.executionStatus`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    NoDebuggee,
    Break,
    Go,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuType {
    I386,
    Amd64,
    Arm64,
}

/// `pykd.eventType` of the last engine event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastEvent {
    Breakpoint,
    Exception,
    SingleStep,
    ExitProcess,
    None,
}

#[derive(Debug, Clone)]
pub struct PykdFrame {
    pub instruction_offset: u64,
    pub frame_offset: u64,
}

#[derive(Debug, Clone)]
pub struct PykdDisasm {
    pub offset: u64,
    pub length: u32,
    pub instruction: String,
}

#[derive(Debug, Clone)]
pub struct PykdBreakpoint {
    pub id: u32,
    pub offset: u64,
    pub expression: Option<String>,
    pub enabled: bool,
    pub hit_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum PykdEvent {
    Breakpoint(u32),
    Exception(u32),
    ExecutionStatusChange(ExecutionStatus),
    ExitProcess(u32),
}

/// The pykd module surface used by the shim
pub trait PykdApi: Send {
    fn version(&self) -> String;
    fn process_id(&mut self) -> Option<u32>;
    fn process_name(&mut self) -> Option<String>;
    fn execution_status(&mut self) -> ExecutionStatus;
    fn last_event(&mut self) -> LastEvent;
    fn cpu_type(&mut self) -> CpuType;
    fn reg(&mut self, name: &str) -> Result<u64, PykdError>;
    fn is_valid(&mut self, address: u64) -> bool;
    fn load_bytes(&mut self, address: u64, count: u64) -> Result<Vec<u8>, PykdError>;
    fn stack(&mut self) -> Result<Vec<PykdFrame>, PykdError>;
    fn find_symbol(&mut self, address: u64) -> Option<String>;
    fn disasm(&mut self, address: u64) -> Result<PykdDisasm, PykdError>;
    /// `pykd.expr`, used to resolve symbolic breakpoint locations
    fn expr(&mut self, expression: &str) -> Result<u64, PykdError>;
    fn set_bp(&mut self, offset: u64) -> Result<u32, PykdError>;
    fn remove_bp(&mut self, id: u32) -> Result<(), PykdError>;
    fn breakpoints(&mut self) -> Vec<PykdBreakpoint>;
    fn set_event_handler(&mut self, handler: Box<dyn FnMut(PykdEvent) + Send>);
}

pub fn create_adaptor(handle: HostHandle) -> VoltronResult<Box<dyn DebuggerAdaptor>> {
    let api = handle.downcast::<Box<dyn PykdApi>>(HostKind::Windbg)?;
    Ok(Box::new(WindbgAdaptor::new(api)))
}

pub struct WindbgAdaptor {
    api: Box<dyn PykdApi>,
    /// Symbolic locations as requested, by engine breakpoint id
    symbols: Vec<(u32, String)>,
}

impl WindbgAdaptor {
    pub fn new(api: Box<dyn PykdApi>) -> Self {
        Self {
            api,
            symbols: Vec::new(),
        }
    }

    fn stopped(&mut self) -> VoltronResult<()> {
        let state = self.target_state();
        require_stopped(state)
    }

    fn register_names(&mut self) -> &'static [&'static str] {
        match self.api.cpu_type() {
            CpuType::Amd64 => AMD64_REGISTERS,
            CpuType::I386 => I386_REGISTERS,
            CpuType::Arm64 => ARM64_REGISTERS,
        }
    }

    fn convert_breakpoint(&self, bp: PykdBreakpoint) -> Breakpoint {
        let location = self
            .symbols
            .iter()
            .find(|(id, _)| *id == bp.id)
            .map(|(_, sym)| BreakpointLocation::Symbol(sym.clone()))
            .or_else(|| bp.expression.clone().map(BreakpointLocation::Symbol))
            .unwrap_or(BreakpointLocation::Address(bp.offset));
        Breakpoint {
            id: bp.id,
            location,
            addresses: vec![bp.offset],
            enabled: bp.enabled,
            hit_count: bp.hit_count,
        }
    }
}

fn translate(err: PykdError, fallback: impl FnOnce(String) -> VoltronError) -> VoltronError {
    match err {
        PykdError::MemoryException(addr) => VoltronError::InvalidAddress {
            address: addr,
            length: 1,
        },
        PykdError::DbgException(msg) => {
            if msg.contains("not in break") || msg.contains("target is running") {
                VoltronError::NotStopped(Lifecycle::Running)
            } else if msg.contains("no debuggee") || msg.contains("process has exited") {
                VoltronError::TargetGone(msg)
            } else {
                fallback(msg)
            }
        }
    }
}

fn map_status(status: ExecutionStatus, last: LastEvent) -> TargetState {
    match status {
        ExecutionStatus::NoDebuggee if last == LastEvent::ExitProcess => TargetState::exited(),
        ExecutionStatus::NoDebuggee => TargetState::INVALID,
        ExecutionStatus::Go => TargetState::running(),
        ExecutionStatus::Break => TargetState::stopped(match last {
            LastEvent::Breakpoint => StopReason::Breakpoint,
            LastEvent::SingleStep => StopReason::Step,
            LastEvent::Exception => StopReason::Signal,
            LastEvent::ExitProcess | LastEvent::None => StopReason::None,
        }),
    }
}

impl DebuggerAdaptor for WindbgAdaptor {
    fn host(&self) -> HostKind {
        HostKind::Windbg
    }

    fn host_version(&self) -> String {
        self.api.version()
    }

    fn bind_target(&mut self) -> VoltronResult<TargetInfo> {
        let pid = self
            .api
            .process_id()
            .ok_or_else(|| VoltronError::TargetGone("no debuggee".to_string()))?;
        let arch = match self.api.cpu_type() {
            CpuType::Amd64 => "x86_64",
            CpuType::I386 => "i386",
            CpuType::Arm64 => "aarch64",
        };
        self.symbols.clear();
        Ok(TargetInfo {
            id: pid as u64,
            arch: arch.to_string(),
            executable: self.api.process_name(),
        })
    }

    fn target_state(&mut self) -> TargetState {
        let status = self.api.execution_status();
        let last = self.api.last_event();
        map_status(status, last)
    }

    fn registers(&mut self) -> VoltronResult<RegisterSet> {
        self.stopped()?;
        let mut regs = RegisterSet::new();
        for name in self.register_names() {
            let value = self
                .api
                .reg(name)
                .map_err(|e| translate(e, VoltronError::TargetGone))?;
            regs.push(*name, value);
        }
        Ok(regs)
    }

    fn memory(&mut self, address: u64, length: u64) -> VoltronResult<Vec<u8>> {
        self.stopped()?;
        let last = address.saturating_add(length.saturating_sub(1));
        if !self.api.is_valid(address) || !self.api.is_valid(last) {
            return Err(VoltronError::InvalidAddress { address, length });
        }
        let bytes = self.api.load_bytes(address, length).map_err(|e| match e {
            PykdError::MemoryException(_) => VoltronError::InvalidAddress { address, length },
            other => translate(other, |_| VoltronError::InvalidAddress { address, length }),
        })?;
        require_full_read(address, length, bytes)
    }

    fn stack(&mut self, depth: usize) -> VoltronResult<Vec<StackFrame>> {
        require_depth(depth)?;
        self.stopped()?;
        let frames = self
            .api
            .stack()
            .map_err(|e| translate(e, VoltronError::TargetGone))?;
        Ok(frames
            .into_iter()
            .take(depth)
            .map(|f| StackFrame {
                pc: f.instruction_offset,
                fp: f.frame_offset,
                symbol: self.api.find_symbol(f.instruction_offset),
            })
            .collect())
    }

    fn disassemble(&mut self, address: u64, count: usize) -> VoltronResult<Vec<Instruction>> {
        self.stopped()?;
        let mut insns = Vec::with_capacity(count);
        let mut cursor = address;
        for _ in 0..count {
            let d = self
                .api
                .disasm(cursor)
                .map_err(|e| translate(e, VoltronError::Unsupported))?;
            if d.length == 0 {
                break;
            }
            // pykd renders "addr bytes mnemonic operands"
            let text = d.instruction.split_whitespace().skip(2).collect::<Vec<_>>().join(" ");
            insns.push(Instruction::from_text(d.offset, d.length, &text));
            match d.offset.checked_add(d.length as u64) {
                Some(next) => cursor = next,
                None => break,
            }
        }
        Ok(insns)
    }

    fn breakpoints(&mut self) -> VoltronResult<Vec<Breakpoint>> {
        let bps = self.api.breakpoints();
        Ok(bps.into_iter().map(|bp| self.convert_breakpoint(bp)).collect())
    }

    fn set_breakpoint(&mut self, location: &BreakpointLocation) -> VoltronResult<Breakpoint> {
        let offset = match location {
            BreakpointLocation::Address(addr) => *addr,
            BreakpointLocation::Symbol(name) => self
                .api
                .expr(name)
                .map_err(|e| translate(e, |msg| VoltronError::InvalidArguments(format!("{}: {}", name, msg))))?,
        };
        let id = self
            .api
            .set_bp(offset)
            .map_err(|e| translate(e, VoltronError::InvalidArguments))?;
        if let BreakpointLocation::Symbol(name) = location {
            self.symbols.push((id, name.clone()));
        }
        Ok(Breakpoint {
            id,
            location: location.clone(),
            addresses: vec![offset],
            enabled: true,
            hit_count: 0,
        })
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> VoltronResult<()> {
        if !self.api.breakpoints().iter().any(|bp| bp.id == id) {
            return Err(VoltronError::NotFound(format!("breakpoint {}", id)));
        }
        self.api
            .remove_bp(id)
            .map_err(|e| translate(e, VoltronError::NotFound))?;
        self.symbols.retain(|(bp, _)| *bp != id);
        Ok(())
    }

    fn install_event_hook(&mut self, notifier: StateNotifier) {
        self.api.set_event_handler(Box::new(move |event| match event {
            PykdEvent::Breakpoint(id) => {
                debug!("windbg breakpoint {} hit", id);
                notifier.notify(HostEvent::Stopped(StopReason::Breakpoint));
            }
            PykdEvent::Exception(code) => {
                debug!("windbg exception {:#x}", code);
                notifier.notify(HostEvent::Stopped(StopReason::Signal));
            }
            PykdEvent::ExecutionStatusChange(ExecutionStatus::Go) => {
                notifier.notify(HostEvent::Continued)
            }
            PykdEvent::ExecutionStatusChange(ExecutionStatus::Break) => {
                notifier.notify(HostEvent::Stopped(StopReason::None))
            }
            PykdEvent::ExecutionStatusChange(ExecutionStatus::NoDebuggee) => {}
            PykdEvent::ExitProcess(code) => {
                debug!("windbg debuggee exited with {}", code);
                notifier.notify(HostEvent::Exited);
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakePykd {
        status: ExecutionStatus,
        bps: Vec<PykdBreakpoint>,
    }

    impl FakePykd {
        fn in_break() -> Self {
            Self {
                status: ExecutionStatus::Break,
                bps: Vec::new(),
            }
        }
    }

    impl PykdApi for FakePykd {
        fn version(&self) -> String {
            "pykd 0.3.4.15".to_string()
        }

        fn process_id(&mut self) -> Option<u32> {
            Some(1337)
        }

        fn process_name(&mut self) -> Option<String> {
            Some("notepad.exe".to_string())
        }

        fn execution_status(&mut self) -> ExecutionStatus {
            self.status
        }

        fn last_event(&mut self) -> LastEvent {
            LastEvent::Breakpoint
        }

        fn cpu_type(&mut self) -> CpuType {
            CpuType::I386
        }

        fn reg(&mut self, name: &str) -> Result<u64, PykdError> {
            Ok(if name == "eip" { 0x401000 } else { 0 })
        }

        fn is_valid(&mut self, address: u64) -> bool {
            (0x400000..0x402000).contains(&address)
        }

        fn load_bytes(&mut self, _address: u64, count: u64) -> Result<Vec<u8>, PykdError> {
            Ok(vec![0xcc; count as usize])
        }

        fn stack(&mut self) -> Result<Vec<PykdFrame>, PykdError> {
            Ok(vec![PykdFrame { instruction_offset: 0x401000, frame_offset: 0x12ff00 }])
        }

        fn find_symbol(&mut self, _address: u64) -> Option<String> {
            Some("notepad!WinMain".to_string())
        }

        fn disasm(&mut self, address: u64) -> Result<PykdDisasm, PykdError> {
            Ok(PykdDisasm {
                offset: address,
                length: 2,
                instruction: format!("{:08x} 8bff mov edi,edi", address),
            })
        }

        fn expr(&mut self, expression: &str) -> Result<u64, PykdError> {
            match expression {
                "notepad!WinMain" => Ok(0x401000),
                _ => Err(PykdError::DbgException("Couldn't resolve error".to_string())),
            }
        }

        fn set_bp(&mut self, offset: u64) -> Result<u32, PykdError> {
            let id = self.bps.len() as u32;
            self.bps.push(PykdBreakpoint { id, offset, expression: None, enabled: true, hit_count: 0 });
            Ok(id)
        }

        fn remove_bp(&mut self, id: u32) -> Result<(), PykdError> {
            self.bps.retain(|bp| bp.id != id);
            Ok(())
        }

        fn breakpoints(&mut self) -> Vec<PykdBreakpoint> {
            self.bps.clone()
        }

        fn set_event_handler(&mut self, _handler: Box<dyn FnMut(PykdEvent) + Send>) {}
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status(ExecutionStatus::Go, LastEvent::None), TargetState::running());
        assert_eq!(
            map_status(ExecutionStatus::NoDebuggee, LastEvent::ExitProcess),
            TargetState::exited()
        );
        assert_eq!(
            map_status(ExecutionStatus::Break, LastEvent::SingleStep),
            TargetState::stopped(StopReason::Step)
        );
    }

    #[test]
    fn test_registers_use_cpu_table() {
        let mut a = WindbgAdaptor::new(Box::new(FakePykd::in_break()));
        let regs = a.registers().unwrap();
        assert_eq!(regs.len(), I386_REGISTERS.len());
        assert_eq!(a.program_counter().unwrap(), 0x401000);
        assert_eq!(a.bind_target().unwrap().pointer_size(), 4);
    }

    #[test]
    fn test_memory_validity_checked_up_front() {
        let mut a = WindbgAdaptor::new(Box::new(FakePykd::in_break()));
        assert_eq!(a.memory(0x401000, 4).unwrap(), vec![0xcc; 4]);
        assert!(matches!(
            a.memory(0x401ffe, 4),
            Err(VoltronError::InvalidAddress { address: 0x401ffe, length: 4 })
        ));
    }

    #[test]
    fn test_disassembly_strips_address_and_bytes() {
        let mut a = WindbgAdaptor::new(Box::new(FakePykd::in_break()));
        let insns = a.disassemble(0x401000, 2).unwrap();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].mnemonic, "mov");
        assert_eq!(insns[0].operands, "edi,edi");
        assert_eq!(insns[1].address, 0x401002);
    }

    #[test]
    fn test_disassembly_stops_at_top_of_address_space() {
        let mut a = WindbgAdaptor::new(Box::new(FakePykd::in_break()));
        let insns = a.disassemble(u64::MAX - 1, 5).unwrap();
        assert_eq!(insns.len(), 1);
        assert_eq!(insns[0].address, u64::MAX - 1);
    }

    #[test]
    fn test_symbolic_breakpoint() {
        let mut a = WindbgAdaptor::new(Box::new(FakePykd::in_break()));
        let bp = a
            .set_breakpoint(&BreakpointLocation::Symbol("notepad!WinMain".to_string()))
            .unwrap();
        assert_eq!(bp.addresses, vec![0x401000]);
        let listed = a.breakpoints().unwrap();
        assert_eq!(listed[0].location, BreakpointLocation::Symbol("notepad!WinMain".to_string()));

        assert!(matches!(
            a.set_breakpoint(&BreakpointLocation::Symbol("nope".to_string())),
            Err(VoltronError::InvalidArguments(_))
        ));
        assert!(matches!(a.remove_breakpoint(7), Err(VoltronError::NotFound(_))));
        a.remove_breakpoint(bp.id).unwrap();
    }

    #[test]
    fn test_running_target_rejects_reads() {
        let mut fake = FakePykd::in_break();
        fake.status = ExecutionStatus::Go;
        let mut a = WindbgAdaptor::new(Box::new(fake));
        assert!(matches!(a.stack(4), Err(VoltronError::NotStopped(Lifecycle::Running))));
    }
}
