// Scripted in-memory adaptor for tests

use crate::adaptor::{require_depth, require_stopped, DebuggerAdaptor, HostHandle};
use crate::error::{VoltronError, VoltronResult};
use crate::events::{HostEvent, StateNotifier};
use crate::hosts::{HostKind, HostThreading};
use crate::registry::{DebuggerPlugin, PluginRegistry};
use crate::types::*;
use std::sync::{Arc, Mutex, MutexGuard};

struct FakeState {
    state: TargetState,
    target: Option<TargetInfo>,
    registers: RegisterSet,
    regions: Vec<(u64, Vec<u8>)>,
    breakpoints: Vec<Breakpoint>,
    next_breakpoint: BreakpointId,
    notifier: Option<StateNotifier>,
    breakpoint_queries: usize,
    register_reads: usize,
}

/// Shared handle to the fake host. Clones see the same target.
#[derive(Clone)]
pub struct FakeTarget {
    inner: Arc<Mutex<FakeState>>,
}

impl FakeTarget {
    /// An x86_64 target stopped at a breakpoint with nothing mapped.
    pub fn new() -> Self {
        let mut registers = RegisterSet::new();
        registers.push("rax", 0);
        registers.push("rbx", 0x1);
        registers.push("rsp", 0x7000);
        registers.push("rip", 0x1000);
        Self {
            inner: Arc::new(Mutex::new(FakeState {
                state: TargetState::stopped(StopReason::Breakpoint),
                target: Some(TargetInfo {
                    id: 1,
                    arch: "x86_64".to_string(),
                    executable: Some("/bin/true".to_string()),
                }),
                registers,
                regions: Vec::new(),
                breakpoints: Vec::new(),
                next_breakpoint: 1,
                notifier: None,
                breakpoint_queries: 0,
                register_reads: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.inner.lock().unwrap()
    }

    pub fn handle(&self) -> HostHandle {
        HostHandle::new(self.clone())
    }

    pub fn adaptor(&self) -> Box<dyn DebuggerAdaptor> {
        Box::new(FakeAdaptor {
            target: self.clone(),
        })
    }

    /// Change the state without telling anyone.
    pub fn set_state(&self, state: TargetState) {
        self.lock().state = state;
    }

    pub fn set_register(&self, name: &str, value: u64) {
        let mut inner = self.lock();
        let regs: RegisterSet = inner
            .registers
            .iter()
            .map(|(n, v)| (n.to_string(), if n == name { value } else { v }))
            .collect();
        inner.registers = regs;
    }

    pub fn map(&self, address: u64, bytes: Vec<u8>) {
        self.lock().regions.push((address, bytes));
    }

    pub fn run(&self) {
        self.transition(TargetState::running(), HostEvent::Continued);
    }

    pub fn stop(&self, reason: StopReason) {
        self.transition(TargetState::stopped(reason), HostEvent::Stopped(reason));
    }

    pub fn exit(&self) {
        self.transition(TargetState::exited(), HostEvent::Exited);
    }

    fn transition(&self, state: TargetState, event: HostEvent) {
        let notifier = {
            let mut inner = self.lock();
            inner.state = state;
            inner.notifier.clone()
        };
        if let Some(notifier) = notifier {
            notifier.notify(event);
        }
    }

    pub fn breakpoint_queries(&self) -> usize {
        self.lock().breakpoint_queries
    }

    pub fn register_reads(&self) -> usize {
        self.lock().register_reads
    }
}

struct FakeAdaptor {
    target: FakeTarget,
}

impl DebuggerAdaptor for FakeAdaptor {
    fn host(&self) -> HostKind {
        HostKind::Lldb
    }

    fn host_version(&self) -> String {
        "fake-1.0".to_string()
    }

    fn bind_target(&mut self) -> VoltronResult<TargetInfo> {
        self.target
            .lock()
            .target
            .clone()
            .ok_or_else(|| VoltronError::TargetGone("no target selected".to_string()))
    }

    fn target_state(&mut self) -> TargetState {
        self.target.lock().state
    }

    fn registers(&mut self) -> VoltronResult<RegisterSet> {
        let mut inner = self.target.lock();
        require_stopped(inner.state)?;
        inner.register_reads += 1;
        Ok(inner.registers.clone())
    }

    fn memory(&mut self, address: u64, length: u64) -> VoltronResult<Vec<u8>> {
        let inner = self.target.lock();
        require_stopped(inner.state)?;
        for (base, bytes) in &inner.regions {
            let end = base + bytes.len() as u64;
            if address >= *base && address.saturating_add(length) <= end {
                let start = (address - base) as usize;
                return Ok(bytes[start..start + length as usize].to_vec());
            }
        }
        Err(VoltronError::InvalidAddress { address, length })
    }

    fn stack(&mut self, depth: usize) -> VoltronResult<Vec<StackFrame>> {
        require_depth(depth)?;
        let inner = self.target.lock();
        require_stopped(inner.state)?;
        let pc = inner.registers.first_of(PC_REGISTERS).unwrap_or(0);
        let frames = vec![
            StackFrame { pc, fp: 0x7100, symbol: Some("leaf".to_string()) },
            StackFrame { pc: 0x2000, fp: 0x7200, symbol: Some("main".to_string()) },
            StackFrame { pc: 0x3000, fp: 0, symbol: None },
        ];
        Ok(frames.into_iter().take(depth).collect())
    }

    fn disassemble(&mut self, address: u64, count: usize) -> VoltronResult<Vec<Instruction>> {
        require_stopped(self.target.lock().state)?;
        Ok((0..count as u64)
            .map(|i| Instruction::from_text(address + i, 1, "nop"))
            .collect())
    }

    fn breakpoints(&mut self) -> VoltronResult<Vec<Breakpoint>> {
        let mut inner = self.target.lock();
        inner.breakpoint_queries += 1;
        Ok(inner.breakpoints.clone())
    }

    fn set_breakpoint(&mut self, location: &BreakpointLocation) -> VoltronResult<Breakpoint> {
        let mut inner = self.target.lock();
        let id = inner.next_breakpoint;
        inner.next_breakpoint += 1;
        let addresses = match location {
            BreakpointLocation::Address(a) => vec![*a],
            BreakpointLocation::Symbol(_) => vec![0x1000],
        };
        let breakpoint = Breakpoint {
            id,
            location: location.clone(),
            addresses,
            enabled: true,
            hit_count: 0,
        };
        inner.breakpoints.push(breakpoint.clone());
        Ok(breakpoint)
    }

    fn remove_breakpoint(&mut self, id: BreakpointId) -> VoltronResult<()> {
        let mut inner = self.target.lock();
        let before = inner.breakpoints.len();
        inner.breakpoints.retain(|b| b.id != id);
        if inner.breakpoints.len() == before {
            return Err(VoltronError::NotFound(format!("breakpoint {}", id)));
        }
        Ok(())
    }

    fn install_event_hook(&mut self, notifier: StateNotifier) {
        self.target.lock().notifier = Some(notifier);
    }
}

pub fn fake_factory(handle: HostHandle) -> VoltronResult<Box<dyn DebuggerAdaptor>> {
    let target: FakeTarget = handle.downcast(HostKind::Lldb)?;
    Ok(target.adaptor())
}

/// Registry with the fake adaptor under lldb (dedicated worker) and gdb
/// (host-pumped worker).
pub fn fake_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    for (host, threading) in [
        (HostKind::Lldb, HostThreading::AnyThread),
        (HostKind::Gdb, HostThreading::EventLoopOnly),
    ] {
        registry
            .register_debugger(DebuggerPlugin {
                host,
                name: "fake",
                factory: fake_factory,
                threading,
            })
            .unwrap();
    }
    registry.register_builtin_views().unwrap();
    registry.seal();
    registry
}
