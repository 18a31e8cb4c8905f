// Single-worker request queue
//
// Every host call goes through one queue drained by exactly one worker. The
// worker either runs on a dedicated thread (hosts callable from anywhere) or
// is pumped by the host's own event loop (hosts bound to their own thread).

use crate::adaptor::{AdaptorFactory, DebuggerAdaptor, HostHandle};
use crate::config::Config;
use crate::error::{VoltronError, VoltronResult};
use crate::events::StateNotifier;
use crate::protocol::{Address, ClientId, Reply, Request, RequestKind, SubscriptionId, API_VERSION};
use crate::types::{hex_encode, Breakpoint, Lifecycle, TargetInfo, TargetState};
use bytes::Buf;
use serde::Serialize;
use serde_json::{json, Value};
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Longest pointer chain followed by `dereference`
pub const MAX_DEREFERENCE_HOPS: usize = 8;

/// Where a connection's replies go
pub type ReplySink = mpsc::UnboundedSender<Reply>;

/// A request bound to the connection that submitted it
#[derive(Debug)]
pub struct RequestJob {
    pub client: ClientId,
    pub request: Request,
    pub sink: ReplySink,
    /// Set when the job is a view update
    pub subscription: Option<SubscriptionId>,
}

impl RequestJob {
    /// Returns false when the connection is gone.
    pub fn reply(self, result: VoltronResult<Value>) -> bool {
        let reply = Reply {
            id: self.request.id,
            subscription: self.subscription,
            result,
        };
        self.sink.send(reply).is_ok()
    }
}

#[derive(Debug)]
pub enum Job {
    Request(RequestJob),
    /// A reply produced without the adaptor, queued to keep per-client order
    Deliver(ReplySink, Reply),
    Shutdown,
}

/// Sending half of the queue. Sends never block, so host event hooks can
/// submit from any thread.
#[derive(Clone, Debug)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl WorkQueue {
    pub fn submit(&self, job: RequestJob) -> bool {
        if self.tx.send(Job::Request(job)).is_err() {
            warn!("worker stopped, request dropped");
            return false;
        }
        true
    }

    pub fn deliver(&self, sink: &ReplySink, reply: Reply) -> bool {
        self.tx.send(Job::Deliver(sink.clone(), reply)).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Job::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn work_queue() -> (WorkQueue, mpsc::UnboundedReceiver<Job>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkQueue { tx }, rx)
}

/// Request size bounds enforced by the worker
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_memory_read: u64,
    pub max_stack_depth: usize,
}

impl From<&Config> for Limits {
    fn from(config: &Config) -> Self {
        Self {
            max_memory_read: config.max_memory_read,
            max_stack_depth: config.max_stack_depth,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

fn body<T: Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Owns the adaptor and the session fields nobody else may touch.
pub struct Worker {
    adaptor: Box<dyn DebuggerAdaptor>,
    limits: Limits,
    target: Option<TargetInfo>,
    /// Set when the bound target exited; cleared only by `init`
    gone: bool,
    last_state: TargetState,
    breakpoint_cache: Option<Vec<Breakpoint>>,
}

impl Worker {
    pub fn new(mut adaptor: Box<dyn DebuggerAdaptor>, limits: Limits, notifier: StateNotifier) -> Self {
        adaptor.install_event_hook(notifier);
        let last_state = adaptor.target_state();
        let mut worker = Self {
            adaptor,
            limits,
            target: None,
            gone: false,
            last_state,
            breakpoint_cache: None,
        };
        match worker.adaptor.bind_target() {
            Ok(target) => {
                info!("bound to target {} ({})", target.id, target.arch);
                worker.target = Some(target);
            }
            Err(e) => debug!("no target at startup: {}", e),
        }
        worker
    }

    pub fn target(&self) -> Option<&TargetInfo> {
        self.target.as_ref()
    }

    /// Execute one job. Returns false on shutdown.
    pub fn handle(&mut self, job: Job) -> bool {
        match job {
            Job::Shutdown => return false,
            Job::Deliver(sink, reply) => {
                let _ = sink.send(reply);
            }
            Job::Request(job) => {
                if job.sink.is_closed() {
                    debug!("client {} gone, skipping {}", job.client, job.request.kind.name());
                    return true;
                }
                self.observe();
                let result = self.execute(&job.request.kind);
                if let Err(e) = &result {
                    debug!("{} for client {} failed: {}", job.request.kind.name(), job.client, e);
                }
                let client = job.client;
                if !job.reply(result) {
                    debug!("client {} disconnected mid-call, result discarded", client);
                }
            }
        }
        true
    }

    /// Refresh the cached state, dropping whatever a transition invalidates.
    fn observe(&mut self) -> TargetState {
        let state = self.adaptor.target_state();
        if state != self.last_state {
            debug!("target {} -> {}", self.last_state.lifecycle, state.lifecycle);
            self.breakpoint_cache = None;
            if state.lifecycle.is_terminal() {
                if let Some(target) = self.target.take() {
                    info!("target {} is {}, unbinding", target.id, state.lifecycle);
                    self.gone = true;
                }
            }
            self.last_state = state;
        }
        state
    }

    fn require_target(&mut self) -> VoltronResult<&TargetInfo> {
        if self.gone {
            return Err(VoltronError::TargetGone(
                "target exited; run init to bind a new one".to_string(),
            ));
        }
        if self.target.is_none() {
            let target = self.adaptor.bind_target()?;
            info!("bound to target {} ({})", target.id, target.arch);
            self.target = Some(target);
        }
        self.target
            .as_ref()
            .ok_or_else(|| VoltronError::TargetGone("no target".to_string()))
    }

    fn resolve(&mut self, address: Address) -> VoltronResult<u64> {
        match address {
            Address::Absolute(a) => Ok(a),
            Address::ProgramCounter => self.adaptor.program_counter(),
            Address::StackPointer => self.adaptor.stack_pointer(),
        }
    }

    fn execute(&mut self, kind: &RequestKind) -> VoltronResult<Value> {
        match kind {
            RequestKind::Version => Ok(json!({
                "api_version": API_VERSION,
                "host": self.adaptor.host(),
                "host_version": self.adaptor.host_version(),
            })),
            RequestKind::State | RequestKind::Wait => Ok(body(self.last_state)),
            RequestKind::Targets => {
                let targets: Vec<&TargetInfo> = self.target.iter().collect();
                Ok(json!({ "targets": targets }))
            }
            RequestKind::Init => {
                let target = self.adaptor.bind_target()?;
                info!("init: bound to target {} ({})", target.id, target.arch);
                self.gone = false;
                self.breakpoint_cache = None;
                let value = json!({ "target": &target });
                self.target = Some(target);
                Ok(value)
            }
            RequestKind::Registers => {
                self.require_target()?;
                Ok(body(self.adaptor.registers()?))
            }
            RequestKind::Memory { address, length } => {
                self.require_target()?;
                if *length > self.limits.max_memory_read {
                    return Err(VoltronError::InvalidArguments(format!(
                        "length {} exceeds maximum read of {} bytes",
                        length, self.limits.max_memory_read
                    )));
                }
                let address = self.resolve(*address)?;
                let bytes = self.adaptor.memory(address, *length)?;
                Ok(json!({
                    "address": address,
                    "length": bytes.len(),
                    "bytes": hex_encode(&bytes),
                }))
            }
            RequestKind::Stack { depth } => {
                self.require_target()?;
                let depth = (*depth).min(self.limits.max_stack_depth);
                Ok(json!({ "frames": self.adaptor.stack(depth)? }))
            }
            RequestKind::Disassemble { address, count } => {
                self.require_target()?;
                let address = self.resolve(*address)?;
                Ok(json!({ "instructions": self.adaptor.disassemble(address, *count)? }))
            }
            RequestKind::Dereference { address } => {
                let pointer_size = self.require_target()?.pointer_size();
                let start = self.resolve(*address)?;
                self.dereference(start, pointer_size)
            }
            RequestKind::Breakpoints => {
                self.require_target()?;
                if self.breakpoint_cache.is_none() {
                    self.breakpoint_cache = Some(self.adaptor.breakpoints()?);
                }
                Ok(json!({ "breakpoints": &self.breakpoint_cache }))
            }
            RequestKind::SetBreakpoint { location } => {
                self.require_target()?;
                self.breakpoint_cache = None;
                let breakpoint = self.adaptor.set_breakpoint(location)?;
                info!("breakpoint {} set at {}", breakpoint.id, location);
                Ok(json!({ "breakpoint": breakpoint }))
            }
            RequestKind::RemoveBreakpoint { id } => {
                self.require_target()?;
                self.breakpoint_cache = None;
                self.adaptor.remove_breakpoint(*id)?;
                info!("breakpoint {} removed", id);
                Ok(json!({ "removed": id }))
            }
            RequestKind::Plugins | RequestKind::Subscribe { .. } | RequestKind::Unsubscribe { .. } => {
                Err(VoltronError::Unsupported(format!(
                    "{} is answered by the router",
                    kind.name()
                )))
            }
        }
    }

    fn dereference(&mut self, start: u64, pointer_size: usize) -> VoltronResult<Value> {
        let mut chain = vec![start];
        let mut current = start;
        let mut end = "limit";
        for _ in 0..MAX_DEREFERENCE_HOPS {
            let bytes = match self.adaptor.memory(current, pointer_size as u64) {
                Ok(bytes) => bytes,
                Err(VoltronError::InvalidAddress { .. }) => {
                    end = "unreadable";
                    break;
                }
                Err(e) => return Err(e),
            };
            let mut buf = &bytes[..];
            let next = match (pointer_size, buf.remaining()) {
                (8, 8) => buf.get_u64_le(),
                (4, 4) => u64::from(buf.get_u32_le()),
                _ => {
                    end = "unreadable";
                    break;
                }
            };
            if chain.contains(&next) {
                end = "cycle";
                break;
            }
            chain.push(next);
            current = next;
        }
        Ok(json!({ "chain": chain, "end": end }))
    }
}

/// Start the worker on its own thread. The adaptor is constructed there so
/// it never crosses threads.
pub fn spawn_dedicated(
    factory: AdaptorFactory,
    handle: HostHandle,
    limits: Limits,
    notifier: StateNotifier,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) -> VoltronResult<JoinHandle<()>> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let thread = std::thread::Builder::new()
        .name("voltron-worker".to_string())
        .spawn(move || {
            let adaptor = match factory(handle) {
                Ok(adaptor) => {
                    let _ = ready_tx.send(Ok(()));
                    adaptor
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let mut worker = Worker::new(adaptor, limits, notifier);
            info!("worker started for {}", worker.adaptor.host());
            while let Some(job) = jobs.blocking_recv() {
                if !worker.handle(job) {
                    break;
                }
            }
            info!("worker stopped");
        })
        .map_err(|e| VoltronError::Unsupported(format!("cannot start worker thread: {}", e)))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(thread),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            error!("worker thread exited during startup");
            Err(VoltronError::Unsupported("worker thread exited during startup".to_string()))
        }
    }
}

/// Worker driven by the host's own event loop.
pub struct WorkerPump {
    worker: Worker,
    jobs: mpsc::UnboundedReceiver<Job>,
    stopped: bool,
}

impl WorkerPump {
    /// Builds the adaptor on the calling thread, which must be the host's.
    pub fn new(
        factory: AdaptorFactory,
        handle: HostHandle,
        limits: Limits,
        notifier: StateNotifier,
        jobs: mpsc::UnboundedReceiver<Job>,
    ) -> VoltronResult<Self> {
        let adaptor = factory(handle)?;
        let worker = Worker::new(adaptor, limits, notifier);
        info!("worker pump ready for {}", worker.adaptor.host());
        Ok(Self {
            worker,
            jobs,
            stopped: false,
        })
    }

    /// Drain everything queued so far. Returns the number of jobs handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while !self.stopped {
            match self.jobs.try_recv() {
                Ok(job) => {
                    handled += 1;
                    if !self.worker.handle(job) {
                        info!("worker pump stopped");
                        self.stopped = true;
                    }
                }
                Err(_) => break,
            }
        }
        handled
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn state(&self) -> Lifecycle {
        self.worker.last_state.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::FakeTarget;
    use crate::types::{BreakpointLocation, StopReason};

    fn worker(target: &FakeTarget) -> Worker {
        Worker::new(target.adaptor(), Limits::default(), StateNotifier::detached())
    }

    fn run(worker: &mut Worker, kind: RequestKind) -> VoltronResult<Value> {
        let (sink, mut out) = mpsc::unbounded_channel();
        let job = RequestJob {
            client: 1,
            request: Request::new(kind),
            sink,
            subscription: None,
        };
        assert!(worker.handle(Job::Request(job)));
        out.try_recv().expect("one reply").result
    }

    #[test]
    fn test_registers_follow_state() {
        let target = FakeTarget::new();
        let mut worker = worker(&target);
        let regs = run(&mut worker, RequestKind::Registers).unwrap();
        assert_eq!(regs["rax"], 0);

        target.set_state(TargetState::running());
        let err = run(&mut worker, RequestKind::Registers).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotStopped);
    }

    #[test]
    fn test_memory_anchor_and_limit() {
        let target = FakeTarget::new();
        target.map(0x7000, vec![0xaa; 32]);
        target.set_register("rsp", 0x7000);
        let mut worker = worker(&target);

        let mem = run(
            &mut worker,
            RequestKind::Memory { address: Address::StackPointer, length: 4 },
        )
        .unwrap();
        assert_eq!(mem["address"], 0x7000);
        assert_eq!(mem["bytes"], "aaaaaaaa");

        let err = run(
            &mut worker,
            RequestKind::Memory { address: Address::Absolute(0x7000), length: 64 },
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidAddress);

        let err = run(
            &mut worker,
            RequestKind::Memory { address: Address::Absolute(0), length: 2 * 1024 * 1024 },
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn test_target_gone_until_init() {
        let target = FakeTarget::new();
        let mut worker = worker(&target);
        assert!(worker.target().is_some());

        target.set_state(TargetState::exited());
        let err = run(&mut worker, RequestKind::Registers).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TargetGone);
        assert!(worker.target().is_none());

        target.set_state(TargetState::stopped(StopReason::Breakpoint));
        let err = run(&mut worker, RequestKind::Registers).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TargetGone);

        let init = run(&mut worker, RequestKind::Init).unwrap();
        assert_eq!(init["target"]["arch"], "x86_64");
        assert!(run(&mut worker, RequestKind::Registers).is_ok());
    }

    #[test]
    fn test_dereference_chain_stops_at_cycle() {
        let target = FakeTarget::new();
        target.map(0x7000, 0x7010u64.to_le_bytes().to_vec());
        target.map(0x7010, 0x7020u64.to_le_bytes().to_vec());
        target.map(0x7020, 0x7000u64.to_le_bytes().to_vec());
        let mut worker = worker(&target);

        let result = run(&mut worker, RequestKind::Dereference { address: Address::Absolute(0x7000) }).unwrap();
        assert_eq!(result["chain"], json!([0x7000, 0x7010, 0x7020]));
        assert_eq!(result["end"], "cycle");

        let result = run(&mut worker, RequestKind::Dereference { address: Address::Absolute(0x10) }).unwrap();
        assert_eq!(result["chain"], json!([0x10]));
        assert_eq!(result["end"], "unreadable");
    }

    #[test]
    fn test_breakpoint_cache_invalidated_by_changes() {
        let target = FakeTarget::new();
        let mut worker = worker(&target);

        run(&mut worker, RequestKind::Breakpoints).unwrap();
        run(&mut worker, RequestKind::Breakpoints).unwrap();
        assert_eq!(target.breakpoint_queries(), 1);

        let set = run(
            &mut worker,
            RequestKind::SetBreakpoint { location: BreakpointLocation::Symbol("main".into()) },
        )
        .unwrap();
        assert_eq!(set["breakpoint"]["id"], 1);
        let list = run(&mut worker, RequestKind::Breakpoints).unwrap();
        assert_eq!(list["breakpoints"].as_array().map(Vec::len), Some(1));
        assert_eq!(target.breakpoint_queries(), 2);

        let err = run(&mut worker, RequestKind::RemoveBreakpoint { id: 9 }).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_closed_sink_is_skipped() {
        let target = FakeTarget::new();
        let mut worker = worker(&target);
        let (sink, out) = mpsc::unbounded_channel();
        drop(out);
        let job = RequestJob {
            client: 1,
            request: Request::new(RequestKind::Registers),
            sink,
            subscription: None,
        };
        assert!(worker.handle(Job::Request(job)));
        assert_eq!(target.register_reads(), 0);
        assert!(!worker.handle(Job::Shutdown));
    }

    #[test]
    fn test_pump_drains_queue() {
        let target = FakeTarget::new();
        let (queue, rx) = work_queue();
        let mut pump = WorkerPump::new(
            crate::test_support::fake_factory,
            target.handle(),
            Limits::default(),
            StateNotifier::detached(),
            rx,
        )
        .unwrap();

        let (sink, mut out) = mpsc::unbounded_channel();
        for _ in 0..3 {
            queue.submit(RequestJob {
                client: 1,
                request: Request::new(RequestKind::State),
                sink: sink.clone(),
                subscription: None,
            });
        }
        assert_eq!(pump.pump(), 3);
        assert_eq!(pump.pump(), 0);
        assert!(out.try_recv().is_ok());

        queue.shutdown();
        pump.pump();
        assert!(pump.is_stopped());
    }

    #[test]
    fn test_dedicated_startup_failure() {
        let (_queue, rx) = work_queue();
        let err = spawn_dedicated(
            crate::test_support::fake_factory,
            HostHandle::new("wrong"),
            Limits::default(),
            StateNotifier::detached(),
            rx,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }
}
