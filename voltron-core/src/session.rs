// Session context
//
// The loader boundary. One Session per debugger session: it owns the worker,
// the event bridge, the router and its runtime, and the command dispatcher.
// Nothing here is global.

use crate::adaptor::HostHandle;
use crate::commands::{CommandDispatcher, CommandOutput};
use crate::config::Config;
use crate::error::{VoltronError, VoltronResult};
use crate::events::EventBridge;
use crate::hosts::{HostKind, HostThreading};
use crate::registry::PluginRegistry;
use crate::router::{PendingReply, Router};
use crate::worker::{spawn_dedicated, work_queue, Limits, WorkQueue, WorkerPump};
use anyhow::Context;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle as TaskHandle;
use tracing::{debug, info};

/// Sleep between pumps while a command waits on a host-driven worker
const PUMP_INTERVAL: Duration = Duration::from_millis(1);

enum WorkerMode {
    Dedicated(Option<JoinHandle<()>>),
    Pumped(WorkerPump),
}

pub struct Session {
    host: HostKind,
    runtime: Runtime,
    queue: WorkQueue,
    router: Arc<Router>,
    dispatcher: CommandDispatcher,
    worker: WorkerMode,
    config: Config,
    listeners: Vec<TaskHandle<()>>,
    socket_path: Option<PathBuf>,
}

impl Session {
    /// Resolve the host plugin and bring up the worker, bridge, router and
    /// dispatcher. Registry failures are fatal; a missing target is not.
    pub fn start(
        registry: PluginRegistry,
        host: HostKind,
        handle: HostHandle,
        config: Config,
    ) -> VoltronResult<Self> {
        let plugin = *registry.plugin_for_host(host)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("voltron-io")
            .enable_all()
            .build()
            .map_err(|e| VoltronError::Unsupported(format!("cannot start runtime: {}", e)))?;

        let (queue, jobs) = work_queue();
        let bridge = EventBridge::new(queue.clone());
        let limits = Limits::from(&config);
        let worker = match plugin.threading {
            HostThreading::AnyThread => WorkerMode::Dedicated(Some(spawn_dedicated(
                plugin.factory,
                handle,
                limits,
                bridge.notifier(),
                jobs,
            )?)),
            HostThreading::EventLoopOnly => WorkerMode::Pumped(WorkerPump::new(
                plugin.factory,
                handle,
                limits,
                bridge.notifier(),
                jobs,
            )?),
        };

        let router = Arc::new(Router::new(
            Arc::new(registry),
            bridge,
            queue.clone(),
            &config,
            runtime.handle().clone(),
        ));
        let dispatcher = CommandDispatcher::new(router.clone());
        info!("session started for {} (plugin '{}')", host, plugin.name);

        Ok(Self {
            host,
            runtime,
            queue,
            router,
            dispatcher,
            worker,
            config,
            listeners: Vec::new(),
            socket_path: None,
        })
    }

    pub fn host(&self) -> HostKind {
        self.host
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Start the configured listeners.
    pub fn listen(&mut self) -> anyhow::Result<()> {
        if let Some(path) = self.config.server.unix_socket.clone() {
            let listener = {
                let _guard = self.runtime.enter();
                Router::bind_unix(&path)
                    .with_context(|| format!("Failed to bind {}", path.display()))?
            };
            self.listeners
                .push(self.runtime.spawn(self.router.clone().serve_unix(listener)));
            self.socket_path = Some(path);
        }
        if let Some(addr) = self.config.server.tcp.clone() {
            let listener = self
                .runtime
                .block_on(TcpListener::bind(&addr))
                .with_context(|| format!("Failed to bind {}", addr))?;
            info!("listening on tcp {}", addr);
            self.listeners
                .push(self.runtime.spawn(self.router.clone().serve_tcp(listener)));
        }
        if self.listeners.is_empty() {
            debug!("no listeners configured");
        }
        Ok(())
    }

    /// Run one command for the host's command line.
    pub fn run_command(&mut self, line: &str) -> VoltronResult<CommandOutput> {
        let Self {
            dispatcher, worker, ..
        } = self;
        dispatcher.execute(line, |pending| resolve(worker, pending))
    }

    /// Drive a host-driven worker. The host calls this from its own event
    /// loop; dedicated workers need no pumping.
    pub fn pump(&mut self) -> usize {
        match &mut self.worker {
            WorkerMode::Pumped(pump) => pump.pump(),
            WorkerMode::Dedicated(_) => 0,
        }
    }

    pub fn is_host_driven(&self) -> bool {
        matches!(self.worker, WorkerMode::Pumped(_))
    }

    /// Stop the listeners and the worker. Idempotent.
    pub fn shutdown(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
        self.queue.shutdown();
        match &mut self.worker {
            WorkerMode::Dedicated(thread) => {
                if let Some(thread) = thread.take() {
                    let _ = thread.join();
                    info!("session for {} shut down", self.host);
                }
            }
            WorkerMode::Pumped(pump) => {
                if !pump.is_stopped() {
                    pump.pump();
                    info!("session for {} shut down", self.host);
                }
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve(worker: &mut WorkerMode, mut pending: PendingReply) -> VoltronResult<Value> {
    match worker {
        WorkerMode::Dedicated(_) => pending.blocking_recv(),
        WorkerMode::Pumped(pump) => loop {
            pump.pump();
            if let Some(result) = pending.try_recv() {
                return result;
            }
            if pump.is_stopped() {
                return Err(VoltronError::TargetGone("worker stopped".to_string()));
            }
            std::thread::sleep(PUMP_INTERVAL);
        },
    }
}
