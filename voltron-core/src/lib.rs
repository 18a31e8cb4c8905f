// Voltron debugger integration core
//
// Presents one capability interface over several host debuggers and brokers
// requests from view clients against whichever host is active:
// - Adaptor interface and per-host shims
// - Plugin registry
// - Single-worker request queue and event bridge
// - Request router and wire protocol
// - Command dispatcher and session context

pub mod adaptor;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod hosts;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod types;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use adaptor::{AdaptorFactory, DebuggerAdaptor, HostHandle};
pub use commands::{CommandDispatcher, CommandOutput};
pub use config::Config;
pub use error::{ErrorKind, VoltronError, VoltronResult};
pub use events::{HostEvent, StateNotifier};
pub use hosts::{HostKind, HostThreading};
pub use protocol::{Request, RequestKind, Response, ViewKind};
pub use registry::PluginRegistry;
pub use router::{Router, Subscription};
pub use session::Session;
