// Command dispatcher
//
// The closed command vocabulary behind the host's `voltron` command:
//   init | view <kind> | break <location> | delete <id> | status | breakpoints
// Each command becomes one or more router calls from the dispatcher's own
// client id.

use crate::error::{VoltronError, VoltronResult};
use crate::protocol::{ClientId, Request, RequestKind};
use crate::router::{PendingReply, Router, Subscription};
use crate::types::{Breakpoint, BreakpointId, BreakpointLocation, StopReason, TargetInfo, TargetState};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub enum CommandOutput {
    Message(String),
    /// `view` hands back the live subscription
    Subscribed {
        message: String,
        subscription: Subscription,
    },
}

impl CommandOutput {
    pub fn message(&self) -> &str {
        match self {
            Self::Message(message) | Self::Subscribed { message, .. } => message,
        }
    }
}

fn decode<T: DeserializeOwned>(value: &Value) -> VoltronResult<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| VoltronError::Unsupported(format!("unexpected reply: {}", e)))
}

fn describe_target(target: &TargetInfo) -> String {
    match &target.executable {
        Some(exe) => format!("target {} ({}, {})", target.id, target.arch, exe),
        None => format!("target {} ({})", target.id, target.arch),
    }
}

fn describe_breakpoint(bp: &Breakpoint) -> String {
    let mut line = format!("{}: {}", bp.id, bp.location);
    if !bp.addresses.is_empty() {
        let addrs: Vec<String> = bp.addresses.iter().map(|a| format!("{:#x}", a)).collect();
        line.push_str(&format!(" at {}", addrs.join(", ")));
    }
    if !bp.enabled {
        line.push_str(" (disabled)");
    }
    if bp.hit_count > 0 {
        line.push_str(&format!(", hit {} time(s)", bp.hit_count));
    }
    line
}

pub struct CommandDispatcher {
    router: Arc<Router>,
    client: ClientId,
}

impl CommandDispatcher {
    pub fn new(router: Arc<Router>) -> Self {
        let client = router.open_client();
        Self { router, client }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Run one command line. `resolve` waits for a router reply in whatever
    /// way the caller's thread allows.
    pub fn execute<F>(&self, line: &str, mut resolve: F) -> VoltronResult<CommandOutput>
    where
        F: FnMut(PendingReply) -> VoltronResult<Value>,
    {
        let words = shellwords::split(line)
            .map_err(|_| VoltronError::InvalidArguments("mismatched quotes".to_string()))?;
        let (name, args) = words
            .split_first()
            .ok_or_else(|| VoltronError::InvalidArguments("empty command".to_string()))?;
        debug!("command {} {:?}", name, args);

        let mut call = |kind: RequestKind| resolve(self.router.request(self.client, Request::new(kind)));

        match name.as_str() {
            "init" => {
                no_args(name, args)?;
                let body = call(RequestKind::Init)?;
                let target: TargetInfo = decode(&body["target"])?;
                Ok(CommandOutput::Message(format!("Bound to {}", describe_target(&target))))
            }
            "view" => {
                let kind = one_arg(name, args, "<kind>")?;
                let view = self
                    .router
                    .registry()
                    .view(kind)
                    .ok_or_else(|| VoltronError::InvalidArguments(format!("unknown view kind: {}", kind)))?
                    .kind;
                let subscription = self.router.subscribe(self.client, view);
                Ok(CommandOutput::Subscribed {
                    message: format!("Subscribed to {} view ({})", view, subscription.id),
                    subscription,
                })
            }
            "break" => {
                let location: BreakpointLocation = one_arg(name, args, "<location>")?.parse()?;
                let body = call(RequestKind::SetBreakpoint { location })?;
                let bp: Breakpoint = decode(&body["breakpoint"])?;
                Ok(CommandOutput::Message(format!("Breakpoint {}", describe_breakpoint(&bp))))
            }
            "delete" => {
                let raw = one_arg(name, args, "<id>")?;
                let id: BreakpointId = raw
                    .parse()
                    .map_err(|_| VoltronError::InvalidArguments(format!("bad breakpoint id: {}", raw)))?;
                call(RequestKind::RemoveBreakpoint { id })?;
                Ok(CommandOutput::Message(format!("Deleted breakpoint {}", id)))
            }
            "status" => {
                no_args(name, args)?;
                let state: TargetState = decode(&call(RequestKind::State)?)?;
                let targets = call(RequestKind::Targets)?;
                let targets: Vec<TargetInfo> = decode(&targets["targets"])?;
                let status = self.router.status();

                let mut message = match targets.first() {
                    Some(target) => format!("{}: {}", describe_target(target), state.lifecycle),
                    None => format!("no target bound: {}", state.lifecycle),
                };
                if state.stop_reason != StopReason::None {
                    message.push_str(&format!(" ({:?})", state.stop_reason).to_lowercase());
                }
                message.push_str(&format!(
                    "\n{} client(s), {} blocked request(s), {} view subscription(s)",
                    status.connections, status.pending, status.subscriptions
                ));
                Ok(CommandOutput::Message(message))
            }
            "breakpoints" => {
                no_args(name, args)?;
                let body = call(RequestKind::Breakpoints)?;
                let breakpoints: Vec<Breakpoint> = decode(&body["breakpoints"])?;
                if breakpoints.is_empty() {
                    return Ok(CommandOutput::Message("No breakpoints".to_string()));
                }
                let lines: Vec<String> = breakpoints.iter().map(describe_breakpoint).collect();
                Ok(CommandOutput::Message(lines.join("\n")))
            }
            other => Err(VoltronError::UnknownCommand(other.to_string())),
        }
    }
}

fn no_args(name: &str, args: &[String]) -> VoltronResult<()> {
    if !args.is_empty() {
        return Err(VoltronError::InvalidArguments(format!("{} takes no arguments", name)));
    }
    Ok(())
}

fn one_arg<'a>(name: &str, args: &'a [String], usage: &str) -> VoltronResult<&'a str> {
    match args {
        [arg] => Ok(arg.as_str()),
        _ => Err(VoltronError::InvalidArguments(format!("usage: {} {}", name, usage))),
    }
}
