// Plugin registry
//
// Populated once at startup, then sealed. After sealing every registration
// is rejected and lookups are read-only.

use crate::adaptor::AdaptorFactory;
use crate::error::{VoltronError, VoltronResult};
use crate::hosts::{self, HostKind, HostThreading};
use crate::protocol::ViewKind;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Binds a host kind to the constructor of its adaptor
#[derive(Debug, Clone, Copy)]
pub struct DebuggerPlugin {
    pub host: HostKind,
    pub name: &'static str,
    pub factory: AdaptorFactory,
    pub threading: HostThreading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ViewPlugin {
    pub name: &'static str,
    pub kind: ViewKind,
    pub aliases: &'static [&'static str],
}

impl ViewPlugin {
    fn answers_to(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name) || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

pub fn builtin_views() -> Vec<ViewPlugin> {
    vec![
        ViewPlugin { name: "registers", kind: ViewKind::Registers, aliases: &["reg", "regs", "r"] },
        ViewPlugin { name: "stack", kind: ViewKind::Stack, aliases: &["s", "st"] },
        ViewPlugin { name: "disassembly", kind: ViewKind::Disassembly, aliases: &["disasm", "dis", "d"] },
        ViewPlugin { name: "backtrace", kind: ViewKind::Backtrace, aliases: &["bt", "b"] },
        ViewPlugin { name: "breakpoints", kind: ViewKind::Breakpoints, aliases: &["bp"] },
    ]
}

#[derive(Debug, Default)]
pub struct PluginRegistry {
    debuggers: Vec<DebuggerPlugin>,
    views: Vec<ViewPlugin>,
    sealed: bool,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every built-in host and view plugin, then seal.
    pub fn register_plugins() -> VoltronResult<Self> {
        let mut registry = Self::new();
        for plugin in hosts::builtin_plugins() {
            registry.register_debugger(plugin)?;
        }
        registry.register_builtin_views()?;
        registry.seal();
        Ok(registry)
    }

    pub fn register_builtin_views(&mut self) -> VoltronResult<()> {
        for view in builtin_views() {
            self.register_view(view)?;
        }
        Ok(())
    }

    fn check_open(&self, what: &str) -> VoltronResult<()> {
        if self.sealed {
            return Err(VoltronError::DuplicateRegistration(format!(
                "registry is sealed, cannot register {}",
                what
            )));
        }
        Ok(())
    }

    /// The first registration for a host stays authoritative.
    pub fn register_debugger(&mut self, plugin: DebuggerPlugin) -> VoltronResult<()> {
        self.check_open(plugin.host.as_str())?;
        if let Some(existing) = self.debuggers.iter().find(|p| p.host == plugin.host) {
            return Err(VoltronError::DuplicateRegistration(format!(
                "{} already registered by plugin '{}'",
                plugin.host, existing.name
            )));
        }
        debug!("registered {} plugin '{}'", plugin.host, plugin.name);
        self.debuggers.push(plugin);
        Ok(())
    }

    pub fn register_view(&mut self, view: ViewPlugin) -> VoltronResult<()> {
        self.check_open(view.name)?;
        let clash = std::iter::once(view.name)
            .chain(view.aliases.iter().copied())
            .find(|name| self.views.iter().any(|v| v.answers_to(name)));
        if let Some(name) = clash {
            return Err(VoltronError::DuplicateRegistration(format!(
                "view name '{}' already taken",
                name
            )));
        }
        debug!("registered view '{}'", view.name);
        self.views.push(view);
        Ok(())
    }

    pub fn seal(&mut self) {
        if !self.sealed {
            info!(
                "plugin registry sealed: {} host(s), {} view(s)",
                self.debuggers.len(),
                self.views.len()
            );
        }
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn plugin_for_host(&self, host: HostKind) -> VoltronResult<&DebuggerPlugin> {
        self.debuggers
            .iter()
            .find(|p| p.host == host)
            .ok_or_else(|| VoltronError::UnsupportedHost(host.to_string()))
    }

    pub fn adaptor_for_host(&self, host: HostKind) -> VoltronResult<AdaptorFactory> {
        self.plugin_for_host(host).map(|p| p.factory)
    }

    /// Look a view up by name or alias.
    pub fn view(&self, name: &str) -> Option<&ViewPlugin> {
        self.views.iter().find(|v| v.answers_to(name))
    }

    pub fn views(&self) -> &[ViewPlugin] {
        &self.views
    }

    /// Body of the `plugins` request
    pub fn describe(&self) -> Value {
        let debuggers: Vec<Value> = self
            .debuggers
            .iter()
            .map(|p| json!({"host": p.host, "name": p.name, "threading": p.threading}))
            .collect();
        json!({ "debuggers": debuggers, "views": self.views })
    }
}
