// Host shims
//
// Each submodule describes one host's native API as a trait and adapts it to
// `DebuggerAdaptor`. The host objects themselves are supplied by the loader.

pub mod gdb;
pub mod lldb;
pub mod vdb;
pub mod windbg;

use crate::error::VoltronError;
use crate::registry::DebuggerPlugin;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Lldb,
    Gdb,
    Windbg,
    Vdb,
}

impl HostKind {
    pub const ALL: [HostKind; 4] = [HostKind::Lldb, HostKind::Gdb, HostKind::Windbg, HostKind::Vdb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lldb => "lldb",
            Self::Gdb => "gdb",
            Self::Windbg => "windbg",
            Self::Vdb => "vdb",
        }
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostKind {
    type Err = VoltronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lldb" => Ok(Self::Lldb),
            "gdb" => Ok(Self::Gdb),
            "windbg" | "cdb" => Ok(Self::Windbg),
            "vdb" => Ok(Self::Vdb),
            _ => Err(VoltronError::UnsupportedHost(s.to_string())),
        }
    }
}

/// Where host API calls are allowed to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostThreading {
    /// Callable from a dedicated background thread
    AnyThread,
    /// Only callable from the host's own event loop; the host pumps the worker
    EventLoopOnly,
}

pub fn builtin_plugins() -> Vec<DebuggerPlugin> {
    vec![
        DebuggerPlugin {
            host: HostKind::Lldb,
            name: "lldb",
            factory: lldb::create_adaptor,
            threading: HostThreading::AnyThread,
        },
        DebuggerPlugin {
            host: HostKind::Gdb,
            name: "gdb",
            factory: gdb::create_adaptor,
            threading: HostThreading::EventLoopOnly,
        },
        DebuggerPlugin {
            host: HostKind::Windbg,
            name: "windbg (pykd)",
            factory: windbg::create_adaptor,
            threading: HostThreading::AnyThread,
        },
        DebuggerPlugin {
            host: HostKind::Vdb,
            name: "vdb (vtrace)",
            factory: vdb::create_adaptor,
            threading: HostThreading::AnyThread,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_kind_parse() {
        assert_eq!("LLDB".parse::<HostKind>().unwrap(), HostKind::Lldb);
        assert_eq!("cdb".parse::<HostKind>().unwrap(), HostKind::Windbg);
        assert!(matches!(
            "ollydbg".parse::<HostKind>(),
            Err(VoltronError::UnsupportedHost(_))
        ));
    }

    #[test]
    fn test_builtin_plugins_cover_every_host() {
        let plugins = builtin_plugins();
        for host in HostKind::ALL {
            assert_eq!(plugins.iter().filter(|p| p.host == host).count(), 1);
        }
        let gdb = plugins.iter().find(|p| p.host == HostKind::Gdb).unwrap();
        assert_eq!(gdb.threading, HostThreading::EventLoopOnly);
    }
}
