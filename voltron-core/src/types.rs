// Data model shared by adaptors, router and clients
//
// Everything here is a snapshot: values are only valid at the moment the
// adaptor produced them and are never mutated afterwards.

use crate::error::VoltronError;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub type BreakpointId = u32;

/// Lifecycle state of the target process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Launching,
    Running,
    Stopped,
    Exited,
    Detached,
    Invalid,
}

impl Lifecycle {
    /// The target can no longer be inspected through the current binding.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Detached)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Detached => "detached",
            Self::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Breakpoint,
    Step,
    Signal,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    #[serde(rename = "state")]
    pub lifecycle: Lifecycle,
    pub stop_reason: StopReason,
}

impl TargetState {
    pub const INVALID: TargetState = TargetState {
        lifecycle: Lifecycle::Invalid,
        stop_reason: StopReason::None,
    };

    pub fn new(lifecycle: Lifecycle, stop_reason: StopReason) -> Self {
        Self {
            lifecycle,
            stop_reason,
        }
    }

    pub fn running() -> Self {
        Self::new(Lifecycle::Running, StopReason::None)
    }

    pub fn stopped(reason: StopReason) -> Self {
        Self::new(Lifecycle::Stopped, reason)
    }

    pub fn exited() -> Self {
        Self::new(Lifecycle::Exited, StopReason::None)
    }
}

/// The process under inspection, as bound by `init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: u64,
    pub arch: String,
    pub executable: Option<String>,
}

impl TargetInfo {
    /// Pointer width in bytes, derived from the architecture name.
    pub fn pointer_size(&self) -> usize {
        pointer_size_for_arch(&self.arch)
    }
}

pub fn pointer_size_for_arch(arch: &str) -> usize {
    let arch = arch.to_ascii_lowercase();
    if arch.contains("64") {
        8
    } else if arch.starts_with("i386")
        || arch.starts_with("i686")
        || arch == "x86"
        || arch.starts_with("arm")
    {
        4
    } else {
        8
    }
}

/// Ordered register name -> value snapshot. Serializes as a JSON object that
/// keeps host order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSet(Vec<(String, u64)>);

impl RegisterSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: u64) {
        self.0.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| *v)
    }

    /// First register present from a list of candidate names.
    pub fn first_of(&self, names: &[&str]) -> Option<u64> {
        names.iter().find_map(|name| self.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, u64)> for RegisterSet {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for RegisterSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

pub const PC_REGISTERS: &[&str] = &["rip", "eip", "pc", "ip"];
pub const SP_REGISTERS: &[&str] = &["rsp", "esp", "sp"];

/// One frame of a backtrace. Sequences are always innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub pc: u64,
    pub fp: u64,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub address: u64,
    pub size: u32,
    pub mnemonic: String,
    pub operands: String,
}

impl Instruction {
    /// Split a host's one-line disassembly ("mov rax, rbx") into parts.
    pub fn from_text(address: u64, size: u32, text: &str) -> Self {
        let text = text.trim();
        let (mnemonic, operands) = match text.split_once(char::is_whitespace) {
            Some((m, ops)) => (m.to_string(), ops.trim().to_string()),
            None => (text.to_string(), String::new()),
        };
        Self {
            address,
            size,
            mnemonic,
            operands,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointLocation {
    Address(u64),
    Symbol(String),
}

impl FromStr for BreakpointLocation {
    type Err = VoltronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VoltronError::InvalidArguments(
                "empty breakpoint location".to_string(),
            ));
        }
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            return u64::from_str_radix(hex, 16)
                .map(BreakpointLocation::Address)
                .map_err(|_| VoltronError::InvalidArguments(format!("bad address: {}", s)));
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse()
                .map(BreakpointLocation::Address)
                .map_err(|_| VoltronError::InvalidArguments(format!("bad address: {}", s)));
        }
        Ok(BreakpointLocation::Symbol(s.to_string()))
    }
}

impl fmt::Display for BreakpointLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(addr) => write!(f, "{:#x}", addr),
            Self::Symbol(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub location: BreakpointLocation,
    /// Resolved load addresses, empty while pending
    pub addresses: Vec<u64>,
    pub enabled: bool,
    pub hit_count: u32,
}

/// Lowercase hex encoding used for memory payloads
pub fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}
