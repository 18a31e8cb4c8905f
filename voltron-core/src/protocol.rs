// Client wire protocol
//
// Newline-delimited JSON. Requests:
//   {"type": <kind>, "args": {...}, "block": <bool>, "id": <optional, echoed>}
// Responses:
//   {"status": "ok"|"error", "body": {...}, "error_kind": <present iff error>}

use crate::config::ViewConfig;
use crate::error::{ErrorKind, VoltronError, VoltronResult};
use crate::types::{BreakpointId, BreakpointLocation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub type ClientId = u64;
pub type SubscriptionId = u64;

pub const API_VERSION: &str = "1.1";

/// Longest accepted request line
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

const DEFAULT_STACK_DEPTH: usize = 64;
const DEFAULT_DISASSEMBLY_COUNT: usize = 16;

/// Address argument: absolute, or resolved from the register snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Absolute(u64),
    ProgramCounter,
    StackPointer,
}

impl Address {
    fn from_value(value: &Value) -> Result<Self, String> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .map(Address::Absolute)
                .ok_or_else(|| format!("address out of range: {}", n)),
            Value::String(s) => match s.as_str() {
                "pc" => Ok(Address::ProgramCounter),
                "sp" => Ok(Address::StackPointer),
                other => parse_u64(other)
                    .map(Address::Absolute)
                    .ok_or_else(|| format!("bad address: {}", other)),
            },
            other => Err(format!("bad address: {}", other)),
        }
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewKind {
    Registers,
    Stack,
    Disassembly,
    Backtrace,
    Breakpoints,
}

impl ViewKind {
    pub const ALL: [ViewKind; 5] = [
        ViewKind::Registers,
        ViewKind::Stack,
        ViewKind::Disassembly,
        ViewKind::Backtrace,
        ViewKind::Breakpoints,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registers => "registers",
            Self::Stack => "stack",
            Self::Disassembly => "disassembly",
            Self::Backtrace => "backtrace",
            Self::Breakpoints => "breakpoints",
        }
    }

    /// The request a view issues for each update
    pub fn request(&self, config: &ViewConfig) -> RequestKind {
        match self {
            Self::Registers => RequestKind::Registers,
            Self::Stack => RequestKind::Memory {
                address: Address::StackPointer,
                length: config.stack_bytes,
            },
            Self::Disassembly => RequestKind::Disassemble {
                address: Address::ProgramCounter,
                count: config.disassembly_count,
            },
            Self::Backtrace => RequestKind::Stack {
                depth: config.backtrace_depth,
            },
            Self::Breakpoints => RequestKind::Breakpoints,
        }
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewKind {
    type Err = VoltronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ViewKind::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| VoltronError::InvalidArguments(format!("unknown view kind: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    Version,
    Plugins,
    State,
    Targets,
    Init,
    Registers,
    Memory { address: Address, length: u64 },
    Stack { depth: usize },
    Disassemble { address: Address, count: usize },
    Dereference { address: Address },
    Breakpoints,
    SetBreakpoint { location: BreakpointLocation },
    RemoveBreakpoint { id: BreakpointId },
    Wait,
    Subscribe { view: String },
    Unsubscribe { id: SubscriptionId },
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::Plugins => "plugins",
            Self::State => "state",
            Self::Targets => "targets",
            Self::Init => "init",
            Self::Registers => "registers",
            Self::Memory { .. } => "memory",
            Self::Stack { .. } => "stack",
            Self::Disassemble { .. } => "disassemble",
            Self::Dereference { .. } => "dereference",
            Self::Breakpoints => "breakpoints",
            Self::SetBreakpoint { .. } => "set_breakpoint",
            Self::RemoveBreakpoint { .. } => "remove_breakpoint",
            Self::Wait => "wait",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }

    /// Answered by the router itself without touching the adaptor
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Plugins | Self::Subscribe { .. } | Self::Unsubscribe { .. })
    }

    pub fn always_blocks(&self) -> bool {
        matches!(self, Self::Wait)
    }

    fn parse(kind: &str, args: &Map<String, Value>) -> VoltronResult<Self> {
        let kind = match kind {
            "version" => Self::Version,
            "plugins" => Self::Plugins,
            "state" => Self::State,
            "targets" => Self::Targets,
            "init" => Self::Init,
            "registers" => Self::Registers,
            "memory" => {
                let length = required_u64(args, "length")?;
                if length == 0 {
                    return Err(VoltronError::InvalidArguments("length must be at least 1".into()));
                }
                Self::Memory {
                    address: required_address(args, "address")?,
                    length,
                }
            }
            "stack" => {
                let depth = optional_u64(args, "depth")?.unwrap_or(DEFAULT_STACK_DEPTH as u64);
                if depth == 0 {
                    return Err(VoltronError::InvalidArguments("depth must be at least 1".into()));
                }
                Self::Stack {
                    depth: depth as usize,
                }
            }
            "disassemble" => {
                let count = optional_u64(args, "count")?.unwrap_or(DEFAULT_DISASSEMBLY_COUNT as u64);
                if count == 0 {
                    return Err(VoltronError::InvalidArguments("count must be at least 1".into()));
                }
                let address = match args.get("address") {
                    Some(v) => Address::from_value(v).map_err(VoltronError::MalformedRequest)?,
                    None => Address::ProgramCounter,
                };
                Self::Disassemble {
                    address,
                    count: count as usize,
                }
            }
            "dereference" => Self::Dereference {
                address: required_address(args, "address")?,
            },
            "breakpoints" => Self::Breakpoints,
            "set_breakpoint" => {
                let location = match args.get("location") {
                    Some(Value::String(s)) => s.parse()?,
                    Some(Value::Number(n)) => n
                        .as_u64()
                        .map(BreakpointLocation::Address)
                        .ok_or_else(|| VoltronError::MalformedRequest(format!("bad location: {}", n)))?,
                    Some(other) => {
                        return Err(VoltronError::MalformedRequest(format!("bad location: {}", other)))
                    }
                    None => return Err(missing("location")),
                };
                Self::SetBreakpoint { location }
            }
            "remove_breakpoint" => {
                let id = required_u64(args, "id")?;
                let id = BreakpointId::try_from(id)
                    .map_err(|_| VoltronError::NotFound(format!("breakpoint {}", id)))?;
                Self::RemoveBreakpoint { id }
            }
            "wait" => Self::Wait,
            "subscribe" => match args.get("view") {
                Some(Value::String(view)) => Self::Subscribe { view: view.clone() },
                Some(other) => {
                    return Err(VoltronError::MalformedRequest(format!("bad view: {}", other)))
                }
                None => return Err(missing("view")),
            },
            "unsubscribe" => Self::Unsubscribe {
                id: required_u64(args, "id")?,
            },
            other => {
                return Err(VoltronError::MalformedRequest(format!(
                    "unknown request type: {}",
                    other
                )))
            }
        };
        Ok(kind)
    }

    fn args(&self) -> Value {
        fn addr(address: &Address) -> Value {
            match address {
                Address::Absolute(a) => json!(a),
                Address::ProgramCounter => json!("pc"),
                Address::StackPointer => json!("sp"),
            }
        }
        match self {
            Self::Memory { address, length } => json!({"address": addr(address), "length": length}),
            Self::Stack { depth } => json!({ "depth": depth }),
            Self::Disassemble { address, count } => json!({"address": addr(address), "count": count}),
            Self::Dereference { address } => json!({ "address": addr(address) }),
            Self::SetBreakpoint { location } => json!({ "location": location.to_string() }),
            Self::RemoveBreakpoint { id } => json!({ "id": id }),
            Self::Subscribe { view } => json!({ "view": view }),
            Self::Unsubscribe { id } => json!({ "id": id }),
            _ => json!({}),
        }
    }
}

fn missing(name: &str) -> VoltronError {
    VoltronError::MalformedRequest(format!("missing '{}' argument", name))
}

fn optional_u64(args: &Map<String, Value>, name: &str) -> VoltronResult<Option<u64>> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| VoltronError::MalformedRequest(format!("'{}' must be unsigned", name))),
        Some(Value::String(s)) => parse_u64(s)
            .map(Some)
            .ok_or_else(|| VoltronError::MalformedRequest(format!("'{}' is not a number", name))),
        Some(_) => Err(VoltronError::MalformedRequest(format!("'{}' is not a number", name))),
    }
}

fn required_u64(args: &Map<String, Value>, name: &str) -> VoltronResult<u64> {
    optional_u64(args, name)?.ok_or_else(|| missing(name))
}

fn required_address(args: &Map<String, Value>, name: &str) -> VoltronResult<Address> {
    let value = args.get(name).ok_or_else(|| missing(name))?;
    Address::from_value(value).map_err(VoltronError::MalformedRequest)
}

#[derive(Debug, Deserialize)]
struct WireRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    args: Option<Map<String, Value>>,
    #[serde(default)]
    block: bool,
    #[serde(default)]
    id: Option<Value>,
}

/// A parsed request. Immutable once submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub block: bool,
    /// Advisory bound for blocking requests
    pub timeout: Option<Duration>,
    /// Client correlation id, echoed back
    pub id: Option<Value>,
}

impl Request {
    pub fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            block: false,
            timeout: None,
            id: None,
        }
    }

    pub fn blocking(kind: RequestKind) -> Self {
        Self {
            block: true,
            ..Self::new(kind)
        }
    }

    pub fn parse(line: &str) -> VoltronResult<Self> {
        if line.len() > MAX_LINE_LENGTH {
            return Err(VoltronError::MalformedRequest(format!(
                "request too large: {} bytes (max: {} bytes)",
                line.len(),
                MAX_LINE_LENGTH
            )));
        }
        let wire: WireRequest = serde_json::from_str(line)
            .map_err(|e| VoltronError::MalformedRequest(e.to_string()))?;
        let args = wire.args.unwrap_or_default();
        let kind = RequestKind::parse(&wire.kind, &args)?;
        let timeout = match args.get("timeout") {
            None | Some(Value::Null) => None,
            Some(v) => match v.as_f64() {
                Some(secs) if secs > 0.0 && secs.is_finite() => Some(Duration::from_secs_f64(secs)),
                Some(_) => None,
                None => {
                    return Err(VoltronError::MalformedRequest(
                        "'timeout' must be a number of seconds".to_string(),
                    ))
                }
            },
        };
        Ok(Self {
            block: wire.block || kind.always_blocks(),
            kind,
            timeout,
            id: wire.id,
        })
    }

    /// Encode for sending, the inverse of `parse`
    pub fn to_wire(&self) -> Value {
        let mut args = self.kind.args();
        if let (Some(timeout), Some(map)) = (self.timeout, args.as_object_mut()) {
            map.insert("timeout".to_string(), json!(timeout.as_secs_f64()));
        }
        let mut wire = json!({
            "type": self.kind.name(),
            "args": args,
            "block": self.block,
        });
        if let (Some(id), Some(map)) = (&self.id, wire.as_object_mut()) {
            map.insert("id".to_string(), id.clone());
        }
        wire
    }
}

/// Result of one request, routed back to the owning connection
#[derive(Debug)]
pub struct Reply {
    pub id: Option<Value>,
    pub subscription: Option<SubscriptionId>,
    pub result: VoltronResult<Value>,
}

impl Reply {
    pub fn to(request: &Request, result: VoltronResult<Value>) -> Self {
        Self {
            id: request.id.clone(),
            subscription: None,
            result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionId>,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self {
            status: Status::Ok,
            body,
            error_kind: None,
            id: None,
            subscription: None,
        }
    }

    pub fn error(err: &VoltronError) -> Self {
        Self {
            status: Status::Error,
            body: json!({ "message": err.to_string() }),
            error_kind: Some(err.kind()),
            id: None,
            subscription: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn encode(&self) -> String {
        // Serializing a Value-backed struct cannot fail
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"status":"error","body":{{"message":"{}"}},"error_kind":"MalformedRequest"}}"#, e)
        });
        line.push('\n');
        line
    }
}

impl From<Reply> for Response {
    fn from(reply: Reply) -> Self {
        let mut response = match reply.result {
            Ok(body) => Response::ok(body),
            Err(err) => Response::error(&err),
        };
        response.id = reply.id;
        response.subscription = reply.subscription;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registers() {
        let req = Request::parse(r#"{"type":"registers","block":false}"#).unwrap();
        assert_eq!(req.kind, RequestKind::Registers);
        assert!(!req.block);
        assert_eq!(req.timeout, None);
    }

    #[test]
    fn test_parse_memory_hex_and_anchor() {
        let req = Request::parse(r#"{"type":"memory","args":{"address":"0x1000","length":16}}"#).unwrap();
        assert_eq!(
            req.kind,
            RequestKind::Memory { address: Address::Absolute(0x1000), length: 16 }
        );

        let req = Request::parse(r#"{"type":"memory","args":{"address":"sp","length":"0x20"},"block":true,"id":7}"#)
            .unwrap();
        assert_eq!(
            req.kind,
            RequestKind::Memory { address: Address::StackPointer, length: 32 }
        );
        assert!(req.block);
        assert_eq!(req.id, Some(json!(7)));
    }

    #[test]
    fn test_malformed_inputs() {
        for line in [
            "not json",
            r#"{"args":{}}"#,
            r#"{"type":"teleport"}"#,
            r#"{"type":"memory","args":{"length":4}}"#,
            r#"{"type":"memory","args":{"address":[1],"length":4}}"#,
            r#"{"type":"stack","args":{"depth":-1}}"#,
        ] {
            let err = Request::parse(line).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedRequest, "{}", line);
        }
    }

    #[test]
    fn test_invalid_argument_values() {
        let err = Request::parse(r#"{"type":"stack","args":{"depth":0}}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        let err = Request::parse(r#"{"type":"memory","args":{"address":1,"length":0}}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn test_wait_always_blocks_with_timeout() {
        let req = Request::parse(r#"{"type":"wait","args":{"timeout":1.5}}"#).unwrap();
        assert!(req.block);
        assert_eq!(req.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_to_wire_parses_back() {
        let mut req = Request::blocking(RequestKind::Disassemble {
            address: Address::ProgramCounter,
            count: 8,
        });
        req.id = Some(json!("abc"));
        let line = req.to_wire().to_string();
        assert_eq!(Request::parse(&line).unwrap(), req);
    }

    #[test]
    fn test_response_shapes() {
        let ok = Response::ok(json!({"rax": 0}));
        assert_eq!(ok.encode(), "{\"status\":\"ok\",\"body\":{\"rax\":0}}\n");

        let err: Response = Reply {
            id: None,
            subscription: None,
            result: Err(VoltronError::NotStopped(crate::types::Lifecycle::Running)),
        }
        .into();
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["error_kind"], "NotStopped");
    }

    #[test]
    fn test_view_requests() {
        let config = ViewConfig::default();
        assert_eq!(
            ViewKind::Stack.request(&config),
            RequestKind::Memory { address: Address::StackPointer, length: config.stack_bytes }
        );
        assert_eq!("backtrace".parse::<ViewKind>().unwrap(), ViewKind::Backtrace);
        assert!("bt".parse::<ViewKind>().is_err());
    }
}
