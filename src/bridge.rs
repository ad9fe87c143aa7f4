use std::collections::HashSet;
use std::num::ParseIntError;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde_json::json;

use crate::engine::{Engine, EngineError};
use crate::finder::DeviceRecord;
use crate::transport::Transport;

/// Tracks which (bus, address) pairs currently have an owning Session, so a second client's
/// `open` against an already-claimed device is rejected rather than racing the first (§5).
#[derive(Default)]
pub struct ClaimRegistry {
    claimed: Mutex<HashSet<(u8, u8)>>,
}

impl ClaimRegistry {
    pub fn new() -> Arc<ClaimRegistry> {
        Arc::new(ClaimRegistry::default())
    }

    pub fn try_claim(&self, bus: u8, address: u8) -> bool {
        self.claimed.lock().unwrap().insert((bus, address))
    }

    pub fn release(&self, bus: u8, address: u8) {
        self.claimed.lock().unwrap().remove(&(bus, address));
    }
}

/// A parsed `send:`/`recv:` parameter set: `op=`, up to five `pN=`, optional `data=`/`size=`.
/// `nparam` is derived as the highest `pN` index actually set, matching the source grammar.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SendRecvParams {
    pub op: u16,
    pub params: [u32; 5],
    pub nparam: usize,
    pub data: u32,
    pub size: u32,
}

#[derive(Debug)]
pub enum GrammarError {
    MissingColon,
    BadInteger(ParseIntError),
}

impl std::fmt::Display for GrammarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GrammarError::MissingColon => write!(f, "missing ':' separator"),
            GrammarError::BadInteger(e) => write!(f, "bad integer literal: {}", e),
        }
    }
}

/// Parses `0x`-prefixed hex or plain decimal, matching `std::stoul(value, nullptr, 0)`'s
/// base-detection behavior.
fn parse_int_literal(s: &str) -> Result<u32, ParseIntError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    }
}

/// Parses the tail of a `get:<prop>` or `getobject:<handle>` command.
pub fn parse_single_int(message: &str) -> Result<u32, GrammarError> {
    let (_, tail) = message.split_once(':').ok_or(GrammarError::MissingColon)?;
    parse_int_literal(tail).map_err(GrammarError::BadInteger)
}

/// Parses the comma-separated `key=value` tail of a `send:`/`recv:` command.
pub fn parse_send_recv(message: &str) -> SendRecvParams {
    let mut out = SendRecvParams::default();

    let tail = match message.split_once(':') {
        Some((_, tail)) => tail,
        None => return out,
    };

    for pair in tail.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "op" => {
                if let Ok(v) = parse_int_literal(value) {
                    out.op = v as u16;
                }
            }
            "p1" => set_param(&mut out, 0, value),
            "p2" => set_param(&mut out, 1, value),
            "p3" => set_param(&mut out, 2, value),
            "p4" => set_param(&mut out, 3, value),
            "p5" => set_param(&mut out, 4, value),
            "data" => {
                if let Ok(v) = parse_int_literal(value) {
                    out.data = v;
                }
            }
            "size" => {
                if let Ok(v) = parse_int_literal(value) {
                    out.size = v;
                }
            }
            _ => {}
        }
    }

    out
}

fn set_param(out: &mut SendRecvParams, index: usize, value: &str) {
    if let Ok(v) = parse_int_literal(value) {
        out.params[index] = v;
        if out.nparam < index + 1 {
            out.nparam = index + 1;
        }
    }
}

fn success(result: &str) -> String {
    if result.is_empty() {
        json!({ "success": true }).to_string()
    } else {
        json!({ "success": true, "result": result }).to_string()
    }
}

fn error(message: impl std::fmt::Display) -> String {
    json!({ "error": message.to_string() }).to_string()
}

fn transaction_json(op: u16, p: &SendRecvParams, size: usize) -> String {
    let params: Vec<String> = p.params[..p.nparam]
        .iter()
        .map(|v| format!("0x{:x}", v))
        .collect();

    json!({
        "code": format!("0x{:x}", op),
        "nparam": p.nparam,
        "params": params,
        "size": size,
        "data": format!("0x{:x}", p.data),
    })
    .to_string()
}

/// Binds one WebSocket session to (at most) one PTP `Engine`. Owns the command-grammar parsing
/// and JSON response shaping described in §4.5; a binary out-of-band payload, when present,
/// must be written to the socket as a following binary frame by the caller.
pub struct Bridge<C: rusb::UsbContext> {
    device: DeviceRecord,
    engine: Option<Engine<C>>,
    claims: Arc<ClaimRegistry>,
}

impl<C: rusb::UsbContext> Bridge<C> {
    pub fn new(device: DeviceRecord, claims: Arc<ClaimRegistry>) -> Bridge<C> {
        Bridge {
            device,
            engine: None,
            claims,
        }
    }

    fn connected(&self) -> bool {
        self.engine.is_some()
    }

    pub fn handle_open(&mut self, open: impl FnOnce() -> Result<Transport<C>, EngineError>) -> String {
        if self.connected() {
            return success("Device already open");
        }
        if !self.claims.try_claim(self.device.bus, self.device.address) {
            return error("Device already claimed by another session");
        }

        match open().and_then(|transport| {
            let mut engine = Engine::new(transport);
            engine.open()?;
            Ok(engine)
        }) {
            Ok(engine) => {
                self.engine = Some(engine);
                info!("opened device bus={} address={}", self.device.bus, self.device.address);
                success("Device opened successfully")
            }
            Err(e) => {
                self.claims.release(self.device.bus, self.device.address);
                warn!("failed to open device: {}", e);
                error("Failed to open device")
            }
        }
    }

    pub fn handle_close(&mut self) -> String {
        if let Some(mut engine) = self.engine.take() {
            let _ = engine.close();
            let _ = engine.close_transport();
            self.claims.release(self.device.bus, self.device.address);
        }
        success("Device closed")
    }

    pub fn handle_auth(&mut self) -> String {
        self.with_engine(|engine| engine.auth().map(|_| ()), "Authentication successful", "Authentication failed")
    }

    pub fn handle_getall(&mut self) -> String {
        self.with_engine(|engine| engine.getall().map(|_| ()), "Get all properties successful", "Get all properties failed")
    }

    pub fn handle_get(&mut self, message: &str) -> String {
        let prop = match parse_single_int(message) {
            Ok(p) => p,
            Err(_) => return error("Invalid get command format"),
        };
        self.with_engine(|engine| engine.get(prop).map(|_| ()), "Get property successful", "Get property failed")
    }

    /// Returns the text response and, on success, the raw object bytes to follow as a binary
    /// frame (§4.5's out-of-band delivery).
    pub fn handle_getobject(&mut self, message: &str) -> (String, Option<Vec<u8>>) {
        let handle = match parse_single_int(message) {
            Ok(h) => h,
            Err(_) => return (error("Invalid getobject command format"), None),
        };
        self.with_engine_payload(|engine| engine.getobject(handle), "Get object successful", "Get object failed")
    }

    pub fn handle_getliveview(&mut self) -> (String, Option<Vec<u8>>) {
        self.with_engine_payload(|engine| engine.getliveview(), "Get live view successful", "Get live view failed")
    }

    pub fn handle_send(&mut self, message: &str) -> String {
        if !self.connected() {
            return error("Device not connected");
        }
        let p = parse_send_recv(message);
        let data = if p.nparam > 0 || p.data != 0 { Some(p.data.to_le_bytes().to_vec()) } else { None };
        match self.engine.as_mut().unwrap().send(p.op, p.params[..p.nparam].to_vec(), data) {
            Ok(txn) => transaction_json(p.op, &p, txn.size()),
            Err(_) => error("Send command failed"),
        }
    }

    pub fn handle_recv(&mut self, message: &str) -> String {
        if !self.connected() {
            return error("Device not connected");
        }
        let p = parse_send_recv(message);
        match self.engine.as_mut().unwrap().recv(p.op, p.params[..p.nparam].to_vec()) {
            Ok(txn) => transaction_json(p.op, &p, txn.size()),
            Err(_) => error("Receive command failed"),
        }
    }

    pub fn handle_wait(&mut self) -> String {
        if !self.connected() {
            return error("Device not connected");
        }
        match self.engine.as_mut().unwrap().wait() {
            Ok(Some(_event)) => success("Event received"),
            Ok(None) => error("Wait command timed out"),
            Err(_) => error("Wait command failed"),
        }
    }

    pub fn handle_reset(&mut self) -> String {
        if !self.connected() {
            return error("Device not connected");
        }
        match self.engine.as_mut().unwrap().reset() {
            Ok(()) => success("Device reset"),
            Err(_) => error("Device reset failed"),
        }
    }

    pub fn handle_clear(&mut self) -> String {
        if !self.connected() {
            return error("Device not connected");
        }
        match self.engine.as_mut().unwrap().clear() {
            Ok(()) => success("Clear halt successful"),
            Err(_) => error("Clear halt failed"),
        }
    }

    fn with_engine(
        &mut self,
        f: impl FnOnce(&mut Engine<C>) -> Result<(), EngineError>,
        ok_msg: &str,
        err_msg: &str,
    ) -> String {
        if !self.connected() {
            return error("Device not connected");
        }
        match f(self.engine.as_mut().unwrap()) {
            Ok(()) => success(ok_msg),
            Err(_) => error(err_msg),
        }
    }

    fn with_engine_payload(
        &mut self,
        f: impl FnOnce(&mut Engine<C>) -> Result<crate::engine::PTPTransaction, EngineError>,
        ok_msg: &str,
        err_msg: &str,
    ) -> (String, Option<Vec<u8>>) {
        if !self.connected() {
            return (error("Device not connected"), None);
        }
        match f(self.engine.as_mut().unwrap()) {
            Ok(txn) => {
                let payload = txn.payload_in;
                (json!({ "success": true, "result": ok_msg, "size": payload.len() }).to_string(), Some(payload))
            }
            Err(_) => (error(err_msg), None),
        }
    }

    /// Releases the claimed device if this session is dropped without an explicit `close`.
    pub fn on_session_end(&mut self) {
        if self.connected() {
            self.handle_close();
        }
    }

    /// Splits on the first `:`, matches the (lowercased) command name, and routes to the
    /// corresponding handler (§4.5). The command-handler registry named by the data model is
    /// this match rather than a runtime map of closures, since each command's handler already
    /// needs `&mut self` and there is a fixed, known set of them.
    pub fn dispatch(&mut self, message: &str, open: impl FnOnce() -> Result<Transport<C>, EngineError>) -> (String, Option<Vec<u8>>) {
        let command = match message.find(':') {
            Some(pos) => &message[..pos],
            None => message,
        };

        match command.to_ascii_lowercase().as_str() {
            "open" => (self.handle_open(open), None),
            "close" => (self.handle_close(), None),
            "auth" => (self.handle_auth(), None),
            "getall" => (self.handle_getall(), None),
            "get" => (self.handle_get(message), None),
            "getobject" => self.handle_getobject(message),
            "getliveview" => self.handle_getliveview(),
            "send" => (self.handle_send(message), None),
            "recv" => (self.handle_recv(message), None),
            "wait" => (self.handle_wait(), None),
            "reset" => (self.handle_reset(), None),
            "clear" => (self.handle_clear(), None),
            other => (error(format!("Unknown command: {}", other)), None),
        }
    }
}

/// Runs `on_session_end` so a client socket that vanishes mid-session (or a panic unwinding
/// through the dispatcher) still releases the claim and the USB interface, matching §5's "at
/// most one session per device" invariant even on abrupt disconnect.
impl<C: rusb::UsbContext> Drop for Bridge<C> {
    fn drop(&mut self) {
        self.on_session_end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_grammar_example() {
        let p = parse_send_recv("send:op=0x1014,p1=0xD200,size=4");
        assert_eq!(p.op, 0x1014);
        assert_eq!(p.nparam, 1);
        assert_eq!(p.params[0], 0xD200);
        assert_eq!(p.size, 4);
        assert_eq!(p.params[1..], [0, 0, 0, 0]);
    }

    #[test]
    fn parses_get_property_code_hex_and_decimal() {
        assert_eq!(parse_single_int("get:0xD6F2").unwrap(), 0xD6F2);
        assert_eq!(parse_single_int("get:1024").unwrap(), 1024);
    }

    #[test]
    fn missing_colon_is_a_grammar_error() {
        assert!(parse_single_int("get").is_err());
    }

    #[test]
    fn claim_registry_rejects_double_claim() {
        let reg = ClaimRegistry::new();
        assert!(reg.try_claim(1, 2));
        assert!(!reg.try_claim(1, 2));
        reg.release(1, 2);
        assert!(reg.try_claim(1, 2));
    }

    #[test]
    fn success_with_no_result_omits_result_field() {
        assert_eq!(success(""), r#"{"success":true}"#);
    }

    #[test]
    fn unknown_command_error_shape() {
        assert_eq!(error("boom"), r#"{"error":"boom"}"#);
    }
}
