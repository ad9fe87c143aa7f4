use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;

use super::frame::{self, Opcode};
use super::handshake;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const READ_BUF_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum WsError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),
}

/// Per-connection command dispatcher: takes a decoded text message and returns a text response
/// plus an optional binary payload to follow as a separate frame (e.g. `getobject`'s object
/// bytes). Owns whatever per-session state the connection needs (its own `Engine`, most
/// notably), so it is built fresh per connection rather than shared.
pub type Dispatcher = dyn FnMut(&str) -> (String, Option<Vec<u8>>) + Send;

/// Builds one `Dispatcher` per accepted connection. A plain function value rather than a
/// handler that closes over a shared orchestrator: session state is created here, at dispatch
/// time, instead of being threaded through a registry that would otherwise need a back-reference
/// to whatever owns it.
pub type DispatcherFactory = dyn Fn() -> Box<Dispatcher> + Send + Sync;

/// TCP-bound WebSocket server: accepts client connections, performs the RFC 6455 handshake, and
/// dispatches decoded frames to a per-connection dispatcher built fresh from `factory`. One
/// thread per accepted client, plus one accept loop thread polled at 1-second intervals so
/// `stop()` is observed promptly (§5).
pub struct WsServer {
    factory: Arc<DispatcherFactory>,
    running: Arc<AtomicBool>,
}

impl WsServer {
    pub fn new(factory: Arc<DispatcherFactory>) -> WsServer {
        WsServer {
            factory,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Binds `port` and runs the accept loop on the calling thread until `running` flips to
    /// false (via the returned handle's `stop()` from another thread).
    pub fn run(&self, port: u16) -> Result<(), WsError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).map_err(WsError::Bind)?;
        listener.set_nonblocking(true).map_err(WsError::Bind)?;
        self.running.store(true, Ordering::SeqCst);

        info!("websocket server listening on port {}", port);

        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    let dispatcher = (self.factory)();
                    let running = self.running.clone();
                    thread::spawn(move || handle_client(stream, dispatcher, running));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!("accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        info!("websocket server accept loop exiting");
        Ok(())
    }

    /// Flips the shared `running` flag; the accept loop and any worker still inside its
    /// per-message loop observe it within one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

fn handle_client(mut stream: TcpStream, mut dispatcher: Box<Dispatcher>, running: Arc<AtomicBool>) {
    if !perform_handshake(&mut stream) {
        debug!("handshake failed, dropping connection");
        return;
    }

    let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));

    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut pending = Vec::new();

    while running.load(Ordering::SeqCst) {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                debug!("client read error: {}", e);
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);

        loop {
            match frame::decode(&pending) {
                Ok(Some((decoded, consumed))) => {
                    pending.drain(..consumed);
                    if !dispatch_frame(&mut stream, &decoded, dispatcher.as_mut()) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("dropping connection on frame error: {}", e);
                    return;
                }
            }
        }
    }
}

/// Handles one decoded frame. Returns false when the connection should close.
fn dispatch_frame(stream: &mut TcpStream, decoded: &frame::Frame, dispatcher: &mut Dispatcher) -> bool {
    match decoded.opcode {
        Opcode::Close => {
            let _ = stream.write_all(&frame::encode_close());
            false
        }
        Opcode::Ping => {
            let _ = stream.write_all(&frame::encode_pong(&decoded.payload));
            true
        }
        Opcode::Text | Opcode::Binary | Opcode::Continuation => {
            let message = String::from_utf8_lossy(&decoded.payload);
            let (response, binary) = dispatcher(&message);
            if stream.write_all(&frame::encode_text(&response)).is_err() {
                return false;
            }
            match binary {
                Some(payload) => stream.write_all(&frame::encode_binary(&payload)).is_ok(),
                None => true,
            }
        }
        Opcode::Other(_) | Opcode::Pong => true,
    }
}

fn perform_handshake(stream: &mut TcpStream) -> bool {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));

    let mut buf = [0u8; 2048];
    let n = match stream.read(&mut buf) {
        Ok(n) if n > 0 => n,
        _ => return false,
    };

    let request = String::from_utf8_lossy(&buf[..n]);
    let key = match handshake::extract_key(&request) {
        Ok(k) => k.to_string(),
        Err(e) => {
            debug!("handshake rejected: {}", e);
            return false;
        }
    };

    let response = handshake::build_response(&key);
    if let Err(e) = stream.write_all(response.as_bytes()) {
        error!("failed writing handshake response: {}", e);
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn dispatch_frame_writes_text_response() {
        let (mut server, mut client) = loopback_pair();
        let mut dispatcher: Box<Dispatcher> = Box::new(|msg: &str| (format!("echo:{}", msg), None));
        let decoded = frame::Frame {
            fin: true,
            opcode: Opcode::Text,
            payload: b"open".to_vec(),
        };
        assert!(dispatch_frame(&mut server, &decoded, dispatcher.as_mut()));

        let mut buf = [0u8; 64];
        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let n = client.read(&mut buf).unwrap();
        let (reply, _) = frame::decode_unmasked(&buf[..n]).unwrap().unwrap();
        assert_eq!(reply.payload, b"echo:open");
    }

    #[test]
    fn dispatch_frame_follows_text_with_binary_payload() {
        let (mut server, mut client) = loopback_pair();
        let mut dispatcher: Box<Dispatcher> =
            Box::new(|_msg: &str| ("{\"success\":true}".to_string(), Some(vec![1, 2, 3])));
        let decoded = frame::Frame {
            fin: true,
            opcode: Opcode::Text,
            payload: b"getobject:1".to_vec(),
        };
        assert!(dispatch_frame(&mut server, &decoded, dispatcher.as_mut()));

        client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 128];
        let n = client.read(&mut buf).unwrap();
        let (text_frame, consumed) = frame::decode_unmasked(&buf[..n]).unwrap().unwrap();
        assert_eq!(text_frame.opcode, Opcode::Text);
        let (binary_frame, _) = frame::decode_unmasked(&buf[consumed..n]).unwrap().unwrap();
        assert_eq!(binary_frame.opcode, Opcode::Binary);
        assert_eq!(binary_frame.payload, vec![1, 2, 3]);
    }

    #[test]
    fn dispatch_frame_close_stops_the_connection() {
        let (mut server, _client) = loopback_pair();
        let mut dispatcher: Box<Dispatcher> = Box::new(|msg: &str| (msg.to_string(), None));
        let decoded = frame::Frame {
            fin: true,
            opcode: Opcode::Close,
            payload: Vec::new(),
        };
        assert!(!dispatch_frame(&mut server, &decoded, dispatcher.as_mut()));
    }
}
