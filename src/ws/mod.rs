pub mod frame;
pub mod handshake;
pub mod server;

pub use frame::{Frame, FrameError, Opcode};
pub use handshake::HandshakeError;
pub use server::{Dispatcher, DispatcherFactory, WsError, WsServer};
