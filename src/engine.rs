use std::time::Duration;

use log::{info, trace, warn};
use thiserror::Error;

use crate::command::{
    CommandCode, SdioCommandCode, StandardCommandCode, LIVEVIEW_OBJECT_HANDLE,
    SDIO_AUTH_VERSION_TOO_LOW,
};
use crate::event::Event;
use crate::response::ResponseCode;
use crate::transport::{Transport, TransportError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const SDIO_KEY: u32 = 0x0000_DA01;
const SDIO_MAX_PROTOCOL_VERSION: u32 = 200;
const SDIO_TRANSIENT_RETRY_LIMIT: u32 = 1000;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("camera firmware reports a newer SDIO protocol version than this bridge supports")]
    AuthVersionUnsupported,

    #[error("failed to open the usb device: {0}")]
    Device(#[from] crate::finder::EnumerationError),
}

/// The direction of a PTP transaction's data phase, as seen from this bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
    NoData,
}

/// A single PTP transaction: request shape in, response shape filled in by the Engine/Transport.
/// Mirrors the fields the Bridge Orchestrator needs to echo back to a WebSocket client.
#[derive(Debug, Clone, Default)]
pub struct PTPTransaction {
    pub operation_code: u16,
    pub direction: Option<Direction>,
    pub params: Vec<u32>,
    pub payload_out: Option<Vec<u8>>,
    pub payload_in: Vec<u8>,
    pub response_code: u16,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::NoData
    }
}

impl PTPTransaction {
    pub fn new(operation_code: u16, params: Vec<u32>) -> PTPTransaction {
        PTPTransaction {
            operation_code,
            params,
            ..Default::default()
        }
    }

    /// Size of the transaction's payload in the direction it actually carried data, 0 for
    /// NO_DATA transactions — what the Bridge Orchestrator reports as `size` in its JSON.
    pub fn size(&self) -> usize {
        match self.direction {
            Some(Direction::Out) => self.payload_out.as_ref().map_or(0, Vec::len),
            _ => self.payload_in.len(),
        }
    }
}

/// Sits above a `Transport` and exposes the named PTP operations a Sony camera bridge needs:
/// session control, the SDIO vendor handshake, property/object reads, and the `send`/`recv`
/// escape hatches for client-specified opcodes.
pub struct Engine<C: rusb::UsbContext> {
    transport: Transport<C>,
    session_open: bool,
}

impl<C: rusb::UsbContext> Engine<C> {
    pub fn new(transport: Transport<C>) -> Engine<C> {
        Engine {
            transport,
            session_open: false,
        }
    }

    pub fn session_open(&self) -> bool {
        self.session_open
    }

    /// OpenSession(1). Sets `session_open` on an OK response.
    pub fn open(&mut self) -> Result<PTPTransaction, EngineError> {
        let mut txn = PTPTransaction::new(StandardCommandCode::OpenSession as u16, vec![1]);
        txn.direction = Some(Direction::NoData);
        txn.payload_in = self.transport.transact(
            CommandCode::Standard(StandardCommandCode::OpenSession),
            &txn.params,
            None,
            DEFAULT_TIMEOUT,
        )?;
        txn.response_code = crate::response::StandardResponseCode::Ok as u16;
        self.session_open = true;
        Ok(txn)
    }

    /// CloseSession. Clears `session_open` regardless of outcome, matching §4.3: a session
    /// that failed to close cleanly should not be treated as still owning the device.
    pub fn close(&mut self) -> Result<PTPTransaction, EngineError> {
        let mut txn = PTPTransaction::new(StandardCommandCode::CloseSession as u16, vec![]);
        txn.direction = Some(Direction::NoData);
        let result = self.transport.transact(
            CommandCode::Standard(StandardCommandCode::CloseSession),
            &[],
            None,
            DEFAULT_TIMEOUT,
        );
        self.session_open = false;
        txn.payload_in = result?;
        Ok(txn)
    }

    /// The Sony SDIO three-phase handshake: `SdioConnect` phase 1, phase 2, a protocol-version
    /// probe via `SdioGetExtDeviceInfo` (incrementing on 0xA101 "version too low" until the
    /// device accepts it, retrying other transient errors up to a bounded count), then
    /// `SdioConnect` phase 3.
    pub fn auth(&mut self) -> Result<PTPTransaction, EngineError> {
        let mut protocol_version: u32 = 100;

        'protocol: loop {
            trace!("sending SdioConnect phase 1");
            self.transport.transact(
                CommandCode::Sdio(SdioCommandCode::SdioConnect),
                &[1, SDIO_KEY, SDIO_KEY],
                None,
                DEFAULT_TIMEOUT,
            )?;

            trace!("sending SdioConnect phase 2");
            self.transport.transact(
                CommandCode::Sdio(SdioCommandCode::SdioConnect),
                &[2, SDIO_KEY, SDIO_KEY],
                None,
                DEFAULT_TIMEOUT,
            )?;

            let mut retries = 0;
            loop {
                trace!("probing SdioGetExtDeviceInfo at protocol version {}", protocol_version);
                match self.transport.transact(
                    CommandCode::Sdio(SdioCommandCode::SdioGetExtDeviceInfo),
                    &[protocol_version],
                    None,
                    DEFAULT_TIMEOUT,
                ) {
                    Ok(payload) => {
                        info!("camera accepted SDIO protocol version {}", protocol_version);

                        trace!("sending SdioConnect phase 3");
                        self.transport.transact(
                            CommandCode::Sdio(SdioCommandCode::SdioConnect),
                            &[3, SDIO_KEY, SDIO_KEY],
                            None,
                            DEFAULT_TIMEOUT,
                        )?;

                        let mut txn = PTPTransaction::new(
                            SdioCommandCode::SdioGetExtDeviceInfo as u16,
                            vec![protocol_version],
                        );
                        txn.direction = Some(Direction::In);
                        txn.payload_in = payload;
                        return Ok(txn);
                    }
                    Err(TransportError::Response(ResponseCode::Other(
                        SDIO_AUTH_VERSION_TOO_LOW,
                    ))) => {
                        if protocol_version < SDIO_MAX_PROTOCOL_VERSION {
                            trace!("version too low, resending SdioConnect at a higher protocol version");
                            protocol_version += 100;
                            continue 'protocol;
                        }
                        return Err(EngineError::AuthVersionUnsupported);
                    }
                    Err(err) => {
                        if retries < SDIO_TRANSIENT_RETRY_LIMIT {
                            retries += 1;
                            warn!("transient error during auth, retrying ({}/{}): {}", retries, SDIO_TRANSIENT_RETRY_LIMIT, err);
                            continue;
                        }
                        return Err(err.into());
                    }
                }
            }
        }
    }

    /// SdioGetAllExtDevicePropInfo: the aggregated property descriptor table, returned raw.
    pub fn getall(&mut self) -> Result<PTPTransaction, EngineError> {
        let mut txn = PTPTransaction::new(SdioCommandCode::SdioGetAllExtDevicePropInfo as u16, vec![]);
        txn.direction = Some(Direction::In);
        txn.payload_in = self.transport.transact(
            CommandCode::Sdio(SdioCommandCode::SdioGetAllExtDevicePropInfo),
            &[],
            None,
            DEFAULT_TIMEOUT,
        )?;
        Ok(txn)
    }

    /// GetDevicePropValue(prop_code).
    pub fn get(&mut self, prop_code: u32) -> Result<PTPTransaction, EngineError> {
        let mut txn = PTPTransaction::new(StandardCommandCode::GetDevicePropValue as u16, vec![prop_code]);
        txn.direction = Some(Direction::In);
        txn.payload_in = self.transport.transact(
            CommandCode::Standard(StandardCommandCode::GetDevicePropValue),
            &txn.params,
            None,
            DEFAULT_TIMEOUT,
        )?;
        Ok(txn)
    }

    /// GetObject(handle).
    pub fn getobject(&mut self, handle: u32) -> Result<PTPTransaction, EngineError> {
        let mut txn = PTPTransaction::new(StandardCommandCode::GetObject as u16, vec![handle]);
        txn.direction = Some(Direction::In);
        txn.payload_in = self.transport.transact(
            CommandCode::Standard(StandardCommandCode::GetObject),
            &txn.params,
            None,
            Duration::from_secs(30),
        )?;
        Ok(txn)
    }

    /// GetObject against the reserved live-view pseudo-handle (§4.3b).
    pub fn getliveview(&mut self) -> Result<PTPTransaction, EngineError> {
        self.getobject(LIVEVIEW_OBJECT_HANDLE)
    }

    /// Escape hatch: issue any opcode/params/payload the client supplies verbatim (OUT).
    pub fn send(&mut self, op: u16, params: Vec<u32>, data: Option<Vec<u8>>) -> Result<PTPTransaction, EngineError> {
        let mut txn = PTPTransaction::new(op, params);
        txn.direction = Some(Direction::Out);
        txn.payload_out = data.clone();
        txn.payload_in = self.transport.transact(
            CommandCode::from_raw(op),
            &txn.params,
            data.as_deref(),
            DEFAULT_TIMEOUT,
        )?;
        Ok(txn)
    }

    /// Escape hatch: issue any opcode/params the client supplies verbatim (IN).
    pub fn recv(&mut self, op: u16, params: Vec<u32>) -> Result<PTPTransaction, EngineError> {
        let mut txn = PTPTransaction::new(op, params);
        txn.direction = Some(Direction::In);
        txn.payload_in = self.transport.transact(
            CommandCode::from_raw(op),
            &txn.params,
            None,
            DEFAULT_TIMEOUT,
        )?;
        Ok(txn)
    }

    /// Dequeues one pending event, blocking up to 5 seconds.
    pub fn wait(&mut self) -> Result<Option<Event>, EngineError> {
        Ok(self.transport.wait_event(WAIT_TIMEOUT)?)
    }

    pub fn reset(&mut self) -> Result<(), EngineError> {
        self.session_open = false;
        Ok(self.transport.reset()?)
    }

    pub fn clear(&mut self) -> Result<(), EngineError> {
        Ok(self.transport.clear_halt()?)
    }

    pub fn close_transport(&self) -> Result<(), EngineError> {
        Ok(self.transport.close()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_defaults_carry_no_payload() {
        let txn = PTPTransaction::new(0x1002, vec![1]);
        assert_eq!(txn.operation_code, 0x1002);
        assert_eq!(txn.params, vec![1]);
        assert!(txn.payload_out.is_none());
        assert!(txn.payload_in.is_empty());
    }

    #[test]
    fn liveview_uses_reserved_pseudo_handle() {
        // getliveview delegates to getobject with the well-known handle; verified at the
        // constant level since exercising the real transport needs a live device.
        assert_eq!(LIVEVIEW_OBJECT_HANDLE, 0xFFFF_C002);
    }
}
