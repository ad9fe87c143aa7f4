use std::cmp::min;
use std::collections::VecDeque;
use std::mem::MaybeUninit;
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, trace, warn};
use num_traits::ToPrimitive;
use thiserror::Error;

use crate::command::CommandCode;
use crate::container::{ContainerHeader, ContainerType, CONTAINER_HEADER_SIZE};
use crate::event::Event;

/// Maximum number of buffered events a `Transport` will hold before dropping the oldest.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,

    #[error("operation timed out")]
    Timeout,

    #[error("endpoint stalled")]
    Stalled,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("the device returned an error response: {0:?}")]
    Response(crate::response::ResponseCode),

    #[error("a usb error occurred: {0}")]
    Usb(#[from] rusb::Error),
}

impl TransportError {
    fn from_rusb(err: rusb::Error) -> TransportError {
        match err {
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Pipe => TransportError::Stalled,
            other => TransportError::Usb(other),
        }
    }
}

/// Owns the claimed PTP interface and its three endpoints (bulk in/out, interrupt in) for a
/// single open USB device session, plus the bounded event queue fed by the interrupt pipe.
pub struct Transport<C: rusb::UsbContext> {
    iface: u8,
    ep_in: u8,
    ep_out: u8,
    ep_int: u8,
    current_tid: AtomicU32,
    handle: Arc<rusb::DeviceHandle<C>>,
    events: Mutex<VecDeque<Event>>,
}

impl<C: rusb::UsbContext> Transport<C> {
    /// Claims the PTP (still image, class code 6) interface on `handle` and resolves its
    /// bulk in/out and interrupt in endpoints.
    pub fn open(handle: Arc<rusb::DeviceHandle<C>>) -> Result<Transport<C>, TransportError> {
        let config_desc = handle
            .device()
            .active_config_descriptor()
            .map_err(TransportError::from_rusb)?;

        let interface_desc = config_desc
            .interfaces()
            .flat_map(|i| i.descriptors())
            .find(|x| x.class_code() == 6)
            .ok_or(TransportError::Usb(rusb::Error::NotFound))?;

        debug!("claiming PTP interface {}", interface_desc.interface_number());

        handle
            .claim_interface(interface_desc.interface_number())
            .map_err(TransportError::from_rusb)?;
        handle
            .set_alternate_setting(
                interface_desc.interface_number(),
                interface_desc.setting_number(),
            )
            .map_err(TransportError::from_rusb)?;

        let find_endpoint = |direction, transfer_type| {
            interface_desc
                .endpoint_descriptors()
                .find(|ep| ep.direction() == direction && ep.transfer_type() == transfer_type)
                .map(|x| x.address())
                .ok_or(rusb::Error::NotFound)
        };

        Ok(Transport {
            iface: interface_desc.interface_number(),
            ep_in: find_endpoint(rusb::Direction::In, rusb::TransferType::Bulk)
                .map_err(TransportError::from_rusb)?,
            ep_out: find_endpoint(rusb::Direction::Out, rusb::TransferType::Bulk)
                .map_err(TransportError::from_rusb)?,
            ep_int: find_endpoint(rusb::Direction::In, rusb::TransferType::Interrupt)
                .map_err(TransportError::from_rusb)?,
            current_tid: AtomicU32::new(1),
            handle,
            events: Mutex::new(VecDeque::with_capacity(EVENT_QUEUE_CAPACITY)),
        })
    }

    pub fn close(&self) -> Result<(), TransportError> {
        self.handle
            .release_interface(self.iface)
            .map_err(TransportError::from_rusb)
    }

    pub fn reset(&self) -> Result<(), TransportError> {
        self.handle.reset().map_err(TransportError::from_rusb)
    }

    pub fn clear_halt(&self) -> Result<(), TransportError> {
        self.handle
            .clear_halt(self.ep_in)
            .map_err(TransportError::from_rusb)?;
        self.handle
            .clear_halt(self.ep_out)
            .map_err(TransportError::from_rusb)
    }

    /// Executes a full PTP transaction: command phase, optional data-out phase, then reads
    /// data-in (if any) and the response phase, checking the transaction id on each container.
    pub fn transact(
        &self,
        code: CommandCode,
        params: &[u32],
        data: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let tid = self.current_tid.fetch_add(1, Ordering::AcqRel);

        let mut request_payload = Vec::with_capacity(params.len() * 4);
        for p in params {
            request_payload.write_u32::<LittleEndian>(*p).ok();
        }

        self.write_phase(ContainerType::Command, code.code(), tid, &request_payload, timeout)?;

        if let Some(data) = data {
            self.write_phase(ContainerType::Data, code.code(), tid, data, timeout)?;
        }

        let mut data_phase_payload = vec![];
        loop {
            let (header, payload) = self.read_bulk_phase(timeout)?;

            if !header.belongs_to(tid) {
                return Err(TransportError::Protocol(format!(
                    "mismatched transaction id {}, expecting {}",
                    header.tid, tid
                )));
            }

            match header.kind {
                ContainerType::Data => {
                    data_phase_payload = payload;
                }
                ContainerType::Response => {
                    let code = num_traits::FromPrimitive::from_u16(header.code)
                        .unwrap_or(crate::response::ResponseCode::Other(header.code));
                    if !code.is_ok() {
                        return Err(TransportError::Response(code));
                    }
                    return Ok(data_phase_payload);
                }
                ContainerType::Event => {
                    // an event arriving on the bulk pipe mid-transaction; queue it and keep
                    // waiting for the response phase.
                    if let Ok(event) = Event::new(header.code, &payload) {
                        self.push_event(event);
                    }
                }
                ContainerType::Command => {
                    return Err(TransportError::Protocol(
                        "received command container on read path".into(),
                    ));
                }
            }
        }
    }

    fn write_phase(
        &self,
        kind: ContainerType,
        code: u16,
        tid: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        trace!("write {:?} code=0x{:04x} tid={}", kind, code, tid);

        const CHUNK_SIZE: usize = 1024 * 1024;

        let first_chunk_len = min(payload.len(), CHUNK_SIZE - CONTAINER_HEADER_SIZE);
        let mut buf = ContainerHeader::encode(kind, code, tid, payload.len());
        buf.extend_from_slice(&payload[..first_chunk_len]);
        self.handle
            .write_bulk(self.ep_out, &buf, timeout)
            .map_err(TransportError::from_rusb)?;

        for chunk in payload[first_chunk_len..].chunks(CHUNK_SIZE) {
            self.handle
                .write_bulk(self.ep_out, chunk, timeout)
                .map_err(TransportError::from_rusb)?;
        }

        Ok(())
    }

    fn read_bulk_phase(
        &self,
        timeout: Duration,
    ) -> Result<(ContainerHeader, Vec<u8>), TransportError> {
        const BUF_SIZE: usize = 8192;

        let mut buf: MaybeUninit<[u8; BUF_SIZE]> = MaybeUninit::uninit();
        let n = self
            .handle
            .read_bulk(self.ep_in, unsafe { &mut (&mut *buf.as_mut_ptr())[..] }, timeout)
            .map_err(TransportError::from_rusb)?;
        let buf = unsafe { buf.assume_init() };
        let buf = &buf[..n];

        let header = ContainerHeader::parse(&buf[..CONTAINER_HEADER_SIZE.min(buf.len())])?;
        trace!("read {:?}", header);

        if header.payload_len == 0 {
            return Ok((header, vec![]));
        }

        let mut payload = Vec::with_capacity(header.payload_len + 1);
        payload.extend_from_slice(&buf[CONTAINER_HEADER_SIZE..]);

        if payload.len() < header.payload_len || buf.len() == BUF_SIZE {
            loop {
                // SAFETY: `pslice` stays within `payload`'s spare capacity, and `set_len` only
                // advances past bytes `read_bulk` just initialized.
                unsafe {
                    let p = payload.as_mut_ptr().add(payload.len());
                    let pslice = slice::from_raw_parts_mut(
                        p,
                        min(payload.capacity() - payload.len(), 1_048_576),
                    );
                    let n = self
                        .handle
                        .read_bulk(self.ep_in, pslice, timeout)
                        .map_err(TransportError::from_rusb)?;
                    let sz = payload.len();
                    payload.set_len(sz + n);

                    if n < pslice.len() {
                        break;
                    }
                }
            }
        }

        Ok((header, payload))
    }

    /// Polls the interrupt endpoint once for an event, returning `Ok(None)` on timeout. Any
    /// event already buffered (e.g. one observed mid-transaction) is returned first.
    pub fn wait_event(&self, timeout: Duration) -> Result<Option<Event>, TransportError> {
        if let Some(event) = self.pop_event() {
            return Ok(Some(event));
        }

        let mut buf = [0u8; 64];
        let n = match self.handle.read_interrupt(self.ep_int, &mut buf, timeout) {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => return Ok(None),
            Err(e) => return Err(TransportError::from_rusb(e)),
        };
        let buf = &buf[..n];

        let header = ContainerHeader::parse(buf)?;
        if header.payload_len == 0 {
            warn!("interrupt packet carried no event payload");
            return Ok(None);
        }

        let payload = &buf[CONTAINER_HEADER_SIZE..];
        let event = Event::new(header.code, payload)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        Ok(Some(event))
    }

    fn push_event(&self, event: Event) {
        let mut q = self.events.lock().unwrap();
        if q.len() >= EVENT_QUEUE_CAPACITY {
            q.pop_front();
        }
        q.push_back(event);
    }

    fn pop_event(&self) -> Option<Event> {
        self.events.lock().unwrap().pop_front()
    }
}

/// Releases the claimed interface on every exit path, not just an explicit `close()` call, so a
/// panic or an abruptly dropped client socket doesn't leave the device claimed.
impl<C: rusb::UsbContext> Drop for Transport<C> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.iface) {
            warn!("failed to release interface {} on drop: {}", self.iface, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_maps_pipe_to_stalled() {
        match TransportError::from_rusb(rusb::Error::Pipe) {
            TransportError::Stalled => {}
            other => panic!("expected Stalled, got {:?}", other),
        }
    }

    #[test]
    fn transport_error_maps_timeout() {
        match TransportError::from_rusb(rusb::Error::Timeout) {
            TransportError::Timeout => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[test]
    fn event_queue_drops_oldest_past_capacity() {
        let mut q: VecDeque<u32> = VecDeque::with_capacity(EVENT_QUEUE_CAPACITY);
        for i in 0..EVENT_QUEUE_CAPACITY + 10 {
            if q.len() >= EVENT_QUEUE_CAPACITY {
                q.pop_front();
            }
            q.push_back(i as u32);
        }
        assert_eq!(q.len(), EVENT_QUEUE_CAPACITY);
        assert_eq!(*q.front().unwrap(), 10);
    }
}
