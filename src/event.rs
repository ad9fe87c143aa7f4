use std::fmt::{self, LowerHex};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("the data received was malformed: bad event code")]
    BadEventCode,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub enum EventCode {
    Standard(StandardEventCode),
    Vendor(u16),
    Reserved(u16),
}

impl FromPrimitive for EventCode {
    fn from_i64(_: i64) -> Option<Self> {
        None
    }

    fn from_u64(n: u64) -> Option<Self> {
        let n = n as u16;

        const MSN_MASK: u16 = 0b1111_0000_0000_0000;
        const RESERVED_MSN: u16 = 0b0100;
        const VENDOR_MSN: u16 = 0b1100;

        if let Some(ec) = StandardEventCode::from_u16(n) {
            return Some(EventCode::Standard(ec));
        }

        let msn = (n & MSN_MASK) >> 12;

        if msn == VENDOR_MSN {
            return Some(EventCode::Vendor(n));
        }

        if msn == RESERVED_MSN {
            return Some(EventCode::Reserved(n));
        }

        None
    }
}

impl ToPrimitive for EventCode {
    fn to_i64(&self) -> Option<i64> {
        None
    }

    fn to_u64(&self) -> Option<u64> {
        match self {
            EventCode::Standard(ec) => ec.to_u64(),
            EventCode::Reserved(n) | EventCode::Vendor(n) => Some(*n as u64),
        }
    }
}

impl LowerHex for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCode::Standard(code) => fmt::LowerHex::fmt(code, f),
            EventCode::Reserved(code) | EventCode::Vendor(code) => fmt::LowerHex::fmt(code, f),
        }
    }
}

impl From<StandardEventCode> for EventCode {
    fn from(code: StandardEventCode) -> Self {
        EventCode::Standard(code)
    }
}

#[repr(u16)]
#[derive(FromPrimitive, ToPrimitive, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StandardEventCode {
    Undefined = 0x4000,
    CancelTransaction,
    ObjectAdded,
    ObjectRemoved,
    StoreAdded,
    StoreRemoved,
    DevicePropChanged,
    ObjectInfoChanged,
    StoreFull,
    DeviceReset,
    StorageInfoChanged,
    CaptureComplete,
    UnreportedStatus,
}

impl LowerHex for StandardEventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let val = self.to_u16().unwrap();
        fmt::LowerHex::fmt(&val, f)
    }
}

/// A parsed PTP event: a code plus up to three big-endian u32 parameters, as delivered on
/// the interrupt pipe.
#[derive(Debug, Clone, Hash)]
pub struct Event {
    pub code: EventCode,
    pub params: Vec<u32>,
}

impl Event {
    pub fn new(code: u16, params: &[u8]) -> Result<Self, EventError> {
        Ok(Event {
            code: EventCode::from_u16(code).ok_or(EventError::BadEventCode)?,
            params: params
                .chunks_exact(4)
                .map(|c| {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(c);
                    u32::from_be_bytes(b)
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_standard_event_with_params() {
        let event = Event::new(0x4006, &1u32.to_be_bytes()).unwrap();
        assert_eq!(event.code, EventCode::Standard(StandardEventCode::DevicePropChanged));
        assert_eq!(event.params, vec![1]);
    }

    #[test]
    fn decodes_vendor_event_code() {
        let event = Event::new(0xC001, &[]).unwrap();
        assert_eq!(event.code, EventCode::Vendor(0xC001));
        assert!(event.params.is_empty());
    }

    #[test]
    fn rejects_unclassifiable_event_code() {
        assert!(Event::new(0x0001, &[]).is_err());
    }
}
