use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::transport::TransportError;

/// Number of bytes in a PTP container header: length(4) + type(2) + code(2) + tid(4).
pub const CONTAINER_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum ContainerType {
    Command = 1,
    Data = 2,
    Response = 3,
    Event = 4,
}

/// A parsed PTP container header. The payload (if any) follows separately in the
/// bulk/interrupt read path, since its length can exceed a single USB transfer.
#[derive(Debug, Clone, Copy)]
pub struct ContainerHeader {
    /// Length of payload following this header, in bytes.
    pub payload_len: usize,
    pub kind: ContainerType,
    pub code: u16,
    pub tid: u32,
}

impl ContainerHeader {
    pub fn parse(buf: &[u8]) -> Result<ContainerHeader, TransportError> {
        if buf.len() < CONTAINER_HEADER_SIZE {
            return Err(TransportError::Protocol(format!(
                "short container header: {} bytes",
                buf.len()
            )));
        }

        let mut r = buf;
        let len = r.read_u32::<LittleEndian>().unwrap();
        let kind_u16 = r.read_u16::<LittleEndian>().unwrap();
        let kind = ContainerType::from_u16(kind_u16)
            .ok_or_else(|| TransportError::Protocol(format!("invalid container type {:#x}", kind_u16)))?;
        let code = r.read_u16::<LittleEndian>().unwrap();
        let tid = r.read_u32::<LittleEndian>().unwrap();

        let len = len as usize;
        if len < CONTAINER_HEADER_SIZE {
            return Err(TransportError::Protocol(format!(
                "container length {} smaller than header",
                len
            )));
        }

        Ok(ContainerHeader {
            payload_len: len - CONTAINER_HEADER_SIZE,
            kind,
            code,
            tid,
        })
    }

    /// Encode a header for a container carrying `payload_len` bytes of payload.
    pub fn encode(kind: ContainerType, code: u16, tid: u32, payload_len: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONTAINER_HEADER_SIZE);
        buf.write_u32::<LittleEndian>((payload_len + CONTAINER_HEADER_SIZE) as u32)
            .unwrap();
        buf.write_u16::<LittleEndian>(kind as u16).unwrap();
        buf.write_u16::<LittleEndian>(code).unwrap();
        buf.write_u32::<LittleEndian>(tid).unwrap();
        buf
    }

    pub fn belongs_to(&self, tid: u32) -> bool {
        self.tid == tid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let header = ContainerHeader::encode(ContainerType::Command, 0x1002, 7, 4);
        assert_eq!(header.len(), CONTAINER_HEADER_SIZE);

        let mut full = header;
        full.extend_from_slice(&[1, 0, 0, 0]);

        let parsed = ContainerHeader::parse(&full).unwrap();
        assert_eq!(parsed.kind, ContainerType::Command);
        assert_eq!(parsed.code, 0x1002);
        assert_eq!(parsed.tid, 7);
        assert_eq!(parsed.payload_len, 4);
    }

    #[test]
    fn open_session_header_matches_spec_example() {
        // §8 scenario 2: Command{length=16, type=1, code=0x1002, tx_id=1, params=[1]}
        let mut buf = ContainerHeader::encode(ContainerType::Command, 0x1002, 1, 4);
        buf.write_u32::<LittleEndian>(1).unwrap();
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[0..4], &16u32.to_le_bytes());
    }

    #[test]
    fn rejects_short_header() {
        assert!(ContainerHeader::parse(&[0u8; 4]).is_err());
    }

    #[test]
    fn rejects_unknown_container_type() {
        let mut buf = vec![];
        buf.write_u32::<LittleEndian>(12).unwrap();
        buf.write_u16::<LittleEndian>(99).unwrap();
        buf.write_u16::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        assert!(ContainerHeader::parse(&buf).is_err());
    }
}
