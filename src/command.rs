use std::fmt::{self, LowerHex};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};

#[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
pub enum CommandCode {
    Standard(StandardCommandCode),
    Sdio(SdioCommandCode),
    Other(u16),
}

impl CommandCode {
    pub fn from_raw(code: u16) -> CommandCode {
        if let Some(std) = StandardCommandCode::from_u16(code) {
            return CommandCode::Standard(std);
        }
        if let Some(sdio) = SdioCommandCode::from_u16(code) {
            return CommandCode::Sdio(sdio);
        }
        CommandCode::Other(code)
    }

    pub fn code(&self) -> u16 {
        match self {
            CommandCode::Standard(c) => c.to_u16().unwrap(),
            CommandCode::Sdio(c) => c.to_u16().unwrap(),
            CommandCode::Other(c) => *c,
        }
    }
}

impl LowerHex for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.code(), f)
    }
}

impl From<StandardCommandCode> for CommandCode {
    fn from(code: StandardCommandCode) -> Self {
        CommandCode::Standard(code)
    }
}

impl From<SdioCommandCode> for CommandCode {
    fn from(code: SdioCommandCode) -> Self {
        CommandCode::Sdio(code)
    }
}

#[repr(u16)]
#[derive(FromPrimitive, ToPrimitive, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StandardCommandCode {
    Undefined = 0x1000,
    GetDeviceInfo = 0x1001,
    OpenSession = 0x1002,
    CloseSession = 0x1003,
    GetStorageIDs = 0x1004,
    GetStorageInfo = 0x1005,
    GetNumObjects = 0x1006,
    GetObjectHandles = 0x1007,
    GetObjectInfo = 0x1008,
    GetObject = 0x1009,
    GetThumb = 0x100A,
    DeleteObject = 0x100B,
    SendObjectInfo = 0x100C,
    SendObject = 0x100D,
    InitiateCapture = 0x100E,
    FormatStore = 0x100F,
    ResetDevice = 0x1010,
    SelfTest = 0x1011,
    SetObjectProtection = 0x1012,
    PowerDown = 0x1013,
    GetDevicePropDesc = 0x1014,
    GetDevicePropValue = 0x1015,
    SetDevicePropValue = 0x1016,
    ResetDevicePropValue = 0x1017,
    TerminateOpenCapture = 0x1018,
    MoveObject = 0x1019,
    CopyObject = 0x101A,
    GetPartialObject = 0x101B,
    InitiateOpenCapture = 0x101C,
}

impl LowerHex for StandardCommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let val = self.to_u16().unwrap();
        fmt::LowerHex::fmt(&val, f)
    }
}

/// Sony's SDIO vendor extension opcodes, used to unlock extended device control.
#[repr(u16)]
#[derive(FromPrimitive, ToPrimitive, Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SdioCommandCode {
    SdioExtDeviceDeleteObject = 0x96F1,
    SdioGetExtLensInfo = 0x96F4,
    SdioSendUpdateFile = 0x96F5,
    SdioGetAllExtDevicePropInfo = 0x96F6,
    SdioControlDevice = 0x96F8,
    SdioSetExtDevicePropValue = 0x96FA,
    SdioGetExtDeviceInfo = 0x96FD,
    SdioConnect = 0x96FE,
}

impl LowerHex for SdioCommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let val = self.to_u16().unwrap();
        fmt::LowerHex::fmt(&val, f)
    }
}

/// Response code returned by the camera when the SDIO protocol version offered by `auth`
/// is lower than the one the firmware expects; `auth` bumps its version and retries.
pub const SDIO_AUTH_VERSION_TOO_LOW: u16 = 0xA101;

/// Reserved PTP object handle Sony (and compatible) responders use to expose the live
/// JPEG preview frame through an ordinary `GetObject` transaction.
pub const LIVEVIEW_OBJECT_HANDLE: u32 = 0xFFFF_C002;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_standard_code() {
        assert_eq!(
            CommandCode::from_raw(0x1002),
            CommandCode::Standard(StandardCommandCode::OpenSession)
        );
    }

    #[test]
    fn decodes_sdio_code() {
        assert_eq!(
            CommandCode::from_raw(0x96FE),
            CommandCode::Sdio(SdioCommandCode::SdioConnect)
        );
    }

    #[test]
    fn unknown_code_is_other() {
        assert_eq!(CommandCode::from_raw(0xBEEF), CommandCode::Other(0xBEEF));
    }
}
