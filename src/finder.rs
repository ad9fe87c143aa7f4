use log::debug;
use rusb::UsbContext;
use thiserror::Error;

pub const SONY_VENDOR_ID: u16 = 0x054C;
const PTP_INTERFACE_CLASS: u8 = 0x06;
const FX30_PRODUCT_ID: u16 = 0x0CDC;

/// Enumeration itself never fails outward (see `list_all_sony`); this exists so callers that
/// want to distinguish "no devices" from "usb subsystem unusable" have a typed reason.
#[derive(Error, Debug)]
pub enum EnumerationError {
    #[error("a usb error occurred: {0}")]
    Usb(#[from] rusb::Error),
}

/// An immutable snapshot of one enumerated USB device, taken at `list_all_sony`/`list_fx30`
/// time. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub product_name: String,
    pub serial_number: String,
}

/// Enumerates Sony (vendor 0x054C) PTP-class (interface class 0x06, "Still Image") devices.
/// Enumeration failures collapse to an empty list rather than propagating; string descriptor
/// lookups that fail leave `product_name`/`serial_number` empty rather than aborting the scan.
pub fn list_all_sony() -> Vec<DeviceRecord> {
    let context = match rusb::Context::new() {
        Ok(ctx) => ctx,
        Err(e) => {
            debug!("failed to initialize usb context: {}", e);
            return vec![];
        }
    };

    let devices = match context.devices() {
        Ok(d) => d,
        Err(e) => {
            debug!("failed to enumerate usb devices: {}", e);
            return vec![];
        }
    };

    devices
        .iter()
        .filter_map(|device| {
            let desc = device.device_descriptor().ok()?;
            if desc.vendor_id() != SONY_VENDOR_ID {
                return None;
            }
            if !is_ptp_device(&device) {
                return None;
            }

            let (product_name, serial_number) = fetch_strings(&device, &desc);

            Some(DeviceRecord {
                bus: device.bus_number(),
                address: device.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                product_name,
                serial_number,
            })
        })
        .collect()
}

/// Subset of `list_all_sony()` matching the FX30: a product-name substring match tried first,
/// OR'd with the (unverified upstream) `0x0CDC` product id as a non-exclusive hint.
pub fn list_fx30() -> Vec<DeviceRecord> {
    list_all_sony()
        .into_iter()
        .filter(|d| d.product_name.contains("FX30") || d.product_id == FX30_PRODUCT_ID)
        .collect()
}

/// Re-enumerates and opens the device at `bus`/`address`, for turning a `DeviceRecord` snapshot
/// into a live handle right before claiming it. A fresh lookup rather than caching the
/// `rusb::Device` on the record, since the record is meant to be a cheap, `Send`-able value.
pub fn open(bus: u8, address: u8) -> Result<rusb::DeviceHandle<rusb::Context>, EnumerationError> {
    let context = rusb::Context::new()?;
    let devices = context.devices()?;

    for device in devices.iter() {
        if device.bus_number() == bus && device.address() == address {
            return Ok(device.open()?);
        }
    }

    Err(EnumerationError::Usb(rusb::Error::NoDevice))
}

fn is_ptp_device<C: rusb::UsbContext>(device: &rusb::Device<C>) -> bool {
    let config = match device.active_config_descriptor() {
        Ok(c) => c,
        Err(_) => return false,
    };

    config
        .interfaces()
        .flat_map(|i| i.descriptors())
        .any(|d| d.class_code() == PTP_INTERFACE_CLASS)
}

fn fetch_strings<C: rusb::UsbContext>(
    device: &rusb::Device<C>,
    desc: &rusb::DeviceDescriptor,
) -> (String, String) {
    let handle = match device.open() {
        Ok(h) => h,
        Err(_) => return (String::new(), String::new()),
    };

    let languages = handle.read_languages(std::time::Duration::from_millis(200)).unwrap_or_default();
    let lang = match languages.first() {
        Some(l) => *l,
        None => return (String::new(), String::new()),
    };

    let product_name = desc
        .product_string_index()
        .and_then(|_| {
            handle
                .read_product_string(lang, desc, std::time::Duration::from_millis(200))
                .ok()
        })
        .unwrap_or_default();

    let serial_number = desc
        .serial_number_string_index()
        .and_then(|_| {
            handle
                .read_serial_number_string(lang, desc, std::time::Duration::from_millis(200))
                .ok()
        })
        .unwrap_or_default();

    (product_name, serial_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, product_id: u16) -> DeviceRecord {
        DeviceRecord {
            bus: 1,
            address: 1,
            vendor_id: SONY_VENDOR_ID,
            product_id,
            product_name: name.to_string(),
            serial_number: String::new(),
        }
    }

    #[test]
    fn fx30_filter_matches_name_substring() {
        let records = vec![
            record("ILCE-7M4", 0x1234),
            record("FX30", 0x0001),
            record("ILME-FX30", 0x0002),
        ];
        let matched: Vec<_> = records
            .into_iter()
            .filter(|d| d.product_name.contains("FX30") || d.product_id == FX30_PRODUCT_ID)
            .collect();
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].product_name, "FX30");
        assert_eq!(matched[1].product_name, "ILME-FX30");
    }

    #[test]
    fn fx30_filter_matches_unverified_product_id_alone() {
        let records = vec![record("ILCE-9M3", FX30_PRODUCT_ID)];
        let matched: Vec<_> = records
            .into_iter()
            .filter(|d| d.product_name.contains("FX30") || d.product_id == FX30_PRODUCT_ID)
            .collect();
        assert_eq!(matched.len(), 1);
    }
}
