//! Identity of the device a transport binds to

use crate::handle::SharedDeviceHandle;
use std::collections::HashMap;

/// Property key under which the input stack publishes its open libusb handle
pub const PROP_LIBUSB_DEVICE_HANDLE: &str = "hidapi.libusb.device_handle";

/// Nintendo's USB vendor id
pub const NINTENDO_VENDOR_ID: u16 = 0x057e;

/// Value stored in a device's property bag
#[derive(Debug, Clone)]
pub enum PropertyValue {
    DeviceHandle(SharedDeviceHandle),
    Text(String),
    Number(i64),
}

/// Property bag attached to an identified device
#[derive(Debug, Clone, Default)]
pub struct DeviceProperties {
    values: HashMap<String, PropertyValue>,
}

impl DeviceProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.values.remove(key)
    }

    /// Device handle stored under `key`, if the value is a handle
    pub fn device_handle(&self, key: &str) -> Option<SharedDeviceHandle> {
        match self.get(key)? {
            PropertyValue::DeviceHandle(handle) => Some(handle.clone()),
            _ => None,
        }
    }
}

/// An already-identified physical device
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub properties: DeviceProperties,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            properties: DeviceProperties::new(),
        }
    }

    /// Attach the input stack's open handle
    pub fn with_shared_handle(mut self, handle: SharedDeviceHandle) -> Self {
        self.properties.set(
            PROP_LIBUSB_DEVICE_HANDLE,
            PropertyValue::DeviceHandle(handle),
        );
        self
    }

    /// Handle published by the input stack, if any
    pub fn shared_handle(&self) -> Option<SharedDeviceHandle> {
        self.properties.device_handle(PROP_LIBUSB_DEVICE_HANDLE)
    }

    /// Whether a native device interface path belongs to this vendor
    ///
    /// Paths look like `\\?\usb#vid_057e&pid_2069&mi_01#...`; the match is
    /// case-insensitive because drivers disagree on casing.
    pub fn matches_device_path(&self, path: &str) -> bool {
        let needle = format!("vid_{:04x}", self.vendor_id);
        path.to_ascii_lowercase().contains(&needle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockDeviceHandle;

    #[test]
    fn test_device_path_match_ignores_case() {
        let device = DeviceIdentity::new(NINTENDO_VENDOR_ID, 0x2069);
        assert!(device.matches_device_path(r"\\?\usb#vid_057e&pid_2069&mi_01#7&1"));
        assert!(device.matches_device_path(r"\\?\USB#VID_057E&PID_2069&MI_01#7&1"));
        assert!(!device.matches_device_path(r"\\?\usb#vid_045e&pid_028e#1"));
    }

    #[test]
    fn test_shared_handle_lookup() {
        let device = DeviceIdentity::new(0x057e, 0x2069);
        assert!(device.shared_handle().is_none());

        let handle = SharedDeviceHandle::new(MockDeviceHandle::vendor_device());
        let device = device.with_shared_handle(handle.clone());
        assert!(device.shared_handle().is_some());
        assert_eq!(handle.holders(), 2);
    }

    #[test]
    fn test_non_handle_property_is_not_a_handle() {
        let mut device = DeviceIdentity::new(0x057e, 0x2069);
        device.properties.set(
            PROP_LIBUSB_DEVICE_HANDLE,
            PropertyValue::Text("not a handle".into()),
        );
        assert!(device.shared_handle().is_none());
    }
}
