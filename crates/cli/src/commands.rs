//! Command implementations

use crate::config::CliConfig;
use anyhow::{Context, Result};
use serde::Serialize;
use transport::{
    BulkTransport, ConfigLayout, DeviceIdentity, default_providers,
    find_bulk_endpoints,
};

/// Parse a hex payload
///
/// Tokens are separated by whitespace, `:` or `-`; each may carry its own `0x`.
pub fn parse_payload(input: &str) -> crate::Result<Vec<u8>> {
    let digits: String = input
        .split(|c: char| c.is_whitespace() || c == ':' || c == '-')
        .map(|token| {
            token
                .strip_prefix("0x")
                .or_else(|| token.strip_prefix("0X"))
                .unwrap_or(token)
        })
        .collect();
    Ok(hex::decode(digits)?)
}

/// Hex dump with 16 bytes per line
pub fn format_hex(data: &[u8]) -> String {
    data.chunks(16)
        .enumerate()
        .map(|(i, line)| {
            let bytes: Vec<String> = line.iter().map(|b| hex::encode([*b])).collect();
            format!("{:04x}  {}", i * 16, bytes.join(" "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// USB device with its vendor interface layout
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Bulk OUT/IN pair on the vendor interface, if present
    pub bulk_endpoints: Option<(u8, u8)>,
}

/// Result of opening a device
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub vendor_id: u16,
    pub product_id: u16,
    pub backend: String,
    pub interface: u8,
    pub out_endpoint: u8,
    pub in_endpoint: u8,
}

impl DeviceSummary {
    pub fn from_layout(
        bus: u8,
        address: u8,
        vendor_id: u16,
        product_id: u16,
        layout: Option<&ConfigLayout>,
    ) -> Self {
        let bulk_endpoints = layout
            .and_then(find_bulk_endpoints)
            .map(|e| (e.out_endpoint, e.in_endpoint));
        Self {
            bus,
            address,
            vendor_id,
            product_id,
            bulk_endpoints,
        }
    }
}

/// Enumerate devices, optionally restricted to one vendor
pub fn list_devices(vendor_id: Option<u16>) -> Result<Vec<DeviceSummary>> {
    let devices = rusb::devices().context("Failed to enumerate USB devices")?;

    let mut summaries = Vec::new();
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!("Skipping device without descriptor: {}", e);
                continue;
            }
        };
        if vendor_id.is_some_and(|vid| vid != descriptor.vendor_id()) {
            continue;
        }

        let layout = device
            .active_config_descriptor()
            .ok()
            .map(|config| ConfigLayout::from(&config));

        summaries.push(DeviceSummary::from_layout(
            device.bus_number(),
            device.address(),
            descriptor.vendor_id(),
            descriptor.product_id(),
            layout.as_ref(),
        ));
    }

    Ok(summaries)
}

/// Open the configured device with the platform's providers
pub fn open_transport(config: &CliConfig) -> Result<BulkTransport> {
    let device = DeviceIdentity::new(config.device.vendor_id, config.device.product_id);
    let mut transport = BulkTransport::new();
    transport
        .open_with(&device, &default_providers(&config.transport))
        .with_context(|| {
            format!(
                "Failed to open {:04x}:{:04x}",
                config.device.vendor_id, config.device.product_id
            )
        })?;
    Ok(transport)
}

pub fn probe_report(config: &CliConfig, transport: &BulkTransport) -> Option<ProbeReport> {
    let endpoints = transport.endpoints()?;
    let backend = transport.kind()?;
    Some(ProbeReport {
        vendor_id: config.device.vendor_id,
        product_id: config.device.product_id,
        backend: backend.to_string(),
        interface: endpoints.interface_number,
        out_endpoint: endpoints.out_endpoint,
        in_endpoint: endpoints.in_endpoint,
    })
}

/// Write `payload`, then optionally read up to `response_len` bytes
pub fn send(
    transport: &mut BulkTransport,
    payload: &[u8],
    timeout_ms: u32,
    response_len: usize,
) -> Result<Vec<u8>> {
    let written = transport
        .write(payload, timeout_ms)
        .context("Bulk write failed")?;
    tracing::debug!("Wrote {} of {} bytes", written, payload.len());

    if response_len == 0 {
        return Ok(Vec::new());
    }
    read(transport, response_len)
}

/// Read up to `len` bytes, stopping at the first short packet
pub fn read(transport: &mut BulkTransport, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let n = transport.read(&mut buf).context("Bulk read failed")?;
    buf.truncate(n);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::test_utils::{layout_without_vendor_interface, vendor_layout};

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload("02 91 01 04").unwrap(), vec![0x02, 0x91, 0x01, 0x04]);
        assert_eq!(parse_payload("0x0291").unwrap(), vec![0x02, 0x91]);
        assert_eq!(parse_payload("aa:bb-cc").unwrap(), vec![0xaa, 0xbb, 0xcc]);
        assert_eq!(parse_payload("0x02 0x91").unwrap(), vec![0x02, 0x91]);
        assert_eq!(parse_payload("0X02:0x91  01").unwrap(), vec![0x02, 0x91, 0x01]);
        assert!(parse_payload("abc").is_err());
        assert!(parse_payload("zz").is_err());
    }

    #[test]
    fn test_format_hex() {
        let data: Vec<u8> = (0..18).collect();
        let dump = format_hex(&data);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000  00 01 02"));
        assert_eq!(lines[1], "0010  10 11");
        assert_eq!(format_hex(&[]), "");
    }

    #[test]
    fn test_summary_reports_bulk_pair() {
        let layout = vendor_layout();
        let summary = DeviceSummary::from_layout(1, 4, 0x057e, 0x2069, Some(&layout));
        assert_eq!(summary.bulk_endpoints, Some((0x02, 0x82)));

        let layout = layout_without_vendor_interface();
        let summary = DeviceSummary::from_layout(1, 4, 0x057e, 0x2069, Some(&layout));
        assert_eq!(summary.bulk_endpoints, None);

        let summary = DeviceSummary::from_layout(1, 4, 0x057e, 0x2069, None);
        assert_eq!(summary.bulk_endpoints, None);
    }

    #[test]
    fn test_summary_serializes_to_json() {
        let layout = vendor_layout();
        let summary = DeviceSummary::from_layout(3, 7, 0x057e, 0x2069, Some(&layout));
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["vendor_id"], 0x057e);
        assert_eq!(json["bulk_endpoints"][1], 0x82);
    }
}
