//! Configuration descriptor model and endpoint discovery
//!
//! The generic backend walks the active configuration descriptor to find the
//! vendor bulk interface. The descriptor is copied out of rusb into a small
//! owned tree so discovery can be run against synthetic layouts as well.

use rusb::{ConfigDescriptor, TransferType};

/// Interface number of the vendor bulk interface on this device
pub const VENDOR_INTERFACE: u8 = 1;

/// Direction bit of an endpoint address (set for device-to-host)
pub const ENDPOINT_DIR_MASK: u8 = 0x80;

/// Bulk endpoint pair of the vendor interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub interface_number: u8,
    /// Host-to-device endpoint address
    pub out_endpoint: u8,
    /// Device-to-host endpoint address
    pub in_endpoint: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointLayout {
    pub address: u8,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

impl EndpointLayout {
    pub fn is_in(&self) -> bool {
        self.address & ENDPOINT_DIR_MASK != 0
    }

    pub fn is_bulk(&self) -> bool {
        self.transfer_type == TransferType::Bulk
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSettingLayout {
    pub interface_number: u8,
    pub setting_number: u8,
    pub endpoints: Vec<EndpointLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceLayout {
    pub number: u8,
    pub alt_settings: Vec<AltSettingLayout>,
}

/// Owned copy of a configuration descriptor
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigLayout {
    pub interfaces: Vec<InterfaceLayout>,
}

impl From<&ConfigDescriptor> for ConfigLayout {
    fn from(config: &ConfigDescriptor) -> Self {
        let interfaces = config
            .interfaces()
            .map(|interface| InterfaceLayout {
                number: interface.number(),
                alt_settings: interface
                    .descriptors()
                    .map(|alt| AltSettingLayout {
                        interface_number: alt.interface_number(),
                        setting_number: alt.setting_number(),
                        endpoints: alt
                            .endpoint_descriptors()
                            .map(|ep| EndpointLayout {
                                address: ep.address(),
                                transfer_type: ep.transfer_type(),
                                max_packet_size: ep.max_packet_size(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        ConfigLayout { interfaces }
    }
}

/// Tracks which bulk directions have been seen, first match wins
#[derive(Debug, Default)]
pub(crate) struct BulkPairScan {
    out_endpoint: Option<u8>,
    in_endpoint: Option<u8>,
}

impl BulkPairScan {
    /// Record a bulk endpoint address; returns true once both directions are known
    pub(crate) fn record(&mut self, address: u8) -> bool {
        if address & ENDPOINT_DIR_MASK != 0 {
            self.in_endpoint.get_or_insert(address);
        } else {
            self.out_endpoint.get_or_insert(address);
        }
        self.is_complete()
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.out_endpoint.is_some() && self.in_endpoint.is_some()
    }

    pub(crate) fn finish(&self, interface_number: u8) -> Option<BulkEndpoints> {
        Some(BulkEndpoints {
            interface_number,
            out_endpoint: self.out_endpoint?,
            in_endpoint: self.in_endpoint?,
        })
    }
}

/// Locate the bulk IN/OUT endpoints of the vendor interface
///
/// Scans every interface, alternate setting and endpoint in order, stopping
/// as soon as one bulk endpoint of each direction has been found on an
/// alternate setting numbered [`VENDOR_INTERFACE`].
pub fn find_bulk_endpoints(config: &ConfigLayout) -> Option<BulkEndpoints> {
    let mut scan = BulkPairScan::default();

    for interface in &config.interfaces {
        for alt in &interface.alt_settings {
            if alt.interface_number != VENDOR_INTERFACE {
                continue;
            }
            for ep in alt.endpoints.iter().filter(|ep| ep.is_bulk()) {
                if scan.record(ep.address) {
                    return scan.finish(VENDOR_INTERFACE);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(address: u8, transfer_type: TransferType) -> EndpointLayout {
        EndpointLayout {
            address,
            transfer_type,
            max_packet_size: 64,
        }
    }

    fn single(number: u8, endpoints: Vec<EndpointLayout>) -> InterfaceLayout {
        InterfaceLayout {
            number,
            alt_settings: vec![AltSettingLayout {
                interface_number: number,
                setting_number: 0,
                endpoints,
            }],
        }
    }

    #[test]
    fn test_finds_vendor_bulk_pair() {
        let config = ConfigLayout {
            interfaces: vec![
                single(0, vec![ep(0x81, TransferType::Interrupt)]),
                single(
                    1,
                    vec![ep(0x02, TransferType::Bulk), ep(0x82, TransferType::Bulk)],
                ),
            ],
        };

        assert_eq!(
            find_bulk_endpoints(&config),
            Some(BulkEndpoints {
                interface_number: 1,
                out_endpoint: 0x02,
                in_endpoint: 0x82,
            })
        );
    }

    #[test]
    fn test_ignores_bulk_on_other_interfaces() {
        let config = ConfigLayout {
            interfaces: vec![
                single(
                    0,
                    vec![ep(0x01, TransferType::Bulk), ep(0x81, TransferType::Bulk)],
                ),
                single(1, vec![ep(0x02, TransferType::Bulk)]),
            ],
        };

        assert_eq!(find_bulk_endpoints(&config), None);
    }

    #[test]
    fn test_first_match_wins() {
        let config = ConfigLayout {
            interfaces: vec![single(
                1,
                vec![
                    ep(0x83, TransferType::Bulk),
                    ep(0x03, TransferType::Bulk),
                    ep(0x84, TransferType::Bulk),
                ],
            )],
        };

        let found = find_bulk_endpoints(&config).unwrap();
        assert_eq!(found.in_endpoint, 0x83);
        assert_eq!(found.out_endpoint, 0x03);
    }

    #[test]
    fn test_pair_split_across_alt_settings() {
        let config = ConfigLayout {
            interfaces: vec![InterfaceLayout {
                number: 1,
                alt_settings: vec![
                    AltSettingLayout {
                        interface_number: 1,
                        setting_number: 0,
                        endpoints: vec![ep(0x02, TransferType::Bulk)],
                    },
                    AltSettingLayout {
                        interface_number: 1,
                        setting_number: 1,
                        endpoints: vec![ep(0x82, TransferType::Bulk)],
                    },
                ],
            }],
        };

        assert!(find_bulk_endpoints(&config).is_some());
    }

    #[test]
    fn test_empty_config() {
        assert_eq!(find_bulk_endpoints(&ConfigLayout::default()), None);
    }
}
