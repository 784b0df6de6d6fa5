// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! The DOE Discovery data object (PCIe r6.0 section 6.30.1.1), used to ask a
//! DOE instance which data object protocols it supports.

use crate::error::{DoeError, Result};
use crate::transport::DeviceIo;
use std::fmt;

/// DOE Header
const DOE_HEADER1_OFST_VID: u32 = 0;
const DOE_HEADER1_OFST_TYPE: u32 = 16;
const DOE_HEADER2_LEN_MASK: u32 = 0x0003_FFFF;

const PCI_VENDOR_ID_PCI_SIG: u16 = 0x0001;
const PCI_DOE_PROTOCOL_DISCOVERY: u8 = 0x00;

/// Discovery request dword
const DOE_REQUEST_INDEX_MASK: u32 = 0x0000_00FF;
const DOE_REQUEST_VERSION_SHIFT: u32 = 8;

/// Discovery response dword
const DOE_RESPONSE_VID_MASK: u32 = 0x0000_FFFF;
const DOE_RESPONSE_PROTOCOL_MASK: u32 = 0x00FF_0000;
const DOE_RESPONSE_PROTOCOL_SHIFT: u32 = 16;
const DOE_RESPONSE_NEXT_INDEX_MASK: u32 = 0xFF00_0000;
const DOE_RESPONSE_NEXT_INDEX_SHIFT: u32 = 24;

/// Capability version from which the request carries a version field.
pub const DOE_VERSION: u8 = 2;

/// A Discovery request for entry `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryRequest {
    pub index: u8,
    /// Discovery version, only sent to DOE version 2 instances.
    pub version: Option<u8>,
}

impl DiscoveryRequest {
    pub fn as_array(&self) -> [u32; 3] {
        let header1 = (u32::from(PCI_DOE_PROTOCOL_DISCOVERY) << DOE_HEADER1_OFST_TYPE)
            | (u32::from(PCI_VENDOR_ID_PCI_SIG) << DOE_HEADER1_OFST_VID);
        // Length is 2 DW of header + 1 DW of payload
        let header2 = 3;
        let mut dw0 = u32::from(self.index) & DOE_REQUEST_INDEX_MASK;
        if let Some(version) = self.version {
            dw0 |= u32::from(version) << DOE_REQUEST_VERSION_SHIFT;
        }
        [header1, header2, dw0]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_array()
            .iter()
            .flat_map(|dw| dw.to_le_bytes())
            .collect()
    }
}

impl fmt::Display for DiscoveryRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DISC_REQ: [VERSION: {}, INDEX: {}]",
            self.version.unwrap_or(0),
            self.index
        )
    }
}

/// One entry of a Discovery response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub vendor_id: u16,
    pub protocol: u8,
    /// Index of the next entry, 0 after the last one.
    pub next_index: u8,
}

impl DiscoveryResponse {
    /// # Summary
    ///
    /// Parses a Discovery response data object.
    ///
    /// # Returns
    ///
    /// Err(MalformedResponse) if the data object is shorter than the header
    /// plus one dword, or isn't a Discovery object.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let dwords: Vec<u32> = data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if dwords.len() < 3 {
            return Err(DoeError::MalformedResponse {
                reason: format!("{} bytes is too short for a discovery response", data.len()),
            });
        }

        let header1 = dwords[0];
        if (header1 & 0xFFFF) as u16 != PCI_VENDOR_ID_PCI_SIG
            || ((header1 >> DOE_HEADER1_OFST_TYPE) & 0xFF) as u8 != PCI_DOE_PROTOCOL_DISCOVERY
        {
            return Err(DoeError::MalformedResponse {
                reason: format!("not a discovery data object (header {header1:#010x})"),
            });
        }
        let len = (dwords[1] & DOE_HEADER2_LEN_MASK) as usize;
        if len != dwords.len() {
            warn!(
                "Discovery response length field {len} doesn't match {} dwords received",
                dwords.len()
            );
        }

        let dw0 = dwords[2];
        Ok(DiscoveryResponse {
            vendor_id: (dw0 & DOE_RESPONSE_VID_MASK) as u16,
            protocol: ((dw0 & DOE_RESPONSE_PROTOCOL_MASK) >> DOE_RESPONSE_PROTOCOL_SHIFT) as u8,
            next_index: ((dw0 & DOE_RESPONSE_NEXT_INDEX_MASK) >> DOE_RESPONSE_NEXT_INDEX_SHIFT)
                as u8,
        })
    }

    pub fn protocol_name(&self) -> &'static str {
        if self.vendor_id != PCI_VENDOR_ID_PCI_SIG {
            return "Vendor defined";
        }
        match self.protocol {
            0 => "Discovery",
            1 => "CMA/SPDM",
            2 => "Secured CMA/SPDM",
            _ => "Reserved",
        }
    }
}

impl fmt::Display for DiscoveryResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "DISC_RESP: [NEXT_INDEX: {}, DO_PROT: {} ({}), VID: {:#06x}]",
            self.next_index,
            self.protocol,
            self.protocol_name(),
            self.vendor_id
        )
    }
}

/// # Summary
///
/// Issues Discovery requests starting from index 0 until the responder
/// reports the last entry.
///
/// # Parameter
///
/// * `io`: The transport to the DOE instance
/// * `version`: Discovery version to request, see [`DiscoveryRequest`]
///
/// # Returns
///
/// Every protocol the instance reports, in index order.
pub fn enumerate_protocols<T: DeviceIo + ?Sized>(
    io: &mut T,
    version: Option<u8>,
) -> Result<Vec<DiscoveryResponse>> {
    let mut protocols = Vec::new();
    let mut index = 0u8;

    loop {
        let request = DiscoveryRequest { index, version };
        debug!("Discovery Request: {request}");
        let response = DiscoveryResponse::parse(&io.send_receive(&request.to_bytes())?)?;
        info!("Discovery Response: {response}");

        if response.vendor_id == 0xFFFF {
            return Err(DoeError::MalformedResponse {
                reason: format!("index {index} rejected by the DOE instance"),
            });
        }
        protocols.push(response);

        if response.next_index == 0 {
            info!("All discoverable objects found");
            break;
        }
        // Indices only ever grow, which also bounds the loop
        if response.next_index <= index {
            warn!(
                "Discovery index went from {index} to {}, stopping",
                response.next_index
            );
            break;
        }
        index = response.next_index;
    }

    Ok(protocols)
}
