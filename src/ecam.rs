// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! PCIe configuration space access through ECAM.
//!
//! This covers scanning a bus for a function with a given vendor ID and
//! walking that function's extended capability list to find the DOE
//! capability. Config space is live device memory, so nothing here caches
//! what it has read.

use crate::doe_pci_cfg::DOE_REGISTER_BLOCK_LEN;
use crate::error::{DoeError, Result};
use crate::mcfg::EcmDescriptor;
use crate::phys_mem::{map_physical, MappedWindow, PhysicalMemory};
use std::fmt;

pub const MAX_DEVICE_NUM: u8 = 0x20;
pub const MAX_FUNCTION_NUM: u8 = 0x8;

/// Legacy (type 0/1 header) portion of a function's config space.
pub const PCI_CONFIG_SPACE_LEN: usize = 0x100;
/// Full PCIe config space of a function, including the extended part.
pub const PCIE_EXT_CONFIG_SPACE_LEN: usize = 0x1000;
/// The extended capability list always starts here.
pub const PCIE_EXT_CAP_START: u16 = 0x100;

pub const PCI_EXT_CAP_ID_DOE: u16 = 0x002E;
pub const PCI_VENDOR_ID_SAMSUNG: u16 = 0x144D;

const PCI_VENDOR_ID: usize = 0x00;

/// Upper bound on list length, every header takes at least one dword.
const MAX_EXT_CAPS: usize = (PCIE_EXT_CONFIG_SPACE_LEN - PCIE_EXT_CAP_START as usize) / 4;

/// Physical address of a config space register.
///
/// ```text
///  31    28 27     20 19    15 14  12 11       0
/// | base   |   bus   | device | func | register |
/// ```
///
/// The bus/device/function/register fields are ORed into the ECAM base, so
/// the base must be aligned to the decoded bus range, as firmware guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfigAddress(u64);

impl ConfigAddress {
    pub fn new(ecam_base: u64, bus: u8, device: u8, function: u8, register: u16) -> Self {
        ConfigAddress(
            ecam_base
                | (u64::from(bus) << 20)
                | (u64::from(device & 0x1f) << 15)
                | (u64::from(function & 0x7) << 12)
                | u64::from(register & 0xfff),
        )
    }

    pub fn address(self) -> u64 {
        self.0
    }

    pub fn high(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn low(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for ConfigAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:08x}_{:08x}", self.high(), self.low())
    }
}

/// Where a matching function was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLocation {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    /// Address of register 0 of the function.
    pub config_address: ConfigAddress,
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// # Summary
///
/// Scans every device and function on `bus` for the first function whose
/// vendor ID is `vendor_id`. Each function's config header is mapped, checked
/// and unmapped again before moving on, whether or not it matched.
///
/// # Parameter
///
/// * `mem`: Physical memory to map config space from
/// * `ecm`: The ECAM descriptor read from the MCFG table
/// * `bus`: PCI bus to scan
/// * `vendor_id`: PCIe Vendor ID to look for
///
/// # Returns
///
/// The location of the first match, scanning device-major in ascending order.
///
/// Err(DeviceNotFound) if no function matched, or the mapping error if a
/// config header couldn't be mapped.
pub fn find_device<M: PhysicalMemory + ?Sized>(
    mem: &M,
    ecm: &EcmDescriptor,
    bus: u8,
    vendor_id: u16,
) -> Result<DeviceLocation> {
    info!("Search vendor {vendor_id:#06x} on PCI bus {bus} ...");

    for device in 0..MAX_DEVICE_NUM {
        for function in 0..MAX_FUNCTION_NUM {
            let config_address = ConfigAddress::new(ecm.base_address(), bus, device, function, 0);
            let header = map_physical(mem, config_address.address(), PCI_CONFIG_SPACE_LEN)?;
            let found = header.read_u16(PCI_VENDOR_ID) == vendor_id;
            header.release();

            if found {
                let location = DeviceLocation {
                    bus,
                    device,
                    function,
                    config_address,
                };
                info!("Device {vendor_id:#06x} is found! {location}");
                return Ok(location);
            }
        }
    }

    warn!("Device {vendor_id:#06x} is NOT found on PCI bus {bus}");
    Err(DoeError::DeviceNotFound { bus, vendor_id })
}

/// Dword access to a function's config space.
pub trait ConfigSpace {
    /// Reads the dword at byte `offset`. Every call reads the hardware.
    fn read_u32(&self, offset: usize) -> u32;
}

impl<M: PhysicalMemory + ?Sized> ConfigSpace for MappedWindow<'_, M> {
    fn read_u32(&self, offset: usize) -> u32 {
        MappedWindow::read_u32(self, offset)
    }
}

/// A decoded PCIe extended capability header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedCapabilityNode(u32);

impl ExtendedCapabilityNode {
    pub fn id(self) -> u16 {
        self.0 as u16
    }

    pub fn version(self) -> u8 {
        ((self.0 >> 16) & 0xf) as u8
    }

    /// Offset of the next header from the start of config space. 0 ends the
    /// list.
    pub fn next_offset(self) -> u16 {
        (self.0 >> 20) as u16
    }
}

impl From<u32> for ExtendedCapabilityNode {
    fn from(raw: u32) -> Self {
        ExtendedCapabilityNode(raw)
    }
}

/// The DOE registers at `offset` must be dword aligned and end inside the
/// mapped extended config space.
fn check_register_block(offset: u16) -> Result<u16> {
    if offset % 4 != 0 || usize::from(offset) + DOE_REGISTER_BLOCK_LEN > PCIE_EXT_CONFIG_SPACE_LEN
    {
        error!("DOE register offset {offset:#x} doesn't fit in extended config space");
        return Err(DoeError::RegisterOffsetOutOfRange { offset });
    }
    Ok(offset)
}

/// # Summary
///
/// Finds the DOE register block in a function's extended config space.
///
/// # Parameter
///
/// * `space`: The function's 4 KiB config space
/// * `explicit_offset`: A user specified offset of the DOE capability. When
///   non-zero it is used as is and the capability ID isn't checked.
///
/// # Returns
///
/// Ok(offset) of the DOE extended capability header.
///
/// Err(CapabilityNotFound) if the list ends without a DOE capability, or
/// Err(RegisterOffsetOutOfRange) if the explicit or listed offset can't hold
/// the DOE registers.
pub fn locate_doe_capability<C: ConfigSpace + ?Sized>(
    space: &C,
    explicit_offset: Option<u16>,
) -> Result<u16> {
    if let Some(offset) = explicit_offset.filter(|o| *o != 0) {
        debug!("[detecting pci capa] use user specified address offset {offset:#x}");
        return check_register_block(offset);
    }

    let mut offset = PCIE_EXT_CAP_START;
    for _ in 0..MAX_EXT_CAPS {
        let node = ExtendedCapabilityNode::from(space.read_u32(usize::from(offset)));
        debug!(
            "[detecting pci capa] {offset:#05x}: id {:#06x} ver {} next {:#05x}",
            node.id(),
            node.version(),
            node.next_offset()
        );

        if node.id() == PCI_EXT_CAP_ID_DOE {
            info!("DOE extended capability found at {offset:#x}");
            return check_register_block(offset);
        }

        // The low two bits of the pointer are reserved
        let next = node.next_offset() & !0x3;
        if next == 0 {
            break;
        }
        if next < PCIE_EXT_CAP_START {
            warn!("Extended capability at {offset:#x} points back into legacy space ({next:#x})");
            break;
        }
        offset = next;
    }

    warn!("PCI-DOE Register NOT detected");
    Err(DoeError::CapabilityNotFound)
}
