// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! Reads the ACPI MCFG table exported by Linux under sysfs to find the
//! physical base of the PCIe Enhanced Configuration Access Mechanism (ECAM).
//!
//! Only the first allocation entry of the table is consulted, which covers
//! PCI segment group 0 on practically every host.

use crate::error::{DoeError, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// The table is exported under a numbered name when firmware provides more
/// than one MCFG.
pub const MCFG_TABLE_PATHS: [&str; 2] = [
    "/sys/firmware/acpi/tables/MCFG",
    "/sys/firmware/acpi/tables/MCFG1",
];

const MCFG_SIGNATURE: &[u8; 4] = b"MCFG";

/// 36 byte ACPI header, 8 reserved bytes and one 16 byte allocation entry.
pub const MCFG_RECORD_LEN: usize = 60;

/// The fields of the MCFG table we care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcmDescriptor {
    pub signature: [u8; 4],
    pub length: u32,
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
    pub base_address_lsb: u32,
    pub base_address_msb: u32,
    pub segment_group: u16,
    pub start_bus: u8,
    pub end_bus: u8,
}

fn le_u32(buf: &[u8; MCFG_RECORD_LEN], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

impl EcmDescriptor {
    pub fn from_bytes(buf: &[u8; MCFG_RECORD_LEN]) -> Self {
        let mut signature = [0; 4];
        signature.copy_from_slice(&buf[0..4]);
        let mut oem_table_id = [0; 8];
        oem_table_id.copy_from_slice(&buf[16..24]);

        EcmDescriptor {
            signature,
            length: le_u32(buf, 4),
            oem_table_id,
            oem_revision: le_u32(buf, 24),
            creator_id: le_u32(buf, 28),
            creator_revision: le_u32(buf, 32),
            base_address_lsb: le_u32(buf, 44),
            base_address_msb: le_u32(buf, 48),
            segment_group: u16::from_le_bytes([buf[52], buf[53]]),
            start_bus: buf[54],
            end_bus: buf[55],
        }
    }

    /// The 64-bit ECAM base address.
    pub fn base_address(&self) -> u64 {
        (u64::from(self.base_address_msb) << 32) | u64::from(self.base_address_lsb)
    }
}

/// # Summary
///
/// Reads the ECAM descriptor from the well known sysfs locations.
///
/// # Parameter
///
/// * `bus`: The PCI bus that will be scanned, checked against the table
///
/// # Returns
///
/// The descriptor on success
pub fn read_ecm_descriptor(bus: u8) -> Result<EcmDescriptor> {
    read_ecm_descriptor_from(&MCFG_TABLE_PATHS, bus)
}

/// # Summary
///
/// Reads the ECAM descriptor from the first of `paths` that can be opened.
///
/// # Parameter
///
/// * `paths`: Candidate table paths, in order of preference
/// * `bus`: The PCI bus that will be scanned
///
/// # Returns
///
/// The descriptor on success.
///
/// Err(TableUnavailable) if no path could be opened, Err(TableReadError) if
/// the record is short and Err(BusOutOfRange) if `bus` isn't below the end
/// bus of the table.
pub fn read_ecm_descriptor_from<P: AsRef<Path>>(paths: &[P], bus: u8) -> Result<EcmDescriptor> {
    debug!("Read ECM info ...");
    let (path, mut file) = paths
        .iter()
        .find_map(|p| {
            File::open(p.as_ref())
                .ok()
                .map(|f| (p.as_ref().to_path_buf(), f))
        })
        .ok_or_else(|| DoeError::TableUnavailable {
            tried: paths.iter().map(|p| p.as_ref().to_path_buf()).collect(),
        })?;

    let mut buf = [0u8; MCFG_RECORD_LEN];
    let res = file.read_exact(&mut buf);
    drop(file);
    res.map_err(|source| DoeError::TableReadError {
        path: path.clone(),
        source,
    })?;

    let ecm = EcmDescriptor::from_bytes(&buf);
    if &ecm.signature != MCFG_SIGNATURE {
        warn!(
            "{:?} has unexpected signature {:x?}, continuing",
            path, ecm.signature
        );
    }
    info!("{:?} read OK", path);
    info!(
        "ecm_base_address: 0x{:08x}_{:08x} (segment {}, bus {}..={})",
        ecm.base_address_msb, ecm.base_address_lsb, ecm.segment_group, ecm.start_bus, ecm.end_bus
    );

    if bus >= ecm.end_bus {
        error!("Bus {bus} is not below the MCFG end bus {}", ecm.end_bus);
        return Err(DoeError::BusOutOfRange {
            bus,
            end_bus: ecm.end_bus,
        });
    }

    Ok(ecm)
}

/// Builds a raw MCFG record, used by tests across the crate.
#[cfg(test)]
pub(crate) fn test_record(base: u64, start_bus: u8, end_bus: u8) -> [u8; MCFG_RECORD_LEN] {
    let mut buf = [0u8; MCFG_RECORD_LEN];
    buf[0..4].copy_from_slice(MCFG_SIGNATURE);
    buf[4..8].copy_from_slice(&60u32.to_le_bytes());
    buf[16..24].copy_from_slice(b"TESTOEM ");
    buf[24..28].copy_from_slice(&7u32.to_le_bytes());
    buf[44..48].copy_from_slice(&(base as u32).to_le_bytes());
    buf[48..52].copy_from_slice(&((base >> 32) as u32).to_le_bytes());
    buf[54] = start_bus;
    buf[55] = end_bus;
    buf
}

/// A path under the temp dir that is unique to this process and `name`.
#[cfg(test)]
pub(crate) fn test_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("doe-utils-{}-{name}", std::process::id()))
}
