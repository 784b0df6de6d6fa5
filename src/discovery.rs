// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! Finds the DOE mailbox of a device: MCFG → ECAM scan → capability walk.

use crate::doe_pci_cfg::DoeRegisterBlock;
use crate::ecam::{self, DeviceLocation, PCIE_EXT_CONFIG_SPACE_LEN, PCI_VENDOR_ID_SAMSUNG};
use crate::error::Result;
use crate::mcfg::{self, MCFG_TABLE_PATHS};
use crate::phys_mem::{map_physical, PhysicalMemory};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// PCI bus to scan.
    pub bus: u8,
    /// Vendor ID of the DOE capable device.
    pub vendor_id: u16,
    /// Offset of the DOE capability in config space, `None` (or 0) to search
    /// the extended capability list.
    pub register_offset: Option<u16>,
    /// MCFG table locations, tried in order.
    pub mcfg_paths: Vec<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            bus: 0,
            vendor_id: PCI_VENDOR_ID_SAMSUNG,
            register_offset: None,
            mcfg_paths: MCFG_TABLE_PATHS.iter().map(PathBuf::from).collect(),
        }
    }
}

/// A discovered DOE mailbox.
#[derive(Debug)]
pub struct DoeLocation {
    pub device: DeviceLocation,
    /// Offset of the DOE capability in the function's config space.
    pub register_offset: u16,
    /// The mapped registers, valid until the process exits.
    pub registers: DoeRegisterBlock,
}

impl DoeLocation {
    /// Physical address of the DOE extended capability header.
    pub fn physical_address(&self) -> u64 {
        self.device.config_address.address() + u64::from(self.register_offset)
    }
}

/// # Summary
///
/// Locates the DOE mailbox of the first function on `config.bus` with vendor
/// ID `config.vendor_id`.
///
/// The function's 4 KiB config space stays mapped for the rest of the
/// process once the DOE capability is found. Every other window is unmapped
/// before returning.
///
/// # Parameter
///
/// * `mem`: Physical memory to map config space from
/// * `config`: What and where to search
///
/// # Returns
///
/// The DOE location on success, to be handed to a
/// [`DoeTransport`](crate::doe_pci_cfg::DoeTransport).
///
/// An error when any step fails. [`DoeError::is_absent()`] tells apart a
/// missing device/capability from a broken environment.
///
/// [`DoeError::is_absent()`]: crate::error::DoeError::is_absent
pub fn discover<M: PhysicalMemory + ?Sized>(
    mem: &M,
    config: &DiscoveryConfig,
) -> Result<DoeLocation> {
    let ecm = mcfg::read_ecm_descriptor_from(&config.mcfg_paths, config.bus)?;
    let device = ecam::find_device(mem, &ecm, config.bus, config.vendor_id)?;

    let config_space = map_physical(
        mem,
        device.config_address.address(),
        PCIE_EXT_CONFIG_SPACE_LEN,
    )?;
    debug!(
        "Detect offset of PCIe DOE extended capability in {} (target offset {:#x})",
        device,
        config.register_offset.unwrap_or(0)
    );
    let register_offset = ecam::locate_doe_capability(&config_space, config.register_offset)?;

    let base = config_space.promote();
    // SAFETY: locate_doe_capability() only returns offsets, explicit or
    // listed, that leave room for the whole register block inside the
    // promoted 4 KiB window, which is never unmapped.
    let registers = unsafe { DoeRegisterBlock::new(base.add(usize::from(register_offset))) };

    let location = DoeLocation {
        device,
        register_offset,
        registers,
    };
    info!(
        "DOE register is found: {} + {:#x} (physical {:#x})",
        location.device,
        location.register_offset,
        location.physical_address()
    );
    Ok(location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doe_pci_cfg::DoeRegisters;
    use crate::ecam::{ConfigAddress, PCI_EXT_CAP_ID_DOE};
    use crate::error::DoeError;
    use crate::mcfg::{test_path, test_record};
    use crate::phys_mem::sim::SimPhysMem;
    use std::fs;

    const ECAM_BASE: u64 = 0xc000_0000;

    struct Fixture {
        mem: SimPhysMem,
        config: DiscoveryConfig,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            for p in &self.config.mcfg_paths {
                let _ = fs::remove_file(p);
            }
        }
    }

    /// A Samsung device at 05:00.1 with a DOE capability at 0x2a0, second in
    /// its extended capability list.
    fn fixture(name: &str, end_bus: u8) -> Fixture {
        let path = test_path(name);
        fs::write(&path, test_record(ECAM_BASE, 0, end_bus)).unwrap();

        let mem = SimPhysMem::default();
        let cfg = ConfigAddress::new(ECAM_BASE, 5, 0, 1, 0).address();
        mem.add_function(cfg, PCI_VENDOR_ID_SAMSUNG, 0xa824);
        mem.write_u32(cfg + 0x100, 0x2a01_0001);
        mem.write_u32(cfg + 0x2a0, 0x0002_0000 | u32::from(PCI_EXT_CAP_ID_DOE));
        mem.write_u32(cfg + 0x2a0 + 0x0c, 0x8000_0000);

        Fixture {
            mem,
            config: DiscoveryConfig {
                bus: 5,
                mcfg_paths: vec![path],
                ..Default::default()
            },
        }
    }

    #[test]
    fn discovers_doe_registers() {
        let f = fixture("discover-ok", 0xff);
        let loc = discover(&f.mem, &f.config).unwrap();

        assert_eq!((loc.device.device, loc.device.function), (0, 1));
        assert_eq!(loc.register_offset, 0x2a0);
        assert_eq!(loc.physical_address(), ECAM_BASE + 0x50_1000 + 0x2a0);
        assert_eq!(loc.registers.capability_version(), 2);
        assert!(loc.registers.is_data_ready());
        // Only the promoted config space is left mapped
        assert_eq!(f.mem.live.get(), 1);
    }

    #[test]
    fn bus_out_of_range_maps_nothing() {
        let f = fixture("discover-bus", 5);
        let res = discover(&f.mem, &f.config);
        assert!(matches!(
            res,
            Err(DoeError::BusOutOfRange { bus: 5, end_bus: 5 })
        ));
        assert_eq!(f.mem.maps.get(), 0);
    }

    #[test]
    fn missing_capability_unmaps_config_space() {
        let mut f = fixture("discover-nocap", 0xff);
        let cfg = ConfigAddress::new(ECAM_BASE, 5, 0, 1, 0).address();
        f.mem.write_u32(cfg + 0x2a0, 0x0001_0023);
        f.config.register_offset = Some(0);

        let res = discover(&f.mem, &f.config);
        assert!(matches!(res, Err(DoeError::CapabilityNotFound)));
        assert!(res.unwrap_err().is_absent());
        assert_eq!(f.mem.live.get(), 0);
    }

    #[test]
    fn listed_doe_past_the_window_is_rejected() {
        let f = fixture("discover-overflow", 0xff);
        let cfg = ConfigAddress::new(ECAM_BASE, 5, 0, 1, 0).address();
        f.mem.write_u32(cfg + 0x100, 0xff81_0001);
        f.mem
            .write_u32(cfg + 0xff8, 0x0002_0000 | u32::from(PCI_EXT_CAP_ID_DOE));

        let res = discover(&f.mem, &f.config);
        assert!(matches!(
            res,
            Err(DoeError::RegisterOffsetOutOfRange { offset: 0xff8 })
        ));
        assert_eq!(f.mem.live.get(), 0);
    }

    #[test]
    fn missing_device_is_absent() {
        let mut f = fixture("discover-nodev", 0xff);
        f.config.vendor_id = 0x1e0f;

        let err = discover(&f.mem, &f.config).unwrap_err();
        assert!(err.is_absent());
        assert_eq!(f.mem.live.get(), 0);
    }

    #[test]
    fn explicit_offset_is_stable() {
        let mut f = fixture("discover-explicit", 0xff);
        f.config.register_offset = Some(0x2a0);

        let first = discover(&f.mem, &f.config).unwrap();
        let second = discover(&f.mem, &f.config).unwrap();
        assert_eq!(first.registers.address(), second.registers.address());
        assert_eq!(first.physical_address(), second.physical_address());
    }
}
