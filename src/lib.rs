// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! DOE-Utils: PCIe Data Object Exchange from Linux user space.
//!
//! The DOE mailbox of a device is found by reading the ECAM base from the
//! ACPI MCFG table, mapping configuration space through `/dev/mem`,
//! scanning a bus for the device and walking its extended capability list.
//! Data objects are then exchanged through the mailbox registers.
//!
//! ```no_run
//! use doe_utils::discovery::{discover, DiscoveryConfig};
//! use doe_utils::doe_pci_cfg::{DoeTransport, TransportConfig};
//! use doe_utils::phys_mem::DevMem;
//! use doe_utils::transport::DeviceIo;
//!
//! let mem = DevMem::default();
//! let location = discover(&mem, &DiscoveryConfig::default())?;
//! let mut doe = DoeTransport::new(location.registers, TransportConfig::default());
//! let response = doe.send_receive(&[0x01, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0, 0, 0, 0])?;
//! # Ok::<(), doe_utils::error::DoeError>(())
//! ```

#[macro_use]
extern crate log;

pub mod discovery;
pub mod doe_discovery;
pub mod doe_pci_cfg;
pub mod ecam;
pub mod error;
pub mod mcfg;
pub mod pcap;
pub mod phys_mem;
pub mod socket_client;
pub mod transport;
