// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! Drives discovery and the DOE mailbox through the public API, over a
//! fake physical address space and a fake MCFG table.

use doe_utils::discovery::{discover, DiscoveryConfig};
use doe_utils::doe_pci_cfg::{DoeControl, DoeStatus, DoeTransport, TransportConfig};
use doe_utils::ecam::{ConfigAddress, PCI_EXT_CAP_ID_DOE};
use doe_utils::error::{DoeError, Result};
use doe_utils::phys_mem::PhysicalMemory;
use doe_utils::transport::DeviceIo;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::time::Duration;

const ECAM_BASE: u64 = 0x0000_0001_8000_0000;
const VENDOR_ID: u16 = 0x1b36;

/// Physical memory made of leaked 4 KiB pages that read as all ones until
/// written.
#[derive(Default)]
struct FakeMemory {
    pages: RefCell<BTreeMap<u64, NonNull<u32>>>,
    live: Cell<usize>,
}

impl FakeMemory {
    fn ptr(&self, addr: u64) -> NonNull<u32> {
        let page = *self
            .pages
            .borrow_mut()
            .entry(addr & !0xfff)
            .or_insert_with(|| NonNull::from(Box::leak(Box::new([u32::MAX; 1024]))).cast());
        unsafe { page.add(((addr & 0xfff) / 4) as usize) }
    }

    fn write(&self, addr: u64, value: u32) {
        unsafe { self.ptr(addr).as_ptr().write_volatile(value) }
    }

    fn read(&self, addr: u64) -> u32 {
        unsafe { self.ptr(addr).as_ptr().read_volatile() }
    }
}

impl PhysicalMemory for FakeMemory {
    fn map(&self, base: u64, length: usize) -> Result<NonNull<u8>> {
        assert!((base & 0xfff) + length as u64 <= 0x1000);
        self.live.set(self.live.get() + 1);
        Ok(self.ptr(base).cast())
    }

    unsafe fn unmap(&self, _ptr: NonNull<u8>, _length: usize) {
        self.live.set(self.live.get() - 1);
    }
}

struct Platform {
    mem: FakeMemory,
    config: DiscoveryConfig,
    /// Physical address of the DOE capability header
    doe: u64,
}

impl Drop for Platform {
    fn drop(&mut self) {
        for p in &self.config.mcfg_paths {
            let _ = fs::remove_file(p);
        }
    }
}

fn mcfg_record(base: u64, end_bus: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 60];
    buf[0..4].copy_from_slice(b"MCFG");
    buf[4..8].copy_from_slice(&60u32.to_le_bytes());
    buf[44..48].copy_from_slice(&(base as u32).to_le_bytes());
    buf[48..52].copy_from_slice(&((base >> 32) as u32).to_le_bytes());
    buf[55] = end_bus;
    buf
}

/// Bus 2 holds an unrelated device at 02:00.0 and the DOE device at 02:03.0.
/// The DOE capability is the third entry of the extended capability list.
fn platform(name: &str) -> Platform {
    let path: PathBuf =
        std::env::temp_dir().join(format!("doe-utils-it-{}-{name}", std::process::id()));
    fs::write(&path, mcfg_record(ECAM_BASE, 0x10)).unwrap();

    let mem = FakeMemory::default();
    let other = ConfigAddress::new(ECAM_BASE, 2, 0, 0, 0).address();
    mem.write(other, 0x0001_8086);

    let cfg = ConfigAddress::new(ECAM_BASE, 2, 3, 0, 0).address();
    mem.write(cfg, 0x0010_0000 | u32::from(VENDOR_ID));
    // AER -> Serial number -> DOE
    mem.write(cfg + 0x100, 0x1401_0001);
    mem.write(cfg + 0x140, 0x1501_0003);
    mem.write(cfg + 0x150, 0x0002_0000 | u32::from(PCI_EXT_CAP_ID_DOE));
    for reg in [0x4, 0x8, 0xc, 0x10, 0x14] {
        mem.write(cfg + 0x150 + reg, 0);
    }

    Platform {
        mem,
        config: DiscoveryConfig {
            bus: 2,
            vendor_id: VENDOR_ID,
            register_offset: None,
            mcfg_paths: vec![path],
        },
        doe: cfg + 0x150,
    }
}

#[test]
fn finds_doe_behind_other_capabilities() {
    let p = platform("walk");
    let loc = discover(&p.mem, &p.config).unwrap();

    assert_eq!(loc.device.to_string(), "02:03.0");
    assert_eq!(loc.register_offset, 0x150);
    assert_eq!(loc.physical_address(), p.doe);
    assert_eq!(p.mem.live.get(), 1);
}

#[test]
fn unknown_vendor_is_not_found() {
    let mut p = platform("vendor");
    p.config.vendor_id = 0xabcd;

    let err = discover(&p.mem, &p.config).unwrap_err();
    assert!(matches!(
        err,
        DoeError::DeviceNotFound {
            bus: 2,
            vendor_id: 0xabcd
        }
    ));
    assert!(err.is_absent());
    assert_eq!(p.mem.live.get(), 0);
}

#[test]
fn bus_past_the_ecam_range_fails() {
    let mut p = platform("range");
    p.config.bus = 0x10;

    assert!(matches!(
        discover(&p.mem, &p.config),
        Err(DoeError::BusOutOfRange {
            bus: 0x10,
            end_bus: 0x10
        })
    ));
}

#[test]
fn send_lands_in_the_mailbox_registers() {
    let p = platform("send");
    let loc = discover(&p.mem, &p.config).unwrap();
    let mut doe = DoeTransport::new(loc.registers, TransportConfig::default());

    doe.send_message(&[0x01, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x2a, 0, 0, 0])
        .unwrap();

    // The last dword written stays visible in plain memory
    assert_eq!(p.mem.read(p.doe + 0x10), 0x2a);
    assert_eq!(p.mem.read(p.doe + 0x8), DoeControl::GO.bits());
}

#[test]
fn status_error_and_timeout_end_receive() {
    let p = platform("receive");
    let loc = discover(&p.mem, &p.config).unwrap();
    let mut doe = DoeTransport::new(
        loc.registers,
        TransportConfig {
            timeout: Some(Duration::from_millis(10)),
            max_response_len: None,
        },
    );

    assert!(matches!(doe.receive_message(), Err(DoeError::Timeout)));

    p.mem.write(p.doe + 0xc, DoeStatus::ERROR.bits());
    assert!(matches!(doe.receive_message(), Err(DoeError::DeviceError)));
}

#[test]
fn oversized_response_is_acked_and_rejected() {
    let p = platform("oversize");
    let loc = discover(&p.mem, &p.config).unwrap();

    // Status is plain memory, so DOR never drops by itself. A one dword
    // limit turns the second read into an error instead of spinning forever.
    p.mem.write(p.doe + 0xc, DoeStatus::DATA_OBJECT_READY.bits());
    p.mem.write(p.doe + 0x14, 0xcafe_f00d);
    let mut doe = DoeTransport::new(
        &loc.registers,
        TransportConfig {
            timeout: None,
            max_response_len: Some(4),
        },
    );

    assert!(matches!(
        doe.receive_message(),
        Err(DoeError::ResponseTooLarge { limit: 4 })
    ));
    // Each read was acknowledged by writing the read mailbox
    assert_eq!(p.mem.read(p.doe + 0x14), 0);
}

#[test]
fn unaligned_message_is_rejected() {
    let p = platform("unaligned");
    let loc = discover(&p.mem, &p.config).unwrap();
    let mut doe = DoeTransport::new(&loc.registers, TransportConfig::default());

    assert!(matches!(
        doe.send_message(&[1, 2, 3]),
        Err(DoeError::AlignmentError { len: 3 })
    ));
    assert_eq!(p.mem.read(p.doe + 0x8), 0);
    assert_eq!(p.mem.read(p.doe + 0x10), 0);
}
