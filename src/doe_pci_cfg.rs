// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! This file provides support for accessing a PCIe DOE device using the
//! DOE mailbox exposed over a PCIe extended configuration space.
//!
//! This is generally run on the Linux host machine to communicate
//! with a DOE device.
//!
//! SAFETY: The register block is device memory mapped through `/dev/mem`.
//! All accesses go through `read_volatile`/`write_volatile` so the compiler
//! can neither drop, merge nor reorder them.

use crate::error::{DoeError, Result};
use crate::pcap::PacketSink;
use crate::transport::DeviceIo;
use bitflags::bitflags;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

/// Bytes covered by the DOE extended capability registers.
pub const DOE_REGISTER_BLOCK_LEN: usize = 0x18;

/// Registers of the DOE extended capability, by offset from its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DoeRegister {
    ExtCapHeader = 0x00,
    Capabilities = 0x04,
    Control = 0x08,
    Status = 0x0c,
    WriteMailbox = 0x10,
    ReadMailbox = 0x14,
}

impl DoeRegister {
    pub fn offset(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// DOE Control register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DoeControl: u32 {
        const ABORT = 1 << 0;
        const INT_ENABLE = 1 << 1;
        const GO = 1 << 31;
    }

    /// DOE Status register
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DoeStatus: u32 {
        const BUSY = 1 << 0;
        const INT_STATUS = 1 << 1;
        const ERROR = 1 << 2;
        const DATA_OBJECT_READY = 1 << 31;
    }
}

/// 32-bit access to a DOE register block.
///
/// The provided methods are the named operations the mailbox protocol is
/// written in terms of.
pub trait DoeRegisters {
    fn read(&self, reg: DoeRegister) -> u32;
    fn write(&self, reg: DoeRegister, value: u32);

    fn status(&self) -> DoeStatus {
        DoeStatus::from_bits_retain(self.read(DoeRegister::Status))
    }

    fn control(&self) -> DoeControl {
        DoeControl::from_bits_retain(self.read(DoeRegister::Control))
    }

    /// Read-modify-write of the control register, setting `bits`.
    fn set_control(&self, bits: DoeControl) {
        let control = self.control() | bits;
        self.write(DoeRegister::Control, control.bits());
    }

    fn set_go(&self) {
        self.set_control(DoeControl::GO)
    }

    fn is_busy(&self) -> bool {
        self.status().contains(DoeStatus::BUSY)
    }

    fn is_error(&self) -> bool {
        self.status().contains(DoeStatus::ERROR)
    }

    fn is_data_ready(&self) -> bool {
        self.status().contains(DoeStatus::DATA_OBJECT_READY)
    }

    fn write_mailbox(&self, data: u32) {
        self.write(DoeRegister::WriteMailbox, data)
    }

    fn read_mailbox(&self) -> u32 {
        self.read(DoeRegister::ReadMailbox)
    }

    /// Pops the current read mailbox dword. Any value works, the write
    /// itself is the acknowledgement.
    fn ack_read_mailbox(&self) {
        self.write(DoeRegister::ReadMailbox, 0)
    }

    /// Version field of the DOE extended capability header.
    fn capability_version(&self) -> u8 {
        ((self.read(DoeRegister::ExtCapHeader) >> 16) & 0xf) as u8
    }
}

/// The memory mapped DOE registers of a device.
///
/// This doesn't own the mapping, which stays in place until the process
/// exits.
#[derive(Debug)]
pub struct DoeRegisterBlock {
    base: NonNull<u32>,
}

impl DoeRegisterBlock {
    /// # Safety
    ///
    /// `base` must be dword aligned and point at `DOE_REGISTER_BLOCK_LEN`
    /// bytes of mapped memory that stay mapped for the lifetime of the
    /// returned value.
    pub unsafe fn new(base: NonNull<u8>) -> Self {
        DoeRegisterBlock { base: base.cast() }
    }

    /// Virtual address of the extended capability header.
    pub fn address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    fn reg(&self, reg: DoeRegister) -> *mut u32 {
        // SAFETY: Every register offset is inside the block, see `new()`.
        unsafe { self.base.as_ptr().add(reg.offset() / 4) }
    }
}

impl DoeRegisters for DoeRegisterBlock {
    fn read(&self, reg: DoeRegister) -> u32 {
        // SAFETY: See `new()`.
        unsafe { self.reg(reg).read_volatile() }
    }

    fn write(&self, reg: DoeRegister, value: u32) {
        // SAFETY: See `new()`.
        unsafe { self.reg(reg).write_volatile(value) }
    }
}

/// Tunables for [`DoeTransport`]. The defaults poll forever and accept a
/// response of any length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportConfig {
    /// Give up waiting for data object ready after this long.
    pub timeout: Option<Duration>,
    /// Fail a response that grows beyond this many bytes.
    pub max_response_len: Option<usize>,
}

/// The DOE mailbox protocol over a register block.
pub struct DoeTransport<R: DoeRegisters> {
    regs: R,
    config: TransportConfig,
    capture: Option<Box<dyn PacketSink>>,
}

impl<R: DoeRegisters> DoeTransport<R> {
    pub fn new(regs: R, config: TransportConfig) -> Self {
        DoeTransport {
            regs,
            config,
            capture: None,
        }
    }

    /// Mirrors every message sent and received to `sink`.
    pub fn with_capture(mut self, sink: Box<dyn PacketSink>) -> Self {
        self.capture = Some(sink);
        self
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    fn capture(&mut self, data: &[u8]) {
        if let Some(sink) = self.capture.as_mut() {
            if let Err(e) = sink.append(data) {
                warn!("Failed to capture packet: {e}");
            }
        }
    }

    /// # Summary
    ///
    /// Sends message using the PCIe DOE extended capability by writing the
    /// `message` data to the targets write data mailbox, one dword at a time,
    /// and then setting the DOE Go bit.
    ///
    /// # Parameter
    ///
    /// * `message`: The data to send, a whole number of dwords
    ///
    /// # Returns
    ///
    /// Ok(()) on success
    ///
    /// Err(AlignmentError) if `message` isn't dword aligned, nothing is
    /// written to the device in that case.
    pub fn send(&mut self, message: &[u8]) -> Result<()> {
        // CMA requires 32-bit alignment
        if message.len() % 4 != 0 {
            error!("DOE message of {} bytes is not dword aligned", message.len());
            return Err(DoeError::AlignmentError { len: message.len() });
        }

        debug!("send-doe ({} bytes)...", message.len());
        for (i, chunk) in message.chunks_exact(4).enumerate() {
            let data = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.regs.write_mailbox(data);
            trace!("\t -> 0x{:08X} : {data:08X}", i * 4);
        }

        // Set the DOE Go bit to indicate we are all done
        self.regs.set_go();
        debug!("send-doe ... done");

        self.capture(message);
        Ok(())
    }

    /// # Summary
    ///
    /// Receives a message using the PCIe DOE extended capability by polling
    /// the targets DOE Data Object Ready (DOR) bit until it is set, then
    /// reading the read data mailbox until the device clears DOR. Every dword
    /// read is popped by writing back to the read data mailbox, as per the
    /// DOE specification.
    ///
    /// # Returns
    ///
    /// The received message, always a whole number of dwords.
    ///
    /// Err(DeviceError) if the device sets the DOE Status Error bit before
    /// any data is ready. Err(Timeout) or Err(ResponseTooLarge) if limits
    /// were configured and exceeded. Nothing received so far is returned on
    /// failure.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        self.wait_data_object_ready()?;

        debug!("recv-doe ...");
        let mut message = Vec::new();
        loop {
            let data = self.regs.read_mailbox();
            trace!("\t <- 0x{:08X} : {data:08X}", message.len());
            message.extend_from_slice(&data.to_le_bytes());
            self.regs.ack_read_mailbox();

            if let Some(limit) = self.config.max_response_len {
                if message.len() > limit {
                    error!("DOE response exceeds {limit} bytes, discarding");
                    return Err(DoeError::ResponseTooLarge { limit });
                }
            }

            if !self.regs.is_data_ready() {
                break;
            }
        }
        debug!("recv-doe ... ({} bytes) done", message.len());

        self.capture(&message);
        Ok(message)
    }

    /// Spins until DOR or Error is set, or the configured timeout passes.
    fn wait_data_object_ready(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            let status = self.regs.status();
            if status.contains(DoeStatus::DATA_OBJECT_READY) {
                return Ok(());
            }
            if status.contains(DoeStatus::ERROR) {
                error!("Device DOE status error");
                return Err(DoeError::DeviceError);
            }
            if let Some(timeout) = self.config.timeout {
                if start.elapsed() >= timeout {
                    error!("No DOE response after {timeout:?}");
                    return Err(DoeError::Timeout);
                }
            }
            std::hint::spin_loop();
        }
    }

    /// # Summary
    ///
    /// Issues a DOE Abort, discarding whatever the device has queued.
    ///
    /// # Parameter
    ///
    /// * `block_on_status_err`: block until DOE Status Error has cleared
    pub fn abort(&mut self, block_on_status_err: bool) {
        warn!("Issuing DOE Control abort");
        self.regs.set_control(DoeControl::ABORT);

        if block_on_status_err {
            debug!("Waiting for DOE status error to clear");
            while self.regs.is_error() {
                std::hint::spin_loop();
            }
            debug!("DOE Status error Cleared");
        }
    }
}

impl<R: DoeRegisters> DeviceIo for DoeTransport<R> {
    fn send_message(&mut self, message: &[u8]) -> Result<()> {
        self.send(message)
    }

    fn receive_message(&mut self) -> Result<Vec<u8>> {
        self.receive()
    }
}

impl<R: DoeRegisters + ?Sized> DoeRegisters for &R {
    fn read(&self, reg: DoeRegister) -> u32 {
        (**self).read(reg)
    }

    fn write(&self, reg: DoeRegister, value: u32) {
        (**self).write(reg, value)
    }
}
