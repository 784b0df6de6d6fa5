// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! Errors returned while discovering a DOE mailbox or exchanging data
//! objects with it.

use nix::errno::Errno;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DoeError {
    /// None of the MCFG table paths could be opened.
    #[error("ACPI MCFG table not available (tried {tried:?})")]
    TableUnavailable { tried: Vec<PathBuf> },
    /// The MCFG table was opened but the record could not be read in full.
    #[error("failed to read ACPI MCFG table {path:?}: {source}")]
    TableReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The requested bus is not covered by the ECAM allocation.
    #[error("bus {bus} is out of range (MCFG end bus {end_bus})")]
    BusOutOfRange { bus: u8, end_bus: u8 },

    /// The physical memory device could not be opened.
    #[error("unable to open {path:?}: {errno}")]
    MapUnavailable { path: PathBuf, errno: Errno },
    /// `mmap()` of a physical window failed.
    #[error("failed to map {length:#x} bytes at physical address {base:#x}: {errno}")]
    MapFailed {
        base: u64,
        length: usize,
        errno: Errno,
    },

    /// No function on the bus carries the requested vendor id.
    #[error("no device with vendor id {vendor_id:#06x} on bus {bus}")]
    DeviceNotFound { bus: u8, vendor_id: u16 },
    /// The extended capability list has no DOE entry.
    #[error("DOE extended capability not found")]
    CapabilityNotFound,
    /// A user supplied register offset does not fit in extended config space.
    #[error("DOE register offset {offset:#x} is outside the extended configuration space")]
    RegisterOffsetOutOfRange { offset: u16 },

    /// DOE transfers are made of whole dwords.
    #[error("message length {len} is not a multiple of 4")]
    AlignmentError { len: usize },
    /// The device set the DOE Status Error bit.
    #[error("device asserted DOE status error")]
    DeviceError,
    /// The caller supplied deadline expired while polling DOE status.
    #[error("timed out waiting for the DOE data object ready bit")]
    Timeout,
    /// The device kept data object ready asserted past the response limit.
    #[error("response exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },
    /// A response data object didn't have the expected layout.
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },

    #[error("failed to send message: {0}")]
    SendFailed(#[source] std::io::Error),
    #[error("failed to receive message: {0}")]
    ReceiveFailed(#[source] std::io::Error),
}

impl DoeError {
    /// Returns true for the "search exhausted" outcomes, where the device or
    /// capability simply isn't there. The caller may fall back to a different
    /// transport for these.
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            DoeError::DeviceNotFound { .. } | DoeError::CapabilityNotFound
        )
    }
}

pub type Result<T> = std::result::Result<T, DoeError>;
