// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! The device IO interface the SPDM requester runs on top of.

use crate::error::Result;

/// A byte in, byte out message transport.
///
/// Implementations don't look inside the messages. Access must be
/// serialised by the caller, there is only one request in flight.
pub trait DeviceIo {
    /// Sends one complete request message.
    fn send_message(&mut self, message: &[u8]) -> Result<()>;

    /// Blocks until one complete response message has been received.
    fn receive_message(&mut self) -> Result<Vec<u8>>;

    /// Sends `request` and waits for its response.
    fn send_receive(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.send_message(request)?;
        self.receive_message()
    }
}

impl<T: DeviceIo + ?Sized> DeviceIo for Box<T> {
    fn send_message(&mut self, message: &[u8]) -> Result<()> {
        (**self).send_message(message)
    }

    fn receive_message(&mut self) -> Result<Vec<u8>> {
        (**self).receive_message()
    }
}
