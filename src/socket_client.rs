// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! This file provides a socket backend for when there is no DOE hardware.
//! It connects over TCP to an emulated responder (such as the DMTF
//! `spdm_responder_emu`, or QEMU) using the emulator platform framing:
//!
//! ```text
//! | command (BE u32) | transport type (BE u32) | size (BE u32) | data ... |
//! ```

use crate::error::{DoeError, Result};
use crate::transport::DeviceIo;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

pub const SOCKET_SPDM_COMMAND_NORMAL: u32 = 0x0001;
pub const SOCKET_SPDM_COMMAND_STOP: u32 = 0xFFFE;

pub const SOCKET_TRANSPORT_TYPE_PCI_DOE: u32 = 0x02;

pub const DEFAULT_SOCKET_PORT: u16 = 2323;

/// Largest message we accept from the peer, the DOE data object limit.
const MAX_SOCKET_MESSAGE_LEN: usize = 0x0010_0000;

/// # Summary
///
/// Completes a responder address given on the command line, adding
/// `DEFAULT_SOCKET_PORT` when no port was given.
///
/// # Parameter
///
/// * `addr`: `HOST`, `HOST:PORT`, an IP address or a socket address
pub fn with_default_port(addr: &str) -> String {
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return SocketAddr::new(ip, DEFAULT_SOCKET_PORT).to_string();
    }
    match addr.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => addr.to_string(),
        _ => format!("{addr}:{DEFAULT_SOCKET_PORT}"),
    }
}

pub struct SocketTransport<S: Read + Write = TcpStream> {
    stream: S,
    transport_type: u32,
}

impl SocketTransport<TcpStream> {
    /// # Summary
    ///
    /// Connects to the responder at `addr`.
    ///
    /// # Parameter
    ///
    /// * `addr`: Responder address, for example `localhost:2323`
    /// * `timeout`: Read/write timeout, `None` blocks forever
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Option<Duration>) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).map_err(|e| {
            error!("Server is not running: {e}");
            e
        })?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        stream.set_nodelay(true)?;
        info!("Connected to server {:?}", stream.peer_addr()?);

        Ok(SocketTransport::new(stream, SOCKET_TRANSPORT_TYPE_PCI_DOE))
    }
}

impl<S: Read + Write> SocketTransport<S> {
    pub fn new(stream: S, transport_type: u32) -> Self {
        SocketTransport {
            stream,
            transport_type,
        }
    }

    fn send_platform_data(&mut self, command: u32, data: &[u8]) -> io::Result<()> {
        let size = u32::try_from(data.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;

        let mut buf = Vec::with_capacity(12 + data.len());
        buf.extend_from_slice(&command.to_be_bytes());
        buf.extend_from_slice(&self.transport_type.to_be_bytes());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(data);

        self.stream.write_all(&buf)?;
        self.stream.flush()
    }

    fn receive_platform_data(&mut self) -> io::Result<(u32, Vec<u8>)> {
        let mut word = [0u8; 4];

        self.stream.read_exact(&mut word)?;
        let command = u32::from_be_bytes(word);
        self.stream.read_exact(&mut word)?;
        let transport_type = u32::from_be_bytes(word);
        self.stream.read_exact(&mut word)?;
        let size = u32::from_be_bytes(word) as usize;

        if transport_type != self.transport_type {
            warn!(
                "Peer uses transport type {transport_type}, expected {}",
                self.transport_type
            );
        }
        if size > MAX_SOCKET_MESSAGE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message of {size} bytes is too large"),
            ));
        }

        let mut data = vec![0u8; size];
        self.stream.read_exact(&mut data)?;
        Ok((command, data))
    }

    /// Asks the responder to stop and waits for it to acknowledge.
    pub fn shutdown(&mut self) -> Result<()> {
        self.send_platform_data(SOCKET_SPDM_COMMAND_STOP, &[])
            .map_err(DoeError::SendFailed)?;
        let (command, _) = self
            .receive_platform_data()
            .map_err(DoeError::ReceiveFailed)?;
        if command != SOCKET_SPDM_COMMAND_STOP {
            warn!("Unexpected reply {command:#x} to stop command");
        }
        Ok(())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> DeviceIo for SocketTransport<S> {
    fn send_message(&mut self, message: &[u8]) -> Result<()> {
        debug!("send-socket ({} bytes)", message.len());
        self.send_platform_data(SOCKET_SPDM_COMMAND_NORMAL, message)
            .map_err(|e| {
                error!("send_platform_data Error - {e}");
                DoeError::SendFailed(e)
            })
    }

    fn receive_message(&mut self) -> Result<Vec<u8>> {
        let (command, data) = self.receive_platform_data().map_err(|e| {
            error!("receive_platform_data Error - {e}");
            DoeError::ReceiveFailed(e)
        })?;
        if command != SOCKET_SPDM_COMMAND_NORMAL {
            warn!("Received platform command {command:#x}");
        }
        debug!("recv-socket ({} bytes)", data.len());
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;

    /// An in-memory stream, reads come from `input` and writes go to `output`.
    struct Pipe {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(command: u32, transport: u32, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&command.to_be_bytes());
        buf.extend_from_slice(&transport.to_be_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(data);
        buf
    }

    fn pipe(input: Vec<u8>) -> SocketTransport<Pipe> {
        SocketTransport::new(
            Pipe {
                input: Cursor::new(input),
                output: Vec::new(),
            },
            SOCKET_TRANSPORT_TYPE_PCI_DOE,
        )
    }

    #[test]
    fn send_frames_message() {
        let mut sock = pipe(Vec::new());
        sock.send_message(&[1, 2, 3, 4]).unwrap();
        assert_eq!(
            sock.into_inner().output,
            frame(SOCKET_SPDM_COMMAND_NORMAL, 2, &[1, 2, 3, 4])
        );
    }

    #[test]
    fn receive_strips_framing() {
        let mut sock = pipe(frame(SOCKET_SPDM_COMMAND_NORMAL, 2, &[9; 12]));
        assert_eq!(sock.receive_message().unwrap(), vec![9; 12]);
    }

    #[test]
    fn truncated_receive_fails() {
        let mut input = frame(SOCKET_SPDM_COMMAND_NORMAL, 2, &[9; 12]);
        input.truncate(18);
        let mut sock = pipe(input);
        assert!(matches!(
            sock.receive_message(),
            Err(DoeError::ReceiveFailed(_))
        ));
    }

    #[test]
    fn oversized_receive_fails() {
        let mut input = frame(SOCKET_SPDM_COMMAND_NORMAL, 2, &[]);
        input[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        let mut sock = pipe(input);
        match sock.receive_message() {
            Err(DoeError::ReceiveFailed(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidData),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn shutdown_sends_stop() {
        let mut sock = pipe(frame(SOCKET_SPDM_COMMAND_STOP, 2, &[]));
        sock.shutdown().unwrap();
        assert_eq!(
            sock.into_inner().output,
            frame(SOCKET_SPDM_COMMAND_STOP, 2, &[])
        );
    }

    #[test]
    fn port_defaults_when_missing() {
        assert_eq!(with_default_port("localhost"), "localhost:2323");
        assert_eq!(with_default_port("localhost:4000"), "localhost:4000");
        assert_eq!(with_default_port("10.0.0.2"), "10.0.0.2:2323");
        assert_eq!(with_default_port("::1"), "[::1]:2323");
        assert_eq!(with_default_port("[::1]:4000"), "[::1]:4000");
    }

    #[test]
    fn echo_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut responder = SocketTransport::new(stream, SOCKET_TRANSPORT_TYPE_PCI_DOE);
            let request = responder.receive_message().unwrap();
            responder.send_message(&request).unwrap();
        });

        let mut client = SocketTransport::connect(addr, Some(Duration::from_secs(5))).unwrap();
        let response = client.send_receive(&[0xa5; 16]).unwrap();
        assert_eq!(response, vec![0xa5; 16]);
        server.join().unwrap();
    }
}
