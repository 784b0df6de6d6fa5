// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! Packet capture of the messages passed over a transport, in the classic
//! libpcap file format so that they can be opened with Wireshark or
//! `spdm_dump`.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
/// The largest DOE data object is 2^18 dwords.
pub const PCAP_SNAPLEN: u32 = 0x0010_0000;

pub const LINKTYPE_MCTP: u32 = 291;
pub const LINKTYPE_PCI_DOE: u32 = 292;

/// Receives a copy of every message a transport sends or receives.
pub trait PacketSink {
    fn append(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Writes messages to a pcap stream, one record per message.
pub struct PcapWriter<W: Write> {
    writer: W,
}

impl PcapWriter<BufWriter<File>> {
    /// Creates (or truncates) `path` and writes the pcap file header.
    pub fn create<P: AsRef<Path>>(path: P, link_type: u32) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        info!("Writing packet capture to {:?}", path.as_ref());
        PcapWriter::new(BufWriter::new(file), link_type)
    }
}

impl<W: Write> PcapWriter<W> {
    pub fn new(mut writer: W, link_type: u32) -> io::Result<Self> {
        writer.write_all(&PCAP_MAGIC.to_le_bytes())?;
        writer.write_all(&PCAP_VERSION_MAJOR.to_le_bytes())?;
        writer.write_all(&PCAP_VERSION_MINOR.to_le_bytes())?;
        // thiszone and sigfigs
        writer.write_all(&0i32.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(&PCAP_SNAPLEN.to_le_bytes())?;
        writer.write_all(&link_type.to_le_bytes())?;
        writer.flush()?;

        Ok(PcapWriter { writer })
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> PacketSink for PcapWriter<W> {
    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let orig_len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        let incl_len = orig_len.min(PCAP_SNAPLEN);

        self.writer
            .write_all(&(now.as_secs() as u32).to_le_bytes())?;
        self.writer.write_all(&now.subsec_micros().to_le_bytes())?;
        self.writer.write_all(&incl_len.to_le_bytes())?;
        self.writer.write_all(&orig_len.to_le_bytes())?;
        self.writer.write_all(&data[..incl_len as usize])?;
        // Keep the capture usable if we die mid-session
        self.writer.flush()
    }
}
