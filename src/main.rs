// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! The starting point for DOE-Utils.
//!
//! For more details see the help information printed by the binary
//! (which is generated from here) or the README
//!

use clap::{Parser, Subcommand};
use doe_utils::discovery::{discover, DiscoveryConfig, DoeLocation};
use doe_utils::doe_discovery::{enumerate_protocols, DOE_VERSION};
use doe_utils::doe_pci_cfg::{DoeRegisters, DoeTransport, TransportConfig};
use doe_utils::mcfg::MCFG_TABLE_PATHS;
use doe_utils::pcap::{PcapWriter, LINKTYPE_PCI_DOE};
use doe_utils::phys_mem::{DevMem, DEV_MEM_PATH};
use doe_utils::socket_client::{with_default_port, SocketTransport};
use doe_utils::transport::DeviceIo;
use std::path::PathBuf;
use std::time::Duration;
#[macro_use]
extern crate log;
use env_logger::Env;

mod cli_helpers;

use cli_helpers::{format_dwords, parse_hex_payload, parse_u16, parse_u8, parse_usize};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// PCI bus to scan for the DOE device
    #[arg(long, default_value = "0", value_parser = parse_u8)]
    bus: u8,

    /// Offset of the DOE extended capability in configuration space.
    /// 0 searches the extended capability list.
    #[arg(long, default_value = "0", value_parser = parse_u16)]
    doe_offset: u16,

    /// PCIe Identifier, Vendor ID of the DOE capable device
    #[arg(long, default_value = "0x144D", value_parser = parse_u16)]
    pcie_vid: u16,

    /// ACPI MCFG table to read the ECAM base from, may be repeated.
    /// Defaults to the sysfs copies of the firmware table.
    #[arg(long)]
    mcfg: Vec<PathBuf>,

    /// Physical memory device used to map configuration space
    #[arg(long, default_value = DEV_MEM_PATH)]
    dev_mem: PathBuf,

    /// Give up waiting for a response after this many milliseconds.
    /// By default the mailbox is polled forever.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Fail responses larger than this many bytes
    #[arg(long, value_parser = parse_usize)]
    max_response_len: Option<usize>,

    /// Write every message sent and received to this pcap file
    #[arg(long)]
    pcap: Option<PathBuf>,

    /// Use the Socket Client backend, connecting to an emulated responder
    /// at HOST[:PORT] instead of the PCIe hardware. The port defaults to 2323.
    #[arg(long, conflicts_with_all = ["bus", "doe_offset", "pcie_vid", "mcfg", "dev_mem"])]
    socket: Option<String>,
}

#[derive(Subcommand, PartialEq, Debug)]
enum Commands {
    /// Locate the DOE mailbox and report where it is
    Discover,
    /// Send one data object and print the response
    Exchange {
        /// The data object as hex bytes, for example
        /// "01000000 03000000 00000000" (a DOE Discovery request)
        message: String,
    },
    /// List the data object protocols supported by the DOE instance
    DoeDiscovery,
}

/// # Summary
///
/// Initialises the logger.
/// The default is to print info and above. This can be changed by setting
/// the `LOG_LEVEL` environment variable.
fn init_logger() {
    let env = Env::default()
        .filter_or("LOG_LEVEL", "info")
        .write_style_or("LOG_STYLE", "always");

    env_logger::init_from_env(env);
}

impl Args {
    fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            timeout: self.timeout_ms.map(Duration::from_millis),
            max_response_len: self.max_response_len,
        }
    }

    fn discovery_config(&self) -> DiscoveryConfig {
        let mcfg_paths = if self.mcfg.is_empty() {
            MCFG_TABLE_PATHS.iter().map(PathBuf::from).collect()
        } else {
            self.mcfg.clone()
        };

        DiscoveryConfig {
            bus: self.bus,
            vendor_id: self.pcie_vid,
            register_offset: Some(self.doe_offset),
            mcfg_paths,
        }
    }
}

/// Locates the DOE mailbox, reporting whether one was found.
fn find_doe(mem: &DevMem, config: &DiscoveryConfig) -> Result<DoeLocation, ()> {
    match discover(mem, config) {
        Ok(location) => {
            info!("PCIe DOE found");
            Ok(location)
        }
        Err(e) if e.is_absent() => {
            error!("PCIe DOE not found: {e}");
            Err(())
        }
        Err(e) => {
            error!("PCIe DOE discovery failed: {e}");
            Err(())
        }
    }
}

/// # Summary
///
/// Runs a mailbox command over `io`.
///
/// # Parameter
///
/// * `command`: `Exchange` or `DoeDiscovery`
/// * `io`: The connected transport
/// * `version`: DOE Discovery version understood by the instance, if any
fn run_command<T: DeviceIo + ?Sized>(
    command: &Commands,
    io: &mut T,
    version: Option<u8>,
) -> Result<(), ()> {
    match command {
        Commands::Discover => {}
        Commands::Exchange { message } => {
            let request = parse_hex_payload(message)
                .map_err(|e| error!("Invalid request message: {e}"))?;
            info!("Sending {} byte data object", request.len());
            let response = io.send_receive(&request).map_err(|e| error!("{e}"))?;
            println!("{}", format_dwords(&response));
        }
        Commands::DoeDiscovery => {
            let protocols = enumerate_protocols(io, version).map_err(|e| error!("{e}"))?;
            for protocol in protocols {
                println!(
                    "vendor {:#06x} protocol {:#04x} ({})",
                    protocol.vendor_id,
                    protocol.protocol,
                    protocol.protocol_name()
                );
            }
        }
    }
    Ok(())
}

/// # Summary
///
/// Entry point to DOE-Utils.
///
/// Parses the CLI commands and connects to the selected backend, either the
/// PCIe DOE mailbox found through ECAM or an emulated responder over a
/// socket. Then runs the requested command on it.
fn main() -> Result<(), ()> {
    let cli = Args::parse();
    init_logger();

    let config = cli.transport_config();

    if let Some(addr) = &cli.socket {
        if cli.command == Commands::Discover {
            error!("discover needs the PCIe backend");
            return Err(());
        }
        if cli.pcap.is_some() {
            warn!("Packet capture is only supported by the PCIe backend");
        }

        let addr = with_default_port(addr);
        let mut sock = SocketTransport::connect(addr.as_str(), config.timeout)
            .map_err(|e| error!("Unable to connect to {addr}: {e}"))?;
        let res = run_command(&cli.command, &mut sock, Some(DOE_VERSION));
        if let Err(e) = sock.shutdown() {
            warn!("Failed to stop the responder: {e}");
        }
        return res;
    }

    let mem = DevMem::new(&cli.dev_mem);
    let location = find_doe(&mem, &cli.discovery_config())?;

    if cli.command == Commands::Discover {
        println!(
            "{} DOE capability at {:#x} (physical address {:#x}, version {})",
            location.device,
            location.register_offset,
            location.physical_address(),
            location.registers.capability_version()
        );
        return Ok(());
    }

    let mut doe = DoeTransport::new(location.registers, config);
    let version = (doe.registers().capability_version() >= DOE_VERSION).then_some(DOE_VERSION);
    if let Some(path) = &cli.pcap {
        let writer = PcapWriter::create(path, LINKTYPE_PCI_DOE)
            .map_err(|e| error!("Unable to create {path:?}: {e}"))?;
        doe = doe.with_capture(Box::new(writer));
    }

    run_command(&cli.command, &mut doe, version)
}
