// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (C) 2022, Western Digital Corporation or its affiliates.

//! Contains helper functions used in parsing the CLI arguments

use std::num::ParseIntError;

/// Splits off a `0x` prefix, returning the digits and their radix.
fn radix_of(id: &str) -> (&str, u32) {
    let id = id.trim();
    match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (id, 10),
    }
}

fn parse_number<T>(
    id: &str,
    id_type: &str,
    from_str_radix: fn(&str, u32) -> Result<T, ParseIntError>,
) -> Result<T, String> {
    let (digits, base) = radix_of(id);
    from_str_radix(digits, base).map_err(|e| {
        error!("Invalid {id_type}: {id} - err {e:?}");
        format!("invalid {id_type} {id:?}: {e}")
    })
}

/// # Summary
///
/// Parses a 16-bit value such as a PCIe Vendor ID or a register offset.
///
/// # Parameter
///
/// * `id`: specified as a hex string "0xCAF3" or as base 10 "1234".
pub fn parse_u16(id: &str) -> Result<u16, String> {
    parse_number(id, "16-bit value", u16::from_str_radix)
}

/// Parses a bus number, as hex ("0x3a") or base 10 ("58").
pub fn parse_u8(id: &str) -> Result<u8, String> {
    parse_number(id, "8-bit value", u8::from_str_radix)
}

/// Parses a length, as hex ("0x1000") or base 10 ("4096").
pub fn parse_usize(id: &str) -> Result<usize, String> {
    parse_number(id, "length", usize::from_str_radix)
}

/// # Summary
///
/// Parses a message given as hex bytes on the command line.
///
/// # Parameter
///
/// * `hex`: the bytes in transmission order, for example
///   "01000000 03000000 00000000". Whitespace, `:` and `,` between bytes
///   are ignored and an optional leading `0x` is accepted.
///
/// # Returns
///
/// The message bytes, or a description of what couldn't be parsed.
pub fn parse_hex_payload(hex: &str) -> Result<Vec<u8>, String> {
    let hex = hex.trim();
    let hex = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);
    let digits: Vec<u8> = hex
        .bytes()
        .filter(|c| !c.is_ascii_whitespace() && *c != b':' && *c != b',')
        .collect();

    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits ({})", digits.len()));
    }

    digits
        .chunks_exact(2)
        .map(|pair| {
            let byte = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            u8::from_str_radix(byte, 16).map_err(|e| format!("invalid hex byte {byte:?}: {e}"))
        })
        .collect()
}

/// Formats a message as space separated little endian dwords, the way the
/// mailbox registers see it.
pub fn format_dwords(data: &[u8]) -> String {
    data.chunks(4)
        .map(|c| {
            let mut word = [0u8; 4];
            word[..c.len()].copy_from_slice(c);
            format!("{:08x}", u32::from_le_bytes(word))
        })
        .collect::<Vec<_>>()
        .join(" ")
}
