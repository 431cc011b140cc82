// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed byte layout of the work batch shared with probe-core.
//!
//! # Memory Layout
//!
//! ```text
//! +-----------------------------------------------------------+
//! |                   Header (24 bytes)                        |
//! |  hosts (4) | total (4) | processed (4) | spacing_us (4)    |
//! |  timeout_us (4) | reserved (4)                             |
//! +-----------------------------------------------------------+
//! |                   ConnectionRecord[total] (20 bytes each)  |
//! |  serial (4) | addr (4) | port (2) | pad (2) | error (4)    |
//! |  elapsed_us (4)                                            |
//! +-----------------------------------------------------------+
//! ```
//!
//! # Byte Order
//!
//! Every integer is stored in host byte order, since probe-core is a native
//! process on the same machine that reads them as plain `uint32_t`. The two
//! exceptions are `addr`, stored as the four address octets, and `port`,
//! stored in network byte order because probe-core copies it straight into
//! a `sockaddr_in`.

use byteorder::{ByteOrder, NativeEndian, NetworkEndian};
use std::net::Ipv4Addr;

/// Batch header at offset 0 of the shared region.
///
/// | offset | size | field                  |
/// |--------|------|------------------------|
/// | 0      | 4    | distinct_host_count    |
/// | 4      | 4    | total_connection_count |
/// | 8      | 4    | processed_count        |
/// | 12     | 4    | spacing_micros         |
/// | 16     | 4    | timeout_micros         |
/// | 20     | 4    | reserved               |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub distinct_host_count: u32,
    pub total_connection_count: u32,
    /// Only probe-core advances this after the batch is encoded.
    pub processed_count: u32,
    pub spacing_micros: u32,
    pub timeout_micros: u32,
    pub reserved: u32,
}

impl Header {
    pub const SIZE: usize = 24;

    const OFF_HOSTS: usize = 0;
    const OFF_TOTAL: usize = 4;
    pub const OFF_PROCESSED: usize = 8;
    const OFF_SPACING: usize = 12;
    const OFF_TIMEOUT: usize = 16;
    const OFF_RESERVED: usize = 20;

    /// Write the header into the first [`Header::SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`Header::SIZE`].
    pub fn write(&self, buf: &mut [u8]) {
        let buf = &mut buf[..Self::SIZE];
        NativeEndian::write_u32(&mut buf[Self::OFF_HOSTS..], self.distinct_host_count);
        NativeEndian::write_u32(&mut buf[Self::OFF_TOTAL..], self.total_connection_count);
        NativeEndian::write_u32(&mut buf[Self::OFF_PROCESSED..], self.processed_count);
        NativeEndian::write_u32(&mut buf[Self::OFF_SPACING..], self.spacing_micros);
        NativeEndian::write_u32(&mut buf[Self::OFF_TIMEOUT..], self.timeout_micros);
        NativeEndian::write_u32(&mut buf[Self::OFF_RESERVED..], self.reserved);
    }

    /// Read a header from the first [`Header::SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`Header::SIZE`].
    #[must_use]
    pub fn read(buf: &[u8]) -> Self {
        let buf = &buf[..Self::SIZE];
        Self {
            distinct_host_count: NativeEndian::read_u32(&buf[Self::OFF_HOSTS..]),
            total_connection_count: NativeEndian::read_u32(&buf[Self::OFF_TOTAL..]),
            processed_count: NativeEndian::read_u32(&buf[Self::OFF_PROCESSED..]),
            spacing_micros: NativeEndian::read_u32(&buf[Self::OFF_SPACING..]),
            timeout_micros: NativeEndian::read_u32(&buf[Self::OFF_TIMEOUT..]),
            reserved: NativeEndian::read_u32(&buf[Self::OFF_RESERVED..]),
        }
    }

    /// Read just `processed_count`, without touching the other fields.
    #[inline]
    #[must_use]
    pub fn read_processed(buf: &[u8]) -> u32 {
        NativeEndian::read_u32(&buf[Self::OFF_PROCESSED..Self::OFF_PROCESSED + 4])
    }
}

/// One connection request and, once probe-core has run it, its result.
///
/// | offset | size | field          | order   |
/// |--------|------|----------------|---------|
/// | 0      | 4    | host_serial    | native  |
/// | 4      | 4    | addr           | octets  |
/// | 8      | 2    | port           | network |
/// | 10     | 2    | padding        | -       |
/// | 12     | 4    | error_code     | native  |
/// | 16     | 4    | elapsed_micros | native  |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Ascending per distinct host, in first-seen order.
    pub host_serial: u32,
    pub addr: Ipv4Addr,
    pub port: u16,
    /// errno-style code written by probe-core; 0 on success.
    pub error_code: u32,
    pub elapsed_micros: u32,
}

impl ConnectionRecord {
    pub const SIZE: usize = 20;

    const OFF_SERIAL: usize = 0;
    const OFF_ADDR: usize = 4;
    const OFF_PORT: usize = 8;
    const OFF_PAD: usize = 10;
    pub const OFF_ERROR: usize = 12;
    pub const OFF_ELAPSED: usize = 16;

    /// A not-yet-probed request for `addr:port`.
    #[must_use]
    pub fn request(host_serial: u32, addr: Ipv4Addr, port: u16) -> Self {
        Self {
            host_serial,
            addr,
            port,
            error_code: 0,
            elapsed_micros: 0,
        }
    }

    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`ConnectionRecord::SIZE`].
    pub fn write(&self, buf: &mut [u8]) {
        let buf = &mut buf[..Self::SIZE];
        NativeEndian::write_u32(&mut buf[Self::OFF_SERIAL..], self.host_serial);
        buf[Self::OFF_ADDR..Self::OFF_ADDR + 4].copy_from_slice(&self.addr.octets());
        NetworkEndian::write_u16(&mut buf[Self::OFF_PORT..], self.port);
        buf[Self::OFF_PAD..Self::OFF_PAD + 2].fill(0);
        NativeEndian::write_u32(&mut buf[Self::OFF_ERROR..], self.error_code);
        NativeEndian::write_u32(&mut buf[Self::OFF_ELAPSED..], self.elapsed_micros);
    }

    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`ConnectionRecord::SIZE`].
    #[must_use]
    pub fn read(buf: &[u8]) -> Self {
        let buf = &buf[..Self::SIZE];
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&buf[Self::OFF_ADDR..Self::OFF_ADDR + 4]);
        Self {
            host_serial: NativeEndian::read_u32(&buf[Self::OFF_SERIAL..]),
            addr: Ipv4Addr::from(octets),
            port: NetworkEndian::read_u16(&buf[Self::OFF_PORT..]),
            error_code: NativeEndian::read_u32(&buf[Self::OFF_ERROR..]),
            elapsed_micros: NativeEndian::read_u32(&buf[Self::OFF_ELAPSED..]),
        }
    }
}

/// Total size of a region holding `records` connection records.
#[inline]
#[must_use]
pub const fn region_size(records: usize) -> usize {
    Header::SIZE + records * ConnectionRecord::SIZE
}

/// Byte offset of record `index` within the region.
#[inline]
#[must_use]
pub const fn record_offset(index: usize) -> usize {
    Header::SIZE + index * ConnectionRecord::SIZE
}
