// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared work buffer exchanged with the probe-core helper.
//!
//! The controller encodes a batch of connection requests into an anonymous
//! shared memory segment, hands the segment's descriptor to probe-core as its
//! stdin, and reads the results back once the child has exited.
//!
//! # Architecture
//!
//! ```text
//! +--------------------+               +--------------------+
//! |  landmark-rtt      |    Shared     |  probe-core        |
//! |                    |    Memory     |                    |
//! |  encode() ---------+---> Header +--+--> connect()...    |
//! |                    |   Records[]   |        |           |
//! |  decode() <--------+---------------+--- results,        |
//! |                    |               |    processed++     |
//! +--------------------+    (stdin)    +--------------------+
//! ```
//!
//! # Access Discipline
//!
//! No locks are involved. The controller writes requests only before a child
//! starts and reads results only after it has exited, so the two processes
//! never touch the region at the same time.
//!
//! probe-core is trusted to fill each record at most once and to skip records
//! it already completed when re-run against the same buffer. Nothing here
//! can verify that; a buffer is never re-encoded between runs, which is all
//! the controller can contribute.

mod errno;
mod layout;
mod segment;

pub use errno::{errno_name, ErrorCode};
pub use layout::{record_offset, region_size, ConnectionRecord, Header};
pub use segment::{Backing, ShmSegment, MAX_NAME_ATTEMPTS};

use byteorder::{ByteOrder, NativeEndian};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::OwnedFd;
use thiserror::Error;

/// Lower bound applied to the spacing and timeout handed to probe-core.
pub const MIN_INTERVAL_MICROS: u32 = 1000;

/// Errors raised by the shared work buffer.
#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shared memory allocation failed: {0}")]
    Allocation(#[source] io::Error),

    #[error("shared memory allocation failed: {attempts} random names all collided")]
    NameCollision { attempts: usize },

    /// `shm_open` is not usable on this host; triggers the temp-file fallback.
    #[error("POSIX shared memory not supported: {0}")]
    Unsupported(#[source] io::Error),

    #[error("memory mapping failed: {0}")]
    Mmap(#[source] io::Error),

    #[error("invalid segment name: {0}")]
    InvalidName(String),

    #[error("cannot duplicate buffer descriptor: {0}")]
    Descriptor(#[source] io::Error),

    #[error("work buffer already released")]
    Released,

    #[error("work list has {actual} items but the buffer holds {expected}")]
    CapacityMismatch { expected: usize, actual: usize },

    #[error("batch of {0} connections does not fit the 32-bit header")]
    TooManyRecords(usize),

    #[error("helper reported {processed} processed connections out of {total}")]
    ProgressOverflow { processed: u32, total: u32 },

    #[error("record index {index} out of range (total {total})")]
    RecordIndex { index: usize, total: usize },

    #[error("record {0} already holds a result")]
    RecordAlreadyWritten(usize),
}

impl ShmError {
    /// Whether this error means the region could not be obtained at all.
    #[must_use]
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            Self::Allocation(_)
                | Self::NameCollision { .. }
                | Self::Unsupported(_)
                | Self::Mmap(_)
                | Self::InvalidName(_)
                | Self::TooManyRecords(_)
        )
    }
}

/// Result type for shared buffer operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// One decoded connection result, in schedule order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub host: Ipv4Addr,
    pub port: u16,
    pub error: ErrorCode,
    /// Seconds.
    pub elapsed: f64,
}

impl ProbeResult {
    #[must_use]
    pub fn addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.host, self.port)
    }
}

/// Header plus `total` connection records in a shared segment.
#[derive(Debug)]
pub struct SharedWorkBuffer {
    segment: ShmSegment,
    total: usize,
}

impl SharedWorkBuffer {
    /// Allocate a zeroed buffer for `connections` records.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if the segment cannot be created.
    pub fn allocate(connections: usize) -> Result<Self> {
        if u32::try_from(connections).is_err() {
            return Err(ShmError::TooManyRecords(connections));
        }
        let segment = ShmSegment::create_anonymous(region_size(connections))?;
        tracing::debug!(
            "allocated work buffer: {} records, {} bytes, {:?}",
            connections,
            segment.size(),
            segment.backing()
        );
        Ok(Self {
            segment,
            total: connections,
        })
    }

    /// Wrap an already created segment. The segment must be zeroed and
    /// exactly [`region_size`]`(connections)` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::CapacityMismatch`] if the sizes disagree.
    pub fn from_segment(segment: ShmSegment, connections: usize) -> Result<Self> {
        if segment.size() != region_size(connections) {
            return Err(ShmError::CapacityMismatch {
                expected: region_size(connections),
                actual: segment.size(),
            });
        }
        Ok(Self {
            segment,
            total: connections,
        })
    }

    /// Write the header and one request record per work item.
    ///
    /// Host serials are assigned per distinct IPv4 address in first-seen
    /// order. Spacing and timeout are converted to microseconds and clamped
    /// to at least [`MIN_INTERVAL_MICROS`]. Encoding the same list again
    /// yields identical bytes.
    ///
    /// # Errors
    ///
    /// Fails if the buffer was released or `work` does not match its size.
    pub fn encode(&mut self, work: &[SocketAddrV4], spacing_ms: u32, timeout_ms: u32) -> Result<()> {
        if work.len() != self.total {
            return Err(ShmError::CapacityMismatch {
                expected: self.total,
                actual: work.len(),
            });
        }

        let mut serials: HashMap<Ipv4Addr, u32> = HashMap::new();
        let record_serials: Vec<u32> = work
            .iter()
            .map(|addr| {
                let next = serials.len() as u32;
                *serials.entry(*addr.ip()).or_insert(next)
            })
            .collect();

        let header = Header {
            distinct_host_count: serials.len() as u32,
            total_connection_count: self.total as u32,
            processed_count: 0,
            spacing_micros: to_micros(spacing_ms),
            timeout_micros: to_micros(timeout_ms),
            reserved: 0,
        };

        let buf = self.bytes_mut()?;
        header.write(buf);
        for (index, (addr, serial)) in work.iter().zip(record_serials).enumerate() {
            ConnectionRecord::request(serial, *addr.ip(), addr.port())
                .write(&mut buf[record_offset(index)..]);
        }

        tracing::debug!(
            "encoded {} connections to {} hosts (spacing {}us, timeout {}us)",
            header.total_connection_count,
            header.distinct_host_count,
            header.spacing_micros,
            header.timeout_micros
        );
        Ok(())
    }

    /// Whether the helper has processed every record.
    ///
    /// Reads only `processed_count`; records may be filled in any order.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::ProgressOverflow`] if the helper claims more
    /// processed records than exist.
    pub fn check_completion(&self) -> Result<bool> {
        let processed = self.processed()?;
        Ok(processed as usize == self.total)
    }

    /// Current `processed_count`, validated against the total.
    ///
    /// # Errors
    ///
    /// Fails after release or on a count above the total.
    pub fn processed(&self) -> Result<u32> {
        let processed = Header::read_processed(self.bytes()?);
        if processed as usize > self.total {
            return Err(ShmError::ProgressOverflow {
                processed,
                total: self.total as u32,
            });
        }
        Ok(processed)
    }

    /// Number of records, fixed at allocation.
    #[inline]
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// # Errors
    ///
    /// Fails after release.
    pub fn header(&self) -> Result<Header> {
        Ok(Header::read(self.bytes()?))
    }

    /// # Errors
    ///
    /// Fails after release or for an index past the end.
    pub fn record(&self, index: usize) -> Result<ConnectionRecord> {
        if index >= self.total {
            return Err(ShmError::RecordIndex {
                index,
                total: self.total,
            });
        }
        Ok(ConnectionRecord::read(&self.bytes()?[record_offset(index)..]))
    }

    /// Every record, in encode order. Unprocessed records come back with a
    /// zero error code and zero elapsed time.
    ///
    /// # Errors
    ///
    /// Fails after release.
    pub fn decode(&self) -> Result<Vec<ProbeResult>> {
        let buf = self.bytes()?;
        Ok((0..self.total)
            .map(|index| {
                let rec = ConnectionRecord::read(&buf[record_offset(index)..]);
                ProbeResult {
                    host: rec.addr,
                    port: rec.port,
                    error: ErrorCode::from_raw(rec.error_code),
                    elapsed: f64::from(rec.elapsed_micros) * 1e-6,
                }
            })
            .collect())
    }

    /// Duplicate of the segment descriptor, for use as a child's stdin.
    ///
    /// # Errors
    ///
    /// Fails after release or if `dup` fails.
    pub fn stdin_handle(&self) -> Result<OwnedFd> {
        self.segment.try_clone_fd()
    }

    /// Store a result into record `index`, as probe-core does.
    ///
    /// Used by in-process helpers. Does not touch `processed_count`.
    ///
    /// # Errors
    ///
    /// Fails for an out-of-range index or a record that already holds a
    /// non-zero result.
    pub fn record_result(&mut self, index: usize, error_code: u32, elapsed_micros: u32) -> Result<()> {
        let existing = self.record(index)?;
        if existing.error_code != 0 || existing.elapsed_micros != 0 {
            return Err(ShmError::RecordAlreadyWritten(index));
        }
        let rec = &mut self.bytes_mut()?[record_offset(index)..];
        NativeEndian::write_u32(&mut rec[ConnectionRecord::OFF_ERROR..], error_code);
        NativeEndian::write_u32(&mut rec[ConnectionRecord::OFF_ELAPSED..], elapsed_micros);
        Ok(())
    }

    /// Bump `processed_count` by `count`, as probe-core does.
    ///
    /// # Errors
    ///
    /// Fails if the new count would exceed the total.
    pub fn advance_processed(&mut self, count: u32) -> Result<u32> {
        let processed = self.processed()?;
        let next = processed.saturating_add(count);
        if next as usize > self.total {
            return Err(ShmError::ProgressOverflow {
                processed: next,
                total: self.total as u32,
            });
        }
        NativeEndian::write_u32(&mut self.bytes_mut()?[Header::OFF_PROCESSED..], next);
        Ok(next)
    }

    /// Unmap and close the segment. Idempotent; also runs on drop.
    pub fn release(&mut self) {
        self.segment.release();
    }

    #[inline]
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.segment.is_released()
    }

    fn bytes(&self) -> Result<&[u8]> {
        if self.segment.is_released() {
            return Err(ShmError::Released);
        }
        Ok(self.segment.as_slice())
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        if self.segment.is_released() {
            return Err(ShmError::Released);
        }
        Ok(self.segment.as_mut_slice())
    }

    #[cfg(test)]
    fn write_processed_raw(&mut self, value: u32) {
        NativeEndian::write_u32(
            &mut self.segment.as_mut_slice()[Header::OFF_PROCESSED..],
            value,
        );
    }
}

fn to_micros(ms: u32) -> u32 {
    ms.saturating_mul(1000).max(MIN_INTERVAL_MICROS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, a), port)
    }

    fn sample_work() -> Vec<SocketAddrV4> {
        vec![
            addr(7, 80),
            addr(7, 80),
            addr(3, 443),
            addr(3, 443),
            addr(9, 8080),
            addr(9, 8080),
        ]
    }

    #[test]
    fn test_encode_header() {
        let work = sample_work();
        let mut buf = SharedWorkBuffer::allocate(work.len()).expect("allocate");
        buf.encode(&work, 10, 1000).expect("encode");

        let header = buf.header().expect("header");
        assert_eq!(header.distinct_host_count, 3);
        assert_eq!(header.total_connection_count, 6);
        assert_eq!(header.processed_count, 0);
        assert_eq!(header.spacing_micros, 10_000);
        assert_eq!(header.timeout_micros, 1_000_000);
        assert_eq!(header.reserved, 0);
    }

    #[test]
    fn test_encode_clamps_intervals() {
        let work = vec![addr(1, 80)];
        let mut buf = SharedWorkBuffer::allocate(1).expect("allocate");
        buf.encode(&work, 0, 0).expect("encode");
        let header = buf.header().expect("header");
        assert_eq!(header.spacing_micros, MIN_INTERVAL_MICROS);
        assert_eq!(header.timeout_micros, MIN_INTERVAL_MICROS);
    }

    #[test]
    fn test_host_serials_first_seen() {
        let work = vec![addr(9, 80), addr(2, 80), addr(9, 443), addr(5, 80), addr(2, 22)];
        let mut buf = SharedWorkBuffer::allocate(work.len()).expect("allocate");
        buf.encode(&work, 10, 100).expect("encode");

        let serials: Vec<u32> = (0..work.len())
            .map(|i| buf.record(i).expect("record").host_serial)
            .collect();
        // Same IP on a different port is still the same host.
        assert_eq!(serials, vec![0, 1, 0, 2, 1]);
        assert_eq!(buf.header().expect("header").distinct_host_count, 3);
    }

    #[test]
    fn test_decode_preserves_order() {
        let work = sample_work();
        let mut buf = SharedWorkBuffer::allocate(work.len()).expect("allocate");
        buf.encode(&work, 10, 1000).expect("encode");

        let decoded: Vec<SocketAddrV4> = buf
            .decode()
            .expect("decode")
            .iter()
            .map(ProbeResult::addr)
            .collect();
        assert_eq!(decoded, work);
    }

    #[test]
    fn test_fresh_buffer_decodes_to_success_zero() {
        let work = sample_work();
        let mut buf = SharedWorkBuffer::allocate(work.len()).expect("allocate");
        buf.encode(&work, 10, 1000).expect("encode");

        for result in buf.decode().expect("decode") {
            assert_eq!(result.error, ErrorCode::Success);
            assert_eq!(result.elapsed, 0.0);
        }
    }

    #[test]
    fn test_encode_is_idempotent() {
        let work = sample_work();
        let mut buf = SharedWorkBuffer::allocate(work.len()).expect("allocate");
        buf.encode(&work, 25, 500).expect("encode");
        let first = buf.segment.as_slice().to_vec();
        buf.encode(&work, 25, 500).expect("encode again");
        assert_eq!(buf.segment.as_slice(), first.as_slice());
    }

    #[test]
    fn test_encode_length_mismatch() {
        let mut buf = SharedWorkBuffer::allocate(2).expect("allocate");
        let err = buf.encode(&[addr(1, 80)], 10, 100).unwrap_err();
        assert!(matches!(
            err,
            ShmError::CapacityMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_check_completion() {
        let work = sample_work();
        let mut buf = SharedWorkBuffer::allocate(work.len()).expect("allocate");
        buf.encode(&work, 10, 1000).expect("encode");

        assert!(!buf.check_completion().expect("check"));
        buf.advance_processed(5).expect("advance");
        assert!(!buf.check_completion().expect("check"));
        buf.advance_processed(1).expect("advance");
        assert!(buf.check_completion().expect("check"));
    }

    #[test]
    fn test_progress_overflow_detected() {
        let work = sample_work();
        let mut buf = SharedWorkBuffer::allocate(work.len()).expect("allocate");
        buf.encode(&work, 10, 1000).expect("encode");

        buf.write_processed_raw(7);
        assert!(matches!(
            buf.check_completion(),
            Err(ShmError::ProgressOverflow {
                processed: 7,
                total: 6
            })
        ));

        buf.write_processed_raw(6);
        assert!(matches!(
            buf.advance_processed(1),
            Err(ShmError::ProgressOverflow { .. })
        ));
    }

    #[test]
    fn test_record_result_decodes() {
        let work = vec![addr(1, 80), addr(2, 80)];
        let mut buf = SharedWorkBuffer::allocate(2).expect("allocate");
        buf.encode(&work, 10, 1000).expect("encode");

        buf.record_result(0, 0, 250_000).expect("write");
        buf.record_result(1, libc::ECONNREFUSED as u32, 1_500)
            .expect("write");

        let results = buf.decode().expect("decode");
        assert_eq!(results[0].error, ErrorCode::Success);
        assert!((results[0].elapsed - 0.25).abs() < 1e-9);
        assert_eq!(results[1].error, ErrorCode::Named("ECONNREFUSED"));
        assert!((results[1].elapsed - 0.0015).abs() < 1e-9);
        // Request fields are untouched by the result write.
        assert_eq!(results[1].addr(), work[1]);
    }

    #[test]
    fn test_record_result_write_once() {
        let mut buf = SharedWorkBuffer::allocate(1).expect("allocate");
        buf.encode(&[addr(1, 80)], 10, 1000).expect("encode");
        buf.record_result(0, 0, 10).expect("first write");
        assert!(matches!(
            buf.record_result(0, 0, 20),
            Err(ShmError::RecordAlreadyWritten(0))
        ));
        assert!(matches!(
            buf.record_result(1, 0, 20),
            Err(ShmError::RecordIndex { index: 1, total: 1 })
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut buf = SharedWorkBuffer::allocate(3).expect("allocate");
        buf.release();
        buf.release();
        assert!(buf.is_released());
        assert!(matches!(buf.decode(), Err(ShmError::Released)));
        assert!(matches!(buf.check_completion(), Err(ShmError::Released)));
        assert!(matches!(buf.stdin_handle(), Err(ShmError::Released)));
    }

    #[test]
    fn test_from_segment_size_check() {
        let seg = ShmSegment::create_tempfile(region_size(2)).expect("segment");
        assert!(SharedWorkBuffer::from_segment(seg, 3).is_err());

        let seg = ShmSegment::create_tempfile(region_size(2)).expect("segment");
        let buf = SharedWorkBuffer::from_segment(seg, 2).expect("wrap");
        assert_eq!(buf.total(), 2);
    }

    #[test]
    fn test_allocation_failure_classification() {
        assert!(ShmError::NameCollision { attempts: 16 }.is_allocation_failure());
        assert!(!ShmError::Released.is_allocation_failure());
    }
}
