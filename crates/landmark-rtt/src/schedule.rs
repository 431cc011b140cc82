// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Probe ordering.
//!
//! Landmarks are visited in a random order so the run neither hammers
//! hosts in a predictable sequence nor looks like a sequential port scan.
//! Repeated probes of one host are kept back to back, so every sample of
//! that host is taken under comparable network conditions.

use std::collections::HashSet;
use std::net::SocketAddrV4;

/// Build the work list: distinct addresses, shuffled once, each repeated
/// `repeat_count` times in a contiguous run.
///
/// The result has `distinct * repeat_count` entries. Pass
/// `fastrand::Rng::new()` in production and a seeded generator in tests.
#[must_use]
pub fn choose_probe_order(
    addresses: &[SocketAddrV4],
    repeat_count: usize,
    rng: &mut fastrand::Rng,
) -> Vec<SocketAddrV4> {
    let mut seen = HashSet::with_capacity(addresses.len());
    let mut distinct: Vec<SocketAddrV4> = addresses
        .iter()
        .copied()
        .filter(|addr| seen.insert(*addr))
        .collect();

    rng.shuffle(&mut distinct);

    let order: Vec<SocketAddrV4> = distinct
        .iter()
        .flat_map(|addr| std::iter::repeat(*addr).take(repeat_count))
        .collect();

    tracing::debug!(
        "probe order: {} distinct targets x {} = {} connections",
        distinct.len(),
        repeat_count,
        order.len()
    );
    order
}

/// Number of distinct IPv4 hosts in a work list (ports ignored).
#[must_use]
pub fn distinct_hosts(work: &[SocketAddrV4]) -> usize {
    work.iter().map(SocketAddrV4::ip).collect::<HashSet<_>>().len()
}
