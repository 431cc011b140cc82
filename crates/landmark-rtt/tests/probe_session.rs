// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::float_cmp)] // Test assertions with constants
#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! End-to-end probe sessions against scripted helpers.
//!
//! The helpers fill the shared buffer in process, the way probe-core does
//! from the other side of the descriptor, so the runner's retry logic and
//! the decoded results can be checked without the native binary.

use landmark_rtt::limits::LimitError;
use landmark_rtt::shm::{record_offset, ConnectionRecord, Header};
use landmark_rtt::{
    choose_probe_order, resolve_parallelism, ErrorCode, FdLimits, Helper, HelperExit, Landmark,
    ProbeConfig, ProbeRunner, ProcessHelper, ResultDocument, ResultRecorder, RunSettings,
    RunState, RunSummary, SharedWorkBuffer, MAX_CYCLES,
};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Fake descriptor limit; records the soft limit it was given.
struct FakeLimits {
    hard: u64,
    soft: Option<u64>,
}

impl FakeLimits {
    fn new(hard: u64) -> Self {
        Self { hard, soft: None }
    }
}

impl FdLimits for FakeLimits {
    fn hard_limit(&self) -> Result<u64, LimitError> {
        Ok(self.hard)
    }

    fn set_soft_limit(&mut self, soft: u64) -> Result<(), LimitError> {
        self.soft = Some(soft);
        Ok(())
    }
}

/// Per cycle: how many records to complete, and how to exit.
struct ScriptedHelper {
    script: Vec<(usize, HelperExit)>,
    calls: u32,
}

impl ScriptedHelper {
    fn new(script: Vec<(usize, HelperExit)>) -> Self {
        Self { script, calls: 0 }
    }
}

impl Helper for ScriptedHelper {
    fn invoke(&mut self, buffer: &mut SharedWorkBuffer, cycle: u32) -> io::Result<HelperExit> {
        self.calls += 1;
        let (count, exit) = self
            .script
            .get(cycle as usize - 1)
            .copied()
            .unwrap_or((0, HelperExit::Failed(1)));

        // Resume where the previous cycle stopped.
        let done = buffer.processed().expect("processed") as usize;
        let end = (done + count).min(buffer.total());
        for index in done..end {
            let code = if index % 2 == 0 { 0 } else { libc::ETIMEDOUT as u32 };
            buffer
                .record_result(index, code, 1500 + index as u32)
                .expect("record");
        }
        buffer
            .advance_processed((end - done) as u32)
            .expect("advance");
        Ok(exit)
    }
}

fn landmarks() -> Vec<SocketAddrV4> {
    vec![
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 10), 80),
        SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 20), 443),
        SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 30), 8080),
    ]
}

fn settings(parallel: u32) -> RunSettings {
    RunSettings {
        spacing_ms: 10,
        timeout_ms: 1000,
        parallel,
        max_cycles: MAX_CYCLES,
    }
}

#[test]
fn test_three_hosts_two_probes_schedule() {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let work = choose_probe_order(&landmarks(), 2, &mut rng);

    assert_eq!(work.len(), 6);
    for pair in work.chunks(2) {
        assert_eq!(pair[0], pair[1]);
    }
    for addr in landmarks() {
        assert_eq!(work.iter().filter(|w| **w == addr).count(), 2);
    }
}

#[test]
fn test_recovers_after_two_failed_cycles() {
    let mut rng = fastrand::Rng::with_seed(7);
    let work = choose_probe_order(&landmarks(), 2, &mut rng);

    let helper = ScriptedHelper::new(vec![
        (2, HelperExit::Failed(2)),
        (2, HelperExit::Signaled(libc::SIGSEGV)),
        (2, HelperExit::Success),
    ]);
    let mut runner = ProbeRunner::new(helper, FakeLimits::new(1024), settings(0));
    let outcome = runner.run(&work).expect("run");

    assert_eq!(outcome.state, RunState::Complete);
    assert_eq!(outcome.retries(), 2);
    assert_eq!(outcome.cycles, 3);
    assert_eq!(outcome.helper_failures, 2);
    assert_eq!(
        outcome.transitions,
        vec![
            RunState::Init,
            RunState::Encoded,
            RunState::Running { cycle: 1 },
            RunState::Retry { cycle: 1 },
            RunState::Running { cycle: 2 },
            RunState::Retry { cycle: 2 },
            RunState::Running { cycle: 3 },
            RunState::Complete,
        ]
    );

    assert_eq!(outcome.results.len(), 6);
    for (result, addr) in outcome.results.iter().zip(&work) {
        assert_eq!(result.addr(), *addr);
        assert!(result.elapsed > 0.0);
    }
    assert_eq!(outcome.results[0].error, ErrorCode::Success);
    assert_eq!(outcome.results[1].error, ErrorCode::Named("ETIMEDOUT"));
    assert_eq!(outcome.results[5].elapsed, 1505.0 * 1e-6);
}

#[test]
fn test_budget_exhausted_keeps_partial_results() {
    let work = choose_probe_order(&landmarks(), 2, &mut fastrand::Rng::with_seed(11));

    let helper = ScriptedHelper::new(vec![(4, HelperExit::Failed(1))]);
    let mut runner = ProbeRunner::new(helper, FakeLimits::new(1024), settings(0));
    let outcome = runner.run(&work).expect("run");

    assert_eq!(outcome.state, RunState::Aborted);
    assert_eq!(outcome.cycles, MAX_CYCLES);
    assert_eq!(outcome.retries(), (MAX_CYCLES - 1) as usize);
    assert_eq!(outcome.processed, 4);

    let incomplete = outcome.incomplete().expect("incomplete");
    assert_eq!((incomplete.processed, incomplete.total), (4, 6));

    assert_eq!(outcome.results.len(), 6);
    for result in &outcome.results[..4] {
        assert!(result.elapsed > 0.0);
    }
    for (result, addr) in outcome.results[4..].iter().zip(&work[4..]) {
        assert_eq!(result.addr(), *addr);
        assert_eq!(result.error, ErrorCode::Success);
        assert_eq!(result.elapsed, 0.0);
    }
}

#[test]
fn test_parallel_clamped_to_hard_limit() {
    assert_eq!(resolve_parallelism(5000, 64), 64);
    assert_eq!(resolve_parallelism(0, 64), 64);

    let work: Vec<SocketAddrV4> = (0..100u8)
        .map(|i| SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, i), 80))
        .collect();

    let helper = ScriptedHelper::new(vec![(100, HelperExit::Success)]);
    let mut runner = ProbeRunner::new(helper, FakeLimits::new(64), settings(5000));
    let outcome = runner.run(&work).expect("run");
    assert!(outcome.is_complete());
    assert_eq!(outcome.fd_ceiling, 64);

    // parallel = 0: bounded by the host count only.
    let helper = ScriptedHelper::new(vec![(100, HelperExit::Success)]);
    let mut runner = ProbeRunner::new(helper, FakeLimits::new(4096), settings(0));
    let outcome = runner.run(&work).expect("run");
    assert_eq!(outcome.fd_ceiling, 103);
}

#[test]
fn test_real_process_without_progress_aborts() {
    // `true` exits cleanly without touching the buffer on its stdin.
    let work = landmarks();
    let mut runner = ProbeRunner::new(
        ProcessHelper::direct("true"),
        FakeLimits::new(1024),
        settings(0),
    );
    let outcome = runner.run(&work).expect("run");
    assert_eq!(outcome.state, RunState::Aborted);
    assert_eq!(outcome.helper_failures, 0);
    assert_eq!(outcome.results.len(), 3);

    let mut runner = ProbeRunner::new(
        ProcessHelper::direct("false"),
        FakeLimits::new(1024),
        settings(0),
    );
    let outcome = runner.run(&work).expect("run");
    assert_eq!(outcome.helper_failures, MAX_CYCLES);
}

/// `printf` escapes for the native-endian bytes of `value`.
fn octal_escapes(value: u32) -> String {
    value
        .to_ne_bytes()
        .iter()
        .map(|b| format!("\\{:03o}", b))
        .collect()
}

#[test]
fn test_child_fills_buffer_through_stdin() {
    // The child reopens its stdin read-write and patches the shared pages
    // in place, as probe-core does through its own mapping.
    let work = landmarks();
    let mut script = String::from(
        "exec 9<>/dev/stdin\n\
         put() { printf \"$2\" | dd of=/dev/fd/9 bs=1 seek=\"$1\" conv=notrunc 2>/dev/null; }\n",
    );
    for index in 0..work.len() {
        let elapsed_at = record_offset(index) + ConnectionRecord::OFF_ELAPSED;
        script += &format!("put {} '{}'\n", elapsed_at, octal_escapes(1500 + index as u32));
    }
    let error_at = record_offset(1) + ConnectionRecord::OFF_ERROR;
    script += &format!(
        "put {} '{}'\n",
        error_at,
        octal_escapes(libc::ECONNREFUSED as u32)
    );
    script += &format!(
        "put {} '{}'\n",
        Header::OFF_PROCESSED,
        octal_escapes(work.len() as u32)
    );

    let helper = ProcessHelper::new("sh", ["-c".to_string(), script]);
    let mut runner = ProbeRunner::new(helper, FakeLimits::new(1024), settings(0));
    let outcome = runner.run(&work).expect("run");

    assert_eq!(outcome.state, RunState::Complete);
    assert_eq!(outcome.cycles, 1);
    assert_eq!(outcome.helper_failures, 0);
    assert_eq!(outcome.processed, 3);
    assert!(outcome.contract_violation.is_none());

    for (index, (result, addr)) in outcome.results.iter().zip(&work).enumerate() {
        assert_eq!(result.addr(), *addr);
        assert_eq!(result.elapsed, f64::from(1500 + index as u32) * 1e-6);
    }
    assert_eq!(outcome.results[0].error, ErrorCode::Success);
    assert_eq!(outcome.results[1].error, ErrorCode::Named("ECONNREFUSED"));
}

#[test]
fn test_session_written_to_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = ProbeConfig {
        n_probes: 2,
        location: Some([-33.87, 151.21]),
        output_dir: dir.path().to_path_buf(),
        ..ProbeConfig::default()
    };
    config.validate(1024).expect("valid");

    let listed = vec![
        Landmark::new("192.0.2.10", 80),
        Landmark::new("198.51.100.20", 443),
        Landmark::new("203.0.113.30", 8080),
    ];
    let addrs = landmark_rtt::resolve_landmarks(&listed).expect("resolve");
    let work = choose_probe_order(
        &addrs,
        config.n_probes as usize,
        &mut fastrand::Rng::with_seed(3),
    );

    let helper = ScriptedHelper::new(vec![(6, HelperExit::Success)]);
    let mut runner = ProbeRunner::new(
        helper,
        FakeLimits::new(1024),
        RunSettings::from_config(&config),
    );
    let outcome = runner.run(&work).expect("run");

    let summary = RunSummary::from_config(&config).expect("summary");
    let doc = ResultDocument {
        summary: &summary,
        results: &outcome.results,
        landmarks: &listed,
        timestamp: chrono::Utc::now(),
    };
    let path = ResultRecorder::new(&config.output_dir)
        .record(&doc)
        .expect("record");

    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).expect("read")).expect("json");
    assert_eq!(value["n_probes"], 2);
    assert_eq!(value["location"], serde_json::json!([-33.87, 151.21]));
    assert_eq!(value["results"].as_array().map(Vec::len), Some(6));
    assert_eq!(value["results"][1]["error"], "ETIMEDOUT");
    assert_eq!(value["landmarks"].as_array().map(Vec::len), Some(3));
    assert!(value.get("helper_dir").is_none());
}
