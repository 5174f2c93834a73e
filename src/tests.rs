use std::fs;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use crate::testing::{MemoryDevice, OpLog};
use crate::*;

const CHUNK: usize = 4096;

fn mem_targets(devices: Vec<(&str, MemoryDevice)>) -> Vec<TargetSpec> {
    devices
        .into_iter()
        .map(|(name, dev)| TargetSpec::new(name, dev, CHUNK))
        .collect()
}

fn start(config: RunConfig, devices: Vec<(&str, MemoryDevice)>) -> RunHandle {
    Orchestrator::new(config)
        .start_targets(mem_targets(devices))
        .unwrap()
}

fn start_err(config: RunConfig, targets: Vec<TargetSpec>) -> ConfigError {
    match Orchestrator::new(config).start_targets(targets) {
        Ok(_) => panic!("run should not have started"),
        Err(e) => e,
    }
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < deadline, "condition not reached in {:?}", deadline);
        thread::sleep(Duration::from_millis(1));
    }
}

/// Panics on first write, as a driver bug would.
struct PanickingTarget;

impl BlockTarget for PanickingTarget {
    fn size(&self) -> u64 {
        8192
    }
    fn write_at(&mut self, _buf: &[u8], _offset: u64) -> io::Result<usize> {
        panic!("driver exploded");
    }
    fn read_at(&mut self, _buf: &mut [u8], _offset: u64) -> io::Result<usize> {
        Ok(0)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_healthy_devices_round_trip_without_faults() {
    let handle = start(
        RunConfig::default().with_pass_pairs(2),
        vec![
            ("a", MemoryDevice::new(64 * 1024)),
            ("b", MemoryDevice::new(40_000)),
        ],
    );
    let result = handle.wait();
    assert!(result.success);
    assert!(!result.cancelled);
    assert!(result.faults.is_empty());
    for (name, size) in [("a", 64 * 1024u64), ("b", 40_000)] {
        let report = result.device(name).unwrap();
        assert_eq!(report.status, DeviceStatus::Completed);
        assert_eq!(report.size, size);
        assert_eq!(report.passes_completed, 2);
        assert_eq!(report.bytes_written, 2 * size);
        assert_eq!(report.bytes_verified, 2 * size);
    }
    assert!(result.finished_at >= result.started_at);
}

#[test]
fn test_badblocks_pattern_round_trip() {
    let handle = start(
        RunConfig::default()
            .with_pattern(PatternKind::Badblocks)
            .with_pass_pairs(4),
        vec![("bb", MemoryDevice::new(3 * CHUNK + 17))],
    );
    let result = handle.wait();
    assert!(result.success);
    assert_eq!(result.status_of("bb"), Some(DeviceStatus::Completed));
}

#[test]
fn test_corruption_is_reported_at_the_corrupted_byte() {
    let handle = start(
        RunConfig::default(),
        vec![
            ("clean", MemoryDevice::new(64 * 1024)),
            ("bad", MemoryDevice::new(64 * 1024).corrupt_on_flush(12_345, 0x01)),
        ],
    );
    let result = handle.wait();
    assert!(!result.success);
    assert_eq!(result.faults.len(), 1);
    let fault = &result.faults[0];
    assert_eq!(&*fault.device, "bad");
    assert_eq!(fault.kind, FaultKind::Mismatch);
    assert_eq!(fault.offset, 12_345);
    // A mismatch is not fatal; the device still completes.
    assert_eq!(result.status_of("bad"), Some(DeviceStatus::Completed));
    assert_eq!(result.status_of("clean"), Some(DeviceStatus::Completed));
    assert_eq!(result.faults_for("clean").count(), 0);
}

#[test]
fn test_failing_device_does_not_affect_the_others() {
    let handle = start(
        RunConfig::default(),
        vec![
            ("d1", MemoryDevice::new(32 * 1024)),
            ("d2", MemoryDevice::new(32 * 1024).fail_write_at(8192)),
            ("d3", MemoryDevice::new(48 * 1024)),
        ],
    );
    let result = handle.wait();
    assert!(!result.success);
    assert_eq!(result.status_of("d1"), Some(DeviceStatus::Completed));
    assert_eq!(result.status_of("d2"), Some(DeviceStatus::Failed));
    assert_eq!(result.status_of("d3"), Some(DeviceStatus::Completed));
    assert_eq!(result.faults.len(), 1);
    assert_eq!(&*result.faults[0].device, "d2");
    assert_eq!(result.faults[0].kind, FaultKind::WriteError);
    assert_eq!(result.faults[0].offset, 8192);
    assert_eq!(result.device("d1").unwrap().bytes_verified, 32 * 1024);
    assert_eq!(result.device("d3").unwrap().bytes_verified, 48 * 1024);
}

#[test]
fn test_cancel_stops_every_device_promptly() {
    let size = 1024 * 1024;
    let handle = start(
        RunConfig::default().with_pass_pairs(3),
        vec![
            ("slow1", MemoryDevice::new(size).with_delay(Duration::from_millis(2))),
            ("slow2", MemoryDevice::new(size).with_delay(Duration::from_millis(2))),
        ],
    );
    wait_until(Duration::from_secs(10), || {
        handle.snapshot().devices.iter().all(|d| d.bytes_processed > 0)
    });
    handle.cancel();
    handle.cancel();
    let snapshot = handle.snapshot();
    assert_ne!(snapshot.status, RunStatus::Running);

    wait_until(Duration::from_secs(10), || handle.is_finished());
    let stopped = handle.snapshot();
    assert_eq!(stopped.status, RunStatus::Finished);
    assert_eq!(stopped.cancelled, 2);
    for device in &stopped.devices {
        assert_eq!(device.state, DeviceState::Cancelled);
        assert!(device.bytes_processed > 0);
        assert!(device.bytes_processed <= device.total_bytes);
    }

    let result = handle.wait();
    assert!(result.cancelled);
    assert!(result.faults.is_empty());
    for report in &result.devices {
        assert_eq!(report.status, DeviceStatus::Cancelled);
        assert_eq!(report.passes_completed, 0);
        // Stopped inside the first write sweep: nothing verified yet.
        assert_eq!(report.bytes_verified, 0);
        assert!(report.bytes_written > 0 && report.bytes_written < size as u64);
    }
}

#[test]
fn test_cancel_after_finish_changes_nothing() {
    let handle = start(RunConfig::default(), vec![("small", MemoryDevice::new(8192))]);
    wait_until(Duration::from_secs(10), || handle.is_finished());
    handle.cancel();
    assert_eq!(handle.snapshot().status, RunStatus::Finished);
    let result = handle.wait();
    assert!(result.success);
    assert!(!result.cancelled);
    assert_eq!(result.status_of("small"), Some(DeviceStatus::Completed));
}

#[test]
fn test_snapshot_reports_live_progress() {
    let size = 256 * 1024;
    let handle = start(
        RunConfig::default(),
        vec![("live", MemoryDevice::new(size).with_delay(Duration::from_millis(1)))],
    );
    let first = handle.snapshot();
    assert_eq!(first.devices.len(), 1);
    assert_eq!(first.total_bytes, size as u64);

    wait_until(Duration::from_secs(10), || handle.snapshot().bytes_processed > 0);
    let mid = handle.snapshot();
    assert!(mid.bytes_processed <= mid.total_bytes);
    assert!(mid.overall_fraction() > 0.0 && mid.overall_fraction() <= 1.0);

    let result = handle.wait();
    assert!(result.success);
}

#[test]
fn test_events_stream_ends_after_every_device_finishes() {
    let handle = start(
        RunConfig::default(),
        vec![
            ("e1", MemoryDevice::new(16 * 1024).corrupt_on_flush(5, 0x40)),
            ("e2", MemoryDevice::new(16 * 1024)),
        ],
    );
    let events: Vec<RunEvent> = handle.events().iter().collect();
    let finished = events
        .iter()
        .filter(|e| matches!(e, RunEvent::Finished { .. }))
        .count();
    let faults: Vec<&Fault> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Fault(f) => Some(f),
            _ => None,
        })
        .collect();
    assert_eq!(finished, 2);
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].offset, 5);
    assert_eq!(handle.faults().len(), 1);
    assert!(handle.faults().since(1).is_empty());

    let result = handle.wait();
    assert_eq!(result.faults.len(), 1);
}

#[test]
fn test_empty_device_list_is_rejected() {
    assert_eq!(start_err(RunConfig::default(), Vec::new()), ConfigError::NoDevices);
    assert!(matches!(start_run(&[], 1), Err(ConfigError::NoDevices)));
}

#[test]
fn test_invalid_layouts_are_rejected_before_any_io() {
    let err = start_err(
        RunConfig::default().with_pass_pairs(0),
        mem_targets(vec![("a", MemoryDevice::new(4096))]),
    );
    assert_eq!(err, ConfigError::InvalidPassCount(0));

    let err = start_err(
        RunConfig::default(),
        vec![TargetSpec::new("a", MemoryDevice::new(4096), 0)],
    );
    assert!(matches!(err, ConfigError::InvalidChunkSize { chunk_size: 0, .. }));

    let err = start_err(
        RunConfig::default().with_direct_io(true),
        vec![TargetSpec::new("a", MemoryDevice::new(4096), 1000)],
    );
    assert!(matches!(err, ConfigError::MisalignedChunk { alignment: 512, .. }));

    let err = start_err(
        RunConfig::default(),
        mem_targets(vec![("a", MemoryDevice::new(4096)), ("a", MemoryDevice::new(4096))]),
    );
    assert_eq!(err, ConfigError::DuplicateDevice("a".to_string()));
}

#[test]
fn test_zero_length_device_blocks_the_run_by_default() {
    let err = start_err(
        RunConfig::default(),
        mem_targets(vec![("ok", MemoryDevice::new(4096)), ("empty", MemoryDevice::new(0))]),
    );
    assert_eq!(
        err,
        ConfigError::DeviceSetup(vec![SetupError {
            device: "empty".to_string(),
            kind: SetupErrorKind::ZeroLength,
        }])
    );
}

#[test]
fn test_skip_unusable_runs_the_remaining_devices() {
    let handle = start(
        RunConfig::default().with_skip_unusable(true),
        vec![("ok", MemoryDevice::new(8192)), ("empty", MemoryDevice::new(0))],
    );
    assert_eq!(handle.setup_errors().len(), 1);
    let result = handle.wait();
    assert_eq!(result.devices.len(), 1);
    assert_eq!(result.status_of("ok"), Some(DeviceStatus::Completed));
    assert_eq!(result.setup_errors[0].device, "empty");
    // An excluded device means the run as a whole did not pass.
    assert!(!result.success);

    let err = start_err(
        RunConfig::default().with_skip_unusable(true),
        mem_targets(vec![("empty", MemoryDevice::new(0))]),
    );
    assert!(matches!(err, ConfigError::DeviceSetup(ref errs) if errs.len() == 1));
}

#[test]
fn test_panicking_worker_only_fails_its_device() {
    let targets = vec![
        TargetSpec::new("boom", PanickingTarget, CHUNK),
        TargetSpec::new("fine", MemoryDevice::new(16 * 1024), CHUNK),
    ];
    let handle = Orchestrator::new(RunConfig::default())
        .start_targets(targets)
        .unwrap();
    wait_until(Duration::from_secs(10), || handle.is_finished());

    // The live view already shows the failure before anyone waits.
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, RunStatus::Finished);
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.running, 0);
    assert_eq!(snapshot.devices[0].state, DeviceState::Failed);
    assert_eq!(snapshot.devices[0].fault_count, 1);
    assert_eq!(handle.faults().for_device("boom").len(), 1);

    let result = handle.wait();
    assert_eq!(result.status_of("boom"), Some(DeviceStatus::Failed));
    assert_eq!(result.status_of("fine"), Some(DeviceStatus::Completed));
    assert!(!result.success);
    assert_eq!(result.faults.len(), 1);
    let fault = &result.faults[0];
    assert_eq!(fault.kind, FaultKind::WriteError);
    assert_eq!(fault.offset, 0);
    assert_eq!(fault.detail.as_deref(), Some("worker panicked: driver exploded"));
}

#[test]
fn test_dropped_handle_stops_device_io() {
    let ops: OpLog = Default::default();
    let device = MemoryDevice::new(256 * 1024)
        .with_delay(Duration::from_millis(2))
        .with_op_log(Arc::clone(&ops));
    let handle = start(RunConfig::default(), vec![("dropped", device)]);
    wait_until(Duration::from_secs(10), || ops.lock().len() >= 3);

    drop(handle);
    let at_drop = ops.lock().len();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(ops.lock().len(), at_drop);
    // One 64-chunk write sweep plus flush and verify sweep would be 129 ops.
    assert!(at_drop < 129);
}

#[test]
fn test_stop_flag_set_before_start_cancels_without_io() {
    let ops: OpLog = Default::default();
    let stop = Arc::new(AtomicBool::new(true));
    let handle = Orchestrator::new(RunConfig::default())
        .with_stop_flag(Arc::clone(&stop))
        .start_targets(mem_targets(vec![(
            "early",
            MemoryDevice::new(64 * 1024).with_op_log(Arc::clone(&ops)),
        )]))
        .unwrap();
    let result = handle.wait();
    assert!(result.cancelled);
    assert_eq!(result.status_of("early"), Some(DeviceStatus::Cancelled));
    assert!(ops.lock().is_empty());
}

#[test]
fn test_file_backed_device_holds_the_last_pattern() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("disk.img");
    fs::File::create(&path).unwrap().set_len(64 * 1024).unwrap();

    let spec = DeviceSpec::new(&path).with_chunk_size(16 * 1024);
    let result = start_run(&[spec], 1).unwrap().wait();
    assert!(result.success, "{:?}", result.faults);

    let on_disk = fs::read(&path).unwrap();
    let expected = RunConfig::default().patterns().generate(0, 0, 64 * 1024);
    assert!(on_disk == expected);
}

#[test]
fn test_missing_device_path_is_a_setup_error() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("no-such-disk");
    match start_run(&[DeviceSpec::new(&missing)], 1) {
        Err(ConfigError::DeviceSetup(errs)) => {
            assert_eq!(errs.len(), 1);
            assert!(matches!(errs[0].kind, SetupErrorKind::Unreadable(_)));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("run should not have started"),
    }
}

#[test]
fn test_result_json_lists_devices_and_faults() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("run.log");
    let log = Arc::new(RunLog::open(&log_path).unwrap());
    let handle = Orchestrator::new(RunConfig::default())
        .with_log(log)
        .start_targets(mem_targets(vec![(
            "j",
            MemoryDevice::new(8192).corrupt_on_flush(4100, 0x02),
        )]))
        .unwrap();
    let result = handle.wait();
    let json = result.to_json();
    assert_eq!(json["success"], false);
    assert_eq!(json["devices"][0]["device"], "j");
    assert_eq!(json["faults"][0]["offset"], 4100);

    let text = fs::read_to_string(&log_path).unwrap();
    assert!(text.contains("Starting run: 1 device(s)"));
    assert!(text.contains("--- Run Summary ---"));
    assert!(text.contains("Run FAILED."));
}
