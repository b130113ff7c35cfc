mod support;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use support::RecordingProxy;
use tapeflow_core::{SessionType, TaskWatchDog, TapeSessionStats};

fn watchdog(proxy: &RecordingProxy, stuck_period: Duration) -> TaskWatchDog {
    TaskWatchDog::new(
        SessionType::Recall,
        "drive0",
        Duration::from_millis(10),
        stuck_period,
        Duration::from_millis(2),
        Arc::new(proxy.clone()),
    )
}

#[test]
fn heartbeats_account_for_every_byte_moved() -> Result<(), Box<dyn std::error::Error>> {
    let proxy = RecordingProxy::new();
    let mut watchdog = watchdog(&proxy, Duration::from_secs(60));
    let handle = watchdog.handle();
    watchdog.start_thread();

    handle.notify_begin_new_job(1, 1);
    for _ in 0..20 {
        handle.notify(100);
        thread::sleep(Duration::from_millis(1));
    }
    handle.file_finished();
    watchdog.stop_and_wait()?;

    let log = proxy.log();
    let bytes: u64 = log.heartbeats.iter().map(|(bytes, _)| bytes).sum();
    let blocks: u64 = log.heartbeats.iter().map(|(_, blocks)| blocks).sum();
    assert_eq!(bytes, 2000);
    assert_eq!(blocks, 20);
    assert!(log.heartbeats.len() >= 2);
    assert_eq!(handle.heartbeats_sent(), log.heartbeats.len() as u64);
    Ok(())
}

#[test]
fn idle_file_is_flagged_once() -> Result<(), Box<dyn std::error::Error>> {
    let proxy = RecordingProxy::new();
    let mut watchdog = watchdog(&proxy, Duration::from_millis(15));
    let handle = watchdog.handle();
    watchdog.start_thread();

    handle.notify_begin_new_job(7, 3);
    thread::sleep(Duration::from_millis(80));
    assert_eq!(handle.stuck_events(), 1);

    handle.notify_begin_new_job(8, 4);
    handle.file_finished();
    thread::sleep(Duration::from_millis(40));
    watchdog.stop_and_wait()?;

    assert_eq!(handle.stuck_events(), 1);
    Ok(())
}

#[test]
fn moving_file_is_never_flagged() -> Result<(), Box<dyn std::error::Error>> {
    let proxy = RecordingProxy::new();
    let mut watchdog = watchdog(&proxy, Duration::from_millis(30));
    let handle = watchdog.handle();
    watchdog.start_thread();

    handle.notify_begin_new_job(1, 1);
    for _ in 0..30 {
        handle.notify(64);
        thread::sleep(Duration::from_millis(2));
    }
    handle.file_finished();
    watchdog.stop_and_wait()?;

    assert_eq!(handle.stuck_events(), 0);
    Ok(())
}

#[test]
fn only_error_counters_mark_the_session_failed() {
    let proxy = RecordingProxy::new();
    let watchdog = watchdog(&proxy, Duration::from_secs(60));
    let handle = watchdog.handle();

    handle.set_error_count("Info_tapeFilledUp", 1);
    handle.set_error_count("Error_tapeReadData", 0);
    assert!(!handle.error_happened());

    handle.add_to_error_count("Error_tapeReadData");
    handle.add_to_error_count("Error_tapeReadData");
    assert!(handle.error_happened());

    let counts = handle.error_counts();
    assert_eq!(counts.get("Error_tapeReadData"), Some(&2));
    assert_eq!(counts.get("Info_tapeFilledUp"), Some(&1));
}

#[test]
fn parameters_and_stats_reach_the_supervisor() -> Result<(), Box<dyn std::error::Error>> {
    let proxy = RecordingProxy::new();
    let mut watchdog = watchdog(&proxy, Duration::from_secs(60));
    let handle = watchdog.handle();

    handle.add_parameter("mountTime", "1.5");
    handle.update_stats(&TapeSessionStats {
        files_count: 3,
        data_volume: 192,
        ..TapeSessionStats::default()
    });
    watchdog.start_thread();
    thread::sleep(Duration::from_millis(20));
    watchdog.stop_and_wait()?;

    let log = proxy.log();
    assert!(log
        .params
        .contains(&("mountTime".to_string(), "1.5".to_string())));
    assert!(log
        .params
        .contains(&("filesCount".to_string(), "3".to_string())));
    Ok(())
}

#[test]
fn stop_interrupts_a_long_poll_period() -> Result<(), Box<dyn std::error::Error>> {
    let proxy = RecordingProxy::new();
    let mut watchdog = TaskWatchDog::new(
        SessionType::Migration,
        "drive0",
        Duration::from_secs(600),
        Duration::from_secs(600),
        Duration::from_secs(600),
        Arc::new(proxy.clone()),
    );
    let handle = watchdog.handle();
    watchdog.start_thread();
    handle.notify(512);

    let started = std::time::Instant::now();
    watchdog.stop_and_wait()?;
    assert!(started.elapsed() < Duration::from_secs(5));

    // The final heartbeat still carries what moved before the stop.
    let log = proxy.log();
    assert_eq!(log.heartbeats, vec![(512, 1)]);
    Ok(())
}

#[test]
fn stopping_a_watchdog_that_never_started_is_a_no_op() -> Result<(), Box<dyn std::error::Error>> {
    let proxy = RecordingProxy::new();
    let mut watchdog = watchdog(&proxy, Duration::from_secs(60));
    watchdog.stop_and_wait()?;
    assert!(proxy.log().heartbeats.is_empty());
    Ok(())
}
