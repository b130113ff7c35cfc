mod support;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use support::{
    BatchSource, ClientCall, PanicAt, PanickingDisk, RecordingClient, RecordingProxy, payload,
    recall_volume, test_config,
};
use tapeflow_core::checksum::checksum_of;
use tapeflow_core::{
    ChecksumAlgo, DataTransferSession, DriveStatus, EIO, EndOfSessionAction, FinalReport,
    DiskFileFactory, LocalDisk, RecallFile, SEINTERNAL, SessionConfig, SessionOutcome, SessionState,
    VirtualDrive, VirtualFaults,
};

const BLOCK: usize = 64;

struct RecallRig {
    drive: VirtualDrive,
    proxy: RecordingProxy,
    client: RecordingClient,
    files: Vec<RecallFile>,
    contents: Vec<Vec<u8>>,
}

impl RecallRig {
    /// A cartridge holding one file per entry of `sizes`, fseq 1 onwards,
    /// each recalled under `dir` with its Adler-32 checksum.
    fn new(dir: &Path, sizes: &[usize]) -> Self {
        let contents: Vec<Vec<u8>> = sizes
            .iter()
            .enumerate()
            .map(|(i, &len)| payload(i as u8 * 17, len))
            .collect();
        let drive = VirtualDrive::with_files(
            "V00042",
            BLOCK,
            contents
                .iter()
                .enumerate()
                .map(|(i, data)| (i as u64 + 1, data.clone())),
        );
        let files = contents
            .iter()
            .enumerate()
            .map(|(i, data)| {
                let fseq = i as u64 + 1;
                RecallFile::new(
                    100 + fseq,
                    fseq,
                    data.len() as u64,
                    dir.join(format!("restored/f{fseq}")),
                )
                .with_checksum(ChecksumAlgo::Adler32, checksum_of(ChecksumAlgo::Adler32, data))
            })
            .collect();
        Self {
            drive,
            proxy: RecordingProxy::new(),
            client: RecordingClient::new(),
            files,
            contents,
        }
    }

    fn run(
        &self,
        config: SessionConfig,
        source: BatchSource<RecallFile>,
    ) -> Result<SessionOutcome, Box<dyn std::error::Error>> {
        self.run_on(Arc::new(LocalDisk::new().with_parent_dirs()), config, source)
    }

    fn run_on(
        &self,
        disk: Arc<dyn DiskFileFactory>,
        config: SessionConfig,
        source: BatchSource<RecallFile>,
    ) -> Result<SessionOutcome, Box<dyn std::error::Error>> {
        let session =
            DataTransferSession::new(config, recall_volume(), Arc::new(self.proxy.clone()), disk)?;
        Ok(session.execute_recall(
            Box::new(self.drive.clone()),
            Box::new(self.drive.library()),
            self.client.boxed(),
            Box::new(source),
        )?)
    }

    fn run_all(&self) -> Result<SessionOutcome, Box<dyn std::error::Error>> {
        self.run(test_config(), BatchSource::new(vec![self.files.clone()]))
    }
}

fn assert_blocks_returned(outcome: &SessionOutcome) {
    assert_eq!(outcome.free_blocks, outcome.pool_capacity);
}

#[test]
fn recall_restores_every_file_with_its_checksum() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let rig = RecallRig::new(dir.path(), &[0, 1, BLOCK, 100, 5 * BLOCK + 3]);

    let outcome = rig.run_all()?;

    assert_eq!(outcome.end_action, EndOfSessionAction::MarkDriveUp);
    assert_eq!(outcome.files_injected, 5);
    assert_eq!(outcome.report.files_succeeded, 5);
    assert_eq!(outcome.report.files_failed, 0);
    assert_eq!(outcome.report.final_report, Some(FinalReport::EndOfSession));
    assert_eq!(outcome.report.anomalies, 0);
    assert!(outcome.error.is_none());
    assert_blocks_returned(&outcome);

    for (file, data) in rig.files.iter().zip(&rig.contents) {
        assert_eq!(&std::fs::read(&file.disk_path)?, data);
    }
    let mut reported = rig.client.succeeded();
    reported.sort_by_key(|file| file.fseq);
    for (report, file) in reported.iter().zip(&rig.files) {
        assert_eq!(report.fseq, file.fseq);
        assert_eq!(report.size, file.size);
        assert_eq!(Some(report.checksum), file.expected_checksum);
    }
    assert_eq!(rig.client.terminal_calls(), vec![ClientCall::EndOfSession]);

    let statuses = rig.client.drive_statuses();
    assert_eq!(statuses.first(), Some(&DriveStatus::Mounting));
    assert_eq!(statuses.last(), Some(&DriveStatus::Up));
    assert!(statuses.contains(&DriveStatus::Transferring));

    let total: u64 = rig.contents.iter().map(|data| data.len() as u64).sum();
    assert_eq!(outcome.tape_stats.data_volume, total);
    assert_eq!(outcome.disk_stats.data_volume, total);
    assert_eq!(outcome.tape_stats.files_count, 5);

    assert_eq!(rig.drive.library().mount_count(), 1);
    assert_eq!(rig.drive.library().dismount_count(), 1);
    assert!(!rig.drive.is_loaded());

    let log = rig.proxy.log();
    assert_eq!((log.mounted, log.unmounted), (1, 1));
    let heartbeat_bytes: u64 = log.heartbeats.iter().map(|(bytes, _)| bytes).sum();
    assert_eq!(heartbeat_bytes, total);
    assert_eq!(log.states.first(), Some(&SessionState::Mounting));
    assert_eq!(log.states.last(), Some(&SessionState::ShuttingDown));
    assert!(log.states.contains(&SessionState::Running));
    Ok(())
}

#[test]
fn work_is_fetched_in_several_batches() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let rig = RecallRig::new(dir.path(), &[100; 12]);
    let batches = rig.files.chunks(4).map(<[RecallFile]>::to_vec).collect();
    let config = SessionConfig {
        max_files_request: 4,
        ..test_config()
    };

    let outcome = rig.run(config, BatchSource::new(batches))?;

    assert_eq!(outcome.files_injected, 12);
    assert_eq!(outcome.report.files_succeeded, 12);
    assert_eq!(outcome.end_action, EndOfSessionAction::MarkDriveUp);
    assert_blocks_returned(&outcome);
    Ok(())
}

#[test]
fn checksum_mismatch_fails_only_that_file() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut rig = RecallRig::new(dir.path(), &[100, 200, 300]);
    rig.files[1].expected_checksum = rig.files[1].expected_checksum.map(|sum| sum ^ 1);

    let outcome = rig.run_all()?;

    assert_eq!(outcome.end_action, EndOfSessionAction::MarkDriveUp);
    assert_eq!(outcome.report.files_succeeded, 2);
    assert_eq!(outcome.report.files_failed, 1);
    let failed = rig.client.failed();
    assert_eq!(failed[0].fseq, 2);
    assert_eq!(failed[0].code, EIO);
    assert!(!rig.files[1].disk_path.exists());
    assert_eq!(std::fs::read(&rig.files[2].disk_path)?, rig.contents[2]);
    assert_eq!(
        rig.client.terminal_calls(),
        vec![ClientCall::EndOfSessionWithError(
            "Previous file errors".to_string(),
            SEINTERNAL
        )]
    );
    assert_blocks_returned(&outcome);
    Ok(())
}

#[test]
fn short_file_on_tape_fails_only_that_file() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let mut rig = RecallRig::new(dir.path(), &[100, 100]);
    rig.files[0].size = 150;

    let outcome = rig.run_all()?;

    assert_eq!(outcome.report.files_succeeded, 1);
    assert_eq!(outcome.report.files_failed, 1);
    assert_eq!(rig.client.failed()[0].fseq, 1);
    assert_eq!(rig.client.failed()[0].code, EIO);
    assert_eq!(outcome.end_action, EndOfSessionAction::MarkDriveUp);
    assert_eq!(outcome.tape_stats.files_count, 1);
    assert_eq!(outcome.tape_stats.failed_files, 1);
    assert!(outcome.error.is_none());
    assert!(!rig.files[0].disk_path.exists());
    assert_blocks_returned(&outcome);
    Ok(())
}

#[test]
fn read_error_abandons_the_rest_and_puts_the_drive_down() -> Result<(), Box<dyn std::error::Error>>
{
    let dir = tempfile::tempdir()?;
    let rig = RecallRig::new(dir.path(), &[100, 100, 100, 100, 100]);
    rig.drive.set_faults(VirtualFaults {
        fail_read_at_fseq: Some(3),
        ..VirtualFaults::default()
    });

    let outcome = rig.run_all()?;

    assert_eq!(outcome.end_action, EndOfSessionAction::MarkDriveDown);
    assert_eq!(outcome.report.files_succeeded, 2);
    assert_eq!(outcome.report.files_failed, 3);
    let mut failed: Vec<u64> = rig.client.failed().iter().map(|file| file.fseq).collect();
    failed.sort_unstable();
    assert_eq!(failed, vec![3, 4, 5]);
    assert!(outcome.error.is_some());

    let terminal = rig.client.terminal_calls();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(
        &terminal[0],
        ClientCall::EndOfSessionWithError(message, code)
            if message.contains("medium error") && *code == EIO
    ));
    assert_eq!(rig.client.drive_statuses().last(), Some(&DriveStatus::Down));
    assert_eq!(rig.proxy.log().unmounted, 1);
    assert_eq!(rig.drive.library().dismount_count(), 1);
    assert_blocks_returned(&outcome);
    Ok(())
}

#[test]
fn drive_panic_is_contained() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let rig = RecallRig::new(dir.path(), &[3 * BLOCK; 4]);
    rig.drive.set_faults(VirtualFaults {
        panic_on_read_at_fseq: Some(2),
        ..VirtualFaults::default()
    });

    let outcome = rig.run_all()?;

    assert_eq!(outcome.end_action, EndOfSessionAction::MarkDriveDown);
    assert_eq!(outcome.report.files_succeeded, 1);
    assert_eq!(outcome.report.files_failed, 3);
    assert!(outcome.error.as_deref().is_some_and(|error| error.contains("panicked")));
    assert_eq!(rig.client.terminal_calls().len(), 1);
    assert_eq!(rig.proxy.log().unmounted, 1);
    assert_blocks_returned(&outcome);
    Ok(())
}

/// Runs the rig on a disk that panics on `victim`, giving up after ten
/// seconds.
fn run_with_crashing_disk(
    rig: RecallRig,
    victim: &str,
    at: PanicAt,
) -> Result<(RecallRig, SessionOutcome), Box<dyn std::error::Error>> {
    let disk = Arc::new(PanickingDisk::new(victim, at));
    let (done_tx, done_rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let outcome = rig
            .run_on(disk, test_config(), BatchSource::new(vec![rig.files.clone()]))
            .map_err(|err| err.to_string());
        let _ = done_tx.send((rig, outcome));
    });
    let (rig, outcome) = done_rx.recv_timeout(Duration::from_secs(10))?;
    Ok((rig, outcome?))
}

#[test]
fn disk_panic_on_open_fails_only_that_file() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    // Four times the pool: the tape keeps producing blocks for the file
    // whose writer crashed.
    let rig = RecallRig::new(dir.path(), &[4 * 16 * BLOCK, 100]);

    let (rig, outcome) = run_with_crashing_disk(rig, "f1", PanicAt::Open)?;

    assert_eq!(outcome.end_action, EndOfSessionAction::MarkDriveUp);
    assert_eq!(outcome.report.files_succeeded, 1);
    assert_eq!(outcome.report.files_failed, 1);
    let failed = rig.client.failed();
    assert_eq!(failed[0].fseq, 1);
    assert_eq!(failed[0].code, EIO);
    assert!(failed[0].message.contains("panicked"));
    assert!(!rig.files[0].disk_path.exists());
    assert_eq!(std::fs::read(&rig.files[1].disk_path)?, rig.contents[1]);
    assert_eq!(rig.client.terminal_calls().len(), 1);
    assert_blocks_returned(&outcome);
    Ok(())
}

#[test]
fn disk_panic_mid_file_removes_the_partial_file() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let rig = RecallRig::new(dir.path(), &[100, 5 * BLOCK, 100]);

    let (rig, outcome) = run_with_crashing_disk(rig, "f2", PanicAt::Data)?;

    assert_eq!(outcome.report.files_succeeded, 2);
    assert_eq!(outcome.report.files_failed, 1);
    assert_eq!(rig.client.failed()[0].fseq, 2);
    assert!(!rig.files[1].disk_path.exists());
    assert_eq!(outcome.disk_stats.failed_files, 1);
    assert_blocks_returned(&outcome);
    Ok(())
}

#[test]
fn empty_request_ends_without_mounting() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let rig = RecallRig::new(dir.path(), &[100]);

    let outcome = rig.run(test_config(), BatchSource::new(Vec::new()))?;

    assert_eq!(outcome.end_action, EndOfSessionAction::MarkDriveUp);
    assert_eq!(outcome.files_injected, 0);
    assert_eq!(rig.client.terminal_calls(), vec![ClientCall::EndOfSession]);
    assert_eq!(rig.drive.library().mount_count(), 0);
    assert_eq!(rig.proxy.log().mounted, 0);
    Ok(())
}

#[test]
fn unreachable_catalogue_ends_without_mounting() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let rig = RecallRig::new(dir.path(), &[100]);
    let source = BatchSource::new(vec![rig.files.clone()]).failing_after(0);

    let outcome = rig.run(test_config(), source)?;

    assert_eq!(outcome.end_action, EndOfSessionAction::MarkDriveUp);
    assert!(outcome.error.is_some());
    let terminal = rig.client.terminal_calls();
    assert!(matches!(
        &terminal[..],
        [ClientCall::EndOfSessionWithError(message, _)] if message.contains("catalogue unreachable")
    ));
    assert_eq!(rig.drive.library().mount_count(), 0);
    Ok(())
}

#[test]
fn mount_failure_fails_every_file() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let rig = RecallRig::new(dir.path(), &[100, 100, 100]);
    rig.drive.set_faults(VirtualFaults {
        fail_mount: true,
        ..VirtualFaults::default()
    });

    let outcome = rig.run_all()?;

    assert_eq!(outcome.end_action, EndOfSessionAction::MarkDriveDown);
    assert_eq!(outcome.report.files_succeeded, 0);
    assert_eq!(outcome.report.files_failed, 3);
    assert_eq!(rig.drive.library().mount_count(), 0);
    assert_eq!(rig.proxy.log().mounted, 0);
    assert!(rig.files.iter().all(|file| !file.disk_path.exists()));
    assert_blocks_returned(&outcome);
    Ok(())
}

#[test]
fn migration_volume_is_refused_for_recall() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let rig = RecallRig::new(dir.path(), &[10]);
    let session = DataTransferSession::new(
        test_config(),
        support::migration_volume(),
        Arc::new(rig.proxy.clone()),
        Arc::new(LocalDisk::new()),
    )?;

    let result = session.execute_recall(
        Box::new(rig.drive.clone()),
        Box::new(rig.drive.library()),
        rig.client.boxed(),
        Box::new(BatchSource::new(vec![rig.files.clone()])),
    );

    assert!(result.is_err());
    assert!(rig.client.calls().is_empty());
    Ok(())
}
