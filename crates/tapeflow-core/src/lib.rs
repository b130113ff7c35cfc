pub mod buffer;
pub mod checksum;
pub mod client;
pub mod config;
pub mod core;
pub mod disk;
pub mod drive;
pub mod error;
pub mod injection;
pub mod migration;
pub mod proxy;
pub mod recall;
pub mod report;
pub mod reporter;
pub mod session;
pub mod stats;
pub mod tape;
pub mod telemetry;
pub mod types;
pub mod watchdog;

pub use buffer::{BlockFifo, MemoryBlock, MemoryBlockPool, PoolMetricsSnapshot};
pub use checksum::{Checksum, ChecksumAlgo};
pub use client::ClientReporter;
pub use config::SessionConfig;
pub use crate::core::{BlockingQueue, CompletionLatch, SessionFault, ValueRemaining, WorkerPool};
pub use disk::{DiskFileFactory, DiskFileReader, DiskFileWriter, LocalDisk};
pub use drive::{MediaChanger, TapeAlert, TapeDrive, VirtualDrive, VirtualFaults, VirtualLibrary};
pub use error::{EIO, ENOSPC, SEINTERNAL, TapeflowError};
pub use injection::InjectorHandle;
pub use migration::{MigrationJobSource, MigrationTaskInjector};
pub use proxy::TapedProxy;
pub use recall::{RecallJobSource, RecallTaskInjector};
pub use report::{
    FinalReport, MigrationReportPacker, PackerSummary, RecallReportPacker, Report, ReportSender,
};
pub use reporter::{ReporterHandle, TapeServerReporter};
pub use session::{DataTransferSession, SessionOutcome};
pub use stats::{DiskStats, TapeSessionStats};
pub use tape::{SessionChannels, TapeEndpoints, TapeThreadOutcome};
pub use telemetry::worker::{DefaultWorkerTelemetry, WorkerTelemetry};
pub use types::{
    DriveStatus, EndOfSessionAction, FileFailure, FileReport, MigrationFile, RecallFile, Result,
    SessionState, SessionType, VolumeInfo,
};
pub use watchdog::{TaskWatchDog, WatchDogHandle};
