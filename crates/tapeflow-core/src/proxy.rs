//! Notifications to the supervising daemon process.

use crate::types::{SessionState, SessionType};

/// Link to the process supervising this session.
///
/// Calls are fire-and-forget from the session's point of view; an
/// implementation that fails should log and carry on.
pub trait TapedProxy: Send + Sync {
    fn report_state(&self, state: SessionState, session_type: SessionType, vid: &str);
    fn tape_mounted(&self, session_type: SessionType, vid: &str, unit: &str);
    fn tape_unmounted(&self, vid: &str, unit: &str);
    /// Periodic liveness signal with the amount moved since the previous one.
    fn report_heartbeat(&self, bytes_moved: u64, blocks_moved: u64);
    fn add_log_params(&self, unit: &str, params: &[(String, String)]);
    fn delete_log_params(&self, unit: &str, names: &[String]);
}
