//! Process-wide registry of long-running downloads.
//!
//! Every model pull and backend install is tracked as a Transfer with a
//! cooperative abort flag. Pause and cancel are requested by the control
//! endpoint and polled by the fetching task at I/O boundaries; pause keeps
//! partial files on disk, cancel removes them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{AbortReason, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Model,
    Backend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Active,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Cancelled | TransferState::Completed | TransferState::Failed
        )
    }
}

const RUN: u8 = 0;
const PAUSE: u8 = 1;
const CANCEL: u8 = 2;

/// Cooperative abort signal shared between the fetching task and the
/// control endpoint.
#[derive(Debug, Default)]
pub struct AbortFlag(AtomicU8);

impl AbortFlag {
    pub fn pause(&self) {
        // Cancel wins over a later pause.
        let _ = self
            .0
            .compare_exchange(RUN, PAUSE, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.0.store(CANCEL, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(RUN, Ordering::SeqCst);
    }

    /// Checked by fetching tasks at safe points.
    pub fn check(&self) -> Result<()> {
        match self.0.load(Ordering::SeqCst) {
            RUN => Ok(()),
            PAUSE => Err(Error::DownloadAborted(AbortReason::Paused)),
            _ => Err(Error::DownloadAborted(AbortReason::Cancelled)),
        }
    }
}

/// Snapshot of one transfer for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct TransferInfo {
    pub id: String,
    pub display_name: String,
    pub kind: TransferKind,
    pub state: TransferState,
    pub bytes_received: u64,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

struct TransferEntry {
    info: TransferInfo,
    abort: Arc<AbortFlag>,
}

/// Registry keyed by display name (model name, or `recipe:backend`).
#[derive(Default)]
pub struct TransferRegistry {
    entries: Mutex<HashMap<String, TransferEntry>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new transfer and hand back its abort flag.
    ///
    /// A second transfer under a name that is still active is rejected; a
    /// terminal or paused leftover is replaced (resume goes through here).
    pub fn begin(&self, display_name: &str, kind: TransferKind) -> Result<Arc<AbortFlag>> {
        let mut entries = self.entries.lock().unwrap();

        if let Some(existing) = entries.get(display_name) {
            if existing.info.state == TransferState::Active {
                return Err(Error::Busy(format!(
                    "{display_name} is already being downloaded"
                )));
            }
        }

        let abort = Arc::new(AbortFlag::default());
        entries.insert(
            display_name.to_string(),
            TransferEntry {
                info: TransferInfo {
                    id: uuid::Uuid::new_v4().to_string(),
                    display_name: display_name.to_string(),
                    kind,
                    state: TransferState::Active,
                    bytes_received: 0,
                    total_bytes: 0,
                    last_error: None,
                },
                abort: abort.clone(),
            },
        );
        Ok(abort)
    }

    pub fn record_progress(&self, display_name: &str, bytes_received: u64, total_bytes: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(display_name) {
            entry.info.bytes_received = bytes_received;
            if total_bytes > 0 {
                entry.info.total_bytes = total_bytes;
            }
        }
    }

    /// Move a transfer to its terminal (or paused) state after the fetching
    /// task returns.
    pub fn finish(&self, display_name: &str, result: &Result<()>) {
        let state = match result {
            Ok(()) => TransferState::Completed,
            Err(Error::DownloadAborted(AbortReason::Paused)) => TransferState::Paused,
            Err(Error::DownloadAborted(AbortReason::Cancelled)) => TransferState::Cancelled,
            Err(_) => TransferState::Failed,
        };
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(display_name) {
            entry.info.state = state;
            if let Err(e) = result {
                entry.info.last_error = Some(e.to_string());
            }
        }
    }

    /// Request pause. Ignored for transfers that aren't active.
    pub fn pause(&self, display_name: &str) -> Result<()> {
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .get(display_name)
            .ok_or_else(|| Error::InvalidRequest(format!("No transfer for {display_name}")))?;
        entry.abort.pause();
        Ok(())
    }

    pub fn cancel(&self, display_name: &str) -> Result<()> {
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .get(display_name)
            .ok_or_else(|| Error::InvalidRequest(format!("No transfer for {display_name}")))?;
        entry.abort.cancel();
        Ok(())
    }

    /// Drop a terminal transfer once the consumer has observed it.
    pub fn acknowledge(&self, display_name: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get(display_name) {
            if entry.info.state.is_terminal() {
                entries.remove(display_name);
            }
        }
    }

    pub fn get(&self, display_name: &str) -> Option<TransferInfo> {
        self.entries
            .lock()
            .unwrap()
            .get(display_name)
            .map(|e| e.info.clone())
    }

    pub fn snapshot(&self) -> Vec<TransferInfo> {
        let mut all: Vec<TransferInfo> = self
            .entries
            .lock()
            .unwrap()
            .values()
            .map(|e| e.info.clone())
            .collect();
        all.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_rejects_active_duplicate() {
        let registry = TransferRegistry::new();
        registry.begin("model-a", TransferKind::Model).unwrap();
        let err = registry.begin("model-a", TransferKind::Model).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[test]
    fn test_begin_replaces_terminal_entry() {
        let registry = TransferRegistry::new();
        registry.begin("model-a", TransferKind::Model).unwrap();
        registry.finish("model-a", &Err(Error::Internal("boom".into())));
        assert_eq!(
            registry.get("model-a").unwrap().state,
            TransferState::Failed
        );

        // Restarting after failure is allowed.
        registry.begin("model-a", TransferKind::Model).unwrap();
        assert_eq!(
            registry.get("model-a").unwrap().state,
            TransferState::Active
        );
    }

    #[test]
    fn test_pause_and_cancel_drive_abort_flag() {
        let registry = TransferRegistry::new();
        let abort = registry.begin("model-a", TransferKind::Model).unwrap();
        assert!(abort.check().is_ok());

        registry.pause("model-a").unwrap();
        assert!(matches!(
            abort.check(),
            Err(Error::DownloadAborted(AbortReason::Paused))
        ));

        // Cancel overrides pause.
        registry.cancel("model-a").unwrap();
        assert!(matches!(
            abort.check(),
            Err(Error::DownloadAborted(AbortReason::Cancelled))
        ));
    }

    #[test]
    fn test_cancel_wins_over_later_pause() {
        let flag = AbortFlag::default();
        flag.cancel();
        flag.pause();
        assert!(matches!(
            flag.check(),
            Err(Error::DownloadAborted(AbortReason::Cancelled))
        ));
    }

    #[test]
    fn test_finish_maps_abort_reasons() {
        let registry = TransferRegistry::new();
        registry.begin("a", TransferKind::Backend).unwrap();
        registry.finish("a", &Err(Error::DownloadAborted(AbortReason::Paused)));
        assert_eq!(registry.get("a").unwrap().state, TransferState::Paused);

        registry.begin("b", TransferKind::Backend).unwrap();
        registry.finish("b", &Err(Error::DownloadAborted(AbortReason::Cancelled)));
        assert_eq!(registry.get("b").unwrap().state, TransferState::Cancelled);

        registry.begin("c", TransferKind::Backend).unwrap();
        registry.finish("c", &Ok(()));
        assert_eq!(registry.get("c").unwrap().state, TransferState::Completed);
    }

    #[test]
    fn test_acknowledge_removes_only_terminal() {
        let registry = TransferRegistry::new();
        registry.begin("live", TransferKind::Model).unwrap();
        registry.acknowledge("live");
        assert!(registry.get("live").is_some());

        registry.finish("live", &Ok(()));
        registry.acknowledge("live");
        assert!(registry.get("live").is_none());
    }

    #[test]
    fn test_progress_updates_bytes() {
        let registry = TransferRegistry::new();
        registry.begin("m", TransferKind::Model).unwrap();
        registry.record_progress("m", 10, 100);
        let info = registry.get("m").unwrap();
        assert_eq!(info.bytes_received, 10);
        assert_eq!(info.total_bytes, 100);

        // An unknown total never erases a known one.
        registry.record_progress("m", 20, 0);
        let info = registry.get("m").unwrap();
        assert_eq!(info.bytes_received, 20);
        assert_eq!(info.total_bytes, 100);
    }

    #[test]
    fn test_control_on_unknown_transfer_is_invalid() {
        let registry = TransferRegistry::new();
        assert!(registry.pause("ghost").is_err());
        assert!(registry.cancel("ghost").is_err());
    }
}
