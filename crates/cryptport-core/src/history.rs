// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Finished transfer archive
//
// Keeps snapshots of terminal jobs in memory for inspection. Writing an
// activity log to disk is left to the frontend.

use crate::types::{JobId, TransferJob};
use std::sync::RwLock;

/// Maximum number of history entries to keep
const MAX_HISTORY_ENTRIES: usize = 100;

/// In-memory archive of finished transfers, most recent first
#[derive(Default)]
pub struct TransferHistory {
    records: RwLock<Vec<TransferJob>>,
}

impl TransferHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all archived jobs
    pub fn list(&self) -> Vec<TransferJob> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get(&self, id: &JobId) -> Option<TransferJob> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|job| job.id == *id)
            .cloned()
    }

    /// Archive a finished job
    pub fn add(&self, job: TransferJob) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());

        // Add new record at the beginning (most recent first)
        records.insert(0, job);

        if records.len() > MAX_HISTORY_ENTRIES {
            records.truncate(MAX_HISTORY_ENTRIES);
        }
    }

    /// Clear all history
    pub fn clear(&self) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Get the count of history entries
    pub fn count(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransferDirection;
    use std::path::PathBuf;

    fn job(name: &str) -> TransferJob {
        TransferJob::new(
            TransferDirection::Upload,
            PathBuf::from(name),
            name.to_string(),
        )
    }

    #[test]
    fn test_max_history_constant() {
        assert_eq!(MAX_HISTORY_ENTRIES, 100);
    }

    #[test]
    fn test_most_recent_first_and_capped() {
        let history = TransferHistory::new();
        for i in 0..(MAX_HISTORY_ENTRIES + 5) {
            history.add(job(&format!("file-{}", i)));
        }
        assert_eq!(history.count(), MAX_HISTORY_ENTRIES);
        assert_eq!(history.list()[0].remote_name, "file-104");

        let first = history.list()[0].clone();
        assert_eq!(history.get(&first.id).unwrap().remote_name, "file-104");

        history.clear();
        assert_eq!(history.count(), 0);
        assert!(history.get(&first.id).is_none());
    }
}
