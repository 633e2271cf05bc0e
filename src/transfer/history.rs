use std::fs;

use anyhow::{Context, Result};

use super::Service;
use crate::transfer::model::{Transfer, TransferStatus};

const HISTORY_FILE: &str = "history.json";

impl Service {
    /// Persist the transfer list, if history is enabled. Transfers still in
    /// flight are recorded as canceled so they never show up stuck after a
    /// restart. Written via temp file + rename.
    pub fn save_history(&self) {
        if !self.config.save_history() {
            return;
        }
        let mut transfers = self.get_transfer_list();
        for transfer in &mut transfers {
            if !transfer.status.is_terminal() {
                transfer.status = TransferStatus::Canceled;
            }
        }
        if let Err(err) = self.write_history(&transfers) {
            log::error!("failed to write history: {err:#}");
        }
    }

    fn write_history(&self, transfers: &[Transfer]) -> Result<()> {
        let payload = serde_json::to_vec(transfers).context("failed to serialise history")?;
        let path = self.config.config_dir().join(HISTORY_FILE);
        let tmp_path = path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            file.write_all(&payload)
                .with_context(|| format!("failed to write {}", tmp_path.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to flush {}", tmp_path.display()))?;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o644));
        }
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Load persisted history into the transfer table. Anything non-terminal
    /// in the file is treated as canceled.
    pub fn load_history(&self) {
        let path = self.config.config_dir().join(HISTORY_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return,
        };
        let history: Vec<Transfer> = match serde_json::from_str(&contents) {
            Ok(history) => history,
            Err(err) => {
                log::error!("failed to parse {}: {err}", path.display());
                return;
            }
        };
        for mut transfer in history {
            if !transfer.status.is_terminal() {
                transfer.status = TransferStatus::Canceled;
            }
            self.transfers.insert(transfer.id.clone(), transfer);
        }
        self.notify_list_update();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::{
        config::ConfigStore,
        discovery,
        host::{EventBus, LogNotifier},
        transfer::{
            model::{ContentType, Transfer, TransferStatus, TransferType},
            Service, TRANSFER_PORT,
        },
    };

    fn service_in(dir: &std::path::Path) -> Arc<Service> {
        let config = Arc::new(ConfigStore::load_from(dir).unwrap());
        let events = EventBus::new();
        let discovery = discovery::Service::new(Arc::clone(&config), events.clone(), TRANSFER_PORT);
        Service::new(
            config,
            discovery,
            events,
            Arc::new(LogNotifier),
            TRANSFER_PORT,
        )
        .unwrap()
    }

    fn transfer_with(id: &str, status: TransferStatus) -> Transfer {
        let mut transfer = Transfer::new(id, Default::default())
            .with_file_name("notes.txt")
            .with_file_size(10)
            .with_type(TransferType::Receive)
            .with_content_type(ContentType::File);
        transfer.status = status;
        transfer
    }

    #[tokio::test]
    async fn history_roundtrips_and_cancels_in_flight_entries() {
        let tmp = TempDir::new().unwrap();
        let first = service_in(tmp.path());
        first.store_transfer(transfer_with("done", TransferStatus::Completed));
        first.store_transfer(transfer_with("stuck", TransferStatus::Active));
        first.store_transfer(transfer_with("waiting", TransferStatus::Pending));
        first.save_history();
        assert!(tmp.path().join("history.json").exists());
        assert!(!tmp.path().join("history.json.tmp").exists());

        let second = service_in(tmp.path());
        second.load_history();
        let list = second.get_transfer_list();
        assert_eq!(list.len(), 3);
        let status_of = |id: &str| {
            list.iter()
                .find(|transfer| transfer.id == id)
                .unwrap()
                .status
        };
        assert_eq!(status_of("done"), TransferStatus::Completed);
        assert_eq!(status_of("stuck"), TransferStatus::Canceled);
        assert_eq!(status_of("waiting"), TransferStatus::Canceled);
    }

    #[tokio::test]
    async fn history_is_skipped_when_disabled() {
        let tmp = TempDir::new().unwrap();
        let service = service_in(tmp.path());
        service.config.set_save_history(false);
        service.store_transfer(transfer_with("done", TransferStatus::Completed));
        service.save_history();
        assert!(!tmp.path().join("history.json").exists());
    }

    #[tokio::test]
    async fn corrupt_history_is_ignored() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("history.json"), "[{broken").unwrap();
        let service = service_in(tmp.path());
        service.load_history();
        assert!(service.get_transfer_list().is_empty());
    }

    #[tokio::test]
    async fn interrupted_save_leaves_previous_history_intact() {
        let tmp = TempDir::new().unwrap();
        let service = service_in(tmp.path());
        service.store_transfer(transfer_with("done", TransferStatus::Completed));
        service.save_history();
        let before = std::fs::read_to_string(tmp.path().join("history.json")).unwrap();

        // a crash between temp-write and rename leaves only the temp file
        std::fs::write(tmp.path().join("history.json.tmp"), "partial garbage").unwrap();
        let after = std::fs::read_to_string(tmp.path().join("history.json")).unwrap();
        assert_eq!(before, after);

        let fresh = service_in(tmp.path());
        fresh.load_history();
        assert_eq!(fresh.get_transfer_list().len(), 1);
    }
}
