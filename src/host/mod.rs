use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    config::ConfigStore,
    discovery,
    discovery::model::Peer,
    transfer,
    transfer::model::Transfer,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct DroppedFile {
    pub name: String,
    pub path: String,
}

/// Updates pushed to the UI layer. Listeners that miss `TransferRefreshList`
/// re-read the whole list, so lagging receivers lose nothing.
#[derive(Debug, Clone)]
pub enum HostEvent {
    PeersUpdate(Vec<Peer>),
    TransferRefreshList,
    FilesDropped {
        files: Vec<DroppedFile>,
        target: String,
    },
}

impl HostEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::PeersUpdate(_) => "peers:update",
            HostEvent::TransferRefreshList => "transfer:refreshList",
            HostEvent::FilesDropped { .. } => "files-dropped",
        }
    }
}

/// Broadcast fan-out for host events. Cheap to clone; emitting with no
/// subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: HostEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// OS notification popups live outside the core; the transfer engine only
/// needs a fire-and-forget hook.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Fallback notifier for headless runs.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        log::info!("notification: {title}: {body}");
    }
}

/// Thin facade the windowing host binds against. Everything here delegates to
/// the discovery and transfer services or the config store.
pub struct HostAdapter {
    config: Arc<ConfigStore>,
    discovery: Arc<discovery::Service>,
    transfer: Arc<transfer::Service>,
    events: EventBus,
}

impl HostAdapter {
    pub fn new(
        config: Arc<ConfigStore>,
        discovery: Arc<discovery::Service>,
        transfer: Arc<transfer::Service>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            discovery,
            transfer,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn get_peers(&self) -> Vec<Peer> {
        self.discovery.get_peers()
    }

    pub fn get_peer_by_id(&self, peer_id: &str) -> Option<Peer> {
        self.discovery.get_peer_by_id(peer_id)
    }

    pub fn get_self(&self) -> Peer {
        self.discovery.get_self()
    }

    pub fn send_file(&self, peer_id: &str, target_ip: &str, path: PathBuf) -> Result<()> {
        let target = self.resolve_peer(peer_id)?;
        self.transfer.send_file(target, target_ip.to_string(), path);
        Ok(())
    }

    pub fn send_files(&self, peer_id: &str, target_ip: &str, paths: Vec<PathBuf>) -> Result<()> {
        let target = self.resolve_peer(peer_id)?;
        self.transfer
            .send_files(target, target_ip.to_string(), paths);
        Ok(())
    }

    pub fn send_folder(&self, peer_id: &str, target_ip: &str, path: PathBuf) -> Result<()> {
        let target = self.resolve_peer(peer_id)?;
        self.transfer
            .send_folder(target, target_ip.to_string(), path);
        Ok(())
    }

    pub fn send_text(&self, peer_id: &str, target_ip: &str, text: String) -> Result<()> {
        let target = self.resolve_peer(peer_id)?;
        self.transfer.send_text(target, target_ip.to_string(), text);
        Ok(())
    }

    pub fn resolve_pending_request(
        &self,
        id: &str,
        accept: bool,
        save_path: Option<PathBuf>,
    ) -> bool {
        self.transfer.resolve_pending_request(id, accept, save_path)
    }

    pub fn cancel_transfer(&self, id: &str) {
        self.transfer.cancel_transfer(id);
    }

    pub fn get_transfer_list(&self) -> Vec<Transfer> {
        self.transfer.get_transfer_list()
    }

    pub fn delete_transfer(&self, id: &str) {
        self.transfer.delete_transfer(id);
    }

    pub fn clean_transfer_list(&self) {
        self.transfer.clean_transfer_list();
    }

    /// Accept a peer's key. Also lifts any sticky mismatch flag: an explicit
    /// re-trust supersedes the frozen presence state.
    pub fn add_trust(&self, peer_id: &str, public_key: &str) {
        self.config.add_trust(peer_id, public_key);
        self.discovery.clear_trust_mismatch(peer_id);
    }

    pub fn remove_trust(&self, peer_id: &str) {
        self.config.remove_trust(peer_id);
    }

    pub fn get_trusted(&self) -> std::collections::HashMap<String, String> {
        self.config.trusted()
    }

    /// Forwarded from the windowing host when the user drops files onto the
    /// window; the UI decides what to do with the target element id.
    pub fn files_dropped(&self, files: Vec<DroppedFile>, target: String) {
        self.events.emit(HostEvent::FilesDropped { files, target });
    }

    fn resolve_peer(&self, peer_id: &str) -> Result<Peer> {
        self.discovery
            .get_peer_by_id(peer_id)
            .ok_or_else(|| anyhow!("unknown peer {peer_id}"))
    }
}
