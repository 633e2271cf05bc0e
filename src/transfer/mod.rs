pub mod archive;
pub mod model;
pub mod progress;

mod client;
mod history;
mod server;

use std::{
    fs,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use dashmap::DashMap;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto::Builder as HttpConnBuilder,
    service::TowerToHyperService,
};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ConfigStore,
    discovery,
    host::{EventBus, HostEvent, Notifier},
    security::cert,
};
use model::{Decision, Transfer, TransferStatus};

pub const TRANSFER_PORT: u16 = 9989;

/// Transfer engine: TLS HTTP server for inbound sessions, HTTP client for
/// outbound ones, plus the process-local transfer table.
pub struct Service {
    config: Arc<ConfigStore>,
    discovery: Arc<discovery::Service>,
    events: EventBus,
    notifier: Arc<dyn Notifier>,
    port: u16,
    transfers: DashMap<String, Transfer>,
    cancel_handles: DashMap<String, CancellationToken>,
    /// Pending ask decisions, keyed by transfer id. The ask handler is the
    /// sole reader of each channel.
    decisions: DashMap<String, mpsc::Sender<Decision>>,
    http: reqwest::Client,
}

impl Service {
    pub fn new(
        config: Arc<ConfigStore>,
        discovery: Arc<discovery::Service>,
        events: EventBus,
        notifier: Arc<dyn Notifier>,
        port: u16,
    ) -> Result<Arc<Self>> {
        // Peer certificates are self-signed; authenticity comes from the
        // signed presence channel, not from PKI. No overall timeout because
        // transfers can be arbitrarily long.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build transfer http client")?;
        Ok(Arc::new(Self {
            config,
            discovery,
            events,
            notifier,
            port,
            transfers: DashMap::new(),
            cancel_handles: DashMap::new(),
            decisions: DashMap::new(),
            http,
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = service.run_server().await {
                log::error!("transfer service error: {err:#}");
            }
        });
    }

    async fn run_server(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("failed to bind transfer port {}", self.port))?;
        log::info!("transfer service listening (https) on :{}", self.port);
        self.serve_with_listener(listener).await
    }

    /// Accept loop over an already-bound listener; split out so tests can
    /// serve on an ephemeral port.
    pub async fn serve_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let cert_path = self.config.config_dir().join("server.crt");
        let key_path = self.config.config_dir().join("server.key");
        {
            let (cert_path, key_path) = (cert_path.clone(), key_path.clone());
            tokio::task::spawn_blocking(move || cert::ensure_certificates(&cert_path, &key_path))
                .await
                .context("certificate provisioning task failed")??;
        }

        let tls_config = load_tls_config(&cert_path, &key_path)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let app = server::router(Arc::clone(&self));

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    log::error!("transfer accept failed: {err}");
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let app = app.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(tls) => tls,
                    Err(err) => {
                        log::debug!("tls handshake with {remote} failed: {err}");
                        return;
                    }
                };
                let service = TowerToHyperService::new(app);
                if let Err(err) = HttpConnBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .await
                {
                    log::debug!("connection from {remote} ended: {err}");
                }
            });
        }
    }

    pub fn get_transfer_list(&self) -> Vec<Transfer> {
        self.transfers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_transfer(&self, id: &str) -> Option<Transfer> {
        self.transfers.get(id).map(|entry| entry.value().clone())
    }

    pub(crate) fn store_transfer(&self, transfer: Transfer) {
        self.transfers.insert(transfer.id.clone(), transfer);
        self.notify_list_update();
    }

    pub(crate) fn update_transfer(&self, id: &str, mutate: impl FnOnce(&mut Transfer)) {
        if let Some(mut entry) = self.transfers.get_mut(id) {
            mutate(entry.value_mut());
        }
        self.notify_list_update();
    }

    pub(crate) fn notify_list_update(&self) {
        self.events.emit(HostEvent::TransferRefreshList);
    }

    /// Fire the cancel handle for a transfer, if one is registered, and mark
    /// the record canceled. The in-flight task observes the handle and winds
    /// itself down.
    pub fn cancel_transfer(&self, id: &str) {
        if let Some((_, token)) = self.cancel_handles.remove(id) {
            token.cancel();
            self.update_transfer(id, |transfer| transfer.status = TransferStatus::Canceled);
        }
    }

    /// Answer a pending inbound ask. Returns false when no such request is
    /// waiting.
    pub fn resolve_pending_request(
        &self,
        id: &str,
        accept: bool,
        save_path: Option<PathBuf>,
    ) -> bool {
        let Some(tx) = self.decisions.get(id).map(|entry| entry.value().clone()) else {
            return false;
        };
        tx.try_send(Decision {
            id: id.to_string(),
            accepted: accept,
            save_path,
        })
        .is_ok()
    }

    pub fn delete_transfer(&self, id: &str) {
        self.transfers.remove(id);
        self.notify_list_update();
    }

    /// An inbound ask skips the user when auto-accept is on, or when the
    /// sender is on the trust list and presence has not flagged a key
    /// mismatch for it.
    pub(crate) fn should_auto_accept(&self, sender_id: &str, trust_mismatch: bool) -> bool {
        self.config.auto_accept() || (self.config.is_trusted(sender_id) && !trust_mismatch)
    }

    /// Drop every transfer that already reached a terminal status.
    pub fn clean_transfer_list(&self) {
        self.transfers
            .retain(|_, transfer| !transfer.status.is_terminal());
        self.notify_list_update();
    }
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let mut cert_reader = BufReader::new(
        fs::File::open(cert_path)
            .with_context(|| format!("failed to open {}", cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse server certificate")?;
    let mut key_reader = BufReader::new(
        fs::File::open(key_path)
            .with_context(|| format!("failed to open {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .context("failed to parse server key")?
        .context("server key file contains no key")?;
    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build tls server config")
}
