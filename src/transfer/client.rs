use std::{path::PathBuf, sync::Arc};

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use thiserror::Error;
use tokio_util::{
    io::{ReaderStream, SyncIoBridge},
    sync::CancellationToken,
};
use uuid::Uuid;

use super::{archive, Service};
use crate::discovery::model::Peer;
use crate::transfer::model::{
    ContentType, Progress, Transfer, TransferAskResponse, TransferStatus, TransferType,
    TransferUploadResponse,
};
use crate::transfer::progress::ProgressReader;

type Payload = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
enum SendError {
    #[error("transfer canceled")]
    Canceled,
    #[error("{0}")]
    Failed(String),
}

impl Service {
    pub fn send_files(self: &Arc<Self>, target: Peer, target_ip: String, paths: Vec<PathBuf>) {
        for path in paths {
            self.send_file(target.clone(), target_ip.clone(), path);
        }
    }

    pub fn send_file(self: &Arc<Self>, target: Peer, target_ip: String, path: PathBuf) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = Uuid::new_v4().to_string();
            let token = CancellationToken::new();
            service.cancel_handles.insert(task_id.clone(), token.clone());

            let file = match tokio::fs::File::open(&path).await {
                Ok(file) => file,
                Err(err) => {
                    log::error!("failed to open file {}: {err}", path.display());
                    service.finish_send(&task_id);
                    return;
                }
            };
            let size = match file.metadata().await {
                Ok(metadata) => metadata.len() as i64,
                Err(err) => {
                    log::error!("failed to stat file {}: {err}", path.display());
                    service.finish_send(&task_id);
                    return;
                }
            };

            let task = Transfer::new(&task_id, service.discovery.sender_identity(&target_ip))
                .with_file_name(basename(&path))
                .with_file_size(size)
                .with_type(TransferType::Send)
                .with_content_type(ContentType::File);
            service.store_transfer(task.clone());

            service
                .run_send(&token, &target, &target_ip, &task, Box::new(file))
                .await;
            service.finish_send(&task_id);
        });
    }

    pub fn send_folder(self: &Arc<Self>, target: Peer, target_ip: String, path: PathBuf) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = Uuid::new_v4().to_string();
            let token = CancellationToken::new();
            service.cancel_handles.insert(task_id.clone(), token.clone());

            let size = {
                let src = path.clone();
                match tokio::task::spawn_blocking(move || archive::calculate_tar_size(&src)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        log::error!("failed to size folder {}: {err}", path.display());
                        service.finish_send(&task_id);
                        return;
                    }
                    Err(err) => {
                        log::error!("folder sizing task failed: {err}");
                        service.finish_send(&task_id);
                        return;
                    }
                }
            };

            let task = Transfer::new(&task_id, service.discovery.sender_identity(&target_ip))
                .with_file_name(basename(&path))
                .with_file_size(size)
                .with_type(TransferType::Send)
                .with_content_type(ContentType::Folder);
            service.store_transfer(task.clone());

            // The tar stream is produced lazily into a pipe so nothing is
            // archived before the receiver accepts.
            let (reader, writer) = tokio::io::duplex(64 * 1024);
            let bridge = SyncIoBridge::new(writer);
            let src = path.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(err) = archive::stream_folder_to_tar(bridge, &src) {
                    log::error!("failed to stream folder {}: {err}", src.display());
                }
            });

            service
                .run_send(&token, &target, &target_ip, &task, Box::new(reader))
                .await;
            service.finish_send(&task_id);
        });
    }

    pub fn send_text(self: &Arc<Self>, target: Peer, target_ip: String, text: String) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let task_id = Uuid::new_v4().to_string();
            let token = CancellationToken::new();
            service.cancel_handles.insert(task_id.clone(), token.clone());

            let bytes = text.into_bytes();
            let task = Transfer::new(&task_id, service.discovery.sender_identity(&target_ip))
                .with_file_size(bytes.len() as i64)
                .with_type(TransferType::Send)
                .with_content_type(ContentType::Text);
            service.store_transfer(task.clone());

            let payload = std::io::Cursor::new(bytes);
            service
                .run_send(&token, &target, &target_ip, &task, Box::new(payload))
                .await;
            service.finish_send(&task_id);
        });
    }

    fn finish_send(&self, task_id: &str) {
        self.cancel_handles.remove(task_id);
        self.notify_list_update();
    }

    async fn run_send(
        self: &Arc<Self>,
        token: &CancellationToken,
        target: &Peer,
        target_ip: &str,
        task: &Transfer,
        payload: Payload,
    ) {
        match self.ask(token, target, target_ip, task).await {
            Err(SendError::Canceled) => {
                self.update_transfer(&task.id, |t| t.status = TransferStatus::Canceled);
            }
            Err(SendError::Failed(message)) => {
                self.update_transfer(&task.id, |t| {
                    t.status = TransferStatus::Error;
                    t.error_msg = message;
                });
            }
            Ok(ask) if !ask.accepted => {
                self.update_transfer(&task.id, |t| t.status = TransferStatus::Rejected);
            }
            Ok(ask) => {
                self.upload(token, ask, target, target_ip, &task.id, task.file_size, payload)
                    .await;
            }
        }
    }

    /// Offer the transfer and wait for the receiver's decision. There is no
    /// timeout here: the receiver may sit on the decision until its user
    /// answers, and only our cancel handle can abort the wait.
    async fn ask(
        &self,
        token: &CancellationToken,
        target: &Peer,
        target_ip: &str,
        task: &Transfer,
    ) -> Result<TransferAskResponse, SendError> {
        if token.is_cancelled() {
            return Err(SendError::Canceled);
        }
        let url = format!("https://{}:{}/transfer/ask", target_ip, target.port);
        let send = self.http.post(&url).json(task).send();
        let response = tokio::select! {
            _ = token.cancelled() => return Err(SendError::Canceled),
            response = send => response
                .map_err(|err| SendError::Failed(format!("Failed to connect to receiver: {err}")))?,
        };

        let status = response.status();
        let ask: TransferAskResponse = response
            .json()
            .await
            .map_err(|err| SendError::Failed(format!("Invalid ask response: {err}")))?;
        if !status.is_success() {
            return Err(SendError::Failed(ask.message.unwrap_or_else(|| {
                format!("receiver answered with status {status}")
            })));
        }
        Ok(ask)
    }

    async fn upload(
        self: &Arc<Self>,
        token: &CancellationToken,
        ask: TransferAskResponse,
        target: &Peer,
        target_ip: &str,
        task_id: &str,
        file_size: i64,
        payload: Payload,
    ) {
        let url = format!(
            "https://{}:{}/transfer/upload/{}?token={}",
            target_ip,
            target.port,
            task_id,
            ask.token.unwrap_or_default()
        );

        let progress_service = Arc::clone(self);
        let progress_id = task_id.to_string();
        let reader = ProgressReader::new(payload, file_size, move |current, total, speed| {
            progress_service.update_transfer(&progress_id, |t| {
                t.progress = Progress {
                    current,
                    total,
                    speed,
                };
                t.status = TransferStatus::Active;
            });
        });

        let send = self
            .http
            .put(&url)
            .header(CONTENT_LENGTH, file_size)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::wrap_stream(ReaderStream::new(reader)))
            .send();
        let response = tokio::select! {
            _ = token.cancelled() => {
                self.update_transfer(task_id, |t| t.status = TransferStatus::Canceled);
                return;
            }
            response = send => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.update_transfer(task_id, |t| {
                    t.status = TransferStatus::Error;
                    t.error_msg = format!("Failed to upload: {err}");
                });
                log::error!("failed to upload to {url}: {err}");
                return;
            }
        };

        let status = response.status();
        let upload: TransferUploadResponse = match response.json().await {
            Ok(upload) => upload,
            Err(err) => {
                self.update_transfer(task_id, |t| {
                    t.status = TransferStatus::Error;
                    t.error_msg = format!("Invalid upload response: {err}");
                });
                return;
            }
        };

        if !status.is_success() {
            self.update_transfer(task_id, |t| {
                t.status = TransferStatus::Error;
                t.error_msg = upload.message;
            });
            return;
        }
        if upload.status == TransferStatus::Canceled {
            // receiver-side user backed out mid-stream
            self.update_transfer(task_id, |t| {
                t.status = TransferStatus::Canceled;
                t.error_msg = upload.message;
            });
            return;
        }
        self.update_transfer(task_id, |t| t.status = TransferStatus::Completed);
    }
}

fn basename(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
