use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    body::{Body, Bytes},
    extract::{Path as UrlPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{post, put},
    Json, Router,
};
use futures::TryStreamExt;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::{
    io::{StreamReader, SyncIoBridge},
    sync::CancellationToken,
};
use uuid::Uuid;

use super::{archive, Service};
use crate::transfer::model::{
    ContentType, Decision, Progress, Transfer, TransferAskResponse, TransferStatus, TransferType,
    TransferUploadResponse,
};
use crate::transfer::progress::{CancelReader, FailureFlag, ProgressReader, UploadFailure};

/// Upper bound on an inline text payload; everything larger should be sent as
/// a file.
const MAX_TEXT_BYTES: i64 = 64 * 1024 * 1024;

pub(crate) fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/transfer/ask", post(handle_ask))
        .route("/transfer/upload/:id", put(handle_upload))
        .with_state(service)
}

/// Marks the transfer canceled if the sender drops the connection while the
/// handler is parked on an await.
struct DisconnectGuard {
    service: Arc<Service>,
    id: String,
    armed: bool,
}

impl DisconnectGuard {
    fn new(service: Arc<Service>, id: String) -> Self {
        Self {
            service,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::info!("sender disconnected, canceling transfer {}", self.id);
        self.service.decisions.remove(&self.id);
        self.service.cancel_handles.remove(&self.id);
        self.service.update_transfer(&self.id, |transfer| {
            if !transfer.status.is_terminal() {
                transfer.status = TransferStatus::Canceled;
                transfer.error_msg = "Sender disconnected".to_string();
            }
        });
    }
}

fn ask_reply(status: StatusCode, body: TransferAskResponse) -> Response {
    (status, Json(body)).into_response()
}

async fn handle_ask(State(service): State<Arc<Service>>, body: Bytes) -> Response {
    let mut task: Transfer = match serde_json::from_slice(&body) {
        Ok(task) => task,
        Err(_) => {
            return ask_reply(
                StatusCode::BAD_REQUEST,
                TransferAskResponse {
                    id: String::new(),
                    accepted: false,
                    token: None,
                    message: Some("Invalid request".to_string()),
                },
            );
        }
    };
    if task.id.is_empty() || task.sender.id.is_empty() {
        return ask_reply(
            StatusCode::BAD_REQUEST,
            TransferAskResponse {
                id: task.id,
                accepted: false,
                token: None,
                message: Some("Invalid request".to_string()),
            },
        );
    }
    // A duplicate ask is a network retry for a session we already track.
    if service.get_transfer(&task.id).is_some() {
        return StatusCode::OK.into_response();
    }

    task.transfer_type = TransferType::Receive;
    task.status = TransferStatus::Pending;
    // Trust state comes from our own presence table, never from the wire.
    task.sender.trust_mismatch = service
        .discovery
        .get_peer_by_id(&task.sender.id)
        .map(|peer| peer.trust_mismatch)
        .unwrap_or(false);

    let task_id = task.id.clone();
    let sender_name = task.sender.name.clone();
    let file_name = task.file_name.clone();
    let auto_accept = service.should_auto_accept(&task.sender.id, task.sender.trust_mismatch);

    let (tx, mut rx) = mpsc::channel::<Decision>(1);
    service.decisions.insert(task_id.clone(), tx.clone());
    service.store_transfer(task);

    if auto_accept {
        let _ = tx.try_send(Decision {
            id: task_id.clone(),
            accepted: true,
            save_path: Some(service.config.save_path()),
        });
    } else {
        service.notifier.notify(
            "File Transfer Request",
            &format!("{sender_name} wants to transfer {file_name}"),
        );
    }
    drop(tx);

    let mut guard = DisconnectGuard::new(Arc::clone(&service), task_id.clone());
    let decision = rx.recv().await;
    guard.disarm();
    service.decisions.remove(&task_id);

    match decision {
        Some(decision) if decision.accepted => {
            let token = Uuid::new_v4().to_string();
            let save_path = decision
                .save_path
                .unwrap_or_else(|| service.config.save_path());
            let response_token = token.clone();
            service.update_transfer(&task_id, |transfer| {
                transfer.status = TransferStatus::Accepted;
                transfer.save_path = save_path.to_string_lossy().into_owned();
                transfer.token = token;
            });
            ask_reply(
                StatusCode::OK,
                TransferAskResponse {
                    id: task_id,
                    accepted: true,
                    token: Some(response_token),
                    message: None,
                },
            )
        }
        Some(_) => {
            service.update_transfer(&task_id, |transfer| {
                transfer.status = TransferStatus::Rejected;
            });
            ask_reply(
                StatusCode::OK,
                TransferAskResponse {
                    id: task_id,
                    accepted: false,
                    token: None,
                    message: Some("Transfer rejected".to_string()),
                },
            )
        }
        None => {
            service.update_transfer(&task_id, |transfer| {
                transfer.status = TransferStatus::Canceled;
            });
            StatusCode::OK.into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct UploadQuery {
    #[serde(default)]
    token: String,
}

fn upload_reply(status: StatusCode, id: &str, message: &str, transfer: TransferStatus) -> Response {
    (
        status,
        Json(TransferUploadResponse {
            id: id.to_string(),
            message: message.to_string(),
            status: transfer,
        }),
    )
        .into_response()
}

async fn handle_upload(
    State(service): State<Arc<Service>>,
    UrlPath(id): UrlPath<String>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Response {
    if id.is_empty() || query.token.is_empty() {
        return upload_reply(
            StatusCode::UNAUTHORIZED,
            &id,
            "Invalid request: missing id or token",
            TransferStatus::Error,
        );
    }
    let Some(task) = service.get_transfer(&id) else {
        return upload_reply(
            StatusCode::UNAUTHORIZED,
            &id,
            "Invalid request: unknown transfer",
            TransferStatus::Error,
        );
    };
    if task.token != query.token {
        return upload_reply(
            StatusCode::UNAUTHORIZED,
            &id,
            "Token mismatch",
            TransferStatus::Error,
        );
    }
    if task.status != TransferStatus::Accepted {
        return upload_reply(
            StatusCode::FORBIDDEN,
            &id,
            "Invalid transfer status",
            TransferStatus::Error,
        );
    }

    let cancel = CancellationToken::new();
    service.cancel_handles.insert(id.clone(), cancel.clone());
    let mut guard = DisconnectGuard::new(Arc::clone(&service), id.clone());

    service.update_transfer(&id, |transfer| transfer.status = TransferStatus::Active);
    let save_path = if task.save_path.is_empty() {
        service.config.save_path()
    } else {
        PathBuf::from(&task.save_path)
    };

    let flag = FailureFlag::new();
    let stream = body.into_data_stream().map_err(io::Error::other);
    let cancel_reader = CancelReader::new(StreamReader::new(stream), cancel, flag.clone());
    let progress_service = Arc::clone(&service);
    let progress_id = id.clone();
    let reader = ProgressReader::new(
        cancel_reader,
        task.file_size,
        move |current, total, speed| {
            progress_service.update_transfer(&progress_id, |transfer| {
                transfer.progress = Progress {
                    current,
                    total,
                    speed,
                };
                transfer.status = TransferStatus::Active;
            });
        },
    );

    let response = match task.content_type {
        ContentType::File => receive_file(&service, &task, &save_path, reader, &flag).await,
        ContentType::Text => receive_text(&service, &task, reader, &flag).await,
        ContentType::Folder => receive_folder(&service, &task, &save_path, reader, &flag).await,
    };
    guard.disarm();
    service.cancel_handles.remove(&id);

    // A `None` outcome means the sender is gone; the connection cannot carry
    // a reply anyway.
    response.unwrap_or_else(|| StatusCode::OK.into_response())
}

async fn receive_file(
    service: &Arc<Service>,
    task: &Transfer,
    save_path: &Path,
    mut reader: impl AsyncRead + Unpin,
    flag: &FailureFlag,
) -> Option<Response> {
    let dest = next_available_file_path(save_path, &task.file_name);
    let mut file = match tokio::fs::File::create(&dest).await {
        Ok(file) => file,
        Err(err) => {
            log::error!("failed to create file {}: {err}", dest.display());
            service.update_transfer(&task.id, |transfer| {
                transfer.status = TransferStatus::Error;
                transfer.error_msg = format!("receiver failed to create file: {err}");
            });
            return Some(upload_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                &task.id,
                "Receiver failed to create file",
                TransferStatus::Error,
            ));
        }
    };

    match tokio::io::copy(&mut reader, &mut file).await {
        Ok(_) => {
            drop(file);
            service.update_transfer(&task.id, |transfer| {
                transfer.status = TransferStatus::Completed;
            });
            Some(upload_reply(
                StatusCode::OK,
                &task.id,
                "File received successfully",
                TransferStatus::Completed,
            ))
        }
        Err(err) => {
            drop(file);
            let _ = tokio::fs::remove_file(&dest).await;
            classify_failure(service, task, flag, err)
        }
    }
}

async fn receive_text(
    service: &Arc<Service>,
    task: &Transfer,
    reader: impl AsyncRead + Unpin,
    flag: &FailureFlag,
) -> Option<Response> {
    if task.file_size > MAX_TEXT_BYTES {
        service.update_transfer(&task.id, |transfer| {
            transfer.status = TransferStatus::Error;
            transfer.error_msg = "text payload exceeds limit".to_string();
        });
        return Some(upload_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            &task.id,
            "Text payload exceeds limit",
            TransferStatus::Error,
        ));
    }

    let mut buf = Vec::new();
    let mut limited = reader.take(MAX_TEXT_BYTES as u64 + 1);
    match limited.read_to_end(&mut buf).await {
        Ok(_) => {
            if buf.len() as i64 > MAX_TEXT_BYTES {
                service.update_transfer(&task.id, |transfer| {
                    transfer.status = TransferStatus::Error;
                    transfer.error_msg = "text payload exceeds limit".to_string();
                });
                return Some(upload_reply(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &task.id,
                    "Text payload exceeds limit",
                    TransferStatus::Error,
                ));
            }
            let text = String::from_utf8_lossy(&buf).into_owned();
            service.update_transfer(&task.id, |transfer| {
                transfer.text = text;
                transfer.status = TransferStatus::Completed;
            });
            Some(upload_reply(
                StatusCode::OK,
                &task.id,
                "Text received successfully",
                TransferStatus::Completed,
            ))
        }
        Err(err) => classify_failure(service, task, flag, err),
    }
}

async fn receive_folder(
    service: &Arc<Service>,
    task: &Transfer,
    save_path: &Path,
    reader: impl AsyncRead + Send + Unpin + 'static,
    flag: &FailureFlag,
) -> Option<Response> {
    let dest = next_available_dir_path(save_path, &task.file_name);
    if let Err(err) = archive::create_dir_all_0755(&dest) {
        log::error!("failed to create folder {}: {err}", dest.display());
        service.update_transfer(&task.id, |transfer| {
            transfer.status = TransferStatus::Error;
            transfer.error_msg = format!("receiver failed to create folder: {err}");
        });
        return Some(upload_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            &task.id,
            "Receiver failed to create folder",
            TransferStatus::Error,
        ));
    }

    let bridge = SyncIoBridge::new(reader);
    let extract_dest = dest.clone();
    let result =
        tokio::task::spawn_blocking(move || archive::extract_tar(bridge, &extract_dest)).await;

    match result {
        Ok(Ok(())) => {
            let total = task.file_size;
            service.update_transfer(&task.id, |transfer| {
                transfer.progress.current = total;
                transfer.progress.total = total;
                transfer.status = TransferStatus::Completed;
            });
            Some(upload_reply(
                StatusCode::OK,
                &task.id,
                "Folder received successfully",
                TransferStatus::Completed,
            ))
        }
        Ok(Err(err)) => classify_failure(service, task, flag, err),
        Err(err) => {
            service.update_transfer(&task.id, |transfer| {
                transfer.status = TransferStatus::Error;
                transfer.error_msg = format!("extraction task failed: {err}");
            });
            Some(upload_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                &task.id,
                "Transfer failed",
                TransferStatus::Error,
            ))
        }
    }
}

/// Map a failed copy to its outcome: receiver-side cancel answers 200 with
/// `canceled`, a sender disconnect stays silent (returns `None`), anything
/// else is a local I/O failure answered with 500.
fn classify_failure(
    service: &Arc<Service>,
    task: &Transfer,
    flag: &FailureFlag,
    err: io::Error,
) -> Option<Response> {
    match flag.get() {
        UploadFailure::Canceled => {
            log::info!("user canceled transfer {}", task.id);
            service.update_transfer(&task.id, |transfer| {
                transfer.status = TransferStatus::Canceled;
                transfer.error_msg = "User canceled transfer".to_string();
            });
            Some(upload_reply(
                StatusCode::OK,
                &task.id,
                "File transfer canceled",
                TransferStatus::Canceled,
            ))
        }
        UploadFailure::Disconnected => {
            log::info!("sender disconnected during transfer {}: {err}", task.id);
            service.update_transfer(&task.id, |transfer| {
                transfer.status = TransferStatus::Canceled;
                transfer.error_msg = "Sender disconnected".to_string();
            });
            None
        }
        UploadFailure::None => {
            log::error!("failed to write transfer {}: {err}", task.id);
            service.update_transfer(&task.id, |transfer| {
                transfer.status = TransferStatus::Error;
                transfer.error_msg = format!("failed to write: {err}");
            });
            Some(upload_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                &task.id,
                "Failed to write file",
                TransferStatus::Error,
            ))
        }
    }
}

/// `doc.pdf` collides into `doc (1).pdf`, `doc (2).pdf`, ...
fn next_available_file_path(dir: &Path, file_name: &str) -> PathBuf {
    let mut candidate = dir.join(file_name);
    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let extension = name.extension().map(|ext| ext.to_string_lossy().into_owned());
    let mut counter = 1;
    while candidate.exists() {
        let next = match &extension {
            Some(ext) => format!("{stem} ({counter}).{ext}"),
            None => format!("{stem} ({counter})"),
        };
        candidate = dir.join(next);
        counter += 1;
    }
    candidate
}

/// Folders have no extension handling: `proj` collides into `proj (1)`.
fn next_available_dir_path(dir: &Path, name: &str) -> PathBuf {
    let mut candidate = dir.join(name);
    let mut counter = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{name} ({counter})"));
        counter += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn file_collisions_count_up_before_the_extension() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("doc.pdf"), b"first").unwrap();
        assert_eq!(
            next_available_file_path(tmp.path(), "doc.pdf"),
            tmp.path().join("doc (1).pdf")
        );
        fs::write(tmp.path().join("doc (1).pdf"), b"second").unwrap();
        assert_eq!(
            next_available_file_path(tmp.path(), "doc.pdf"),
            tmp.path().join("doc (2).pdf")
        );
    }

    #[test]
    fn extensionless_names_count_up_at_the_end() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("Makefile"), b"all:").unwrap();
        assert_eq!(
            next_available_file_path(tmp.path(), "Makefile"),
            tmp.path().join("Makefile (1)")
        );
    }

    #[test]
    fn folder_collisions_ignore_dots_in_the_name() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("my.folder")).unwrap();
        assert_eq!(
            next_available_dir_path(tmp.path(), "my.folder"),
            tmp.path().join("my.folder (1)")
        );
    }

    #[test]
    fn fresh_names_pass_through_unchanged() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            next_available_file_path(tmp.path(), "doc.pdf"),
            tmp.path().join("doc.pdf")
        );
        assert_eq!(
            next_available_dir_path(tmp.path(), "proj"),
            tmp.path().join("proj")
        );
    }
}
