use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use contabilidade_pro::commands;
use contabilidade_pro::config;
use contabilidade_pro::db::Database;
use contabilidade_pro::error::CommandError;
use contabilidade_pro::services::monitor;
use contabilidade_pro::services::notifications::NotificationEvent;
use contabilidade_pro::services::state::AppState;
use contabilidade_pro::services::storage::DocumentStorage;

#[derive(Deserialize)]
struct Request {
    #[serde(default)]
    id: Value,
    command: String,
    #[serde(default)]
    args: Value,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Outgoing {
    Response {
        id: Value,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<CommandError>,
    },
    Event {
        event: &'static str,
        payload: Value,
    },
}

impl Outgoing {
    fn response(id: Value, result: Result<Value, CommandError>) -> Self {
        match result {
            Ok(value) => Outgoing::Response {
                id,
                ok: true,
                result: Some(value),
                error: None,
            },
            Err(err) => Outgoing::Response {
                id,
                ok: false,
                result: None,
                error: Some(err),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let data_dir = config::data_dir()?;
    std::fs::create_dir_all(&data_dir).with_context(|| format!("Create data dir {}", data_dir.display()))?;

    let db = Database::new(data_dir.join("contabilidade.sqlite"))?;
    config::ensure_signing_key(&db)?;
    let settings = config::load_settings(&db)?;
    let storage = DocumentStorage::new(data_dir.join("storage"));
    let state = Arc::new(AppState::new(db, settings, storage)?);
    tracing::info!(data_dir = %data_dir.display(), "host ready");

    let _monitor = monitor::spawn(state.clone());

    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            let mut line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(err) => {
                    tracing::error!(error = %err, "unserializable bridge message");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let _ = tx.send(Outgoing::response(Value::Null, Err(CommandError::from(err))));
                continue;
            }
        };

        tracing::debug!(command = %request.command, "bridge request");
        let result = commands::dispatch(&state, &request.command, request.args).await;
        if request.command == "login" && result.is_ok() {
            forward_notifications(&state, tx.clone());
        }
        if let Err(err) = &result {
            tracing::warn!(command = %request.command, error = %err, "command failed");
        }
        let _ = tx.send(Outgoing::response(request.id, result));
    }

    // Ending the session closes its channel, which stops the forwarder.
    state.logout()?;
    drop(tx);
    let _ = writer.await;
    tracing::info!("stdin closed, host exiting");
    Ok(())
}

/// Pushes every notification of the current session to the UI until the
/// session is dropped.
fn forward_notifications(state: &AppState, tx: mpsc::UnboundedSender<Outgoing>) {
    let Ok(session) = state.session() else {
        return;
    };
    let mut subscription = session.subscribe();
    let user_id = session.user_id.clone();
    drop(session);

    tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            let message = match event {
                NotificationEvent::Delivered(notification) => match serde_json::to_value(&notification) {
                    Ok(payload) => Outgoing::Event {
                        event: "notification",
                        payload,
                    },
                    Err(err) => {
                        tracing::error!(error = %err, "unserializable notification");
                        continue;
                    }
                },
                NotificationEvent::Missed(count) => {
                    tracing::warn!(user = %user_id, missed = count, "notification subscriber lagged");
                    Outgoing::Event {
                        event: "notifications_missed",
                        payload: json!({ "missed": count }),
                    }
                }
            };
            if tx.send(message).is_err() {
                break;
            }
        }
        tracing::debug!(user = %user_id, "notification forwarder stopped");
    });
}
