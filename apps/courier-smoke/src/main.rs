mod config;
mod logging;

use courier_core::{ChatCommand, ChatEvent};
use courier_stomp::spawn_runtime;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::config::SmokeConfig;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            eprintln!("Required: COURIER_TOKEN and COURIER_USER");
            std::process::exit(2);
        }
    };

    let handle = match spawn_runtime(config.runtime.clone()) {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "failed to start chat runtime");
            std::process::exit(1);
        }
    };
    let mut events = handle.subscribe();

    info!(
        broker = %config.runtime.broker_url,
        user = %config.runtime.local_user,
        "starting smoke session"
    );
    if let Err(err) = handle.send(ChatCommand::Connect).await {
        error!(error = %err, "runtime rejected connect");
        std::process::exit(1);
    }

    let mut pending_text = config.send_text.clone();
    let mut session_ready = false;
    let mut history_loaded = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; disconnecting");
                break;
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                match &event {
                    ChatEvent::SessionReady { principal } => {
                        info!(%principal, "session ready");
                        session_ready = true;
                        if let Some(counterpart) = &config.counterpart
                            && !history_loaded
                        {
                            let _ = handle
                                .send(ChatCommand::SelectConversation {
                                    counterpart: counterpart.clone(),
                                })
                                .await;
                        }
                    }
                    ChatEvent::TimelineReset { counterpart, items, loading: false, history_error } => {
                        info!(%counterpart, len = items.len(), ?history_error, "conversation loaded");
                        history_loaded = true;
                    }
                    ChatEvent::FatalError { code, message, recoverable } => {
                        warn!(%code, %message, recoverable, "runtime error");
                        if !recoverable {
                            break;
                        }
                    }
                    other => debug!(event = ?other, "chat event"),
                }

                if session_ready
                    && history_loaded
                    && let (Some(content), Some(recipient)) =
                        (pending_text.take(), config.counterpart.clone())
                {
                    info!(%recipient, "sending smoke message");
                    let _ = handle.send(ChatCommand::SendText { recipient, content }).await;
                }
            }
        }
    }

    let _ = handle.send(ChatCommand::Disconnect).await;
    handle.connection().disconnect().await;
    info!("smoke session finished");
}
