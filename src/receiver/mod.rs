//! Receive loop behind the `subflow` binary.
//!
//! Subscribes with at-least-once delivery and manual confirmation, prints
//! every message (or writes the next one to a file and finishes) and keeps
//! going until shutdown is requested or the client reports an error.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

use crate::client::Client;
use crate::config::Settings;
use crate::delivery::{Delivery, Payload};
use crate::utils::ClientError;

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("failed to write message to '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why the receive loop ended early.
#[derive(Debug)]
enum Outcome {
    Written(PathBuf),
    Failed(ReceiveError),
}

#[derive(Debug, Clone, Default)]
pub struct ReceiverOptions {
    pub file: Option<PathBuf>,
    pub verbose: bool,
    pub confirm_delay: Duration,
}

impl From<&Settings> for ReceiverOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            file: settings.subscription.file.clone(),
            verbose: settings.subscription.verbose,
            confirm_delay: settings.confirm_delay(),
        }
    }
}

/// Runs the receiver until `shutdown` resolves, a message has been written
/// to the configured file, or the client reports an error. The client is
/// always stopped before returning.
pub async fn run(
    client: &Client,
    settings: &Settings,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ReceiveError> {
    let mut outcomes = install_handlers(client, ReceiverOptions::from(settings));

    let result = receive(client, settings, &mut outcomes, shutdown).await;
    client.stop().await;
    result
}

async fn receive(
    client: &Client,
    settings: &Settings,
    outcomes: &mut UnboundedReceiver<Outcome>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ReceiveError> {
    start_with_retry(client, settings).await?;
    info!(
        "Connected to {} using client-id {}",
        client.service().unwrap_or_default(),
        client.id()
    );
    // errors from failed start attempts were already reported
    while outcomes.try_recv().is_ok() {}

    let sub = &settings.subscription;
    let subscription = client
        .subscribe(
            &sub.topic_pattern,
            sub.share_name.as_deref(),
            settings.subscribe_options(),
        )
        .await?;
    match subscription.share() {
        Some(share) => info!("Subscribed to share: {share}, pattern: {}", subscription.pattern()),
        None => info!("Subscribed to pattern: {}", subscription.pattern()),
    }

    tokio::select! {
        outcome = outcomes.recv() => match outcome {
            Some(Outcome::Written(path)) => {
                info!("Wrote message to {}", path.display());
                Ok(())
            }
            Some(Outcome::Failed(e)) => Err(e),
            None => Ok(()),
        },
        _ = shutdown => Ok(()),
    }
}

/// Retries `start` with the configured backoff while the failure is a
/// transport error and attempts remain.
pub async fn start_with_retry(client: &Client, settings: &Settings) -> Result<(), ClientError> {
    let mut backoff = settings.backoff();
    loop {
        match client.start().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && backoff.attempts() + 1 < settings.retry.max_attempts => {
                let delay = backoff.next_delay();
                warn!("Start failed ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn install_handlers(client: &Client, options: ReceiverOptions) -> UnboundedReceiver<Outcome> {
    let (tx, rx) = mpsc::unbounded_channel();
    let received = Arc::new(AtomicUsize::new(0));
    let written = Arc::new(AtomicBool::new(false));

    let errors = tx.clone();
    let on_message = {
        let received = received.clone();
        move |payload: Payload, delivery: Delivery| {
            let n = received.fetch_add(1, Ordering::SeqCst) + 1;
            if options.verbose {
                println!("# received message ({n})");
            }
            let message = delivery.message.clone();
            match &options.file {
                Some(path) => {
                    if written.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    write_once(path, &payload, &tx);
                    message.confirm_delivery();
                }
                None => {
                    println!("{payload}");
                    if options.verbose {
                        println!("{delivery:?}");
                    }
                    if options.confirm_delay.is_zero() {
                        message.confirm_delivery();
                    } else {
                        let delay = options.confirm_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            message.confirm_delivery();
                        });
                    }
                }
            }
        }
    };

    client
        .on_started(|| info!("Started"))
        .on_restarted(|| info!("Restarted"))
        .on_stopped(|| info!("Stopped"))
        .on_error(move |e| {
            warn!("{e}");
            let _ = errors.send(Outcome::Failed(e.clone().into()));
        })
        .on_message(on_message)
        .on_malformed(move |malformed| {
            let n = received.fetch_add(1, Ordering::SeqCst) + 1;
            eprintln!("*** received malformed message ({n})");
            eprintln!("{}", malformed.raw_text());
            eprintln!("{}", malformed.error);
            if let Some(delivery) = malformed.delivery {
                delivery.message.confirm_delivery();
            }
        });
    rx
}

fn write_once(path: &Path, payload: &Payload, outcomes: &UnboundedSender<Outcome>) {
    println!("Writing message data to {}", path.display());
    let outcome = match std::fs::write(path, payload.to_string()) {
        Ok(()) => Outcome::Written(path.to_path_buf()),
        Err(source) => Outcome::Failed(ReceiveError::Write {
            path: path.to_path_buf(),
            source,
        }),
    };
    let _ = outcomes.send(outcome);
}
