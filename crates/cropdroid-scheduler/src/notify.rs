//! Bounded notification queue.
//! Detection never waits on a sink: `enqueue` either lands or reports overflow.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::traits::Mailer;
use cropdroid_core::types::Notification;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Recently enqueued notifications kept for inspection.
const HISTORY_LEN: usize = 100;

#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
    history: Arc<Mutex<VecDeque<Notification>>>,
}

impl NotificationQueue {
    /// Queue plus the receiver its consumer drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                history: Arc::new(Mutex::new(VecDeque::with_capacity(HISTORY_LEN))),
            },
            rx,
        )
    }

    /// Never blocks.
    pub fn enqueue(&self, notification: Notification) -> Result<()> {
        match self.tx.try_send(notification.clone()) {
            Ok(()) => {
                let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
                if history.len() == HISTORY_LEN {
                    history.pop_front();
                }
                history.push_back(notification);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(CropDroidError::NotificationOverflow),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CropDroidError::Shutdown),
        }
    }

    /// Enqueue, logging and dropping on failure.
    pub fn offer(&self, notification: Notification) {
        let title = notification.title();
        if let Err(e) = self.enqueue(notification) {
            tracing::warn!("⚠️ notification dropped ({e}): {title}");
        }
    }

    /// Newest last.
    pub fn recent(&self) -> Vec<Notification> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Drain the queue into `mailer` until cancelled, then flush what is left.
pub async fn run_consumer(
    mut rx: mpsc::Receiver<Notification>,
    mailer: Arc<dyn Mailer>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    tracing::info!("📬 notification consumer started ({})", mailer.name());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(n) => deliver(mailer.as_ref(), &n, timeout).await,
                None => break,
            },
        }
    }
    rx.close();
    while let Ok(n) = rx.try_recv() {
        deliver(mailer.as_ref(), &n, timeout).await;
    }
    tracing::info!("📭 notification consumer stopped");
}

async fn deliver(mailer: &dyn Mailer, notification: &Notification, timeout: Duration) {
    match tokio::time::timeout(timeout, mailer.send(notification)).await {
        Ok(Ok(())) => tracing::debug!("📤 {} via {}", notification.title(), mailer.name()),
        Ok(Err(e)) => tracing::error!("❌ {} failed for {}: {e}", mailer.name(), notification.title()),
        Err(_) => tracing::error!(
            "❌ {} timed out after {timeout:?} for {}",
            mailer.name(),
            notification.title()
        ),
    }
}
