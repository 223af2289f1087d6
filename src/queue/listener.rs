//! Change-notification channel listener.
//!
//! A dedicated long-lived connection LISTENs on the job channel and forwards
//! every notification into the dequeue wait. Backends without notification
//! support (or a dropped stream) are detected once, logged, and the queue
//! degrades gracefully to polling alone.

use std::sync::Arc;

use sqlx::postgres::PgListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::storage::Storage;

/// Channel producers NOTIFY on after committing new jobs.
pub(crate) const NOTIFICATION_CHANNEL: &str = "granary_new_job";

pub(crate) fn spawn(
    storage: Arc<Storage>,
    notification: Arc<Notify>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut listener = match PgListener::connect_with(storage.pool()).await {
            Ok(listener) => listener,
            Err(err) => {
                warn!(%err, "could not open notification connection; polling only");
                return;
            }
        };

        if let Err(err) = listener.listen(NOTIFICATION_CHANNEL).await {
            warn!(
                channel = NOTIFICATION_CHANNEL,
                %err,
                "backend does not support notifications; polling only"
            );
            return;
        }

        debug!(channel = NOTIFICATION_CHANNEL, "listening for job notifications");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                message = listener.recv() => match message {
                    Ok(_) => notification.notify_one(),
                    Err(err) => {
                        warn!(%err, "notification stream interrupted; polling only");
                        break;
                    }
                },
            }
        }
    })
}
