//! Fallback poll synchronizer: periodic reconciliation for when push
//! delivery is degraded or events were missed. Every fetched message goes
//! through the same `ingest` entry point as live push delivery; dedup is
//! what makes running both at once safe.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use push_transport::ConnectionState;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{api::ConversationApi, RealtimeSession};

impl RealtimeSession {
    /// Spawns the poll loop. Ticks run strictly sequentially; a slow tick
    /// simply delays the next scheduled one. The task is owned by the
    /// session and aborted on teardown.
    pub(crate) fn spawn_poll_task(self: &Arc<Self>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = session.current_poll_interval().await;
                tokio::time::sleep(interval).await;

                let (visible, identified) = {
                    let guard = session.inner.lock().await;
                    (guard.visible, guard.viewer.is_some())
                };
                if !visible || !identified {
                    debug!("poll: skipped (hidden or signed out)");
                    continue;
                }
                if let Err(err) = session.poll_tick().await {
                    // A failed tick never cancels the interval.
                    warn!("poll: tick failed: {err}");
                }
            }
        })
    }

    /// Polls faster while the push transport is not healthy; the poll layer
    /// is the resilience mechanism, not transport reconnect retries.
    async fn current_poll_interval(&self) -> Duration {
        let state = { self.inner.lock().await.connection };
        match state {
            ConnectionState::Connected => self.config.poll_interval,
            _ => self.config.degraded_poll_interval,
        }
    }

    /// One immediate reconciliation pass outside the poll schedule, for
    /// startup or window foregrounding.
    pub async fn refresh(&self) -> Result<()> {
        self.poll_tick().await
    }

    /// One reconciliation pass: silent conversation list refresh, then the
    /// most recent page of the selected conversation fed through `ingest`.
    pub(crate) async fn poll_tick(&self) -> Result<()> {
        let summaries = self.api.list_conversations(1).await?;
        {
            let mut guard = self.inner.lock().await;
            for summary in summaries {
                guard.store.upsert_summary(summary);
            }
        }

        let selected = { self.inner.lock().await.store.selected() };
        if let Some(conversation_id) = selected {
            let page = self
                .api
                .get_messages(conversation_id, self.config.history_page_size, None)
                .await?;
            for message in page {
                self.ingest(message).await?;
            }
        }
        Ok(())
    }
}
