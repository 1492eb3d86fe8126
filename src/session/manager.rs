//! Session manager for tracking all connected autopilots

use super::actor::SimSession;
use sitl_bridge_shared::ChannelId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

/// Manages all active simulation sessions
pub struct SessionManager {
    sessions: Arc<RwLock<Registry>>,
}

#[derive(Default)]
struct Registry {
    /// Map of channel -> running session
    entries: HashMap<ChannelId, SessionEntry>,
    /// Set by `close_all`; no registrations are accepted afterwards
    closed: bool,
}

struct SessionEntry {
    session: Arc<SimSession>,
    task: JoinHandle<()>,
    registered_at: Instant,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(Registry::default())),
        }
    }

    /// Look up the session for a channel, creating and starting one if
    /// the channel has none. Returns the session and whether it is new, or
    /// `None` once the manager has been closed.
    pub async fn get_or_register<F>(
        &self,
        channel: ChannelId,
        create: F,
    ) -> Option<(Arc<SimSession>, bool)>
    where
        F: FnOnce() -> SimSession,
    {
        if let Some(entry) = self.sessions.read().await.entries.get(&channel) {
            return Some((entry.session.clone(), false));
        }

        let mut sessions = self.sessions.write().await;
        if sessions.closed {
            return None;
        }
        // Another caller may have registered it between the two locks
        if let Some(entry) = sessions.entries.get(&channel) {
            return Some((entry.session.clone(), false));
        }

        let session = Arc::new(create());
        let runner = session.clone();
        let span = info_span!("session", channel = %channel);
        let task = tokio::spawn(async move { runner.run().await }.instrument(span));

        sessions.entries.insert(
            channel,
            SessionEntry {
                session: session.clone(),
                task,
                registered_at: Instant::now(),
            },
        );

        Some((session, true))
    }

    /// Get the session for a specific channel
    #[cfg(test)]
    pub async fn get(&self, channel: ChannelId) -> Option<Arc<SimSession>> {
        let sessions = self.sessions.read().await;
        sessions.entries.get(&channel).map(|e| e.session.clone())
    }

    /// Unregister a session and stop its loop
    pub async fn remove(&self, channel: ChannelId) -> bool {
        let entry = self.sessions.write().await.entries.remove(&channel);
        match entry {
            Some(entry) => {
                entry.session.close();
                if let Err(e) = entry.task.await {
                    warn!(channel = %channel, "Session loop ended abnormally: {}", e);
                }
                let stats = entry.session.stats();
                info!(
                    channel = %channel,
                    steps = stats.steps,
                    mode = ?stats.mode,
                    autopilot = ?stats.autopilot,
                    clock_ahead_events = stats.clock_ahead_events,
                    alive_ms = entry.registered_at.elapsed().as_millis() as u64,
                    "Session removed"
                );
                true
            }
            None => false,
        }
    }

    /// Stop and drop every session and refuse new registrations
    pub async fn close_all(&self) {
        let entries: Vec<(ChannelId, SessionEntry)> = {
            let mut sessions = self.sessions.write().await;
            sessions.closed = true;
            sessions.entries.drain().collect()
        };

        for (_, entry) in &entries {
            entry.session.close();
        }

        let (channels, tasks): (Vec<_>, Vec<_>) =
            entries.into_iter().map(|(channel, e)| (channel, e.task)).unzip();
        let results = futures::future::join_all(tasks).await;
        for (channel, result) in channels.into_iter().zip(results) {
            if let Err(e) = result {
                warn!(channel = %channel, "Session loop ended abnormally: {}", e);
            }
        }
    }

    /// Get list of all registered channels
    #[cfg(test)]
    pub async fn channels(&self) -> Vec<ChannelId> {
        let sessions = self.sessions.read().await;
        let mut channels: Vec<ChannelId> = sessions.entries.keys().copied().collect();
        channels.sort();
        channels
    }

    /// Get the number of registered sessions
    pub async fn count(&self) -> usize {
        self.sessions.read().await.entries.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
