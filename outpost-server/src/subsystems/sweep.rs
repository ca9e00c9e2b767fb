//! Idle session sweep
//!
//! Runs on a fixed interval independent of both channels and evicts every
//! session whose last inbound message is older than the idle threshold.
//! Evicted TCP sessions have their connection closed by the manager.

use std::sync::Arc;

use outpost_core::config::SweepConfig;
use outpost_core::SessionManager;
use tokio::sync::broadcast;

/// Run one sweep pass. Returns the number of evicted sessions.
pub fn sweep_once(sessions: &SessionManager, config: &SweepConfig) -> usize {
    let evicted = sessions.sweep(config.idle_threshold_seconds);
    if evicted.is_empty() {
        tracing::debug!("Sweep complete: no idle sessions ({} active)", sessions.len());
    } else {
        tracing::info!(
            "Sweep complete: {} idle session(s) evicted, {} remaining",
            evicted.len(),
            sessions.len()
        );
    }
    evicted.len()
}

pub async fn run_sweep_loop(
    sessions: Arc<SessionManager>,
    config: SweepConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let interval = tokio::time::Duration::from_secs(config.interval_seconds.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    tracing::info!(
        "Session sweep started (interval: {}s, idle threshold: {}s)",
        config.interval_seconds,
        config.idle_threshold_seconds
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(&sessions, &config);
            }
            _ = shutdown.recv() => {
                tracing::info!("Session sweep shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core::Transport;
    use std::time::Duration;

    #[test]
    fn test_sweep_once_keeps_fresh_sessions() {
        let sessions = SessionManager::new();
        sessions.create_session("10.0.0.1:0".parse().unwrap(), Transport::Http);
        assert_eq!(sweep_once(&sessions, &SweepConfig::default()), 0);
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test]
    async fn test_loop_evicts_idle_sessions_and_stops_on_shutdown() {
        let sessions = Arc::new(SessionManager::new());
        let s = sessions.create_session("10.0.0.1:0".parse().unwrap(), Transport::Http);

        let config = SweepConfig {
            interval_seconds: 1,
            idle_threshold_seconds: 0,
        };
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(run_sweep_loop(Arc::clone(&sessions), config, rx));

        let mut evicted = false;
        for _ in 0..40 {
            if sessions.get_session(s.id.as_str()).is_none() {
                evicted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(evicted, "idle session should be swept");

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("sweep loop should stop")
            .unwrap();
    }
}
