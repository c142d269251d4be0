use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 16;

/// Coarse effective-connection label as reported by the platform.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, AsRefStr, EnumString, Serialize, Deserialize,
)]
#[strum(ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionQuality {
    #[strum(serialize = "slow-2g")]
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[strum(serialize = "2g")]
    #[serde(rename = "2g")]
    TwoG,
    #[strum(serialize = "3g")]
    #[serde(rename = "3g")]
    ThreeG,
    #[strum(serialize = "4g")]
    #[serde(rename = "4g")]
    FourG,
    #[default]
    #[strum(serialize = "unknown")]
    Unknown,
}

impl ConnectionQuality {
    /// Maps a platform label to a quality, treating anything unrecognised as unknown.
    pub fn from_label(label: Option<&str>) -> Self {
        label
            .and_then(|raw| Self::from_str(raw.trim()).ok())
            .unwrap_or(Self::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub online: bool,
    pub quality: ConnectionQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
    QualityChanged,
}

/// Platform connectivity signal.
pub trait ConnectivitySource: Send + Sync + 'static {
    fn is_online(&self) -> bool;

    /// Effective connection label, `None` when the platform has no such API.
    fn quality_label(&self) -> Option<String>;

    fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent>;
}

/// Single reactive source of truth for connectivity.
///
/// Every platform notification triggers a full re-read of the source, so
/// observers always receive a complete `(online, quality)` pair.
pub struct NetworkObserver {
    status_rx: watch::Receiver<NetworkStatus>,
    listener: Option<JoinHandle<()>>,
}

impl NetworkObserver {
    pub fn start(source: Arc<dyn ConnectivitySource>) -> Self {
        let mut events = source.subscribe();
        let (status_tx, status_rx) = watch::channel(read_status(source.as_ref()));
        let listener = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        tracing::debug!(?event, "connectivity notification");
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "connectivity notifications lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                let status = read_status(source.as_ref());
                status_tx.send_if_modified(|current| {
                    if *current == status {
                        return false;
                    }
                    tracing::info!(online = status.online, quality = %status.quality, "network status changed");
                    *current = status;
                    true
                });
            }
        });
        Self {
            status_rx,
            listener: Some(listener),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status_rx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status().online
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status_rx.clone()
    }

    /// Stops listening and releases the platform subscription.
    pub async fn shutdown(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            let _ = listener.await;
        }
    }
}

impl Drop for NetworkObserver {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

fn read_status(source: &dyn ConnectivitySource) -> NetworkStatus {
    NetworkStatus {
        online: source.is_online(),
        quality: ConnectionQuality::from_label(source.quality_label().as_deref()),
    }
}

/// In-process connectivity source driven by explicit calls.
pub struct SimulatedConnectivity {
    state: RwLock<(bool, Option<String>)>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl SimulatedConnectivity {
    pub fn new(online: bool, quality: Option<&str>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            state: RwLock::new((online, quality.map(str::to_owned))),
            events,
        })
    }

    pub fn set_online(&self, online: bool) {
        self.state.write().0 = online;
        let event = if online {
            ConnectivityEvent::Online
        } else {
            ConnectivityEvent::Offline
        };
        self.emit(event);
    }

    pub fn set_quality(&self, quality: Option<&str>) {
        self.state.write().1 = quality.map(str::to_owned);
        self.emit(ConnectivityEvent::QualityChanged);
    }

    pub fn listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    fn emit(&self, event: ConnectivityEvent) {
        // No listeners is fine: the next observer reads the state directly.
        let _ = self.events.send(event);
    }
}

impl ConnectivitySource for SimulatedConnectivity {
    fn is_online(&self) -> bool {
        self.state.read().0
    }

    fn quality_label(&self) -> Option<String> {
        self.state.read().1.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn unknown_labels_degrade_to_unknown() {
        assert_eq!(ConnectionQuality::from_label(Some("4g")), ConnectionQuality::FourG);
        assert_eq!(ConnectionQuality::from_label(Some(" 3G ")), ConnectionQuality::ThreeG);
        assert_eq!(
            ConnectionQuality::from_label(Some("slow-2g")),
            ConnectionQuality::Slow2g
        );
        assert_eq!(ConnectionQuality::from_label(Some("5g")), ConnectionQuality::Unknown);
        assert_eq!(ConnectionQuality::from_label(None), ConnectionQuality::Unknown);
        assert_eq!(ConnectionQuality::TwoG.to_string(), "2g");
    }

    #[tokio::test(start_paused = true)]
    async fn initial_status_comes_from_platform() {
        let platform = SimulatedConnectivity::new(false, Some("2g"));
        let observer = NetworkObserver::start(platform.clone());
        assert_eq!(
            observer.status(),
            NetworkStatus {
                online: false,
                quality: ConnectionQuality::TwoG
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn republishes_full_status_on_each_notification() {
        let platform = SimulatedConnectivity::new(true, Some("4g"));
        let observer = NetworkObserver::start(platform.clone());
        let mut updates = observer.subscribe();
        settle().await;

        platform.set_online(false);
        updates.changed().await.expect("status published");
        assert_eq!(
            *updates.borrow_and_update(),
            NetworkStatus {
                online: false,
                quality: ConnectionQuality::FourG
            }
        );

        platform.set_quality(Some("3g"));
        updates.changed().await.expect("status published");
        assert_eq!(
            *updates.borrow_and_update(),
            NetworkStatus {
                online: false,
                quality: ConnectionQuality::ThreeG
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_quality_api_reports_unknown() {
        let platform = SimulatedConnectivity::new(true, None);
        let observer = NetworkObserver::start(platform.clone());
        settle().await;
        platform.set_online(true);
        settle().await;
        assert_eq!(observer.status().quality, ConnectionQuality::Unknown);
        assert!(observer.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_platform_subscription() {
        let platform = SimulatedConnectivity::new(true, Some("4g"));
        let observer = NetworkObserver::start(platform.clone());
        assert_eq!(platform.listener_count(), 1);

        observer.shutdown().await;
        assert_eq!(platform.listener_count(), 0);
    }
}
