//! The developer-facing read API.
//!
//! Thin adapter over the store and the scheduler: unified "local or
//! network" lookups, subscription streams, and notification retrieval.
//!
//! Event-to-stream bridging: each subscription stream owns an unbounded
//! flume bridge installed on the store's event feed *before* the network
//! subscription is initiated, so no update can race the filter install.
//! Dropping the stream tears down the bridge only; the network
//! subscription stops being renewed and expires on its own.

use crate::scheduler::{NotificationMode, RequestOptions, RequestScheduler};
use crate::store::{CubeStore, StoreEvent};
use bytes::Bytes;
use hashbrown::HashSet;
use std::sync::Arc;
use std::time::Duration;
use verity_core::cube::CubeInfo;
use verity_core::key::{CubeKey, NotificationKey};
use verity_wire::message::SubscriptionKind;

/// Buffered deliveries get this long to drain after a notification
/// request settles.
const NOTIFICATION_DRAIN_WINDOW: Duration = Duration::from_millis(100);

/// Cancellable lazy sequence of cubes matching one subscribed key.
pub struct CubeStream {
    rx: flume::Receiver<CubeInfo>,
}

impl CubeStream {
    /// Next matching cube; `None` once the bridge is torn down.
    pub async fn next(&self) -> Option<CubeInfo> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking drain of already-buffered matches.
    pub fn drain(&self) -> Vec<CubeInfo> {
        self.rx.try_iter().collect()
    }

    /// Tear down the adapter. The network subscription is not cancelled
    /// here; it simply stops being renewed and expires.
    /// TODO: plumb an eager scheduler-side cancel once callers need it.
    pub fn cancel(self) {}
}

/// User-facing retrieval API.
#[derive(Clone)]
pub struct RetrievalFacade {
    store: Arc<dyn CubeStore>,
    scheduler: RequestScheduler,
}

impl RetrievalFacade {
    pub fn new(store: Arc<dyn CubeStore>, scheduler: RequestScheduler) -> Self {
        Self { store, scheduler }
    }

    /// Local store first, then one network request. Settles with `None`
    /// on timeout. Does not refresh a stale MUC/PMUC; callers wanting
    /// freshness subscribe or re-request explicitly.
    pub async fn get_cube_info(&self, key: CubeKey) -> Option<CubeInfo> {
        if let Some(info) = self.store.get_cube_info(&key) {
            return Some(info);
        }
        self.scheduler
            .request_cube(key, RequestOptions::default())
            .await
            .wait()
            .await
    }

    /// Like [`get_cube_info`](Self::get_cube_info) but yields the binary record.
    pub async fn get_cube(&self, key: CubeKey) -> Option<Bytes> {
        let info = self.get_cube_info(key).await?;
        info.blob.or_else(|| self.store.get_cube(&key))
    }

    /// Live updates of a mutable cube as a lazy stream. The network
    /// subscription is initiated before this returns; the initial value is
    /// not fetched implicitly.
    pub async fn subscribe_cube(&self, key: CubeKey) -> CubeStream {
        let stream = self.bridge(key, SubscriptionKind::Cube);
        let _ = self.scheduler.subscribe_cube(key).await;
        stream
    }

    /// Live notification cubes for a recipient key.
    pub async fn subscribe_notifications(&self, recipient: NotificationKey) -> CubeStream {
        let stream = self.bridge(recipient, SubscriptionKind::Notifications);
        let _ = self.scheduler.subscribe_notifications(recipient).await;
        stream
    }

    /// Stop renewing a cube subscription; the current period runs out.
    pub fn cancel_cube_subscription(&self, key: CubeKey) {
        self.scheduler.cancel_cube_subscription(key);
    }

    pub fn cancel_notification_subscription(&self, recipient: NotificationKey) {
        self.scheduler.cancel_notification_subscription(recipient);
    }

    /// Everything stored for `recipient`, then one network round:
    /// stored matches first, a live filter for the request window, and a
    /// short drain for buffered deliveries.
    pub async fn get_notifications(&self, recipient: NotificationKey) -> Vec<CubeInfo> {
        let mut out = self.store.notifications_for(&recipient);
        let live = self.bridge(recipient, SubscriptionKind::Notifications);

        let waiter = self
            .scheduler
            .request_notifications(recipient, NotificationMode::Indirect)
            .await;
        let _ = waiter.wait().await;
        compio::time::sleep(NOTIFICATION_DRAIN_WINDOW).await;

        out.extend(live.drain());

        let mut seen = HashSet::new();
        out.retain(|info| seen.insert(info.hash));
        out
    }

    /// Install a filtered forwarder from the store's event feed.
    fn bridge(&self, key: CubeKey, kind: SubscriptionKind) -> CubeStream {
        let events = self.store.subscribe_events();
        let (tx, rx) = flume::unbounded();

        compio::runtime::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let matched = match (&event, kind) {
                    (StoreEvent::CubeAdded(info), SubscriptionKind::Cube)
                        if info.key == key =>
                    {
                        Some(info.clone())
                    }
                    (
                        StoreEvent::NotificationAdded { recipient, info },
                        SubscriptionKind::Notifications,
                    ) if *recipient == key => Some(info.clone()),
                    _ => None,
                };
                if let Some(info) = matched {
                    if tx.send(info).is_err() {
                        break; // consumer cancelled the stream
                    }
                }
            }
        })
        .detach();

        CubeStream { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerOptions;
    use crate::store::{AddCubeOptions, MemoryCubeStore};
    use std::time::Duration;
    use verity_core::cube::{CubeFields, CubeVariant};

    fn facade() -> (Arc<MemoryCubeStore>, RetrievalFacade) {
        let store = Arc::new(MemoryCubeStore::new());
        let options = SchedulerOptions::default()
            .with_request_timeout(Duration::from_millis(100))
            .with_retention_enabled(false);
        let scheduler = RequestScheduler::spawn(store.clone(), options);
        let facade = RetrievalFacade::new(store.clone(), scheduler);
        (store, facade)
    }

    fn pic(payload: &str, notify: Option<CubeKey>) -> CubeInfo {
        let mut fields = CubeFields::new(CubeVariant::Pic)
            .with_date(1_000_000)
            .with_payload(payload.as_bytes().to_vec());
        if let Some(recipient) = notify {
            fields = fields.with_notify(recipient);
        }
        CubeInfo::decode(fields.build().unwrap()).unwrap()
    }

    #[compio::test]
    async fn get_cube_info_prefers_local_store() {
        let (store, facade) = facade();
        let info = pic("localis", None);
        store.add_cube(info.clone(), AddCubeOptions::network()).unwrap();

        let got = facade.get_cube_info(info.key).await.unwrap();
        assert_eq!(got.payload_string(), Some("localis".into()));
    }

    #[compio::test]
    async fn get_cube_info_times_out_to_none() {
        let (_store, facade) = facade();
        assert!(facade
            .get_cube_info(CubeKey::from_bytes([0x33; 32]))
            .await
            .is_none());
    }

    #[compio::test]
    async fn subscription_stream_yields_matching_adds() {
        let (store, facade) = facade();
        let author = CubeKey::from_bytes([4; 32]);

        let stream = facade.subscribe_cube(author).await;

        let blob = CubeFields::new(CubeVariant::Muc)
            .with_author(author)
            .with_date(7)
            .with_payload(&b"renovatus"[..])
            .build()
            .unwrap();
        store
            .add_cube(CubeInfo::decode(blob).unwrap(), AddCubeOptions::network())
            .unwrap();

        // Unrelated cubes must not leak through the filter.
        store.add_cube(pic("alienus", None), AddCubeOptions::network()).unwrap();

        let got = stream.next().await.unwrap();
        assert_eq!(got.key, author);
        assert_eq!(got.payload_string(), Some("renovatus".into()));
        assert!(stream.drain().is_empty());
    }

    #[compio::test]
    async fn get_notifications_yields_stored_matches() {
        let (store, facade) = facade();
        let recipient = CubeKey::from_bytes([0x42; 32]);

        store
            .add_cube(pic("nuntius primus", Some(recipient)), AddCubeOptions::network())
            .unwrap();
        store
            .add_cube(pic("sine nuntio", None), AddCubeOptions::network())
            .unwrap();

        let got = facade.get_notifications(recipient).await;
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload_string(), Some("nuntius primus".into()));
    }
}
