//! Cube storage.
//!
//! The scheduler and facade consume storage through the `CubeStore` trait;
//! `MemoryCubeStore` is the in-process implementation. Writes apply the
//! contest resolver before overwriting an existing entry, so consumers see
//! an eventually-consistent mapping with per-key linearizability.
//!
//! Events: every successful store emits `CubeAdded`, plus
//! `NotificationAdded` when the cube carries a NOTIFY field. Event fan-out
//! is over plain flume senders; disconnected subscribers are pruned.

use bytes::Bytes;
use flume::{Receiver, Sender};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{trace, warn};
use verity_core::contest::{contest, Winner};
use verity_core::cube::{CubeInfo, CubeVariant};
use verity_core::key::{CubeKey, NotificationKey};
use verity_core::waiter::WaiterHandle;

/// Store events, emitted after the write is visible.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    CubeAdded(CubeInfo),
    NotificationAdded {
        recipient: NotificationKey,
        info: CubeInfo,
    },
}

/// Options for [`CubeStore::add_cube`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AddCubeOptions {
    /// Bump the update counter past the stored one for locally authored
    /// PMUCs. Never set for peer-supplied cubes.
    pub auto_increment_pmuc: bool,
}

impl AddCubeOptions {
    /// Options for network deliveries: peer-supplied cubes are never mutated.
    #[must_use]
    pub const fn network() -> Self {
        Self {
            auto_increment_pmuc: false,
        }
    }

    /// Options for locally authored cubes.
    #[must_use]
    pub const fn local() -> Self {
        Self {
            auto_increment_pmuc: true,
        }
    }
}

/// Storage interface the retrieval core consumes.
pub trait CubeStore {
    /// Store if new-or-wins; returns the stored info, or `None` on a
    /// contest loss, duplicate, or missing blob.
    fn add_cube(&self, info: CubeInfo, opts: AddCubeOptions) -> Option<CubeInfo>;

    fn get_cube_info(&self, key: &CubeKey) -> Option<CubeInfo>;

    fn get_cube(&self, key: &CubeKey) -> Option<Bytes>;

    fn has_cube(&self, key: &CubeKey) -> bool;

    fn number_of_stored_cubes(&self) -> usize;

    /// Stored cubes notifying the given recipient.
    fn notifications_for(&self, recipient: &NotificationKey) -> Vec<CubeInfo>;

    /// Catalog snapshot for answering key requests.
    fn all_infos(&self) -> Vec<CubeInfo>;

    /// Register an event stream; every subsequent store event is delivered.
    fn subscribe_events(&self) -> Receiver<StoreEvent>;

    /// One-shot waiter resolved by the next `cube_added` matching `key`,
    /// immediately if the cube is already stored.
    fn expect_cube(&self, key: &CubeKey) -> WaiterHandle<CubeInfo>;
}

#[derive(Default)]
struct Inner {
    cubes: HashMap<CubeKey, CubeInfo>,
    /// Recipient tag -> keys of stored cubes carrying it.
    notifications: HashMap<NotificationKey, Vec<CubeKey>>,
    subscribers: Vec<Sender<StoreEvent>>,
    expectations: Vec<(CubeKey, Sender<Option<CubeInfo>>)>,
}

/// In-memory cube store.
#[derive(Clone, Default)]
pub struct MemoryCubeStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryCubeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CubeStore for MemoryCubeStore {
    fn add_cube(&self, info: CubeInfo, opts: AddCubeOptions) -> Option<CubeInfo> {
        if !info.has_blob() {
            warn!("[Store] refusing to add {:?} without blob", info.key);
            return None;
        }

        let mut events = Vec::new();
        let mut fulfilled = Vec::new();

        let stored = {
            let mut inner = self.inner.write();

            let mut incoming = info;
            if let Some(current) = inner.cubes.get(&incoming.key) {
                if opts.auto_increment_pmuc
                    && incoming.variant == CubeVariant::Pmuc
                    && incoming.counter <= current.counter
                {
                    match incoming.with_counter(current.counter + 1) {
                        Ok(bumped) => incoming = bumped,
                        Err(e) => {
                            warn!("[Store] counter rewrite failed: {e}");
                            return None;
                        }
                    }
                }

                // Contest: the stored record wins ties, so identical
                // redeliveries are rejected without an event.
                if contest(current, &incoming) == Winner::A {
                    trace!("[Store] {:?} lost contest against stored", incoming.key);
                    return None;
                }
            }

            let key = incoming.key;
            inner.cubes.insert(key, incoming.clone());

            if let Some(recipient) = incoming.notify {
                let keys = inner.notifications.entry(recipient).or_default();
                if !keys.contains(&key) {
                    keys.push(key);
                }
                events.push(StoreEvent::NotificationAdded {
                    recipient,
                    info: incoming.clone(),
                });
            }
            events.insert(0, StoreEvent::CubeAdded(incoming.clone()));

            let mut i = 0;
            while i < inner.expectations.len() {
                if inner.expectations[i].0 == key {
                    fulfilled.push(inner.expectations.swap_remove(i).1);
                } else {
                    i += 1;
                }
            }

            incoming
        };

        for tx in fulfilled {
            let _ = tx.send(Some(stored.clone()));
        }
        let mut inner = self.inner.write();
        inner
            .subscribers
            .retain(|tx| events.iter().all(|ev| tx.send(ev.clone()).is_ok()));

        Some(stored)
    }

    fn get_cube_info(&self, key: &CubeKey) -> Option<CubeInfo> {
        self.inner.read().cubes.get(key).cloned()
    }

    fn get_cube(&self, key: &CubeKey) -> Option<Bytes> {
        self.inner.read().cubes.get(key).and_then(|i| i.blob.clone())
    }

    fn has_cube(&self, key: &CubeKey) -> bool {
        self.inner.read().cubes.contains_key(key)
    }

    fn number_of_stored_cubes(&self) -> usize {
        self.inner.read().cubes.len()
    }

    fn notifications_for(&self, recipient: &NotificationKey) -> Vec<CubeInfo> {
        let inner = self.inner.read();
        inner
            .notifications
            .get(recipient)
            .into_iter()
            .flatten()
            .filter_map(|key| inner.cubes.get(key).cloned())
            .collect()
    }

    fn all_infos(&self) -> Vec<CubeInfo> {
        self.inner.read().cubes.values().cloned().collect()
    }

    fn subscribe_events(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = flume::unbounded();
        self.inner.write().subscribers.push(tx);
        rx
    }

    fn expect_cube(&self, key: &CubeKey) -> WaiterHandle<CubeInfo> {
        let mut inner = self.inner.write();
        if let Some(info) = inner.cubes.get(key) {
            return WaiterHandle::ready(Some(info.clone()));
        }
        let (tx, rx) = flume::bounded(1);
        inner.expectations.push((*key, tx));
        WaiterHandle::from_receiver(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verity_core::cube::CubeFields;

    fn muc(author: u8, date: u64, payload: &str) -> CubeInfo {
        let blob = CubeFields::new(CubeVariant::Muc)
            .with_author(CubeKey::from_bytes([author; 32]))
            .with_date(date)
            .with_payload(payload.as_bytes().to_vec())
            .build()
            .unwrap();
        CubeInfo::decode(blob).unwrap()
    }

    #[test]
    fn add_and_get() {
        let store = MemoryCubeStore::new();
        let info = muc(1, 100, "primus");

        let stored = store.add_cube(info.clone(), AddCubeOptions::network()).unwrap();
        assert_eq!(stored.key, info.key);
        assert!(store.has_cube(&info.key));
        assert_eq!(store.number_of_stored_cubes(), 1);
        assert_eq!(
            store.get_cube_info(&info.key).unwrap().payload_string(),
            Some("primus".into())
        );
    }

    #[test]
    fn contest_applied_before_overwrite() {
        let store = MemoryCubeStore::new();
        let newer = muc(1, 200, "novus");
        let older = muc(1, 100, "vetus");

        store.add_cube(newer.clone(), AddCubeOptions::network()).unwrap();

        // Older version loses; store unchanged, no event.
        assert!(store.add_cube(older, AddCubeOptions::network()).is_none());
        assert_eq!(
            store.get_cube_info(&newer.key).unwrap().payload_string(),
            Some("novus".into())
        );

        // Duplicate redelivery is rejected too.
        assert!(store
            .add_cube(newer.clone(), AddCubeOptions::network())
            .is_none());
    }

    #[test]
    fn events_fire_after_store() {
        let store = MemoryCubeStore::new();
        let rx = store.subscribe_events();

        let recipient = CubeKey::from_bytes([0x42; 32]);
        let blob = CubeFields::new(CubeVariant::Pic)
            .with_notify(recipient)
            .with_payload(&b"nuntius"[..])
            .build()
            .unwrap();
        let info = CubeInfo::decode(blob).unwrap();
        store.add_cube(info.clone(), AddCubeOptions::network()).unwrap();

        match rx.try_recv().unwrap() {
            StoreEvent::CubeAdded(added) => assert_eq!(added.key, info.key),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            StoreEvent::NotificationAdded { recipient: r, .. } => assert_eq!(r, recipient),
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(store.notifications_for(&recipient).len(), 1);
    }

    #[test]
    fn expect_cube_resolves_on_add() {
        let store = MemoryCubeStore::new();
        let info = muc(3, 50, "exspectatus");

        let pending = store.expect_cube(&info.key);
        store.add_cube(info.clone(), AddCubeOptions::network()).unwrap();

        futures::executor::block_on(async {
            let got = pending.wait().await.unwrap();
            assert_eq!(got.key, info.key);
        });

        // Already stored: resolves immediately.
        let immediate = store.expect_cube(&info.key);
        futures::executor::block_on(async {
            assert!(immediate.wait().await.is_some());
        });
    }

    #[test]
    fn auto_increment_only_bumps_locally_authored_pmucs() {
        let store = MemoryCubeStore::new();
        let author = CubeKey::from_bytes([9; 32]);
        let make = |counter| {
            let blob = CubeFields::new(CubeVariant::Pmuc)
                .with_author(author)
                .with_counter(counter)
                .with_date(100)
                .with_payload(&b"persistens"[..])
                .build()
                .unwrap();
            CubeInfo::decode(blob).unwrap()
        };

        store.add_cube(make(5), AddCubeOptions::local()).unwrap();

        // Local re-publish with a stale counter gets bumped past 5.
        let stored = store.add_cube(make(1), AddCubeOptions::local()).unwrap();
        assert_eq!(stored.counter, 6);

        // A peer-supplied stale counter simply loses.
        assert!(store.add_cube(make(1), AddCubeOptions::network()).is_none());
    }
}
