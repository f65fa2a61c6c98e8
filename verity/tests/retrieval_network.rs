//! End-to-end retrieval scenarios on a linear in-process network:
//!
//! ```text
//! S (light) — FN1 (full) — FN2 (full) — R (light)
//! ```
//!
//! Proof-of-work difficulty 0, retention disabled.

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::time::Duration;
use verity::config::SchedulerOptions;
use verity::prelude::*;
use verity::SubscriptionKind;

fn light_options() -> SchedulerOptions {
    SchedulerOptions::default()
        .with_request_interval(Duration::from_millis(20))
        .with_interactive_request_delay(Duration::from_millis(5))
        .with_request_timeout(Duration::from_millis(1500))
        .with_renew_subscriptions_before_expiry(Duration::from_millis(200))
        .with_retention_enabled(false)
}

fn full_options(subscription_period: Duration) -> SchedulerOptions {
    light_options()
        .with_light_node(false)
        .with_cube_subscription_period(subscription_period)
}

struct LinearNetwork {
    s: VerityNode,
    fn1: VerityNode,
    fn2: VerityNode,
    r: VerityNode,
}

async fn linear_network(subscription_period: Duration) -> LinearNetwork {
    verity::dev_tracing::init_tracing();

    let s = VerityNode::new(light_options());
    let fn1 = VerityNode::new(full_options(subscription_period));
    let fn2 = VerityNode::new(full_options(subscription_period));
    let r = VerityNode::new(light_options());

    s.link_with(&fn1);
    fn1.link_with(&fn2);
    fn2.link_with(&r);

    // Let the hellos settle so every session knows its peer's node type.
    compio::time::sleep(Duration::from_millis(50)).await;

    LinearNetwork { s, fn1, fn2, r }
}

fn keypair() -> CubeKey {
    let signing = SigningKey::generate(&mut OsRng);
    CubeKey::from_bytes(signing.verifying_key().to_bytes())
}

fn muc(author: CubeKey, date: u64, payload: &str) -> CubeFields {
    CubeFields::new(CubeVariant::Muc)
        .with_author(author)
        .with_date(date)
        .with_payload(payload.as_bytes().to_vec())
}

fn stored_payload(node: &VerityNode, key: &CubeKey) -> Option<String> {
    node.store()
        .get_cube_info(key)
        .and_then(|info| info.payload_string())
}

/// Poll until `check` holds or the deadline passes.
async fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        compio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[compio::test]
async fn frozen_request_over_the_network() {
    let net = linear_network(Duration::from_secs(60)).await;

    let info = net
        .s
        .publish(
            CubeFields::new(CubeVariant::Frozen)
                .with_date(1_000_000)
                .with_payload(&b"cubus sum"[..]),
        )
        .unwrap();

    // Full nodes pick the cube up on their own.
    compio::time::sleep(Duration::from_millis(200)).await;
    assert!(net.fn1.store().has_cube(&info.key));
    assert!(net.fn2.store().has_cube(&info.key));

    let waiter = net
        .r
        .scheduler()
        .request_cube(info.key, RequestOptions::default())
        .await;
    let got = waiter.wait().await.expect("frozen cube reaches the reader");
    assert!(got.payload_string().unwrap().contains("cubus sum"));
    assert!(net.r.store().has_cube(&info.key));

    net.r.shutdown().await;
}

#[compio::test]
async fn muc_subscribe_explicit_fetch_and_live_update() {
    let net = linear_network(Duration::from_secs(60)).await;
    let author = keypair();

    net.s
        .publish(muc(author, 1_000_001, "cubus usoris mutabilis sum"))
        .unwrap();
    compio::time::sleep(Duration::from_millis(300)).await;

    // Subscribe first; the initial value still needs an explicit fetch.
    let stream = net.r.facade().subscribe_cube(author).await;
    assert!(net
        .r
        .scheduler()
        .subscription_status(author, SubscriptionKind::Cube)
        .await
        .is_some());
    assert!(!net.r.store().has_cube(&author));

    let info = net.r.facade().get_cube_info(author).await.expect("fetch");
    assert_eq!(
        info.payload_string().unwrap(),
        "cubus usoris mutabilis sum"
    );

    // A sender-side update reaches the subscribed reader.
    net.s
        .publish(muc(author, 1_000_002, "ab domino meo renovatus sum"))
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(1), || {
            stored_payload(&net.r, &author).as_deref() == Some("ab domino meo renovatus sum")
        })
        .await
    );

    // The lazy sequence yields the update too (after the fetched initial).
    let mut saw_update = false;
    while let Ok(Some(update)) =
        compio::time::timeout(Duration::from_millis(500), stream.next()).await
    {
        if update.payload_string().as_deref() == Some("ab domino meo renovatus sum") {
            saw_update = true;
            break;
        }
    }
    assert!(saw_update);
}

#[compio::test]
async fn subscription_renews_and_keeps_delivering() {
    let net = linear_network(Duration::from_millis(1000)).await;
    let author = keypair();

    net.s
        .publish(muc(author, 1_000_002, "ab domino meo renovatus sum"))
        .unwrap();
    compio::time::sleep(Duration::from_millis(300)).await;

    let grant = net
        .r
        .scheduler()
        .subscribe_cube(author)
        .await
        .expect("subscription granted");
    assert_eq!(grant.duration, Duration::from_millis(1000));

    let before = net
        .r
        .scheduler()
        .subscription_status(author, SubscriptionKind::Cube)
        .await
        .expect("active");

    // Across the grant boundary the entry is replaced, not left settled.
    compio::time::sleep(Duration::from_millis(1300)).await;
    let after = net
        .r
        .scheduler()
        .subscription_status(author, SubscriptionKind::Cube)
        .await
        .expect("renewed instance");
    assert_ne!(before.id, after.id);

    // And updates still flow through the renewed subscription.
    net.s
        .publish(muc(author, 1_000_003, "iterum atque iterum renovari possum"))
        .unwrap();
    assert!(
        wait_for(Duration::from_secs(1), || {
            stored_payload(&net.r, &author).as_deref()
                == Some("iterum atque iterum renovari possum")
        })
        .await
    );
}

#[compio::test]
async fn concurrent_updates_converge_on_the_contest_winner() {
    let net = linear_network(Duration::from_secs(60)).await;
    let author = keypair();

    // Both ends co-own the MUC and watch it.
    net.s.scheduler().subscribe_cube(author).await.expect("s subscribed");
    net.r.scheduler().subscribe_cube(author).await.expect("r subscribed");

    net.s
        .publish(muc(author, 1_000_005, "duos dominos habeo"))
        .unwrap();
    net.r
        .publish(muc(author, 1_000_006, "de potestate mea pugnant"))
        .unwrap();

    // Higher declared date wins everywhere.
    for node in [&net.s, &net.fn1, &net.fn2, &net.r] {
        assert!(
            wait_for(Duration::from_secs(2), || {
                stored_payload(node, &author).as_deref() == Some("de potestate mea pugnant")
            })
            .await,
            "node did not converge"
        );
    }
}

#[compio::test]
async fn cancellation_lets_the_subscription_lapse() {
    let net = linear_network(Duration::from_millis(1000)).await;
    let author = keypair();

    net.s
        .publish(muc(author, 1_000_001, "cubus usoris mutabilis sum"))
        .unwrap();
    compio::time::sleep(Duration::from_millis(300)).await;

    let grant = net
        .r
        .scheduler()
        .subscribe_cube(author)
        .await
        .expect("granted");
    net.r
        .facade()
        .get_cube_info(author)
        .await
        .expect("initial fetch");

    net.r.facade().cancel_cube_subscription(author);

    // The grant runs to completion, then the entry is removed.
    assert_eq!(grant.expiry.wait().await, Some(()));
    assert!(net
        .r
        .scheduler()
        .subscription_status(author, SubscriptionKind::Cube)
        .await
        .is_none());

    // Give the server side time to purge its inbound entry too.
    compio::time::sleep(Duration::from_millis(1100)).await;

    net.s
        .publish(muc(author, 1_000_007, "nemo hunc nuntium videbit"))
        .unwrap();
    compio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(
        stored_payload(&net.r, &author).as_deref(),
        Some("cubus usoris mutabilis sum")
    );
}

#[compio::test]
async fn notification_propagates_to_the_subscribed_reader() {
    let net = linear_network(Duration::from_secs(60)).await;
    let notification_key = CubeKey::from_bytes([0x42; 32]);

    let stream = net.r.facade().subscribe_notifications(notification_key).await;
    assert!(net
        .r
        .scheduler()
        .subscription_status(notification_key, SubscriptionKind::Notifications)
        .await
        .is_some());

    let info = net
        .s
        .publish(
            CubeFields::new(CubeVariant::Pic)
                .with_date(1_000_000)
                .with_notify(notification_key)
                .with_payload(&b"Quaeso meam existentia cognoscas"[..]),
        )
        .unwrap();

    // The notification cube reaches every hop within a second.
    assert!(
        wait_for(Duration::from_secs(1), || {
            net.fn1.store().has_cube(&info.key)
                && net.fn2.store().has_cube(&info.key)
                && net.r.store().has_cube(&info.key)
        })
        .await
    );
    assert_eq!(net.fn1.store().notifications_for(&notification_key).len(), 1);

    let got = compio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("lazy sequence yields in time")
        .expect("stream alive");
    assert!(got
        .payload_string()
        .unwrap()
        .contains("Quaeso meam existentia cognoscas"));
}

#[compio::test]
async fn general_request_is_satisfied_by_peer_specific_delivery() {
    let net = linear_network(Duration::from_secs(60)).await;

    let info = net
        .s
        .publish(
            CubeFields::new(CubeVariant::Frozen)
                .with_date(1_000_000)
                .with_payload(&b"alias probandus"[..]),
        )
        .unwrap();
    compio::time::sleep(Duration::from_millis(200)).await;

    // Two general waiters dedup onto one record; both settle.
    let first = net
        .r
        .scheduler()
        .request_cube(info.key, RequestOptions::default())
        .await;
    let second = net
        .r
        .scheduler()
        .request_cube(info.key, RequestOptions::default())
        .await;

    let a = first.wait().await.expect("first settles");
    let b = second.wait().await.expect("second settles");
    assert_eq!(a.hash, b.hash);
}

#[compio::test]
async fn get_notifications_returns_stored_and_remote_matches() {
    let net = linear_network(Duration::from_secs(60)).await;
    let recipient = CubeKey::from_bytes([0x21; 32]);

    net.s
        .publish(
            CubeFields::new(CubeVariant::Pic)
                .with_date(1_000_000)
                .with_notify(recipient)
                .with_payload(&b"nuntius remotus"[..]),
        )
        .unwrap();
    compio::time::sleep(Duration::from_millis(300)).await;

    let got = net.r.facade().get_notifications(recipient).await;
    assert_eq!(got.len(), 1);
    assert_eq!(
        got[0].payload_string().as_deref(),
        Some("nuntius remotus")
    );
}
