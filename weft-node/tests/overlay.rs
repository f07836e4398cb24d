//! End-to-end overlay tests over loopback TCP: peering, pub/sub delivery,
//! multi-hop forwarding, and revocation convergence.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use weft_node::{Config, Endpoint, Filter, StatusKind, Topic, Value};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const NO_RETRY: Duration = Duration::ZERO;

fn topic(text: &str) -> Topic {
    Topic::parse(text).unwrap()
}

fn filter(prefixes: &[&str]) -> Filter {
    prefixes.iter().map(|p| topic(p)).collect()
}

/// Polls `$cond` until it holds or five seconds pass.
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let mut ok = false;
        for _ in 0..200 {
            if $cond {
                ok = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if !ok {
            panic!("timed out waiting for {}", $what);
        }
    }};
}

async fn connect(from: &Endpoint, to: &Endpoint) -> u16 {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let port = to.listen(LOCALHOST, 0).await.unwrap();
    from.peer(LOCALHOST, port, NO_RETRY).await.unwrap();
    port
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_reaches_remote_subscriber() {
    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(Config::default());
    connect(&a, &b).await;

    let subscriber = a.make_subscriber(filter(&["t"]), None).await.unwrap();

    // Publish once the subscription has propagated to the publisher side.
    let a_id = a.id();
    eventually!(
        "b to learn a's subscription",
        b.peers()
            .await
            .iter()
            .any(|p| p.id == a_id && p.filter.matches(&topic("t/x")))
    );

    b.publish(topic("t/x"), Value::Count(42)).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), subscriber.recv())
        .await
        .expect("message within one second");
    assert_eq!(received, (topic("t/x"), Value::Count(42)));
    // Exactly one message.
    assert_eq!(subscriber.try_recv(), None);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn chain_forwards_without_local_delivery_in_the_middle() {
    // a -- b -- c, with b peering both ends.
    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(Config::default());
    let c = Endpoint::new(Config::default());
    connect(&b, &a).await;
    connect(&b, &c).await;

    let a_sub = a.make_subscriber(filter(&["p"]), None).await.unwrap();
    let b_sub = b.make_subscriber(filter(&["unrelated"]), None).await.unwrap();

    let a_id = a.id();
    eventually!(
        "c to learn a's subscription transitively",
        c.peers()
            .await
            .iter()
            .any(|p| p.id == a_id && p.filter.matches(&topic("p/q")))
    );

    c.publish(topic("p/q"), Value::from("hi")).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), a_sub.recv())
        .await
        .expect("multi-hop delivery");
    assert_eq!(received, (topic("p/q"), Value::from("hi")));

    // The relay must not deliver locally: its own filter does not match.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(b_sub.try_recv(), None);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ring_reconverges_after_link_break() {
    // Ring: a -- b -- c -- a.
    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(Config::default());
    let c = Endpoint::new(Config::default());

    let b_port = connect(&a, &b).await;
    connect(&b, &c).await;
    connect(&c, &a).await;

    let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());
    eventually!("full mesh knowledge", {
        let a_peers = a.peers().await;
        let b_peers = b.peers().await;
        let c_peers = c.peers().await;
        let knows = |infos: &[weft_node::PeerInfo], x, y| {
            infos.iter().any(|p| p.id == x) && infos.iter().any(|p| p.id == y)
        };
        knows(&a_peers, b_id, c_id) && knows(&b_peers, a_id, c_id) && knows(&c_peers, a_id, b_id)
    });

    // Sever a -- b.
    assert!(a.unpeer(LOCALHOST, b_port).await);

    // Within two seconds every table reflects the detour through c.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let a_sees_b = a
            .peers()
            .await
            .into_iter()
            .find(|p| p.id == b_id)
            .map(|p| (p.is_direct, p.distance));
        let b_sees_a = b
            .peers()
            .await
            .into_iter()
            .find(|p| p.id == a_id)
            .map(|p| (p.is_direct, p.distance));
        if a_sees_b == Some((false, Some(2))) && b_sees_a == Some((false, Some(2))) {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("tables did not reconverge: a→b {a_sees_b:?}, b→a {b_sees_a:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // And traffic still flows a → b over the detour.
    let b_sub = b.make_subscriber(filter(&["ring"]), None).await.unwrap();
    eventually!(
        "a to learn b's new subscription",
        a.peers()
            .await
            .iter()
            .any(|p| p.id == b_id && p.filter.matches(&topic("ring/x")))
    );
    a.publish(topic("ring/x"), Value::Count(7)).await.unwrap();
    let received = tokio::time::timeout(Duration::from_secs(1), b_sub.recv())
        .await
        .expect("delivery over the detour");
    assert_eq!(received.1, Value::Count(7));

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unpeer_reports_whether_a_peering_existed() {
    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(Config::default());
    let port = connect(&a, &b).await;

    assert!(a.unpeer(LOCALHOST, port).await);
    eventually!(
        "the peering to tear down",
        a.peers().await.iter().all(|p| p.id != b.id())
    );
    assert!(!a.unpeer(LOCALHOST, port).await);
    assert!(!a.unpeer(LOCALHOST, 1).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_to_targets_one_endpoint_regardless_of_filters() {
    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(Config::default());
    connect(&a, &b).await;

    let b_sub = b.make_subscriber(filter(&["direct"]), None).await.unwrap();
    let other_sub = b.make_subscriber(filter(&["other"]), None).await.unwrap();

    let b_id = b.id();
    assert!(a.await_peer(b_id, Some(Duration::from_secs(2))).await);
    a.publish_to(b_id, topic("direct/x"), Value::Boolean(true))
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(1), b_sub.recv())
        .await
        .expect("addressed delivery");
    assert_eq!(received.0, topic("direct/x"));
    assert_eq!(other_sub.try_recv(), None);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn non_forwarding_endpoint_terminates_traffic() {
    let mut relay_config = Config::default();
    relay_config.apply("forward", "false").unwrap();

    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(relay_config);
    let c = Endpoint::new(Config::default());
    connect(&b, &a).await;
    connect(&b, &c).await;

    let a_sub = a.make_subscriber(filter(&["p"]), None).await.unwrap();

    // b never forwards a's flood, so c cannot learn the subscription and
    // nothing crosses the relay.
    tokio::time::sleep(Duration::from_millis(500)).await;
    c.publish(topic("p/q"), Value::Count(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a_sub.try_recv(), None);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn event_subscriber_sees_peer_lifecycle() {
    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(Config::default());
    let mut events = a.make_event_subscriber(true);

    let port = connect(&a, &b).await;

    let added = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.receive().await {
                Some(weft_node::Event::Status(status))
                    if status.kind == StatusKind::PeerAdded =>
                {
                    return status;
                }
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("peer-added status");
    assert_eq!(added.endpoint, Some(b.id()));

    a.unpeer(LOCALHOST, port).await;
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.receive().await {
                Some(weft_node::Event::Status(status))
                    if status.kind == StatusKind::PeerRemoved =>
                {
                    return;
                }
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("peer-removed status");

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn peering_an_unreachable_address_fails() {
    let a = Endpoint::new(Config::default());
    // An address nothing listens on.
    let err = a.peer(LOCALHOST, 1, NO_RETRY).await.unwrap_err();
    let kind = err.kind();
    assert!(
        matches!(
            kind,
            weft_node::ErrorKind::PeerUnavailable | weft_node::ErrorKind::PeerTimeout
        ),
        "unexpected kind {kind:?}"
    );
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_idempotent_and_blocks_new_calls() {
    let a = Endpoint::new(Config::default());
    a.shutdown().await;
    a.shutdown().await;
    let err = a.publish(topic("t"), Value::None).await.unwrap_err();
    assert!(matches!(err, weft_node::EndpointError::ShuttingDown));
}
