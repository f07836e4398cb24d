//! End-to-end master/clone tests over loopback TCP: replication, partition
//! buffering, stale reads, and TTL expiry.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use weft_model::value::Timespan;
use weft_node::{BackendKind, BackendOptions, Config, Endpoint, StoreError, Value};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const NO_RETRY: Duration = Duration::ZERO;

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

fn key(text: &str) -> Value {
    Value::from(text)
}

#[tokio::test(flavor = "multi_thread")]
async fn clone_syncs_and_relays_writes() {
    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(Config::default());
    connect(&b, &a).await;

    let master = a
        .attach_master("inventory", BackendKind::Memory, BackendOptions::default())
        .await
        .unwrap();
    master.put(key("k"), Value::from("v"), None).await.unwrap();

    let clone = b
        .attach_clone(
            "inventory",
            Duration::from_millis(200),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    // The clone bootstraps from a snapshot.
    eventually!(
        "clone to see the snapshot",
        clone.get(key("k")).await == Ok(Value::from("v"))
    );

    // Subsequent master writes arrive over the command stream.
    master.put(key("k2"), Value::Count(2), None).await.unwrap();
    eventually!(
        "clone to follow the stream",
        clone.get(key("k2")).await == Ok(Value::Count(2))
    );

    // Writes on the clone land on the master.
    clone.put(key("k3"), Value::from("w"), None).await.unwrap();
    eventually!(
        "master to apply the relayed write",
        master.get(key("k3")).await == Ok(Value::from("w"))
    );

    assert_eq!(clone.name(), "inventory");
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn partitioned_clone_buffers_and_reconciles() {
    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(Config::default());
    let a_port = connect(&b, &a).await;

    let master = a
        .attach_master("inventory", BackendKind::Memory, BackendOptions::default())
        .await
        .unwrap();
    let clone = b
        .attach_clone(
            "inventory",
            Duration::from_millis(250),
            Duration::from_secs(3),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    master.put(key("k"), Value::from("v"), None).await.unwrap();
    eventually!(
        "clone to see k=v",
        clone.get(key("k")).await == Ok(Value::from("v"))
    );

    // Partition: drop the only link between the endpoints.
    assert!(b.unpeer(LOCALHOST, a_port).await);

    // The write lands in the clone's buffer.
    clone.put(key("k"), Value::from("w"), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(master.get(key("k")).await.unwrap(), Value::from("v"));

    // Reconnect within the buffer window: the queued write drains.
    b.peer(LOCALHOST, a_port, NO_RETRY).await.unwrap();
    eventually!(
        "master to end at k=w",
        master.get(key("k")).await == Ok(Value::from("w"))
    );
    eventually!(
        "clone to converge on k=w",
        clone.get(key("k")).await == Ok(Value::from("w"))
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn long_partition_makes_clone_reads_stale() {
    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(Config::default());
    let a_port = connect(&b, &a).await;

    let master = a
        .attach_master("inventory", BackendKind::Memory, BackendOptions::default())
        .await
        .unwrap();
    master.put(key("k"), Value::from("v"), None).await.unwrap();

    let clone = b
        .attach_clone(
            "inventory",
            Duration::from_millis(200),
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    eventually!(
        "clone to sync",
        clone.get(key("k")).await == Ok(Value::from("v"))
    );

    assert!(b.unpeer(LOCALHOST, a_port).await);

    // Inside the stale window the cached value still answers.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(clone.get(key("k")).await.unwrap(), Value::from("v"));

    // Once the window passes, reads report staleness.
    eventually!(
        "reads to turn stale",
        clone.get(key("k")).await == Err(StoreError::Stale)
    );

    // Reconnecting recovers through a fresh snapshot.
    b.peer(LOCALHOST, a_port, NO_RETRY).await.unwrap();
    eventually!(
        "clone to recover",
        clone.get(key("k")).await == Ok(Value::from("v"))
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ttl_expires_on_schedule() {
    let a = Endpoint::new(Config::default());
    let master = a
        .attach_master("cache", BackendKind::Memory, BackendOptions::default())
        .await
        .unwrap();

    master
        .put(key("k"), Value::Count(1), Some(Timespan::from_millis(100)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(master.get(key("k")).await.unwrap(), Value::Count(1));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(master.get(key("k")).await, Err(StoreError::NoSuchKey));

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn numeric_add_subtract_roundtrips_through_the_frontend() {
    let a = Endpoint::new(Config::default());
    let master = a
        .attach_master("counters", BackendKind::Memory, BackendOptions::default())
        .await
        .unwrap();

    master.put(key("n"), Value::Count(10), None).await.unwrap();
    master.add(key("n"), Value::Count(5), None).await.unwrap();
    master
        .subtract(key("n"), Value::Count(5), None)
        .await
        .unwrap();
    assert_eq!(master.get(key("n")).await.unwrap(), Value::Count(10));

    // Mixed tags clash.
    assert_eq!(
        master.add(key("n"), Value::from("x"), None).await,
        Err(StoreError::TypeClash)
    );

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn second_master_for_a_name_is_rejected() {
    let a = Endpoint::new(Config::default());
    let _first = a
        .attach_master("inventory", BackendKind::Memory, BackendOptions::default())
        .await
        .unwrap();

    let err = a
        .attach_master("inventory", BackendKind::Memory, BackendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        weft_node::EndpointError::Store(StoreError::MasterExists)
    ));

    // Nor may the same endpoint host a clone of its own master.
    let err = a
        .attach_clone(
            "inventory",
            Duration::from_secs(1),
            Duration::from_secs(3),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        weft_node::EndpointError::Store(StoreError::MasterExists)
    ));

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sqlite_backend_works_through_the_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let a = Endpoint::new(Config::default());
    let master = a
        .attach_master(
            "durable",
            BackendKind::Sqlite,
            BackendOptions {
                path: Some(dir.path().join("durable.db")),
            },
        )
        .await
        .unwrap();

    master
        .put(key("k"), Value::List(vec![Value::Count(1)]), None)
        .await
        .unwrap();
    assert_eq!(
        master.get(key("k")).await.unwrap(),
        Value::List(vec![Value::Count(1)])
    );
    assert_eq!(master.size().await.unwrap(), 1);

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_frontend_completes_out_of_band() {
    let a = Endpoint::new(Config::default());
    let master = a
        .attach_master("inventory", BackendKind::Memory, BackendOptions::default())
        .await
        .unwrap();
    master.put(key("k"), Value::Count(9), None).await.unwrap();

    let mut proxy = master.clone().into_proxy();
    let get_id = proxy.get(key("k"));
    let exists_id = proxy.exists(key("missing"));

    let mut answers = std::collections::HashMap::new();
    for _ in 0..2 {
        let (id, answer) = proxy.receive().await.unwrap();
        answers.insert(id, answer);
    }
    assert_eq!(answers.remove(&get_id), Some(Ok(Value::Count(9))));
    assert_eq!(answers.remove(&exists_id), Some(Ok(Value::Boolean(false))));

    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn frontend_timeout_surfaces_as_request_timeout() {
    let a = Endpoint::new(Config::default());
    let b = Endpoint::new(Config::default());
    connect(&b, &a).await;

    // A clone with no master anywhere: bounded reads time out.
    let clone = b
        .attach_clone(
            "nowhere",
            Duration::from_millis(200),
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(300));

    assert_eq!(clone.get(key("k")).await, Err(StoreError::Timeout));

    a.shutdown().await;
    b.shutdown().await;
}
