//! Group membership tests against the in-memory coordinator.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use ballot::client::memory::MemoryCluster;
use ballot::client::{Acl, CoordinatorClient, CreateMode};
use ballot::error::Error;
use ballot::group::{Group, GroupConfig, Membership};

fn start_group(cluster: &MemoryCluster, znode: &str) -> Group {
    let config = GroupConfig::new("memory:0", znode);
    Group::new(Arc::new(cluster.clone()), config).expect("valid group config")
}

async fn session_id(group: &Group) -> i64 {
    loop {
        if let Some(session) = group.session().await.expect("group alive") {
            return session;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_join_creates_member_with_payload() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");

    let membership = group.join("10.0.0.1:5050").await.unwrap();
    assert!(cluster.contains("/elect/0000000000"));

    let payload = group.data(&membership).await.unwrap();
    assert_eq!(payload, Bytes::from_static(b"10.0.0.1:5050"));
}

#[tokio::test]
async fn test_join_sequences_are_strictly_increasing() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");

    let first = group.join("a").await.unwrap();
    let second = group.join("b").await.unwrap();
    let third = group.join("c").await.unwrap();

    assert!(first.id() < second.id());
    assert!(second.id() < third.id());
}

#[tokio::test]
async fn test_watch_resolves_on_first_member() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");

    let watcher = {
        let group = group.clone();
        tokio::spawn(async move { group.watch(&BTreeSet::new()).await })
    };

    let membership = group.join("a").await.unwrap();

    let members = watcher.await.unwrap().unwrap();
    assert_eq!(members.len(), 1);
    assert!(members.contains(&membership));
}

#[tokio::test]
async fn test_watch_with_current_set_waits_for_change() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");

    let membership = group.join("a").await.unwrap();
    let current = group.watch(&BTreeSet::new()).await.unwrap();
    assert!(current.contains(&membership));

    // Expecting exactly the current set: stays pending...
    let watcher = {
        let group = group.clone();
        let current = current.clone();
        tokio::spawn(async move { group.watch(&current).await })
    };
    let still_pending = tokio::time::timeout(Duration::from_millis(50), watcher).await;
    assert!(still_pending.is_err());

    // ...until the set changes.
    let watcher = {
        let group = group.clone();
        let current = current.clone();
        tokio::spawn(async move { group.watch(&current).await })
    };
    group.cancel(&membership).await.unwrap();
    let members = watcher.await.unwrap().unwrap();
    assert!(members.is_empty());
}

#[tokio::test]
async fn test_watch_sees_members_of_other_groups() {
    let cluster = MemoryCluster::new();
    let ours = start_group(&cluster, "/elect");
    let theirs = start_group(&cluster, "/elect");

    let membership = theirs.join("them").await.unwrap();

    let members = ours.watch(&BTreeSet::new()).await.unwrap();
    assert_eq!(members.len(), 1);
    // Memberships minted by different group instances compare equal.
    assert!(members.contains(&membership));

    // An unowned member's payload is readable too.
    let observed = members.iter().next().unwrap();
    assert_eq!(
        ours.data(observed).await.unwrap(),
        Bytes::from_static(b"them")
    );
}

#[tokio::test]
async fn test_cancel_owned_membership() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");

    let membership = group.join("a").await.unwrap();
    assert!(group.cancel(&membership).await.unwrap());
    assert!(!cluster.contains("/elect/0000000000"));

    // The cancellation signal reports that we caused the deletion.
    assert_eq!(membership.cancelled().await, Ok(true));
}

#[tokio::test]
async fn test_cancel_unowned_membership_is_rejected() {
    let cluster = MemoryCluster::new();
    let ours = start_group(&cluster, "/elect");
    let theirs = start_group(&cluster, "/elect");

    let membership = theirs.join("them").await.unwrap();
    let observed = ours.watch(&BTreeSet::new()).await.unwrap();
    assert!(observed.contains(&membership));

    assert_eq!(
        ours.cancel(&membership).await,
        Err(Error::NotOwned(membership.id()))
    );
    // Their member is untouched.
    assert!(cluster.contains("/elect/0000000000"));
}

#[tokio::test]
async fn test_external_delete_cancels_with_false() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");

    let membership = group.join("a").await.unwrap();
    let signal = {
        let membership = membership.clone();
        tokio::spawn(async move { membership.cancelled().await })
    };

    // An operator removes the znode out from under us.
    cluster.remove("/elect/0000000000");

    assert_eq!(signal.await.unwrap(), Ok(false));

    // Cancelling afterwards finds nothing owned.
    assert_eq!(
        group.cancel(&membership).await,
        Err(Error::NotOwned(membership.id()))
    );
}

#[tokio::test]
async fn test_session_expiration_cancels_all_memberships_with_false() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");

    let first = group.join("a").await.unwrap();
    let second = group.join("b").await.unwrap();

    cluster.expire_session(session_id(&group).await);

    assert_eq!(first.cancelled().await, Ok(false));
    assert_eq!(second.cancelled().await, Ok(false));

    // The group transparently re-initializes: a new join works and gets a
    // larger sequence than anything before the expiration.
    let rejoined = group.join("a2").await.unwrap();
    assert!(rejoined.id() > second.id());
}

#[tokio::test]
async fn test_session_returns_current_id() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");

    let membership = group.join("a").await.unwrap();
    let before = session_id(&group).await;

    cluster.expire_session(before);
    assert_eq!(membership.cancelled().await, Ok(false));

    // Force a round-trip so the new session is established, then the id
    // must have changed.
    group.join("b").await.unwrap();
    let after = session_id(&group).await;
    assert_ne!(before, after);
}

#[tokio::test]
async fn test_session_is_none_while_disconnected() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");
    group.join("a").await.unwrap();

    cluster.partition();
    // Wait for the group to notice the disconnect.
    loop {
        if group.session().await.unwrap().is_none() {
            break;
        }
        tokio::task::yield_now().await;
    }

    cluster.restore();
    assert!(group.session().await.is_ok());
}

#[tokio::test]
async fn test_operations_ride_out_a_short_partition() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");
    group.join("a").await.unwrap();

    cluster.partition();
    let join = {
        let group = group.clone();
        tokio::spawn(async move { group.join("b").await })
    };
    let pending = tokio::time::timeout(Duration::from_millis(50), join).await;
    assert!(pending.is_err(), "join must wait for the network");

    let join = {
        let group = group.clone();
        tokio::spawn(async move { group.join("b").await })
    };
    cluster.restore();

    let membership = join.await.unwrap().unwrap();
    assert_eq!(
        group.data(&membership).await.unwrap(),
        Bytes::from_static(b"b")
    );
}

#[tokio::test(start_paused = true)]
async fn test_partition_beyond_timeout_forces_expiration() {
    let cluster = MemoryCluster::new();
    let config = GroupConfig::new("memory:0", "/elect")
        .with_session_timeout(Duration::from_secs(5));
    let group = Group::new(Arc::new(cluster.clone()), config).unwrap();

    let membership = group.join("a").await.unwrap();
    let watcher = {
        let group = group.clone();
        let current = group.watch(&BTreeSet::new()).await.unwrap();
        tokio::spawn(async move { group.watch(&current).await })
    };

    cluster.partition();

    // The watchdog forces local expiration: the membership resolves as
    // cancelled (not by us) and queued operations fail in bounded time.
    assert_eq!(membership.cancelled().await, Ok(false));
    assert_eq!(watcher.await.unwrap(), Err(Error::SessionExpired));

    // After the network heals the group comes back on a fresh session.
    cluster.restore();
    let rejoined = group.join("a").await.unwrap();
    assert!(rejoined.id() > membership.id());
}

#[tokio::test]
async fn test_rejected_credentials_latch_the_group() {
    let cluster = MemoryCluster::new();
    cluster.reject_credentials(true);

    let config = GroupConfig::new("memory:0", "/elect")
        .with_auth(ballot::client::Authentication::digest("user:pass"));
    let group = Group::new(Arc::new(cluster.clone()), config).unwrap();

    assert!(matches!(group.join("a").await, Err(Error::AuthFailed(_))));

    // The latch is permanent: the cluster accepting credentials again
    // does not revive the group.
    cluster.reject_credentials(false);
    assert!(matches!(group.join("a").await, Err(Error::AuthFailed(_))));
    assert!(matches!(group.session().await, Err(Error::AuthFailed(_))));
}

#[tokio::test]
async fn test_unparsable_member_names_are_ignored() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");
    let membership = group.join("a").await.unwrap();

    // Something else put a non-member znode under the parent.
    let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
    let raw = ballot::client::Connector::connect(&cluster, Duration::from_secs(10), events);
    raw.create("/elect/garbage", Bytes::new(), Acl::Open, CreateMode::Persistent)
        .await
        .unwrap();

    let members = group.watch(&BTreeSet::new()).await.unwrap();
    let ids: Vec<u64> = members.iter().map(Membership::id).collect();
    assert_eq!(ids, vec![membership.id()]);
}

#[tokio::test]
async fn test_group_survives_dropped_callers() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");

    // A caller that gives up on its join does not wedge the group.
    cluster.partition();
    let join = {
        let group = group.clone();
        tokio::spawn(async move { group.join("abandoned").await })
    };
    join.abort();
    cluster.restore();

    let membership = group.join("kept").await.unwrap();
    assert!(group.cancel(&membership).await.unwrap());
}

#[tokio::test]
async fn test_dropping_the_group_closes_the_session() {
    let cluster = MemoryCluster::new();
    let group = start_group(&cluster, "/elect");
    group.join("a").await.unwrap();
    assert_eq!(cluster.session_count(), 1);

    drop(group);
    // The actor shuts down and the coordinator reclaims the ephemerals.
    loop {
        if cluster.session_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(!cluster.contains("/elect/0000000000"));
    assert!(cluster.contains("/elect"));
}
