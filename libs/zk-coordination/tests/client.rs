mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use common::{drain, next, Fixture, CHROOT_PATH};
use tokio::sync::mpsc;
use tracing_test::traced_test;
use zk_coordination::{
    codes, Acl, Client, Connection, ConnectionState, Create, CreateMode, EventDispatcher, Get,
    NodeEventKind, RawEvent, RawResult, Reactor, SessionInfo, Stat, Subscription, ZkError,
    ZkResult,
};

/// Every scenario runs twice: against the root of the tree and through a
/// chrooted connect string.
macro_rules! client_tests {
    ($($name:ident),* $(,)?) => {
        mod regular {
            use super::*;
            $(
                #[tokio::test]
                #[traced_test]
                async fn $name() -> Result<()> {
                    let f = Fixture::start(None).await?;
                    super::$name(&f).await?;
                    f.teardown().await
                }
            )*
        }

        mod chrooted {
            use super::*;
            $(
                #[tokio::test]
                #[traced_test]
                async fn $name() -> Result<()> {
                    let f = Fixture::start(Some(CHROOT_PATH)).await?;
                    super::$name(&f).await?;
                    f.teardown().await
                }
            )*
        }
    };
}

client_tests! {
    connect_and_close,
    connect_twice,
    get_success_deferred,
    get_success_callback,
    get_failure,
    create_success,
    create_sequential,
    create_failure,
    set_success,
    set_failure,
    exists,
    stat_success,
    stat_missing_node,
    delete,
    children,
    get_acl,
    set_acl,
    session_accessors,
    connection_lost_on_operation,
    expired_session_event,
    ensemble_expires_session,
    on_connected,
    on_connecting,
    on_connecting_reregisters,
    close_fails_inflight,
    mkdir_p_and_rm_rf,
    node_watch,
}

async fn connect_and_close(f: &Fixture) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.connect_then(move |res| {
        let _ = tx.send((res, Reactor::in_reactor()));
    });
    let (res, in_reactor) = next(&mut rx).await?;
    assert_eq!(res, Ok(()));
    assert!(in_reactor);
    assert!(f.zkem.is_connected());

    f.zkem.close().wait().await?;
    assert_eq!(f.zkem.state(), ConnectionState::Disconnected);
    assert_eq!(f.zkem.session_id(), None);
    Ok(())
}

async fn connect_twice(f: &Fixture) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let zkem = f.zkem.clone();
    f.zkem.connect_then(move |first| {
        let again = tx.clone();
        let _ = tx.send(("first", first));
        zkem.connect_then(move |second| {
            let _ = again.send(("second", second));
        });
        // the already-connected completion must be queued, not run inline
        let _ = tx.send(("returned", Ok(())));
    });
    assert_eq!(next(&mut rx).await?, ("first", Ok(())));
    assert_eq!(next(&mut rx).await?, ("returned", Ok(())));
    assert_eq!(next(&mut rx).await?, ("second", Ok(())));
    Ok(())
}

async fn get_success_deferred(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zk.create(&path, "this is data").wait().await?;
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let failed = tx.clone();
    f.zkem
        .get(&path)
        .on_success(move |(data, stat)| {
            let _ = tx.send(Ok((data.clone(), stat.clone(), Reactor::in_reactor())));
        })
        .on_failure(move |err| {
            let _ = failed.send(Err(err.clone()));
        });
    let (data, stat, in_reactor) = next(&mut rx).await??;
    assert_eq!(data, Bytes::from("this is data"));
    assert!(stat.exists());
    assert!(in_reactor);
    Ok(())
}

async fn get_success_callback(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zk.create(&path, "this is data").wait().await?;
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.get_then(&path, move |res| {
        let _ = tx.send((res, Reactor::in_reactor()));
    });
    let (res, in_reactor) = next(&mut rx).await?;
    let (data, stat) = res?;
    assert_eq!(data, Bytes::from("this is data"));
    assert_eq!(stat.data_length, 12);
    assert!(in_reactor);
    Ok(())
}

async fn get_failure(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let unexpected = tx.clone();
    f.zkem
        .get(&path)
        .on_success(move |_| {
            let _ = unexpected.send(None);
        })
        .on_failure(move |err| {
            let _ = tx.send(Some(err.clone()));
        });
    assert_eq!(next(&mut rx).await?, Some(ZkError::NoNode));

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.get_then(&path, move |res| {
        let _ = tx.send(res);
    });
    assert_eq!(next(&mut rx).await?, Err(ZkError::NoNode));
    Ok(())
}

async fn create_success(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.create(&path, "this is data").on_success(move |created| {
        let _ = tx.send((created.clone(), Reactor::in_reactor()));
    });
    assert_eq!(next(&mut rx).await?, (path.clone(), true));

    f.zk.delete(&path).wait().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.create_then(&path, "this is data", move |res| {
        let _ = tx.send(res);
    });
    assert_eq!(next(&mut rx).await?, Ok(path));
    Ok(())
}

async fn create_sequential(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zkem.connect().wait().await?;

    let created = f
        .zkem
        .call(Create::new(&path).data("this is data").sequential())
        .wait()
        .await?;
    let suffix = created
        .strip_prefix(path.as_str())
        .expect("sequential path keeps the requested prefix");
    assert_eq!(suffix.len(), 10);
    assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    Ok(())
}

async fn create_failure(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zk.create(&path, "").wait().await?;
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.create(&path, "").on_failure(move |err| {
        let _ = tx.send(err.clone());
    });
    assert_eq!(next(&mut rx).await?, ZkError::NodeExists);

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.create_then(&path, "", move |res| {
        let _ = tx.send(res);
    });
    assert_eq!(next(&mut rx).await?, Err(ZkError::NodeExists));
    Ok(())
}

async fn set_success(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zk.create(&path, "this is data").wait().await?;
    let orig = f.zk.stat(&path).wait().await?;
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.set_then(&path, "this is better data", move |res| {
        let _ = tx.send((res, Reactor::in_reactor()));
    });
    let (res, in_reactor) = next(&mut rx).await?;
    let stat = res?;
    assert!(stat.version > orig.version);
    assert!(in_reactor);

    let (data, _) = f.zk.get(&path).wait().await?;
    assert_eq!(data, Bytes::from("this is better data"));
    Ok(())
}

async fn set_failure(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zkem.connect().wait().await?;
    assert_eq!(
        f.zkem.set(&path, "data").wait().await,
        Err(ZkError::NoNode)
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.set_then(&path, "data", move |res| {
        let _ = tx.send(res.map(|_| ()));
    });
    assert_eq!(next(&mut rx).await?, Err(ZkError::NoNode));
    Ok(())
}

async fn exists(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let missing = tx.clone();
    f.zkem.exists_then(&path, move |res| {
        let _ = missing.send(res);
    });
    assert_eq!(next(&mut rx).await?, Ok(false));

    f.zk.create(&path, "").wait().await?;
    f.zkem.exists(&path).on_complete(move |res| {
        let _ = tx.send(res.copied().map_err(ZkError::clone));
    });
    assert_eq!(next(&mut rx).await?, Ok(true));
    Ok(())
}

async fn stat_success(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zk.create(&path, "this is data").wait().await?;
    let orig = f.zk.stat(&path).wait().await?;
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.stat_then(&path, move |res| {
        let _ = tx.send((res, Reactor::in_reactor()));
    });
    let (res, in_reactor) = next(&mut rx).await?;
    assert_eq!(res?, orig);
    assert!(in_reactor);
    Ok(())
}

async fn stat_missing_node(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem
        .stat(&path)
        .on_success(move |stat| {
            let _ = tx.send(stat.exists());
        })
        .on_failure(|err| panic!("stat of a missing node failed: {err}"));
    assert!(!next(&mut rx).await?);
    Ok(())
}

async fn delete(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zk.create(&path, "").wait().await?;
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.delete_then(&path, move |res| {
        let _ = tx.send((res, Reactor::in_reactor()));
    });
    assert_eq!(next(&mut rx).await?, (Ok(()), true));
    assert!(!f.zk.exists(&path).wait().await?);

    assert_eq!(f.zkem.delete(&path).wait().await, Err(ZkError::NoNode));
    Ok(())
}

async fn children(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zkem.connect().wait().await?;
    assert_eq!(
        f.zkem.children(&path).wait().await,
        Err(ZkError::NoNode)
    );

    f.zk.create(&path, "").wait().await?;
    f.zk.create(&format!("{path}/child_1"), "").wait().await?;
    f.zk.create(&format!("{path}/child_2"), "").wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.children_then(&path, move |res| {
        let _ = tx.send(res);
    });
    let (mut children, stat) = next(&mut rx).await??;
    children.sort();
    assert_eq!(children, vec!["child_1", "child_2"]);
    assert_eq!(stat.num_children, 2);
    Ok(())
}

async fn get_acl(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zkem.connect().wait().await?;
    assert_eq!(f.zkem.get_acl(&path).wait().await, Err(ZkError::NoNode));

    f.zk.create(&path, "").wait().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.get_acl_then(&path, move |res| {
        let _ = tx.send(res);
    });
    let (acls, stat) = next(&mut rx).await??;
    assert_eq!(acls, Acl::open_unsafe());
    assert!(stat.exists());
    Ok(())
}

async fn set_acl(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zkem.connect().wait().await?;
    assert_eq!(
        f.zkem.set_acl(&path, Acl::read_unsafe()).wait().await,
        Err(ZkError::NoNode)
    );

    f.zk.create(&path, "").wait().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.set_acl_then(&path, Acl::read_unsafe(), move |res| {
        let _ = tx.send(res);
    });
    let stat = next(&mut rx).await??;
    assert_eq!(stat.aversion, 1);
    let (acls, _) = f.zk.get_acl(&path).wait().await?;
    assert_eq!(acls, Acl::read_unsafe());
    Ok(())
}

async fn session_accessors(f: &Fixture) -> Result<()> {
    assert_eq!(f.zkem.session_id(), None);
    assert_eq!(f.zkem.session_password(), None);

    f.zkem.connect().wait().await?;
    assert!(f.zkem.session_id().is_some());
    assert!(!f.zkem.session_password().unwrap_or_default().is_empty());
    assert_ne!(f.zkem.session_id(), f.zk.session_id());
    Ok(())
}

async fn connection_lost_on_operation(f: &Fixture) -> Result<()> {
    let path = f.path("foo");
    f.zk.create(&path, "this is data").wait().await?;

    let (lost_tx, mut lost) = mpsc::unbounded_channel();
    f.zkem.on_connection_lost(move |err| {
        let _ = lost_tx.send(err.clone());
    });
    f.zkem.connect().wait().await?;

    f.conn.fail_next(codes::CONNECTION_LOSS);
    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.get_then(&path, move |res| {
        let _ = tx.send(res.map(|_| ()));
    });
    assert_eq!(next(&mut rx).await?, Err(ZkError::ConnectionLoss));
    assert_eq!(next(&mut lost).await?, ZkError::ConnectionLoss);
    assert!(f.zkem.state() == ConnectionState::ConnectionLost);
    Ok(())
}

async fn expired_session_event(f: &Fixture) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    for id in 0..2 {
        let tx = tx.clone();
        f.zkem.on_connection_lost(move |err| {
            let _ = tx.send((id, err.clone()));
        });
    }
    f.zkem.connect().wait().await?;

    f.zkem
        .event_dispatcher()
        .process(RawEvent::session(codes::STATE_EXPIRED_SESSION));
    assert_eq!(next(&mut rx).await?, (0, ZkError::SessionExpired));
    assert_eq!(next(&mut rx).await?, (1, ZkError::SessionExpired));
    drain(&f.zkem).await?;
    assert!(rx.try_recv().is_err(), "each watcher fires exactly once");
    Ok(())
}

async fn ensemble_expires_session(f: &Fixture) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.on_connection_lost(move |err| {
        let _ = tx.send(err.clone());
    });
    f.zkem.connect().wait().await?;
    f.zkem
        .call(Create::new(f.path("ephemeral")).ephemeral())
        .wait()
        .await?;

    f.conn.expire();
    assert_eq!(next(&mut rx).await?, ZkError::SessionExpired);
    assert_eq!(f.zkem.state(), ConnectionState::ConnectionLost);
    assert!(!f.zk.exists(&f.path("ephemeral")).wait().await?);
    assert!(f.ensemble.sessions() >= 1);
    Ok(())
}

async fn on_connected(f: &Fixture) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let zkem = f.zkem.clone();
    f.zkem.on_connected(move |state| {
        // session info is in place before user watchers run
        let _ = tx.send((*state, zkem.session_id().is_some()));
    });
    f.zkem.connect();
    assert_eq!(next(&mut rx).await?, (ConnectionState::Connected, true));
    Ok(())
}

async fn on_connecting(f: &Fixture) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.on_connecting(move |state| {
        let _ = tx.send(*state);
    });
    f.zkem.connect().wait().await?;
    assert_eq!(next(&mut rx).await?, ConnectionState::Connecting);

    f.zkem
        .event_dispatcher()
        .process(RawEvent::session(codes::STATE_CONNECTING));
    assert_eq!(next(&mut rx).await?, ConnectionState::Connecting);
    assert_eq!(f.zkem.state(), ConnectionState::Connecting);
    Ok(())
}

fn register_hook(
    client: Client,
    fired: mpsc::UnboundedSender<()>,
    slot: Arc<Mutex<Option<Subscription>>>,
) {
    let (c, s) = (client.clone(), slot.clone());
    let sub = client.on_connecting(move |_| {
        let prev = s.lock().unwrap().take();
        if let Some(sub) = prev {
            sub.unsubscribe();
        }
        register_hook(c.clone(), fired.clone(), s.clone());
        let _ = fired.send(());
    });
    *slot.lock().unwrap() = Some(sub);
}

async fn on_connecting_reregisters(f: &Fixture) -> Result<()> {
    f.zkem.connect().wait().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    register_hook(f.zkem.clone(), tx, Arc::new(Mutex::new(None)));

    for _ in 0..2 {
        f.zkem
            .event_dispatcher()
            .process(RawEvent::session(codes::STATE_CONNECTING));
    }
    next(&mut rx).await?;
    next(&mut rx).await?;
    drain(&f.zkem).await?;
    assert!(rx.try_recv().is_err(), "one invocation per pass");
    Ok(())
}

async fn close_fails_inflight(f: &Fixture) -> Result<()> {
    f.zkem.connect().wait().await?;
    f.conn.stall();
    let pending = f.zkem.call(Get::new(common::BASE_PATH));
    tokio::time::timeout(Duration::from_secs(2), async {
        while !f.conn.has_stalled() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(f.zkem.in_flight(), 1);

    f.zkem.close().wait().await?;
    assert_eq!(pending.wait().await, Err(ZkError::Closed));
    assert_eq!(f.zkem.in_flight(), 0);
    f.conn.resume();
    drain(&f.zkem).await?;
    // the late reply must not resurrect anything
    assert_eq!(pending.wait().await, Err(ZkError::Closed));
    Ok(())
}

async fn mkdir_p_and_rm_rf(f: &Fixture) -> Result<()> {
    let deep = f.path("a/b/c");
    f.zkem.connect().wait().await?;

    f.zkem.mkdir_p(&deep).wait().await?;
    assert!(f.zk.exists(&deep).wait().await?);
    // again, everything exists already
    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.mkdir_p_then(&deep, move |res| {
        let _ = tx.send(res);
    });
    assert_eq!(next(&mut rx).await?, Ok(()));

    f.zk.create(&f.path("a/b/sibling"), "x").wait().await?;
    f.zkem.rm_rf(&f.path("a")).wait().await?;
    assert!(!f.zk.exists(&f.path("a")).wait().await?);
    assert!(f.zk.exists(common::BASE_PATH).wait().await?);

    // nothing left to remove
    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.rm_rf_then(&f.path("a"), move |res| {
        let _ = tx.send(res);
    });
    assert_eq!(next(&mut rx).await?, Ok(()));
    assert_eq!(
        f.zkem.mkdir_p("relative/path").wait().await,
        Err(ZkError::BadArguments)
    );
    Ok(())
}

async fn node_watch(f: &Fixture) -> Result<()> {
    let path = f.path("watched");
    f.zk.create(&path, "v1").wait().await?;
    f.zkem.connect().wait().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    f.zkem.on_node_event(path.clone(), move |event| {
        let _ = tx.send(event.clone());
    });
    f.zkem.call(Get::new(&path).watch()).wait().await?;
    f.zk.set(&path, "v2").wait().await?;

    let event = next(&mut rx).await?;
    assert_eq!(event.kind, NodeEventKind::Changed);
    assert_eq!(event.path, path);

    // watches are one-shot
    f.zk.set(&path, "v3").wait().await?;
    drain(&f.zkem).await?;
    assert!(rx.try_recv().is_err());
    Ok(())
}

/// A session that starts connecting and is then refused by the ensemble
#[derive(Debug, Default)]
struct RefusedConnection {
    attempts: AtomicUsize,
}

#[async_trait]
impl Connection for RefusedConnection {
    async fn connect(&self, events: EventDispatcher) -> ZkResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        events.process(RawEvent::session(codes::STATE_CONNECTING));
        events.process(RawEvent::session(codes::STATE_AUTH_FAILED));
        Ok(())
    }

    async fn close(&self) -> ZkResult<()> {
        Ok(())
    }

    fn session(&self) -> Option<SessionInfo> {
        None
    }

    async fn get(&self, _: &str, _: bool) -> RawResult<(Bytes, Stat)> {
        RawResult::err(codes::CONNECTION_LOSS)
    }

    async fn set(&self, _: &str, _: Bytes, _: Option<i32>) -> RawResult<Stat> {
        RawResult::err(codes::CONNECTION_LOSS)
    }

    async fn create(&self, _: &str, _: Bytes, _: &[Acl], _: CreateMode) -> RawResult<String> {
        RawResult::err(codes::CONNECTION_LOSS)
    }

    async fn delete(&self, _: &str, _: Option<i32>) -> RawResult<()> {
        RawResult::err(codes::CONNECTION_LOSS)
    }

    async fn children(&self, _: &str, _: bool) -> RawResult<(Vec<String>, Stat)> {
        RawResult::err(codes::CONNECTION_LOSS)
    }

    async fn exists(&self, _: &str, _: bool) -> RawResult<Stat> {
        RawResult::err(codes::CONNECTION_LOSS)
    }

    async fn get_acl(&self, _: &str) -> RawResult<(Vec<Acl>, Stat)> {
        RawResult::err(codes::CONNECTION_LOSS)
    }

    async fn set_acl(&self, _: &str, _: &[Acl], _: Option<i32>) -> RawResult<Stat> {
        RawResult::err(codes::CONNECTION_LOSS)
    }
}

#[tokio::test]
#[traced_test]
async fn connect_fails_when_refused_while_connecting() -> Result<()> {
    let conn = Arc::new(RefusedConnection::default());
    let zkem = Client::shared(conn.clone());
    let (lost_tx, mut lost) = mpsc::unbounded_channel();
    zkem.on_connection_lost(move |err| {
        let _ = lost_tx.send(err.clone());
    });

    let first = tokio::time::timeout(Duration::from_secs(2), zkem.connect().wait()).await?;
    assert_eq!(first, Err(ZkError::AuthFailed));
    assert_eq!(zkem.state(), ConnectionState::ConnectionLost);
    assert_eq!(zkem.session_id(), None);
    assert_eq!(next(&mut lost).await?, ZkError::AuthFailed);

    // a later connect starts a fresh attempt instead of joining the dead one
    let (tx, mut rx) = mpsc::unbounded_channel();
    zkem.connect_then(move |res| {
        let _ = tx.send(res);
    });
    assert_eq!(next(&mut rx).await?, Err(ZkError::AuthFailed));
    assert_eq!(conn.attempts.load(Ordering::SeqCst), 2);
    Ok(())
}
