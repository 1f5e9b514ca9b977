//! In-memory coordination ensemble.
//!
//! [`MemoryEnsemble`] keeps a node tree shared by any number of
//! [`MemoryConnection`] sessions. It models what the client relies on:
//! versions, sequential and ephemeral nodes, ACL storage, one-shot data and
//! child watches, chroots and session expiry. On top of that a connection can
//! inject a result code into its next request ([`MemoryConnection::fail_next`])
//! or hold requests back ([`MemoryConnection::stall`]) to exercise in-flight
//! behavior.
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace};
use zkem_core::config::cli::{ConnectString, ConnectStringError};

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    connection::Connection,
    error::ZkResult,
    events::EventDispatcher,
    models::{Acl, CreateMode, RawEvent, SessionInfo, Stat},
    result::{codes, RawResult},
};

#[derive(Debug, Clone)]
struct Node {
    data: Bytes,
    acl: Vec<Acl>,
    stat: Stat,
}

#[derive(Debug)]
struct SessionEntry {
    dispatcher: EventDispatcher,
    chroot: Option<String>,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    zxid: i64,
    sessions: HashMap<i64, SessionEntry>,
    data_watches: HashMap<String, HashSet<i64>>,
    child_watches: HashMap<String, HashSet<i64>>,
}

/// events to deliver once the tree lock is released
type Outbox = Vec<(EventDispatcher, RawEvent)>;

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_owned(),
            Node {
                data: Bytes::new(),
                acl: Acl::open_unsafe(),
                stat: Stat::new(),
            },
        );
        Self {
            nodes,
            zxid: 0,
            sessions: HashMap::new(),
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
        }
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

fn valid_path(path: &str) -> bool {
    path == "/"
        || (path.starts_with('/') && !path.ends_with('/') && !path.contains("//"))
}

impl Tree {
    fn next_zxid(&mut self) -> i64 {
        self.zxid += 1;
        self.zxid
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_owned())
            })
            .collect()
    }

    fn watch(&mut self, child: bool, path: &str, session: i64) {
        let map = if child {
            &mut self.child_watches
        } else {
            &mut self.data_watches
        };
        map.entry(path.to_owned()).or_default().insert(session);
    }

    /// fire and clear the one-shot watches on `path`
    fn trigger(&mut self, child: bool, path: &str, event_type: i32, out: &mut Outbox) {
        let map = if child {
            &mut self.child_watches
        } else {
            &mut self.data_watches
        };
        let Some(sessions) = map.remove(path) else {
            return;
        };
        for id in sessions {
            let Some(entry) = self.sessions.get(&id) else {
                continue;
            };
            let client_path = match &entry.chroot {
                None => path.to_owned(),
                Some(root) if path == root => "/".to_owned(),
                Some(root) => match path.strip_prefix(root.as_str()) {
                    Some(rest) if rest.starts_with('/') => rest.to_owned(),
                    _ => continue,
                },
            };
            out.push((entry.dispatcher.clone(), RawEvent::node(event_type, client_path)));
        }
    }

    fn remove_node(&mut self, path: &str, out: &mut Outbox) {
        self.nodes.remove(path);
        let zxid = self.next_zxid();
        let parent = parent_of(path).to_owned();
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.stat.cversion += 1;
            node.stat.num_children -= 1;
            node.stat.pzxid = zxid;
        }
        self.trigger(false, path, codes::EVENT_DELETED, out);
        self.trigger(true, path, codes::EVENT_DELETED, out);
        self.trigger(true, &parent, codes::EVENT_CHILD, out);
    }

    fn end_session(&mut self, id: i64, out: &mut Outbox) {
        self.sessions.remove(&id);
        for watchers in self
            .data_watches
            .values_mut()
            .chain(self.child_watches.values_mut())
        {
            watchers.remove(&id);
        }
        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == id)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ephemerals {
            trace!(%path, "removing ephemeral node");
            self.remove_node(&path, out);
        }
    }
}

fn deliver(out: Outbox) {
    for (dispatcher, event) in out {
        dispatcher.process(event);
    }
}

/// A shared in-memory node tree
#[derive(Debug, Clone, Default)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    /// new session, every path relative to `chroot` if given
    pub fn connection(&self, chroot: Option<&str>) -> MemoryConnection {
        let (stall, _) = watch::channel(false);
        MemoryConnection {
            ensemble: self.clone(),
            chroot: chroot.filter(|c| *c != "/").map(str::to_owned),
            session: Mutex::new(None),
            faults: Mutex::new(VecDeque::new()),
            stall,
            parked: AtomicUsize::new(0),
        }
    }

    /// new session configured from a connect string; the hosts are ignored
    pub fn connect_string(&self, s: &str) -> Result<MemoryConnection, ConnectStringError> {
        let cs: ConnectString = s.parse()?;
        Ok(self.connection(cs.chroot()))
    }

    /// absolute paths of every node, root included
    pub fn paths(&self) -> Vec<String> {
        self.tree.lock().nodes.keys().cloned().collect()
    }

    /// number of live sessions
    pub fn sessions(&self) -> usize {
        self.tree.lock().sessions.len()
    }
}

/// One session against a [`MemoryEnsemble`]
pub struct MemoryConnection {
    ensemble: MemoryEnsemble,
    chroot: Option<String>,
    session: Mutex<Option<SessionInfo>>,
    faults: Mutex<VecDeque<i32>>,
    stall: watch::Sender<bool>,
    parked: AtomicUsize,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("chroot", &self.chroot)
            .field("session", &*self.session.lock())
            .field("stalled", &*self.stall.borrow())
            .finish()
    }
}

impl MemoryConnection {
    /// Answer the next request with `code` instead of executing it
    pub fn fail_next(&self, code: i32) {
        self.faults.lock().push_back(code);
    }

    /// Hold every request from now on until [`MemoryConnection::resume`]
    pub fn stall(&self) {
        self.stall.send_replace(true);
    }

    pub fn resume(&self) {
        self.stall.send_replace(false);
    }

    /// at least one request is being held back
    pub fn has_stalled(&self) -> bool {
        self.parked.load(Ordering::SeqCst) > 0
    }

    /// Expire the session as the ensemble would after a session timeout:
    /// ephemerals go away and the session receives an expired event.
    pub fn expire(&self) {
        let Some(info) = self.session.lock().take() else {
            return;
        };
        let mut out = Outbox::new();
        {
            let mut tree = self.ensemble.tree.lock();
            if let Some(entry) = tree.sessions.get(&info.id) {
                out.push((
                    entry.dispatcher.clone(),
                    RawEvent::session(codes::STATE_EXPIRED_SESSION),
                ));
            }
            tree.end_session(info.id, &mut out);
        }
        debug!(session = info.id, "session expired");
        deliver(out);
    }

    /// Report a session state to this session's dispatcher, as the network
    /// layer does on disconnects and reconnects.
    pub fn notify(&self, state: i32) {
        let Some(info) = self.session.lock().clone() else {
            return;
        };
        let dispatcher = self
            .ensemble
            .tree
            .lock()
            .sessions
            .get(&info.id)
            .map(|entry| entry.dispatcher.clone());
        if let Some(dispatcher) = dispatcher {
            dispatcher.process(RawEvent::session(state));
        }
    }

    /// absolute path for a client path, `None` if it is malformed
    fn resolve(&self, path: &str) -> Option<String> {
        if !valid_path(path) {
            return None;
        }
        Some(match (&self.chroot, path) {
            (None, _) => path.to_owned(),
            (Some(root), "/") => root.clone(),
            (Some(root), _) => format!("{root}{path}"),
        })
    }

    fn unresolve(&self, path: &str) -> String {
        match &self.chroot {
            Some(root) if path == root => "/".to_owned(),
            Some(root) => path.strip_prefix(root.as_str()).unwrap_or(path).to_owned(),
            None => path.to_owned(),
        }
    }

    /// Gate shared by every request: injected faults, stalls, and the
    /// session check. Returns the session id on admission.
    async fn admit(&self) -> Result<i64, i32> {
        if let Some(code) = self.faults.lock().pop_front() {
            return Err(code);
        }
        let mut rx = self.stall.subscribe();
        let mut parked = false;
        loop {
            let stalled = *rx.borrow_and_update();
            if !stalled {
                break;
            }
            if !parked {
                parked = true;
                self.parked.fetch_add(1, Ordering::SeqCst);
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        if parked {
            self.parked.fetch_sub(1, Ordering::SeqCst);
        }
        self.session
            .lock()
            .as_ref()
            .map(|s| s.id)
            .ok_or(codes::CONNECTION_LOSS)
    }

    /// run `f` against the tree after admission, then deliver its events
    async fn with_tree<T, F>(&self, path: &str, f: F) -> RawResult<T>
    where
        F: FnOnce(&mut Tree, i64, String, &mut Outbox) -> Result<T, i32>,
    {
        let session = match self.admit().await {
            Ok(id) => id,
            Err(code) => return RawResult::err(code),
        };
        let Some(full) = self.resolve(path) else {
            return RawResult::err(codes::BAD_ARGUMENTS);
        };
        let mut out = Outbox::new();
        let res = {
            let mut tree = self.ensemble.tree.lock();
            f(&mut tree, session, full, &mut out)
        };
        deliver(out);
        match res {
            Ok(v) => RawResult::ok(v),
            Err(code) => RawResult::err(code),
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn connect(&self, events: EventDispatcher) -> ZkResult<()> {
        let current = self.session.lock().clone();
        if let Some(info) = current {
            trace!(session = info.id, "already connected");
            events.process(RawEvent::session(codes::STATE_CONNECTED));
            return Ok(());
        }
        events.process(RawEvent::session(codes::STATE_CONNECTING));
        let info = SessionInfo {
            id: (rand::random::<i64>() & i64::MAX) | 1,
            password: rand::random::<[u8; 16]>().to_vec(),
        };
        self.ensemble.tree.lock().sessions.insert(
            info.id,
            SessionEntry {
                dispatcher: events.clone(),
                chroot: self.chroot.clone(),
            },
        );
        debug!(session = info.id, chroot = ?self.chroot, "session established");
        *self.session.lock() = Some(info);
        events.process(RawEvent::session(codes::STATE_CONNECTED));
        Ok(())
    }

    async fn close(&self) -> ZkResult<()> {
        let Some(info) = self.session.lock().take() else {
            return Ok(());
        };
        let mut out = Outbox::new();
        self.ensemble.tree.lock().end_session(info.id, &mut out);
        debug!(session = info.id, "session closed");
        deliver(out);
        Ok(())
    }

    fn session(&self) -> Option<SessionInfo> {
        self.session.lock().clone()
    }

    async fn get(&self, path: &str, watch: bool) -> RawResult<(Bytes, Stat)> {
        self.with_tree(path, |tree, session, full, _| {
            let node = tree.nodes.get(&full).ok_or(codes::NO_NODE)?.clone();
            if watch {
                tree.watch(false, &full, session);
            }
            Ok((node.data, node.stat))
        })
        .await
    }

    async fn set(&self, path: &str, data: Bytes, version: Option<i32>) -> RawResult<Stat> {
        self.with_tree(path, |tree, _, full, out| {
            let zxid = tree.next_zxid();
            let node = tree.nodes.get_mut(&full).ok_or(codes::NO_NODE)?;
            if version.is_some_and(|v| v != node.stat.version) {
                return Err(codes::BAD_VERSION);
            }
            node.stat.data_length = data.len() as i32;
            node.data = data;
            node.stat.version += 1;
            node.stat.mzxid = zxid;
            node.stat.mtime = Utc::now().timestamp_millis();
            let stat = node.stat.clone();
            tree.trigger(false, &full, codes::EVENT_CHANGED, out);
            Ok(stat)
        })
        .await
    }

    async fn create(
        &self,
        path: &str,
        data: Bytes,
        acl: &[Acl],
        mode: CreateMode,
    ) -> RawResult<String> {
        if acl.is_empty() {
            return RawResult::err(codes::INVALID_ACL);
        }
        let created = self
            .with_tree(path, |tree, session, full, out| {
                if full == "/" {
                    return Err(codes::NODE_EXISTS);
                }
                let parent_path = parent_of(&full).to_owned();
                let parent = tree.nodes.get(&parent_path).ok_or(codes::NO_NODE)?;
                if parent.stat.is_ephemeral() {
                    return Err(codes::NO_CHILDREN_FOR_EPHEMERALS);
                }
                let full = if mode.is_sequential() {
                    format!("{full}{:010}", parent.stat.cversion)
                } else {
                    full
                };
                if tree.nodes.contains_key(&full) {
                    return Err(codes::NODE_EXISTS);
                }
                let zxid = tree.next_zxid();
                let now = Utc::now().timestamp_millis();
                let mut stat = Stat::new();
                stat.czxid = zxid;
                stat.mzxid = zxid;
                stat.pzxid = zxid;
                stat.ctime = now;
                stat.mtime = now;
                stat.data_length = data.len() as i32;
                if mode.is_ephemeral() {
                    stat.ephemeral_owner = session;
                }
                tree.nodes.insert(
                    full.clone(),
                    Node {
                        data,
                        acl: acl.to_vec(),
                        stat,
                    },
                );
                if let Some(parent) = tree.nodes.get_mut(&parent_path) {
                    parent.stat.cversion += 1;
                    parent.stat.num_children += 1;
                    parent.stat.pzxid = zxid;
                }
                tree.trigger(false, &full, codes::EVENT_CREATED, out);
                tree.trigger(true, &parent_path, codes::EVENT_CHILD, out);
                Ok(full)
            })
            .await;
        created.map(|full| self.unresolve(&full))
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> RawResult<()> {
        self.with_tree(path, |tree, _, full, out| {
            if full == "/" {
                return Err(codes::BAD_ARGUMENTS);
            }
            let node = tree.nodes.get(&full).ok_or(codes::NO_NODE)?;
            if version.is_some_and(|v| v != node.stat.version) {
                return Err(codes::BAD_VERSION);
            }
            if node.stat.num_children > 0 {
                return Err(codes::NOT_EMPTY);
            }
            tree.remove_node(&full, out);
            Ok(())
        })
        .await
    }

    async fn children(&self, path: &str, watch: bool) -> RawResult<(Vec<String>, Stat)> {
        self.with_tree(path, |tree, session, full, _| {
            let stat = tree.nodes.get(&full).ok_or(codes::NO_NODE)?.stat.clone();
            if watch {
                tree.watch(true, &full, session);
            }
            Ok((tree.children_of(&full), stat))
        })
        .await
    }

    async fn exists(&self, path: &str, watch: bool) -> RawResult<Stat> {
        self.with_tree(path, |tree, session, full, _| {
            // armed whether or not the node exists, fires on creation otherwise
            if watch {
                tree.watch(false, &full, session);
            }
            tree.nodes
                .get(&full)
                .map(|node| node.stat.clone())
                .ok_or(codes::NO_NODE)
        })
        .await
    }

    async fn get_acl(&self, path: &str) -> RawResult<(Vec<Acl>, Stat)> {
        self.with_tree(path, |tree, _, full, _| {
            let node = tree.nodes.get(&full).ok_or(codes::NO_NODE)?;
            Ok((node.acl.clone(), node.stat.clone()))
        })
        .await
    }

    async fn set_acl(&self, path: &str, acl: &[Acl], version: Option<i32>) -> RawResult<Stat> {
        if acl.is_empty() {
            return RawResult::err(codes::INVALID_ACL);
        }
        self.with_tree(path, |tree, _, full, _| {
            let node = tree.nodes.get_mut(&full).ok_or(codes::NO_NODE)?;
            if version.is_some_and(|v| v != node.stat.aversion) {
                return Err(codes::BAD_VERSION);
            }
            node.acl = acl.to_vec();
            node.stat.aversion += 1;
            Ok(node.stat.clone())
        })
        .await
    }
}
