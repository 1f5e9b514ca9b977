//! `mkdir -p` and `rm -rf` for the node tree.
//!
//! Both are built from single operations, so they are not atomic: another
//! session may race them. `mkdir_p` tolerates ancestors that already exist,
//! `rm_rf` tolerates nodes that vanish under it.
use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::{
    bridge::Completion,
    client::Client,
    deferred::Deferred,
    error::{ZkError, ZkResult},
    ops::{Children, Create, Delete},
};

/// `/a/b/c` -> `/a`, `/a/b`, `/a/b/c`
fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut acc = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        acc.push('/');
        acc.push_str(part);
        out.push(acc.clone());
    }
    out
}

fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

fn remove_tree(client: Client, path: String) -> BoxFuture<'static, ZkResult<()>> {
    Box::pin(async move {
        let children = match client.call(Children::new(path.as_str())).wait().await {
            Ok((children, _)) => children,
            Err(ZkError::NoNode) => return Ok(()),
            Err(err) => return Err(err),
        };
        for child in children {
            remove_tree(client.clone(), child_path(&path, &child)).await?;
        }
        // the root itself can't be deleted, only emptied
        if path == "/" {
            return Ok(());
        }
        match client.call(Delete::new(path.as_str())).wait().await {
            Ok(()) | Err(ZkError::NoNode) => {
                trace!(%path, "removed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    })
}

impl Client {
    /// Create `path` and every missing ancestor as empty persistent nodes
    pub fn mkdir_p(&self, path: &str) -> Deferred<()> {
        self.mkdir_p_inner(path, None)
    }

    pub fn mkdir_p_then<F>(&self, path: &str, callback: F) -> Deferred<()>
    where
        F: FnOnce(ZkResult<()>) + Send + 'static,
    {
        let callback: Completion<()> = Box::new(callback);
        self.mkdir_p_inner(path, Some(callback))
    }

    /// Delete `path` and everything below it. A missing `path` is success.
    pub fn rm_rf(&self, path: &str) -> Deferred<()> {
        self.rm_rf_inner(path, None)
    }

    pub fn rm_rf_then<F>(&self, path: &str, callback: F) -> Deferred<()>
    where
        F: FnOnce(ZkResult<()>) + Send + 'static,
    {
        let callback: Completion<()> = Box::new(callback);
        self.rm_rf_inner(path, Some(callback))
    }

    fn mkdir_p_inner(&self, path: &str, callback: Option<Completion<()>>) -> Deferred<()> {
        let deferred = Deferred::new();
        let d = deferred.clone();
        let client = self.clone();
        let path = path.to_owned();
        self.reactor().spawn(async move {
            let res = if path.starts_with('/') {
                let mut res = Ok(());
                for dir in ancestors(&path) {
                    match client.call(Create::new(dir.as_str())).wait().await {
                        Ok(_) | Err(ZkError::NodeExists) => {}
                        Err(err) => {
                            res = Err(err);
                            break;
                        }
                    }
                }
                res
            } else {
                Err(ZkError::BadArguments)
            };
            debug!(%path, ok = res.is_ok(), "mkdir_p finished");
            finish(&client, d, callback, res);
        });
        deferred
    }

    fn rm_rf_inner(&self, path: &str, callback: Option<Completion<()>>) -> Deferred<()> {
        let deferred = Deferred::new();
        let d = deferred.clone();
        let client = self.clone();
        let path = path.to_owned();
        self.reactor().spawn(async move {
            let res = remove_tree(client.clone(), path.clone()).await;
            debug!(%path, ok = res.is_ok(), "rm_rf finished");
            finish(&client, d, callback, res);
        });
        deferred
    }
}

/// settle on the reactor, deferred first and then the callback
fn finish(
    client: &Client,
    deferred: Deferred<()>,
    callback: Option<Completion<()>>,
    res: ZkResult<()>,
) {
    client.reactor().next_tick(move || {
        let for_callback = callback.map(|cb| (cb, res.clone()));
        deferred.resolve(res);
        if let Some((cb, res)) = for_callback {
            cb(res);
        }
    });
}
