use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use zk_coordination::{Client, MemoryConnection, MemoryEnsemble};

pub const BASE_PATH: &str = "/zk-em-testing";
pub const CHROOT_PATH: &str = "/_zkem_chroot_";

/// Everything a test needs: a helper client `zk` that is already connected
/// and has prepared `BASE_PATH`, and the client under test `zkem` which is
/// not connected yet.
pub struct Fixture {
    pub ensemble: MemoryEnsemble,
    pub zk: Client,
    pub zkem: Client,
    pub conn: Arc<MemoryConnection>,
}

impl Fixture {
    pub async fn start(chroot: Option<&str>) -> Result<Self> {
        let ensemble = MemoryEnsemble::new();
        let connect_string = format!("localhost:2181{}", chroot.unwrap_or_default());

        if let Some(root) = chroot {
            let admin = Client::new(ensemble.connection(None));
            admin.connect().wait().await?;
            admin.rm_rf(root).wait().await?;
            admin.mkdir_p(root).wait().await?;
            admin.close().wait().await?;
        }

        let zk = Client::new(ensemble.connect_string(&connect_string)?);
        zk.connect().wait().await?;
        zk.rm_rf(BASE_PATH).wait().await?;
        zk.mkdir_p(BASE_PATH).wait().await?;

        let conn = Arc::new(ensemble.connect_string(&connect_string)?);
        let zkem = Client::shared(conn.clone());
        Ok(Self {
            ensemble,
            zk,
            zkem,
            conn,
        })
    }

    pub fn path(&self, name: &str) -> String {
        format!("{BASE_PATH}/{name}")
    }

    pub async fn teardown(self) -> Result<()> {
        self.zkem.close().wait().await?;
        self.zk.rm_rf(BASE_PATH).wait().await?;
        self.zk.close().wait().await?;
        Ok(())
    }
}

/// next value from `rx`, failing the test if nothing arrives in time
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Result<T> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .context("timed out waiting for callback")?
        .context("callback channel closed")
}

/// wait for every job queued on `client`'s reactor so far
pub async fn drain(client: &Client) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.reactor().next_tick(move || {
        let _ = tx.send(());
    });
    next(&mut rx).await
}
