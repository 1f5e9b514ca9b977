#![allow(clippy::cognitive_complexity)]
use std::{sync::Arc, time::Duration};

use anyhow::{ensure, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;
use zk_coordination::{Client, Create, MemoryEnsemble};
use zkem_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    tokio::{self, runtime::Builder},
    tracing::*,
    Reactor,
};

/// namespace the smoke run works under, removed again afterwards
const SMOKE_ROOT: &str = "/zkem/smoke";

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.zkem_log)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let rt = Builder::new_multi_thread()
        .thread_name("zkem")
        .enable_all()
        .build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "smoke run panicked"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

/// Drive every client operation against an in-memory ensemble laid out like
/// the configured one, chroot included.
async fn start(config: cli::Config) -> Result<()> {
    let token = CancellationToken::new();
    let (reactor, reactor_task) = Reactor::start(token.clone());
    let ensemble = MemoryEnsemble::new();
    info!(hosts = %config.zk_hosts, "starting in-memory ensemble");

    if let Some(chroot) = config.zk_hosts.chroot() {
        let admin = Client::with_reactor(Arc::new(ensemble.connection(None)), reactor.clone());
        admin.connect().wait().await?;
        admin.mkdir_p(chroot).wait().await?;
        admin.close().wait().await?;
    }

    let client = Client::with_reactor(
        Arc::new(ensemble.connection(config.zk_hosts.chroot())),
        reactor,
    );
    let _connected = client.on_connected(|state| info!(%state, "watcher: connected"));
    let _lost = client.on_connection_lost(|err| warn!(%err, "watcher: connection lost"));

    let res = smoke(&client, config.session_timeout())
        .instrument(info_span!("smoke"))
        .await;
    client.close().wait().await?;

    token.cancel();
    reactor_task.await?;
    info!(nodes = ensemble.paths().len(), "ensemble after smoke run");
    res
}

async fn smoke(client: &Client, session_timeout: Duration) -> Result<()> {
    tokio::time::timeout(session_timeout, client.connect().wait())
        .await
        .context("no session within the session timeout")??;
    info!(session = ?client.session_id(), "connected");

    client.mkdir_p(SMOKE_ROOT).wait().await?;
    for n in 0..3 {
        let created = client
            .call(
                Create::new(format!("{SMOKE_ROOT}/node-"))
                    .sequential()
                    .data(format!("payload {n}")),
            )
            .wait()
            .await?;
        debug!(%created, "created");
    }

    let (mut children, stat) = client.children(SMOKE_ROOT).wait().await?;
    children.sort();
    info!(?children, cversion = stat.cversion, "listed children");
    ensure!(children.len() == 3, "expected 3 children, got {}", children.len());

    let first = format!("{SMOKE_ROOT}/{}", children[0]);
    let stat = client.set(&first, "rewritten").wait().await?;
    let (data, _) = client.get(&first).wait().await?;
    ensure!(&data[..] == b"rewritten", "read back {data:?}");
    debug!(version = stat.version, "rewrote first child");

    client.delete(&first).wait().await?;
    ensure!(
        !client.exists(&first).wait().await?,
        "{first} still exists after delete"
    );

    client.rm_rf("/zkem").wait().await?;
    ensure!(!client.stat("/zkem").wait().await?.exists(), "rm_rf left /zkem behind");
    info!("smoke run passed");
    Ok(())
}
