use std::future::Future;
use std::io::{self, Write};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::net::Auth;
use crate::proto::HassEntities;

pub mod config;
pub mod connection;
pub mod entities;
pub mod error;
pub mod logging;
pub mod net;
pub mod proto;
mod stream;

pub const WATCHED_ENTITY: &str = "input_boolean.tv_art_mode";

/// Upper bound on each shutdown step so an unresponsive hub cannot hold the
/// process open after Ctrl-C.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives every full entity snapshot.
pub trait EntitiesHandler {
    fn handle(&mut self, entities: &HassEntities) -> io::Result<()>;
}

impl<F> EntitiesHandler for F
where
    F: FnMut(&HassEntities) -> io::Result<()>,
{
    fn handle(&mut self, entities: &HassEntities) -> io::Result<()> {
        (self)(entities)
    }
}

/// Writes one line: the entity as JSON, or `null` when the hub has no such entity.
pub fn print_watched<W: Write>(
    entities: &HassEntities,
    entity_id: &str,
    out: &mut W,
) -> io::Result<()> {
    match entities.get(entity_id) {
        Some(entity) => {
            serde_json::to_writer(&mut *out, entity)?;
            writeln!(out)
        }
        None => writeln!(out, "null"),
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let print = |entities: &HassEntities| -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        print_watched(entities, WATCHED_ENTITY, &mut stdout)?;
        stdout.flush()
    };
    run_until(config, print, shutdown_signal()).await
}

/// Connects, then feeds snapshots to `handler` until `shutdown` resolves
/// (clean exit) or the connection drops (error). Connection failures are
/// returned as-is; nothing is retried. Once `shutdown` fires the result is
/// `Ok` even if the hub misbehaves while we unsubscribe.
pub async fn run_until<H, S>(config: Config, mut handler: H, shutdown: S) -> anyhow::Result<()>
where
    H: EntitiesHandler,
    S: Future<Output = ()>,
{
    let auth = Auth::long_lived(config.url, config.token);
    let conn = Connection::open(&auth).await?;
    drop(auth);

    let mut entities = entities::subscribe_entities(&conn).await?;

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutting down");
                break;
            }
            update = entities.next() => match update {
                Some(snapshot) => handler.handle(snapshot)?,
                None => return Err(conn.lost().into()),
            },
        }
    }

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, entities.unsubscribe()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "unsubscribe failed during shutdown"),
        Err(_) => warn!("hub did not acknowledge unsubscribe, closing anyway"),
    }
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, conn.close()).await.is_err() {
        warn!("timed out closing hub connection");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "unable to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
