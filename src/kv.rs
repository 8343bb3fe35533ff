//! Redis connection bootstrap for distributed mode.
//!
//! Distributed locks and fast usage aggregates share one multiplexed
//! connection, cloned into each component at wiring time. When `KV_URL` is
//! unset the kernel runs fully in-process and this module is not consulted.

use redis::aio::MultiplexedConnection;
use tracing::info;

use crate::Result;

/// Open and verify a connection to the KV store.
///
/// Fails hard when the store is unreachable: a configured distributed mode
/// never downgrades silently to in-process state.
pub async fn connect(url: &str) -> Result<MultiplexedConnection> {
    let client = redis::Client::open(url)?;
    let mut conn = client.get_multiplexed_async_connection().await?;

    let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
    if pong != "PONG" {
        return Err(crate::KernelError::LockBackend {
            message: format!("KV store returned unexpected ping reply: {pong}"),
        });
    }

    info!("Connected to KV store");
    Ok(conn)
}
