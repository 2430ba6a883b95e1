//! Session port: the authenticated connection to the chat platform.

pub mod port;
pub mod throttled;
pub mod types;

use std::sync::Arc;

use crate::{
    session::{
        port::{SessionClient, SessionFactory},
        types::SessionRole,
    },
    Error, Result,
};

/// Open, connect and authorize a session for `role`.
pub async fn open_authorized(
    factory: &dyn SessionFactory,
    role: SessionRole,
) -> Result<Arc<dyn SessionClient>> {
    let client = factory.open(role);
    authorize(client.as_ref()).await?;
    Ok(client)
}

/// Connect and check authorization. On failure after connecting, the session
/// is disconnected again before the error is returned.
pub async fn authorize(client: &dyn SessionClient) -> Result<()> {
    client.connect().await?;

    match client.is_authorized().await {
        Ok(true) => Ok(()),
        Ok(false) => {
            close(client).await;
            Err(Error::NotAuthorized)
        }
        Err(e) => {
            close(client).await;
            Err(e)
        }
    }
}

/// Disconnect, logging (not propagating) failures.
pub async fn close(client: &dyn SessionClient) {
    if let Err(e) = client.disconnect().await {
        tracing::warn!("session disconnect failed: {e}");
    }
}
