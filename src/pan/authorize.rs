//! Asynchronous connection authorization against the Bluetooth service
//! database.
//!
//! Every admitted PAN connection first goes through an external policy
//! decision keyed by peer address and requested service UUID. The request
//! is latency-unbounded; a session that dies while the decision is pending
//! sends a best-effort cancellation so the remote side does not keep a
//! dangling prompt around.

use async_trait::async_trait;
use bluer::Address;
use log::{debug, error, warn};
use uuid::Uuid;
use zbus::Proxy;

use crate::error::Result;

/// Terminal outcome of an authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
   /// The policy service granted access.
   Approved,
   /// Explicit refusal.
   Denied,
   /// The service never answered; the request must be cancelled remotely.
   NoReply,
}

/// Client side of the external authorization service.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
   /// Asks whether `address` may connect to the local service identified
   /// by `service`. Resolves to exactly one terminal outcome.
   async fn request(&self, address: Address, service: Uuid) -> AuthOutcome;

   /// Best-effort notification that the session waiting on an earlier
   /// request is gone. Safe to call regardless of whether a resolution is
   /// already in flight.
   async fn cancel(&self, address: Address, service: Uuid);
}

const DBUS_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";

/// Authorizer backed by the Bluetooth daemon's service database.
pub struct BluezAuthorizer {
   proxy: Proxy<'static>,
}

impl BluezAuthorizer {
   pub async fn new(connection: &zbus::Connection) -> Result<Self> {
      let proxy = Proxy::new(connection, "org.bluez", "/org/bluez", "org.bluez.Database").await?;
      Ok(Self { proxy })
   }
}

#[async_trait]
impl Authorizer for BluezAuthorizer {
   async fn request(&self, address: Address, service: Uuid) -> AuthOutcome {
      let addr = address.to_string();
      let uuid = service.to_string();
      debug!("Requesting authorization for {addr} UUID {uuid}");

      match self
         .proxy
         .call::<_, _, ()>("RequestAuthorization", &(addr.as_str(), uuid.as_str()))
         .await
      {
         Ok(()) => AuthOutcome::Approved,
         Err(zbus::Error::MethodError(name, text, _)) => {
            error!(
               "Access denied for {addr}: {}",
               text.as_deref().unwrap_or("unknown reason")
            );
            if name.as_str() == DBUS_NO_REPLY {
               AuthOutcome::NoReply
            } else {
               AuthOutcome::Denied
            }
         },
         Err(e) => {
            // The bus itself failed us; nobody is going to answer.
            warn!("Authorization request for {addr} failed: {e}");
            AuthOutcome::NoReply
         },
      }
   }

   async fn cancel(&self, address: Address, service: Uuid) {
      let addr = address.to_string();
      debug!("Canceling authorization request for {addr}");

      if let Err(e) = self
         .proxy
         .call::<_, _, ()>(
            "CancelAuthorizationRequest",
            &(addr.as_str(), service.to_string().as_str()),
         )
         .await
      {
         debug!("Authorization cancel for {addr} not delivered: {e}");
      }
   }
}
