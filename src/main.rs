//! Bluetooth PAN (BNEP) network server daemon.
//!
//! Accepts incoming PAN connections on the BNEP L2CAP PSM, runs the setup
//! handshake, authorizes peers against the Bluetooth service database and
//! hands admitted connections to the kernel network layer. A D-Bus
//! interface manages the per-role server instances.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{error, info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, object_server::InterfaceRef};

mod bnep;
mod config;
mod dbus;
mod error;
mod event;
mod net;
mod pan;
mod sdp;

use crate::{
   dbus::{PanService, PanServiceSignals},
   error::Result,
   event::{EventBus, PanEvent},
   net::KernelLink,
   pan::{
      authorize::BluezAuthorizer,
      listener,
      manager::PanManager,
   },
   sdp::BluezRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting bnepd D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   let secure = config.secure;

   // The adapter the servers are bound to
   let session = bluer::Session::new().await?;
   let adapter = session.default_adapter().await?;
   adapter.set_powered(true).await?;
   let local_address = adapter.address().await?;
   info!("Using adapter {} ({local_address})", adapter.name());

   // Create event channel
   let event_bus = EventProcessor::new();

   // BlueZ collaborators and the kernel boundary share one system bus
   // connection.
   let connection = Connection::system().await?;
   let authorizer = Arc::new(BluezAuthorizer::new(&connection).await?);
   let registry = Arc::new(BluezRegistry::new(&connection).await?);
   let link = Arc::new(KernelLink::new()?);

   let manager = PanManager::new(
      config,
      local_address,
      event_bus.clone(),
      authorizer,
      link,
      registry,
   );

   // Export the administrative interface
   let service = PanService::new(manager.clone());
   connection
      .object_server()
      .at("/org/bnepd/server", service)
      .await?;
   connection.request_name("org.bnepd").await?;

   info!("bnepd D-Bus service started at org.bnepd");

   // Accept BNEP connections
   let inbox = manager.inbox();
   tokio::spawn(async move {
      if let Err(e) = listener::serve(inbox, secure).await {
         error!("BNEP listener failed: {e}");
      }
   });

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down bnepd service...");
   manager.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<PanEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<PanEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<PanService>, event: PanEvent) -> Result<()> {
      match event {
         PanEvent::ServerEnabled(role) => {
            iface.server_enabled(&role.to_string()).await?;
         },
         PanEvent::ServerDisabled(role) => {
            iface.server_disabled(&role.to_string()).await?;
         },
         PanEvent::ClientConnected { role, address } => {
            iface
               .client_connected(&role.to_string(), &address.to_string())
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, PanService>("/org/bnepd/server")
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: PanEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
