//! PAN server actor.
//!
//! A single actor owns every piece of mutable state: the live setup
//! sessions keyed by peer address, the three per-role server instances and
//! the persisted configuration. Commands arrive over an mpsc inbox from
//! the listener and the D-Bus surface; timers and authorization requests
//! run as spawned tasks that post their results back over a loopback
//! channel, so events for a session are always applied one at a time.

use std::{
   collections::{HashMap, HashSet},
   io,
   net::Ipv4Addr,
   os::fd::RawFd,
   sync::Arc,
   time::Duration,
};

use bluer::Address;
use log::{debug, error, info, warn};
use serde_json::json;
use smol_str::SmolStr;
use strum::IntoEnumIterator;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::AbortHandle,
   time,
};

use crate::{
   bnep::{
      proto::{self, BNEP_CONN_NOT_ALLOWED, BNEP_SUCCESS, SvcRole},
      session::{SETUP_TIMEOUT, SetupEvent, SetupSession, Verdict},
   },
   config::Config,
   error::{PanError, Result},
   event::{EventSender, PanEvent},
   net::LinkOps,
   pan::{
      authorize::{AuthOutcome, Authorizer},
      listener::{Packet, PeerConn},
   },
   sdp::{self, SdpRegistry},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 128;

/// Inputs for a live session, posted by the connection I/O tasks, the
/// deadline timer and the authorization task.
#[derive(Debug)]
pub enum SessionInput {
   Data(Packet),
   Hangup,
   Deadline,
   Resolved(AuthOutcome),
}

/// Commands handled by the server actor.
#[derive(Debug)]
pub enum Command {
   Connected(PeerConn),
   Session {
      addr: Address,
      conn_id: u64,
      input: SessionInput,
   },

   // Administrative surface
   Enable(SvcRole, oneshot::Sender<Result<()>>),
   Disable(SvcRole, oneshot::Sender<Result<()>>),
   IsEnabled(SvcRole, oneshot::Sender<bool>),
   SetName(SvcRole, String, oneshot::Sender<Result<()>>),
   GetName(SvcRole, oneshot::Sender<String>),
   SetRouting(SvcRole, String, oneshot::Sender<Result<()>>),
   SetAddressRange(SvcRole, String, oneshot::Sender<Result<()>>),
   GetInfo(SvcRole, oneshot::Sender<serde_json::Value>),
   ConnectedCount(oneshot::Sender<u32>),
   Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the server actor.
///
/// This type provides a high-level interface for managing the per-role
/// PAN server instances and is what the D-Bus surface talks to.
#[derive(Clone)]
pub struct PanManager {
   inbox: mpsc::Sender<Command>,
}

impl PanManager {
   pub fn new(
      config: Config,
      local_address: Address,
      event_tx: EventSender,
      authorizer: Arc<dyn Authorizer>,
      link: Arc<dyn LinkOps>,
      registry: Arc<dyn SdpRegistry>,
   ) -> Self {
      let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ServerActor::new(
         config,
         local_address,
         event_tx,
         authorizer,
         link,
         registry,
         inbox_rx,
         true,
      );
      tokio::spawn(actor.run());
      Self { inbox: inbox_tx }
   }

   /// Sender the listener feeds accepted connections into.
   pub fn inbox(&self) -> mpsc::Sender<Command> {
      self.inbox.clone()
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| PanError::ManagerShutdown)?;
      rx.await.map_err(|_| PanError::ManagerShutdown)
   }

   pub async fn enable(&self, role: SvcRole) -> Result<()> {
      self.request(|tx| Command::Enable(role, tx)).await?
   }

   pub async fn disable(&self, role: SvcRole) -> Result<()> {
      self.request(|tx| Command::Disable(role, tx)).await?
   }

   pub async fn is_enabled(&self, role: SvcRole) -> Result<bool> {
      self.request(|tx| Command::IsEnabled(role, tx)).await
   }

   pub async fn set_name(&self, role: SvcRole, name: String) -> Result<()> {
      self.request(|tx| Command::SetName(role, name, tx)).await?
   }

   pub async fn get_name(&self, role: SvcRole) -> Result<String> {
      self.request(|tx| Command::GetName(role, tx)).await
   }

   pub async fn set_routing(&self, role: SvcRole, iface: String) -> Result<()> {
      self
         .request(|tx| Command::SetRouting(role, iface, tx))
         .await?
   }

   pub async fn set_address_range(&self, role: SvcRole, range: String) -> Result<()> {
      self
         .request(|tx| Command::SetAddressRange(role, range, tx))
         .await?
   }

   pub async fn get_info(&self, role: SvcRole) -> Result<serde_json::Value> {
      self.request(|tx| Command::GetInfo(role, tx)).await
   }

   pub async fn connected_count(&self) -> Result<u32> {
      self.request(Command::ConnectedCount).await
   }

   /// Stops the actor and waits for its cleanup to finish.
   pub async fn shutdown(&self) {
      let _ = self.request(Command::Shutdown).await;
   }
}

/// One live setup session: the state machine plus everything that must be
/// released when it ends.
struct LiveSession {
   machine: SetupSession,
   tx: mpsc::Sender<Packet>,
   fd: RawFd,
   kill: oneshot::Sender<()>,
   deadline: Option<AbortHandle>,
   authorization: Option<AbortHandle>,
}

/// Runtime state of one server role.
#[derive(Default)]
struct ServerInstance {
   /// Discovery record handle; non-zero exactly while the server is
   /// enabled.
   record_handle: u32,
   /// Peers admitted through this server.
   clients: HashSet<Address>,
}

struct ServerActor {
   config: Config,
   local_address: Address,
   event_tx: EventSender,
   authorizer: Arc<dyn Authorizer>,
   link: Arc<dyn LinkOps>,
   registry: Arc<dyn SdpRegistry>,
   inbox_rx: mpsc::Receiver<Command>,
   loopback_rx: mpsc::Receiver<Command>,
   loopback_tx: mpsc::Sender<Command>,
   setup_timeout: Duration,
   persist_config: bool,
   shutdown_ack: Option<oneshot::Sender<()>>,

   // State
   sessions: HashMap<Address, LiveSession>,
   servers: HashMap<SvcRole, ServerInstance>,
}

impl ServerActor {
   fn new(
      config: Config,
      local_address: Address,
      event_tx: EventSender,
      authorizer: Arc<dyn Authorizer>,
      link: Arc<dyn LinkOps>,
      registry: Arc<dyn SdpRegistry>,
      inbox_rx: mpsc::Receiver<Command>,
      persist_config: bool,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         config,
         local_address,
         event_tx,
         authorizer,
         link,
         registry,
         inbox_rx,
         loopback_rx,
         loopback_tx,
         setup_timeout: SETUP_TIMEOUT,
         persist_config,
         shutdown_ack: None,
         sessions: HashMap::new(),
         servers: SvcRole::iter().map(|r| (r, ServerInstance::default())).collect(),
      }
   }

   async fn run(mut self) {
      info!("PAN server starting");
      self.start().await;

      loop {
         select! {
            cmd = self.inbox_rx.recv() => {
               let Some(cmd) = cmd else {
                  break;
               };
               if !self.handle_command(cmd).await {
                  break;
               }
            }
            Some(cmd) = self.loopback_rx.recv() => {
               if !self.handle_command(cmd).await {
                  break;
               }
            }
         }
      }

      self.cleanup().await;
      if let Some(ack) = self.shutdown_ack.take() {
         let _ = ack.send(());
      }
   }

   /// Registers records for servers enabled in the stored configuration
   /// and sets up the configured bridges.
   async fn start(&mut self) {
      for role in SvcRole::iter() {
         if !self.config.server(role).enabled {
            continue;
         }

         let record =
            sdp::record_for_role(role, &self.config.server(role).name, self.config.secure);
         match self.registry.register(&record).await {
            Ok(handle) => {
               info!("{role} server enabled from stored configuration");
               self.instance_mut(role).record_handle = handle;
            },
            Err(e) => {
               error!("Failed to register {role} service record: {e}");
               self.config.server_mut(role).enabled = false;
            },
         }
      }

      for bridge in self.config.bridges() {
         if let Err(e) = self.link.bridge_create(&bridge) {
            if e.kind() != io::ErrorKind::AlreadyExists {
               warn!("Can't create bridge {bridge}: {e}");
               continue;
            }
         }
         if let Err(e) = self.link.if_up(&bridge, None) {
            warn!("Can't bring up bridge {bridge}: {e}");
         }
      }
   }

   async fn handle_command(&mut self, cmd: Command) -> bool {
      match cmd {
         Command::Connected(conn) => {
            self.handle_connected(conn);
         },
         Command::Session {
            addr,
            conn_id,
            input,
         } => {
            self.handle_session_input(addr, conn_id, input).await;
         },
         Command::Enable(role, reply) => {
            let _ = reply.send(self.enable(role).await);
         },
         Command::Disable(role, reply) => {
            let _ = reply.send(self.disable(role).await);
         },
         Command::IsEnabled(role, reply) => {
            let _ = reply.send(self.config.server(role).enabled);
         },
         Command::SetName(role, name, reply) => {
            let _ = reply.send(self.set_name(role, name).await);
         },
         Command::GetName(role, reply) => {
            let _ = reply.send(self.config.server(role).name.clone());
         },
         Command::SetRouting(role, iface, reply) => {
            let _ = reply.send(self.set_routing(role, iface));
         },
         Command::SetAddressRange(role, range, reply) => {
            let _ = reply.send(self.set_address_range(role, range));
         },
         Command::GetInfo(role, reply) => {
            let _ = reply.send(self.info(role));
         },
         Command::ConnectedCount(reply) => {
            let count = self.servers.values().map(|s| s.clients.len() as u32).sum();
            let _ = reply.send(count);
         },
         Command::Shutdown(ack) => {
            self.shutdown_ack = Some(ack);
            return false;
         },
      }
      true
   }

   // === Connection admission ===

   fn handle_connected(&mut self, conn: PeerConn) {
      if self.sessions.contains_key(&conn.addr) {
         // First session wins; the newcomer is closed untouched.
         warn!("Pending connection setup session for {}", conn.addr);
         let _ = conn.kill.send(());
         return;
      }

      let deadline = self.spawn_deadline(conn.addr, conn.conn_id);
      let session = LiveSession {
         machine: SetupSession::new(conn.addr, conn.conn_id),
         tx: conn.tx,
         fd: conn.fd,
         kill: conn.kill,
         deadline: Some(deadline),
         authorization: None,
      };
      self.sessions.insert(conn.addr, session);
   }

   async fn handle_session_input(&mut self, addr: Address, conn_id: u64, input: SessionInput) {
      let enabled_roles: Vec<SvcRole> = SvcRole::iter()
         .filter(|role| self.config.server(*role).enabled)
         .collect();

      let Some(session) = self.sessions.get_mut(&addr) else {
         // Late event for a session already destroyed.
         debug!("Dropping event for unknown session {addr}");
         return;
      };
      if session.machine.conn_id() != conn_id {
         // Event from a superseded connection to the same address.
         debug!("Dropping stale event for {addr}");
         return;
      }

      if matches!(input, SessionInput::Resolved(_)) {
         session.authorization = None;
      }

      let enabled = |role: SvcRole| enabled_roles.contains(&role);
      let verdict = match &input {
         SessionInput::Data(data) => session.machine.handle(SetupEvent::Data(data.as_slice()), enabled),
         SessionInput::Hangup => session.machine.handle(SetupEvent::Hangup, enabled),
         SessionInput::Deadline => session.machine.handle(SetupEvent::Deadline, enabled),
         SessionInput::Resolved(outcome) => {
            session.machine.handle(SetupEvent::Resolved(*outcome), enabled)
         },
      };

      match verdict {
         Verdict::Ignore => {},
         Verdict::Reject {
            response,
            cancel_authorization,
         } => {
            self.finish(addr, Some(response), cancel_authorization).await;
         },
         Verdict::Close {
            cancel_authorization,
         } => {
            self.finish(addr, None, cancel_authorization).await;
         },
         Verdict::Authorize { dst } => {
            let auth = self.spawn_authorization(addr, conn_id, dst);
            if let Some(session) = self.sessions.get_mut(&addr) {
               debug!(
                  "{addr} requested {dst}, source role {:#06x}",
                  session.machine.src_role().unwrap_or_default()
               );
               if let Some(timer) = session.deadline.take() {
                  timer.abort();
               }
               session.authorization = Some(auth);
            }
         },
         Verdict::Admit { dst } => {
            self.admit(addr, dst).await;
         },
      }
   }

   fn spawn_deadline(&self, addr: Address, conn_id: u64) -> AbortHandle {
      let loopback = self.loopback_tx.clone();
      let timeout = self.setup_timeout;
      tokio::spawn(async move {
         time::sleep(timeout).await;
         let _ = loopback
            .send(Command::Session {
               addr,
               conn_id,
               input: SessionInput::Deadline,
            })
            .await;
      })
      .abort_handle()
   }

   fn spawn_authorization(&self, addr: Address, conn_id: u64, dst: SvcRole) -> AbortHandle {
      let authorizer = self.authorizer.clone();
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let outcome = authorizer.request(addr, dst.uuid()).await;
         let _ = loopback
            .send(Command::Session {
               addr,
               conn_id,
               input: SessionInput::Resolved(outcome),
            })
            .await;
      })
      .abort_handle()
   }

   /// Single teardown path: every session leaves the map through here,
   /// exactly once.
   async fn finish(&mut self, addr: Address, response: Option<u16>, cancel_authorization: bool) {
      let Some(mut session) = self.sessions.remove(&addr) else {
         return;
      };

      if let Some(timer) = session.deadline.take() {
         timer.abort();
      }
      if let Some(auth) = session.authorization.take() {
         auth.abort();
      }
      if cancel_authorization {
         if let Some(dst) = session.machine.dst_role() {
            let authorizer = self.authorizer.clone();
            tokio::spawn(async move {
               authorizer.cancel(addr, dst.uuid()).await;
            });
         }
      }

      if let Some(code) = response {
         let packet = Packet::from_slice(&proto::build_setup_response(code));
         if session.tx.send(packet).await.is_err() {
            debug!("Peer {addr} went away before the setup response was queued");
         }
      }

      debug!(
         "Setup session for {} ended after {} attempts",
         session.machine.peer(),
         session.machine.attempts()
      );

      // Dropping the outbound sender lets the send task flush the response
      // before the socket closes; the receive task stops here.
      let _ = session.kill.send(());
   }

   /// Admission result handling for an approved authorization.
   async fn admit(&mut self, addr: Address, dst: SvcRole) {
      let Some(fd) = self.sessions.get(&addr).map(|s| s.fd) else {
         return;
      };

      let response = match self.bring_up(fd, dst) {
         Ok(device) => {
            info!("Authorization succeeded, new connection on {device}");
            self.instance_mut(dst).clients.insert(addr);
            self.event_tx.emit(PanEvent::ClientConnected {
               role: dst,
               address: addr,
            });
            BNEP_SUCCESS
         },
         Err(e) => {
            error!("Interface bring-up for {addr} failed: {e}");
            BNEP_CONN_NOT_ALLOWED
         },
      };

      self.finish(addr, Some(response), false).await;
   }

   fn bring_up(&mut self, fd: RawFd, dst: SvcRole) -> Result<SmolStr> {
      // The server can be disabled while the authorization is pending.
      if !self.config.server(dst).enabled {
         return Err(PanError::NotEnabled(dst));
      }

      let device = self
         .link
         .connadd(fd, dst as u16, &self.config.interface_prefix)?;

      let server = self.config.server(dst);
      if let Some(bridge) = server.bridge.clone() {
         self.link.bridge_attach(&bridge, &device)?;
         self.link.if_up(&device, None)?;
      } else {
         let local = server.address_range.as_deref().and_then(first_address);
         self.link.if_up(&device, local)?;
      }

      Ok(device)
   }

   // === Server administration ===

   async fn enable(&mut self, role: SvcRole) -> Result<()> {
      if self.config.server(role).enabled {
         return Err(PanError::AlreadyEnabled(role));
      }

      let record = sdp::record_for_role(role, &self.config.server(role).name, self.config.secure);
      let handle = self.registry.register(&record).await?;

      self.instance_mut(role).record_handle = handle;
      self.config.server_mut(role).enabled = true;
      self.persist();
      self.event_tx.emit(PanEvent::ServerEnabled(role));
      info!("{role} server enabled");
      Ok(())
   }

   async fn disable(&mut self, role: SvcRole) -> Result<()> {
      if !self.config.server(role).enabled {
         return Err(PanError::NotEnabled(role));
      }

      let handle = self.instance_mut(role).record_handle;
      if handle != 0 {
         if let Err(e) = self.registry.remove(handle).await {
            warn!("Failed to remove {role} service record: {e}");
         }
         self.instance_mut(role).record_handle = 0;
      }

      self.config.server_mut(role).enabled = false;

      let clients: Vec<Address> = self.instance_mut(role).clients.drain().collect();
      for client in clients {
         if let Err(e) = self.link.conndel(client) {
            warn!("Failed to drop connection to {client}: {e}");
         }
      }

      self.persist();
      self.event_tx.emit(PanEvent::ServerDisabled(role));
      info!("{role} server disabled");
      Ok(())
   }

   async fn set_name(&mut self, role: SvcRole, name: String) -> Result<()> {
      if name.is_empty() {
         return Err(PanError::InvalidArgument("service name must not be empty"));
      }

      self.config.server_mut(role).name = name;

      if self.config.server(role).enabled {
         // Register the replacement before dropping the old record.
         let record =
            sdp::record_for_role(role, &self.config.server(role).name, self.config.secure);
         let handle = self.registry.register(&record).await?;

         let old = self.instance_mut(role).record_handle;
         if old != 0 {
            if let Err(e) = self.registry.remove(old).await {
               warn!("Failed to remove old {role} service record: {e}");
            }
         }
         self.instance_mut(role).record_handle = handle;
      }

      self.persist();
      Ok(())
   }

   fn set_routing(&mut self, role: SvcRole, iface: String) -> Result<()> {
      if iface.is_empty() {
         return Err(PanError::InvalidArgument(
            "routing interface must not be empty",
         ));
      }

      self.config.server_mut(role).routing = Some(iface);
      self.persist();
      Ok(())
   }

   fn set_address_range(&mut self, role: SvcRole, range: String) -> Result<()> {
      if first_address(&range).is_none() {
         return Err(PanError::InvalidArgument(
            "address range must start with an IPv4 address",
         ));
      }

      self.config.server_mut(role).address_range = Some(range);
      self.persist();
      Ok(())
   }

   fn info(&mut self, role: SvcRole) -> serde_json::Value {
      let clients: Vec<String> = self
         .instance_mut(role)
         .clients
         .iter()
         .map(ToString::to_string)
         .collect();
      let server = self.config.server(role);

      json!({
         "name": server.name,
         "uuid": role.uuid().to_string(),
         "enabled": server.enabled,
         "address": self.local_address.to_string(),
         "routing": server.routing,
         "address_range": server.address_range,
         "bridge": server.bridge,
         "clients": clients,
      })
   }

   fn instance_mut(&mut self, role: SvcRole) -> &mut ServerInstance {
      self.servers.entry(role).or_default()
   }

   fn persist(&self) {
      if !self.persist_config {
         return;
      }
      if let Err(e) = self.config.save() {
         warn!("Failed to persist configuration: {e}");
      }
   }

   async fn cleanup(&mut self) {
      info!("Shutting down PAN server");

      let peers: Vec<Address> = self.sessions.keys().copied().collect();
      for addr in peers {
         let pending = self
            .sessions
            .get(&addr)
            .is_some_and(|s| s.authorization.is_some());
         self.finish(addr, None, pending).await;
      }

      for role in SvcRole::iter() {
         let handle = self.instance_mut(role).record_handle;
         if handle != 0 {
            if let Err(e) = self.registry.remove(handle).await {
               warn!("Failed to remove {role} service record: {e}");
            }
            self.instance_mut(role).record_handle = 0;
         }
      }

      for bridge in self.config.bridges() {
         if let Err(e) = self.link.bridge_remove(&bridge) {
            warn!("Can't remove bridge {bridge}: {e}");
         }
      }
   }
}

/// First address of a configured range like "10.20.0.1/24" or
/// "10.20.0.1-10.20.0.254".
fn first_address(range: &str) -> Option<Ipv4Addr> {
   range
      .split(['/', '-'])
      .next()
      .and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
   use super::*;

   use std::sync::{
      Mutex,
      atomic::{AtomicU32, Ordering},
   };

   use async_trait::async_trait;
   use uuid::Uuid;

   use crate::bnep::proto::{BNEP_CONN_INVALID_SVC, BNEP_CONTROL, BNEP_SETUP_CONN_REQ};
   use crate::bnep::session::SetupState;

   const PEER: Address = Address([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
   const LOCAL: Address = Address([0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB]);

   #[derive(Default)]
   struct MockAuthorizer {
      requests: Mutex<Vec<(Address, Uuid)>>,
      cancels: Mutex<Vec<(Address, Uuid)>>,
   }

   #[async_trait]
   impl Authorizer for MockAuthorizer {
      async fn request(&self, address: Address, service: Uuid) -> AuthOutcome {
         self.requests.lock().unwrap().push((address, service));
         // Resolutions are injected by the tests.
         std::future::pending().await
      }

      async fn cancel(&self, address: Address, service: Uuid) {
         self.cancels.lock().unwrap().push((address, service));
      }
   }

   #[derive(Default)]
   struct MockLink {
      fail_connadd: bool,
      fail_attach: bool,
      fail_if_up: bool,
      attached: Mutex<Vec<(String, String)>>,
      up: Mutex<Vec<(String, Option<Ipv4Addr>)>>,
      conndels: Mutex<Vec<Address>>,
   }

   impl LinkOps for MockLink {
      fn connadd(&self, _sock: RawFd, _role: u16, prefix: &str) -> io::Result<SmolStr> {
         if self.fail_connadd {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
         }
         Ok(SmolStr::new(format!("{prefix}0")))
      }

      fn conndel(&self, addr: Address) -> io::Result<()> {
         self.conndels.lock().unwrap().push(addr);
         Ok(())
      }

      fn bridge_create(&self, _bridge: &str) -> io::Result<()> {
         Ok(())
      }

      fn bridge_remove(&self, _bridge: &str) -> io::Result<()> {
         Ok(())
      }

      fn bridge_attach(&self, bridge: &str, dev: &str) -> io::Result<()> {
         if self.fail_attach {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
         }
         self
            .attached
            .lock()
            .unwrap()
            .push((bridge.to_owned(), dev.to_owned()));
         Ok(())
      }

      fn if_up(&self, dev: &str, addr: Option<Ipv4Addr>) -> io::Result<()> {
         if self.fail_if_up {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
         }
         self.up.lock().unwrap().push((dev.to_owned(), addr));
         Ok(())
      }
   }

   #[derive(Default)]
   struct MockRegistry {
      next: AtomicU32,
      removed: Mutex<Vec<u32>>,
   }

   #[async_trait]
   impl SdpRegistry for MockRegistry {
      async fn register(&self, _record: &sdp::ServiceRecord) -> Result<u32> {
         Ok(self.next.fetch_add(1, Ordering::SeqCst) + 1)
      }

      async fn remove(&self, handle: u32) -> Result<()> {
         self.removed.lock().unwrap().push(handle);
         Ok(())
      }
   }

   #[derive(Default)]
   struct MockBus {
      events: Mutex<Vec<PanEvent>>,
   }

   impl crate::event::EventBus for MockBus {
      fn emit(&self, event: PanEvent) {
         self.events.lock().unwrap().push(event);
      }
   }

   struct Fixture {
      actor: ServerActor,
      authorizer: Arc<MockAuthorizer>,
      link: Arc<MockLink>,
      registry: Arc<MockRegistry>,
      bus: Arc<MockBus>,
      _inbox_tx: mpsc::Sender<Command>,
   }

   fn fixture_config(config: Config, link: MockLink) -> Fixture {
      let authorizer = Arc::new(MockAuthorizer::default());
      let link = Arc::new(link);
      let registry = Arc::new(MockRegistry::default());
      let bus = Arc::new(MockBus::default());
      let (inbox_tx, inbox_rx) = mpsc::channel(16);
      let actor = ServerActor::new(
         config,
         LOCAL,
         bus.clone(),
         authorizer.clone(),
         link.clone(),
         registry.clone(),
         inbox_rx,
         false,
      );
      Fixture {
         actor,
         authorizer,
         link,
         registry,
         bus,
         _inbox_tx: inbox_tx,
      }
   }

   /// NAP enabled, routed mode.
   fn fixture(link: MockLink) -> Fixture {
      let mut config = Config::default();
      config.nap.enabled = true;
      config.nap.address_range = Some("10.20.30.1/24".to_owned());
      fixture_config(config, link)
   }

   async fn connect(actor: &mut ServerActor, addr: Address, conn_id: u64) -> mpsc::Receiver<Packet> {
      let (tx, rx) = mpsc::channel(8);
      let (kill, _kill_rx) = oneshot::channel();
      actor
         .handle_command(Command::Connected(PeerConn {
            addr,
            conn_id,
            tx,
            fd: -1,
            kill,
         }))
         .await;
      rx
   }

   fn setup_request(dst: SvcRole, src: SvcRole) -> Packet {
      let mut pkt = Packet::new();
      pkt.extend_from_slice(&[BNEP_CONTROL, BNEP_SETUP_CONN_REQ, 2]);
      pkt.extend_from_slice(&(dst as u16).to_be_bytes());
      pkt.extend_from_slice(&(src as u16).to_be_bytes());
      pkt
   }

   async fn send(actor: &mut ServerActor, addr: Address, conn_id: u64, input: SessionInput) {
      actor
         .handle_command(Command::Session {
            addr,
            conn_id,
            input,
         })
         .await;
   }

   #[tokio::test]
   async fn test_duplicate_connection_does_not_disturb_the_first() {
      let mut f = fixture(MockLink::default());

      let _rx1 = connect(&mut f.actor, PEER, 1).await;
      let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
      send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;

      let _rx2 = connect(&mut f.actor, PEER, 2).await;

      assert_eq!(f.actor.sessions.len(), 1);
      let session = &f.actor.sessions[&PEER];
      assert_eq!(session.machine.conn_id(), 1);
      assert_eq!(session.machine.state(), SetupState::AwaitingAuthorization);
   }

   #[tokio::test]
   async fn test_routed_admission_success() {
      let mut f = fixture(MockLink::default());

      let mut rx = connect(&mut f.actor, PEER, 1).await;
      let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
      send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;
      send(
         &mut f.actor,
         PEER,
         1,
         SessionInput::Resolved(AuthOutcome::Approved),
      )
      .await;

      let response = rx.try_recv().unwrap();
      assert_eq!(response.as_slice(), &[0x01, 0x02, 0x00, 0x00]);

      assert!(f.actor.sessions.is_empty());
      let clients = &f.actor.servers[&SvcRole::Nap].clients;
      assert_eq!(clients.len(), 1);
      assert!(clients.contains(&PEER));

      let up = f.link.up.lock().unwrap();
      assert_eq!(
         up.as_slice(),
         &[("bnep0".to_owned(), "10.20.30.1".parse().ok())]
      );

      let events = f.bus.events.lock().unwrap();
      assert!(events.contains(&PanEvent::ClientConnected {
         role: SvcRole::Nap,
         address: PEER,
      }));
   }

   #[tokio::test]
   async fn test_bridged_admission_attaches_and_skips_address() {
      let mut config = Config::default();
      config.nap.enabled = true;
      config.nap.bridge = Some("pan0".to_owned());
      let mut f = fixture_config(config, MockLink::default());

      let mut rx = connect(&mut f.actor, PEER, 1).await;
      let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
      send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;
      send(
         &mut f.actor,
         PEER,
         1,
         SessionInput::Resolved(AuthOutcome::Approved),
      )
      .await;

      assert_eq!(rx.try_recv().unwrap().as_slice(), &[0x01, 0x02, 0x00, 0x00]);
      assert_eq!(
         f.link.attached.lock().unwrap().as_slice(),
         &[("pan0".to_owned(), "bnep0".to_owned())]
      );
      assert_eq!(
         f.link.up.lock().unwrap().as_slice(),
         &[("bnep0".to_owned(), None)]
      );
   }

   #[tokio::test]
   async fn test_bring_up_failure_refuses_and_records_nothing() {
      let mut f = fixture(MockLink {
         fail_if_up: true,
         ..MockLink::default()
      });

      let mut rx = connect(&mut f.actor, PEER, 1).await;
      let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
      send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;
      send(
         &mut f.actor,
         PEER,
         1,
         SessionInput::Resolved(AuthOutcome::Approved),
      )
      .await;

      assert_eq!(rx.try_recv().unwrap().as_slice(), &[0x01, 0x02, 0x00, 0x04]);
      assert!(f.actor.servers[&SvcRole::Nap].clients.is_empty());
      assert!(f.bus.events.lock().unwrap().is_empty());
   }

   #[tokio::test]
   async fn test_kernel_attach_failure_refuses() {
      let mut f = fixture(MockLink {
         fail_connadd: true,
         ..MockLink::default()
      });

      let mut rx = connect(&mut f.actor, PEER, 1).await;
      let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
      send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;
      send(
         &mut f.actor,
         PEER,
         1,
         SessionInput::Resolved(AuthOutcome::Approved),
      )
      .await;

      assert_eq!(rx.try_recv().unwrap().as_slice(), &[0x01, 0x02, 0x00, 0x04]);
      assert!(f.actor.servers[&SvcRole::Nap].clients.is_empty());
   }

   #[tokio::test]
   async fn test_wide_uuid_rejected_without_authorization() {
      let mut f = fixture(MockLink::default());

      let mut rx = connect(&mut f.actor, PEER, 1).await;
      let mut pkt = Packet::new();
      pkt.extend_from_slice(&[BNEP_CONTROL, BNEP_SETUP_CONN_REQ, 4]);
      pkt.extend_from_slice(&[0x00, 0x00, 0x11, 0x16]);
      pkt.extend_from_slice(&[0x00, 0x00, 0x11, 0x15]);
      send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;

      let response = rx.try_recv().unwrap();
      assert_eq!(
         u16::from_be_bytes([response[2], response[3]]),
         BNEP_CONN_INVALID_SVC
      );
      assert!(f.actor.sessions.is_empty());
      assert!(f.authorizer.requests.lock().unwrap().is_empty());
   }

   #[tokio::test]
   async fn test_deadline_closes_session_without_response() {
      let mut f = fixture(MockLink::default());
      f.actor.setup_timeout = Duration::from_millis(20);

      let mut rx = connect(&mut f.actor, PEER, 1).await;

      let cmd = f.actor.loopback_rx.recv().await.unwrap();
      assert!(matches!(
         cmd,
         Command::Session {
            input: SessionInput::Deadline,
            ..
         }
      ));
      f.actor.handle_command(cmd).await;

      assert!(f.actor.sessions.is_empty());
      assert!(rx.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_hangup_cancels_pending_authorization_silently() {
      let mut f = fixture(MockLink::default());

      let mut rx = connect(&mut f.actor, PEER, 1).await;
      let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
      send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;
      send(&mut f.actor, PEER, 1, SessionInput::Hangup).await;

      assert!(f.actor.sessions.is_empty());
      assert!(rx.try_recv().is_err());

      // The cancellation is fire-and-forget on a spawned task.
      time::sleep(Duration::from_millis(20)).await;
      let cancels = f.authorizer.cancels.lock().unwrap();
      assert_eq!(cancels.as_slice(), &[(PEER, SvcRole::Nap.uuid())]);
   }

   #[tokio::test]
   async fn test_no_reply_refuses_and_cancels_remotely() {
      let mut f = fixture(MockLink::default());

      let mut rx = connect(&mut f.actor, PEER, 1).await;
      let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
      send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;
      send(
         &mut f.actor,
         PEER,
         1,
         SessionInput::Resolved(AuthOutcome::NoReply),
      )
      .await;

      assert_eq!(rx.try_recv().unwrap().as_slice(), &[0x01, 0x02, 0x00, 0x04]);

      time::sleep(Duration::from_millis(20)).await;
      assert_eq!(f.authorizer.cancels.lock().unwrap().len(), 1);
   }

   #[tokio::test]
   async fn test_denial_refuses_without_remote_cancel() {
      let mut f = fixture(MockLink::default());

      let mut rx = connect(&mut f.actor, PEER, 1).await;
      let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
      send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;
      send(
         &mut f.actor,
         PEER,
         1,
         SessionInput::Resolved(AuthOutcome::Denied),
      )
      .await;

      assert_eq!(rx.try_recv().unwrap().as_slice(), &[0x01, 0x02, 0x00, 0x04]);

      time::sleep(Duration::from_millis(20)).await;
      assert!(f.authorizer.cancels.lock().unwrap().is_empty());
   }

   #[tokio::test]
   async fn test_fourth_request_refused_and_session_destroyed() {
      let mut f = fixture(MockLink::default());

      let mut rx = connect(&mut f.actor, PEER, 1).await;
      for _ in 0..4 {
         let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
         send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;
      }

      assert_eq!(rx.try_recv().unwrap().as_slice(), &[0x01, 0x02, 0x00, 0x04]);
      assert!(f.actor.sessions.is_empty());
   }

   #[tokio::test]
   async fn test_stale_conn_id_events_are_dropped() {
      let mut f = fixture(MockLink::default());

      let _rx = connect(&mut f.actor, PEER, 1).await;
      let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
      send(&mut f.actor, PEER, 7, SessionInput::Data(pkt)).await;

      let session = &f.actor.sessions[&PEER];
      assert_eq!(session.machine.state(), SetupState::AwaitingSetup);
      assert_eq!(session.machine.attempts(), 0);

      // A resolution for a session that no longer exists is discarded too.
      send(
         &mut f.actor,
         Address([9; 6]),
         1,
         SessionInput::Resolved(AuthOutcome::Approved),
      )
      .await;
   }

   #[tokio::test]
   async fn test_disabled_target_server_is_refused() {
      let mut f = fixture_config(Config::default(), MockLink::default());

      let mut rx = connect(&mut f.actor, PEER, 1).await;
      let pkt = setup_request(SvcRole::Nap, SvcRole::Panu);
      send(&mut f.actor, PEER, 1, SessionInput::Data(pkt)).await;

      assert_eq!(rx.try_recv().unwrap().as_slice(), &[0x01, 0x02, 0x00, 0x04]);
      assert!(f.actor.sessions.is_empty());
   }

   #[tokio::test]
   async fn test_enable_registers_record_and_is_idempotent_guarded() {
      let mut f = fixture_config(Config::default(), MockLink::default());

      f.actor.enable(SvcRole::Nap).await.unwrap();
      assert!(f.actor.config.nap.enabled);
      let handle = f.actor.servers[&SvcRole::Nap].record_handle;
      assert_ne!(handle, 0);

      let again = f.actor.enable(SvcRole::Nap).await;
      assert!(matches!(again, Err(PanError::AlreadyEnabled(SvcRole::Nap))));

      let events = f.bus.events.lock().unwrap();
      assert_eq!(events.as_slice(), &[PanEvent::ServerEnabled(SvcRole::Nap)]);
   }

   #[tokio::test]
   async fn test_disable_clears_clients_and_record() {
      let mut f = fixture_config(Config::default(), MockLink::default());

      f.actor.enable(SvcRole::Nap).await.unwrap();
      let handle = f.actor.servers[&SvcRole::Nap].record_handle;
      f.actor.instance_mut(SvcRole::Nap).clients.insert(PEER);

      f.actor.disable(SvcRole::Nap).await.unwrap();

      assert!(!f.actor.config.nap.enabled);
      assert_eq!(f.actor.servers[&SvcRole::Nap].record_handle, 0);
      assert!(f.actor.servers[&SvcRole::Nap].clients.is_empty());
      assert_eq!(f.registry.removed.lock().unwrap().as_slice(), &[handle]);
      assert_eq!(f.link.conndels.lock().unwrap().as_slice(), &[PEER]);

      let again = f.actor.disable(SvcRole::Nap).await;
      assert!(matches!(again, Err(PanError::NotEnabled(SvcRole::Nap))));
   }

   #[tokio::test]
   async fn test_set_name_replaces_record_while_enabled() {
      let mut f = fixture_config(Config::default(), MockLink::default());

      f.actor.enable(SvcRole::Gn).await.unwrap();
      let old = f.actor.servers[&SvcRole::Gn].record_handle;

      f.actor
         .set_name(SvcRole::Gn, "Group network".to_owned())
         .await
         .unwrap();

      let new = f.actor.servers[&SvcRole::Gn].record_handle;
      assert_ne!(new, old);
      assert_eq!(f.registry.removed.lock().unwrap().as_slice(), &[old]);
      assert_eq!(f.actor.config.gn.name, "Group network");

      let empty = f.actor.set_name(SvcRole::Gn, String::new()).await;
      assert!(matches!(empty, Err(PanError::InvalidArgument(_))));
   }

   #[tokio::test]
   async fn test_start_registers_records_for_stored_servers() {
      let mut config = Config::default();
      config.panu.enabled = true;
      let mut f = fixture_config(config, MockLink::default());

      f.actor.start().await;
      assert_ne!(f.actor.servers[&SvcRole::Panu].record_handle, 0);
   }

   #[tokio::test]
   async fn test_address_range_validation() {
      let mut f = fixture_config(Config::default(), MockLink::default());

      f.actor
         .set_address_range(SvcRole::Nap, "192.168.7.1/24".to_owned())
         .unwrap();
      assert_eq!(
         f.actor.config.nap.address_range.as_deref(),
         Some("192.168.7.1/24")
      );

      let bad = f.actor.set_address_range(SvcRole::Nap, "garbage".to_owned());
      assert!(matches!(bad, Err(PanError::InvalidArgument(_))));
   }

   #[test]
   fn test_first_address_formats() {
      assert_eq!(
         first_address("10.0.0.1/24"),
         Some(Ipv4Addr::new(10, 0, 0, 1))
      );
      assert_eq!(
         first_address("10.0.0.1-10.0.0.254"),
         Some(Ipv4Addr::new(10, 0, 0, 1))
      );
      assert_eq!(
         first_address("172.16.5.9"),
         Some(Ipv4Addr::new(172, 16, 5, 9))
      );
      assert_eq!(first_address("not an address"), None);
   }
}
