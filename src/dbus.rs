use std::str::FromStr;

use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{bnep::proto::SvcRole, pan::manager::PanManager};

pub struct PanService {
   manager: PanManager,
}

impl PanService {
   pub const fn new(manager: PanManager) -> Self {
      Self { manager }
   }
}

fn parse_role(role: &str) -> zbus::fdo::Result<SvcRole> {
   SvcRole::from_str(role)
      .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown PAN role: {role}")))
}

fn failed(e: crate::error::PanError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.bnepd.Server1")]
impl PanService {
   async fn enable(&self, role: String) -> zbus::fdo::Result<bool> {
      let role = parse_role(&role)?;
      self.manager.enable(role).await.map_err(failed)?;
      info!("Enabled {role} server over D-Bus");
      Ok(true)
   }

   async fn disable(&self, role: String) -> zbus::fdo::Result<bool> {
      let role = parse_role(&role)?;
      self.manager.disable(role).await.map_err(failed)?;
      info!("Disabled {role} server over D-Bus");
      Ok(true)
   }

   async fn is_enabled(&self, role: String) -> zbus::fdo::Result<bool> {
      let role = parse_role(&role)?;
      self.manager.is_enabled(role).await.map_err(failed)
   }

   async fn set_name(&self, role: String, name: String) -> zbus::fdo::Result<bool> {
      let role = parse_role(&role)?;
      self.manager.set_name(role, name).await.map_err(failed)?;
      Ok(true)
   }

   async fn get_name(&self, role: String) -> zbus::fdo::Result<String> {
      let role = parse_role(&role)?;
      self.manager.get_name(role).await.map_err(failed)
   }

   async fn get_uuid(&self, role: String) -> zbus::fdo::Result<String> {
      let role = parse_role(&role)?;
      Ok(role.uuid().to_string())
   }

   async fn set_routing(&self, role: String, iface: String) -> zbus::fdo::Result<bool> {
      let role = parse_role(&role)?;
      self.manager.set_routing(role, iface).await.map_err(failed)?;
      Ok(true)
   }

   async fn set_address_range(&self, role: String, range: String) -> zbus::fdo::Result<bool> {
      let role = parse_role(&role)?;
      self
         .manager
         .set_address_range(role, range)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn get_info(&self, role: String) -> zbus::fdo::Result<String> {
      let role = parse_role(&role)?;
      let info = self.manager.get_info(role).await.map_err(failed)?;
      Ok(info.to_string())
   }

   // Signals
   #[zbus(signal)]
   pub async fn server_enabled(emitter: &SignalEmitter<'_>, role: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn server_disabled(emitter: &SignalEmitter<'_>, role: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn client_connected(
      emitter: &SignalEmitter<'_>,
      role: &str,
      address: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self.manager.connected_count().await.unwrap_or_default()
   }
}
