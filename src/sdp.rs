//! Service discovery records for the PAN server roles.
//!
//! Building a record is a pure function of the role, the configured
//! service name and the security flag; registration with the discovery
//! daemon happens behind the [`SdpRegistry`] boundary and is keyed by the
//! handle it returns.

use std::fmt::Write;

use async_trait::async_trait;
use smol_str::SmolStr;
use zbus::Proxy;

use crate::{
   bnep::proto::{BNEP_PSM, SvcRole},
   error::{PanError, Result},
};

// Universal attribute identifiers.
const ATTR_SVCLASS_ID_LIST: u16 = 0x0001;
const ATTR_PROTO_DESC_LIST: u16 = 0x0004;
const ATTR_BROWSE_GRP_LIST: u16 = 0x0005;
const ATTR_LANG_BASE_LIST: u16 = 0x0006;
const ATTR_PROFILE_DESC_LIST: u16 = 0x0009;
const ATTR_SVC_NAME: u16 = 0x0100;
const ATTR_SVC_DESCRIPTION: u16 = 0x0101;

// PAN specific attribute identifiers.
const ATTR_SECURITY_DESC: u16 = 0x030a;
const ATTR_NET_ACCESS_TYPE: u16 = 0x030b;
const ATTR_MAX_NET_ACCESS_RATE: u16 = 0x030c;

// Protocol UUIDs referenced from the protocol descriptor list.
const L2CAP_UUID: u16 = 0x0100;
const BNEP_UUID: u16 = 0x000f;
const PUBLIC_BROWSE_GROUP: u16 = 0x1002;

/// Version advertised in the BNEP protocol descriptor.
const BNEP_VERSION: u16 = 0x0100;
/// PAN profile version.
const PROFILE_VERSION: u16 = 0x0100;

/// Network packet types carried over the link: IPv4 and ARP.
const NET_PACKET_TYPES: [u16; 2] = [0x0800, 0x0806];

/// ISO 639 code for English.
const LANG_ENGLISH: u16 = (b'e' as u16) << 8 | b'n' as u16;
/// UTF-8 MIBenum (http://www.iana.org/assignments/character-sets).
const UTF8_ENCODING: u16 = 106;
/// Offset of the primary language attribute base.
const PRIMARY_LANG_BASE: u16 = 0x0100;

/// Network access type advertised by a NAP: other network.
const NAP_NET_ACCESS_TYPE: u16 = 0xfffe;

/// Descriptor advertised for an enabled PAN server role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
   pub service_class: u16,
   pub profile: u16,
   pub profile_version: u16,
   pub psm: u16,
   pub bnep_version: u16,
   pub net_packet_types: [u16; 2],
   /// Primary language: ISO 639 code, character encoding, attribute base.
   pub lang: (u16, u16, u16),
   pub security_desc: u16,
   pub name: SmolStr,
   pub description: SmolStr,
   /// NAP only: advertised access type and ceiling rate.
   pub net_access: Option<(u16, u32)>,
}

/// Builds the discovery record advertised for `role`.
///
/// Deterministic: the same inputs always produce the same record.
pub fn record_for_role(role: SvcRole, name: &str, secure: bool) -> ServiceRecord {
   ServiceRecord {
      service_class: role as u16,
      profile: role as u16,
      profile_version: PROFILE_VERSION,
      psm: BNEP_PSM,
      bnep_version: BNEP_VERSION,
      net_packet_types: NET_PACKET_TYPES,
      lang: (LANG_ENGLISH, UTF8_ENCODING, PRIMARY_LANG_BASE),
      security_desc: u16::from(secure),
      name: name.into(),
      description: SmolStr::new_static("PAN service"),
      net_access: (role == SvcRole::Nap).then_some((NAP_NET_ACCESS_TYPE, 0)),
   }
}

fn escape_xml(text: &str, out: &mut String) {
   for c in text.chars() {
      match c {
         '&' => out.push_str("&amp;"),
         '<' => out.push_str("&lt;"),
         '>' => out.push_str("&gt;"),
         '"' => out.push_str("&quot;"),
         _ => out.push(c),
      }
   }
}

impl ServiceRecord {
   /// Renders the record in the XML form the discovery daemon accepts.
   ///
   /// Attributes are emitted in ascending identifier order.
   pub fn to_xml(&self) -> String {
      let mut xml = String::with_capacity(1024);
      xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<record>\n");

      attribute(&mut xml, ATTR_SVCLASS_ID_LIST, |body| {
         let _ = write!(
            body,
            "<sequence><uuid value=\"{:#06x}\" /></sequence>",
            self.service_class
         );
      });

      attribute(&mut xml, ATTR_PROTO_DESC_LIST, |body| {
         let _ = write!(
            body,
            "<sequence><sequence><uuid value=\"{L2CAP_UUID:#06x}\" />\
             <uint16 value=\"{:#06x}\" /></sequence>",
            self.psm
         );
         let _ = write!(
            body,
            "<sequence><uuid value=\"{BNEP_UUID:#06x}\" />\
             <uint16 value=\"{:#06x}\" /><sequence>",
            self.bnep_version
         );
         for ptype in self.net_packet_types {
            let _ = write!(body, "<uint16 value=\"{ptype:#06x}\" />");
         }
         body.push_str("</sequence></sequence></sequence>");
      });

      attribute(&mut xml, ATTR_BROWSE_GRP_LIST, |body| {
         let _ = write!(
            body,
            "<sequence><uuid value=\"{PUBLIC_BROWSE_GROUP:#06x}\" /></sequence>"
         );
      });

      attribute(&mut xml, ATTR_LANG_BASE_LIST, |body| {
         let (code, encoding, base) = self.lang;
         let _ = write!(
            body,
            "<sequence><uint16 value=\"{code:#06x}\" />\
             <uint16 value=\"{encoding:#06x}\" />\
             <uint16 value=\"{base:#06x}\" /></sequence>"
         );
      });

      attribute(&mut xml, ATTR_PROFILE_DESC_LIST, |body| {
         let _ = write!(
            body,
            "<sequence><sequence><uuid value=\"{:#06x}\" />\
             <uint16 value=\"{:#06x}\" /></sequence></sequence>",
            self.profile, self.profile_version
         );
      });

      attribute(&mut xml, ATTR_SVC_NAME, |body| {
         body.push_str("<text value=\"");
         escape_xml(&self.name, body);
         body.push_str("\" />");
      });

      attribute(&mut xml, ATTR_SVC_DESCRIPTION, |body| {
         body.push_str("<text value=\"");
         escape_xml(&self.description, body);
         body.push_str("\" />");
      });

      attribute(&mut xml, ATTR_SECURITY_DESC, |body| {
         let _ = write!(body, "<uint16 value=\"{:#06x}\" />", self.security_desc);
      });

      if let Some((access_type, max_rate)) = self.net_access {
         attribute(&mut xml, ATTR_NET_ACCESS_TYPE, |body| {
            let _ = write!(body, "<uint16 value=\"{access_type:#06x}\" />");
         });
         attribute(&mut xml, ATTR_MAX_NET_ACCESS_RATE, |body| {
            let _ = write!(body, "<uint32 value=\"{max_rate:#010x}\" />");
         });
      }

      xml.push_str("</record>\n");
      xml
   }
}

fn attribute(xml: &mut String, id: u16, body: impl FnOnce(&mut String)) {
   let _ = write!(xml, "\t<attribute id=\"{id:#06x}\">\n\t\t");
   body(xml);
   xml.push_str("\n\t</attribute>\n");
}

/// Registration boundary towards the service discovery daemon.
#[async_trait]
pub trait SdpRegistry: Send + Sync + 'static {
   /// Registers a record, returning its non-zero handle.
   async fn register(&self, record: &ServiceRecord) -> Result<u32>;

   /// Removes a previously registered record.
   async fn remove(&self, handle: u32) -> Result<()>;
}

/// Registry backed by the Bluetooth daemon's service database.
pub struct BluezRegistry {
   proxy: Proxy<'static>,
}

impl BluezRegistry {
   pub async fn new(connection: &zbus::Connection) -> Result<Self> {
      let proxy = Proxy::new(connection, "org.bluez", "/org/bluez", "org.bluez.Database").await?;
      Ok(Self { proxy })
   }
}

#[async_trait]
impl SdpRegistry for BluezRegistry {
   async fn register(&self, record: &ServiceRecord) -> Result<u32> {
      let xml = record.to_xml();
      let handle: u32 = self
         .proxy
         .call("AddServiceRecordFromXML", &(xml.as_str(),))
         .await
         .map_err(|e| PanError::RecordRegistration(e.to_string()))?;
      Ok(handle)
   }

   async fn remove(&self, handle: u32) -> Result<()> {
      self
         .proxy
         .call::<_, _, ()>("RemoveServiceRecord", &(handle,))
         .await?;
      Ok(())
   }
}
