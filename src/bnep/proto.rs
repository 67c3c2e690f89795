//! BNEP wire protocol definitions and the connection-setup codec.
//!
//! This module contains the control-packet constants, the PAN role
//! identifiers and the parsing/building of the setup request/response
//! exchange that precedes any data traffic on a BNEP link.

use thiserror::Error;
use uuid::Uuid;

/// L2CAP PSM reserved for BNEP.
pub const BNEP_PSM: u16 = 15;

/// L2CAP MTU required by the BNEP specification.
pub const BNEP_MTU: u16 = 1691;

/// Packet type of control packets.
pub const BNEP_CONTROL: u8 = 0x01;

/// Control opcode: setup connection request.
pub const BNEP_SETUP_CONN_REQ: u8 = 0x01;
/// Control opcode: setup connection response.
pub const BNEP_SETUP_CONN_RSP: u8 = 0x02;

// Setup response codes, fixed by the BNEP specification.
pub const BNEP_SUCCESS: u16 = 0x0000;
pub const BNEP_CONN_INVALID_DST: u16 = 0x0001;
pub const BNEP_CONN_INVALID_SRC: u16 = 0x0002;
pub const BNEP_CONN_INVALID_SVC: u16 = 0x0003;
pub const BNEP_CONN_NOT_ALLOWED: u16 = 0x0004;

/// Bytes preceding the service UUIDs in a setup request: type, ctrl and
/// UUID size.
const SETUP_REQ_HEAD: usize = 3;

/// Only 16-bit service UUIDs are supported; the 4 and 16 byte encodings
/// the specification also allows are refused, not crashed on.
const SUPPORTED_UUID_SIZE: usize = 2;

/// Bluetooth base UUID the 16-bit service identifiers expand against.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// PAN profile roles, identified by their 16-bit service UUIDs.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::EnumIter,
)]
#[repr(u16)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SvcRole {
   Panu = 0x1115,
   Nap = 0x1116,
   Gn = 0x1117,
}

impl SvcRole {
   /// Expands the 16-bit service identifier against the Bluetooth base
   /// UUID.
   pub fn uuid(self) -> Uuid {
      Uuid::from_u128(BASE_UUID | (u128::from(self as u16) << 96))
   }
}

/// Why a received datagram did not yield a valid setup request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupError {
   /// Malformed setup request, answered with the given response code.
   #[error("invalid setup request (response {0:#06x})")]
   Reject(u16),

   /// A control packet other than a setup request; dropped without a
   /// reply, it is not this session's concern.
   #[error("not a setup request")]
   NotSetup,
}

/// Parses a BNEP setup connection request.
///
/// Returns the raw destination and source role values in request order.
/// Validation order is fixed: UUID width first, then exact length, then
/// packet type. A datagram shorter than the header reads as UUID size 0
/// and is refused like any other unsupported width.
pub fn parse_setup_request(data: &[u8]) -> Result<(u16, u16), SetupError> {
   let uuid_size = data.get(2).map_or(0, |b| usize::from(*b));
   if uuid_size != SUPPORTED_UUID_SIZE {
      return Err(SetupError::Reject(BNEP_CONN_INVALID_SVC));
   }

   if data.len() != SETUP_REQ_HEAD + 2 * uuid_size {
      return Err(SetupError::Reject(BNEP_CONN_INVALID_SVC));
   }

   if data[0] != BNEP_CONTROL || data[1] != BNEP_SETUP_CONN_REQ {
      return Err(SetupError::NotSetup);
   }

   let dst = u16::from_be_bytes([data[3], data[4]]);
   let src = u16::from_be_bytes([data[5], data[6]]);
   Ok((dst, src))
}

/// Checks a requested role pair against the allowed PAN profile scenarios.
///
/// Returns the response code refusing the pair, or `None` when the pair is
/// acceptable.
pub fn check_roles(dst: u16, src: u16) -> Option<u16> {
   match SvcRole::from_repr(dst) {
      Some(SvcRole::Nap | SvcRole::Gn) => {
         if src == SvcRole::Panu as u16 {
            None
         } else {
            Some(BNEP_CONN_INVALID_SRC)
         }
      },
      Some(SvcRole::Panu) => {
         if SvcRole::from_repr(src).is_some() {
            None
         } else {
            Some(BNEP_CONN_INVALID_SRC)
         }
      },
      None => Some(BNEP_CONN_INVALID_DST),
   }
}

/// Builds the fixed 4-byte setup connection response carrying `response`
/// in network byte order.
pub fn build_setup_response(response: u16) -> [u8; 4] {
   let [hi, lo] = response.to_be_bytes();
   [BNEP_CONTROL, BNEP_SETUP_CONN_RSP, hi, lo]
}

#[cfg(test)]
mod tests {
   use super::*;

   fn setup_request(uuid_size: u8, dst: u16, src: u16) -> Vec<u8> {
      let mut pkt = vec![BNEP_CONTROL, BNEP_SETUP_CONN_REQ, uuid_size];
      pkt.extend_from_slice(&dst.to_be_bytes());
      pkt.extend_from_slice(&src.to_be_bytes());
      pkt
   }

   #[test]
   fn test_parse_valid_request() {
      let pkt = setup_request(2, SvcRole::Nap as u16, SvcRole::Panu as u16);
      let (dst, src) = parse_setup_request(&pkt).unwrap();
      assert_eq!(dst, 0x1116);
      assert_eq!(src, 0x1115);
   }

   #[test]
   fn test_uuid_size_check_precedes_everything() {
      // dst PANU / src NAP would fail the role table, but the 4-byte UUID
      // width must be refused first.
      let mut pkt = vec![BNEP_CONTROL, BNEP_SETUP_CONN_REQ, 4];
      pkt.extend_from_slice(&[0x00, 0x00, 0x11, 0x15]);
      pkt.extend_from_slice(&[0x00, 0x00, 0x11, 0x16]);
      assert_eq!(
         parse_setup_request(&pkt),
         Err(SetupError::Reject(BNEP_CONN_INVALID_SVC))
      );
   }

   #[test]
   fn test_length_must_match_exactly() {
      let mut pkt = setup_request(2, SvcRole::Nap as u16, SvcRole::Panu as u16);
      pkt.push(0x00);
      assert_eq!(
         parse_setup_request(&pkt),
         Err(SetupError::Reject(BNEP_CONN_INVALID_SVC))
      );

      let short = &pkt[..6];
      assert_eq!(
         parse_setup_request(short),
         Err(SetupError::Reject(BNEP_CONN_INVALID_SVC))
      );
   }

   #[test]
   fn test_truncated_header_is_invalid_service() {
      assert_eq!(
         parse_setup_request(&[BNEP_CONTROL]),
         Err(SetupError::Reject(BNEP_CONN_INVALID_SVC))
      );
      assert_eq!(
         parse_setup_request(&[]),
         Err(SetupError::Reject(BNEP_CONN_INVALID_SVC))
      );
   }

   #[test]
   fn test_other_control_packets_are_dropped() {
      // Filter-set control message with a well-formed length.
      let mut pkt = setup_request(2, 0x0000, 0x0000);
      pkt[1] = 0x06;
      assert_eq!(parse_setup_request(&pkt), Err(SetupError::NotSetup));

      let mut pkt = setup_request(2, 0x1116, 0x1115);
      pkt[0] = 0x82;
      assert_eq!(parse_setup_request(&pkt), Err(SetupError::NotSetup));
   }

   #[test]
   fn test_role_table() {
      let nap = SvcRole::Nap as u16;
      let gn = SvcRole::Gn as u16;
      let panu = SvcRole::Panu as u16;

      // NAP and GN only accept PANU peers.
      assert_eq!(check_roles(nap, panu), None);
      assert_eq!(check_roles(gn, panu), None);
      assert_eq!(check_roles(nap, nap), Some(BNEP_CONN_INVALID_SRC));
      assert_eq!(check_roles(nap, gn), Some(BNEP_CONN_INVALID_SRC));
      assert_eq!(check_roles(gn, gn), Some(BNEP_CONN_INVALID_SRC));
      assert_eq!(check_roles(gn, nap), Some(BNEP_CONN_INVALID_SRC));

      // PANU accepts any of the three roles.
      assert_eq!(check_roles(panu, panu), None);
      assert_eq!(check_roles(panu, nap), None);
      assert_eq!(check_roles(panu, gn), None);
      assert_eq!(check_roles(panu, 0x1234), Some(BNEP_CONN_INVALID_SRC));

      // Anything else is not a valid destination.
      assert_eq!(check_roles(0x1234, panu), Some(BNEP_CONN_INVALID_DST));
      assert_eq!(check_roles(0x0000, panu), Some(BNEP_CONN_INVALID_DST));
   }

   #[test]
   fn test_response_layout() {
      assert_eq!(build_setup_response(BNEP_SUCCESS), [0x01, 0x02, 0x00, 0x00]);
      assert_eq!(
         build_setup_response(BNEP_CONN_NOT_ALLOWED),
         [0x01, 0x02, 0x00, 0x04]
      );
      assert_eq!(
         build_setup_response(BNEP_CONN_INVALID_SVC),
         [0x01, 0x02, 0x00, 0x03]
      );
   }

   #[test]
   fn test_role_uuid_expansion() {
      assert_eq!(
         SvcRole::Nap.uuid().to_string(),
         "00001116-0000-1000-8000-00805f9b34fb"
      );
      assert_eq!(
         SvcRole::Panu.uuid().to_string(),
         "00001115-0000-1000-8000-00805f9b34fb"
      );
   }

   #[test]
   fn test_role_names_round_trip() {
      assert_eq!(SvcRole::Nap.to_string(), "nap");
      assert_eq!("gn".parse::<SvcRole>().unwrap(), SvcRole::Gn);
      assert_eq!("PANU".parse::<SvcRole>().unwrap(), SvcRole::Panu);
      assert!("bogus".parse::<SvcRole>().is_err());
   }
}
