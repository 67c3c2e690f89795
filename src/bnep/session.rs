//! Per-connection setup session state machine.
//!
//! A session tracks one inbound peer connection from accept until the
//! setup handshake resolves. The machine itself performs no I/O: it is fed
//! events (datagrams, hangups, the deadline, the authorization outcome)
//! and answers with the verdict its owner must carry out. All transport,
//! timer and authorization plumbing lives in the server actor.

use std::time::Duration;

use bluer::Address;

use crate::{
   bnep::proto::{self, BNEP_CONN_NOT_ALLOWED, SetupError, SvcRole},
   pan::authorize::AuthOutcome,
};

/// Maximum number of setup requests accepted from one session. The count
/// is incremented before the comparison, so the request after the limit is
/// the one refused.
pub const MAX_SETUP_ATTEMPTS: u32 = 3;

/// Time a peer has to deliver a valid setup request.
pub const SETUP_TIMEOUT: Duration = Duration::from_millis(1000);

/// Lifecycle phase of a setup session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
   /// Waiting for a valid setup request from the peer.
   AwaitingSetup,
   /// Setup request accepted, authorization outstanding.
   AwaitingAuthorization,
}

/// Inputs driving a session forward.
#[derive(Debug, Clone, Copy)]
pub enum SetupEvent<'a> {
   /// A datagram arrived on the connection.
   Data(&'a [u8]),
   /// The transport hung up or errored.
   Hangup,
   /// The setup window elapsed.
   Deadline,
   /// The pending authorization request resolved.
   Resolved(AuthOutcome),
}

/// What the owner must do after feeding an event into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
   /// Nothing to do.
   Ignore,
   /// Send the response code and destroy the session.
   Reject {
      response: u16,
      cancel_authorization: bool,
   },
   /// Destroy the session without sending anything.
   Close { cancel_authorization: bool },
   /// Request authorization for the accepted destination role and stop
   /// the deadline timer.
   Authorize { dst: SvcRole },
   /// Authorization granted; run interface bring-up for the role.
   Admit { dst: SvcRole },
}

/// One in-flight peer connection working through the BNEP setup handshake.
#[derive(Debug)]
pub struct SetupSession {
   peer: Address,
   conn_id: u64,
   state: SetupState,
   attempts: u32,
   dst_role: Option<SvcRole>,
   src_role: Option<u16>,
}

impl SetupSession {
   pub fn new(peer: Address, conn_id: u64) -> Self {
      Self {
         peer,
         conn_id,
         state: SetupState::AwaitingSetup,
         attempts: 0,
         dst_role: None,
         src_role: None,
      }
   }

   pub fn peer(&self) -> Address {
      self.peer
   }

   /// Identity of the transport connection backing this session; events
   /// from a superseded connection to the same address carry a different
   /// value and must be discarded.
   pub fn conn_id(&self) -> u64 {
      self.conn_id
   }

   pub fn state(&self) -> SetupState {
      self.state
   }

   pub fn attempts(&self) -> u32 {
      self.attempts
   }

   /// Destination role of the accepted setup request, if one was accepted.
   pub fn dst_role(&self) -> Option<SvcRole> {
      self.dst_role
   }

   /// Source role of the accepted setup request.
   pub fn src_role(&self) -> Option<u16> {
      self.src_role
   }

   /// Feeds one event into the machine. `enabled` reports whether the
   /// server instance for a role currently accepts connections.
   pub fn handle(&mut self, event: SetupEvent<'_>, enabled: impl Fn(SvcRole) -> bool) -> Verdict {
      match event {
         SetupEvent::Data(data) => self.on_data(data, enabled),
         SetupEvent::Hangup => Verdict::Close {
            cancel_authorization: self.authorizing(),
         },
         SetupEvent::Deadline => {
            if self.state == SetupState::AwaitingSetup {
               Verdict::Close {
                  cancel_authorization: false,
               }
            } else {
               // The timer is cancelled on transition; a raced firing is
               // harmless.
               Verdict::Ignore
            }
         },
         SetupEvent::Resolved(outcome) => self.on_resolved(outcome),
      }
   }

   fn authorizing(&self) -> bool {
      self.state == SetupState::AwaitingAuthorization
   }

   fn on_data(&mut self, data: &[u8], enabled: impl Fn(SvcRole) -> bool) -> Verdict {
      let pending = self.authorizing();

      let (dst, src) = match proto::parse_setup_request(data) {
         Ok(roles) => roles,
         Err(SetupError::Reject(response)) => {
            return Verdict::Reject {
               response,
               cancel_authorization: pending,
            };
         },
         Err(SetupError::NotSetup) => {
            return Verdict::Close {
               cancel_authorization: pending,
            };
         },
      };

      if let Some(response) = proto::check_roles(dst, src) {
         return Verdict::Reject {
            response,
            cancel_authorization: pending,
         };
      }

      self.attempts += 1;
      if self.attempts > MAX_SETUP_ATTEMPTS {
         // Peer retransmitting into a stuck setup; refuse instead of
         // restarting the handshake.
         return Verdict::Reject {
            response: BNEP_CONN_NOT_ALLOWED,
            cancel_authorization: pending,
         };
      }

      if pending {
         // Retransmission while the decision is outstanding; there is
         // never a second authorization in flight.
         return Verdict::Ignore;
      }

      let Some(dst_role) = SvcRole::from_repr(dst) else {
         return Verdict::Reject {
            response: proto::BNEP_CONN_INVALID_DST,
            cancel_authorization: false,
         };
      };

      if !enabled(dst_role) {
         return Verdict::Reject {
            response: BNEP_CONN_NOT_ALLOWED,
            cancel_authorization: false,
         };
      }

      self.dst_role = Some(dst_role);
      self.src_role = Some(src);
      self.state = SetupState::AwaitingAuthorization;
      Verdict::Authorize { dst: dst_role }
   }

   fn on_resolved(&mut self, outcome: AuthOutcome) -> Verdict {
      if !self.authorizing() {
         return Verdict::Ignore;
      }

      match (outcome, self.dst_role) {
         (AuthOutcome::Approved, Some(dst)) => Verdict::Admit { dst },
         (AuthOutcome::Denied | AuthOutcome::Approved, _) => Verdict::Reject {
            response: BNEP_CONN_NOT_ALLOWED,
            cancel_authorization: false,
         },
         (AuthOutcome::NoReply, _) => Verdict::Reject {
            response: BNEP_CONN_NOT_ALLOWED,
            cancel_authorization: true,
         },
      }
   }
}
