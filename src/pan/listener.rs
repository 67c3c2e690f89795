//! L2CAP listener for incoming BNEP connections.
//!
//! Binds the BNEP PSM and accepts connections. Each accepted socket is
//! split into a receive task feeding datagrams into the server actor and a
//! send task draining an outbound queue of response packets; the actor
//! only ever deals in channels and the raw descriptor it needs for the
//! kernel handoff. The `Connected` command is enqueued before the receive
//! task exists, so no datagram can overtake the session registration.

use std::{
   os::fd::{AsRawFd, RawFd},
   sync::Arc,
};

use bluer::{
   Address, AddressType,
   l2cap::{Security, SecurityLevel, SeqPacket, Socket, SocketAddr},
};
use log::{debug, info, warn};
use smallvec::SmallVec;
use tokio::{
   select,
   sync::{mpsc, oneshot},
};

use crate::{
   bnep::proto::{BNEP_MTU, BNEP_PSM},
   error::Result,
   pan::manager::{Command, SessionInput},
};

pub type Packet = SmallVec<[u8; 32]>;

/// An accepted connection handed to the server actor.
#[derive(Debug)]
pub struct PeerConn {
   pub addr: Address,
   pub conn_id: u64,
   /// Outbound queue drained by the connection's send task. Closing it
   /// lets the task flush queued responses and release the socket.
   pub tx: mpsc::Sender<Packet>,
   /// Raw socket descriptor, for the kernel handoff on admission.
   pub fd: RawFd,
   /// Kill switch for the connection's receive task.
   pub kill: oneshot::Sender<()>,
}

/// Accepts BNEP connections until the actor goes away.
///
/// A failed accept is logged and the loop continues; only losing the
/// listening socket itself ends the server.
pub async fn serve(inbox: mpsc::Sender<Command>, secure: bool) -> Result<()> {
   let socket = Socket::new_seq_packet()?;
   socket.bind(SocketAddr::new(Address::any(), AddressType::BrEdr, BNEP_PSM))?;
   socket.set_recv_mtu(BNEP_MTU)?;
   if secure {
      socket.set_security(Security {
         level: SecurityLevel::High,
         key_size: 0,
      })?;
   }
   let listener = socket.listen(1)?;

   info!("Listening for BNEP connections on PSM {BNEP_PSM}");

   let mut next_conn_id: u64 = 0;
   loop {
      let (seq_packet, sa) = match listener.accept().await {
         Ok(accepted) => accepted,
         Err(e) => {
            warn!("Accept failed on BNEP socket: {e}");
            continue;
         },
      };

      info!("Connection from {} on PSM {}", sa.addr, sa.psm);

      next_conn_id += 1;
      if !spawn_conn(seq_packet, sa.addr, next_conn_id, &inbox).await {
         return Ok(());
      }
   }
}

/// Registers an accepted socket with the actor and spawns its I/O tasks.
///
/// Returns `false` once the actor is gone.
async fn spawn_conn(
   seq_packet: SeqPacket,
   addr: Address,
   conn_id: u64,
   inbox: &mpsc::Sender<Command>,
) -> bool {
   let fd = seq_packet.as_raw_fd();
   let seq_packet = Arc::new(seq_packet);
   let (out_tx, out_rx) = mpsc::channel(8);
   let (kill_tx, kill_rx) = oneshot::channel();

   let conn = PeerConn {
      addr,
      conn_id,
      tx: out_tx,
      fd,
      kill: kill_tx,
   };
   if inbox.send(Command::Connected(conn)).await.is_err() {
      return false;
   }

   tokio::spawn(recv_task(
      addr,
      conn_id,
      seq_packet.clone(),
      inbox.clone(),
      kill_rx,
   ));
   tokio::spawn(send_task(addr, out_rx, seq_packet));
   true
}

async fn recv_task(
   addr: Address,
   conn_id: u64,
   seq_packet: Arc<SeqPacket>,
   inbox: mpsc::Sender<Command>,
   mut kill: oneshot::Receiver<()>,
) {
   let mut buf = [0u8; BNEP_MTU as usize];
   loop {
      let received = select! {
         _ = &mut kill => return,
         received = seq_packet.recv(&mut buf) => received,
      };

      let input = match received {
         Ok(n) if n > 0 => {
            let data = &buf[..n];
            debug!("← {addr}: {}", hex::encode(data));
            SessionInput::Data(Packet::from_slice(data))
         },
         Ok(_) => {
            debug!("Hangup on BNEP socket from {addr}");
            SessionInput::Hangup
         },
         Err(e) => {
            warn!("Error on BNEP socket from {addr}: {e}");
            SessionInput::Hangup
         },
      };

      let hangup = matches!(input, SessionInput::Hangup);
      if inbox
         .send(Command::Session {
            addr,
            conn_id,
            input,
         })
         .await
         .is_err()
         || hangup
      {
         return;
      }
   }
}

async fn send_task(addr: Address, mut rx: mpsc::Receiver<Packet>, seq_packet: Arc<SeqPacket>) {
   while let Some(pkt) = rx.recv().await {
      debug!("→ {addr}: {}", hex::encode(&pkt));
      if let Err(e) = seq_packet.send(&pkt).await {
         warn!("Failed to send to {addr}: {e}");
         return;
      }
   }
}
