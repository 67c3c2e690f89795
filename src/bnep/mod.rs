//! BNEP protocol support: the control-packet codec and the per-connection
//! setup state machine.

pub mod proto;
pub mod session;
