//! Kernel-side collaborators of the admission path: BNEP interface
//! creation, bridge membership and link bring-up.
//!
//! The admission logic only sees the [`LinkOps`] trait; [`KernelLink`] is
//! the thin ioctl implementation handing an authorized L2CAP socket to the
//! kernel BNEP module and wiring the resulting network interface.

use std::{ffi::CString, io, mem, net::Ipv4Addr, os::fd::RawFd};

use bluer::Address;
use log::debug;
use smol_str::SmolStr;

/// Kernel operations the admission path depends on.
pub trait LinkOps: Send + Sync + 'static {
   /// Hands the connected L2CAP socket to the kernel BNEP module, creating
   /// a network interface for the session. Returns the interface name
   /// chosen by the kernel.
   fn connadd(&self, sock: RawFd, role: u16, prefix: &str) -> io::Result<SmolStr>;

   /// Tears down the kernel BNEP connection towards a peer.
   fn conndel(&self, addr: Address) -> io::Result<()>;

   fn bridge_create(&self, bridge: &str) -> io::Result<()>;

   fn bridge_remove(&self, bridge: &str) -> io::Result<()>;

   /// Attaches `dev` to `bridge`.
   fn bridge_attach(&self, bridge: &str, dev: &str) -> io::Result<()>;

   /// Brings `dev` up, optionally assigning a local IPv4 address first.
   fn if_up(&self, dev: &str, addr: Option<Ipv4Addr>) -> io::Result<()>;
}

const BTPROTO_BNEP: libc::c_int = 4;

// _IOW('B', 200, unsigned long) / _IOW('B', 201, unsigned long)
const BNEPCONNADD: libc::c_ulong = 0x400842c8;
const BNEPCONNDEL: libc::c_ulong = 0x400842c9;

const SIOCBRADDBR: libc::c_ulong = 0x89a0;
const SIOCBRDELBR: libc::c_ulong = 0x89a1;
const SIOCBRADDIF: libc::c_ulong = 0x89a2;

const IFNAMSIZ: usize = 16;

#[repr(C)]
struct BnepConnAddReq {
   sock: libc::c_int,
   role: u16,
   device: [u8; IFNAMSIZ],
}

#[repr(C)]
struct BnepConnDelReq {
   flags: u32,
   dst: [u8; 6],
}

#[repr(C)]
union IfrData {
   flags: libc::c_short,
   ifindex: libc::c_int,
   addr: libc::sockaddr_in,
   _pad: [u8; 24],
}

#[repr(C)]
struct IfReq {
   name: [u8; IFNAMSIZ],
   data: IfrData,
}

/// Closes the wrapped descriptor on drop.
struct Fd(RawFd);

impl Drop for Fd {
   fn drop(&mut self) {
      unsafe {
         libc::close(self.0);
      }
   }
}

fn check(rc: libc::c_int) -> io::Result<()> {
   if rc < 0 {
      Err(io::Error::last_os_error())
   } else {
      Ok(())
   }
}

fn ifname_bytes(name: &str) -> io::Result<[u8; IFNAMSIZ]> {
   if name.is_empty() || name.len() >= IFNAMSIZ {
      return Err(io::Error::from(io::ErrorKind::InvalidInput));
   }
   let mut bytes = [0u8; IFNAMSIZ];
   bytes[..name.len()].copy_from_slice(name.as_bytes());
   Ok(bytes)
}

fn inet_socket() -> io::Result<Fd> {
   let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
   check(fd)?;
   Ok(Fd(fd))
}

/// ioctl-based implementation talking to the running kernel.
pub struct KernelLink {
   /// BNEP control socket the connection ioctls are issued on.
   ctl: Fd,
}

impl KernelLink {
   pub fn new() -> io::Result<Self> {
      let fd = unsafe {
         libc::socket(
            libc::AF_BLUETOOTH,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            BTPROTO_BNEP,
         )
      };
      check(fd)?;
      Ok(Self { ctl: Fd(fd) })
   }
}

impl LinkOps for KernelLink {
   fn connadd(&self, sock: RawFd, role: u16, prefix: &str) -> io::Result<SmolStr> {
      // Leave room for the index the kernel substitutes for %d.
      if prefix.len() + 2 >= IFNAMSIZ {
         return Err(io::Error::from(io::ErrorKind::InvalidInput));
      }

      let mut req = BnepConnAddReq {
         sock,
         role,
         device: [0; IFNAMSIZ],
      };
      let template = format!("{prefix}%d");
      req.device[..template.len()].copy_from_slice(template.as_bytes());

      check(unsafe { libc::ioctl(self.ctl.0, BNEPCONNADD as _, &mut req) })?;

      let end = req.device.iter().position(|b| *b == 0).unwrap_or(IFNAMSIZ);
      let device = SmolStr::new(String::from_utf8_lossy(&req.device[..end]));
      debug!("Kernel BNEP connection added on {device}");
      Ok(device)
   }

   fn conndel(&self, addr: Address) -> io::Result<()> {
      let req = BnepConnDelReq { flags: 0, dst: addr.0 };
      check(unsafe { libc::ioctl(self.ctl.0, BNEPCONNDEL as _, &req) })
   }

   fn bridge_create(&self, bridge: &str) -> io::Result<()> {
      let fd = inet_socket()?;
      let name = CString::new(bridge).map_err(|_| io::ErrorKind::InvalidInput)?;
      check(unsafe { libc::ioctl(fd.0, SIOCBRADDBR as _, name.as_ptr()) })
   }

   fn bridge_remove(&self, bridge: &str) -> io::Result<()> {
      let fd = inet_socket()?;
      let name = CString::new(bridge).map_err(|_| io::ErrorKind::InvalidInput)?;
      check(unsafe { libc::ioctl(fd.0, SIOCBRDELBR as _, name.as_ptr()) })
   }

   fn bridge_attach(&self, bridge: &str, dev: &str) -> io::Result<()> {
      let dev_c = CString::new(dev).map_err(|_| io::ErrorKind::InvalidInput)?;
      let ifindex = unsafe { libc::if_nametoindex(dev_c.as_ptr()) };
      if ifindex == 0 {
         return Err(io::Error::last_os_error());
      }

      let mut ifr: IfReq = unsafe { mem::zeroed() };
      ifr.name = ifname_bytes(bridge)?;
      ifr.data.ifindex = ifindex as libc::c_int;

      let fd = inet_socket()?;
      check(unsafe { libc::ioctl(fd.0, SIOCBRADDIF as _, &mut ifr) })
   }

   fn if_up(&self, dev: &str, addr: Option<Ipv4Addr>) -> io::Result<()> {
      let fd = inet_socket()?;
      let name = ifname_bytes(dev)?;

      if let Some(addr) = addr {
         let mut ifr: IfReq = unsafe { mem::zeroed() };
         ifr.name = name;
         ifr.data.addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
               s_addr: u32::from(addr).to_be(),
            },
            sin_zero: [0; 8],
         };
         check(unsafe { libc::ioctl(fd.0, libc::SIOCSIFADDR as _, &mut ifr) })?;
      }

      let mut ifr: IfReq = unsafe { mem::zeroed() };
      ifr.name = name;
      check(unsafe { libc::ioctl(fd.0, libc::SIOCGIFFLAGS as _, &mut ifr) })?;

      let flags = unsafe { ifr.data.flags };
      ifr.data.flags = flags | libc::IFF_UP as libc::c_short;
      check(unsafe { libc::ioctl(fd.0, libc::SIOCSIFFLAGS as _, &mut ifr) })?;

      debug!("Interface {dev} is up");
      Ok(())
   }
}
