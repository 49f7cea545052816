//! A debug-adapter engine: the layered stack that turns pin toggles into
//! architected debug transactions against ARM ADIv5/ADIv6 and RISC-V
//! targets, the attach pipeline that discovers and classifies the silicon,
//! and the vendor Flash engine behind GDB's Flash write protocol.
//!
//! The layers, bottom up:
//!
//! - [`probe`]: bit-level SWD and JTAG tap drivers plus scan-chain
//!   enumeration. Implementations: direct pin toggling ([`probe::bitbang`])
//!   and the host side of the remote wire protocol ([`remote`]).
//! - [`architecture::arm`]: DP/AP register files, the SWD/JTAG DAP
//!   transports with WAIT retry and posted-read draining, MEM-AP memory
//!   access, ROM tables and the Cortex-M core driver.
//! - [`architecture::riscv`]: the JTAG DTM and the Debug Module.
//! - [`flashing`] and [`vendor`]: the buffered Flash pipeline and the
//!   vendor NVM controller drivers behind it.
//! - [`Session`]: attach, run control, breakwatch bookkeeping, the GDB
//!   memory map and monitor commands.
//!
//! ```no_run
//! use taplink::architecture::arm::dap::SwdDapInterface;
//! use taplink::architecture::arm::DpAddress;
//! use taplink::probe::bitbang::{BitbangSwd, SwdPins};
//! use taplink::{ProbeRegistry, Session};
//!
//! # struct Pins;
//! # impl SwdPins for Pins {
//! #     fn swclk(&mut self, _high: bool) {}
//! #     fn swdio_out(&mut self, _high: bool) {}
//! #     fn swdio_in(&mut self) -> bool { false }
//! #     fn swdio_float(&mut self) {}
//! #     fn swdio_drive(&mut self) {}
//! # }
//! # fn open_pins() -> Pins { Pins }
//! # fn main() -> Result<(), taplink::Error> {
//! let transport = SwdDapInterface::new(BitbangSwd::new(open_pins()));
//! let registry = ProbeRegistry::builtin();
//! let mut session = Session::attach(transport, DpAddress::Default, &registry)?;
//!
//! println!("attached to {}", session.target().name);
//! println!("{}", session.target().memory_map_xml());
//! # Ok(())
//! # }
//! ```

pub mod architecture;
pub mod config;
mod core;
mod error;
pub mod flashing;
mod memory;
pub mod probe;
pub mod remote;
mod session;
pub mod vendor;

pub use crate::core::{
    Breakwatch, BreakwatchKind, CoreInterface, CoreStatus, HaltReason, MemoryMappedRegister,
    RegisterId, VectorCatch,
};
pub use crate::error::Error;
pub use crate::memory::MemoryInterface;
pub use crate::probe::{DebugProbeError, WireProtocol};
pub use crate::session::{MonitorCommand, ProbeFn, ProbeRegistry, Session, Target};
