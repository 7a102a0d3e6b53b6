//! SH-4 architectural state and recompiler contracts.
//!
//! This crate holds everything the x86-64 backend shares with the rest
//! of an SH-4 emulator: the context struct whose field addresses get
//! embedded into generated code, the decoded intermediate opcode model,
//! runtime block descriptors, and the narrow host contracts (address
//! space, interpreter fallbacks, MMU helpers) the backend consumes.

pub mod block;
pub mod mem;
pub mod sh4ctx;
pub mod shil;

pub use block::{BlockEndType, RuntimeBlockInfo};
pub use mem::{AddrSpace, HostOps, ImmMemRef, OpCallFp};
pub use sh4ctx::{Sh4Context, Sh4ThrownException, StatusRegister};
pub use shil::{ShilOp, ShilOpcode, ShilParam};
