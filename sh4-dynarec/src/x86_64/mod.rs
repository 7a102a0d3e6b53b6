pub mod emitter;
pub mod regs;

pub use emitter::{Cc, EmitError, Emitter, Label};
pub use regs::{Reg, Xmm, HOST_ABI};
