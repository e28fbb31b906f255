//! How each target keeps machine state in registers.
//!
//! x64 has few general purpose registers, so state variables go through a bounded
//! [`RegisterPool`](crate::pool::RegisterPool) which spills in least recently used order. ARM64
//! has plenty of them and keeps every variable pinned to its own register for the whole sample.
mod arm64;
mod x64;

use crate::{
    Target,
    state::{Pointers, StateAccess},
};
use cranelift::frontend::FunctionBuilder;

pub use arm64::PinnedState;
pub use x64::PooledState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Pooled,
    Pinned,
}

impl StateKind {
    pub fn for_target(target: Target) -> Self {
        match target {
            Target::X64 => Self::Pooled,
            Target::Arm64 => Self::Pinned,
        }
    }

    pub fn create(self, bd: &mut FunctionBuilder<'_>, ptrs: Pointers) -> Box<dyn StateAccess> {
        match self {
            Self::Pooled => Box::new(PooledState::new(bd, ptrs)),
            Self::Pinned => Box::new(PinnedState::new(ptrs)),
        }
    }
}
