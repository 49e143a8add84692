//! Hypercall dispatch table.
//!
//! A fixed array indexed by hypercall number whose slots name the module
//! that owns the call.  Built once while modules run their setup and never
//! modified after the guest starts.

use log::debug;
use thiserror::Error;
use ukvm_protocol::{Hypercall, HYPERCALL_MAX};

use crate::loader::LoadedImage;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("hypercall {call} already registered by module {owner}")]
    AlreadyRegistered { call: &'static str, owner: usize },

    #[error("invalid guest hypercall: num={nr}")]
    InvalidHypercall { nr: u32 },
}

/// What the exit loop should do after a hypercall returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// The guest asked to stop with this status.
    Halt(i32),
    /// A new image replaced the running one; modules must be told.
    Loaded(LoadedImage),
}

/// Index of a module in the monitor's module list.
pub type ModuleId = usize;

#[derive(Clone, Debug, Default)]
pub struct HypercallTable {
    slots: [Option<ModuleId>; HYPERCALL_MAX],
}

impl HypercallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, call: Hypercall, owner: ModuleId) -> Result<(), DispatchError> {
        let slot = &mut self.slots[call.nr() as usize];
        if let Some(existing) = *slot {
            return Err(DispatchError::AlreadyRegistered {
                call: call.name(),
                owner: existing,
            });
        }
        debug!("hypercall {} ({}) -> module {}", call.name(), call.nr(), owner);
        *slot = Some(owner);
        Ok(())
    }

    /// Resolve a guest-supplied number to its call and owning module.
    pub fn lookup(&self, nr: u32) -> Result<(Hypercall, ModuleId), DispatchError> {
        let call = Hypercall::from_nr(nr).ok_or(DispatchError::InvalidHypercall { nr })?;
        let owner = self.slots[nr as usize].ok_or(DispatchError::InvalidHypercall { nr })?;
        Ok((call, owner))
    }

    pub fn registered(&self) -> impl Iterator<Item = Hypercall> + '_ {
        Hypercall::ALL
            .into_iter()
            .filter(|c| self.slots[c.nr() as usize].is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_owner() {
        let mut table = HypercallTable::new();
        table.register(Hypercall::BlkRead, 2).unwrap();
        assert_eq!(table.lookup(5), Ok((Hypercall::BlkRead, 2)));
    }

    #[test]
    fn double_registration_fails() {
        let mut table = HypercallTable::new();
        table.register(Hypercall::Puts, 0).unwrap();
        assert_eq!(
            table.register(Hypercall::Puts, 1),
            Err(DispatchError::AlreadyRegistered { call: "puts", owner: 0 })
        );
        assert_eq!(table.lookup(1), Ok((Hypercall::Puts, 0)));
    }

    #[test]
    fn unregistered_and_out_of_range_are_invalid() {
        let mut table = HypercallTable::new();
        table.register(Hypercall::Puts, 0).unwrap();
        assert_eq!(table.lookup(4), Err(DispatchError::InvalidHypercall { nr: 4 }));
        assert_eq!(table.lookup(0), Err(DispatchError::InvalidHypercall { nr: 0 }));
        assert_eq!(table.lookup(11), Err(DispatchError::InvalidHypercall { nr: 11 }));
        assert_eq!(
            table.lookup(u32::MAX),
            Err(DispatchError::InvalidHypercall { nr: u32::MAX })
        );
    }

    #[test]
    fn registered_lists_in_number_order() {
        let mut table = HypercallTable::new();
        table.register(Hypercall::Halt, 0).unwrap();
        table.register(Hypercall::Puts, 0).unwrap();
        let calls: Vec<_> = table.registered().collect();
        assert_eq!(calls, vec![Hypercall::Puts, Hypercall::Halt]);
    }
}
