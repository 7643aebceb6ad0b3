//! Breakpoint table mapping guest addresses to handlers

use anyhow::Result;

use crate::addrs::{GvaMap, GvaSet, VirtAddr};
use crate::backend::Backend;
use crate::Execution;

use std::rc::Rc;

/// Callback invoked when execution reaches a breakpoint address. The handler gets
/// the backend and the address that triggered it, and decides whether the run
/// continues.
pub type BreakpointHandler<C> = Rc<dyn Fn(&mut Backend<C>, VirtAddr) -> Result<Execution>>;

/// Handlers keyed by virtual address
#[derive(Debug)]
pub struct Breakpoints<H> {
    /// Registered handlers
    handlers: GvaMap<H>,

    /// Addresses used internally by the harness that can not hold a breakpoint
    reserved: GvaSet,
}

impl<H> Default for Breakpoints<H> {
    fn default() -> Self {
        Self {
            handlers: GvaMap::default(),
            reserved: GvaSet::default(),
        }
    }
}

impl<H: Clone> Breakpoints<H> {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` at `virt_addr`, replacing any previous handler. Returns
    /// `false` without modifying the table if `virt_addr` is reserved.
    pub fn set(&mut self, virt_addr: VirtAddr, handler: H) -> bool {
        if self.reserved.contains(&virt_addr) {
            log::warn!("Breakpoint at reserved address {virt_addr:x?} refused");
            return false;
        }

        if self.handlers.insert(virt_addr, handler).is_some() {
            log::debug!("Replaced breakpoint at {virt_addr:x?}");
        }

        true
    }

    /// Get the handler at `virt_addr`
    #[must_use]
    pub fn get(&self, virt_addr: VirtAddr) -> Option<H> {
        self.handlers.get(&virt_addr).cloned()
    }

    /// Remove the handler at `virt_addr`, returning it
    pub fn remove(&mut self, virt_addr: VirtAddr) -> Option<H> {
        self.handlers.remove(&virt_addr)
    }

    /// Mark `virt_addr` as unavailable for breakpoints, removing the handler
    /// already registered there
    pub fn reserve(&mut self, virt_addr: VirtAddr) -> Option<H> {
        self.reserved.insert(virt_addr);

        let previous = self.handlers.remove(&virt_addr);
        if previous.is_some() {
            log::warn!("Reserved {virt_addr:x?} dropped its breakpoint");
        }

        previous
    }

    /// Returns `true` if a handler is registered at `virt_addr`
    #[must_use]
    pub fn contains(&self, virt_addr: VirtAddr) -> bool {
        self.handlers.contains_key(&virt_addr)
    }

    /// Number of registered handlers
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
