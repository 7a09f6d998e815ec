//! Scratch group allocation for filter lowering
//!
//! Boolean combinators borrow a temporary group while they are being lowered
//! and hand it back before returning. Released groups are reused LIFO, so
//! the number of distinct groups grows with nesting depth, not with the
//! number of filters.

/// Stack-based pool of scratch group ids
#[derive(Debug, Clone)]
pub struct GroupSupplier {
    next: u32,
    released: Vec<u32>,
    outstanding: usize,
    high_water: u32,
}

impl GroupSupplier {
    /// Fresh ids start at `first`
    pub fn new(first: u32) -> Self {
        Self {
            next: first,
            released: Vec::new(),
            outstanding: 0,
            high_water: first.saturating_sub(1),
        }
    }

    pub fn acquire(&mut self) -> u32 {
        self.outstanding += 1;
        match self.released.pop() {
            Some(group) => group,
            None => {
                let group = self.next;
                self.next += 1;
                self.high_water = self.high_water.max(group);
                group
            }
        }
    }

    pub fn release(&mut self, group: u32) {
        debug_assert!(self.outstanding > 0, "release without acquire");
        debug_assert!(!self.released.contains(&group), "group {} released twice", group);
        self.outstanding = self.outstanding.saturating_sub(1);
        self.released.push(group);
    }

    /// Groups currently borrowed
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Largest group id ever handed out
    pub fn high_water(&self) -> u32 {
        self.high_water
    }
}
