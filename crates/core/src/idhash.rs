//! Identity-Based Hash Values
//!
//! Objects move (once, from nursery to old generation), so identity hashes
//! cannot be derived from addresses. Two tables map block address to a
//! monotonically assigned integer: one for nursery objects, one for the
//! old generation. After a young collection the survivors' entries are
//! rehomed into the old table under their new addresses; at sweep, entries
//! for unmarked old blocks are dropped.
//!
//! Both tables live outside the GC heap, so requesting a hash never moves
//! the object being hashed.

use std::collections::HashMap;

pub(crate) struct IdHashTables {
    pub(crate) new_gen: HashMap<usize, usize>,
    pub(crate) old_gen: HashMap<usize, usize>,
    counter: usize,
}

impl IdHashTables {
    pub(crate) fn new() -> IdHashTables {
        IdHashTables {
            new_gen: HashMap::new(),
            old_gen: HashMap::new(),
            // 0 is reserved so a hash value is never falsy.
            counter: 1,
        }
    }

    /// Get or assign the hash for the block at `addr`.
    pub(crate) fn hash_for(&mut self, addr: usize, young: bool) -> usize {
        let table = if young {
            &mut self.new_gen
        } else {
            &mut self.old_gen
        };
        if let Some(&h) = table.get(&addr) {
            return h;
        }
        let h = self.counter;
        self.counter += 1;
        table.insert(addr, h);
        h
    }

    /// Rehome nursery entries after a young collection. `relocate` returns
    /// the object's new address, or None when it did not survive.
    pub(crate) fn migrate_young(&mut self, mut relocate: impl FnMut(usize) -> Option<usize>) {
        let entries: Vec<(usize, usize)> = self.new_gen.drain().collect();
        for (addr, h) in entries {
            if let Some(new_addr) = relocate(addr) {
                self.old_gen.insert(new_addr, h);
            }
        }
    }

    /// Drop entries whose object did not survive a full collection.
    pub(crate) fn purge(
        &mut self,
        mut young_marked: impl FnMut(usize) -> bool,
        mut old_marked: impl FnMut(usize) -> bool,
    ) {
        self.new_gen.retain(|&addr, _| young_marked(addr));
        self.old_gen.retain(|&addr, _| old_marked(addr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_stable_and_monotone() {
        let mut t = IdHashTables::new();
        let a = t.hash_for(0x1000, true);
        let b = t.hash_for(0x2000, true);
        assert_ne!(a, b);
        assert!(a >= 1);
        // Stable on repeat queries.
        assert_eq!(t.hash_for(0x1000, true), a);
        assert_eq!(t.hash_for(0x2000, true), b);
    }

    #[test]
    fn test_migrate_preserves_hash() {
        let mut t = IdHashTables::new();
        let a = t.hash_for(0x1000, true);
        let dead = t.hash_for(0x3000, true);

        t.migrate_young(|addr| if addr == 0x1000 { Some(0x9000) } else { None });

        assert!(t.new_gen.is_empty());
        // Same hash at the new address.
        assert_eq!(t.hash_for(0x9000, false), a);
        // The dead entry is gone; its hash value is not reused for the
        // same address.
        let again = t.hash_for(0x3000, true);
        assert_ne!(again, dead);
    }

    #[test]
    fn test_purge() {
        let mut t = IdHashTables::new();
        t.hash_for(0x10, false);
        let keep = t.hash_for(0x20, false);
        t.purge(|_| false, |addr| addr == 0x20);
        assert_eq!(t.old_gen.len(), 1);
        assert_eq!(t.hash_for(0x20, false), keep);
    }
}
