//! Registry of completed translations, keyed by guest entry PC and
//! translation flags.
//!
//! The registry is a lookup structure only; it does not own the code
//! buffer. Invalidation removes entries whose guest range intersects a
//! written region so the next execution retranslates. Single-threaded,
//! matching the one-compiler-at-a-time translation model; embedders
//! wanting concurrent lookup wrap it in their own lock.

use core::ops::Range;
use std::collections::BTreeMap;

use hashbrown::HashMap;

/// Descriptor of one completed translation unit.
#[derive(Debug, Clone)]
pub struct TranslatedBlock {
    /// Guest PC range covered by the unit.
    pub pc_range: Range<u64>,
    /// Translation-affecting machine-state flags (mode bits and the
    /// like); units with different flags never match each other.
    pub flags: u32,
    /// Entry offset of the generated code in its code buffer.
    pub entry_offset: usize,
    /// Length of the generated code in bytes.
    pub code_len: usize,
    /// Guest-PC to host-code-offset map, one entry per guest
    /// instruction, for fault attribution.
    pub insn_map: Vec<(u64, u32)>,
}

#[derive(Debug, Default)]
pub struct BlockRegistry {
    blocks: HashMap<(u64, u32), TranslatedBlock>,
    /// Ordered by guest start PC for range invalidation; maps
    /// (start, flags) to the unit's end PC.
    by_start: BTreeMap<(u64, u32), u64>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        BlockRegistry::default()
    }

    /// Record a completed translation. Registering a second unit for a
    /// live (pc, flags) key is a translator bug.
    pub fn register(&mut self, block: TranslatedBlock) {
        let key = (block.pc_range.start, block.flags);
        self.by_start.insert(key, block.pc_range.end);
        let prev = self.blocks.insert(key, block);
        assert!(prev.is_none(), "duplicate translation for live block");
    }

    pub fn lookup(&self, pc: u64, flags: u32) -> Option<&TranslatedBlock> {
        self.blocks.get(&(pc, flags))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Drop every unit whose guest range intersects the written range.
    /// Walks the start-ordered index so only units starting before the
    /// range end are inspected.
    pub fn invalidate_range(&mut self, range: Range<u64>) {
        let doomed: Vec<(u64, u32)> = self
            .by_start
            .range(..(range.end, 0))
            .filter(|(_, &end)| end > range.start)
            .map(|(&key, _)| key)
            .collect();
        for key in doomed {
            self.by_start.remove(&key);
            self.blocks.remove(&key);
        }
    }

    /// Drop everything, typically because the code buffer was flushed.
    pub fn invalidate_all(&mut self) {
        self.blocks.clear();
        self.by_start.clear();
    }

    /// Host code offset for a guest PC inside a unit, used to attribute
    /// a fault in generated code back to the guest instruction.
    pub fn host_offset_for_pc(&self, block: &TranslatedBlock, pc: u64) -> Option<u32> {
        block
            .insn_map
            .iter()
            .find(|(guest_pc, _)| *guest_pc == pc)
            .map(|&(_, off)| off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(start: u64, end: u64, flags: u32) -> TranslatedBlock {
        TranslatedBlock {
            pc_range: start..end,
            flags,
            entry_offset: 0,
            code_len: 16,
            insn_map: vec![(start, 0)],
        }
    }

    #[test]
    fn lookup_respects_flags() {
        let mut reg = BlockRegistry::new();
        reg.register(block(0x1000, 0x1010, 0));
        reg.register(block(0x1000, 0x1010, 1));
        assert_eq!(reg.len(), 2);
        assert!(reg.lookup(0x1000, 0).is_some());
        assert!(reg.lookup(0x1000, 2).is_none());
    }

    #[test]
    fn invalidate_range_drops_overlaps_only() {
        let mut reg = BlockRegistry::new();
        reg.register(block(0x1000, 0x1010, 0));
        reg.register(block(0x1010, 0x1020, 0));
        reg.register(block(0x2000, 0x2008, 0));

        reg.invalidate_range(0x100c..0x1014);
        assert!(reg.lookup(0x1000, 0).is_none());
        assert!(reg.lookup(0x1010, 0).is_none());
        assert!(reg.lookup(0x2000, 0).is_some());
    }

    #[test]
    #[should_panic(expected = "duplicate translation for live block")]
    fn duplicate_registration_panics() {
        let mut reg = BlockRegistry::new();
        reg.register(block(0x1000, 0x1010, 0));
        reg.register(block(0x1000, 0x1010, 0));
    }

    #[test]
    fn retranslation_after_invalidate() {
        let mut reg = BlockRegistry::new();
        reg.register(block(0x1000, 0x1010, 0));
        reg.invalidate_all();
        assert!(reg.is_empty());
        reg.register(block(0x1000, 0x1010, 0));
        assert_eq!(reg.len(), 1);
    }
}
