//! Forward-branch labels and the relocation queue.
//!
//! Branch targets are usually unknown when the branch is encoded, so the
//! encoder writes a placeholder displacement and queues a relocation.
//! Binding the label drains the queue and the backend patches each site.

/// Handle to a label in a [`LabelTable`]. Carries the table generation
/// so a handle from a recycled translation context is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelId {
    pub(crate) index: u16,
    pub(crate) generation: u32,
}

/// Relocation kinds the code generator can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit displacement relative to the end of the field.
    Rel32,
}

/// A pending patch site in the code buffer.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    /// Byte offset of the displacement field in the code buffer.
    pub offset: usize,
    pub kind: RelocKind,
    /// Extra displacement added to the resolved target.
    pub addend: i64,
}

#[derive(Debug, Default)]
struct Label {
    resolved: Option<usize>,
    uses: u32,
    relocs: Vec<Relocation>,
}

/// Per-translation label storage.
#[derive(Debug, Default)]
pub struct LabelTable {
    labels: Vec<Label>,
    generation: u32,
    unresolved: usize,
}

impl LabelTable {
    pub fn new() -> Self {
        LabelTable::default()
    }

    pub fn new_label(&mut self) -> LabelId {
        let index = self.labels.len();
        assert!(index <= u16::MAX as usize, "label table overflow");
        self.labels.push(Label::default());
        self.unresolved += 1;
        LabelId {
            index: index as u16,
            generation: self.generation,
        }
    }

    fn label(&self, id: LabelId) -> &Label {
        assert_eq!(id.generation, self.generation, "stale label handle");
        &self.labels[id.index as usize]
    }

    fn label_mut(&mut self, id: LabelId) -> &mut Label {
        assert_eq!(id.generation, self.generation, "stale label handle");
        &mut self.labels[id.index as usize]
    }

    /// Count a branch referencing the label. A label that is bound but
    /// never used indicates dead control flow upstream.
    pub fn record_use(&mut self, id: LabelId) {
        self.label_mut(id).uses += 1;
    }

    pub fn use_count(&self, id: LabelId) -> u32 {
        self.label(id).uses
    }

    /// Queue a patch site against an unresolved label.
    pub fn add_reloc(&mut self, id: LabelId, reloc: Relocation) {
        let label = self.label_mut(id);
        assert!(
            label.resolved.is_none(),
            "relocation against already-bound label"
        );
        label.relocs.push(reloc);
    }

    /// Bind the label to a code-buffer offset, returning the queued
    /// relocations for the caller to patch. Binding twice is a bug in
    /// the frontend.
    pub fn resolve(&mut self, id: LabelId, offset: usize) -> Vec<Relocation> {
        let label = self.label_mut(id);
        assert!(label.resolved.is_none(), "label bound twice");
        label.resolved = Some(offset);
        let relocs = core::mem::take(&mut label.relocs);
        self.unresolved -= 1;
        relocs
    }

    /// Code-buffer offset of a bound label.
    pub fn address(&self, id: LabelId) -> Option<usize> {
        self.label(id).resolved
    }

    /// True once every allocated label has been bound.
    pub fn all_resolved(&self) -> bool {
        self.unresolved == 0
    }

    /// Recycle the table for the next translation. Outstanding handles
    /// become stale.
    pub fn reset(&mut self) {
        self.labels.clear();
        self.unresolved = 0;
        self.generation = self.generation.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(offset: usize) -> Relocation {
        Relocation {
            offset,
            kind: RelocKind::Rel32,
            addend: 0,
        }
    }

    #[test]
    fn resolve_drains_relocs() {
        let mut t = LabelTable::new();
        let l = t.new_label();
        t.record_use(l);
        t.add_reloc(l, rel(4));
        t.add_reloc(l, rel(12));
        assert!(!t.all_resolved());

        let relocs = t.resolve(l, 0x40);
        assert_eq!(relocs.len(), 2);
        assert_eq!(t.address(l), Some(0x40));
        assert!(t.all_resolved());
    }

    #[test]
    #[should_panic(expected = "label bound twice")]
    fn double_resolve_panics() {
        let mut t = LabelTable::new();
        let l = t.new_label();
        t.resolve(l, 0);
        t.resolve(l, 8);
    }

    #[test]
    #[should_panic(expected = "relocation against already-bound label")]
    fn reloc_after_bind_panics() {
        let mut t = LabelTable::new();
        let l = t.new_label();
        t.resolve(l, 0);
        t.add_reloc(l, rel(4));
    }

    #[test]
    #[should_panic(expected = "stale label handle")]
    fn stale_handle_panics() {
        let mut t = LabelTable::new();
        let l = t.new_label();
        t.reset();
        t.record_use(l);
    }
}
