//! The op stream: an intrusive doubly linked list over a pooled node
//! array.
//!
//! Passes remove and insert ops mid-stream without shifting, and node
//! indices stay stable across edits. Removed nodes go on a free list and
//! are reused by later insertions. References are generation-tagged so
//! handles cannot outlive a [`reset`](OpStream::reset).

use super::op::Op;

/// Hard cap on live ops in one translation unit. The frontend is
/// expected to split overly long guest blocks before hitting this.
pub const MAX_OPS: usize = 512;

const NONE: u16 = u16::MAX;

/// Stable reference to an op in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpRef {
    pub(crate) index: u16,
    pub(crate) generation: u32,
}

#[derive(Debug)]
struct Node {
    op: Op,
    prev: u16,
    next: u16,
    /// Per-op liveness scratch: bit i set means input i dies here.
    life: u16,
    in_use: bool,
}

#[derive(Debug, Default)]
pub struct OpStream {
    nodes: Vec<Node>,
    head: u16,
    tail: u16,
    free: Vec<u16>,
    len: usize,
    generation: u32,
}

impl OpStream {
    pub fn new() -> Self {
        OpStream {
            nodes: Vec::new(),
            head: NONE,
            tail: NONE,
            free: Vec::new(),
            len: 0,
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots left before the op budget is exhausted.
    pub fn remaining(&self) -> usize {
        MAX_OPS - self.len
    }

    /// Front ends check this to end a guest block early instead of
    /// tripping the overflow assertion.
    pub fn is_full(&self) -> bool {
        self.len >= MAX_OPS
    }

    fn alloc_node(&mut self, op: Op) -> u16 {
        assert!(self.len < MAX_OPS, "op stream overflow");
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let node = &mut self.nodes[index as usize];
            node.op = op;
            node.prev = NONE;
            node.next = NONE;
            node.life = 0;
            node.in_use = true;
            index
        } else {
            let index = self.nodes.len() as u16;
            self.nodes.push(Node {
                op,
                prev: NONE,
                next: NONE,
                life: 0,
                in_use: true,
            });
            index
        }
    }

    fn make_ref(&self, index: u16) -> OpRef {
        OpRef {
            index,
            generation: self.generation,
        }
    }

    fn check(&self, r: OpRef) -> u16 {
        assert_eq!(r.generation, self.generation, "stale op reference");
        assert!(self.nodes[r.index as usize].in_use, "reference to removed op");
        r.index
    }

    /// Append an op at the end of the stream.
    pub fn emit(&mut self, op: Op) -> OpRef {
        let index = self.alloc_node(op);
        let node = &mut self.nodes[index as usize];
        node.prev = self.tail;
        if self.tail != NONE {
            self.nodes[self.tail as usize].next = index;
        } else {
            self.head = index;
        }
        self.tail = index;
        self.make_ref(index)
    }

    /// Insert an op immediately before an existing one.
    pub fn insert_before(&mut self, at: OpRef, op: Op) -> OpRef {
        let at = self.check(at);
        let index = self.alloc_node(op);
        let prev = self.nodes[at as usize].prev;
        self.nodes[index as usize].prev = prev;
        self.nodes[index as usize].next = at;
        self.nodes[at as usize].prev = index;
        if prev != NONE {
            self.nodes[prev as usize].next = index;
        } else {
            self.head = index;
        }
        self.make_ref(index)
    }

    /// Insert an op immediately after an existing one.
    pub fn insert_after(&mut self, at: OpRef, op: Op) -> OpRef {
        let at = self.check(at);
        let index = self.alloc_node(op);
        let next = self.nodes[at as usize].next;
        self.nodes[index as usize].next = next;
        self.nodes[index as usize].prev = at;
        self.nodes[at as usize].next = index;
        if next != NONE {
            self.nodes[next as usize].prev = index;
        } else {
            self.tail = index;
        }
        self.make_ref(index)
    }

    /// Unlink an op and recycle its node.
    pub fn remove(&mut self, r: OpRef) {
        let index = self.check(r);
        let (prev, next) = {
            let node = &self.nodes[index as usize];
            (node.prev, node.next)
        };
        if prev != NONE {
            self.nodes[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NONE {
            self.nodes[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
        let node = &mut self.nodes[index as usize];
        node.in_use = false;
        node.op = Op::Nop;
        self.free.push(index);
        self.len -= 1;
    }

    pub fn first(&self) -> Option<OpRef> {
        (self.head != NONE).then(|| self.make_ref(self.head))
    }

    pub fn last(&self) -> Option<OpRef> {
        (self.tail != NONE).then(|| self.make_ref(self.tail))
    }

    pub fn next(&self, r: OpRef) -> Option<OpRef> {
        let index = self.check(r);
        let next = self.nodes[index as usize].next;
        (next != NONE).then(|| self.make_ref(next))
    }

    pub fn prev(&self, r: OpRef) -> Option<OpRef> {
        let index = self.check(r);
        let prev = self.nodes[index as usize].prev;
        (prev != NONE).then(|| self.make_ref(prev))
    }

    pub fn get(&self, r: OpRef) -> &Op {
        let index = self.check(r);
        &self.nodes[index as usize].op
    }

    pub fn get_mut(&mut self, r: OpRef) -> &mut Op {
        let index = self.check(r);
        &mut self.nodes[index as usize].op
    }

    pub fn life(&self, r: OpRef) -> u16 {
        let index = self.check(r);
        self.nodes[index as usize].life
    }

    pub fn set_life(&mut self, r: OpRef, life: u16) {
        let index = self.check(r);
        self.nodes[index as usize].life = life;
    }

    /// Clear the stream for the next translation, invalidating all
    /// outstanding references.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = NONE;
        self.tail = NONE;
        self.len = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Snapshot the ops in stream order. Test and debug helper.
    pub fn collect_ops(&self) -> Vec<Op> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.first();
        while let Some(r) = cur {
            out.push(self.get(r).clone());
            cur = self.next(r);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_and_iterate() {
        let mut s = OpStream::new();
        s.emit(Op::Nop);
        s.emit(Op::InsnStart { pc: 0x1000 });
        s.emit(Op::ExitBlock { ret: 0 });
        assert_eq!(s.len(), 3);

        let ops = s.collect_ops();
        assert_eq!(ops[1], Op::InsnStart { pc: 0x1000 });
        assert_eq!(ops[2], Op::ExitBlock { ret: 0 });
    }

    #[test]
    fn insert_and_remove_keep_links() {
        let mut s = OpStream::new();
        let a = s.emit(Op::InsnStart { pc: 1 });
        let c = s.emit(Op::InsnStart { pc: 3 });
        let b = s.insert_after(a, Op::InsnStart { pc: 2 });
        s.insert_before(a, Op::InsnStart { pc: 0 });

        let pcs: Vec<u64> = s
            .collect_ops()
            .iter()
            .map(|op| match op {
                Op::InsnStart { pc } => *pc,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(pcs, vec![0, 1, 2, 3]);

        s.remove(b);
        s.remove(c);
        assert_eq!(s.len(), 2);
        // Freed slots get reused before the pool grows.
        let d = s.emit(Op::InsnStart { pc: 9 });
        assert!(d.index == b.index || d.index == c.index);
        assert_eq!(s.last().map(|r| s.get(r).clone()), Some(Op::InsnStart { pc: 9 }));
    }

    #[test]
    #[should_panic(expected = "reference to removed op")]
    fn removed_ref_panics() {
        let mut s = OpStream::new();
        let a = s.emit(Op::Nop);
        s.remove(a);
        s.get(a);
    }

    #[test]
    #[should_panic(expected = "stale op reference")]
    fn stale_ref_panics() {
        let mut s = OpStream::new();
        let a = s.emit(Op::Nop);
        s.reset();
        s.get(a);
    }

    #[test]
    #[should_panic(expected = "op stream overflow")]
    fn overflow_panics() {
        let mut s = OpStream::new();
        for _ in 0..=MAX_OPS {
            s.emit(Op::Nop);
        }
    }

    #[test]
    fn life_bits_round_trip() {
        let mut s = OpStream::new();
        let a = s.emit(Op::Nop);
        s.set_life(a, 0b101);
        assert_eq!(s.life(a), 0b101);
    }
}
