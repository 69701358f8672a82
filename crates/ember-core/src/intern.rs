//! String interning (spec §3: "string (heap object, interned)").
//!
//! Interning is weak with respect to the GC: the table is *not* a root, so an
//! interned string with no other reference dies on the next collection like
//! any other string. [`Interner::sweep`] then drops its now-stale entry so
//! the table never grows without bound and never hands out a dead `ObjRef`.

use ahash::AHashMap;

use crate::heap::{Heap, ObjRef};

#[derive(Default)]
pub struct Interner {
    table: AHashMap<Vec<u8>, ObjRef>,
}

impl Interner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical `ObjRef` for `bytes`, allocating it in `heap`
    /// only on the first request.
    pub fn intern(&mut self, heap: &mut Heap, bytes: &[u8]) -> ObjRef {
        if let Some(existing) = self.table.get(bytes) {
            if heap.is_alive(*existing) {
                return *existing;
            }
        }
        let r = heap.alloc_string(bytes.to_vec());
        self.table.insert(bytes.to_vec(), r);
        r
    }

    /// Drops entries whose object a GC cycle just collected. Call this right
    /// after `Heap::collect_garbage`.
    pub fn sweep(&mut self, heap: &Heap) {
        self.table.retain(|_, r| heap.is_alive(*r));
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedupes_identical_content() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        let a = interner.intern(&mut heap, b"hello");
        let b = interner.intern(&mut heap, b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn sweep_drops_collected_entries() {
        let mut heap = Heap::new();
        let mut interner = Interner::new();
        interner.intern(&mut heap, b"transient");
        heap.collect_garbage(std::iter::empty());
        interner.sweep(&heap);
        assert!(interner.is_empty());
    }
}
