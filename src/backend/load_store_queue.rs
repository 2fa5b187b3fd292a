use crate::uop::RobIndex;

//
// The load/store queue: one circular buffer holding both loads and stores in
// program order, partitioned only by the store bit. Addresses are tracked at
// 8-byte block granularity (physaddr is the block id); the bytemask selects
// which bytes of the block a store produces.
//

#[derive(Clone, Copy)]
pub struct LsqEntry {
    pub rob: RobIndex,
    pub seq: u64,
    pub store: bool,
    pub entry_valid: bool,
    pub addrvalid: bool,
    pub datavalid: bool,
    pub invalid: bool,
    pub bytemask: u8,
    pub physaddr: u64,
    pub data: u64,
}

impl LsqEntry {
    fn new() -> LsqEntry {
        LsqEntry {
            rob: 0,
            seq: 0,
            store: false,
            entry_valid: false,
            addrvalid: false,
            datavalid: false,
            invalid: false,
            bytemask: 0,
            physaddr: 0,
            data: 0,
        }
    }

    fn reset(&mut self) {
        *self = LsqEntry::new();
    }
}

pub struct Lsq {
    pub entries: Vec<LsqEntry>,
    pub capacity: usize,
    pub head: u64,
    pub tail: u64,
    pub loads_in_flight: usize,
    pub stores_in_flight: usize,
}

impl Lsq {
    pub fn new(capacity: usize) -> Lsq {
        Lsq {
            entries: (0..capacity).map(|_| LsqEntry::new()).collect(),
            capacity,
            head: 0,
            tail: 0,
            loads_in_flight: 0,
            stores_in_flight: 0,
        }
    }

    pub fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub fn size(&self) -> usize {
        (self.tail - self.head) as usize
    }

    pub fn remaining(&self) -> bool {
        self.size() < self.capacity
    }

    pub fn alloc(&mut self, rob: RobIndex, store: bool) -> usize {
        debug_assert!(self.remaining(), "lsq alloc with no space");
        let index = self.to_index(self.tail);
        let seq = self.tail;
        self.tail += 1;
        let entry = &mut self.entries[index];
        entry.reset();
        entry.rob = rob;
        entry.seq = seq;
        entry.store = store;
        entry.entry_valid = true;
        if store {
            self.stores_in_flight += 1;
        } else {
            self.loads_in_flight += 1;
        }
        index
    }

    /// Retire the head entry.
    pub fn commit(&mut self, index: usize) {
        debug_assert!(self.size() > 0);
        debug_assert!(index == self.to_index(self.head), "lsq commit out of order");
        self.release(index);
        self.head += 1;
    }

    /// Remove an annulled entry; annulment proceeds youngest first, so the
    /// entry must be at the tail.
    pub fn annul(&mut self, index: usize) {
        debug_assert!(self.size() > 0);
        debug_assert!(index == self.to_index(self.tail - 1), "lsq annul out of order");
        self.release(index);
        self.tail -= 1;
    }

    fn release(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        debug_assert!(entry.entry_valid);
        if entry.store {
            self.stores_in_flight -= 1;
        } else {
            self.loads_in_flight -= 1;
        }
        entry.reset();
    }

    /// Sequence numbers of occupied entries strictly older than `seq`, from
    /// youngest to oldest.
    pub fn backward_before(&self, seq: u64) -> impl Iterator<Item = usize> + '_ {
        (self.head..seq.min(self.tail))
            .rev()
            .map(move |s| self.to_index(s))
    }

    /// Sequence numbers of occupied entries strictly younger than `seq`, in
    /// program order.
    pub fn forward_after(&self, seq: u64) -> impl Iterator<Item = usize> + '_ {
        ((seq + 1).max(self.head)..self.tail).map(move |s| self.to_index(s))
    }

    pub fn forward_indices(&self) -> Vec<usize> {
        (self.head..self.tail).map(|s| self.to_index(s)).collect()
    }

    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.reset();
        }
        self.head = 0;
        self.tail = 0;
        self.loads_in_flight = 0;
        self.stores_in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_counts() {
        let mut lsq = Lsq::new(8);
        let a = lsq.alloc(1, false);
        let b = lsq.alloc(2, true);
        assert_eq!(lsq.loads_in_flight, 1);
        assert_eq!(lsq.stores_in_flight, 1);
        lsq.annul(b);
        assert_eq!(lsq.stores_in_flight, 0);
        lsq.commit(a);
        assert_eq!(lsq.loads_in_flight, 0);
        assert_eq!(lsq.size(), 0);
    }

    #[test]
    fn test_scan_ordering() {
        let mut lsq = Lsq::new(8);
        let i0 = lsq.alloc(0, true);
        let i1 = lsq.alloc(1, false);
        let i2 = lsq.alloc(2, true);
        let seq1 = lsq.entries[i1].seq;
        let older: Vec<usize> = lsq.backward_before(seq1).collect();
        assert_eq!(older, vec![i0]);
        let younger: Vec<usize> = lsq.forward_after(seq1).collect();
        assert_eq!(younger, vec![i2]);
    }

    #[test]
    fn test_wraparound_scans() {
        let mut lsq = Lsq::new(4);
        // fill and drain to push head/tail past the capacity boundary
        for r in 0..3 {
            let i = lsq.alloc(r, false);
            lsq.commit(i);
        }
        let a = lsq.alloc(10, true);
        let b = lsq.alloc(11, false);
        let seq_b = lsq.entries[b].seq;
        let older: Vec<usize> = lsq.backward_before(seq_b).collect();
        assert_eq!(older, vec![a]);
    }
}
