use crate::uop::{RobIndex, MAX_OPERANDS};

//
// Issue queue with associative tag broadcast.
//
// Slot states, by (valid, issued):   free 00, dispatched 10, issued 11,
// complete 01. A slot is allready when it is valid, not issued and has no
// surviving wait tag on any operand position. Broadcast of a completing
// uop's id is the only dependency-wake mechanism.
//
// Slots are kept compact in [0, count); removing one collapses the arrays.
// That is an O(size) scan but removal is rare next to broadcasts.
//

/// Delete bit `slot` from a mask, shifting the higher bits down.
fn collapse_bit(mask: u64, slot: usize) -> u64 {
    let low = mask & ((1u64 << slot) - 1);
    let high = (mask >> 1) & !((1u64 << slot) - 1);
    low | high
}

pub struct IssueQueue {
    size: usize,
    count: usize,
    uopids: Vec<RobIndex>,
    tags: [Vec<RobIndex>; MAX_OPERANDS],
    tag_valid: [u64; MAX_OPERANDS],
    valid: u64,
    issued: u64,
    allready: u64,
}

impl IssueQueue {
    pub fn new(size: usize) -> IssueQueue {
        assert!(size <= 64);
        IssueQueue {
            size,
            count: 0,
            uopids: vec![0; size],
            tags: [vec![0; size], vec![0; size], vec![0; size], vec![0; size]],
            tag_valid: [0; MAX_OPERANDS],
            valid: 0,
            issued: 0,
            allready: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn remaining(&self) -> usize {
        self.size - self.count
    }

    pub fn full(&self) -> bool {
        self.count == self.size
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.valid = 0;
        self.issued = 0;
        self.allready = 0;
        self.tag_valid = [0; MAX_OPERANDS];
    }

    /// Recompute readiness at the top of each cycle; broadcasts from the
    /// transfer stage become visible here.
    pub fn clock(&mut self) {
        self.allready = self.valid & !self.issued;
        for operand in 0..MAX_OPERANDS {
            self.allready &= !self.tag_valid[operand];
        }
    }

    fn arm_slot(&mut self, slot: usize, operands: &[RobIndex; MAX_OPERANDS], preready: &[bool; MAX_OPERANDS]) {
        for operand in 0..MAX_OPERANDS {
            if preready[operand] {
                self.tag_valid[operand] &= !(1 << slot);
            } else {
                self.tags[operand][slot] = operands[operand];
                self.tag_valid[operand] |= 1 << slot;
            }
        }
    }

    pub fn insert(
        &mut self,
        uopid: RobIndex,
        operands: &[RobIndex; MAX_OPERANDS],
        preready: &[bool; MAX_OPERANDS],
    ) -> bool {
        if self.full() {
            return false;
        }
        debug_assert!(self.slotof(uopid).is_none(), "uop {} already in queue", uopid);
        let slot = self.count;
        self.count += 1;
        debug_assert!(self.valid & (1 << slot) == 0);
        self.uopids[slot] = uopid;
        self.valid |= 1 << slot;
        self.issued &= !(1 << slot);
        self.arm_slot(slot, operands, preready);
        true
    }

    /// Invalidate every tag slot waiting on `uopid`, across all operand
    /// positions.
    pub fn broadcast(&mut self, uopid: RobIndex) {
        for operand in 0..MAX_OPERANDS {
            let mut pending = self.tag_valid[operand];
            while pending != 0 {
                let slot = pending.trailing_zeros() as usize;
                pending &= pending - 1;
                if self.tags[operand][slot] == uopid {
                    self.tag_valid[operand] &= !(1 << slot);
                }
            }
        }
    }

    /// Select the lowest allready slot and mark it issued.
    pub fn issue(&mut self) -> Option<usize> {
        if self.allready == 0 {
            return None;
        }
        let slot = self.allready.trailing_zeros() as usize;
        self.issued |= 1 << slot;
        self.allready &= !(1 << slot);
        Some(slot)
    }

    /// Revert an issued slot to the dispatched state, re-arming its operand
    /// dependencies.
    pub fn replay(
        &mut self,
        slot: usize,
        operands: &[RobIndex; MAX_OPERANDS],
        preready: &[bool; MAX_OPERANDS],
    ) {
        debug_assert!(self.valid & (1 << slot) != 0);
        debug_assert!(self.issued & (1 << slot) != 0);
        self.issued &= !(1 << slot);
        self.arm_slot(slot, operands, preready);
    }

    /// Revert an issued slot without touching its dependencies.
    pub fn replay_slot(&mut self, slot: usize) {
        debug_assert!(self.issued & (1 << slot) != 0);
        self.issued &= !(1 << slot);
    }

    pub fn uopof(&self, slot: usize) -> RobIndex {
        self.uopids[slot]
    }

    pub fn slotof(&self, uopid: RobIndex) -> Option<usize> {
        (0..self.count).find(|&slot| self.valid & (1 << slot) != 0 && self.uopids[slot] == uopid)
    }

    /// Remove a slot after completion; not revocable.
    pub fn release(&mut self, slot: usize) {
        self.remove(slot);
    }

    pub fn annul(&mut self, slot: usize) {
        self.remove(slot);
    }

    pub fn annuluop(&mut self, uopid: RobIndex) -> bool {
        match self.slotof(uopid) {
            Some(slot) => {
                self.remove(slot);
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, slot: usize) {
        debug_assert!(slot < self.count);
        for i in slot..self.count - 1 {
            self.uopids[i] = self.uopids[i + 1];
            for operand in 0..MAX_OPERANDS {
                self.tags[operand][i] = self.tags[operand][i + 1];
            }
        }
        for operand in 0..MAX_OPERANDS {
            self.tag_valid[operand] = collapse_bit(self.tag_valid[operand], slot);
        }
        self.valid = collapse_bit(self.valid, slot);
        self.issued = collapse_bit(self.issued, slot);
        self.allready = collapse_bit(self.allready, slot);
        self.count -= 1;
    }

    pub fn dump_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("count = {}:", self.count)];
        for slot in 0..self.count {
            let mut line = format!(
                "  slot {:2}: rob {:3} {}{}{}",
                slot,
                self.uopids[slot],
                if self.valid & (1 << slot) != 0 { 'V' } else { '-' },
                if self.issued & (1 << slot) != 0 { 'I' } else { '-' },
                if self.allready & (1 << slot) != 0 { 'R' } else { '-' },
            );
            for operand in 0..MAX_OPERANDS {
                if self.tag_valid[operand] & (1 << slot) != 0 {
                    line.push_str(&format!(" wait[{}]=rob {}", operand, self.tags[operand][slot]));
                }
            }
            lines.push(line);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_READY: [bool; MAX_OPERANDS] = [true; MAX_OPERANDS];

    fn waiting_on(tag: RobIndex) -> ([RobIndex; MAX_OPERANDS], [bool; MAX_OPERANDS]) {
        ([tag, 0, 0, 0], [false, true, true, true])
    }

    #[test]
    fn test_preready_insert_issues_after_clock() {
        let mut iq = IssueQueue::new(8);
        assert!(iq.insert(5, &[0; 4], &ALL_READY));
        assert_eq!(iq.issue(), None);
        iq.clock();
        let slot = iq.issue().unwrap();
        assert_eq!(iq.uopof(slot), 5);
        // already issued, nothing else ready
        assert_eq!(iq.issue(), None);
    }

    #[test]
    fn test_broadcast_wakes_dependent() {
        let mut iq = IssueQueue::new(8);
        let (tags, preready) = waiting_on(3);
        assert!(iq.insert(7, &tags, &preready));
        iq.clock();
        assert_eq!(iq.issue(), None);
        iq.broadcast(3);
        iq.clock();
        let slot = iq.issue().unwrap();
        assert_eq!(iq.uopof(slot), 7);
    }

    #[test]
    fn test_replay_rearms_dependencies() {
        let mut iq = IssueQueue::new(8);
        assert!(iq.insert(2, &[0; 4], &ALL_READY));
        iq.clock();
        let slot = iq.issue().unwrap();
        let (tags, preready) = waiting_on(9);
        iq.replay(slot, &tags, &preready);
        iq.clock();
        assert_eq!(iq.issue(), None);
        iq.broadcast(9);
        iq.clock();
        assert_eq!(iq.issue(), Some(slot));
    }

    #[test]
    fn test_collapse_preserves_other_slots() {
        let mut iq = IssueQueue::new(8);
        assert!(iq.insert(1, &[0; 4], &ALL_READY));
        let (tags, preready) = waiting_on(4);
        assert!(iq.insert(2, &tags, &preready));
        assert!(iq.insert(3, &[0; 4], &ALL_READY));
        iq.clock();
        let slot = iq.issue().unwrap();
        assert_eq!(iq.uopof(slot), 1);
        iq.release(slot);
        assert_eq!(iq.count(), 2);
        // slot of uop 2 shifted down and still waits on rob 4
        iq.clock();
        let slot = iq.issue().unwrap();
        assert_eq!(iq.uopof(slot), 3);
        iq.broadcast(4);
        iq.clock();
        let slot = iq.issue().unwrap();
        assert_eq!(iq.uopof(slot), 2);
    }

    #[test]
    fn test_annuluop() {
        let mut iq = IssueQueue::new(4);
        assert!(iq.insert(1, &[0; 4], &ALL_READY));
        assert!(iq.insert(2, &[0; 4], &ALL_READY));
        assert!(iq.annuluop(1));
        assert!(!iq.annuluop(1));
        assert_eq!(iq.count(), 1);
        assert_eq!(iq.slotof(2), Some(0));
    }

    #[test]
    fn test_full_rejects_insert() {
        let mut iq = IssueQueue::new(2);
        assert!(iq.insert(1, &[0; 4], &ALL_READY));
        assert!(iq.insert(2, &[0; 4], &ALL_READY));
        assert!(!iq.insert(3, &[0; 4], &ALL_READY));
    }

    #[test]
    fn test_collapse_bit() {
        assert_eq!(collapse_bit(0b1011, 1), 0b101);
        assert_eq!(collapse_bit(0b1011, 0), 0b101);
        assert_eq!(collapse_bit(0b1011, 3), 0b011);
    }
}
