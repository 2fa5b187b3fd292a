use crate::backend::state_list::{Linked, ListLink, StateList};
use crate::uop::{ArchReg, PhysRegIndex, RobIndex, ARCHREG_COUNT, FLAG_WAIT, REG_ZERO};

pub const PHYS_REG_NULL: PhysRegIndex = 0;

//
// A physical register is referenced by up to three kinds of holders: the
// speculative rename table, the committed rename table, and the operand
// slots of in-flight entries in the reorder buffer. The refcount tracks all
// of them; a register may only return to the free pool when the count is
// zero and its committed mapping has been overwritten.
//

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PhysRegState {
    Free,
    Used,
    Ready,
    Written,
    Arch,
    PendingFree,
}

pub const PHYS_REG_STATE_COUNT: usize = 6;

pub struct PhysReg {
    pub link: ListLink,
    pub state: PhysRegState,
    pub data: u64,
    pub flags: u16,
    // the in-flight producer, validated by uuid before use
    pub producer: Option<(RobIndex, u64)>,
    pub archreg: ArchReg,
    pub refcount: i16,
}

impl PhysReg {
    fn new() -> PhysReg {
        PhysReg {
            link: ListLink::new(),
            state: PhysRegState::Free,
            data: 0,
            flags: 0,
            producer: None,
            archreg: REG_ZERO,
            refcount: 0,
        }
    }

    pub fn ready(&self) -> bool {
        self.flags & FLAG_WAIT == 0
    }

    pub fn valid(&self) -> bool {
        self.flags & crate::uop::FLAG_INV == 0
    }

    pub fn referenced(&self) -> bool {
        self.refcount > 0
    }
}

impl Linked for PhysReg {
    fn link(&self) -> &ListLink {
        &self.link
    }
    fn link_mut(&mut self) -> &mut ListLink {
        &mut self.link
    }
}

pub struct PhysRegLists {
    pub free: StateList,
    pub used: StateList,
    pub ready: StateList,
    pub written: StateList,
    pub arch: StateList,
    pub pendingfree: StateList,
}

impl PhysRegLists {
    fn new() -> PhysRegLists {
        PhysRegLists {
            free: StateList::new("free"),
            used: StateList::new("used"),
            ready: StateList::new("ready"),
            written: StateList::new("written"),
            arch: StateList::new("arch"),
            pendingfree: StateList::new("pendingfree"),
        }
    }

    pub fn list(&self, state: PhysRegState) -> &StateList {
        match state {
            PhysRegState::Free => &self.free,
            PhysRegState::Used => &self.used,
            PhysRegState::Ready => &self.ready,
            PhysRegState::Written => &self.written,
            PhysRegState::Arch => &self.arch,
            PhysRegState::PendingFree => &self.pendingfree,
        }
    }

    fn list_mut(&mut self, state: PhysRegState) -> &mut StateList {
        match state {
            PhysRegState::Free => &mut self.free,
            PhysRegState::Used => &mut self.used,
            PhysRegState::Ready => &mut self.ready,
            PhysRegState::Written => &mut self.written,
            PhysRegState::Arch => &mut self.arch,
            PhysRegState::PendingFree => &mut self.pendingfree,
        }
    }

    pub fn all_states() -> [PhysRegState; PHYS_REG_STATE_COUNT] {
        [
            PhysRegState::Free,
            PhysRegState::Used,
            PhysRegState::Ready,
            PhysRegState::Written,
            PhysRegState::Arch,
            PhysRegState::PendingFree,
        ]
    }
}

//
// Layout: index 0 is the zero register, always in the arch state with data 0.
// Indices [1, arch_base) are the allocatable pool; [arch_base, size) is the
// bank holding the initial committed mapping of every architectural register.
//
pub struct PhysRegFile {
    pub regs: Vec<PhysReg>,
    pub lists: PhysRegLists,
    pub arch_base: PhysRegIndex,
}

impl PhysRegFile {
    pub fn new(alloc_count: usize) -> PhysRegFile {
        let total = alloc_count + ARCHREG_COUNT;
        let mut file = PhysRegFile {
            regs: (0..total).map(|_| PhysReg::new()).collect(),
            lists: PhysRegLists::new(),
            arch_base: alloc_count as PhysRegIndex,
        };
        file.reset();
        file
    }

    /// Reset all lifecycle state. The data words are preserved: the
    /// architectural bank keeps the guest register values across flushes.
    pub fn reset(&mut self) {
        self.lists.free.reset();
        self.lists.used.reset();
        self.lists.ready.reset();
        self.lists.written.reset();
        self.lists.arch.reset();
        self.lists.pendingfree.reset();

        for i in 0..self.regs.len() {
            let reg = &mut self.regs[i];
            reg.link = ListLink::new();
            reg.state = PhysRegState::Free;
            reg.producer = None;
            reg.refcount = 0;
            self.lists.free.enqueue(&mut self.regs, i);
        }

        for i in self.arch_base as usize..self.regs.len() {
            self.set_state(i as PhysRegIndex, PhysRegState::Arch);
            self.regs[i].archreg = (i - self.arch_base as usize) as ArchReg;
            self.regs[i].flags &= !FLAG_WAIT;
        }

        self.set_state(PHYS_REG_NULL, PhysRegState::Arch);
        let zero = &mut self.regs[PHYS_REG_NULL as usize];
        zero.data = 0;
        zero.flags = 0;
    }

    pub fn set_state(&mut self, index: PhysRegIndex, state: PhysRegState) {
        let old = self.regs[index as usize].state;
        self.lists.list_mut(old).remove(&mut self.regs, index as usize);
        self.regs[index as usize].state = state;
        self.lists
            .list_mut(state)
            .enqueue(&mut self.regs, index as usize);
    }

    pub fn remaining(&self) -> bool {
        !self.lists.free.is_empty()
    }

    pub fn alloc(&mut self) -> Option<PhysRegIndex> {
        let index = self.lists.free.head()? as PhysRegIndex;
        debug_assert!(index != PHYS_REG_NULL);
        self.set_state(index, PhysRegState::Used);
        let reg = &mut self.regs[index as usize];
        debug_assert!(reg.refcount == 0);
        reg.flags = FLAG_WAIT;
        Some(index)
    }

    /// Return a register to the free pool unconditionally; the caller
    /// guarantees no references remain.
    pub fn free(&mut self, index: PhysRegIndex) {
        debug_assert!(index != PHYS_REG_NULL);
        self.set_state(index, PhysRegState::Free);
        let reg = &mut self.regs[index as usize];
        reg.producer = None;
        reg.refcount = 0;
    }

    pub fn addref(&mut self, index: PhysRegIndex) {
        if index != PHYS_REG_NULL {
            self.regs[index as usize].refcount += 1;
        }
    }

    pub fn unref(&mut self, index: PhysRegIndex) {
        if index != PHYS_REG_NULL {
            let reg = &mut self.regs[index as usize];
            reg.refcount -= 1;
            debug_assert!(reg.refcount >= 0, "r{} refcount went negative", index);
        }
    }

    pub fn get(&self, index: PhysRegIndex) -> &PhysReg {
        &self.regs[index as usize]
    }

    pub fn get_mut(&mut self, index: PhysRegIndex) -> &mut PhysReg {
        &mut self.regs[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_layout() {
        let file = PhysRegFile::new(32);
        assert_eq!(file.regs.len(), 32 + ARCHREG_COUNT);
        // the zero register and the arch bank are not allocatable
        assert_eq!(file.lists.free.count(), 31);
        assert_eq!(file.lists.arch.count(), ARCHREG_COUNT + 1);
        assert_eq!(file.get(PHYS_REG_NULL).data, 0);
        assert_eq!(file.get(PHYS_REG_NULL).state, PhysRegState::Arch);
    }

    #[test]
    fn test_alloc_sets_wait_and_used() {
        let mut file = PhysRegFile::new(8);
        let r = file.alloc().unwrap();
        assert_ne!(r, PHYS_REG_NULL);
        assert_eq!(file.get(r).state, PhysRegState::Used);
        assert!(!file.get(r).ready());
        assert_eq!(file.lists.used.count(), 1);
    }

    #[test]
    fn test_refcount_ignores_null() {
        let mut file = PhysRegFile::new(8);
        file.addref(PHYS_REG_NULL);
        file.unref(PHYS_REG_NULL);
        assert_eq!(file.get(PHYS_REG_NULL).refcount, 0);
        let r = file.alloc().unwrap();
        file.addref(r);
        file.addref(r);
        file.unref(r);
        assert_eq!(file.get(r).refcount, 1);
    }

    #[test]
    fn test_reset_preserves_data() {
        let mut file = PhysRegFile::new(8);
        let arch0 = file.arch_base;
        file.get_mut(arch0).data = 0x1234;
        let r = file.alloc().unwrap();
        file.get_mut(r).data = 0x5678;
        file.reset();
        assert_eq!(file.get(arch0).data, 0x1234);
        assert_eq!(file.get(arch0).state, PhysRegState::Arch);
        assert_eq!(file.get(r).state, PhysRegState::Free);
        assert_eq!(file.get(r).data, 0x5678);
    }
}
