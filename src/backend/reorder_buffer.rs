use crate::backend::physical_register::PHYS_REG_NULL;
use crate::backend::state_list::{Linked, ListLink, StateList};
use crate::frontend::branch_predictor::PredictorUpdate;
use crate::uop::{synthop_for, Opcode, PhysRegIndex, SynthOp, Uop, MAX_OPERANDS};

/// Which lifecycle list a reorder buffer entry is on. The clustered states
/// carry the owning cluster id.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RobState {
    Free,
    Frontend,
    ReadyToDispatch,
    Dispatched(u8),
    ReadyToIssue(u8),
    ReadyToLoad(u8),
    ReadyToStore(u8),
    Issued(u8),
    Completed(u8),
    ReadyToWriteback(u8),
    CacheMiss,
    ReadyToCommit,
}

pub struct RobEntry {
    pub link: ListLink,
    pub state: RobState,
    pub entry_valid: bool,
    pub uop: Uop,
    pub synthop: SynthOp,
    pub rip: u64,
    pub uuid: u64,
    pub predinfo: PredictorUpdate,
    pub cycles_left: i16,
    pub forward_cycle: u8,
    pub cluster: i8,
    pub fu: u8,
    pub iqslot: i16,
    pub lfrq_slot: i16,
    pub load_store_second_phase: bool,
    pub physreg: PhysRegIndex,
    pub operands: [PhysRegIndex; MAX_OPERANDS],
    pub lsq: Option<u16>,
}

impl RobEntry {
    fn new() -> RobEntry {
        RobEntry {
            link: ListLink::new(),
            state: RobState::Free,
            entry_valid: false,
            uop: Uop::new(Opcode::NOP),
            synthop: synthop_for(Opcode::NOP),
            rip: 0,
            uuid: 0,
            predinfo: PredictorUpdate::default(),
            cycles_left: 0,
            forward_cycle: 0,
            cluster: -1,
            fu: 0,
            iqslot: -1,
            lfrq_slot: -1,
            load_store_second_phase: false,
            physreg: PHYS_REG_NULL,
            operands: [PHYS_REG_NULL; MAX_OPERANDS],
            lsq: None,
        }
    }

    /// Clear the fields a freshly allocated entry expects to be clean.
    pub fn reset(&mut self) {
        self.entry_valid = false;
        self.cycles_left = 0;
        self.forward_cycle = 0;
        self.cluster = -1;
        self.fu = 0;
        self.iqslot = -1;
        self.lfrq_slot = -1;
        self.load_store_second_phase = false;
        self.physreg = PHYS_REG_NULL;
        self.operands = [PHYS_REG_NULL; MAX_OPERANDS];
        self.lsq = None;
    }
}

impl Linked for RobEntry {
    fn link(&self) -> &ListLink {
        &self.link
    }
    fn link_mut(&mut self) -> &mut ListLink {
        &mut self.link
    }
}

pub struct RobLists {
    pub free: StateList,
    pub frontend: StateList,
    pub ready_to_dispatch: StateList,
    pub dispatched: Vec<StateList>,
    pub ready_to_issue: Vec<StateList>,
    pub ready_to_load: Vec<StateList>,
    pub ready_to_store: Vec<StateList>,
    pub issued: Vec<StateList>,
    pub completed: Vec<StateList>,
    pub ready_to_writeback: Vec<StateList>,
    pub cache_miss: StateList,
    pub ready_to_commit: StateList,
}

fn clustered(name: &'static str, count: usize) -> Vec<StateList> {
    (0..count).map(|_| StateList::new(name)).collect()
}

impl RobLists {
    fn new(cluster_count: usize) -> RobLists {
        RobLists {
            free: StateList::new("free"),
            frontend: StateList::new("frontend"),
            ready_to_dispatch: StateList::new("ready-to-dispatch"),
            dispatched: clustered("dispatched", cluster_count),
            ready_to_issue: clustered("ready-to-issue", cluster_count),
            ready_to_load: clustered("ready-to-load", cluster_count),
            ready_to_store: clustered("ready-to-store", cluster_count),
            issued: clustered("issued", cluster_count),
            completed: clustered("completed", cluster_count),
            ready_to_writeback: clustered("ready-to-write", cluster_count),
            cache_miss: StateList::new("cache-miss"),
            ready_to_commit: StateList::new("ready-to-commit"),
        }
    }

    pub fn list(&self, state: RobState) -> &StateList {
        match state {
            RobState::Free => &self.free,
            RobState::Frontend => &self.frontend,
            RobState::ReadyToDispatch => &self.ready_to_dispatch,
            RobState::Dispatched(cl) => &self.dispatched[cl as usize],
            RobState::ReadyToIssue(cl) => &self.ready_to_issue[cl as usize],
            RobState::ReadyToLoad(cl) => &self.ready_to_load[cl as usize],
            RobState::ReadyToStore(cl) => &self.ready_to_store[cl as usize],
            RobState::Issued(cl) => &self.issued[cl as usize],
            RobState::Completed(cl) => &self.completed[cl as usize],
            RobState::ReadyToWriteback(cl) => &self.ready_to_writeback[cl as usize],
            RobState::CacheMiss => &self.cache_miss,
            RobState::ReadyToCommit => &self.ready_to_commit,
        }
    }

    fn list_mut(&mut self, state: RobState) -> &mut StateList {
        match state {
            RobState::Free => &mut self.free,
            RobState::Frontend => &mut self.frontend,
            RobState::ReadyToDispatch => &mut self.ready_to_dispatch,
            RobState::Dispatched(cl) => &mut self.dispatched[cl as usize],
            RobState::ReadyToIssue(cl) => &mut self.ready_to_issue[cl as usize],
            RobState::ReadyToLoad(cl) => &mut self.ready_to_load[cl as usize],
            RobState::ReadyToStore(cl) => &mut self.ready_to_store[cl as usize],
            RobState::Issued(cl) => &mut self.issued[cl as usize],
            RobState::Completed(cl) => &mut self.completed[cl as usize],
            RobState::ReadyToWriteback(cl) => &mut self.ready_to_writeback[cl as usize],
            RobState::CacheMiss => &mut self.cache_miss,
            RobState::ReadyToCommit => &mut self.ready_to_commit,
        }
    }

    pub fn all_lists(&self) -> Vec<&StateList> {
        let mut out: Vec<&StateList> = vec![&self.free, &self.frontend, &self.ready_to_dispatch];
        for group in [
            &self.dispatched,
            &self.ready_to_issue,
            &self.ready_to_load,
            &self.ready_to_store,
            &self.issued,
            &self.completed,
            &self.ready_to_writeback,
        ] {
            out.extend(group.iter());
        }
        out.push(&self.cache_miss);
        out.push(&self.ready_to_commit);
        out
    }
}

/// The reorder buffer: a fixed circular queue of in-flight uops in program
/// order, head to tail, doubling as the arena the state lists link through.
pub struct Rob {
    pub entries: Vec<RobEntry>,
    pub lists: RobLists,
    pub capacity: usize,
    pub head: u64,
    pub tail: u64,
}

impl Rob {
    pub fn new(capacity: usize, cluster_count: usize) -> Rob {
        let mut rob = Rob {
            entries: (0..capacity).map(|_| RobEntry::new()).collect(),
            lists: RobLists::new(cluster_count),
            capacity,
            head: 0,
            tail: 0,
        };
        for i in 0..capacity {
            rob.lists.free.enqueue(&mut rob.entries, i);
        }
        rob
    }

    pub fn to_index(&self, seq: u64) -> usize {
        (seq % self.capacity as u64) as usize
    }

    pub fn size(&self) -> usize {
        (self.tail - self.head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn remaining(&self) -> bool {
        self.size() < self.capacity
    }

    pub fn head_index(&self) -> usize {
        self.to_index(self.head)
    }

    pub fn tail_index(&self) -> usize {
        self.to_index(self.tail)
    }

    pub fn set_state(&mut self, index: usize, state: RobState) {
        let old = self.entries[index].state;
        self.lists.list_mut(old).remove(&mut self.entries, index);
        self.entries[index].state = state;
        self.lists.list_mut(state).enqueue(&mut self.entries, index);
    }

    pub fn alloc(&mut self) -> usize {
        debug_assert!(self.remaining(), "rob alloc with no space");
        let index = self.to_index(self.tail);
        self.tail += 1;
        self.entries[index].reset();
        self.entries[index].entry_valid = true;
        index
    }

    /// Retire the head entry; the caller has already moved it to the free
    /// list.
    pub fn commit_head(&mut self, index: usize) {
        debug_assert!(!self.is_empty());
        debug_assert!(index == self.head_index());
        self.entries[index].reset();
        self.head += 1;
    }

    /// Roll back the tail over an annulled entry; entries must be annulled
    /// youngest first.
    pub fn annul_tail(&mut self, index: usize) {
        debug_assert!(!self.is_empty());
        debug_assert!(index == self.to_index(self.tail - 1), "annul must proceed from the tail");
        self.entries[index].reset();
        self.tail -= 1;
    }

    pub fn wrap_forward(&self, index: usize) -> usize {
        (index + 1) % self.capacity
    }

    pub fn wrap_backward(&self, index: usize) -> usize {
        (index + self.capacity - 1) % self.capacity
    }

    /// Occupied slot indices in program order.
    pub fn forward_indices(&self) -> Vec<usize> {
        (self.head..self.tail).map(|seq| self.to_index(seq)).collect()
    }

    pub fn reset(&mut self) {
        let states: Vec<RobState> = self.entries.iter().map(|e| e.state).collect();
        for (i, state) in states.into_iter().enumerate() {
            if state != RobState::Free {
                self.set_state(i, RobState::Free);
            }
            self.entries[i].reset();
        }
        self.head = 0;
        self.tail = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_commit_wraps() {
        let mut rob = Rob::new(4, 1);
        for _ in 0..2 {
            for _ in 0..4 {
                assert!(rob.remaining());
                let i = rob.alloc();
                rob.set_state(i, RobState::Frontend);
            }
            assert!(!rob.remaining());
            for _ in 0..4 {
                let head = rob.head_index();
                rob.set_state(head, RobState::Free);
                rob.commit_head(head);
            }
            assert!(rob.is_empty());
        }
    }

    #[test]
    fn test_annul_rolls_back_tail() {
        let mut rob = Rob::new(4, 1);
        let a = rob.alloc();
        let b = rob.alloc();
        rob.set_state(a, RobState::Frontend);
        rob.set_state(b, RobState::Frontend);
        rob.set_state(b, RobState::Free);
        rob.annul_tail(b);
        assert_eq!(rob.size(), 1);
        assert_eq!(rob.tail_index(), b);
        let b2 = rob.alloc();
        assert_eq!(b2, b);
    }

    #[test]
    fn test_reset_returns_everything_to_free() {
        let mut rob = Rob::new(8, 2);
        for _ in 0..5 {
            let i = rob.alloc();
            rob.set_state(i, RobState::Dispatched(1));
        }
        rob.reset();
        assert!(rob.is_empty());
        assert_eq!(rob.lists.free.count(), 8);
        assert_eq!(rob.lists.dispatched[1].count(), 0);
    }
}
