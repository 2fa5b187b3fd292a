use crate::uop::{BRANCH_HINT_CALL, BRANCH_HINT_COND, BRANCH_HINT_INDIRECT, BRANCH_HINT_RET};

//
// The core only sees this trait; table organization and update policy are
// predictor-private. The per-branch PredictorUpdate blob travels with the
// uop from fetch to commit so the predictor can be updated (or its return
// address stack repaired on annulment) without re-deriving any state.
//

#[derive(Clone, Copy, Default, Debug)]
pub struct PredictorUpdate {
    pub bptype: u32,
    pub ripafter: u64,
    pub stack_recover_idx: usize,
    pub stack_recover_top: u64,
}

#[derive(Clone, Copy, Default)]
pub struct PredictorCounters {
    pub predictions: u64,
    pub updates: u64,
    pub ras_pushes: u64,
    pub ras_overflows: u64,
    pub ras_pops: u64,
    pub ras_underflows: u64,
    pub ras_annuls: u64,
}

pub trait BranchPredictor {
    fn predict(&mut self, update: &mut PredictorUpdate, bptype: u32, ripafter: u64, riptaken: u64)
        -> u64;
    /// Push the return address for a call; called at rename.
    fn updateras(&mut self, update: &mut PredictorUpdate, ripafter: u64);
    /// Undo return-address-stack changes for an annulled branch.
    fn annulras(&mut self, update: &PredictorUpdate);
    fn update(
        &mut self,
        update: &PredictorUpdate,
        branch_addr: u64,
        real_target: u64,
        taken: bool,
        predtaken: bool,
        correct: bool,
    );
    fn flush(&mut self);
    fn counters(&self) -> PredictorCounters;
}

const TABLE_BITS: usize = 12;
const TABLE_SIZE: usize = 1 << TABLE_BITS;
const BTB_BITS: usize = 10;
const BTB_SIZE: usize = 1 << BTB_BITS;
const RAS_SIZE: usize = 32;

#[derive(Clone, Copy, Default)]
struct BtbEntry {
    tag: u64,
    target: u64,
    valid: bool,
}

/// Default predictor: a bimodal table of 2-bit counters for conditional
/// branches, a direct-mapped BTB for indirect targets, and a return address
/// stack with recovery on annulment. Learned state survives pipeline flushes.
pub struct BimodalPredictor {
    table: Vec<u8>,
    btb: Vec<BtbEntry>,
    ras: [u64; RAS_SIZE],
    ras_depth: usize,
    counters: PredictorCounters,
}

impl BimodalPredictor {
    pub fn new() -> BimodalPredictor {
        BimodalPredictor {
            // weakly taken
            table: vec![2; TABLE_SIZE],
            btb: vec![BtbEntry::default(); BTB_SIZE],
            ras: [0; RAS_SIZE],
            ras_depth: 0,
            counters: PredictorCounters::default(),
        }
    }

    fn table_index(addr: u64) -> usize {
        ((addr ^ (addr >> TABLE_BITS as u64)) as usize) & (TABLE_SIZE - 1)
    }

    fn btb_index(addr: u64) -> usize {
        (addr as usize) & (BTB_SIZE - 1)
    }
}

impl BranchPredictor for BimodalPredictor {
    fn predict(
        &mut self,
        update: &mut PredictorUpdate,
        bptype: u32,
        ripafter: u64,
        riptaken: u64,
    ) -> u64 {
        self.counters.predictions += 1;
        update.bptype = bptype;
        update.ripafter = ripafter;
        update.stack_recover_idx = self.ras_depth;
        update.stack_recover_top = self.ras[self.ras_depth.saturating_sub(1).min(RAS_SIZE - 1)];

        if bptype & BRANCH_HINT_RET != 0 {
            if self.ras_depth > 0 {
                self.ras_depth -= 1;
                self.counters.ras_pops += 1;
                return self.ras[self.ras_depth];
            }
            self.counters.ras_underflows += 1;
            return riptaken;
        }

        if bptype & BRANCH_HINT_INDIRECT != 0 {
            let entry = self.btb[Self::btb_index(ripafter)];
            if entry.valid && entry.tag == ripafter {
                return entry.target;
            }
            return riptaken;
        }

        if bptype & BRANCH_HINT_COND != 0 {
            if self.table[Self::table_index(ripafter)] >= 2 {
                return riptaken;
            }
            return ripafter;
        }

        riptaken
    }

    fn updateras(&mut self, _update: &mut PredictorUpdate, ripafter: u64) {
        if self.ras_depth == RAS_SIZE {
            // drop the oldest frame
            self.ras.copy_within(1.., 0);
            self.ras_depth -= 1;
            self.counters.ras_overflows += 1;
        }
        self.ras[self.ras_depth] = ripafter;
        self.ras_depth += 1;
        self.counters.ras_pushes += 1;
    }

    fn annulras(&mut self, update: &PredictorUpdate) {
        self.counters.ras_annuls += 1;
        self.ras_depth = update.stack_recover_idx.min(RAS_SIZE);
        if self.ras_depth > 0 {
            self.ras[self.ras_depth - 1] = update.stack_recover_top;
        }
    }

    fn update(
        &mut self,
        update: &PredictorUpdate,
        branch_addr: u64,
        real_target: u64,
        taken: bool,
        _predtaken: bool,
        _correct: bool,
    ) {
        self.counters.updates += 1;
        if update.bptype & BRANCH_HINT_COND != 0 {
            let counter = &mut self.table[Self::table_index(branch_addr)];
            if taken {
                *counter = (*counter + 1).min(3);
            } else {
                *counter = counter.saturating_sub(1);
            }
        }
        if update.bptype & BRANCH_HINT_INDIRECT != 0 && update.bptype & BRANCH_HINT_RET == 0 {
            self.btb[Self::btb_index(branch_addr)] = BtbEntry {
                tag: branch_addr,
                target: real_target,
                valid: true,
            };
        }
    }

    fn flush(&mut self) {
        self.ras_depth = 0;
    }

    fn counters(&self) -> PredictorCounters {
        self.counters
    }
}

pub fn bptype_for(cond: bool, indirect: bool, call: bool, ret: bool) -> u32 {
    (if cond { BRANCH_HINT_COND } else { 0 })
        | (if indirect { BRANCH_HINT_INDIRECT } else { 0 })
        | (if call { BRANCH_HINT_CALL } else { 0 })
        | (if ret { BRANCH_HINT_RET } else { 0 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_learns_taken() {
        let mut bp = BimodalPredictor::new();
        let mut info = PredictorUpdate::default();
        for _ in 0..4 {
            bp.predict(&mut info, BRANCH_HINT_COND, 0x100, 0x200);
            bp.update(&info, 0x100, 0x200, true, true, true);
        }
        assert_eq!(bp.predict(&mut info, BRANCH_HINT_COND, 0x100, 0x200), 0x200);
        for _ in 0..4 {
            bp.update(&info, 0x100, 0x100, false, true, false);
        }
        assert_eq!(bp.predict(&mut info, BRANCH_HINT_COND, 0x100, 0x200), 0x100);
    }

    #[test]
    fn test_ras_round_trip() {
        let mut bp = BimodalPredictor::new();
        let mut call = PredictorUpdate::default();
        bp.updateras(&mut call, 0x1234);
        let mut ret = PredictorUpdate::default();
        let target = bp.predict(
            &mut ret,
            BRANCH_HINT_INDIRECT | BRANCH_HINT_RET,
            0x9999,
            0x4444,
        );
        assert_eq!(target, 0x1234);
    }

    #[test]
    fn test_annulras_restores_depth() {
        let mut bp = BimodalPredictor::new();
        let mut outer = PredictorUpdate::default();
        bp.updateras(&mut outer, 0x10);
        // a speculative call past a mispredicted branch
        let mut info = PredictorUpdate::default();
        bp.predict(&mut info, BRANCH_HINT_COND, 0x20, 0x30);
        let mut inner = PredictorUpdate::default();
        bp.updateras(&mut inner, 0x40);
        bp.annulras(&info);
        let mut ret = PredictorUpdate::default();
        let target = bp.predict(
            &mut ret,
            BRANCH_HINT_INDIRECT | BRANCH_HINT_RET,
            0x9999,
            0x4444,
        );
        assert_eq!(target, 0x10);
    }
}
