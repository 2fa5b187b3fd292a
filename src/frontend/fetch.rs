use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use crate::config::{CoreConfig, SimOptions};
use crate::frontend::branch_predictor::{bptype_for, BranchPredictor, PredictorUpdate};
use crate::memory_subsystem::address_space::PROT_EXEC;
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;
use crate::uop::{
    invert_cond, isclass, opclass_index, opinfo, SynthOp, Uop, BRANCH_HINT_CALL,
    BRANCH_HINT_RET, OPCLASS_BRANCH, OPCLASS_COND_BRANCH, OPCLASS_COUNT, OPCLASS_INDIR_BRANCH,
    OPCLASS_UNCOND_BRANCH,
};

// x86 code bytes fetched per i-cache probe
const ICACHE_FETCH_GRANULARITY: u64 = 16;

/// A decoded basic block: the uop expansion of the instructions starting at
/// `rip`, ending at the first branch.
pub struct BasicBlock {
    pub rip: u64,
    pub uops: Vec<(Uop, SynthOp)>,
}

/// The translator interface. `translate` decodes at a rip; `mark_unaligned`
/// tells the decoder a memory access at that rip faulted on alignment so the
/// next translation splits it into aligned halves.
pub trait Decoder {
    fn translate(&self, rip: u64, max_insns: u64) -> Option<BasicBlock>;
    fn mark_unaligned(&self, rip: u64);
    fn entry_point(&self) -> u64;
}

#[derive(Clone, Copy)]
pub struct FetchEntry {
    pub uop: Uop,
    pub synthop: SynthOp,
    pub rip: u64,
    pub uuid: u64,
    pub predinfo: PredictorUpdate,
}

/// The fetch queue between the fetch unit and the rename stage.
pub struct FetchQueue {
    pub capacity: usize,
    head: u64,
    tail: u64,
    slots: Vec<Option<FetchEntry>>,
}

impl FetchQueue {
    pub fn new(capacity: usize) -> FetchQueue {
        FetchQueue {
            capacity,
            head: 0,
            tail: 0,
            slots: vec![None; capacity],
        }
    }

    pub fn size(&self) -> usize {
        (self.tail - self.head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.size()
    }

    pub fn enqueue(&mut self, entry: FetchEntry) {
        debug_assert!(self.remaining() > 0);
        let index = (self.tail % self.capacity as u64) as usize;
        self.slots[index] = Some(entry);
        self.tail += 1;
    }

    pub fn peek(&self) -> Option<&FetchEntry> {
        if self.is_empty() {
            return None;
        }
        self.slots[(self.head % self.capacity as u64) as usize].as_ref()
    }

    pub fn dequeue(&mut self) -> Option<FetchEntry> {
        if self.is_empty() {
            return None;
        }
        let index = (self.head % self.capacity as u64) as usize;
        self.head += 1;
        self.slots[index].take()
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

/// Shared control block between the fetch unit and the backend: the backend
/// redirects fetch on mispredicts and stalls it on pending exceptions.
pub struct FetchControl {
    pub fetchrip: u64,
    pub stall_frontend: bool,
    pub waiting_for_icache_fill: bool,
    pub stop_requested: bool,
    // posted by the backend; consumed at the top of the fetch cycle
    pub redirect: Option<u64>,
    pub invalidate: Option<u64>,
}

impl FetchControl {
    pub fn new() -> FetchControl {
        FetchControl {
            fetchrip: 0,
            stall_frontend: false,
            waiting_for_icache_fill: false,
            stop_requested: false,
            redirect: None,
            invalidate: None,
        }
    }
}

#[derive(Default)]
pub struct FetchCounters {
    pub stop_icache_miss: u64,
    pub stop_fetchq_full: u64,
    pub stop_bogus_rip: u64,
    pub stop_branch_taken: u64,
    pub stop_full_width: u64,
    pub blocks_fetched: u64,
    pub uops_fetched: u64,
    pub user_insns_fetched: u64,
    pub bbcache_inserts: u64,
    pub bbcache_removes: u64,
    pub width_histogram: Vec<u64>,
    pub opclass_histogram: [u64; OPCLASS_COUNT],
}

pub struct FetchUnit {
    fetch_width: usize,
    bbinsns: u64,
    stoprip: Option<u64>,
    fetchq: Rc<RefCell<FetchQueue>>,
    control: Rc<RefCell<FetchControl>>,
    mem: Rc<RefCell<MemorySubsystem>>,
    branchpred: Rc<RefCell<dyn BranchPredictor>>,
    decoder: Rc<dyn Decoder>,
    bbcache: HashMap<u64, Rc<BasicBlock>>,
    current_bb: Option<Rc<BasicBlock>>,
    bb_index: usize,
    bytes_in_current_insn: u8,
    current_icache_block: u64,
    fetch_uuid: u64,
    pub counters: FetchCounters,
}

impl FetchUnit {
    pub fn new(
        config: &CoreConfig,
        opts: &SimOptions,
        fetchq: Rc<RefCell<FetchQueue>>,
        control: Rc<RefCell<FetchControl>>,
        mem: Rc<RefCell<MemorySubsystem>>,
        branchpred: Rc<RefCell<dyn BranchPredictor>>,
        decoder: Rc<dyn Decoder>,
    ) -> FetchUnit {
        FetchUnit {
            fetch_width: config.fetch_width,
            bbinsns: opts.bbinsns,
            stoprip: opts.stoprip,
            fetchq,
            control,
            mem,
            branchpred,
            decoder,
            bbcache: HashMap::new(),
            current_bb: None,
            bb_index: 0,
            bytes_in_current_insn: 1,
            current_icache_block: u64::MAX,
            fetch_uuid: 0,
            counters: FetchCounters {
                width_histogram: vec![0; config.fetch_width + 1],
                ..FetchCounters::default()
            },
        }
    }

    /// Redirect fetch after a mispredict, annulment or pipeline flush.
    pub fn reset_fetch_unit(&mut self, rip: u64) {
        let mut control = self.control.borrow_mut();
        control.fetchrip = rip;
        control.stall_frontend = false;
        control.waiting_for_icache_fill = false;
        self.fetchq.borrow_mut().reset();
        self.current_bb = None;
        self.bb_index = 0;
        self.current_icache_block = u64::MAX;
    }

    /// Evict a basic block whose memory operations need to be re-split.
    pub fn invalidate_block(&mut self, rip: u64) {
        if self.bbcache.remove(&rip).is_some() {
            self.counters.bbcache_removes += 1;
        }
        self.decoder.mark_unaligned(rip);
        if let Some(bb) = &self.current_bb {
            if bb.rip == rip {
                self.current_bb = None;
                self.bb_index = 0;
            }
        }
    }

    pub fn icache_filled(&mut self) {
        self.control.borrow_mut().waiting_for_icache_fill = false;
    }

    pub fn do_cycle(&mut self) {
        let mut fetchcount = 0usize;
        let mut taken_branch = false;

        let (redirect, invalidate) = {
            let mut control = self.control.borrow_mut();
            (control.redirect.take(), control.invalidate.take())
        };
        if let Some(rip) = invalidate {
            self.invalidate_block(rip);
        }
        if let Some(rip) = redirect {
            self.reset_fetch_unit(rip);
        }

        {
            let control = self.control.borrow();
            if control.stall_frontend {
                return;
            }
            if control.waiting_for_icache_fill {
                self.counters.stop_icache_miss += 1;
                return;
            }
        }

        while fetchcount < self.fetch_width && !taken_branch {
            let fetchrip = self.control.borrow().fetchrip;

            if self.fetchq.borrow().remaining() == 0 {
                self.counters.stop_fetchq_full += 1;
                break;
            }

            if !self.mem.borrow().asp.check(fetchrip, PROT_EXEC) {
                self.counters.stop_bogus_rip += 1;
                break;
            }

            let req_icache_block = fetchrip / ICACHE_FETCH_GRANULARITY;
            if req_icache_block != self.current_icache_block {
                let hit = self.mem.borrow_mut().caches.probe_icache(fetchrip);
                if !hit {
                    let missbuf = self.mem.borrow_mut().caches.icache.initiate_miss(fetchrip);
                    self.counters.stop_icache_miss += 1;
                    if missbuf.is_none() {
                        // try to allocate a miss buffer again next cycle
                        break;
                    }
                    self.control.borrow_mut().waiting_for_icache_fill = true;
                    debug!(
                        "{:>10} fetch  rip {:#x}: wait for icache fill",
                        "", fetchrip
                    );
                    break;
                }
                self.counters.blocks_fetched += 1;
                self.current_icache_block = req_icache_block;
            }

            if self
                .current_bb
                .as_ref()
                .map_or(true, |bb| self.bb_index >= bb.uops.len())
            {
                if !self.lookup_or_translate(fetchrip) {
                    break;
                }
            }

            let bb = Rc::clone(self.current_bb.as_ref().unwrap());
            let (mut uop, synthop) = bb.uops[self.bb_index];
            self.bb_index += 1;

            if uop.som {
                self.bytes_in_current_insn = uop.bytes;
                self.counters.user_insns_fetched += 1;
            }
            self.counters.uops_fetched += 1;

            let mut predinfo = PredictorUpdate::default();
            let mut predrip = 0u64;
            let info = opinfo(uop.opcode);

            if info.opclass & OPCLASS_BRANCH != 0 {
                let bptype = bptype_for(
                    info.opclass & OPCLASS_COND_BRANCH != 0,
                    info.opclass & OPCLASS_INDIR_BRANCH != 0,
                    uop.branch_hints & BRANCH_HINT_CALL != 0,
                    uop.branch_hints & BRANCH_HINT_RET != 0,
                );
                let ripafter = fetchrip + self.bytes_in_current_insn as u64;
                predrip = self.branchpred.borrow_mut().predict(
                    &mut predinfo,
                    bptype,
                    ripafter,
                    uop.riptaken,
                );
            }

            let uuid = self.fetch_uuid;
            self.fetch_uuid += 1;

            // Arrange conditional branches so the predicted path is always
            // the taken edge; a mispredict is then simply "produced rip !=
            // riptaken" at issue.
            if isclass(uop.opcode, OPCLASS_COND_BRANCH) {
                if predrip != uop.riptaken {
                    debug_assert!(predrip == uop.ripseq);
                    uop.cond = invert_cond(uop.cond);
                    std::mem::swap(&mut uop.riptaken, &mut uop.ripseq);
                }
            } else if isclass(uop.opcode, OPCLASS_INDIR_BRANCH) {
                uop.riptaken = predrip;
                uop.ripseq = predrip;
            } else if isclass(uop.opcode, OPCLASS_UNCOND_BRANCH) {
                debug_assert!(predrip == uop.riptaken);
            }

            self.counters.opclass_histogram[opclass_index(info.opclass)] += 1;

            debug!(
                "{:>10} fetch  rip {:#x}: {}{}{}",
                uuid,
                fetchrip,
                uop,
                if uop.som { " [SOM]" } else { "" },
                if uop.eom { " [EOM]" } else { "" }
            );

            self.fetchq.borrow_mut().enqueue(FetchEntry {
                uop,
                synthop,
                rip: fetchrip,
                uuid,
                predinfo,
            });

            if uop.eom {
                let mut control = self.control.borrow_mut();
                control.fetchrip += self.bytes_in_current_insn as u64;
                if predrip != 0 {
                    taken_branch = predrip != control.fetchrip;
                    control.fetchrip = predrip;
                    if taken_branch {
                        self.counters.stop_branch_taken += 1;
                        // refetch from the predicted target next cycle
                        self.current_bb = None;
                        self.bb_index = 0;
                    }
                }
            }

            fetchcount += 1;
        }

        if fetchcount == self.fetch_width {
            self.counters.stop_full_width += 1;
        }
        self.counters.width_histogram[fetchcount] += 1;
    }

    fn lookup_or_translate(&mut self, rip: u64) -> bool {
        if let Some(stoprip) = self.stoprip {
            if rip == stoprip && !self.bbcache.contains_key(&rip) {
                self.control.borrow_mut().stop_requested = true;
                return false;
            }
        }
        let bb = match self.bbcache.get(&rip) {
            Some(bb) => Rc::clone(bb),
            None => match self.decoder.translate(rip, self.bbinsns) {
                Some(bb) => {
                    let bb = Rc::new(bb);
                    debug!(
                        "{:>10} xlate  rip {:#x}: block of {} uops",
                        "",
                        rip,
                        bb.uops.len()
                    );
                    self.bbcache.insert(rip, Rc::clone(&bb));
                    self.counters.bbcache_inserts += 1;
                    bb
                }
                None => {
                    self.counters.stop_bogus_rip += 1;
                    return false;
                }
            },
        };
        self.current_bb = Some(bb);
        self.bb_index = 0;
        true
    }

    pub fn bbcache_count(&self) -> usize {
        self.bbcache.len()
    }

    /// Dump the uop listing of the block at `rip`, for the dumpcode option.
    pub fn block_listing(&self, rip: u64) -> Option<String> {
        let bb = self.bbcache.get(&rip)?;
        let mut out = format!("block at {:#x}: {} uops\n", bb.rip, bb.uops.len());
        for (uop, _) in &bb.uops {
            out.push_str(&format!("  {}\n", uop));
        }
        Some(out)
    }
}
