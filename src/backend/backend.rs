use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, error, warn};

use crate::backend::issue_queue::IssueQueue;
use crate::backend::load_store_queue::Lsq;
use crate::backend::physical_register::{PhysRegFile, PhysRegState, PHYS_REG_NULL};
use crate::backend::rename_table::RenameTable;
use crate::backend::reorder_buffer::{Rob, RobState};
use crate::config::{CoreConfig, SimOptions, SimError};
use crate::cpu::Context;
use crate::frontend::branch_predictor::BranchPredictor;
use crate::frontend::fetch::{FetchControl, FetchQueue};
use crate::memory_subsystem::address_space::{PROT_EXEC, PROT_READ, PROT_WRITE};
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;
use crate::uop::*;

pub const ISSUE_COMPLETED: i32 = 1;
pub const ISSUE_NEEDS_REPLAY: i32 = 0;
pub const ISSUE_MISSPECULATED: i32 = -1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommitResult {
    None,
    Ok,
    Exception,
    Barrier,
    Stop,
}

pub struct Cluster {
    pub name: String,
    pub issue_width: usize,
    pub fu_mask: u32,
}

/// Pick a set bit of `mask`, varying the choice with `seed` so ties between
/// equally attractive clusters spread out over time.
fn find_random_set_bit(mask: u32, seed: u64) -> usize {
    debug_assert!(mask != 0);
    let n = (seed as u32 ^ mask) % mask.count_ones();
    let mut remaining = mask;
    for _ in 0..n {
        remaining &= remaining - 1;
    }
    remaining.trailing_zeros() as usize
}

/// Small fully-associative table of load RIPs known to have aliased with an
/// earlier store; round-robin replacement.
pub struct LoadStoreAliasPredictor {
    rips: Vec<Option<u64>>,
    victim: usize,
}

impl LoadStoreAliasPredictor {
    fn new(size: usize) -> LoadStoreAliasPredictor {
        LoadStoreAliasPredictor {
            rips: vec![None; size],
            victim: 0,
        }
    }

    pub fn contains(&self, rip: u64) -> bool {
        self.rips.iter().any(|entry| *entry == Some(rip))
    }

    pub fn insert(&mut self, rip: u64) {
        if self.contains(rip) {
            return;
        }
        let len = self.rips.len();
        self.rips[self.victim] = Some(rip);
        self.victim = (self.victim + 1) % len;
    }
}

#[derive(Default)]
pub struct FrontendCounters {
    pub status_complete: u64,
    pub status_fetchq_empty: u64,
    pub status_rob_full: u64,
    pub status_physregs_full: u64,
    pub status_ldq_full: u64,
    pub status_stq_full: u64,
    pub status_lsq_full: u64,
    pub width_histogram: Vec<u64>,
    pub renamed_none: u64,
    pub renamed_reg: u64,
    pub renamed_flags: u64,
    pub renamed_reg_and_flags: u64,
    pub alloc_reg: u64,
    pub alloc_ldreg: u64,
    pub alloc_sfr: u64,
    pub alloc_br: u64,
}

#[derive(Default)]
pub struct DispatchCounters {
    pub width_histogram: Vec<u64>,
    pub cluster_histogram: Vec<u64>,
    pub cluster_none_avail: u64,
}

#[derive(Default)]
pub struct IssueCounters {
    pub total_uops: u64,
    pub result_no_fu: u64,
    pub result_replay: u64,
    pub result_misspeculation: u64,
    pub result_branch_mispredict: u64,
    pub result_exception: u64,
    pub result_complete: u64,
    pub width_histogram: Vec<Vec<u64>>,
    pub opclass_histogram: [u64; OPCLASS_COUNT],
    pub branchpred_cond_correct: u64,
    pub branchpred_cond_mispred: u64,
    pub branchpred_indir_correct: u64,
    pub branchpred_indir_mispred: u64,
    pub branchpred_return_correct: u64,
    pub branchpred_return_mispred: u64,
    pub branchpred_total_correct: u64,
    pub branchpred_total_mispred: u64,
}

#[derive(Default)]
pub struct StoreCounters {
    pub type_aligned: u64,
    pub type_unaligned: u64,
    pub type_internal: u64,
    pub size: [u64; 4],
    pub issue_replay_sfr_not_ready: u64,
    pub issue_replay_data_to_store_not_ready: u64,
    pub issue_unaligned: u64,
    pub issue_exception: u64,
    pub issue_ordering: u64,
    pub issue_complete: u64,
    pub forward_from_zero: u64,
    pub forward_from_sfr: u64,
}

#[derive(Default)]
pub struct LoadCounters {
    pub type_aligned: u64,
    pub type_unaligned: u64,
    pub type_internal: u64,
    pub size: [u64; 4],
    pub dependency_predicted_alias_unresolved: u64,
    pub dependency_stq_address_match: u64,
    pub dependency_independent: u64,
    pub issue_replay_sfr_not_ready: u64,
    pub issue_replay_missbuf_full: u64,
    pub issue_unaligned: u64,
    pub issue_exception: u64,
    pub issue_complete: u64,
    pub issue_miss: u64,
    pub hit_l1: u64,
    pub forward_from_cache: u64,
    pub forward_from_sfr: u64,
    pub forward_from_sfr_and_cache: u64,
}

#[derive(Default)]
pub struct WritebackCounters {
    pub total: u64,
    pub width_histogram: Vec<Vec<u64>>,
}

#[derive(Default)]
pub struct CommitCounters {
    pub width_histogram: Vec<u64>,
    pub freereg_pending: u64,
    pub freereg_free: u64,
    pub freereg_recycled: u64,
    pub result_none: u64,
    pub result_ok: u64,
    pub result_exception: u64,
    pub result_exception_skipblock: u64,
    pub result_barrier: u64,
    pub result_stop: u64,
    pub flags_set: u64,
    pub flags_unset: u64,
    pub opclass_histogram: [u64; OPCLASS_COUNT],
}

pub struct Backend {
    // machine description
    pub clusters: Vec<Cluster>,
    forward_lut: Vec<Vec<u32>>,
    max_forwarding_latency: u8,
    frontend_width: usize,
    frontend_stages: u8,
    dispatch_width: usize,
    writeback_width: usize,
    commit_width: usize,
    ldq_size: usize,
    stq_size: usize,
    load_latency: u8,
    virt_addr_mask: u64,

    // pipeline structures
    pub rob: Rob,
    pub prf: PhysRegFile,
    pub spec_rrt: RenameTable,
    pub commit_rrt: RenameTable,
    pub lsq: Lsq,
    pub issue_queues: Vec<IssueQueue>,
    pub lsap: LoadStoreAliasPredictor,
    pub fu_avail: u32,

    // collaborators
    fetchq: Rc<RefCell<FetchQueue>>,
    fetch_control: Rc<RefCell<FetchControl>>,
    mem: Rc<RefCell<MemorySubsystem>>,
    branchpred: Rc<RefCell<dyn BranchPredictor>>,
    ctx: Rc<RefCell<Context>>,

    // cycle bookkeeping
    pub sim_cycle: u64,
    pub last_commit_at_cycle: u64,
    pub chk_recovery_rip: u64,
    bytes_in_current_insn_to_commit: u8,
    pub total_uops_committed: u64,
    pub total_user_insns_committed: u64,
    stop_at_user_insns: u64,

    pub frontend_counters: FrontendCounters,
    pub dispatch_counters: DispatchCounters,
    pub issue_counters: IssueCounters,
    pub store_counters: StoreCounters,
    pub load_counters: LoadCounters,
    pub writeback_counters: WritebackCounters,
    pub commit_counters: CommitCounters,
}

impl Backend {
    pub fn new(
        config: &CoreConfig,
        opts: &SimOptions,
        fetchq: Rc<RefCell<FetchQueue>>,
        fetch_control: Rc<RefCell<FetchControl>>,
        mem: Rc<RefCell<MemorySubsystem>>,
        branchpred: Rc<RefCell<dyn BranchPredictor>>,
        ctx: Rc<RefCell<Context>>,
    ) -> Result<Backend, SimError> {
        config.validate()?;
        let clusters: Vec<Cluster> = config
            .clusters
            .iter()
            .map(|cl| {
                Ok(Cluster {
                    name: cl.name.clone(),
                    issue_width: cl.issue_width,
                    fu_mask: cl.fu_mask()?,
                })
            })
            .collect::<Result<_, SimError>>()?;

        let cluster_count = clusters.len();
        let max_lat = config.max_forwarding_latency();
        let mut forward_lut = vec![vec![0u32; max_lat as usize + 1]; cluster_count];
        for src in 0..cluster_count {
            for dst in 0..cluster_count {
                let lat = config.intercluster_latency[src][dst] as usize;
                forward_lut[src][lat] |= 1 << dst;
            }
        }

        let max_issue_width = clusters.iter().map(|c| c.issue_width).max().unwrap_or(1);

        Ok(Backend {
            clusters,
            forward_lut,
            max_forwarding_latency: max_lat,
            frontend_width: config.frontend_width,
            frontend_stages: config.frontend_stages,
            dispatch_width: config.dispatch_width,
            writeback_width: config.writeback_width,
            commit_width: config.commit_width,
            ldq_size: config.ldq_size,
            stq_size: config.stq_size,
            load_latency: config.load_latency,
            virt_addr_mask: config.virt_addr_mask(),
            rob: Rob::new(config.rob_size, cluster_count),
            prf: PhysRegFile::new(config.phys_reg_count),
            spec_rrt: RenameTable::new(config.phys_reg_count as PhysRegIndex),
            commit_rrt: RenameTable::new(config.phys_reg_count as PhysRegIndex),
            lsq: Lsq::new(config.ldq_size + config.stq_size),
            issue_queues: (0..cluster_count).map(|_| IssueQueue::new(config.iq_size)).collect(),
            lsap: LoadStoreAliasPredictor::new(config.lsap_size),
            fu_avail: (1u32 << FU_COUNT) - 1,
            fetchq,
            fetch_control,
            mem,
            branchpred,
            ctx,
            sim_cycle: 0,
            last_commit_at_cycle: 0,
            chk_recovery_rip: 0,
            bytes_in_current_insn_to_commit: 1,
            total_uops_committed: 0,
            total_user_insns_committed: 0,
            stop_at_user_insns: opts.stopinsns,
            frontend_counters: FrontendCounters {
                width_histogram: vec![0; config.frontend_width + 1],
                ..FrontendCounters::default()
            },
            dispatch_counters: DispatchCounters {
                width_histogram: vec![0; config.dispatch_width + 1],
                cluster_histogram: vec![0; cluster_count],
                cluster_none_avail: 0,
            },
            issue_counters: IssueCounters {
                width_histogram: vec![vec![0; max_issue_width + 1]; cluster_count],
                ..IssueCounters::default()
            },
            store_counters: StoreCounters::default(),
            load_counters: LoadCounters::default(),
            writeback_counters: WritebackCounters {
                total: 0,
                width_histogram: vec![vec![0; config.writeback_width + 1]; cluster_count],
            },
            commit_counters: CommitCounters {
                width_histogram: vec![0; config.commit_width + 1],
                ..CommitCounters::default()
            },
        })
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// One simulated cycle of the execution engine, stages in reverse
    /// pipeline order so each stage sees the previous cycle's outputs.
    pub fn do_cycle(&mut self) -> CommitResult {
        self.fu_avail = (1u32 << FU_COUNT) - 1;

        let commitrc = self.cycle_commit();

        for cl in 0..self.cluster_count() {
            self.cycle_writeback(cl);
        }
        for cl in 0..self.cluster_count() {
            self.cycle_transfer(cl);
        }
        for cl in 0..self.cluster_count() {
            self.cycle_issue(cl);
            self.cycle_complete(cl);
        }

        self.cycle_dispatch();

        if !self.fetch_control.borrow().stall_frontend {
            self.cycle_frontend();
            self.cycle_rename();
        }

        commitrc
    }

    pub fn clock_issue_queues(&mut self) {
        for iq in &mut self.issue_queues {
            iq.clock();
        }
    }

    fn redirect_fetch(&mut self, rip: u64) {
        let mut control = self.fetch_control.borrow_mut();
        control.redirect = Some(rip);
        control.waiting_for_icache_fill = false;
        control.stall_frontend = false;
        self.fetchq.borrow_mut().reset();
    }

    //
    // Rename
    //

    fn cycle_rename(&mut self) {
        let mut prepcount = 0usize;

        while prepcount < self.frontend_width {
            if self.fetchq.borrow().is_empty() {
                self.frontend_counters.status_fetchq_empty += 1;
                break;
            }
            if !self.rob.remaining() {
                self.frontend_counters.status_rob_full += 1;
                break;
            }
            if !self.prf.remaining() {
                self.frontend_counters.status_physregs_full += 1;
                break;
            }

            let (ld, st, br) = {
                let fetchq = self.fetchq.borrow();
                let head = fetchq.peek().unwrap();
                let op = head.uop.opcode;
                (isload(op), isstore(op), isbranch(op))
            };

            if ld && self.lsq.loads_in_flight >= self.ldq_size {
                self.frontend_counters.status_ldq_full += 1;
                break;
            }
            if st && self.lsq.stores_in_flight >= self.stq_size {
                self.frontend_counters.status_stq_full += 1;
                break;
            }
            if (ld || st) && !self.lsq.remaining() {
                self.frontend_counters.status_lsq_full += 1;
                break;
            }

            self.frontend_counters.status_complete += 1;

            let transop = self.fetchq.borrow_mut().dequeue().unwrap();
            let robidx = self.rob.alloc();
            let physreg = self.prf.alloc().unwrap();
            {
                let reg = self.prf.get_mut(physreg);
                reg.flags = FLAG_WAIT;
                reg.data = 0xdead_beef_dead_beef;
                reg.producer = Some((robidx as RobIndex, transop.uuid));
                reg.archreg = transop.uop.rd;
            }

            self.rob.set_state(robidx, RobState::Frontend);
            {
                let entry = &mut self.rob.entries[robidx];
                entry.uop = transop.uop;
                entry.synthop = transop.synthop;
                entry.rip = transop.rip;
                entry.uuid = transop.uuid;
                entry.predinfo = transop.predinfo;
                entry.cycles_left = self.frontend_stages as i16;
                entry.physreg = physreg;
            }

            if ld || st {
                let lsq_idx = self.lsq.alloc(robidx as RobIndex, st);
                self.rob.entries[robidx].lsq = Some(lsq_idx as u16);
            }

            self.frontend_counters.alloc_reg += (!(ld || st || br)) as u64;
            self.frontend_counters.alloc_ldreg += ld as u64;
            self.frontend_counters.alloc_sfr += st as u64;
            self.frontend_counters.alloc_br += br as u64;

            // Map the architectural sources through the speculative table;
            // the synthetic store-forward slot starts at the zero register.
            let uop = self.rob.entries[robidx].uop;
            let operands = [
                self.spec_rrt.get(uop.ra),
                self.spec_rrt.get(uop.rb),
                self.spec_rrt.get(uop.rc),
                PHYS_REG_NULL,
            ];
            self.rob.entries[robidx].operands = operands;
            for operand in operands {
                self.prf.addref(operand);
                debug_assert!(self.prf.get(operand).state != PhysRegState::Free);
            }

            let mut renamed_reg = false;
            if archdest_can_rename(uop.rd) {
                let old = self.spec_rrt.get(uop.rd);
                self.prf.unref(old);
                self.spec_rrt.set(uop.rd, physreg);
                self.prf.addref(physreg);
                renamed_reg = (uop.rd as usize) < ARCHREG_COUNT;
            }

            let mut renamed_flags = false;
            if !uop.nouserflags {
                for (bit, flagreg) in
                    [(SETFLAG_ZF, REG_ZF), (SETFLAG_CF, REG_CF), (SETFLAG_OF, REG_OF)]
                {
                    if uop.setflags & bit != 0 {
                        let old = self.spec_rrt.get(flagreg);
                        self.prf.unref(old);
                        self.spec_rrt.set(flagreg, physreg);
                        self.prf.addref(physreg);
                    }
                }
                renamed_flags = uop.setflags != 0;
            }

            if br && uop.branch_hints & BRANCH_HINT_CALL != 0 {
                let ripafter = self.rob.entries[robidx].predinfo.ripafter;
                let mut predinfo = self.rob.entries[robidx].predinfo;
                self.branchpred.borrow_mut().updateras(&mut predinfo, ripafter);
                self.rob.entries[robidx].predinfo = predinfo;
            }

            self.frontend_counters.renamed_none += (!renamed_reg && !renamed_flags) as u64;
            self.frontend_counters.renamed_reg += (renamed_reg && !renamed_flags) as u64;
            self.frontend_counters.renamed_flags += (!renamed_reg && renamed_flags) as u64;
            self.frontend_counters.renamed_reg_and_flags += (renamed_reg && renamed_flags) as u64;

            debug!(
                "{:>10} rename rob {:<3} r{:<3} <= {}",
                self.rob.entries[robidx].uuid,
                robidx,
                physreg,
                uop
            );

            prepcount += 1;
        }

        self.frontend_counters.width_histogram[prepcount] += 1;
    }

    //
    // Frontend delay stage: a fixed number of cycles between rename and
    // dispatch eligibility.
    //

    fn cycle_frontend(&mut self) {
        let mut cursor = self.rob.lists.frontend.head();
        while let Some(idx) = cursor {
            cursor = self.rob.entries[idx].link.next_index();
            if self.rob.entries[idx].cycles_left <= 0 {
                self.rob.entries[idx].cycles_left = -1;
                self.rob.set_state(idx, RobState::ReadyToDispatch);
            }
            self.rob.entries[idx].cycles_left -= 1;
        }
    }

    //
    // Dispatch and cluster selection
    //

    fn executable_cluster_mask(&self, opcode: Opcode) -> u32 {
        let fu = opinfo(opcode).fu;
        let mut mask = 0;
        for (i, cl) in self.clusters.iter().enumerate() {
            if cl.fu_mask & fu != 0 {
                mask |= 1 << i;
            }
        }
        mask
    }

    fn select_cluster(&mut self, robidx: usize) -> Option<usize> {
        if self.cluster_count() == 1 {
            self.dispatch_counters.cluster_histogram[0] += 1;
            return Some(0);
        }

        let opcode = self.rob.entries[robidx].uop.opcode;
        let mut executable = self.executable_cluster_mask(opcode);
        debug_assert!(executable != 0);

        // prefer the cluster where most operands are being produced
        let mut tally = vec![0usize; self.cluster_count()];
        for operand in self.rob.entries[robidx].operands {
            let reg = self.prf.get(operand);
            if matches!(reg.state, PhysRegState::Used | PhysRegState::Ready) {
                if let Some((producer, uuid)) = reg.producer {
                    let producer = producer as usize;
                    if self.rob.entries[producer].entry_valid
                        && self.rob.entries[producer].uuid == uuid
                        && self.rob.entries[producer].cluster >= 0
                    {
                        tally[self.rob.entries[producer].cluster as usize] += 1;
                    }
                }
            }
        }

        let mut avail_mask = 0u32;
        for (i, iq) in self.issue_queues.iter().enumerate() {
            if iq.remaining() > 0 {
                avail_mask |= 1 << i;
            }
        }
        executable &= avail_mask;
        if executable == 0 {
            self.dispatch_counters.cluster_none_avail += 1;
            return None;
        }

        let mut cluster = find_random_set_bit(executable, self.sim_cycle);
        let mut best = 0usize;
        for i in 0..self.cluster_count() {
            if tally[i] > best && executable & (1 << i) != 0 {
                best = tally[i];
                cluster = i;
            }
        }

        self.dispatch_counters.cluster_histogram[cluster] += 1;
        Some(cluster)
    }

    fn ready_state_for(&self, robidx: usize) -> RobState {
        let entry = &self.rob.entries[robidx];
        let cl = entry.cluster as u8;
        if isload(entry.uop.opcode) {
            RobState::ReadyToLoad(cl)
        } else if isstore(entry.uop.opcode) {
            RobState::ReadyToStore(cl)
        } else {
            RobState::ReadyToIssue(cl)
        }
    }

    /// Locate the source operands of a uop and insert it into its cluster's
    /// issue queue, tagging the operands whose producers are still in
    /// flight. Returns the number of operands that must still be waited on.
    fn find_sources(&mut self, robidx: usize) -> usize {
        let mut uopids = [0 as RobIndex; MAX_OPERANDS];
        let mut preready = [false; MAX_OPERANDS];
        let mut operands_still_needed = 0;

        let operands = self.rob.entries[robidx].operands;
        for (op, &source) in operands.iter().enumerate() {
            let reg = self.prf.get(source);
            if reg.state == PhysRegState::Used {
                let (producer, uuid) = reg.producer.expect("in-flight register has no producer");
                debug_assert!(self.rob.entries[producer as usize].uuid == uuid);
                uopids[op] = producer;
                operands_still_needed += 1;
            } else {
                preready[op] = true;
            }
        }
        // count operand sources by producer state, for the stats tree
        for &source in &operands {
            if source != PHYS_REG_NULL {
                let state = self.prf.get(source).state;
                match state {
                    PhysRegState::Used => self.prf.lists.used.dispatch_source_counter += 1,
                    PhysRegState::Ready => self.prf.lists.ready.dispatch_source_counter += 1,
                    PhysRegState::Written => self.prf.lists.written.dispatch_source_counter += 1,
                    PhysRegState::Arch => self.prf.lists.arch.dispatch_source_counter += 1,
                    _ => {}
                }
            }
        }

        // First-phase stores may issue before the data to store is ready;
        // the second phase re-arms the real dependency.
        let entry = &self.rob.entries[robidx];
        if isstore(entry.uop.opcode) && !entry.load_store_second_phase {
            preready[RC] = true;
        }

        let cl = entry.cluster as usize;
        let ok = self.issue_queues[cl].insert(robidx as RobIndex, &uopids, &preready);
        debug_assert!(ok, "issue queue full on insert after cluster selection");

        operands_still_needed
    }

    fn cycle_dispatch(&mut self) {
        let mut dispatchcount = 0usize;
        let mut cursor = self.rob.lists.ready_to_dispatch.head();

        while let Some(idx) = cursor {
            if dispatchcount >= self.dispatch_width {
                break;
            }
            cursor = self.rob.entries[idx].link.next_index();

            let cluster = match self.select_cluster(idx) {
                Some(cl) => cl,
                // all candidate issue queues full: dispatch is in order, so
                // stall the whole stage for this cycle
                None => break,
            };
            self.rob.entries[idx].cluster = cluster as i8;

            let operands_still_needed = self.find_sources(idx);
            let state = if operands_still_needed > 0 {
                RobState::Dispatched(cluster as u8)
            } else {
                self.ready_state_for(idx)
            };
            self.rob.set_state(idx, state);

            debug!(
                "{:>10} disptc rob {:<3} to cluster {}",
                self.rob.entries[idx].uuid, idx, self.clusters[cluster].name
            );

            dispatchcount += 1;
        }

        self.dispatch_counters.width_histogram[dispatchcount] += 1;
    }

    //
    // Issue
    //

    fn operand_ready(&self, robidx: usize, operand: usize) -> bool {
        self.prf
            .get(self.rob.entries[robidx].operands[operand])
            .ready()
    }

    /// Recirculate an issued uop back to the dispatched state in its already
    /// assigned issue queue slot, re-arming its dependencies. Sending it all
    /// the way back to dispatch could deadlock when the queue is full.
    fn replay(&mut self, robidx: usize) {
        let mut uopids = [0 as RobIndex; MAX_OPERANDS];
        let mut preready = [false; MAX_OPERANDS];
        let mut operands_still_needed = 0;

        for (op, &source) in self.rob.entries[robidx].operands.iter().enumerate() {
            let reg = self.prf.get(source);
            if reg.state == PhysRegState::Used {
                let (producer, _) = reg.producer.expect("in-flight register has no producer");
                uopids[op] = producer;
                operands_still_needed += 1;
            } else {
                preready[op] = true;
            }
        }

        let state = if operands_still_needed > 0 {
            RobState::Dispatched(self.rob.entries[robidx].cluster as u8)
        } else {
            self.ready_state_for(robidx)
        };
        self.rob.set_state(robidx, state);

        let cl = self.rob.entries[robidx].cluster as usize;
        let slot = self.rob.entries[robidx].iqslot;
        debug_assert!(slot >= 0);
        self.issue_queues[cl].replay(slot as usize, &uopids, &preready);
    }

    fn release_iq_slot(&mut self, robidx: usize) {
        let cl = self.rob.entries[robidx].cluster as usize;
        let slot = self.rob.entries[robidx].iqslot;
        debug_assert!(slot >= 0);
        self.issue_queues[cl].release(slot as usize);
        self.rob.entries[robidx].iqslot = -1;
    }

    fn cycle_issue(&mut self, cluster: usize) {
        let mut issuecount = 0usize;
        let maxwidth = self.clusters[cluster].issue_width;

        while issuecount < maxwidth {
            let slot = match self.issue_queues[cluster].issue() {
                Some(slot) => slot,
                None => break,
            };
            let robidx = self.issue_queues[cluster].uopof(slot) as usize;
            debug_assert!(self.rob.entries[robidx].entry_valid);
            self.rob.entries[robidx].iqslot = slot as i16;

            let rc = self.issue_one(robidx);
            issuecount += 1;
            // a replay or misspeculation ends issue for this cluster
            if rc <= 0 {
                break;
            }
        }

        let hist = &mut self.issue_counters.width_histogram[cluster];
        let bucket = issuecount.min(hist.len() - 1);
        hist[bucket] += 1;
    }

    fn issue_one(&mut self, robidx: usize) -> i32 {
        let uop = self.rob.entries[robidx].uop;
        let cluster = self.rob.entries[robidx].cluster as usize;
        let info = opinfo(uop.opcode);

        let executable_on_fu = info.fu & self.clusters[cluster].fu_mask & self.fu_avail;
        if executable_on_fu == 0 {
            // out of units this cycle; revert the slot and retry later
            self.issue_counters.result_no_fu += 1;
            let slot = self.rob.entries[robidx].iqslot;
            self.issue_queues[cluster].replay_slot(slot as usize);
            return ISSUE_NEEDS_REPLAY;
        }

        self.issue_counters.total_uops += 1;

        let fu = executable_on_fu.trailing_zeros() as u8;
        self.fu_avail &= !(1 << fu);
        self.rob.entries[robidx].fu = fu;
        self.rob.entries[robidx].cycles_left = info.latency as i16;
        self.rob.set_state(robidx, RobState::Issued(cluster as u8));

        let operands = self.rob.entries[robidx].operands;
        let ra = self.prf.get(operands[RA]);
        let rb = self.prf.get(operands[RB]);
        let rc = self.prf.get(operands[RC]);

        let input = IssueInput {
            ra: ra.data,
            rb: if uop.rb == REG_IMM { uop.rbimm as u64 } else { rb.data },
            rc: if uop.rc == REG_IMM { uop.rcimm as u64 } else { rc.data },
            raflags: ra.flags,
            rbflags: if uop.rb == REG_IMM { 0 } else { rb.flags },
            rcflags: if uop.rc == REG_IMM { 0 } else { rc.flags },
            cond: uop.cond,
            size: uop.size,
        };

        let ld = isload(uop.opcode);
        let st = isstore(uop.opcode);
        let br = isbranch(uop.opcode);

        debug_assert!(self.operand_ready(robidx, RA));
        if uop.rb != REG_IMM {
            debug_assert!(self.operand_ready(robidx, RB));
        }
        if (!st || self.rob.entries[robidx].load_store_second_phase) && uop.rc != REG_IMM {
            debug_assert!(self.operand_ready(robidx, RC));
        }
        if !st {
            debug_assert!(self.operand_ready(robidx, RS));
        }

        for (op, &source) in operands.iter().enumerate() {
            if source == PHYS_REG_NULL {
                continue;
            }
            if (op == RB && uop.rb == REG_IMM) || (op == RC && uop.rc == REG_IMM) {
                continue;
            }
            let state = self.prf.get(source).state;
            match state {
                PhysRegState::Ready => self.prf.lists.ready.issue_source_counter += 1,
                PhysRegState::Written => self.prf.lists.written.issue_source_counter += 1,
                PhysRegState::Arch => self.prf.lists.arch.issue_source_counter += 1,
                _ => {}
            }
        }

        let mut state = IssueState::default();

        if (input.raflags | input.rbflags | input.rcflags) & FLAG_INV != 0 {
            // poisoned sources: mark the output invalid, skip execution
            state.rddata = EXC_PROPAGATE;
            state.rdflags = FLAG_INV;
        } else if ld || st {
            self.issue_counters.opclass_histogram[opclass_index(info.opclass)] += 1;
            let rcready = self.operand_ready(robidx, RC);
            let completed = if ld {
                self.issueload(robidx, &input)
            } else {
                self.issuestore(robidx, &input, rcready)
            };
            if completed == ISSUE_MISSPECULATED {
                self.issue_counters.result_misspeculation += 1;
                return ISSUE_MISSPECULATED;
            }
            let lsq_idx = self.rob.entries[robidx].lsq.unwrap() as usize;
            let lsq_entry = self.lsq.entries[lsq_idx];
            state.rddata = lsq_entry.data;
            state.rdflags = (if lsq_entry.invalid { FLAG_INV } else { 0 })
                | (if !lsq_entry.datavalid { FLAG_WAIT } else { 0 });
            if completed == ISSUE_NEEDS_REPLAY {
                self.issue_counters.result_replay += 1;
                return ISSUE_NEEDS_REPLAY;
            }
        } else if br {
            self.issue_counters.opclass_histogram[opclass_index(info.opclass)] += 1;
            state.riptaken = uop.riptaken;
            state.ripseq = uop.ripseq;
            (self.rob.entries[robidx].synthop)(&input, &mut state);
            if !isbarrier(uop.opcode) && !self.mem.borrow().asp.check(state.rddata, PROT_EXEC) {
                state.rdflags |= FLAG_INV;
                state.rddata = EXC_PAGE_FAULT_EXEC;
            }
        } else {
            self.issue_counters.opclass_histogram[opclass_index(info.opclass)] += 1;
            (self.rob.entries[robidx].synthop)(&input, &mut state);
        }

        let physreg = self.rob.entries[robidx].physreg;
        {
            let reg = self.prf.get_mut(physreg);
            reg.flags = state.rdflags;
            reg.data = state.rddata;
        }

        if !self.prf.get(physreg).valid() {
            // Exceptions go straight to the commit queue, bypassing
            // writeback; dependents keep waiting until annulment resolves
            // them. Fetch is stalled until the fault is handled.
            self.rob.entries[robidx].cycles_left = 0;
            self.rob.set_state(robidx, RobState::ReadyToCommit);
            self.fetch_control.borrow_mut().stall_frontend = true;
        }

        let mispredicted = br && self.prf.get(physreg).data != uop.riptaken;

        debug!(
            "{:>10} issue  rob {:<3} on {}: r{} = {:#x} flags {:#x}",
            self.rob.entries[robidx].uuid,
            robidx,
            FU_NAMES[fu as usize],
            physreg,
            state.rddata,
            state.rdflags
        );

        // Beyond the point of no return: the slot cannot be replayed now,
        // though the uop may still be annulled.
        self.release_iq_slot(robidx);

        if self.prf.get(physreg).valid() {
            if br {
                let bptype = self.rob.entries[robidx].predinfo.bptype;
                let cond = bptype & BRANCH_HINT_COND != 0;
                let indir = bptype & BRANCH_HINT_INDIRECT != 0;
                let ret = bptype & BRANCH_HINT_RET != 0;

                if mispredicted {
                    self.issue_counters.branchpred_cond_mispred += cond as u64;
                    self.issue_counters.branchpred_indir_mispred += (indir && !ret) as u64;
                    self.issue_counters.branchpred_return_mispred += ret as u64;
                    self.issue_counters.branchpred_total_mispred += 1;

                    let realrip = self.prf.get(physreg).data;

                    debug!(
                        "{:>10} misprd rob {:<3}: real {:#x} vs predicted {:#x}",
                        self.rob.entries[robidx].uuid, robidx, realrip, uop.riptaken
                    );

                    // The branch itself is retained: it already produced the
                    // correct target, so only younger uops are discarded.
                    self.annul_after(robidx);
                    self.redirect_fetch(realrip);
                    self.issue_counters.result_branch_mispredict += 1;
                    return ISSUE_MISSPECULATED;
                }
                self.issue_counters.branchpred_cond_correct += cond as u64;
                self.issue_counters.branchpred_indir_correct += (indir && !ret) as u64;
                self.issue_counters.branchpred_return_correct += ret as u64;
                self.issue_counters.branchpred_total_correct += 1;
            }
            self.issue_counters.result_complete += 1;
        } else {
            self.issue_counters.result_exception += 1;
        }

        ISSUE_COMPLETED
    }

    //
    // Memory operation address generation and checks
    //

    fn check_access(
        &self,
        addr: u64,
        prot: u8,
        annul: bool,
        sizeshift: u8,
        internal: bool,
        exception: u64,
    ) -> u64 {
        if addr & ((1u64 << sizeshift) - 1) != 0 {
            return EXC_UNALIGNED;
        }
        // A split access whose high half covers no user bytes may legally
        // touch an unmapped page; do not check further.
        if annul || internal {
            return 0;
        }
        if self.mem.borrow().asp.fastcheck(addr, prot) {
            0
        } else {
            exception
        }
    }

    fn gen_addr(&self, input: &IssueInput, uop: &Uop, is_load: bool) -> (u64, u64, bool) {
        let mut raddr = input.ra.wrapping_add(input.rb);
        if is_load && uop.aligntype == AlignType::Normal {
            raddr = raddr.wrapping_add(input.rc << uop.extshift);
        }
        raddr &= self.virt_addr_mask;
        let origaddr = raddr;
        let mut annul = false;
        match uop.aligntype {
            AlignType::Normal => {}
            AlignType::Lo => {
                raddr &= !7;
            }
            AlignType::Hi => {
                raddr &= !7;
                annul = ((origaddr + ((1u64 << uop.size) - 1)) & !7u64) == raddr;
                raddr += 8;
            }
        }
        (raddr & self.virt_addr_mask, origaddr, annul)
    }

    /// First phase: generate the address, establish the store's forwarding
    /// entry and find the previous store to inherit from. Second phase: all
    /// operands ready, merge and produce the final data and bytemask.
    fn issuestore(&mut self, robidx: usize, input: &IssueInput, rcready: bool) -> i32 {
        let uop = self.rob.entries[robidx].uop;
        let sizeshift = uop.size;
        let aligntype = uop.aligntype;
        let second_phase = self.rob.entries[robidx].load_store_second_phase;

        let (addr, origaddr, annul) = self.gen_addr(input, &uop, false);

        let lsq_idx = self.rob.entries[robidx].lsq.unwrap() as usize;
        let my_seq = self.lsq.entries[lsq_idx].seq;
        let my_physaddr = addr >> 3;
        {
            let entry = &mut self.lsq.entries[lsq_idx];
            entry.physaddr = my_physaddr;
            entry.invalid = false;
            entry.datavalid = false;
            entry.addrvalid = true;
        }

        self.store_counters.type_aligned +=
            (!uop.internal && aligntype == AlignType::Normal) as u64;
        self.store_counters.type_unaligned +=
            (!uop.internal && aligntype != AlignType::Normal) as u64;
        self.store_counters.type_internal += uop.internal as u64;
        self.store_counters.size[sizeshift as usize] += 1;

        let exception = self.check_access(
            addr,
            PROT_WRITE,
            annul,
            if aligntype == AlignType::Normal { sizeshift } else { 3 },
            uop.internal,
            EXC_PAGE_FAULT_WRITE,
        );
        if exception != 0 {
            {
                let entry = &mut self.lsq.entries[lsq_idx];
                entry.invalid = true;
                entry.data = exception;
                entry.datavalid = true;
            }
            debug!(
                "{:>10} store{} rob {:<3} @ {:#x}: exception {}",
                self.rob.entries[robidx].uuid,
                if second_phase { "2" } else { " " },
                robidx,
                addr,
                exception_name(exception)
            );
            if exception == EXC_UNALIGNED {
                // Evict and re-split the containing block, then restart
                // fetch at this store so it re-executes in aligned halves.
                self.fetch_control.borrow_mut().invalidate = Some(self.rob.entries[robidx].rip);
                let recovery_rip = self.annul_after_and_including(robidx);
                self.redirect_fetch(recovery_rip);
                self.store_counters.issue_unaligned += 1;
                return ISSUE_MISSPECULATED;
            }
            self.store_counters.issue_exception += 1;
            return ISSUE_COMPLETED;
        }

        // Find the most recent prior store to the same block. A prior store
        // with an unresolved address is conservatively assumed to match.
        let mut sfra: Option<usize> = None;
        for i in self.lsq.backward_before(my_seq).collect::<Vec<_>>() {
            let stbuf = self.lsq.entries[i];
            if stbuf.store && (!stbuf.addrvalid || stbuf.physaddr == my_physaddr) {
                sfra = Some(i);
                break;
            }
        }

        let inherit_ready = match sfra {
            None => true,
            Some(i) => {
                let s = self.lsq.entries[i];
                s.addrvalid && s.datavalid
            }
        };

        if !(inherit_ready && rcready) {
            // wait on the located store through the synthetic rs operand
            let target = match sfra {
                Some(i) => {
                    let producer_rob = self.lsq.entries[i].rob as usize;
                    self.rob.entries[producer_rob].physreg
                }
                None => PHYS_REG_NULL,
            };
            let old = self.rob.entries[robidx].operands[RS];
            self.prf.unref(old);
            self.rob.entries[robidx].operands[RS] = target;
            self.prf.addref(target);

            self.store_counters.issue_replay_sfr_not_ready += (!inherit_ready) as u64;
            self.store_counters.issue_replay_data_to_store_not_ready += (!rcready) as u64;

            self.replay(robidx);
            self.rob.entries[robidx].load_store_second_phase = true;
            return ISSUE_NEEDS_REPLAY;
        }

        // Any later load with a valid matching address has already read
        // stale data: annul from this store onward and remember the load.
        for i in self.lsq.forward_after(my_seq).collect::<Vec<_>>() {
            let ldbuf = self.lsq.entries[i];
            if !ldbuf.store && ldbuf.addrvalid && ldbuf.physaddr == my_physaddr {
                {
                    let entry = &mut self.lsq.entries[lsq_idx];
                    entry.invalid = true;
                    entry.data = EXC_LD_ST_ALIASING;
                    entry.datavalid = true;
                }
                let load_rip = self.rob.entries[ldbuf.rob as usize].rip;
                debug!(
                    "{:>10} store{} rob {:<3} @ {:#x}: aliased with load at {:#x}",
                    self.rob.entries[robidx].uuid,
                    if second_phase { "2" } else { " " },
                    robidx,
                    addr,
                    load_rip
                );
                self.lsap.insert(load_rip);
                self.annul_after_and_including(robidx);
                self.redirect_fetch(self.rob.entries[robidx].rip);
                self.store_counters.issue_ordering += 1;
                return ISSUE_MISSPECULATED;
            }
        }

        // All operands resolved: merge with any inherited bytes
        let low = (origaddr & 7) as u32;
        let full: u32 = (1u32 << (1u32 << sizeshift)) - 1;
        let (bytemask, rc_shifted) = match aligntype {
            AlignType::Normal | AlignType::Lo => (
                ((full << low) & 0xff) as u8,
                input.rc.checked_shl(8 * low).unwrap_or(0),
            ),
            AlignType::Hi => (
                ((full >> (8 - low)) & 0xff) as u8,
                input.rc.checked_shr(8 * (8 - low)).unwrap_or(0),
            ),
        };

        {
            let sfra_entry = sfra.map(|i| self.lsq.entries[i]);
            let entry = &mut self.lsq.entries[lsq_idx];
            entry.invalid = false;
            entry.data = match sfra_entry {
                Some(s) => mux64(bytemask, s.data, rc_shifted),
                None => rc_shifted,
            };
            entry.bytemask = match sfra_entry {
                Some(s) => s.bytemask | bytemask,
                None => bytemask,
            };
            entry.datavalid = true;
        }

        self.store_counters.forward_from_zero += sfra.is_none() as u64;
        self.store_counters.forward_from_sfr += sfra.is_some() as u64;

        debug!(
            "{:>10} store{} rob {:<3} @ {:#x} <= {:#x} mask {:#04x}",
            self.rob.entries[robidx].uuid,
            if second_phase { "2" } else { " " },
            robidx,
            addr,
            self.lsq.entries[lsq_idx].data,
            self.lsq.entries[lsq_idx].bytemask
        );

        self.rob.entries[robidx].load_store_second_phase = true;
        self.store_counters.issue_complete += 1;
        ISSUE_COMPLETED
    }

    fn issueload(&mut self, robidx: usize, input: &IssueInput) -> i32 {
        let uop = self.rob.entries[robidx].uop;
        let sizeshift = uop.size;
        let aligntype = uop.aligntype;
        let signext = uop.opcode == Opcode::LDX;
        let second_phase = self.rob.entries[robidx].load_store_second_phase;

        let (addr, origaddr, annul) = self.gen_addr(input, &uop, true);

        let lsq_idx = self.rob.entries[robidx].lsq.unwrap() as usize;
        let my_seq = self.lsq.entries[lsq_idx].seq;
        let my_physaddr = addr >> 3;
        {
            let entry = &mut self.lsq.entries[lsq_idx];
            entry.physaddr = my_physaddr;
            entry.addrvalid = false;
            entry.datavalid = false;
            entry.invalid = false;
        }

        self.load_counters.type_aligned += (!uop.internal && aligntype == AlignType::Normal) as u64;
        self.load_counters.type_unaligned +=
            (!uop.internal && aligntype != AlignType::Normal) as u64;
        self.load_counters.type_internal += uop.internal as u64;
        self.load_counters.size[sizeshift as usize] += 1;

        let exception = self.check_access(
            addr,
            PROT_READ,
            annul,
            if aligntype == AlignType::Normal { sizeshift } else { 3 },
            uop.internal,
            EXC_PAGE_FAULT_READ,
        );
        if exception != 0 {
            {
                let entry = &mut self.lsq.entries[lsq_idx];
                entry.invalid = true;
                entry.data = exception;
                entry.datavalid = true;
            }
            debug!(
                "{:>10} load{}  rob {:<3} @ {:#x}: exception {}",
                self.rob.entries[robidx].uuid,
                if second_phase { "2" } else { " " },
                robidx,
                addr,
                exception_name(exception)
            );
            if exception == EXC_UNALIGNED {
                self.fetch_control.borrow_mut().invalidate = Some(self.rob.entries[robidx].rip);
                let recovery_rip = self.annul_after_and_including(robidx);
                self.redirect_fetch(recovery_rip);
                self.load_counters.issue_unaligned += 1;
                return ISSUE_MISSPECULATED;
            }
            self.load_counters.issue_exception += 1;
            return ISSUE_COMPLETED;
        }

        // The alias predictor forces this load to wait on any prior store
        // with an unresolved address, even without an address match.
        let predicted_alias = self.lsap.contains(self.rob.entries[robidx].rip);

        let mut sfra: Option<usize> = None;
        for i in self.lsq.backward_before(my_seq).collect::<Vec<_>>() {
            let stbuf = self.lsq.entries[i];
            if !stbuf.store {
                continue;
            }
            if (predicted_alias && !stbuf.addrvalid)
                || (stbuf.addrvalid && stbuf.physaddr == my_physaddr)
            {
                self.load_counters.dependency_predicted_alias_unresolved +=
                    predicted_alias as u64;
                self.load_counters.dependency_stq_address_match += (!predicted_alias) as u64;
                sfra = Some(i);
                break;
            }
        }
        self.load_counters.dependency_independent += sfra.is_none() as u64;

        let ready = match sfra {
            None => true,
            Some(i) => {
                let s = self.lsq.entries[i];
                s.addrvalid && s.datavalid
            }
        };

        if !ready {
            let i = sfra.unwrap();
            let producer_rob = self.lsq.entries[i].rob as usize;
            let target = self.rob.entries[producer_rob].physreg;
            let old = self.rob.entries[robidx].operands[RS];
            self.prf.unref(old);
            self.rob.entries[robidx].operands[RS] = target;
            self.prf.addref(target);

            debug!(
                "{:>10} load{}  rob {:<3} @ {:#x}: wait on store rob {}",
                self.rob.entries[robidx].uuid,
                if second_phase { "2" } else { " " },
                robidx,
                addr,
                producer_rob
            );

            self.load_counters.issue_replay_sfr_not_ready += 1;
            self.replay(robidx);
            self.rob.entries[robidx].load_store_second_phase = true;
            return ISSUE_NEEDS_REPLAY;
        }

        self.lsq.entries[lsq_idx].addrvalid = true;

        let sfra_entry = sfra.map(|i| self.lsq.entries[i]);
        let data;
        if aligntype == AlignType::Hi {
            if annul {
                // no bytes needed from the high half; use only the low data
                // already checked and forwarded by the companion uop
                let offset = (origaddr & 7) as usize;
                let entry = &mut self.lsq.entries[lsq_idx];
                entry.data = extract_bytes(input.rc, 0, offset, sizeshift, signext);
                entry.invalid = false;
                entry.datavalid = true;
                self.rob.entries[robidx].cycles_left = self.load_latency as i16;
                self.rob.entries[robidx].load_store_second_phase = true;
                self.load_counters.issue_complete += 1;
                return ISSUE_COMPLETED;
            }
            let block = self.mem.borrow().asp.read_block(addr & !7);
            let hi = match sfra_entry {
                Some(s) => mux64(s.bytemask, block, s.data),
                None => block,
            };
            let offset = (origaddr & 7) as usize;
            data = extract_bytes(input.rc, hi, offset, sizeshift, signext);
        } else {
            let block = self.mem.borrow().asp.read_block(addr & !7);
            let merged = match sfra_entry {
                Some(s) => mux64(s.bytemask, block, s.data),
                None => block,
            };
            data = extract_bytes(merged, 0, (addr & 7) as usize, sizeshift, signext);
        }

        let requested_mask = if aligntype == AlignType::Normal {
            ((((1u32 << (1u32 << sizeshift)) - 1) << (addr & 7)) & 0xff) as u8
        } else {
            0xff
        };
        let covered = match sfra_entry {
            Some(s) => (s.bytemask & requested_mask) == requested_mask,
            None => false,
        };
        self.load_counters.forward_from_cache += sfra.is_none() as u64;
        self.load_counters.forward_from_sfr += (sfra.is_some() && covered) as u64;
        self.load_counters.forward_from_sfr_and_cache += (sfra.is_some() && !covered) as u64;

        {
            let entry = &mut self.lsq.entries[lsq_idx];
            entry.data = data;
            entry.invalid = false;
            entry.bytemask = 0xff;
        }

        // a forwarding entry covering every requested byte satisfies the
        // load without the cache
        let l1_hit = covered || self.mem.borrow_mut().caches.probe_dcache(addr);
        if l1_hit {
            self.rob.entries[robidx].cycles_left = self.load_latency as i16;
            self.rob.entries[robidx].load_store_second_phase = true;
            self.lsq.entries[lsq_idx].datavalid = true;
            debug!(
                "{:>10} load{}  rob {:<3} @ {:#x} = {:#x}",
                self.rob.entries[robidx].uuid,
                if second_phase { "2" } else { " " },
                robidx,
                addr,
                data
            );
            self.load_counters.issue_complete += 1;
            self.load_counters.hit_l1 += 1;
            return ISSUE_COMPLETED;
        }

        self.load_counters.issue_miss += 1;
        self.rob.entries[robidx].cycles_left = 0;
        self.rob.set_state(robidx, RobState::CacheMiss);

        let lfrq_slot = self
            .mem
            .borrow_mut()
            .caches
            .dcache
            .issueload_slowpath(robidx as RobIndex, addr);
        match lfrq_slot {
            Some(slot) => {
                self.rob.entries[robidx].lfrq_slot = slot as i16;
                debug!(
                    "{:>10} ldmiss rob {:<3} @ {:#x}: miss to fill slot {}",
                    self.rob.entries[robidx].uuid, robidx, addr, slot
                );
                ISSUE_COMPLETED
            }
            None => {
                self.load_counters.issue_replay_missbuf_full += 1;
                self.lsq.entries[lsq_idx].addrvalid = false;
                self.replay(robidx);
                ISSUE_NEEDS_REPLAY
            }
        }
    }

    /// The cache has delivered a missed load: wake the entry and make its
    /// result available for forwarding.
    pub fn loadwakeup(&mut self, robidx: usize) {
        if !self.rob.entries[robidx].entry_valid
            || self.rob.entries[robidx].state != RobState::CacheMiss
        {
            return;
        }
        let physreg = self.rob.entries[robidx].physreg;
        self.prf.get_mut(physreg).flags &= !FLAG_WAIT;
        self.prf.set_state(physreg, PhysRegState::Ready);

        if let Some(lsq_idx) = self.rob.entries[robidx].lsq {
            self.lsq.entries[lsq_idx as usize].datavalid = true;
        }

        let cluster = self.rob.entries[robidx].cluster as u8;
        self.rob.set_state(robidx, RobState::Completed(cluster));
        let entry = &mut self.rob.entries[robidx];
        entry.cycles_left = 0;
        entry.lfrq_slot = -1;
        entry.forward_cycle = 0;
        entry.fu = 0;
        debug!("{:>10} ldwake rob {:<3}", entry.uuid, robidx);
    }

    //
    // Complete, transfer, writeback
    //

    fn cycle_complete(&mut self, cluster: usize) {
        let mut cursor = self.rob.lists.issued[cluster].head();
        while let Some(idx) = cursor {
            cursor = self.rob.entries[idx].link.next_index();
            self.rob.entries[idx].cycles_left -= 1;
            if self.rob.entries[idx].cycles_left <= 0 {
                self.rob.set_state(idx, RobState::Completed(cluster as u8));
                let physreg = self.rob.entries[idx].physreg;
                self.prf.set_state(physreg, PhysRegState::Ready);
                self.rob.entries[idx].forward_cycle = 0;
                self.rob.entries[idx].fu = 0;
            }
        }
    }

    /// Broadcast a completed result to the issue queues of every cluster
    /// reachable at the current forwarding cycle.
    fn forward(&mut self, robidx: usize) {
        let cluster = self.rob.entries[robidx].cluster as usize;
        let forward_cycle = self.rob.entries[robidx].forward_cycle as usize;
        debug_assert!(forward_cycle <= self.max_forwarding_latency as usize);
        let targets = self.forward_lut[cluster][forward_cycle];
        for i in 0..self.cluster_count() {
            if targets & (1 << i) != 0 {
                self.issue_queues[i].broadcast(robidx as RobIndex);
            }
        }
    }

    fn cycle_transfer(&mut self, cluster: usize) {
        let mut cursor = self.rob.lists.completed[cluster].head();
        while let Some(idx) = cursor {
            cursor = self.rob.entries[idx].link.next_index();
            self.forward(idx);
            self.rob.entries[idx].forward_cycle += 1;
            if self.rob.entries[idx].forward_cycle > self.max_forwarding_latency {
                self.rob.entries[idx].forward_cycle = self.max_forwarding_latency;
                self.rob
                    .set_state(idx, RobState::ReadyToWriteback(cluster as u8));
            }
        }
    }

    fn cycle_writeback(&mut self, cluster: usize) {
        let mut writecount = 0usize;
        let mut cursor = self.rob.lists.ready_to_writeback[cluster].head();
        while let Some(idx) = cursor {
            if writecount >= self.writeback_width {
                break;
            }
            cursor = self.rob.entries[idx].link.next_index();

            // catch dependents scheduled while the producer sat here
            self.forward(idx);

            let physreg = self.rob.entries[idx].physreg;
            self.prf.set_state(physreg, PhysRegState::Written);
            self.rob.entries[idx].cycles_left = -1;
            self.rob.set_state(idx, RobState::ReadyToCommit);

            debug!(
                "{:>10} write  rob {:<3} ({}) r{}",
                self.rob.entries[idx].uuid, idx, self.clusters[cluster].name, physreg
            );

            writecount += 1;
            self.writeback_counters.total += 1;
        }
        self.writeback_counters.width_histogram[cluster][writecount] += 1;
    }

    //
    // Commit
    //

    fn cycle_commit(&mut self) -> CommitResult {
        // sweep registers whose last reference has gone away
        let pending = self.prf.lists.pendingfree.indices(&self.prf.regs);
        for idx in pending {
            if !self.prf.get(idx as PhysRegIndex).referenced() {
                self.prf.free(idx as PhysRegIndex);
                self.commit_counters.freereg_recycled += 1;
            }
        }

        let mut commitcount = 0usize;
        let mut rc = CommitResult::Ok;

        while commitcount < self.commit_width {
            rc = self.commit_one();
            if rc == CommitResult::Ok {
                commitcount += 1;
                self.last_commit_at_cycle = self.sim_cycle;
                if self.total_user_insns_committed >= self.stop_at_user_insns {
                    self.commit_counters.result_stop += 1;
                    rc = CommitResult::Stop;
                    break;
                }
            } else {
                break;
            }
        }

        self.commit_counters.width_histogram[commitcount] += 1;
        rc
    }

    fn commit_one(&mut self) -> CommitResult {
        if self.rob.is_empty() {
            self.commit_counters.result_none += 1;
            return CommitResult::None;
        }

        let head = self.rob.head_index();
        if self.rob.entries[head].uop.som {
            self.bytes_in_current_insn_to_commit = self.rob.entries[head].uop.bytes;
        }

        // No uop of a macro-op commits until all of them can, and any
        // exception in the range covers the whole macro-op.
        let mut all_ready = true;
        let mut macro_op_has_exception = false;
        let mut j = head;
        loop {
            let sub = &self.rob.entries[j];
            if !sub.entry_valid || sub.state != RobState::ReadyToCommit {
                all_ready = false;
                break;
            }
            if !self.prf.get(sub.physreg).valid() {
                self.ctx.borrow_mut().exception = self.prf.get(sub.physreg).data;
                macro_op_has_exception = true;
                break;
            }
            if sub.uop.eom {
                break;
            }
            j = self.rob.wrap_forward(j);
        }

        if !all_ready {
            self.commit_counters.result_none += 1;
            return CommitResult::None;
        }

        let uop = self.rob.entries[head].uop;
        let uuid = self.rob.entries[head].uuid;
        let rip = self.rob.entries[head].rip;
        let physreg = self.rob.entries[head].physreg;
        let ld = isload(uop.opcode);
        let st = isstore(uop.opcode);

        self.commit_counters.opclass_histogram[opclass_index(opinfo(uop.opcode).opclass)] += 1;

        if macro_op_has_exception {
            let exception = self.ctx.borrow().exception;
            if uop.opcode == Opcode::CHK && exception == EXC_SKIPBLOCK {
                self.chk_recovery_rip = self.ctx.borrow().commitarf[REG_RIP as usize]
                    + self.bytes_in_current_insn_to_commit as u64;
                self.commit_counters.result_exception_skipblock += 1;
            } else {
                self.commit_counters.result_exception += 1;
            }
            debug!(
                "{:>10} except rob {:<3}: {}",
                uuid,
                head,
                exception_name(exception)
            );
            self.total_uops_committed += 1;
            self.total_user_insns_committed += 1;
            return CommitResult::Exception;
        }

        if st {
            let lsq_idx = self.rob.entries[head].lsq.unwrap() as usize;
            debug_assert!(
                self.lsq.entries[lsq_idx].addrvalid && self.lsq.entries[lsq_idx].datavalid
            );
        }

        let old_physreg = self.commit_rrt.get(uop.rd);

        debug_assert!(archdest_can_rename(uop.rd));
        self.prf.unref(old_physreg);
        self.commit_rrt.set(uop.rd, physreg);
        self.prf.addref(physreg);

        if uop.eom {
            let mut ctx = self.ctx.borrow_mut();
            if uop.rd == REG_RIP {
                ctx.commitarf[REG_RIP as usize] = self.prf.get(physreg).data;
            } else {
                ctx.commitarf[REG_RIP as usize] += self.bytes_in_current_insn_to_commit as u64;
            }
        }

        if !uop.nouserflags {
            let mut flagmask = 0u16;
            if uop.setflags & SETFLAG_ZF != 0 {
                flagmask |= FLAG_ZF | FLAG_SF;
            }
            if uop.setflags & SETFLAG_CF != 0 {
                flagmask |= FLAG_CF;
            }
            if uop.setflags & SETFLAG_OF != 0 {
                flagmask |= FLAG_OF;
            }
            {
                let mut ctx = self.ctx.borrow_mut();
                let flags = ctx.commitarf[REG_FLAGS as usize] as u16;
                ctx.commitarf[REG_FLAGS as usize] =
                    ((flags & !flagmask) | (self.prf.get(physreg).flags & flagmask)) as u64;
            }
            self.commit_counters.flags_set += (uop.setflags != 0) as u64;
            self.commit_counters.flags_unset += (uop.setflags == 0) as u64;

            for (bit, flagreg) in
                [(SETFLAG_ZF, REG_ZF), (SETFLAG_CF, REG_CF), (SETFLAG_OF, REG_OF)]
            {
                if uop.setflags & bit != 0 {
                    let old = self.commit_rrt.get(flagreg);
                    self.prf.unref(old);
                    self.commit_rrt.set(flagreg, physreg);
                    self.prf.addref(physreg);
                }
            }
        }

        if st {
            let lsq_idx = self.rob.entries[head].lsq.unwrap() as usize;
            let entry = self.lsq.entries[lsq_idx];
            self.mem.borrow_mut().commitstore(&entry);
            debug!(
                "{:>10} commit rob {:<3} store @ {:#x} mask {:#04x} = {:#x}",
                uuid,
                head,
                entry.physaddr << 3,
                entry.bytemask,
                entry.data
            );
        }

        if ld || st {
            let lsq_idx = self.rob.entries[head].lsq.unwrap() as usize;
            self.lsq.commit(lsq_idx);
        }

        debug_assert!(self.prf.get(old_physreg).state == PhysRegState::Arch);
        if old_physreg != PHYS_REG_NULL {
            if self.prf.get(old_physreg).referenced() {
                self.prf.set_state(old_physreg, PhysRegState::PendingFree);
                self.commit_counters.freereg_pending += 1;
            } else {
                self.prf.free(old_physreg);
                self.commit_counters.freereg_free += 1;
            }
        }

        self.prf.set_state(physreg, PhysRegState::Arch);

        // operand registers no longer pin speculative state
        for operand in self.rob.entries[head].operands {
            self.prf.unref(operand);
        }

        if isbranch(uop.opcode) {
            debug_assert!(uop.eom);
            // the "branch address" is the rip of the next sequential
            // instruction, as the predictor keys on it
            let branch_addr = rip + self.bytes_in_current_insn_to_commit as u64;
            let real_rip = self.ctx.borrow().commitarf[REG_RIP as usize];
            let taken = real_rip != branch_addr;
            let predtaken = uop.riptaken != branch_addr;
            let predinfo = self.rob.entries[head].predinfo;
            self.branchpred.borrow_mut().update(
                &predinfo,
                branch_addr,
                real_rip,
                taken,
                predtaken,
                taken == predtaken,
            );
        }

        debug!(
            "{:>10} commit rob {:<3} r{:<3} {} -> {}",
            uuid,
            head,
            physreg,
            uop,
            arch_reg_name(uop.rd)
        );

        if uop.eom {
            self.total_user_insns_committed += 1;
        }
        self.total_uops_committed += 1;

        self.rob.set_state(head, RobState::Free);
        self.rob.commit_head(head);

        if isbarrier(uop.opcode) {
            // resume after the assist at the instruction past the barrier
            self.ctx.borrow_mut().commitarf[REG_SR1 as usize] =
                rip + self.bytes_in_current_insn_to_commit as u64;
            self.commit_counters.result_barrier += 1;
            return CommitResult::Barrier;
        }

        self.commit_counters.result_ok += 1;
        CommitResult::Ok
    }

    //
    // Annulment and recovery
    //

    pub fn annul_after(&mut self, robidx: usize) -> u64 {
        self.annul(robidx, true)
    }

    pub fn annul_after_and_including(&mut self, robidx: usize) -> u64 {
        self.annul(robidx, false)
    }

    /// Discard every speculative uop after (and optionally including) the
    /// macro-op containing the trigger. The speculative rename table is
    /// rebuilt from the committed table by replaying the rename effects of
    /// the surviving in-flight uops.
    fn annul(&mut self, robidx: usize, keep_misspec_uop: bool) -> u64 {
        // macro-op boundaries around the trigger
        let mut somidx = robidx;
        while !self.rob.entries[somidx].uop.som {
            somidx = self.rob.wrap_backward(somidx);
        }
        let mut eomidx = robidx;
        while !self.rob.entries[eomidx].uop.eom {
            eomidx = self.rob.wrap_forward(eomidx);
        }

        if keep_misspec_uop {
            debug_assert!(eomidx == robidx);
        }

        let startidx = if keep_misspec_uop {
            self.rob.wrap_forward(eomidx)
        } else {
            somidx
        };
        if startidx == self.rob.tail_index() {
            // the trigger was the youngest uop; nothing to annul
            return self.rob.entries[robidx].rip;
        }
        let endidx = self.rob.wrap_backward(self.rob.tail_index());

        debug!(
            "{:>10} annul  rob {:<3}: from rob {} to rob {}",
            self.rob.entries[robidx].uuid, robidx, startidx, endidx
        );

        // pass 1: pull annulled entries out of the issue queues
        let mut idx = endidx;
        loop {
            let cluster = self.rob.entries[idx].cluster;
            if cluster >= 0 {
                self.issue_queues[cluster as usize].annuluop(idx as RobIndex);
            }
            self.rob.entries[idx].iqslot = -1;
            if idx == startidx {
                break;
            }
            idx = self.rob.wrap_backward(idx);
        }

        // pass 2: rebuild the speculative rename table at the annul point
        for i in 0..TRANSREG_COUNT {
            self.prf.unref(self.spec_rrt.get(i as ArchReg));
        }
        self.spec_rrt.copy_from(&self.commit_rrt);
        for i in 0..TRANSREG_COUNT {
            self.prf.addref(self.spec_rrt.get(i as ArchReg));
        }

        let mut idx = self.rob.head_index();
        while idx != startidx {
            self.pseudocommit(idx);
            idx = self.rob.wrap_forward(idx);
        }

        // pass 3: free the annulled entries, youngest first
        let mut idx = endidx;
        loop {
            for operand in self.rob.entries[idx].operands {
                self.prf.unref(operand);
            }
            let physreg = self.rob.entries[idx].physreg;
            debug_assert!(!self.prf.get(physreg).referenced());
            self.prf.free(physreg);

            if let Some(lsq_idx) = self.rob.entries[idx].lsq {
                self.lsq.annul(lsq_idx as usize);
            }

            let lfrq_slot = self.rob.entries[idx].lfrq_slot;
            if lfrq_slot >= 0 {
                self.mem
                    .borrow_mut()
                    .caches
                    .dcache
                    .annul_lfrq_slot(lfrq_slot as usize);
            }

            let uop = self.rob.entries[idx].uop;
            if isbranch(uop.opcode)
                && uop.branch_hints & (BRANCH_HINT_CALL | BRANCH_HINT_RET) != 0
            {
                let predinfo = self.rob.entries[idx].predinfo;
                self.branchpred.borrow_mut().annulras(&predinfo);
            }

            self.rob.set_state(idx, RobState::Free);
            self.rob.annul_tail(idx);

            if idx == startidx {
                break;
            }
            idx = self.rob.wrap_backward(idx);
        }

        if keep_misspec_uop {
            self.rob.entries[startidx].uop.riptaken
        } else {
            self.rob.entries[startidx].rip
        }
    }

    /// Replay the rename-table effects of a surviving in-flight uop, as if
    /// it had committed; no other state is touched.
    fn pseudocommit(&mut self, robidx: usize) {
        let uop = self.rob.entries[robidx].uop;
        let physreg = self.rob.entries[robidx].physreg;

        if archdest_can_rename(uop.rd) {
            self.prf.unref(self.spec_rrt.get(uop.rd));
            self.spec_rrt.set(uop.rd, physreg);
            self.prf.addref(physreg);
        }

        if !uop.nouserflags {
            for (bit, flagreg) in
                [(SETFLAG_ZF, REG_ZF), (SETFLAG_CF, REG_CF), (SETFLAG_OF, REG_OF)]
            {
                if uop.setflags & bit != 0 {
                    self.prf.unref(self.spec_rrt.get(flagreg));
                    self.spec_rrt.set(flagreg, physreg);
                    self.prf.addref(physreg);
                }
            }
        }
    }

    //
    // Flush and state exchange
    //

    /// Reset every in-flight structure at once; architectural register data
    /// and predictor tables survive.
    pub fn flush_pipeline(&mut self, rip: u64) {
        self.mem.borrow_mut().dcache_complete();
        self.redirect_fetch(rip);
        self.rob.reset();
        self.lsq.reset();
        for iq in &mut self.issue_queues {
            iq.reset();
        }
        self.prf.reset();
        let arch_base = self.prf.arch_base;
        self.spec_rrt.reset(arch_base);
        self.commit_rrt.reset(arch_base);
        for i in 0..TRANSREG_COUNT {
            self.prf.addref(self.spec_rrt.get(i as ArchReg));
        }
        for i in 0..TRANSREG_COUNT {
            self.prf.addref(self.commit_rrt.get(i as ArchReg));
        }
        self.fu_avail = (1u32 << FU_COUNT) - 1;
    }

    /// Copy guest register values into the committed physical registers.
    pub fn external_to_core_state(&mut self) {
        let ctx = self.ctx.borrow();
        for i in 0..ARCHREG_COUNT {
            let physreg = self.commit_rrt.get(i as ArchReg);
            let reg = self.prf.get_mut(physreg);
            reg.data = ctx.commitarf[i];
            reg.flags = 0;
        }
        let flags_reg = self.commit_rrt.get(REG_FLAGS);
        self.prf.get_mut(flags_reg).flags =
            (ctx.commitarf[REG_FLAGS as usize] as u16) & FLAG_USER;
    }

    /// Copy committed physical register values back to the guest context.
    pub fn core_to_external_state(&mut self) {
        let mut ctx = self.ctx.borrow_mut();
        let rip = ctx.commitarf[REG_RIP as usize];
        let flags = ctx.commitarf[REG_FLAGS as usize];
        for i in 0..ARCHREG_COUNT {
            ctx.commitarf[i] = self.prf.get(self.commit_rrt.get(i as ArchReg)).data;
        }
        ctx.commitarf[REG_RIP as usize] = rip;
        ctx.commitarf[REG_FLAGS as usize] = flags;
    }

    //
    // Consistency checks (debug builds)
    //

    pub fn check_refcounts(&self) {
        let mut expected = vec![0i16; self.prf.regs.len()];
        for idx in self.rob.forward_indices() {
            for operand in self.rob.entries[idx].operands {
                expected[operand as usize] += 1;
            }
        }
        for i in 0..TRANSREG_COUNT {
            expected[self.commit_rrt.get(i as ArchReg) as usize] += 1;
            expected[self.spec_rrt.get(i as ArchReg) as usize] += 1;
        }
        expected[PHYS_REG_NULL as usize] = 0;

        let mut errors = false;
        for (i, reg) in self.prf.regs.iter().enumerate() {
            if reg.refcount != expected[i] {
                error!(
                    "r{} refcount is {} but should be {}",
                    i, reg.refcount, expected[i]
                );
                errors = true;
            }
        }
        if errors {
            self.dump_state();
            panic!("physical register refcount mismatch");
        }
    }

    pub fn check_physreg_lists(&self) {
        let mut total = 0;
        for state in crate::backend::physical_register::PhysRegLists::all_states() {
            let list = self.prf.lists.list(state);
            total += list.count();
            for idx in list.indices(&self.prf.regs) {
                debug_assert!(
                    self.prf.regs[idx].state == state,
                    "r{} state does not match containing list {}",
                    idx,
                    list.name
                );
            }
        }
        debug_assert!(total == self.prf.regs.len());
    }

    pub fn check_rob(&self) {
        for (i, entry) in self.rob.entries.iter().enumerate() {
            if !entry.entry_valid {
                debug_assert!(
                    entry.state == RobState::Free,
                    "rob {} invalid but in list {}",
                    i,
                    self.rob.lists.list(entry.state).name
                );
                continue;
            }
            debug_assert!(
                (entry.forward_cycle as usize) <= self.max_forwarding_latency as usize,
                "rob {} forward_cycle out of range",
                i
            );
        }
        for list in self.rob.lists.all_lists() {
            for idx in list.indices(&self.rob.entries) {
                let entry = &self.rob.entries[idx];
                debug_assert!(
                    std::ptr::eq(self.rob.lists.list(entry.state), list),
                    "rob {} state does not match containing list {}",
                    idx,
                    list.name
                );
            }
        }
    }

    pub fn dump_state(&self) {
        error!("speculative rename table:");
        for line in self.spec_rrt.dump_lines() {
            error!("{}", line);
        }
        error!("committed rename table:");
        for line in self.commit_rrt.dump_lines() {
            error!("{}", line);
        }
        error!(
            "rob: head {} tail {} ({} entries)",
            self.rob.head,
            self.rob.tail,
            self.rob.size()
        );
        for idx in self.rob.forward_indices() {
            let entry = &self.rob.entries[idx];
            error!(
                "  rob {:<3} uuid {:<8} {:<18} cl {} r{:<3} {}",
                idx,
                entry.uuid,
                self.rob.lists.list(entry.state).name,
                entry.cluster,
                entry.physreg,
                entry.uop
            );
        }
        error!(
            "lsq: head {} tail {} ({} entries)",
            self.lsq.head,
            self.lsq.tail,
            self.lsq.size()
        );
        for idx in self.lsq.forward_indices() {
            let e = &self.lsq.entries[idx];
            error!(
                "  {}{:<3} rob {:<3} addr {:#x} A{} D{} I{} mask {:#04x} data {:#x}",
                if e.store { "st" } else { "ld" },
                idx,
                e.rob,
                e.physaddr << 3,
                e.addrvalid as u8,
                e.datavalid as u8,
                e.invalid as u8,
                e.bytemask,
                e.data
            );
        }
        for (i, iq) in self.issue_queues.iter().enumerate() {
            error!("issue queue {} ({}):", i, self.clusters[i].name);
            for line in iq.dump_lines() {
                error!("{}", line);
            }
        }
        for state in crate::backend::physical_register::PhysRegLists::all_states() {
            let list = self.prf.lists.list(state);
            if list.count() > 0 {
                error!(
                    "physreg {} ({}): {:?}",
                    list.name,
                    list.count(),
                    list.indices(&self.prf.regs)
                );
            }
        }
    }

    pub fn deadlocked(&self, threshold: u64) -> bool {
        if self.sim_cycle - self.last_commit_at_cycle > threshold {
            warn!(
                "no commit for {} cycles at cycle {}; the pipeline may be deadlocked",
                self.sim_cycle - self.last_commit_at_cycle,
                self.sim_cycle
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_random_set_bit_in_mask() {
        for seed in 0..32u64 {
            for mask in [0b1u32, 0b1010, 0b1111, 0x80000001] {
                let bit = find_random_set_bit(mask, seed);
                assert!(mask & (1 << bit) != 0);
            }
        }
    }

    #[test]
    fn test_lsap_round_robin() {
        let mut lsap = LoadStoreAliasPredictor::new(2);
        lsap.insert(0x10);
        lsap.insert(0x20);
        assert!(lsap.contains(0x10) && lsap.contains(0x20));
        lsap.insert(0x30);
        assert!(!lsap.contains(0x10));
        assert!(lsap.contains(0x20) && lsap.contains(0x30));
        // duplicates do not evict
        lsap.insert(0x30);
        assert!(lsap.contains(0x20));
    }
}
