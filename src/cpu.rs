use std::cell::RefCell;
use std::rc::Rc;

use log::{info, LevelFilter};

use crate::backend::backend::{Backend, CommitResult};
use crate::config::{CoreConfig, SimError, SimOptions};
use crate::frontend::branch_predictor::{BimodalPredictor, BranchPredictor};
use crate::frontend::fetch::{Decoder, FetchControl, FetchQueue, FetchUnit};
use crate::logger;
use crate::memory_subsystem::memory_subsystem::MemorySubsystem;
use crate::stats::{StatsNode, StatsStore};
use crate::uop::*;

const DEADLOCK_CYCLES: u64 = 1024;

/// The guest-visible machine state: one value per architectural register,
/// plus the pending exception code while a fault is being delivered.
pub struct Context {
    pub commitarf: [u64; TRANSREG_COUNT],
    pub exception: u64,
}

impl Context {
    pub fn new() -> Context {
        Context {
            commitarf: [0; TRANSREG_COUNT],
            exception: 0,
        }
    }
}

pub struct Cpu {
    opts: SimOptions,
    pub ctx: Rc<RefCell<Context>>,
    pub mem: Rc<RefCell<MemorySubsystem>>,
    fetch_control: Rc<RefCell<FetchControl>>,
    branchpred: Rc<RefCell<dyn BranchPredictor>>,
    pub frontend: FetchUnit,
    pub backend: Backend,
    pub stats: StatsStore,
    snapshot_id: u64,
    entry_rip: u64,
    pub exit_requested: bool,
}

impl Cpu {
    pub fn new(
        config: &CoreConfig,
        opts: &SimOptions,
        decoder: Rc<dyn Decoder>,
    ) -> Result<Cpu, SimError> {
        if !opts.ooo || opts.allseq {
            return Err(SimError::Unsupported(
                "only the out-of-order core is available",
            ));
        }
        if opts.profonly {
            return Err(SimError::Unsupported("native profiling is not available"));
        }
        if opts.trigger || opts.excludeld || opts.startrepeat > 1 || opts.forceseq != u64::MAX {
            info!("trace-entry options are accepted but have no effect without a host process");
        }

        let fetchq = Rc::new(RefCell::new(FetchQueue::new(config.fetchq_size)));
        let fetch_control = Rc::new(RefCell::new(FetchControl::new()));
        let mem = Rc::new(RefCell::new(MemorySubsystem::new(
            config,
            opts.perfect_cache,
        )));
        let ctx = Rc::new(RefCell::new(Context::new()));
        let branchpred: Rc<RefCell<dyn BranchPredictor>> =
            Rc::new(RefCell::new(BimodalPredictor::new()));

        let frontend = FetchUnit::new(
            config,
            opts,
            Rc::clone(&fetchq),
            Rc::clone(&fetch_control),
            Rc::clone(&mem),
            Rc::clone(&branchpred),
            Rc::clone(&decoder),
        );

        let backend = Backend::new(
            config,
            opts,
            Rc::clone(&fetchq),
            Rc::clone(&fetch_control),
            Rc::clone(&mem),
            Rc::clone(&branchpred),
            Rc::clone(&ctx),
        )?;

        Ok(Cpu {
            opts: opts.clone(),
            ctx,
            mem,
            fetch_control,
            branchpred,
            frontend,
            backend,
            stats: StatsStore::new(),
            snapshot_id: 0,
            entry_rip: decoder.entry_point(),
            exit_requested: false,
        })
    }

    pub fn run(&mut self) -> Result<(), SimError> {
        let start_rip = self.opts.startrip.unwrap_or(self.entry_rip);
        self.ctx.borrow_mut().commitarf[REG_RIP as usize] = start_rip;
        self.backend.flush_pipeline(start_rip);
        self.backend.external_to_core_state();

        info!("starting out-of-order core at rip {:#x}", start_rip);

        let mut iterations: u64 = 0;
        let mut insns_at_last_flush: u64 = 0;
        let base_level = logger::level_for(self.opts.loglevel);
        let mut current_level = base_level;

        while iterations < self.opts.stop
            && self.backend.total_user_insns_committed < self.opts.stopinsns
        {
            if self.fetch_control.borrow().stop_requested || self.exit_requested {
                break;
            }

            let wanted = if iterations >= self.opts.startlog {
                LevelFilter::Debug
            } else if iterations >= self.opts.shortlog {
                LevelFilter::Info
            } else {
                base_level
            };
            if wanted != current_level {
                log::set_max_level(wanted);
                current_level = wanted;
            }

            if self.backend.deadlocked(DEADLOCK_CYCLES) {
                self.backend.dump_state();
                return Err(SimError::Deadlock(
                    self.backend.sim_cycle - self.backend.last_commit_at_cycle,
                ));
            }

            // cache fills land before any pipeline stage runs
            let events = self.mem.borrow_mut().do_cycle();
            for rob in events.load_fills {
                self.backend.loadwakeup(rob as usize);
            }
            if events.icache_fill.is_some() {
                self.frontend.icache_filled();
            }

            let commitrc = self.backend.do_cycle();
            self.frontend.do_cycle();
            self.backend.clock_issue_queues();

            if cfg!(debug_assertions) {
                self.backend.check_rob();
                self.backend.check_physreg_lists();
                self.backend.check_refcounts();
            }

            match commitrc {
                CommitResult::Barrier => {
                    if !self.handle_barrier()? {
                        break;
                    }
                }
                CommitResult::Exception => self.handle_exception()?,
                CommitResult::Stop => break,
                _ => {}
            }

            if self.opts.snapshot != u64::MAX
                && self.backend.sim_cycle > 0
                && self.backend.sim_cycle % self.opts.snapshot == 0
            {
                let root = self.capture_stats();
                self.stats.record(self.snapshot_id.to_string(), root);
                self.snapshot_id += 1;
            }

            if self.opts.flushevery != u64::MAX
                && self.backend.total_user_insns_committed - insns_at_last_flush
                    >= self.opts.flushevery
            {
                let rip = self.ctx.borrow().commitarf[REG_RIP as usize];
                self.backend.core_to_external_state();
                self.backend.flush_pipeline(rip);
                self.backend.external_to_core_state();
                insns_at_last_flush = self.backend.total_user_insns_committed;
            }

            iterations += 1;
            self.backend.sim_cycle += 1;
        }

        self.backend.core_to_external_state();

        let root = self.capture_stats();
        self.stats.record("final".to_string(), root);
        if let Some(path) = self.opts.stats.clone() {
            self.stats.write(&path)?;
        }

        if let Some(path) = self.opts.dumpcode.clone() {
            let rip = self.ctx.borrow().commitarf[REG_RIP as usize];
            if let Some(listing) = self.frontend.block_listing(rip) {
                std::fs::write(path, listing)?;
            }
        }

        Ok(())
    }

    /// A committed barrier hands control to the matching host assist, then
    /// the whole pipeline restarts at the post-assist rip.
    fn handle_barrier(&mut self) -> Result<bool, SimError> {
        self.branchpred.borrow_mut().flush();
        self.backend.core_to_external_state();

        let assist_id = self.ctx.borrow().commitarf[REG_RIP as usize];
        info!(
            "barrier: assist {} ({}) at cycle {}",
            assist_id,
            assist_name(assist_id),
            self.backend.sim_cycle
        );

        let keep_running = self.run_assist(assist_id);

        {
            let mut ctx = self.ctx.borrow_mut();
            let next = ctx.commitarf[REG_SR1 as usize];
            ctx.commitarf[REG_RIP as usize] = next;
        }
        let rip = self.ctx.borrow().commitarf[REG_RIP as usize];
        self.backend.flush_pipeline(rip);
        self.backend.external_to_core_state();

        Ok(keep_running)
    }

    fn run_assist(&mut self, assist_id: u64) -> bool {
        match assist_id {
            ASSIST_EXIT => {
                self.exit_requested = true;
                false
            }
            ASSIST_PRINT => {
                let value = self.ctx.borrow().commitarf[REG_RAX as usize];
                println!("{}", value);
                true
            }
            _ => true,
        }
    }

    fn handle_exception(&mut self) -> Result<(), SimError> {
        self.branchpred.borrow_mut().flush();
        self.backend.core_to_external_state();

        let exception = self.ctx.borrow().exception;
        if exception == EXC_SKIPBLOCK {
            // the check uop asked to skip the rest of the block: advance and
            // resume, no guest-visible fault
            let rip = self.backend.chk_recovery_rip;
            self.ctx.borrow_mut().commitarf[REG_RIP as usize] = rip;
            self.backend.flush_pipeline(rip);
            self.backend.external_to_core_state();
            return Ok(());
        }

        let rip = self.ctx.borrow().commitarf[REG_RIP as usize];
        self.backend.dump_state();
        Err(SimError::GuestException(exception_name(exception), rip))
    }

    pub fn capture_stats(&self) -> StatsNode {
        let mut root = StatsNode::new();
        let cycles = self.backend.sim_cycle.max(1);

        let summary = root.node("summary");
        summary.add("cycles", self.backend.sim_cycle);
        summary.add("commits", self.backend.total_uops_committed);
        summary.add("usercommits", self.backend.total_user_insns_committed);
        summary.add("issues", self.backend.issue_counters.total_uops);
        let ipc = summary.node("ipc");
        ipc.addfloat(
            "commit-in-uops",
            self.backend.total_uops_committed as f64 / cycles as f64,
        );
        ipc.addfloat(
            "commit-in-user-insns",
            self.backend.total_user_insns_committed as f64 / cycles as f64,
        );
        ipc.addfloat(
            "issue-in-uops",
            self.backend.issue_counters.total_uops as f64 / cycles as f64,
        );

        let fc = &self.frontend.counters;
        let fetch = root.node("fetch");
        let stop = fetch.node("stop");
        stop.add("icache-miss", fc.stop_icache_miss);
        stop.add("fetchq-full", fc.stop_fetchq_full);
        stop.add("bogus-rip", fc.stop_bogus_rip);
        stop.add("branch-taken", fc.stop_branch_taken);
        stop.add("full-width", fc.stop_full_width);
        fetch.add("blocks", fc.blocks_fetched);
        fetch.add("uops", fc.uops_fetched);
        fetch.add("user-insns", fc.user_insns_fetched);
        fetch.add_histogram("width", &fc.width_histogram);
        fetch.add_named_histogram("opclass", &OPCLASS_NAMES, &fc.opclass_histogram);
        let bbcache = fetch.node("bbcache");
        bbcache.add("count", self.frontend.bbcache_count() as u64);
        bbcache.add("inserts", fc.bbcache_inserts);
        bbcache.add("removes", fc.bbcache_removes);

        let rc = &self.backend.frontend_counters;
        let frontend = root.node("frontend");
        let status = frontend.node("status");
        status.add("complete", rc.status_complete);
        status.add("fetchq-empty", rc.status_fetchq_empty);
        status.add("rob-full", rc.status_rob_full);
        status.add("physregs-full", rc.status_physregs_full);
        status.add("ldq-full", rc.status_ldq_full);
        status.add("stq-full", rc.status_stq_full);
        let renamed = frontend.node("renamed");
        renamed.add("none", rc.renamed_none);
        renamed.add("reg", rc.renamed_reg);
        renamed.add("flags", rc.renamed_flags);
        renamed.add("reg-and-flags", rc.renamed_reg_and_flags);
        let alloc = frontend.node("alloc");
        alloc.add("reg", rc.alloc_reg);
        alloc.add("ldreg", rc.alloc_ldreg);
        alloc.add("sfr", rc.alloc_sfr);
        alloc.add("br", rc.alloc_br);
        frontend.add_histogram("width", &rc.width_histogram);

        let dc = &self.backend.dispatch_counters;
        let dispatch = root.node("dispatch");
        let source = dispatch.node("source");
        source.add("waiting", self.backend.prf.lists.used.dispatch_source_counter);
        source.add("bypass", self.backend.prf.lists.ready.dispatch_source_counter);
        source.add(
            "physreg",
            self.backend.prf.lists.written.dispatch_source_counter,
        );
        source.add("archreg", self.backend.prf.lists.arch.dispatch_source_counter);
        let cluster = dispatch.node("cluster");
        for (i, cl) in self.backend.clusters.iter().enumerate() {
            cluster.add(&cl.name, dc.cluster_histogram[i]);
        }
        cluster.add("none", dc.cluster_none_avail);
        dispatch.add_histogram("width", &dc.width_histogram);

        let ic = &self.backend.issue_counters;
        let issue = root.node("issue");
        let result = issue.node("result");
        result.add("no-fu", ic.result_no_fu);
        result.add("replay", ic.result_replay);
        result.add("misspeculation", ic.result_misspeculation);
        result.add("branch-mispredict", ic.result_branch_mispredict);
        result.add("exception", ic.result_exception);
        result.add("complete", ic.result_complete);
        let source = issue.node("source");
        source.add("bypass", self.backend.prf.lists.ready.issue_source_counter);
        source.add("physreg", self.backend.prf.lists.written.issue_source_counter);
        source.add("archreg", self.backend.prf.lists.arch.issue_source_counter);
        let width = issue.node("width");
        for (i, cl) in self.backend.clusters.iter().enumerate() {
            width.add_histogram(&cl.name, &ic.width_histogram[i]);
        }
        issue.add_named_histogram("opclass", &OPCLASS_NAMES, &ic.opclass_histogram);

        let sc = &self.backend.store_counters;
        let store = root.node("store");
        let stype = store.node("type");
        stype.add("aligned", sc.type_aligned);
        stype.add("unaligned", sc.type_unaligned);
        stype.add("internal", sc.type_internal);
        store.add_histogram("size", &sc.size);
        let sissue = store.node("issue");
        sissue.add("replay-sfr-not-ready", sc.issue_replay_sfr_not_ready);
        sissue.add(
            "replay-data-to-store-not-ready",
            sc.issue_replay_data_to_store_not_ready,
        );
        sissue.add("unaligned", sc.issue_unaligned);
        sissue.add("exception", sc.issue_exception);
        sissue.add("ordering", sc.issue_ordering);
        sissue.add("complete", sc.issue_complete);
        let sfwd = store.node("forward");
        sfwd.add("zero", sc.forward_from_zero);
        sfwd.add("sfr", sc.forward_from_sfr);

        let lc = &self.backend.load_counters;
        let load = root.node("load");
        let ltype = load.node("type");
        ltype.add("aligned", lc.type_aligned);
        ltype.add("unaligned", lc.type_unaligned);
        ltype.add("internal", lc.type_internal);
        load.add_histogram("size", &lc.size);
        let dep = load.node("dependency");
        dep.add(
            "predicted-alias-unresolved",
            lc.dependency_predicted_alias_unresolved,
        );
        dep.add("stq-address-match", lc.dependency_stq_address_match);
        dep.add("independent", lc.dependency_independent);
        let lissue = load.node("issue");
        lissue.add("replay-sfr-not-ready", lc.issue_replay_sfr_not_ready);
        lissue.add("replay-missbuf-full", lc.issue_replay_missbuf_full);
        lissue.add("unaligned", lc.issue_unaligned);
        lissue.add("exception", lc.issue_exception);
        lissue.add("complete", lc.issue_complete);
        lissue.add("miss", lc.issue_miss);
        load.add("hit-l1", lc.hit_l1);
        let lfwd = load.node("forward");
        lfwd.add("cache", lc.forward_from_cache);
        lfwd.add("sfr", lc.forward_from_sfr);
        lfwd.add("sfr-and-cache", lc.forward_from_sfr_and_cache);

        let wc = &self.backend.writeback_counters;
        let writeback = root.node("writeback");
        writeback.add("total", wc.total);
        let width = writeback.node("width");
        for (i, cl) in self.backend.clusters.iter().enumerate() {
            width.add_histogram(&cl.name, &wc.width_histogram[i]);
        }

        let cc = &self.backend.commit_counters;
        let commit = root.node("commit");
        commit.add("uops", self.backend.total_uops_committed);
        commit.add("userinsns", self.backend.total_user_insns_committed);
        let freereg = commit.node("freereg");
        freereg.add("pending", cc.freereg_pending);
        freereg.add("free", cc.freereg_free);
        commit.add("physreg-recycled", cc.freereg_recycled);
        let result = commit.node("result");
        result.add("none", cc.result_none);
        result.add("ok", cc.result_ok);
        result.add("exception", cc.result_exception);
        result.add("skipblock", cc.result_exception_skipblock);
        result.add("barrier", cc.result_barrier);
        result.add("stop", cc.result_stop);
        let setflags = commit.node("setflags");
        setflags.add("yes", cc.flags_set);
        setflags.add("no", cc.flags_unset);
        commit.add_histogram("width", &cc.width_histogram);
        commit.add_named_histogram("opclass", &OPCLASS_NAMES, &cc.opclass_histogram);

        let bp = self.branchpred.borrow().counters();
        let branchpred = root.node("branchpred");
        let cond = branchpred.node("cond");
        cond.add("correct", ic.branchpred_cond_correct);
        cond.add("mispred", ic.branchpred_cond_mispred);
        let indir = branchpred.node("indirect");
        indir.add("correct", ic.branchpred_indir_correct);
        indir.add("mispred", ic.branchpred_indir_mispred);
        let ret = branchpred.node("return");
        ret.add("correct", ic.branchpred_return_correct);
        ret.add("mispred", ic.branchpred_return_mispred);
        let ras = branchpred.node("ras");
        ras.add("push", bp.ras_pushes);
        ras.add("push-overflow", bp.ras_overflows);
        ras.add("pop", bp.ras_pops);
        ras.add("pop-underflows", bp.ras_underflows);
        ras.add("annuls", bp.ras_annuls);
        let summary = branchpred.node("summary");
        summary.add("correct", ic.branchpred_total_correct);
        summary.add("mispred", ic.branchpred_total_mispred);
        branchpred.add("predictions", bp.predictions);
        branchpred.add("updates", bp.updates);

        let mem = self.mem.borrow();
        let caches = &mem.caches;
        let dcache = root.node("dcache");
        dcache.add("load-hits", caches.load_hits);
        dcache.add("load-misses", caches.load_misses);
        let icache = root.node("icache");
        icache.add("hits", caches.icache_hits);
        icache.add("misses", caches.icache_misses);

        root
    }
}
