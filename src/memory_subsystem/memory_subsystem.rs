use crate::backend::load_store_queue::LsqEntry;
use crate::config::CoreConfig;
use crate::memory_subsystem::address_space::AddressSpace;
use crate::memory_subsystem::caches::{CacheHierarchy, MemEvents};

pub struct MemorySubsystem {
    pub asp: AddressSpace,
    pub caches: CacheHierarchy,
}

impl MemorySubsystem {
    pub fn new(config: &CoreConfig, perfect_cache: bool) -> MemorySubsystem {
        MemorySubsystem {
            asp: AddressSpace::new(),
            caches: CacheHierarchy::new(
                config.icache_lines,
                config.icache_line_shift,
                config.icache_miss_latency,
                config.dcache_lines,
                config.dcache_line_shift,
                config.lfrq_size,
                config.missbuf_size,
                config.miss_latency,
                perfect_cache,
            ),
        }
    }

    pub fn do_cycle(&mut self) -> MemEvents {
        self.caches.clock()
    }

    /// Write a retiring store to memory. A zero bytemask is legal and writes
    /// nothing (the high half of a split store may cover no user bytes).
    pub fn commitstore(&mut self, lsq: &LsqEntry) {
        debug_assert!(lsq.store && lsq.addrvalid && lsq.datavalid);
        if lsq.bytemask == 0 {
            return;
        }
        let addr = lsq.physaddr << 3;
        self.asp.write_block_masked(addr, lsq.data, lsq.bytemask);
        self.caches.dcache.touch(addr);
    }

    /// Pending fills are completed silently on a pipeline flush; the entries
    /// waiting on them are gone.
    pub fn dcache_complete(&mut self) {
        self.caches.dcache.complete();
    }
}
