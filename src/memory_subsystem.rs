pub(crate) mod address_space;
pub(crate) mod caches;
pub(crate) mod memory_subsystem;
