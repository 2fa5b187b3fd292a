mod backend;
mod config;
mod cpu;
mod frontend;
mod loader;
mod logger;
mod memory_subsystem;
mod stats;
mod uop;

#[cfg(test)]
mod core_tests;

use std::path::PathBuf;
use std::process;
use std::rc::Rc;

use clap::Parser;

use crate::config::{load_core_config, CoreConfig, SimError, SimOptions};
use crate::cpu::Cpu;
use crate::loader::ProgramDecoder;
use crate::uop::REG_RIP;

#[derive(Parser, Debug)]
#[command(
    name = "oosim",
    about = "Cycle-accurate simulator of a clustered out-of-order x86-64-style core",
    long_about = "Runs a micro-op assembly program through the out-of-order core model.\n\
                  Simulation options are read from the program's companion conf file\n\
                  at $HOME/.oosim<absolute-program-path>.conf."
)]
struct Cli {
    /// Micro-op assembly program to simulate
    program: PathBuf,

    /// Machine description YAML (defaults to the built-in machine)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn run(cli: Cli) -> Result<(), SimError> {
    let core_config = match &cli.config {
        Some(path) => load_core_config(path)?,
        None => CoreConfig::default(),
    };
    let opts = SimOptions::load_for(&cli.program)?;

    logger::init(&opts.logfile, opts.loglevel)?;

    let program = Rc::new(loader::load_file(&cli.program)?);
    let decoder = Rc::new(ProgramDecoder::new(Rc::clone(&program)));

    let mut cpu = Cpu::new(&core_config, &opts, decoder)?;
    program.init_memory(&mut cpu.mem.borrow_mut().asp);
    cpu.run()?;

    let cycles = cpu.backend.sim_cycle.max(1);
    println!(
        "completed: {} cycles, {} uops, {} instructions (ipc {:.2}), final rip {:#x}",
        cpu.backend.sim_cycle,
        cpu.backend.total_uops_committed,
        cpu.backend.total_user_insns_committed,
        cpu.backend.total_user_insns_committed as f64 / cycles as f64,
        cpu.ctx.borrow().commitarf[REG_RIP as usize],
    );

    if opts.exitend {
        process::exit(0);
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("oosim: {}", err);
        process::exit(1);
    }
}
