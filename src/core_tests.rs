use std::rc::Rc;

use crate::config::{CoreConfig, SimError, SimOptions};
use crate::cpu::Cpu;
use crate::loader::{load_from_string, Program, ProgramDecoder};
use crate::uop::*;

struct TestHarness {
    cpu: Cpu,
    program: Rc<Program>,
    result: Result<(), SimError>,
}

impl TestHarness {
    fn run(src: &str) -> TestHarness {
        Self::run_with(src, CoreConfig::default(), Self::test_options())
    }

    fn test_options() -> SimOptions {
        SimOptions {
            // backstop against runaway programs in a broken build
            stop: 50_000,
            ..SimOptions::default()
        }
    }

    fn run_with(src: &str, config: CoreConfig, opts: SimOptions) -> TestHarness {
        let program = Rc::new(load_from_string(src).expect("program should assemble"));
        let decoder = Rc::new(ProgramDecoder::new(Rc::clone(&program)));
        let mut cpu = Cpu::new(&config, &opts, decoder).expect("cpu construction");
        program.init_memory(&mut cpu.mem.borrow_mut().asp);
        let result = cpu.run();
        TestHarness {
            cpu,
            program,
            result,
        }
    }

    fn reg(&self, reg: ArchReg) -> u64 {
        self.cpu.ctx.borrow().commitarf[reg as usize]
    }

    fn assert_reg(&self, reg: ArchReg, expected: u64) {
        assert_eq!(
            self.reg(reg),
            expected,
            "register {} should be {:#x}",
            arch_reg_name(reg),
            expected
        );
    }

    fn data_addr(&self, name: &str) -> u64 {
        self.program
            .data
            .iter()
            .find(|item| item.name == name)
            .expect("data item exists")
            .addr
    }

    fn mem_u64(&self, addr: u64) -> u64 {
        self.cpu.mem.borrow().asp.read_u64(addr)
    }

    fn assert_data(&self, name: &str, expected: u64) {
        let addr = self.data_addr(name);
        assert_eq!(
            self.mem_u64(addr),
            expected,
            "data item '{}' should be {:#x}",
            name,
            expected
        );
    }

    fn assert_completed(&self) {
        assert!(
            self.result.is_ok(),
            "run should complete: {:?}",
            self.result.as_ref().err().map(|e| e.to_string())
        );
    }
}

#[test]
fn test_mov_add_chain() {
    let harness = TestHarness::run(
        r#"
.text
    mov rax, #100
    mov rbx, #10
    add rcx, rax, rbx
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RAX, 100);
    harness.assert_reg(REG_RBX, 10);
    harness.assert_reg(REG_RCX, 110);
}

#[test]
fn test_same_source_and_destination() {
    let harness = TestHarness::run(
        r#"
.text
    mov rax, #5
    add rax, rax, #10
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RAX, 15);
}

#[test]
fn test_logic_ops() {
    let harness = TestHarness::run(
        r#"
.text
    mov rax, #0xf0
    mov rbx, #0x3c
    and rcx, rax, rbx
    or  rdx, rax, rbx
    xor rsi, rax, rbx
    sub rdi, rax, rbx
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RCX, 0x30);
    harness.assert_reg(REG_RDX, 0xfc);
    harness.assert_reg(REG_RSI, 0xcc);
    harness.assert_reg(REG_RDI, 0xb4);
}

#[test]
fn test_conditional_branch_loop() {
    let harness = TestHarness::run(
        r#"
.text
    mov rax, #0
    mov rbx, #0
loop:
    add rax, rax, #1
    add rbx, rbx, rax
    cmp rax, #5
    br.ne loop
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RAX, 5);
    harness.assert_reg(REG_RBX, 15);
    // the loop exit is a mispredict against a warmed-up taken prediction
    assert!(harness.cpu.backend.issue_counters.branchpred_total_mispred >= 1);
}

#[test]
fn test_branch_equal_target_never_annuls() {
    // an always-taken branch is predicted perfectly once the predictor has
    // seen it; run it long enough that correct predictions dominate
    let harness = TestHarness::run(
        r#"
.text
    mov rax, #0
loop:
    add rax, rax, #1
    cmp rax, #50
    br.ne loop
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RAX, 50);
    let ic = &harness.cpu.backend.issue_counters;
    assert!(ic.branchpred_total_correct > ic.branchpred_total_mispred);
}

#[test]
fn test_store_load_forwarding() {
    let harness = TestHarness::run(
        r#"
.data
    x: 0
.text
    mov rax, #42
    st  [#x], rax
    ld  rbx, [#x]
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RBX, 42);
    harness.assert_data("x", 42);
}

#[test]
fn test_store_chain_serializes_per_block() {
    let harness = TestHarness::run(
        r#"
.data
    x: 0
.text
    mov rax, #1
    st  [#x], rax
    mov rbx, #2
    st  [#x], rbx
    ld  rcx, [#x]
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RCX, 2);
    harness.assert_data("x", 2);
}

#[test]
fn test_load_store_aliasing_recovery() {
    // the store's address hangs on a long multiply chain, so the younger
    // load issues first and reads stale data; the store then detects the
    // collision, annuls, trains the alias predictor and re-executes
    let harness = TestHarness::run(
        r#"
.data
    x: 5
.text
    mov rax, #x
    mul rbx, rax, #1
    mul rbx, rbx, #1
    mul rbx, rbx, #1
    st  [rbx], #99
    ld  rcx, [#x]
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RCX, 99);
    harness.assert_data("x", 99);
    let sc = &harness.cpu.backend.store_counters;
    assert!(sc.issue_ordering >= 1, "alias should have been detected");
    assert!(harness.cpu.backend.lsap.contains(crate::loader::CODE_BASE + 5));
}

#[test]
fn test_cache_miss_and_fill() {
    let harness = TestHarness::run(
        r#"
.data
    x: 1234
.text
    ld  rax, [#x]
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RAX, 1234);
    assert!(harness.cpu.backend.load_counters.issue_miss >= 1);
}

#[test]
fn test_perfect_cache_never_misses() {
    let opts = SimOptions {
        perfect_cache: true,
        ..TestHarness::test_options()
    };
    let harness = TestHarness::run_with(
        r#"
.data
    x: 1234
.text
    ld  rax, [#x]
    assist exit
"#,
        CoreConfig::default(),
        opts,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RAX, 1234);
    assert_eq!(harness.cpu.backend.load_counters.issue_miss, 0);
}

#[test]
fn test_unaligned_store_and_load_round_trip() {
    let harness = TestHarness::run(
        r#"
.data
    buf: 0 0
.text
    mov rax, #0x1234567890abcdef
    st  [#buf + #3], rax
    ld  rbx, [#buf + #3]
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RBX, 0x1234_5678_90ab_cdef);
    let buf = harness.data_addr("buf");
    assert_eq!(harness.mem_u64(buf) >> 24, 0x7890_abcd_ef);
    assert!(harness.cpu.backend.store_counters.issue_unaligned >= 1);
    assert!(harness.cpu.backend.load_counters.issue_unaligned >= 1);
}

#[test]
fn test_unaligned_store_at_page_end_high_half_empty() {
    // the two-byte store at offset 0xffd splits; its high half lands on the
    // unmapped next page but covers no bytes, so no fault may be raised
    let harness = TestHarness::run(
        r#"
.data
    base: 0
.text
    mov rax, #0xbeef
    st.w [#base + #0xffd], rax
    ld.w rbx, [#base + #0xffd]
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RBX, 0xbeef);
}

#[test]
fn test_sign_extending_load() {
    let harness = TestHarness::run(
        r#"
.data
    x: 0xff
.text
    ldx.b rax, [#x]
    ld.b  rbx, [#x]
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RAX, u64::MAX);
    harness.assert_reg(REG_RBX, 0xff);
}

#[test]
fn test_call_and_return_through_ras() {
    let harness = TestHarness::run(
        r#"
.text
    mov rbx, #after
    bru.call func
after:
    mov rcx, #7
    assist exit
func:
    jmp.ret rbx
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RCX, 7);
    assert!(harness.cpu.backend.issue_counters.branchpred_return_correct >= 1);
}

#[test]
fn test_chk_skipblock_advances_rip() {
    let harness = TestHarness::run(
        r#"
.text
    mov rax, #1
    cmp rax, #1
    chk.e #skipblock
    mov rbx, #5
    cmp rax, #2
    chk.e #skipblock
    mov rcx, #9
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RBX, 5);
    harness.assert_reg(REG_RCX, 9);
    assert_eq!(
        harness.cpu.backend.commit_counters.result_exception_skipblock,
        1
    );
}

#[test]
fn test_chk_failure_is_a_guest_exception() {
    let harness = TestHarness::run(
        r#"
.text
    mov rax, #1
    cmp rax, #2
    chk.e #checkfailed
    assist exit
"#,
    );
    assert!(matches!(
        harness.result,
        Err(SimError::GuestException("CheckFailed", _))
    ));
}

#[test]
fn test_load_from_unmapped_page_faults() {
    let harness = TestHarness::run(
        r#"
.text
    ld rax, [#0x900000]
    assist exit
"#,
    );
    assert!(matches!(
        harness.result,
        Err(SimError::GuestException("PageFaultOnRead", _))
    ));
}

#[test]
fn test_array_sum_loop() {
    let harness = TestHarness::run(
        r#"
.data
    arr: 1 2 3 4 5 6 7 8
.text
    mov rax, #0
    mov rbx, #arr
    mov rcx, #8
loop:
    ld  rdx, [rbx]
    add rax, rax, rdx
    add rbx, rbx, #8
    sub. rcx, rcx, #1
    br.ne loop
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RAX, 36);
    harness.assert_reg(REG_RCX, 0);
}

#[test]
fn test_print_assist() {
    let harness = TestHarness::run(
        r#"
.text
    mov rax, #77
    assist print
    mov rbx, #3
    assist exit
"#,
    );
    harness.assert_completed();
    // execution resumes after the barrier flush
    harness.assert_reg(REG_RBX, 3);
    assert_eq!(harness.cpu.backend.commit_counters.result_barrier, 2);
}

#[test]
fn test_flush_returns_all_state_to_free() {
    let mut harness = TestHarness::run(
        r#"
.text
    mov rax, #1
    mov rbx, #2
    add rcx, rax, rbx
    assist exit
"#,
    );
    harness.assert_completed();
    let backend = &mut harness.cpu.backend;
    backend.flush_pipeline(0x100000);
    let rob_size = CoreConfig::default().rob_size;
    assert_eq!(backend.rob.lists.free.count(), rob_size);
    assert_eq!(backend.rob.lists.ready_to_commit.count(), 0);
    assert_eq!(backend.lsq.size(), 0);
    // allocatable pool minus the zero register sentinel
    let phys = CoreConfig::default().phys_reg_count;
    assert_eq!(backend.prf.lists.free.count(), phys - 1);
    assert_eq!(backend.prf.lists.arch.count(), ARCHREG_COUNT + 1);
    backend.check_refcounts();
    backend.check_rob();
    // architectural values survive the flush
    harness.assert_reg(REG_RCX, 3);
}

#[test]
fn test_flushevery_stress_preserves_results() {
    let opts = SimOptions {
        flushevery: 3,
        ..TestHarness::test_options()
    };
    let harness = TestHarness::run_with(
        r#"
.text
    mov rax, #0
    mov rbx, #0
loop:
    add rax, rax, #1
    add rbx, rbx, rax
    cmp rax, #6
    br.ne loop
    assist exit
"#,
        CoreConfig::default(),
        opts,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RAX, 6);
    harness.assert_reg(REG_RBX, 21);
}

#[test]
fn test_stopinsns_limits_the_run() {
    let opts = SimOptions {
        stopinsns: 2,
        ..TestHarness::test_options()
    };
    let harness = TestHarness::run_with(
        r#"
.text
    mov rax, #1
    mov rbx, #2
    mov rcx, #3
    mov rdx, #4
    assist exit
"#,
        CoreConfig::default(),
        opts,
    );
    harness.assert_completed();
    assert!(harness.cpu.backend.total_user_insns_committed <= 3);
}

#[test]
fn test_single_cluster_machine() {
    let config = CoreConfig {
        clusters: vec![crate::config::ClusterConfig {
            name: "all".to_string(),
            issue_width: 4,
            fu: vec![
                "alu0".to_string(),
                "alu1".to_string(),
                "fpu0".to_string(),
                "ldu0".to_string(),
                "stu0".to_string(),
            ],
        }],
        intercluster_latency: vec![vec![0]],
        ..CoreConfig::default()
    };
    let harness = TestHarness::run_with(
        r#"
.data
    x: 0
.text
    mov rax, #11
    mul rbx, rax, #3
    st  [#x], rbx
    ld  rcx, [#x]
    assist exit
"#,
        config,
        TestHarness::test_options(),
    );
    harness.assert_completed();
    harness.assert_reg(REG_RCX, 33);
}

#[test]
fn test_mul_latency_dependency_chain() {
    let harness = TestHarness::run(
        r#"
.text
    mov rax, #3
    mul rbx, rax, rax
    mul rcx, rbx, rbx
    add rdx, rcx, #1
    assist exit
"#,
    );
    harness.assert_completed();
    harness.assert_reg(REG_RDX, 82);
}
