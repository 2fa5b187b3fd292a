use std::fmt;
use std::fmt::Display;

pub type PhysRegIndex = u16;
pub type RobIndex = u16;
pub type ArchReg = u8;

pub const MAX_OPERANDS: usize = 4;
pub const RA: usize = 0;
pub const RB: usize = 1;
pub const RC: usize = 2;
pub const RS: usize = 3;

//
// Architectural register space. The first ARCHREG_COUNT entries are visible
// guest state; the rest exist only during translation and renaming.
//
pub const ARCHREG_COUNT: usize = 64;
pub const TRANSREG_COUNT: usize = 80;

pub const REG_RAX: ArchReg = 0;
pub const REG_RCX: ArchReg = 1;
pub const REG_RDX: ArchReg = 2;
pub const REG_RBX: ArchReg = 3;
pub const REG_RSP: ArchReg = 4;
pub const REG_RBP: ArchReg = 5;
pub const REG_RSI: ArchReg = 6;
pub const REG_RDI: ArchReg = 7;
// r8..r15 are REG_RAX+8 .. REG_RAX+15
pub const REG_XMML0: ArchReg = 16;
pub const REG_XMMH0: ArchReg = 32;
pub const REG_FPTOS: ArchReg = 48;
pub const REG_RIP: ArchReg = 56;
pub const REG_FLAGS: ArchReg = 57;
pub const REG_SR0: ArchReg = 58;
pub const REG_SR1: ArchReg = 59;
pub const REG_SR2: ArchReg = 60;

pub const REG_TEMP0: ArchReg = 64;
// temp1..temp7 are REG_TEMP0+1 .. REG_TEMP0+7
pub const REG_ZF: ArchReg = 72;
pub const REG_CF: ArchReg = 73;
pub const REG_OF: ArchReg = 74;
pub const REG_IMM: ArchReg = 75;
pub const REG_MEM: ArchReg = 76;
pub const REG_ZERO: ArchReg = 77;

/// True if writes to this architectural register allocate a rename table
/// entry. The zero register and the immediate/memory operand encodings are
/// never renamed; the flag pseudo-registers are renamed through the setflags
/// mask rather than as destinations.
pub fn archdest_can_rename(reg: ArchReg) -> bool {
    match reg {
        REG_ZF | REG_CF | REG_OF | REG_IMM | REG_ZERO => false,
        r if (r as usize) < 61 => true,
        r if (REG_TEMP0..REG_TEMP0 + 8).contains(&r) => true,
        REG_MEM => true,
        _ => false,
    }
}

static INT_REG_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

pub fn arch_reg_name(reg: ArchReg) -> String {
    match reg {
        0..=15 => INT_REG_NAMES[reg as usize].to_string(),
        16..=31 => format!("xmml{}", reg - REG_XMML0),
        32..=47 => format!("xmmh{}", reg - REG_XMMH0),
        REG_FPTOS => "fptos".to_string(),
        REG_RIP => "rip".to_string(),
        REG_FLAGS => "flags".to_string(),
        REG_SR0 => "sr0".to_string(),
        REG_SR1 => "sr1".to_string(),
        REG_SR2 => "sr2".to_string(),
        64..=71 => format!("t{}", reg - REG_TEMP0),
        REG_ZF => "zf".to_string(),
        REG_CF => "cf".to_string(),
        REG_OF => "of".to_string(),
        REG_IMM => "imm".to_string(),
        REG_MEM => "mem".to_string(),
        REG_ZERO => "zero".to_string(),
        _ => format!("r?{}", reg),
    }
}

//
// Register flag bits. ZF and SF rename together as one group; CF and OF are
// independently renameable so flag-merging instruction sequences do not
// serialize on a single physical register.
//
pub const FLAG_ZF: u16 = 0x01;
pub const FLAG_SF: u16 = 0x02;
pub const FLAG_CF: u16 = 0x04;
pub const FLAG_OF: u16 = 0x08;
pub const FLAG_WAIT: u16 = 0x40;
pub const FLAG_INV: u16 = 0x80;
pub const FLAG_USER: u16 = FLAG_ZF | FLAG_SF | FLAG_CF | FLAG_OF;

pub const SETFLAG_ZF: u8 = 0x1;
pub const SETFLAG_CF: u8 = 0x2;
pub const SETFLAG_OF: u8 = 0x4;

//
// Exception codes carried in the data word of a poisoned (FLAG_INV) register.
//
pub const EXC_PROPAGATE: u64 = 1;
pub const EXC_UNALIGNED: u64 = 2;
pub const EXC_PAGE_FAULT_READ: u64 = 3;
pub const EXC_PAGE_FAULT_WRITE: u64 = 4;
pub const EXC_PAGE_FAULT_EXEC: u64 = 5;
pub const EXC_LD_ST_ALIASING: u64 = 6;
pub const EXC_SKIPBLOCK: u64 = 7;
pub const EXC_CHECK_FAILED: u64 = 8;

pub fn exception_name(code: u64) -> &'static str {
    match code {
        EXC_PROPAGATE => "Propagate",
        EXC_UNALIGNED => "UnalignedAccess",
        EXC_PAGE_FAULT_READ => "PageFaultOnRead",
        EXC_PAGE_FAULT_WRITE => "PageFaultOnWrite",
        EXC_PAGE_FAULT_EXEC => "PageFaultOnExec",
        EXC_LD_ST_ALIASING => "LoadStoreAliasing",
        EXC_SKIPBLOCK => "SkipBlock",
        EXC_CHECK_FAILED => "CheckFailed",
        _ => "Unknown",
    }
}

//
// Functional units. Each cluster is configured with a subset of these.
//
pub const FU_COUNT: usize = 8;
pub const FU_ALU0: u32 = 1 << 0;
pub const FU_ALU1: u32 = 1 << 1;
pub const FU_FPU0: u32 = 1 << 2;
pub const FU_FPU1: u32 = 1 << 3;
pub const FU_LDU0: u32 = 1 << 4;
pub const FU_LDU1: u32 = 1 << 5;
pub const FU_STU0: u32 = 1 << 6;
pub const FU_STU1: u32 = 1 << 7;

pub static FU_NAMES: [&str; FU_COUNT] = [
    "alu0", "alu1", "fpu0", "fpu1", "ldu0", "ldu1", "stu0", "stu1",
];

pub fn fu_mask_from_name(name: &str) -> Option<u32> {
    FU_NAMES.iter().position(|n| *n == name).map(|i| 1 << i)
}

//
// Opcode classes, as a bitmask so issue and commit can test several at once.
//
pub const OPCLASS_LOGIC: u32 = 1 << 0;
pub const OPCLASS_ADDSUB: u32 = 1 << 1;
pub const OPCLASS_SHIFT: u32 = 1 << 2;
pub const OPCLASS_MUL: u32 = 1 << 3;
pub const OPCLASS_FLAGS: u32 = 1 << 4;
pub const OPCLASS_COND_BRANCH: u32 = 1 << 5;
pub const OPCLASS_UNCOND_BRANCH: u32 = 1 << 6;
pub const OPCLASS_INDIR_BRANCH: u32 = 1 << 7;
pub const OPCLASS_LOAD: u32 = 1 << 8;
pub const OPCLASS_STORE: u32 = 1 << 9;
pub const OPCLASS_BARRIER: u32 = 1 << 10;
pub const OPCLASS_CHECK: u32 = 1 << 11;

pub const OPCLASS_BRANCH: u32 =
    OPCLASS_COND_BRANCH | OPCLASS_UNCOND_BRANCH | OPCLASS_INDIR_BRANCH;

pub const OPCLASS_COUNT: usize = 12;

pub static OPCLASS_NAMES: [&str; OPCLASS_COUNT] = [
    "logic", "addsub", "shift", "mul", "flags", "cond-branch", "uncond-branch", "indir-branch",
    "load", "store", "barrier", "check",
];

pub fn opclass_index(opclass: u32) -> usize {
    opclass.trailing_zeros() as usize
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opcode {
    NOP,
    MOV,
    AND,
    OR,
    XOR,
    ADD,
    SUB,
    SHL,
    SHR,
    SAR,
    MUL,
    COLLCC,
    LD,
    LDX,
    ST,
    BRU,
    BR,
    JMP,
    CHK,
    ASSIST,
}

pub struct OpInfo {
    pub opclass: u32,
    pub fu: u32,
    pub latency: u8,
}

const FU_INT: u32 = FU_ALU0 | FU_ALU1;
const FU_LD: u32 = FU_LDU0 | FU_LDU1;
const FU_ST: u32 = FU_STU0 | FU_STU1;
const FU_FP: u32 = FU_FPU0 | FU_FPU1;

pub fn opinfo(opcode: Opcode) -> OpInfo {
    use Opcode::*;
    let (opclass, fu, latency) = match opcode {
        NOP => (OPCLASS_LOGIC, FU_INT, 1),
        MOV => (OPCLASS_LOGIC, FU_INT, 1),
        AND | OR | XOR => (OPCLASS_LOGIC, FU_INT, 1),
        ADD | SUB => (OPCLASS_ADDSUB, FU_INT, 1),
        SHL | SHR | SAR => (OPCLASS_SHIFT, FU_INT, 1),
        MUL => (OPCLASS_MUL, FU_INT | FU_FP, 4),
        COLLCC => (OPCLASS_FLAGS, FU_INT, 1),
        LD | LDX => (OPCLASS_LOAD, FU_LD, 1),
        ST => (OPCLASS_STORE, FU_ST, 1),
        BRU => (OPCLASS_UNCOND_BRANCH, FU_INT, 1),
        BR => (OPCLASS_COND_BRANCH, FU_INT, 1),
        JMP => (OPCLASS_INDIR_BRANCH, FU_INT, 1),
        CHK => (OPCLASS_CHECK, FU_INT, 1),
        ASSIST => (OPCLASS_BARRIER, FU_INT, 1),
    };
    OpInfo { opclass, fu, latency }
}

pub fn mnemonic(opcode: Opcode) -> &'static str {
    use Opcode::*;
    match opcode {
        NOP => "nop",
        MOV => "mov",
        AND => "and",
        OR => "or",
        XOR => "xor",
        ADD => "add",
        SUB => "sub",
        SHL => "shl",
        SHR => "shr",
        SAR => "sar",
        MUL => "mul",
        COLLCC => "collcc",
        LD => "ld",
        LDX => "ldx",
        ST => "st",
        BRU => "bru",
        BR => "br",
        JMP => "jmp",
        CHK => "chk",
        ASSIST => "assist",
    }
}

pub fn isclass(opcode: Opcode, mask: u32) -> bool {
    (opinfo(opcode).opclass & mask) != 0
}

pub fn isload(opcode: Opcode) -> bool {
    isclass(opcode, OPCLASS_LOAD)
}

pub fn isstore(opcode: Opcode) -> bool {
    isclass(opcode, OPCLASS_STORE)
}

pub fn isbranch(opcode: Opcode) -> bool {
    isclass(opcode, OPCLASS_BRANCH)
}

pub fn isbarrier(opcode: Opcode) -> bool {
    isclass(opcode, OPCLASS_BARRIER)
}

//
// Condition codes evaluated against the merged user flag word.
//
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cond {
    Always,
    E,
    Ne,
    B,
    Ae,
    Be,
    A,
    L,
    Ge,
    Le,
    G,
    S,
    Ns,
    O,
    No,
}

pub fn evaluate_cond(cond: Cond, flags: u16) -> bool {
    let zf = flags & FLAG_ZF != 0;
    let sf = flags & FLAG_SF != 0;
    let cf = flags & FLAG_CF != 0;
    let of = flags & FLAG_OF != 0;
    match cond {
        Cond::Always => true,
        Cond::E => zf,
        Cond::Ne => !zf,
        Cond::B => cf,
        Cond::Ae => !cf,
        Cond::Be => cf | zf,
        Cond::A => !(cf | zf),
        Cond::L => sf != of,
        Cond::Ge => sf == of,
        Cond::Le => zf | (sf != of),
        Cond::G => !zf & (sf == of),
        Cond::S => sf,
        Cond::Ns => !sf,
        Cond::O => of,
        Cond::No => !of,
    }
}

pub fn invert_cond(cond: Cond) -> Cond {
    match cond {
        Cond::Always => Cond::Always,
        Cond::E => Cond::Ne,
        Cond::Ne => Cond::E,
        Cond::B => Cond::Ae,
        Cond::Ae => Cond::B,
        Cond::Be => Cond::A,
        Cond::A => Cond::Be,
        Cond::L => Cond::Ge,
        Cond::Ge => Cond::L,
        Cond::Le => Cond::G,
        Cond::G => Cond::Le,
        Cond::S => Cond::Ns,
        Cond::Ns => Cond::S,
        Cond::O => Cond::No,
        Cond::No => Cond::O,
    }
}

pub fn cond_name(cond: Cond) -> &'static str {
    match cond {
        Cond::Always => "al",
        Cond::E => "e",
        Cond::Ne => "ne",
        Cond::B => "b",
        Cond::Ae => "ae",
        Cond::Be => "be",
        Cond::A => "a",
        Cond::L => "l",
        Cond::Ge => "ge",
        Cond::Le => "le",
        Cond::G => "g",
        Cond::S => "s",
        Cond::Ns => "ns",
        Cond::O => "o",
        Cond::No => "no",
    }
}

/// Alignment variant for memory operations. Unaligned accesses are split at
/// translation time into a Lo/Hi pair covering the two adjacent 8-byte blocks.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AlignType {
    Normal,
    Lo,
    Hi,
}

//
// Host-assist identifiers, carried in the taken-target field of barrier
// uops. Committing one hands control to the matching assist routine.
//
pub const ASSIST_EXIT: u64 = 0;
pub const ASSIST_NOP: u64 = 1;
pub const ASSIST_PRINT: u64 = 2;
pub const ASSIST_COUNT: u64 = 3;

pub fn assist_name(id: u64) -> &'static str {
    match id {
        ASSIST_EXIT => "exit",
        ASSIST_NOP => "nop",
        ASSIST_PRINT => "print",
        _ => "unknown",
    }
}

//
// Branch hint bits (predictor update type).
//
pub const BRANCH_HINT_COND: u32 = 1 << 0;
pub const BRANCH_HINT_INDIRECT: u32 = 1 << 1;
pub const BRANCH_HINT_CALL: u32 = 1 << 2;
pub const BRANCH_HINT_RET: u32 = 1 << 3;

/// One micro-operation as produced by the decoder.
#[derive(Clone, Copy, Debug)]
pub struct Uop {
    pub opcode: Opcode,
    pub som: bool,
    pub eom: bool,
    pub ra: ArchReg,
    pub rb: ArchReg,
    pub rc: ArchReg,
    pub rd: ArchReg,
    pub rbimm: i64,
    pub rcimm: i64,
    pub cond: Cond,
    pub aligntype: AlignType,
    // log2 of the access size in bytes for loads and stores
    pub size: u8,
    pub extshift: u8,
    pub setflags: u8,
    pub nouserflags: bool,
    pub internal: bool,
    pub branch_hints: u32,
    // byte length of the containing macro-op, valid on the SOM uop
    pub bytes: u8,
    pub riptaken: u64,
    pub ripseq: u64,
}

impl Uop {
    pub fn new(opcode: Opcode) -> Uop {
        Uop {
            opcode,
            som: true,
            eom: true,
            ra: REG_ZERO,
            rb: REG_ZERO,
            rc: REG_ZERO,
            rd: REG_TEMP0 + 7,
            rbimm: 0,
            rcimm: 0,
            cond: Cond::Always,
            aligntype: AlignType::Normal,
            size: 3,
            extshift: 0,
            setflags: 0,
            nouserflags: true,
            internal: false,
            branch_hints: 0,
            bytes: 1,
            riptaken: 0,
            ripseq: 0,
        }
    }
}

impl Display for Uop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", mnemonic(self.opcode))?;
        if self.opcode == Opcode::BR || self.opcode == Opcode::CHK {
            write!(f, ".{}", cond_name(self.cond))?;
        }
        if self.setflags != 0 {
            write!(f, ".")?;
        }
        write!(
            f,
            " {} = {}, {}",
            arch_reg_name(self.rd),
            arch_reg_name(self.ra),
            if self.rb == REG_IMM {
                format!("#{}", self.rbimm)
            } else {
                arch_reg_name(self.rb)
            }
        )?;
        if self.rc != REG_ZERO || self.rcimm != 0 {
            write!(
                f,
                ", {}",
                if self.rc == REG_IMM {
                    format!("#{}", self.rcimm)
                } else {
                    arch_reg_name(self.rc)
                }
            )?;
        }
        if isbranch(self.opcode) {
            write!(f, " [taken {:#x}, seq {:#x}]", self.riptaken, self.ripseq)?;
        }
        Ok(())
    }
}

//
// Semantic callbacks. The decoder attaches one of these to every uop; the
// issue stage calls it with the resolved operand values.
//
pub struct IssueInput {
    pub ra: u64,
    pub rb: u64,
    pub rc: u64,
    pub raflags: u16,
    pub rbflags: u16,
    pub rcflags: u16,
    pub cond: Cond,
    pub size: u8,
}

#[derive(Default, Clone, Copy)]
pub struct IssueState {
    pub rddata: u64,
    pub rdflags: u16,
    pub riptaken: u64,
    pub ripseq: u64,
}

pub type SynthOp = fn(&IssueInput, &mut IssueState);

fn logic_flags(result: u64) -> u16 {
    let mut flags = 0;
    if result == 0 {
        flags |= FLAG_ZF;
    }
    if (result as i64) < 0 {
        flags |= FLAG_SF;
    }
    flags
}

fn synth_nop(_input: &IssueInput, state: &mut IssueState) {
    state.rddata = 0;
    state.rdflags = 0;
}

fn synth_mov(input: &IssueInput, state: &mut IssueState) {
    state.rddata = input.rb;
    state.rdflags = 0;
}

fn synth_and(input: &IssueInput, state: &mut IssueState) {
    state.rddata = input.ra & input.rb;
    state.rdflags = logic_flags(state.rddata);
}

fn synth_or(input: &IssueInput, state: &mut IssueState) {
    state.rddata = input.ra | input.rb;
    state.rdflags = logic_flags(state.rddata);
}

fn synth_xor(input: &IssueInput, state: &mut IssueState) {
    state.rddata = input.ra ^ input.rb;
    state.rdflags = logic_flags(state.rddata);
}

fn synth_add(input: &IssueInput, state: &mut IssueState) {
    let (result, carry) = input.ra.overflowing_add(input.rb);
    let overflow = ((input.ra ^ result) & (input.rb ^ result)) >> 63 != 0;
    state.rddata = result;
    state.rdflags = logic_flags(result)
        | if carry { FLAG_CF } else { 0 }
        | if overflow { FLAG_OF } else { 0 };
}

fn synth_sub(input: &IssueInput, state: &mut IssueState) {
    let (result, borrow) = input.ra.overflowing_sub(input.rb);
    let overflow = ((input.ra ^ input.rb) & (input.ra ^ result)) >> 63 != 0;
    state.rddata = result;
    state.rdflags = logic_flags(result)
        | if borrow { FLAG_CF } else { 0 }
        | if overflow { FLAG_OF } else { 0 };
}

fn synth_shl(input: &IssueInput, state: &mut IssueState) {
    state.rddata = input.ra.wrapping_shl(input.rb as u32 & 63);
    state.rdflags = logic_flags(state.rddata);
}

fn synth_shr(input: &IssueInput, state: &mut IssueState) {
    state.rddata = input.ra.wrapping_shr(input.rb as u32 & 63);
    state.rdflags = logic_flags(state.rddata);
}

fn synth_sar(input: &IssueInput, state: &mut IssueState) {
    state.rddata = ((input.ra as i64).wrapping_shr(input.rb as u32 & 63)) as u64;
    state.rdflags = logic_flags(state.rddata);
}

fn synth_mul(input: &IssueInput, state: &mut IssueState) {
    state.rddata = input.ra.wrapping_mul(input.rb);
    state.rdflags = logic_flags(state.rddata);
}

fn synth_collcc(input: &IssueInput, state: &mut IssueState) {
    let flags = (input.raflags & (FLAG_ZF | FLAG_SF))
        | (input.rbflags & FLAG_CF)
        | (input.rcflags & FLAG_OF);
    state.rddata = flags as u64;
    state.rdflags = flags;
}

fn merged_branch_flags(input: &IssueInput) -> u16 {
    (input.raflags & (FLAG_ZF | FLAG_SF))
        | (input.rbflags & FLAG_CF)
        | (input.rcflags & FLAG_OF)
}

fn synth_bru(_input: &IssueInput, state: &mut IssueState) {
    state.rddata = state.riptaken;
    state.rdflags = 0;
}

fn synth_br(input: &IssueInput, state: &mut IssueState) {
    let flags = merged_branch_flags(input);
    state.rddata = if evaluate_cond(input.cond, flags) {
        state.riptaken
    } else {
        state.ripseq
    };
    state.rdflags = 0;
}

fn synth_jmp(input: &IssueInput, state: &mut IssueState) {
    state.rddata = input.ra;
    state.rdflags = 0;
}

fn synth_chk(input: &IssueInput, state: &mut IssueState) {
    // ra carries the full user flag word of the last flag producer
    if evaluate_cond(input.cond, input.raflags & FLAG_USER) {
        state.rddata = 0;
        state.rdflags = 0;
    } else {
        state.rddata = input.rb;
        state.rdflags = FLAG_INV;
    }
}

fn synth_assist(_input: &IssueInput, state: &mut IssueState) {
    state.rddata = state.riptaken;
    state.rdflags = 0;
}

/// The semantic callback table. Loads and stores never reach their callback;
/// the issue stage handles them directly.
pub fn synthop_for(opcode: Opcode) -> SynthOp {
    use Opcode::*;
    match opcode {
        NOP => synth_nop,
        MOV => synth_mov,
        AND => synth_and,
        OR => synth_or,
        XOR => synth_xor,
        ADD => synth_add,
        SUB => synth_sub,
        SHL => synth_shl,
        SHR => synth_shr,
        SAR => synth_sar,
        MUL => synth_mul,
        COLLCC => synth_collcc,
        LD | LDX | ST => synth_nop,
        BRU => synth_bru,
        BR => synth_br,
        JMP => synth_jmp,
        CHK => synth_chk,
        ASSIST => synth_assist,
    }
}

/// Replicate each set bit of an 8-bit byte mask across the corresponding byte.
pub fn expand_bytemask(bytemask: u8) -> u64 {
    let mut mask = 0u64;
    for i in 0..8 {
        if bytemask & (1 << i) != 0 {
            mask |= 0xffu64 << (i * 8);
        }
    }
    mask
}

/// Merge bytes selected by `bytemask` from `new` over `old`.
pub fn mux64(bytemask: u8, old: u64, new: u64) -> u64 {
    let mask = expand_bytemask(bytemask);
    (old & !mask) | (new & mask)
}

/// Extract a value of size `1 << sizeshift` bytes starting at byte `offset`
/// of the 16-byte window formed by `lo` and `hi`, optionally sign-extending.
pub fn extract_bytes(lo: u64, hi: u64, offset: usize, sizeshift: u8, signext: bool) -> u64 {
    let window = (hi as u128) << 64 | lo as u128;
    let raw = (window >> (offset * 8)) as u64;
    match (sizeshift, signext) {
        (0, false) => raw as u8 as u64,
        (0, true) => raw as u8 as i8 as i64 as u64,
        (1, false) => raw as u16 as u64,
        (1, true) => raw as u16 as i16 as i64 as u64,
        (2, false) => raw as u32 as u64,
        (2, true) => raw as u32 as i32 as i64 as u64,
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_inversion_round_trip() {
        for cond in [
            Cond::E,
            Cond::Ne,
            Cond::B,
            Cond::Ae,
            Cond::Be,
            Cond::A,
            Cond::L,
            Cond::Ge,
            Cond::Le,
            Cond::G,
            Cond::S,
            Cond::Ns,
            Cond::O,
            Cond::No,
        ] {
            assert_eq!(invert_cond(invert_cond(cond)), cond);
            for flags in 0..16u16 {
                assert_ne!(
                    evaluate_cond(cond, flags),
                    evaluate_cond(invert_cond(cond), flags),
                    "cond {:?} flags {:#x}",
                    cond,
                    flags
                );
            }
        }
    }

    #[test]
    fn test_sub_flags() {
        let input = IssueInput {
            ra: 5,
            rb: 5,
            rc: 0,
            raflags: 0,
            rbflags: 0,
            rcflags: 0,
            cond: Cond::Always,
            size: 3,
        };
        let mut state = IssueState::default();
        synth_sub(&input, &mut state);
        assert_eq!(state.rddata, 0);
        assert_ne!(state.rdflags & FLAG_ZF, 0);
        assert_eq!(state.rdflags & FLAG_CF, 0);
    }

    #[test]
    fn test_mux64_merges_selected_bytes() {
        let old = 0x1111_1111_1111_1111;
        let new = 0x2222_2222_2222_2222;
        assert_eq!(mux64(0x0f, old, new), 0x1111_1111_2222_2222);
        assert_eq!(mux64(0x00, old, new), old);
        assert_eq!(mux64(0xff, old, new), new);
    }

    #[test]
    fn test_extract_bytes_sign_extension() {
        let lo = 0x0000_0000_0000_80ff;
        assert_eq!(extract_bytes(lo, 0, 0, 0, true), 0xffff_ffff_ffff_ffff);
        assert_eq!(extract_bytes(lo, 0, 0, 0, false), 0xff);
        assert_eq!(extract_bytes(lo, 0, 0, 1, true), 0xffff_ffff_ffff_80ff);
        // crossing the lo/hi boundary
        assert_eq!(extract_bytes(0xaa00_0000_0000_0000, 0xbb, 7, 1, false), 0xbbaa);
    }
}
