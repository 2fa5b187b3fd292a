use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use regex::Regex;

use crate::config::SimError;
use crate::frontend::fetch::{BasicBlock, Decoder};
use crate::memory_subsystem::address_space::{AddressSpace, PROT_EXEC, PROT_READ, PROT_WRITE};
use crate::uop::*;

pub const CODE_BASE: u64 = 0x0010_0000;
pub const DATA_BASE: u64 = 0x0020_0000;

//
// Micro-op assembly: a line-oriented text format feeding the simulator in
// place of an x86 front end. One instruction per line becomes one macro-op
// (one uop, or an aligned pair when re-split after an unaligned access).
//
//   .data
//     counter: 7
//   .text
//   loop:
//     ld   rax, [#counter]
//     add. rax, rax, #1
//     st   [#counter], rax
//     cmp  rax, #10
//     br.ne loop
//     assist exit
//

#[derive(Clone)]
pub struct MacroOp {
    pub rip: u64,
    pub uop: Uop,
}

pub struct DataItem {
    pub name: String,
    pub addr: u64,
    pub values: Vec<u64>,
}

pub struct Program {
    pub insns: BTreeMap<u64, MacroOp>,
    pub data: Vec<DataItem>,
    pub entry: u64,
}

impl Program {
    /// Map and fill the guest address space: code pages execute-only plus
    /// read, data pages read/write.
    pub fn init_memory(&self, asp: &mut AddressSpace) {
        let code_len = (self.insns.len() as u64).max(1);
        asp.map(CODE_BASE, code_len, PROT_READ | PROT_EXEC);
        asp.map(DATA_BASE, 0x1000, PROT_READ | PROT_WRITE);
        for item in &self.data {
            for (i, value) in item.values.iter().enumerate() {
                asp.write_u64(item.addr + 8 * i as u64, *value);
            }
        }
    }
}

struct Loader {
    labels: HashMap<String, u64>,
    insns: BTreeMap<u64, MacroOp>,
    data: Vec<DataItem>,
    errors: Vec<String>,
    reg_re: Regex,
    mem_re: Regex,
}

fn parse_value(token: &str) -> Option<i64> {
    let token = token.trim();
    if let Some(hex) = token.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(hex) = token.strip_prefix("-0x") {
        return i64::from_str_radix(hex, 16).ok().map(|v| -v);
    }
    token.parse().ok()
}

impl Loader {
    fn new() -> Loader {
        Loader {
            labels: HashMap::new(),
            insns: BTreeMap::new(),
            data: Vec::new(),
            errors: Vec::new(),
            reg_re: Regex::new(r"^(r[a-z0-9]+|t[0-7]|xmml[0-9]+|xmmh[0-9]+)$").unwrap(),
            mem_re: Regex::new(r"^\[\s*([^\]\+\s]+)\s*(?:\+\s*([^\]\s]+)\s*)?\]$").unwrap(),
        }
    }

    fn register(&self, token: &str) -> Option<ArchReg> {
        if !self.reg_re.is_match(token) {
            return None;
        }
        if let Some(t) = token.strip_prefix('t') {
            if token.len() == 2 {
                return t.parse::<u8>().ok().map(|i| REG_TEMP0 + i);
            }
        }
        if let Some(i) = token.strip_prefix("xmml").and_then(|s| s.parse::<u8>().ok()) {
            return (i < 16).then(|| REG_XMML0 + i);
        }
        if let Some(i) = token.strip_prefix("xmmh").and_then(|s| s.parse::<u8>().ok()) {
            return (i < 16).then(|| REG_XMMH0 + i);
        }
        (0..16u8).find(|&i| arch_reg_name(i) == token)
    }

    fn immediate(&mut self, token: &str, line: usize) -> i64 {
        let body = match token.strip_prefix('#') {
            Some(body) => body,
            None => {
                self.errors
                    .push(format!("line {}: expected immediate, got '{}'", line, token));
                return 0;
            }
        };
        if let Some(value) = parse_value(body) {
            return value;
        }
        if let Some(&addr) = self.labels.get(body) {
            return addr as i64;
        }
        self.errors
            .push(format!("line {}: bad immediate '{}'", line, token));
        0
    }

    /// Fill (ra, rb, rbimm) from a register-or-immediate source token.
    fn reg_or_imm(&mut self, uop: &mut Uop, token: &str, line: usize) {
        if let Some(reg) = self.register(token) {
            uop.rb = reg;
        } else {
            uop.rb = REG_IMM;
            uop.rbimm = self.immediate(token, line);
        }
    }

    /// Parse a memory operand into the base (ra) and offset (rb) fields.
    fn mem_operand(&mut self, uop: &mut Uop, token: &str, line: usize) {
        let caps = match self.mem_re.captures(token) {
            Some(caps) => caps,
            None => {
                self.errors
                    .push(format!("line {}: bad memory operand '{}'", line, token));
                return;
            }
        };
        let base = caps.get(1).unwrap().as_str().to_string();
        let offset = caps.get(2).map(|m| m.as_str().to_string());
        match (self.register(&base), offset) {
            (Some(reg), None) => {
                uop.ra = reg;
            }
            (Some(reg), Some(off)) => {
                uop.ra = reg;
                if let Some(off_reg) = self.register(&off) {
                    uop.rb = off_reg;
                } else {
                    uop.rb = REG_IMM;
                    uop.rbimm = self.immediate(&off, line);
                }
            }
            (None, None) => {
                uop.ra = REG_ZERO;
                uop.rb = REG_IMM;
                uop.rbimm = self.immediate(&base, line);
            }
            (None, Some(off)) => {
                let base_imm = self.immediate(&base, line);
                if let Some(off_reg) = self.register(&off) {
                    uop.ra = off_reg;
                    uop.rb = REG_IMM;
                    uop.rbimm = base_imm;
                } else {
                    uop.ra = REG_ZERO;
                    uop.rb = REG_IMM;
                    uop.rbimm = base_imm + self.immediate(&off, line);
                }
            }
        }
    }

    fn cond(&mut self, suffix: &str, line: usize) -> Cond {
        match suffix {
            "e" | "z" => Cond::E,
            "ne" | "nz" => Cond::Ne,
            "b" => Cond::B,
            "ae" => Cond::Ae,
            "be" => Cond::Be,
            "a" => Cond::A,
            "l" => Cond::L,
            "ge" => Cond::Ge,
            "le" => Cond::Le,
            "g" => Cond::G,
            "s" => Cond::S,
            "ns" => Cond::Ns,
            "o" => Cond::O,
            "no" => Cond::No,
            _ => {
                self.errors
                    .push(format!("line {}: unknown condition '{}'", line, suffix));
                Cond::Always
            }
        }
    }

    fn size_suffix(&mut self, suffix: &str, line: usize) -> u8 {
        match suffix {
            "b" => 0,
            "w" => 1,
            "d" => 2,
            "q" | "" => 3,
            _ => {
                self.errors
                    .push(format!("line {}: unknown size suffix '{}'", line, suffix));
                3
            }
        }
    }

    fn branch_target(&mut self, token: &str, line: usize) -> u64 {
        match self.labels.get(token) {
            Some(&rip) => rip,
            None => {
                self.errors
                    .push(format!("line {}: unknown label '{}'", line, token));
                0
            }
        }
    }

    fn flag_sources(uop: &mut Uop) {
        uop.ra = REG_ZF;
        uop.rb = REG_CF;
        uop.rc = REG_OF;
    }

    fn parse_instruction(&mut self, rip: u64, text: &str, line: usize) {
        let (mnemonic_str, rest) = match text.split_once(char::is_whitespace) {
            Some((m, rest)) => (m, rest.trim()),
            None => (text, ""),
        };
        let operands: Vec<String> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split(',').map(|s| s.trim().to_string()).collect()
        };

        let mut parts = mnemonic_str.splitn(2, '.');
        let base = parts.next().unwrap();
        let suffix = parts.next();

        let mut uop = Uop::new(Opcode::NOP);
        uop.ripseq = rip + 1;

        match base {
            "nop" => {}
            "mov" => {
                uop.opcode = Opcode::MOV;
                if operands.len() != 2 {
                    self.errors.push(format!("line {}: mov needs 2 operands", line));
                    return;
                }
                uop.rd = match self.register(&operands[0]) {
                    Some(r) => r,
                    None => {
                        self.errors
                            .push(format!("line {}: bad register '{}'", line, operands[0]));
                        return;
                    }
                };
                let src = operands[1].clone();
                self.reg_or_imm(&mut uop, &src, line);
            }
            "add" | "sub" | "and" | "or" | "xor" | "shl" | "shr" | "sar" | "mul" => {
                uop.opcode = match base {
                    "add" => Opcode::ADD,
                    "sub" => Opcode::SUB,
                    "and" => Opcode::AND,
                    "or" => Opcode::OR,
                    "xor" => Opcode::XOR,
                    "shl" => Opcode::SHL,
                    "shr" => Opcode::SHR,
                    "sar" => Opcode::SAR,
                    _ => Opcode::MUL,
                };
                if operands.len() != 3 {
                    self.errors
                        .push(format!("line {}: {} needs 3 operands", line, base));
                    return;
                }
                uop.rd = self.register(&operands[0]).unwrap_or_else(|| {
                    self.errors
                        .push(format!("line {}: bad register '{}'", line, operands[0]));
                    REG_TEMP0 + 7
                });
                uop.ra = self.register(&operands[1]).unwrap_or_else(|| {
                    self.errors
                        .push(format!("line {}: bad register '{}'", line, operands[1]));
                    REG_ZERO
                });
                let src = operands[2].clone();
                self.reg_or_imm(&mut uop, &src, line);
                if suffix == Some("") {
                    uop.setflags = SETFLAG_ZF | SETFLAG_CF | SETFLAG_OF;
                    uop.nouserflags = false;
                }
            }
            "cmp" => {
                uop.opcode = Opcode::SUB;
                if operands.len() != 2 {
                    self.errors.push(format!("line {}: cmp needs 2 operands", line));
                    return;
                }
                uop.rd = REG_TEMP0 + 7;
                uop.ra = self.register(&operands[0]).unwrap_or(REG_ZERO);
                let src = operands[1].clone();
                self.reg_or_imm(&mut uop, &src, line);
                uop.setflags = SETFLAG_ZF | SETFLAG_CF | SETFLAG_OF;
                uop.nouserflags = false;
            }
            "collcc" => {
                uop.opcode = Opcode::COLLCC;
                uop.rd = operands
                    .first()
                    .and_then(|r| self.register(r))
                    .unwrap_or(REG_TEMP0 + 7);
                Self::flag_sources(&mut uop);
                uop.setflags = SETFLAG_ZF | SETFLAG_CF | SETFLAG_OF;
                uop.nouserflags = false;
            }
            "ld" | "ldx" => {
                uop.opcode = if base == "ldx" { Opcode::LDX } else { Opcode::LD };
                uop.size = self.size_suffix(suffix.unwrap_or(""), line);
                if operands.len() != 2 {
                    self.errors.push(format!("line {}: ld needs 2 operands", line));
                    return;
                }
                uop.rd = self.register(&operands[0]).unwrap_or(REG_TEMP0 + 7);
                let mem = operands[1].clone();
                self.mem_operand(&mut uop, &mem, line);
            }
            "st" => {
                uop.opcode = Opcode::ST;
                uop.size = self.size_suffix(suffix.unwrap_or(""), line);
                if operands.len() != 2 {
                    self.errors.push(format!("line {}: st needs 2 operands", line));
                    return;
                }
                uop.rd = REG_MEM;
                let mem = operands[0].clone();
                self.mem_operand(&mut uop, &mem, line);
                let src = operands[1].clone();
                if let Some(reg) = self.register(&src) {
                    uop.rc = reg;
                } else {
                    uop.rc = REG_IMM;
                    uop.rcimm = self.immediate(&src, line);
                }
            }
            "bru" => {
                uop.opcode = Opcode::BRU;
                uop.rd = REG_RIP;
                let target = operands.first().cloned().unwrap_or_default();
                uop.riptaken = self.branch_target(&target, line);
                if suffix == Some("call") {
                    uop.branch_hints |= BRANCH_HINT_CALL;
                }
            }
            "br" => {
                uop.opcode = Opcode::BR;
                uop.rd = REG_RIP;
                Self::flag_sources(&mut uop);
                uop.cond = self.cond(suffix.unwrap_or(""), line);
                let target = operands.first().cloned().unwrap_or_default();
                uop.riptaken = self.branch_target(&target, line);
            }
            "jmp" => {
                uop.opcode = Opcode::JMP;
                uop.rd = REG_RIP;
                uop.ra = operands
                    .first()
                    .and_then(|r| self.register(r))
                    .unwrap_or(REG_ZERO);
                // no static target hint for indirect branches
                uop.riptaken = rip + 1;
                if suffix == Some("ret") {
                    uop.branch_hints |= BRANCH_HINT_RET;
                }
            }
            "chk" => {
                uop.opcode = Opcode::CHK;
                uop.rd = REG_TEMP0 + 7;
                uop.ra = REG_ZF;
                uop.cond = self.cond(suffix.unwrap_or(""), line);
                uop.rb = REG_IMM;
                uop.rbimm = match operands.first().map(String::as_str) {
                    Some("#skipblock") => EXC_SKIPBLOCK as i64,
                    Some("#checkfailed") | None => EXC_CHECK_FAILED as i64,
                    Some(other) => self.immediate(other, line),
                };
            }
            "assist" => {
                uop.opcode = Opcode::ASSIST;
                uop.rd = REG_RIP;
                uop.riptaken = match operands.first().map(String::as_str) {
                    Some("exit") => ASSIST_EXIT,
                    Some("nop") => ASSIST_NOP,
                    Some("print") => ASSIST_PRINT,
                    Some(other) => {
                        self.errors
                            .push(format!("line {}: unknown assist '{}'", line, other));
                        ASSIST_NOP
                    }
                    None => ASSIST_NOP,
                };
                if let Some(reg) = operands.get(1).and_then(|r| self.register(r)) {
                    uop.ra = reg;
                }
            }
            _ => {
                self.errors
                    .push(format!("line {}: unknown instruction '{}'", line, base));
                return;
            }
        }

        self.insns.insert(rip, MacroOp { rip, uop });
    }
}

pub fn load_from_string(src: &str) -> Result<Program, SimError> {
    let mut loader = Loader::new();

    enum Section {
        Text,
        Data,
    }
    let mut section = Section::Text;

    // pass 1: label and data layout
    let mut rip = CODE_BASE;
    let mut data_addr = DATA_BASE;
    for raw in src.lines() {
        let line = raw.split(';').next().unwrap().trim();
        if line.is_empty() {
            continue;
        }
        match line {
            ".text" => {
                section = Section::Text;
                continue;
            }
            ".data" => {
                section = Section::Data;
                continue;
            }
            _ => {}
        }
        match section {
            Section::Text => {
                if let Some(label) = line.strip_suffix(':') {
                    loader.labels.insert(label.to_string(), rip);
                } else {
                    rip += 1;
                }
            }
            Section::Data => {
                if let Some((name, values)) = line.split_once(':') {
                    let count = values.split_whitespace().count().max(1) as u64;
                    loader.labels.insert(name.trim().to_string(), data_addr);
                    data_addr += 8 * count;
                }
            }
        }
    }

    // pass 2: build uops and data items
    let mut section = Section::Text;
    let mut rip = CODE_BASE;
    let mut data_addr = DATA_BASE;
    for (lineno, raw) in src.lines().enumerate() {
        let line = raw.split(';').next().unwrap().trim();
        if line.is_empty() {
            continue;
        }
        match line {
            ".text" => {
                section = Section::Text;
                continue;
            }
            ".data" => {
                section = Section::Data;
                continue;
            }
            _ => {}
        }
        match section {
            Section::Text => {
                if line.ends_with(':') {
                    continue;
                }
                loader.parse_instruction(rip, line, lineno + 1);
                rip += 1;
            }
            Section::Data => {
                if let Some((name, values)) = line.split_once(':') {
                    let parsed: Vec<u64> = values
                        .split_whitespace()
                        .map(|v| parse_value(v).unwrap_or_else(|| {
                            loader
                                .errors
                                .push(format!("line {}: bad data value '{}'", lineno + 1, v));
                            0
                        }) as u64)
                        .collect();
                    let count = parsed.len().max(1) as u64;
                    loader.data.push(DataItem {
                        name: name.trim().to_string(),
                        addr: data_addr,
                        values: parsed,
                    });
                    data_addr += 8 * count;
                } else {
                    loader
                        .errors
                        .push(format!("line {}: bad data item '{}'", lineno + 1, line));
                }
            }
        }
    }

    if loader.insns.is_empty() {
        loader.errors.push("program has no instructions".to_string());
    }

    if !loader.errors.is_empty() {
        return Err(SimError::Load(loader.errors.join("\n")));
    }

    Ok(Program {
        insns: loader.insns,
        data: loader.data,
        entry: CODE_BASE,
    })
}

pub fn load_file(path: &Path) -> Result<Program, SimError> {
    let src = fs::read_to_string(path)?;
    load_from_string(&src)
}

/// The translator handed to the fetch unit. Blocks end at branches and
/// barriers; instructions whose RIP was flagged for unaligned access are
/// re-expanded as an aligned low/high pair.
pub struct ProgramDecoder {
    program: Rc<Program>,
    unaligned: RefCell<HashSet<u64>>,
}

impl ProgramDecoder {
    pub fn new(program: Rc<Program>) -> ProgramDecoder {
        ProgramDecoder {
            program,
            unaligned: RefCell::new(HashSet::new()),
        }
    }

    fn expand(&self, insn: &MacroOp, out: &mut Vec<(Uop, SynthOp)>) {
        let uop = insn.uop;
        let split = self.unaligned.borrow().contains(&insn.rip)
            && (isload(uop.opcode) || isstore(uop.opcode))
            && uop.aligntype == AlignType::Normal;
        if !split {
            out.push((uop, synthop_for(uop.opcode)));
            return;
        }

        // lo half covers the first aligned block; the hi half merges the
        // remainder, chained through an internal scratch register for loads
        let mut lo = uop;
        lo.aligntype = AlignType::Lo;
        lo.som = true;
        lo.eom = false;
        let mut hi = uop;
        hi.aligntype = AlignType::Hi;
        hi.som = false;
        hi.eom = true;
        if isload(uop.opcode) {
            // the low half always loads the whole aligned block
            lo.rd = REG_SR2;
            lo.opcode = Opcode::LD;
            lo.size = 3;
            hi.rc = REG_SR2;
            hi.rcimm = 0;
        }
        out.push((lo, synthop_for(lo.opcode)));
        out.push((hi, synthop_for(hi.opcode)));
    }
}

impl Decoder for ProgramDecoder {
    fn translate(&self, rip: u64, max_insns: u64) -> Option<BasicBlock> {
        self.program.insns.get(&rip)?;
        let mut uops = Vec::new();
        let mut cursor = rip;
        let mut count = 0u64;
        while count < max_insns {
            let insn = match self.program.insns.get(&cursor) {
                Some(insn) => insn,
                None => break,
            };
            self.expand(insn, &mut uops);
            count += 1;
            cursor += 1;
            let opcode = insn.uop.opcode;
            if isbranch(opcode) || isbarrier(opcode) {
                break;
            }
        }
        (!uops.is_empty()).then(|| BasicBlock { rip, uops })
    }

    fn mark_unaligned(&self, rip: u64) {
        self.unaligned.borrow_mut().insert(rip);
    }

    fn entry_point(&self) -> u64 {
        self.program.entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_simple_program() {
        let src = r#"
.data
    counter: 7
.text
start:
    mov rax, #10
    add. rbx, rax, #5
    ld  rcx, [#counter]
    st  [#counter], rcx
    cmp rbx, #15
    br.e start
    assist exit
"#;
        let program = load_from_string(src).unwrap();
        assert_eq!(program.entry, CODE_BASE);
        assert_eq!(program.insns.len(), 7);
        assert_eq!(program.data.len(), 1);
        assert_eq!(program.data[0].values, vec![7]);

        let mov = &program.insns[&CODE_BASE].uop;
        assert_eq!(mov.opcode, Opcode::MOV);
        assert_eq!(mov.rd, REG_RAX);
        assert_eq!(mov.rb, REG_IMM);
        assert_eq!(mov.rbimm, 10);

        let add = &program.insns[&(CODE_BASE + 1)].uop;
        assert_eq!(add.setflags, SETFLAG_ZF | SETFLAG_CF | SETFLAG_OF);

        let ld = &program.insns[&(CODE_BASE + 2)].uop;
        assert_eq!(ld.ra, REG_ZERO);
        assert_eq!(ld.rb, REG_IMM);
        assert_eq!(ld.rbimm, DATA_BASE as i64);

        let br = &program.insns[&(CODE_BASE + 5)].uop;
        assert_eq!(br.opcode, Opcode::BR);
        assert_eq!(br.riptaken, CODE_BASE);
        assert_eq!(br.ripseq, CODE_BASE + 6);
    }

    #[test]
    fn test_unknown_instruction_is_an_error() {
        assert!(load_from_string(".text\n    frobnicate rax\n").is_err());
    }

    #[test]
    fn test_blocks_end_at_branches() {
        let src = r#"
.text
    mov rax, #1
    bru out
    mov rbx, #2
out:
    assist exit
"#;
        let program = Rc::new(load_from_string(src).unwrap());
        let decoder = ProgramDecoder::new(program);
        let bb = decoder.translate(CODE_BASE, 1000).unwrap();
        assert_eq!(bb.uops.len(), 2);
        let bb = decoder.translate(CODE_BASE + 3, 1000).unwrap();
        assert_eq!(bb.uops.len(), 1);
    }

    #[test]
    fn test_unaligned_resplit() {
        let src = r#"
.text
    ld rax, [rbx + #3]
    assist exit
"#;
        let program = Rc::new(load_from_string(src).unwrap());
        let decoder = ProgramDecoder::new(program);
        let bb = decoder.translate(CODE_BASE, 1000).unwrap();
        assert_eq!(bb.uops.len(), 2);
        decoder.mark_unaligned(CODE_BASE);
        let bb = decoder.translate(CODE_BASE, 1000).unwrap();
        assert_eq!(bb.uops.len(), 3);
        let (lo, _) = bb.uops[0];
        let (hi, _) = bb.uops[1];
        assert_eq!(lo.aligntype, AlignType::Lo);
        assert!(lo.som && !lo.eom);
        assert_eq!(hi.aligntype, AlignType::Hi);
        assert!(!hi.som && hi.eom);
        assert_eq!(hi.rc, REG_SR2);
    }
}
