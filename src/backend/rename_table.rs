use crate::backend::physical_register::PHYS_REG_NULL;
use crate::uop::{
    arch_reg_name, ArchReg, PhysRegIndex, ARCHREG_COUNT, REG_CF, REG_FLAGS, REG_OF,
    REG_ZF, TRANSREG_COUNT,
};

/// A register rename table: one physical register index per architectural
/// register. Two instances exist, the speculative table updated at rename and
/// the committed table updated at commit.
#[derive(Clone)]
pub struct RenameTable {
    table: [PhysRegIndex; TRANSREG_COUNT],
}

impl RenameTable {
    pub fn new(arch_base: PhysRegIndex) -> RenameTable {
        let mut rrt = RenameTable {
            table: [PHYS_REG_NULL; TRANSREG_COUNT],
        };
        rrt.reset(arch_base);
        rrt
    }

    /// Point every architectural register at its entry in the arch bank. The
    /// translation-only temporaries are never read before they are written,
    /// so they map to the zero register; the flag pseudo-registers start out
    /// aliased to the committed flags mapping.
    pub fn reset(&mut self, arch_base: PhysRegIndex) {
        for i in 0..ARCHREG_COUNT {
            self.table[i] = arch_base + i as PhysRegIndex;
        }
        for i in ARCHREG_COUNT..TRANSREG_COUNT {
            self.table[i] = PHYS_REG_NULL;
        }
        self.table[REG_ZF as usize] = arch_base + REG_FLAGS as PhysRegIndex;
        self.table[REG_CF as usize] = arch_base + REG_FLAGS as PhysRegIndex;
        self.table[REG_OF as usize] = arch_base + REG_FLAGS as PhysRegIndex;
    }

    pub fn get(&self, reg: ArchReg) -> PhysRegIndex {
        self.table[reg as usize]
    }

    pub fn set(&mut self, reg: ArchReg, phys: PhysRegIndex) {
        self.table[reg as usize] = phys;
    }

    pub fn entries(&self) -> &[PhysRegIndex; TRANSREG_COUNT] {
        &self.table
    }

    pub fn copy_from(&mut self, other: &RenameTable) {
        self.table = other.table;
    }

    pub fn dump_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for chunk in (0..TRANSREG_COUNT).collect::<Vec<_>>().chunks(8) {
            let mut line = String::new();
            for &i in chunk {
                line.push_str(&format!(
                    " {:<6} r{:<3} |",
                    arch_reg_name(i as ArchReg),
                    self.table[i]
                ));
            }
            lines.push(line);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uop::{REG_RAX, REG_TEMP0};

    #[test]
    fn test_reset_mappings() {
        let rrt = RenameTable::new(100);
        assert_eq!(rrt.get(REG_RAX), 100);
        assert_eq!(rrt.get(REG_FLAGS), 100 + REG_FLAGS as PhysRegIndex);
        assert_eq!(rrt.get(REG_ZF), 100 + REG_FLAGS as PhysRegIndex);
        assert_eq!(rrt.get(REG_TEMP0), PHYS_REG_NULL);
    }

    #[test]
    fn test_copy_from() {
        let mut a = RenameTable::new(100);
        let b = RenameTable::new(100);
        a.set(REG_RAX, 7);
        assert_ne!(a.get(REG_RAX), b.get(REG_RAX));
        a.copy_from(&b);
        assert_eq!(a.get(REG_RAX), b.get(REG_RAX));
    }
}
