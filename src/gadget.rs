/*  file:       gadget.rs
    desc:       The raw gadget record, its memory footprint, the tagged
                semantic variants the classifier produces, and the quality
                key used to rank interchangeable gadgets.
 */

use crate::arch::{Arch, Operation, Register};
use crate::discover::init_capstone;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

// A register used as a memory base address by a gadget. Unknown marks an
// access whose address cannot be attributed to a tracked register (absolute,
// rip-relative, or an untracked base).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemBase {
    Reg(Register),
    Unknown,
}

// MemoryFootprint describes which registers a gadget dereferences and
// whether every access uses plain base + constant-offset addressing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoryFootprint {
    pub bases: BTreeSet<MemBase>,
    pub simple: bool,
}

// MemoryFootprint method impls
impl MemoryFootprint {
    // none() returns the footprint of a gadget that touches no memory.
    pub fn none() -> Self {
        MemoryFootprint {
            bases: BTreeSet::new(),
            simple: true,
        }
    }

    // has_unknown() returns true if any access is unattributable.
    pub fn has_unknown(&self) -> bool {
        self.bases.contains(&MemBase::Unknown)
    }

    // single_base() returns the base register iff the footprint is exactly
    // one attributable register.
    pub fn single_base(&self) -> Option<Register> {
        if self.bases.len() != 1 {
            return None;
        }
        match self.bases.iter().next() {
            Some(MemBase::Reg(reg)) => Some(*reg),
            _ => None,
        }
    }
}

// Gadget is the immutable raw record for one discovered instruction
// sequence: opcode bytes, address range, register side effects, memory
// footprint, and net stack displacement after the trailing return.
// Constructed once by discovery, then shared by reference (Rc) across every
// kernel that schedules it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Gadget {
    pub bytes: Vec<u8>,
    pub address: u64,
    pub address_end: u64,
    pub modified_regs: BTreeSet<Register>,
    pub footprint: MemoryFootprint,
    // net stack-pointer displacement in bytes, trailing return included
    pub stack_fix: i64,
    // immediate of a `ret imm16`, zero for a plain ret
    pub retn: u16,
    pub arch: Arch,
}

// QualityKey is the lexicographic ranking key of §select_best: attributable
// memory access first, then fewer dereferenced bases, fewer clobbered
// registers, smaller stack consumption, and finally shorter byte length.
// Smaller keys rank better.
pub type QualityKey = (bool, usize, usize, i64, u64);

// Gadget method impls
impl Gadget {
    // quality() returns the ranking key for this gadget.
    pub fn quality(&self) -> QualityKey {
        (
            self.footprint.has_unknown(),
            self.footprint.bases.len(),
            self.modified_regs.len(),
            self.stack_fix,
            self.address_end - self.address,
        )
    }

    // disasm() renders the gadget as a single "mnemonic ops; ..." line.
    pub fn disasm(&self) -> String {
        let cs = match init_capstone(self.arch, false) {
            Ok(cs) => cs,
            Err(_) => return String::new(),
        };
        let insns = match cs.disasm_all(&self.bytes, self.address) {
            Ok(insns) => insns,
            Err(_) => return String::new(),
        };
        insns
            .iter()
            .map(|insn| {
                let mut mnemonic: String = insn.mnemonic().unwrap_or_default().to_owned();
                if let Some(op_str) = insn.op_str() {
                    if !op_str.is_empty() {
                        mnemonic += " ";
                        mnemonic += op_str;
                    }
                }
                mnemonic
            })
            .reduce(|acc, s| format!("{acc}; {s}"))
            .unwrap_or_default()
    }

    // dump() renders one "0xaddr: mnemonic ops" line per instruction.
    pub fn dump(&self) -> String {
        let cs = match init_capstone(self.arch, false) {
            Ok(cs) => cs,
            Err(_) => return String::new(),
        };
        let insns = match cs.disasm_all(&self.bytes, self.address) {
            Ok(insns) => insns,
            Err(_) => return String::new(),
        };
        let mut out = String::new();
        for insn in insns.iter() {
            out += &format!(
                "{:#x}:\t{}\t{}\n",
                insn.address(),
                insn.mnemonic().unwrap_or_default(),
                insn.op_str().unwrap_or_default()
            );
        }
        out
    }
}

// GadgetVariant is the semantic classification of one gadget: the abstract,
// typed effect executing it has on the register file and memory. Every
// variant wraps the originating Gadget and adds only the operand fields
// needed to render and evaluate it. A gadget has exactly one variant.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum GadgetVariant {
    // dest = constant, popped from the stack slot at `offset` bytes
    LoadConst {
        dest: Register,
        offset: i64,
        gadget: Rc<Gadget>,
    },
    // dest = 0
    ClearReg { dest: Register, gadget: Rc<Gadget> },
    // dest += 1
    UnOp { dest: Register, gadget: Rc<Gadget> },
    // dest = src
    MovReg {
        dest: Register,
        src: Register,
        gadget: Rc<Gadget>,
    },
    // dest = src1 OP src2
    BinOp {
        dest: Register,
        src1: Register,
        op: Operation,
        src2: Register,
        gadget: Rc<Gadget>,
    },
    // dest = [addr_reg + offset]
    ReadMem {
        dest: Register,
        addr_reg: Register,
        offset: i64,
        gadget: Rc<Gadget>,
    },
    // [addr_reg + offset] = src
    WriteMem {
        addr_reg: Register,
        offset: i64,
        src: Register,
        gadget: Rc<Gadget>,
    },
    // dest OP= [addr_reg + offset]
    ReadMemOp {
        dest: Register,
        op: Operation,
        addr_reg: Register,
        offset: i64,
        gadget: Rc<Gadget>,
    },
    // [addr_reg + offset] OP= src
    WriteMemOp {
        addr_reg: Register,
        offset: i64,
        op: Operation,
        src: Register,
        gadget: Rc<Gadget>,
    },
    // flags into ah
    Lahf { gadget: Rc<Gadget> },
    // sp = sp OP reg
    StackPtrOp {
        op: Operation,
        reg: Register,
        gadget: Rc<Gadget>,
    },
    // catch-all: syscall triggers, bare rets, anything unclassifiable
    Other { gadget: Rc<Gadget> },
}

// GadgetVariant method impls
impl GadgetVariant {
    // gadget() returns the originating raw gadget.
    pub fn gadget(&self) -> &Rc<Gadget> {
        match self {
            GadgetVariant::LoadConst { gadget, .. }
            | GadgetVariant::ClearReg { gadget, .. }
            | GadgetVariant::UnOp { gadget, .. }
            | GadgetVariant::MovReg { gadget, .. }
            | GadgetVariant::BinOp { gadget, .. }
            | GadgetVariant::ReadMem { gadget, .. }
            | GadgetVariant::WriteMem { gadget, .. }
            | GadgetVariant::ReadMemOp { gadget, .. }
            | GadgetVariant::WriteMemOp { gadget, .. }
            | GadgetVariant::Lahf { gadget }
            | GadgetVariant::StackPtrOp { gadget, .. }
            | GadgetVariant::Other { gadget } => gadget,
        }
    }

    // quality() returns the originating gadget's ranking key.
    pub fn quality(&self) -> QualityKey {
        self.gadget().quality()
    }

    // kind_name() returns the variant's stable name, for the stats report.
    pub fn kind_name(&self) -> &'static str {
        match self {
            GadgetVariant::LoadConst { .. } => "LoadConst",
            GadgetVariant::ClearReg { .. } => "ClearReg",
            GadgetVariant::UnOp { .. } => "UnOp",
            GadgetVariant::MovReg { .. } => "MovReg",
            GadgetVariant::BinOp { .. } => "BinOp",
            GadgetVariant::ReadMem { .. } => "ReadMem",
            GadgetVariant::WriteMem { .. } => "WriteMem",
            GadgetVariant::ReadMemOp { .. } => "ReadMemOp",
            GadgetVariant::WriteMemOp { .. } => "WriteMemOp",
            GadgetVariant::Lahf { .. } => "Lahf",
            GadgetVariant::StackPtrOp { .. } => "StackPtrOp",
            GadgetVariant::Other { .. } => "Other",
        }
    }

    // dest() returns the register this variant's tracked effect writes, if
    // it writes exactly one.
    pub fn dest(&self) -> Option<Register> {
        match self {
            GadgetVariant::LoadConst { dest, .. }
            | GadgetVariant::ClearReg { dest, .. }
            | GadgetVariant::UnOp { dest, .. }
            | GadgetVariant::MovReg { dest, .. }
            | GadgetVariant::BinOp { dest, .. }
            | GadgetVariant::ReadMem { dest, .. }
            | GadgetVariant::ReadMemOp { dest, .. } => Some(*dest),
            // lahf loads the flag byte into ah
            GadgetVariant::Lahf { .. } => Some(Register::Ax),
            GadgetVariant::WriteMem { .. }
            | GadgetVariant::WriteMemOp { .. }
            | GadgetVariant::StackPtrOp { .. }
            | GadgetVariant::Other { .. } => None,
        }
    }

    // reads() returns the registers whose pre-execution value this
    // variant's effect consumes. The catch-all is maximally conservative: a
    // syscall trigger observes the whole register file.
    pub fn reads(&self) -> BTreeSet<Register> {
        let mut set = BTreeSet::new();
        match self {
            GadgetVariant::LoadConst { .. }
            | GadgetVariant::ClearReg { .. }
            | GadgetVariant::Lahf { .. } => {}
            GadgetVariant::UnOp { dest, .. } => {
                set.insert(*dest);
            }
            GadgetVariant::MovReg { src, .. } => {
                set.insert(*src);
            }
            GadgetVariant::BinOp { src1, src2, .. } => {
                set.insert(*src1);
                set.insert(*src2);
            }
            GadgetVariant::ReadMem { addr_reg, .. } => {
                set.insert(*addr_reg);
            }
            GadgetVariant::ReadMemOp { dest, addr_reg, .. } => {
                set.insert(*dest);
                set.insert(*addr_reg);
            }
            GadgetVariant::WriteMem { addr_reg, src, .. }
            | GadgetVariant::WriteMemOp { addr_reg, src, .. } => {
                set.insert(*addr_reg);
                set.insert(*src);
            }
            GadgetVariant::StackPtrOp { reg, .. } => {
                set.insert(*reg);
            }
            GadgetVariant::Other { .. } => {
                set.extend(Register::ALL);
            }
        }
        set
    }

    // load_offset() returns the stack-slot byte offset for a load-type
    // variant, zero otherwise.
    pub fn load_offset(&self) -> i64 {
        match self {
            GadgetVariant::LoadConst { offset, .. } => *offset,
            _ => 0,
        }
    }
}

// impl std::fmt::Display for GadgetVariant: the effect in assignment form,
// e.g. "eax = [ebx + 0x8]".
impl fmt::Display for GadgetVariant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let arch = self.gadget().arch;
        match self {
            GadgetVariant::LoadConst { dest, offset, .. } => {
                write!(f, "{} = pop [sp + {:#x}]", dest.name(arch), offset)
            }
            GadgetVariant::ClearReg { dest, .. } => write!(f, "{} = 0", dest.name(arch)),
            GadgetVariant::UnOp { dest, .. } => write!(f, "{} += 1", dest.name(arch)),
            GadgetVariant::MovReg { dest, src, .. } => {
                write!(f, "{} = {}", dest.name(arch), src.name(arch))
            }
            GadgetVariant::BinOp {
                dest,
                src1,
                op,
                src2,
                ..
            } => write!(
                f,
                "{} = {} {} {}",
                dest.name(arch),
                src1.name(arch),
                op,
                src2.name(arch)
            ),
            GadgetVariant::ReadMem {
                dest,
                addr_reg,
                offset,
                ..
            } => write!(
                f,
                "{} = [{} + {:#x}]",
                dest.name(arch),
                addr_reg.name(arch),
                offset
            ),
            GadgetVariant::WriteMem {
                addr_reg,
                offset,
                src,
                ..
            } => write!(
                f,
                "[{} + {:#x}] = {}",
                addr_reg.name(arch),
                offset,
                src.name(arch)
            ),
            GadgetVariant::ReadMemOp {
                dest,
                op,
                addr_reg,
                offset,
                ..
            } => write!(
                f,
                "{} {}= [{} + {:#x}]",
                dest.name(arch),
                op,
                addr_reg.name(arch),
                offset
            ),
            GadgetVariant::WriteMemOp {
                addr_reg,
                offset,
                op,
                src,
                ..
            } => write!(
                f,
                "[{} + {:#x}] {}= {}",
                addr_reg.name(arch),
                offset,
                op,
                src.name(arch)
            ),
            GadgetVariant::Lahf { .. } => write!(f, "lahf"),
            GadgetVariant::StackPtrOp { op, reg, .. } => {
                write!(f, "sp = sp {} {}", op, reg.name(arch))
            }
            GadgetVariant::Other { .. } => write!(f, "other"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_gadget(
        address: u64,
        len: u64,
        modified: &[Register],
        footprint: MemoryFootprint,
        stack_fix: i64,
    ) -> Rc<Gadget> {
        Rc::new(Gadget {
            bytes: vec![0xc3; len as usize],
            address,
            address_end: address + len,
            modified_regs: modified.iter().copied().collect(),
            footprint,
            stack_fix,
            retn: 0,
            arch: Arch::X86,
        })
    }

    #[test]
    fn quality_prefers_no_memory_dependency() {
        let clean = make_gadget(0x1000, 2, &[Register::Ax], MemoryFootprint::none(), 8);
        let deref = make_gadget(
            0x2000,
            2,
            &[Register::Ax],
            MemoryFootprint {
                bases: [MemBase::Reg(Register::Bx)].into_iter().collect(),
                simple: true,
            },
            8,
        );
        assert!(clean.quality() < deref.quality());
    }

    #[test]
    fn quality_penalizes_unknown_bases_hardest() {
        let unknown = make_gadget(
            0x1000,
            2,
            &[Register::Ax],
            MemoryFootprint {
                bases: [MemBase::Unknown].into_iter().collect(),
                simple: false,
            },
            8,
        );
        // more clobbers and a bigger stack fix, but attributable memory
        let messy = make_gadget(
            0x2000,
            8,
            &[Register::Ax, Register::Bx, Register::Cx],
            MemoryFootprint {
                bases: [MemBase::Reg(Register::Dx)].into_iter().collect(),
                simple: true,
            },
            24,
        );
        assert!(messy.quality() < unknown.quality());
    }

    #[test]
    fn quality_breaks_ties_lexicographically() {
        let fewer_clobbers =
            make_gadget(0x1000, 4, &[Register::Ax], MemoryFootprint::none(), 12);
        let more_clobbers = make_gadget(
            0x2000,
            2,
            &[Register::Ax, Register::Bx],
            MemoryFootprint::none(),
            8,
        );
        assert!(fewer_clobbers.quality() < more_clobbers.quality());

        let small_fix = make_gadget(0x3000, 4, &[Register::Ax], MemoryFootprint::none(), 8);
        let large_fix = make_gadget(0x4000, 2, &[Register::Ax], MemoryFootprint::none(), 12);
        assert!(small_fix.quality() < large_fix.quality());
    }

    #[test]
    fn sorting_by_quality_is_consistent_under_permutation() {
        let a = make_gadget(0x1000, 2, &[Register::Ax], MemoryFootprint::none(), 8);
        let b = make_gadget(0x2000, 4, &[Register::Ax, Register::Bx], MemoryFootprint::none(), 8);
        let c = make_gadget(
            0x3000,
            2,
            &[Register::Ax],
            MemoryFootprint {
                bases: [MemBase::Unknown].into_iter().collect(),
                simple: false,
            },
            8,
        );

        let mut fwd = vec![a.clone(), b.clone(), c.clone()];
        let mut rev = vec![c, b, a];
        fwd.sort_by_key(|g| g.quality());
        rev.sort_by_key(|g| g.quality());
        let fwd_keys: Vec<_> = fwd.iter().map(|g| g.quality()).collect();
        let rev_keys: Vec<_> = rev.iter().map(|g| g.quality()).collect();
        assert_eq!(fwd_keys, rev_keys);
    }

    #[test]
    fn single_base_requires_exactly_one_register() {
        let one = MemoryFootprint {
            bases: [MemBase::Reg(Register::Bx)].into_iter().collect(),
            simple: true,
        };
        assert_eq!(one.single_base(), Some(Register::Bx));

        let unknown = MemoryFootprint {
            bases: [MemBase::Unknown].into_iter().collect(),
            simple: true,
        };
        assert_eq!(unknown.single_base(), None);

        let two = MemoryFootprint {
            bases: [MemBase::Reg(Register::Bx), MemBase::Reg(Register::Cx)]
                .into_iter()
                .collect(),
            simple: true,
        };
        assert_eq!(two.single_base(), None);
        assert_eq!(MemoryFootprint::none().single_base(), None);
    }

    #[test]
    fn variant_rendering_uses_arch_register_names() {
        let g = make_gadget(0x1000, 3, &[Register::Ax], MemoryFootprint::none(), 8);
        let v = GadgetVariant::ReadMem {
            dest: Register::Ax,
            addr_reg: Register::Bx,
            offset: 8,
            gadget: g.clone(),
        };
        assert_eq!(v.to_string(), "eax = [ebx + 0x8]");

        let w = GadgetVariant::WriteMemOp {
            addr_reg: Register::Dx,
            offset: 0,
            op: Operation::Add,
            src: Register::Cx,
            gadget: g,
        };
        assert_eq!(w.to_string(), "[edx + 0x0] += ecx");
    }
}
