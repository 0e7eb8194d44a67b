/*  file:       discover.rs
    desc:       Gadget mining and semantic classification: scans executable
                segments for return-terminated instruction sequences,
                deduplicates them, and decorates each unique gadget with its
                register side effects, memory footprint, stack fix, and
                semantic variant.
 */

use crate::arch::{Arch, Operation, Register};
use crate::cli_args::GadgetConstraints;
use crate::error::Result;
use crate::gadget::{Gadget, GadgetVariant, MemBase, MemoryFootprint};
use capstone::arch::x86::{X86OpMem, X86Operand, X86OperandType};
use capstone::arch::{ArchOperand, BuildsCapstone, BuildsCapstoneSyntax};
use capstone::{Capstone, InsnGroupId, InsnGroupType, RegId};
use capstone_sys::{x86_insn, x86_reg};
use indicatif::{ParallelProgressIterator, ProgressStyle};
use log::info;
use object::{Object, ObjectSegment};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::rc::Rc;
use std::sync::Arc;

// constant-valued Capstone group IDs
const JMP_GRP_ID: InsnGroupId = InsnGroupId(InsnGroupType::CS_GRP_JUMP as u8);
const CALL_GRP_ID: InsnGroupId = InsnGroupId(InsnGroupType::CS_GRP_CALL as u8);
const RET_GRP_ID: InsnGroupId = InsnGroupId(InsnGroupType::CS_GRP_RET as u8);
const REL_BR_GRP_ID: InsnGroupId = InsnGroupId(InsnGroupType::CS_GRP_BRANCH_RELATIVE as u8);

// maximum encoded length of one x86 instruction
const MAX_INSN_LEN_BYTES: usize = 15;

// init_capstone() constructs a Capstone object for the given arch.
pub fn init_capstone(arch: Arch, enable_detail: bool) -> Result<Capstone> {
    Ok(Capstone::new()
        .x86()
        .mode(arch.to_cs_mode())
        .syntax(capstone::arch::x86::ArchSyntax::Intel)
        .detail(enable_detail)
        .build()?)
}

// discover_gadgets() scans every executable segment of the binary for
// return-terminated gadgets, deduplicates identical byte sequences (keeping
// the lowest address), and classifies each unique gadget into its semantic
// variant. The result is deterministic for a given binary.
pub fn discover_gadgets(
    bin: &object::File,
    arch: Arch,
    constraints: GadgetConstraints,
    filter: Option<&Regex>,
) -> Result<Vec<GadgetVariant>> {
    let mut found: Vec<(u64, Vec<u8>)> = Vec::new();

    for segment in bin.segments() {
        // only executable segments can hold gadgets
        if !match segment.flags() {
            object::SegmentFlags::Coff { characteristics } => {
                (characteristics & object::pe::IMAGE_SCN_MEM_EXECUTE) > 0
            }
            object::SegmentFlags::Elf { p_flags, .. } => (p_flags & object::elf::PF_X) > 0,
            object::SegmentFlags::MachO { initprot, .. } => {
                (initprot & object::macho::VM_PROT_EXECUTE) > 0
            }
            _ => false,
        } {
            continue;
        }

        // grab a copy of the segment contents we can slice up
        let seg_addr = segment.address();
        let seg_bytes: Arc<[u8]> = segment.data()?.into();

        // setup progress bar style
        let bar_str =
            "Scanning segment: {bar} [{pos}/{len} ({percent}%)] ({elapsed})".to_owned();
        let search_style = ProgressStyle::with_template(&bar_str).unwrap();

        // x86 instructions are unaligned: every byte offset is a valid
        // gadget start
        let max_window = MAX_INSN_LEN_BYTES * constraints.max_insns;
        let mut seg_found: Vec<(u64, Vec<u8>)> = (0..seg_bytes.len())
            .into_par_iter()
            .progress_with_style(search_style)
            .map(|ofs| {
                let end = seg_bytes.len().min(ofs + max_window);
                find_gadget(
                    &seg_bytes[ofs..end],
                    seg_addr + ofs as u64,
                    arch,
                    constraints,
                )
            })
            .flatten()
            .collect();
        found.append(&mut seg_found);
    }
    info!("{} gadget candidates", found.len());

    // deduplicate identical byte sequences, keeping the lowest address
    found.sort();
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    let unique: Vec<(u64, Vec<u8>)> = found
        .into_iter()
        .filter(|(_, bytes)| seen.insert(bytes.clone()))
        .collect();
    info!("{} unique gadgets", unique.len());

    // classify each unique gadget, applying the disassembly filter if one
    // was given
    let mut pool = Vec::new();
    for (addr, bytes) in unique {
        let variant = classify_gadget(&bytes, addr, arch)?;
        if let Some(re) = filter {
            if !re.is_match(&variant.gadget().disasm()) {
                continue;
            }
        }
        pool.push(variant);
    }
    if filter.is_some() {
        info!("{} unique gadgets after filtering", pool.len());
    }
    Ok(pool)
}

// find_gadget() disassembles forward from one candidate start offset and
// returns the byte sequence of a gadget if the sequence reaches a return
// within the instruction-count constraints. Jumps, calls, and relative
// branches never appear inside a usable gadget.
fn find_gadget(
    search_bytes: &[u8],
    addr: u64,
    arch: Arch,
    constraints: GadgetConstraints,
) -> Option<(u64, Vec<u8>)> {
    let cs = init_capstone(arch, true).ok()?;
    let insns = cs.disasm_all(search_bytes, addr).ok()?;

    let mut n_insns: usize = 0;
    for insn in insns.iter() {
        n_insns += 1;
        if n_insns > constraints.max_insns {
            return None;
        }
        let end_ofs = (insn.address() - addr) as usize + insn.len() as usize;
        let detail = cs.insn_detail(insn).ok()?;

        // relative branches are always direct jumps and therefore not allowed
        if detail.groups().contains(&REL_BR_GRP_ID) {
            return None;
        }
        // a return terminates the gadget
        if detail.groups().contains(&RET_GRP_ID) {
            if n_insns < constraints.min_insns {
                return None;
            }
            return Some((addr, search_bytes[..end_ofs].to_vec()));
        }
        // control transfers other than the terminating return are not usable
        if detail.groups().contains(&CALL_GRP_ID) || detail.groups().contains(&JMP_GRP_ID) {
            return None;
        }
    }

    // ran out of decodable bytes without finding a return
    None
}

// instruction shapes recognized by the first-instruction classifier,
// pending attachment of the finished Gadget record
enum Shape {
    Load { dest: Register, offset: i64 },
    Clear { dest: Register },
    Inc { dest: Register },
    Mov { dest: Register, src: Register },
    Bin { dest: Register, src1: Register, op: Operation, src2: Register },
    Read { dest: Register, addr_reg: Register, offset: i64 },
    Write { addr_reg: Register, offset: i64, src: Register },
    ReadOp { dest: Register, op: Operation, addr_reg: Register, offset: i64 },
    WriteOp { addr_reg: Register, offset: i64, op: Operation, src: Register },
    Lahf,
    SpOp { op: Operation, reg: Register },
    Other,
}

// classify_gadget() decodes one gadget's byte sequence and produces its
// semantic variant together with the decorated raw record: modified
// registers, memory footprint, stack fix, and return immediate. The
// classification is deterministic given the byte sequence.
pub fn classify_gadget(bytes: &[u8], address: u64, arch: Arch) -> Result<GadgetVariant> {
    let cs = init_capstone(arch, true)?;
    let insns = cs.disasm_all(bytes, address)?;
    let word = arch.word_bytes() as i64;

    let mut modified: BTreeSet<Register> = BTreeSet::new();
    let mut bases: BTreeSet<MemBase> = BTreeSet::new();
    let mut simple = true;
    // stack displacement accumulated by the gadget body
    let mut disp: i64 = 0;
    let mut retn: u16 = 0;
    let mut shape: Option<Shape> = None;

    for insn in insns.iter() {
        let insn_id = insn.id().0;
        let detail = cs.insn_detail(insn)?;
        let arch_detail = detail.arch_detail();
        let ops: Vec<X86Operand> = arch_detail
            .operands()
            .into_iter()
            .filter_map(|op| match op {
                ArchOperand::X86Operand(op) => Some(op),
                _ => None,
            })
            .collect();

        // the trailing return consumes one word plus its immediate
        if detail.groups().contains(&RET_GRP_ID) {
            if let Some(X86OperandType::Imm(imm)) = ops.first().map(|o| o.op_type.clone()) {
                retn = imm as u16;
            }
            disp += word + retn as i64;
            break;
        }

        // implicitly written registers
        for reg_id in detail.regs_write() {
            if let Some(reg) = reg_any(*reg_id) {
                modified.insert(reg);
            }
        }
        // the first operand of data/ALU instructions is written; xchg
        // writes both of its operands
        if !is_read_only_dest(insn_id) {
            if let Some(X86OperandType::Reg(reg_id)) = ops.first().map(|o| o.op_type.clone()) {
                if let Some(reg) = reg_any(reg_id) {
                    modified.insert(reg);
                }
            }
        }
        if insn_id == x86_insn::X86_INS_XCHG as u32 {
            if let Some(X86OperandType::Reg(reg_id)) = ops.get(1).map(|o| o.op_type.clone()) {
                if let Some(reg) = reg_any(reg_id) {
                    modified.insert(reg);
                }
            }
        }

        // memory footprint: attribute every dereference to its base register
        for op in &ops {
            if let X86OperandType::Mem(mem) = op.op_type.clone() {
                if mem.index().0 != 0 {
                    simple = false;
                }
                match nonzero_reg(mem.base()).map(reg_any) {
                    Some(Some(reg)) => {
                        bases.insert(MemBase::Reg(reg));
                    }
                    // untracked base (e.g. rip-relative) or absolute address
                    _ => {
                        bases.insert(MemBase::Unknown);
                        simple = false;
                    }
                }
            }
        }

        // classify by the first semantic instruction; nops and constant
        // stack-pointer adjustments are shape-transparent, and everything
        // after the first only contributes clobbers, footprint, and stack
        // displacement
        let sp_adjust = constant_sp_adjust(insn_id, &ops);
        if shape.is_none() && insn_id != x86_insn::X86_INS_NOP as u32 && sp_adjust.is_none() {
            shape = Some(classify_insn(insn_id, &ops, arch, disp));
        }

        // track the stack displacement of pops, pushes, and constant
        // stack-pointer adjustments
        if insn_id == x86_insn::X86_INS_POP as u32 {
            disp += word;
        } else if insn_id == x86_insn::X86_INS_PUSH as u32 {
            disp -= word;
        } else if let Some(delta) = sp_adjust {
            disp += delta;
        }
    }

    // stack movement is accounted by stack_fix, not the clobber set
    modified.remove(&Register::Sp);

    let gadget = Rc::new(Gadget {
        bytes: bytes.to_vec(),
        address,
        address_end: address + bytes.len() as u64,
        modified_regs: modified,
        footprint: MemoryFootprint { bases, simple },
        stack_fix: disp,
        retn,
        arch,
    });

    Ok(match shape.unwrap_or(Shape::Other) {
        Shape::Load { dest, offset } => GadgetVariant::LoadConst { dest, offset, gadget },
        Shape::Clear { dest } => GadgetVariant::ClearReg { dest, gadget },
        Shape::Inc { dest } => GadgetVariant::UnOp { dest, gadget },
        Shape::Mov { dest, src } => GadgetVariant::MovReg { dest, src, gadget },
        Shape::Bin { dest, src1, op, src2 } => {
            GadgetVariant::BinOp { dest, src1, op, src2, gadget }
        }
        Shape::Read { dest, addr_reg, offset } => {
            GadgetVariant::ReadMem { dest, addr_reg, offset, gadget }
        }
        Shape::Write { addr_reg, offset, src } => {
            GadgetVariant::WriteMem { addr_reg, offset, src, gadget }
        }
        Shape::ReadOp { dest, op, addr_reg, offset } => {
            GadgetVariant::ReadMemOp { dest, op, addr_reg, offset, gadget }
        }
        Shape::WriteOp { addr_reg, offset, op, src } => {
            GadgetVariant::WriteMemOp { addr_reg, offset, op, src, gadget }
        }
        Shape::Lahf => GadgetVariant::Lahf { gadget },
        Shape::SpOp { op, reg } => GadgetVariant::StackPtrOp { op, reg, gadget },
        Shape::Other => GadgetVariant::Other { gadget },
    })
}

// classify_insn() maps the gadget's first instruction to its shape.
// `slot` is the stack offset a pop at this point would consume.
fn classify_insn(insn_id: u32, ops: &[X86Operand], arch: Arch, slot: i64) -> Shape {
    let is = |id: x86_insn| insn_id == id as u32;

    if is(x86_insn::X86_INS_POP) {
        // a slot below the chain cursor cannot be filled by the payload
        if slot >= 0 {
            if let Some(dest) = op_full_reg(ops, 0, arch) {
                return Shape::Load { dest, offset: slot };
            }
        }
        return Shape::Other;
    }
    if is(x86_insn::X86_INS_LAHF) {
        return Shape::Lahf;
    }
    if is(x86_insn::X86_INS_INC) {
        if let Some(dest) = op_full_reg(ops, 0, arch) {
            return Shape::Inc { dest };
        }
        return Shape::Other;
    }
    if is(x86_insn::X86_INS_MOV) {
        match (op_full_reg(ops, 0, arch), op_full_reg(ops, 1, arch)) {
            (Some(dest), Some(src)) => return Shape::Mov { dest, src },
            (Some(dest), None) => {
                if op_imm(ops, 1) == Some(0) {
                    return Shape::Clear { dest };
                }
                if let Some((addr_reg, offset)) = op_simple_mem(ops, 1) {
                    return Shape::Read { dest, addr_reg, offset };
                }
            }
            (None, Some(src)) => {
                if let Some((addr_reg, offset)) = op_simple_mem(ops, 0) {
                    return Shape::Write { addr_reg, offset, src };
                }
            }
            _ => {}
        }
        return Shape::Other;
    }

    // two-operand ALU instructions
    let alu_op = if is(x86_insn::X86_INS_ADD) {
        Some(Operation::Add)
    } else if is(x86_insn::X86_INS_SUB) {
        Some(Operation::Sub)
    } else if is(x86_insn::X86_INS_XOR) {
        Some(Operation::Xor)
    } else if is(x86_insn::X86_INS_OR) {
        Some(Operation::Or)
    } else if is(x86_insn::X86_INS_AND) {
        Some(Operation::And)
    } else if is(x86_insn::X86_INS_IMUL) {
        Some(Operation::Mul)
    } else {
        None
    };
    if let Some(op) = alu_op {
        if ops.len() != 2 {
            return Shape::Other;
        }
        match (op_full_reg(ops, 0, arch), op_full_reg(ops, 1, arch)) {
            (Some(dest), Some(src)) => {
                // xor r,r and sub r,r are zeroing idioms
                if dest == src && matches!(op, Operation::Xor | Operation::Sub) {
                    return Shape::Clear { dest };
                }
                if dest == Register::Sp && matches!(op, Operation::Add | Operation::Sub) {
                    return Shape::SpOp { op, reg: src };
                }
                return Shape::Bin { dest, src1: dest, op, src2: src };
            }
            (Some(dest), None) => {
                if op_imm(ops, 1) == Some(0) && matches!(op, Operation::And) {
                    return Shape::Clear { dest };
                }
                if let Some((addr_reg, offset)) = op_simple_mem(ops, 1) {
                    return Shape::ReadOp { dest, op, addr_reg, offset };
                }
            }
            (None, Some(src)) => {
                if let Some((addr_reg, offset)) = op_simple_mem(ops, 0) {
                    return Shape::WriteOp { addr_reg, offset, op, src };
                }
            }
            _ => {}
        }
        return Shape::Other;
    }

    // everything else, syscall triggers included, falls into the catch-all
    Shape::Other
}

// constant_sp_adjust() returns the signed stack displacement of an
// `add sp, imm` / `sub sp, imm` instruction, None for anything else.
fn constant_sp_adjust(insn_id: u32, ops: &[X86Operand]) -> Option<i64> {
    let sign = if insn_id == x86_insn::X86_INS_ADD as u32 {
        1
    } else if insn_id == x86_insn::X86_INS_SUB as u32 {
        -1
    } else {
        return None;
    };
    if let (Some(X86OperandType::Reg(reg_id)), Some(X86OperandType::Imm(imm))) = (
        ops.first().map(|o| o.op_type.clone()),
        ops.get(1).map(|o| o.op_type.clone()),
    ) {
        if reg_any(reg_id) == Some(Register::Sp) {
            return Some(sign * imm);
        }
    }
    None
}

// is_read_only_dest() returns true for instructions whose first operand is
// only read.
fn is_read_only_dest(insn_id: u32) -> bool {
    insn_id == x86_insn::X86_INS_PUSH as u32
        || insn_id == x86_insn::X86_INS_CMP as u32
        || insn_id == x86_insn::X86_INS_TEST as u32
}

// op_full_reg() returns operand `idx` as a tracked full-width register.
fn op_full_reg(ops: &[X86Operand], idx: usize, arch: Arch) -> Option<Register> {
    match ops.get(idx).map(|o| o.op_type.clone()) {
        Some(X86OperandType::Reg(reg_id)) => reg_full(reg_id, arch),
        _ => None,
    }
}

// op_imm() returns operand `idx` as an immediate.
fn op_imm(ops: &[X86Operand], idx: usize) -> Option<i64> {
    match ops.get(idx).map(|o| o.op_type.clone()) {
        Some(X86OperandType::Imm(imm)) => Some(imm),
        _ => None,
    }
}

// op_simple_mem() returns operand `idx` as a (base register, constant
// offset) pair, for accesses with no index register and an attributable
// base.
fn op_simple_mem(ops: &[X86Operand], idx: usize) -> Option<(Register, i64)> {
    let mem: X86OpMem = match ops.get(idx).map(|o| o.op_type.clone()) {
        Some(X86OperandType::Mem(mem)) => mem,
        _ => None?,
    };
    if mem.index().0 != 0 {
        return None;
    }
    let base = reg_any(nonzero_reg(mem.base())?)?;
    Some((base, mem.disp()))
}

// nonzero_reg() filters out the invalid (absent) register id.
fn nonzero_reg(reg_id: RegId) -> Option<RegId> {
    (reg_id.0 != 0).then_some(reg_id)
}

// reg_any() maps any width of a tracked register (rax/eax/ax/ah/al, ...)
// onto its logical Register, for clobber and footprint attribution.
fn reg_any(reg_id: RegId) -> Option<Register> {
    use capstone_sys::x86_reg::*;
    let id = reg_id.0 as u32;
    let groups: [(&[x86_reg::Type], Register); 8] = [
        (
            &[X86_REG_RAX, X86_REG_EAX, X86_REG_AX, X86_REG_AH, X86_REG_AL],
            Register::Ax,
        ),
        (
            &[X86_REG_RBX, X86_REG_EBX, X86_REG_BX, X86_REG_BH, X86_REG_BL],
            Register::Bx,
        ),
        (
            &[X86_REG_RCX, X86_REG_ECX, X86_REG_CX, X86_REG_CH, X86_REG_CL],
            Register::Cx,
        ),
        (
            &[X86_REG_RDX, X86_REG_EDX, X86_REG_DX, X86_REG_DH, X86_REG_DL],
            Register::Dx,
        ),
        (
            &[X86_REG_RSI, X86_REG_ESI, X86_REG_SI, X86_REG_SIL],
            Register::Si,
        ),
        (
            &[X86_REG_RDI, X86_REG_EDI, X86_REG_DI, X86_REG_DIL],
            Register::Di,
        ),
        (
            &[X86_REG_RBP, X86_REG_EBP, X86_REG_BP, X86_REG_BPL],
            Register::Bp,
        ),
        (
            &[X86_REG_RSP, X86_REG_ESP, X86_REG_SP, X86_REG_SPL],
            Register::Sp,
        ),
    ];
    groups
        .iter()
        .find(|(ids, _)| ids.iter().any(|r| *r as u32 == id))
        .map(|(_, reg)| *reg)
}

// reg_full() maps a register id onto its logical Register only when it is
// the full pointer-width register for the given arch.
fn reg_full(reg_id: RegId, arch: Arch) -> Option<Register> {
    use capstone_sys::x86_reg::*;
    let id = reg_id.0 as u32;
    let table: [(x86_reg::Type, Register); 8] = match arch {
        Arch::X86 => [
            (X86_REG_EAX, Register::Ax),
            (X86_REG_EBX, Register::Bx),
            (X86_REG_ECX, Register::Cx),
            (X86_REG_EDX, Register::Dx),
            (X86_REG_ESI, Register::Si),
            (X86_REG_EDI, Register::Di),
            (X86_REG_EBP, Register::Bp),
            (X86_REG_ESP, Register::Sp),
        ],
        Arch::X86_64 => [
            (X86_REG_RAX, Register::Ax),
            (X86_REG_RBX, Register::Bx),
            (X86_REG_RCX, Register::Cx),
            (X86_REG_RDX, Register::Dx),
            (X86_REG_RSI, Register::Si),
            (X86_REG_RDI, Register::Di),
            (X86_REG_RBP, Register::Bp),
            (X86_REG_RSP, Register::Sp),
        ],
    };
    table
        .iter()
        .find(|(r, _)| *r as u32 == id)
        .map(|(_, reg)| *reg)
}
