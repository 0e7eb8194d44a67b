/*  file:       chain.rs
    desc:       GadgetBox, RopChainKernel, and RopChain: scheduled gadget
                uses, the minimal sequences that establish one register's
                value, and the full ordered payload with symbolic
                evaluation, dead-step elimination, and serialization.
 */

use crate::arch::Register;
use crate::gadget::GadgetVariant;
use std::collections::{BTreeSet, HashMap};

// filler word for stack slots the chain consumes but does not care about
const JUNK: u64 = 0xdead_beef_dead_beef;

// GadgetBox is a single scheduled use of one gadget. `value` is the
// constant the gadget's load slot will hold at execution time; it is only
// meaningful for load-type variants and None otherwise (or when the
// register has no externally-required value yet).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GadgetBox {
    pub variant: GadgetVariant,
    pub value: Option<u64>,
}

// GadgetBox method impls
impl GadgetBox {
    pub fn new(variant: GadgetVariant, value: Option<u64>) -> Self {
        GadgetBox { variant, value }
    }
}

// RopChainKernel is an ordered sequence of GadgetBoxes whose execution
// leaves exactly one target register (the destination of the last box)
// holding a well-defined value.
#[derive(Clone, Debug, Default)]
pub struct RopChainKernel {
    pub boxes: Vec<GadgetBox>,
}

// RopChainKernel method impls
impl RopChainKernel {
    pub fn new(boxes: Vec<GadgetBox>) -> Self {
        RopChainKernel { boxes }
    }

    pub fn empty() -> Self {
        RopChainKernel { boxes: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    // dest() returns the kernel's target register.
    pub fn dest(&self) -> Option<Register> {
        self.boxes.last().and_then(|b| b.variant.dest())
    }

    // modified_regs() returns every register the kernel clobbers on the
    // side, i.e. the union of its boxes' clobber sets minus the target.
    pub fn modified_regs(&self) -> BTreeSet<Register> {
        let mut set = BTreeSet::new();
        for b in &self.boxes {
            set.extend(b.variant.gadget().modified_regs.iter().copied());
        }
        if let Some(dest) = self.dest() {
            set.remove(&dest);
        }
        set
    }

    // specialize() duplicates the kernel and overrides exactly the terminal
    // load value, preserving the rest of the sequence by value. Duplication
    // rather than aliasing keeps two specializations of the same base
    // kernel independent.
    pub fn specialize(&self, value: u64) -> Self {
        let mut copy = self.clone();
        if let Some(last) = copy.boxes.last_mut() {
            last.value = Some(value);
        }
        copy
    }

    // add() extends the kernel with a new scheduled gadget.
    pub fn add(&mut self, variant: GadgetVariant, value: Option<u64>) {
        self.boxes.push(GadgetBox::new(variant, value));
    }
}

// RopChain is the ordered composition of kernels forming (part of) the
// final payload: the unit that gets evaluated, simplified, and serialized.
#[derive(Clone, Debug, Default)]
pub struct RopChain {
    pub boxes: Vec<GadgetBox>,
}

// RopChain method impls
impl RopChain {
    // from_kernels() concatenates the given kernels' boxes, in order.
    pub fn from_kernels<'a>(kernels: impl IntoIterator<Item = &'a RopChainKernel>) -> Self {
        let boxes = kernels
            .into_iter()
            .flat_map(|k| k.boxes.iter().cloned())
            .collect();
        RopChain { boxes }
    }

    // add() appends one more scheduled gadget (the terminal syscall
    // trigger, usually).
    pub fn add(&mut self, variant: GadgetVariant, value: Option<u64>) {
        self.boxes.push(GadgetBox::new(variant, value));
    }

    // evaluate() symbolically executes the chain, folding each box's effect
    // into a register -> value map. Clobbered registers drop out of the map
    // (their value is unknown); tracked effects re-insert their
    // destination. Later writes overwrite earlier ones.
    pub fn evaluate(&self) -> HashMap<Register, u64> {
        let mut regs: HashMap<Register, u64> = HashMap::new();
        let Some(first) = self.boxes.first() else {
            return regs;
        };
        let arch = first.variant.gadget().arch;
        let mask = arch.max_int();

        for b in &self.boxes {
            // source values are read from the pre-execution state
            let pre = regs.clone();
            for reg in &b.variant.gadget().modified_regs {
                regs.remove(reg);
            }
            match &b.variant {
                GadgetVariant::LoadConst { dest, .. } => match b.value {
                    Some(v) => {
                        regs.insert(*dest, v & mask);
                    }
                    None => {
                        regs.remove(dest);
                    }
                },
                GadgetVariant::ClearReg { dest, .. } => {
                    regs.insert(*dest, 0);
                }
                GadgetVariant::UnOp { dest, .. } => match pre.get(dest) {
                    Some(v) => {
                        regs.insert(*dest, v.wrapping_add(1) & mask);
                    }
                    None => {
                        regs.remove(dest);
                    }
                },
                GadgetVariant::MovReg { dest, src, .. } => match pre.get(src) {
                    Some(v) => {
                        regs.insert(*dest, *v);
                    }
                    None => {
                        regs.remove(dest);
                    }
                },
                GadgetVariant::BinOp {
                    dest,
                    src1,
                    op,
                    src2,
                    ..
                } => match (pre.get(src1), pre.get(src2)) {
                    (Some(a), Some(c)) => match op.apply(*a, *c, arch) {
                        Some(v) => {
                            regs.insert(*dest, v);
                        }
                        None => {
                            regs.remove(dest);
                        }
                    },
                    _ => {
                        regs.remove(dest);
                    }
                },
                // a dependent read: the box's assigned value is what the
                // scratch slot is intended to hold
                GadgetVariant::ReadMem { dest, .. } => match b.value {
                    Some(v) => {
                        regs.insert(*dest, v & mask);
                    }
                    None => {
                        regs.remove(dest);
                    }
                },
                // memory contents are not tracked, so the result is unknown
                GadgetVariant::ReadMemOp { dest, .. } => {
                    regs.remove(dest);
                }
                GadgetVariant::WriteMem { .. } | GadgetVariant::WriteMemOp { .. } => {}
                GadgetVariant::Lahf { .. } => {
                    regs.remove(&Register::Ax);
                }
                GadgetVariant::StackPtrOp { .. } => {}
                GadgetVariant::Other { .. } => {}
            }
        }
        regs
    }

    // simplify() removes dead load steps: a box is dropped only when it is
    // a pure single-register load (LoadConst/ClearReg with no extra
    // clobbers) whose destination is overwritten by a strictly later box
    // before anything reads it. This never changes the chain's final
    // evaluated state.
    pub fn simplify(&mut self) {
        let mut keep = vec![true; self.boxes.len()];
        for i in 0..self.boxes.len() {
            let bi = &self.boxes[i];
            let dest = match &bi.variant {
                GadgetVariant::LoadConst { dest, .. } | GadgetVariant::ClearReg { dest, .. } => {
                    *dest
                }
                _ => continue,
            };
            if !bi.variant.gadget().modified_regs.iter().all(|r| *r == dest) {
                continue;
            }
            for j in (i + 1)..self.boxes.len() {
                let bj = &self.boxes[j];
                if bj.variant.reads().contains(&dest) {
                    break;
                }
                if bj.variant.dest() == Some(dest)
                    || bj.variant.gadget().modified_regs.contains(&dest)
                {
                    keep[i] = false;
                    break;
                }
            }
        }
        let mut flags = keep.into_iter();
        self.boxes.retain(|_| flags.next().unwrap());
    }

    // dump() renders the chain as one line per step: address, raw bytes,
    // disassembly, and the abstract effect with its assigned value.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for b in &self.boxes {
            let g = b.variant.gadget();
            let hex: String = g.bytes.iter().map(|byte| format!("{byte:02x}")).collect();
            out += &format!(
                "{:#010x}  {:<20}  {:<44}; {}",
                g.address,
                hex,
                g.disasm(),
                b.variant
            );
            if let Some(v) = b.value {
                out += &format!(" = {v:#x}");
            }
            out.push('\n');
        }
        out
    }

    // payload() serializes the chain into the byte string placed on the
    // victim stack: each gadget's address followed by the stack slots its
    // body consumes, with the assigned value at the load slot's offset and
    // filler everywhere else. A `ret imm16` skips bytes after popping the
    // next address, so its filler lands after the following gadget's
    // address word.
    pub fn payload(&self) -> Vec<u8> {
        let Some(first) = self.boxes.first() else {
            return Vec::new();
        };
        let arch = first.variant.gadget().arch;
        let word = arch.word_bytes() as usize;
        let mask = arch.max_int();
        let mut out = Vec::new();
        let mut pending_retn = 0usize;

        for b in &self.boxes {
            let g = b.variant.gadget();
            push_word(&mut out, g.address & mask, word);
            for i in 0..pending_retn {
                out.push(JUNK.to_le_bytes()[i % 8]);
            }
            pending_retn = g.retn as usize;

            let body_bytes = (g.stack_fix - word as i64 - g.retn as i64).max(0) as usize;
            let slots = body_bytes / word;
            let value_slot = (b.variant.load_offset() / word as i64).max(0) as usize;
            for slot in 0..slots {
                let is_load = matches!(b.variant, GadgetVariant::LoadConst { .. });
                match b.value {
                    Some(v) if is_load && slot == value_slot => {
                        push_word(&mut out, v & mask, word)
                    }
                    _ => push_word(&mut out, JUNK & mask, word),
                }
            }
        }
        out
    }
}

// push_word() appends a little-endian pointer-width word.
fn push_word(out: &mut Vec<u8>, value: u64, word: usize) {
    out.extend_from_slice(&value.to_le_bytes()[..word]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Arch, Operation, Register};
    use crate::gadget::{Gadget, MemoryFootprint};
    use std::rc::Rc;

    fn make_gadget(address: u64, modified: &[Register], stack_fix: i64) -> Rc<Gadget> {
        Rc::new(Gadget {
            bytes: vec![0x58, 0xc3],
            address,
            address_end: address + 2,
            modified_regs: modified.iter().copied().collect(),
            footprint: MemoryFootprint::none(),
            stack_fix,
            retn: 0,
            arch: Arch::X86,
        })
    }

    fn load(dest: Register, address: u64, value: u64) -> GadgetBox {
        GadgetBox::new(
            GadgetVariant::LoadConst {
                dest,
                offset: 0,
                gadget: make_gadget(address, &[dest], 8),
            },
            Some(value),
        )
    }

    #[test]
    fn evaluate_later_writes_win() {
        let chain = RopChain {
            boxes: vec![
                load(Register::Ax, 0x1000, 1),
                load(Register::Ax, 0x2000, 2),
            ],
        };
        let regs = chain.evaluate();
        assert_eq!(regs.get(&Register::Ax), Some(&2));
    }

    #[test]
    fn evaluate_clobbers_drop_out_of_the_map() {
        // second box loads bx but also clobbers ax as a side effect
        let clobbering = GadgetBox::new(
            GadgetVariant::LoadConst {
                dest: Register::Bx,
                offset: 0,
                gadget: make_gadget(0x2000, &[Register::Bx, Register::Ax], 12),
            },
            Some(7),
        );
        let chain = RopChain {
            boxes: vec![load(Register::Ax, 0x1000, 1), clobbering],
        };
        let regs = chain.evaluate();
        assert_eq!(regs.get(&Register::Ax), None);
        assert_eq!(regs.get(&Register::Bx), Some(&7));
    }

    #[test]
    fn evaluate_propagates_moves_and_binops() {
        let mov = GadgetBox::new(
            GadgetVariant::MovReg {
                dest: Register::Cx,
                src: Register::Ax,
                gadget: make_gadget(0x2000, &[Register::Cx], 4),
            },
            None,
        );
        let add = GadgetBox::new(
            GadgetVariant::BinOp {
                dest: Register::Dx,
                src1: Register::Ax,
                op: Operation::Add,
                src2: Register::Cx,
                gadget: make_gadget(0x3000, &[Register::Dx], 4),
            },
            None,
        );
        let chain = RopChain {
            boxes: vec![load(Register::Ax, 0x1000, 21), mov, add],
        };
        let regs = chain.evaluate();
        assert_eq!(regs.get(&Register::Cx), Some(&21));
        assert_eq!(regs.get(&Register::Dx), Some(&42));
    }

    #[test]
    fn evaluate_masks_to_pointer_width() {
        let chain = RopChain {
            boxes: vec![load(Register::Ax, 0x1000, 0x1_0000_0001)],
        };
        let regs = chain.evaluate();
        assert_eq!(regs.get(&Register::Ax), Some(&1));
    }

    #[test]
    fn specialize_duplicates_instead_of_aliasing() {
        let kernel = RopChainKernel::new(vec![load(Register::Ax, 0x1000, 1)]);
        let special = kernel.specialize(0xbeef);
        assert_eq!(kernel.boxes[0].value, Some(1));
        assert_eq!(special.boxes[0].value, Some(0xbeef));
    }

    #[test]
    fn kernel_modified_regs_excludes_the_target() {
        let mut kernel = RopChainKernel::new(vec![load(Register::Bx, 0x1000, 1)]);
        kernel.add(
            GadgetVariant::LoadConst {
                dest: Register::Ax,
                offset: 0,
                gadget: make_gadget(0x2000, &[Register::Ax, Register::Cx], 12),
            },
            Some(2),
        );
        assert_eq!(kernel.dest(), Some(Register::Ax));
        let modified = kernel.modified_regs();
        assert!(modified.contains(&Register::Bx));
        assert!(modified.contains(&Register::Cx));
        assert!(!modified.contains(&Register::Ax));
    }

    #[test]
    fn simplify_drops_overwritten_loads() {
        let mut chain = RopChain {
            boxes: vec![
                load(Register::Ax, 0x1000, 1),
                load(Register::Ax, 0x2000, 2),
            ],
        };
        let before = chain.evaluate();
        chain.simplify();
        assert_eq!(chain.boxes.len(), 1);
        assert_eq!(chain.evaluate(), before);
    }

    #[test]
    fn simplify_keeps_loads_that_are_read_first() {
        let write = GadgetBox::new(
            GadgetVariant::WriteMem {
                addr_reg: Register::Bx,
                offset: 0,
                src: Register::Cx,
                gadget: make_gadget(0x3000, &[], 4),
            },
            None,
        );
        let mut chain = RopChain {
            boxes: vec![
                load(Register::Bx, 0x1000, 0x8000),
                load(Register::Cx, 0x2000, 0x41),
                write,
                load(Register::Bx, 0x4000, 0x9000),
            ],
        };
        let before_len = chain.boxes.len();
        chain.simplify();
        // the first bx load feeds the memory write, nothing may be removed
        assert_eq!(chain.boxes.len(), before_len);
    }

    #[test]
    fn simplify_never_touches_boxes_with_extra_clobbers() {
        // loading ax also trashes dx; a later dx load must not allow
        // removal of this step's dx effect by accident
        let messy = GadgetBox::new(
            GadgetVariant::LoadConst {
                dest: Register::Ax,
                offset: 0,
                gadget: make_gadget(0x1000, &[Register::Ax, Register::Dx], 12),
            },
            Some(1),
        );
        let mut chain = RopChain {
            boxes: vec![messy, load(Register::Ax, 0x2000, 2)],
        };
        chain.simplify();
        assert_eq!(chain.boxes.len(), 2);
    }

    #[test]
    fn payload_places_values_in_load_slots() {
        let chain = RopChain {
            boxes: vec![load(Register::Ax, 0x1000, 0xb)],
        };
        let payload = chain.payload();
        // gadget address word, then the popped value word
        assert_eq!(payload.len(), 8);
        assert_eq!(&payload[0..4], &0x1000u32.to_le_bytes());
        assert_eq!(&payload[4..8], &0xbu32.to_le_bytes());
    }

    #[test]
    fn payload_pads_extra_pop_slots_with_filler() {
        // pop ax; pop si; ret consumes two slots, value in the first
        let multi = GadgetBox::new(
            GadgetVariant::LoadConst {
                dest: Register::Ax,
                offset: 0,
                gadget: make_gadget(0x1000, &[Register::Ax, Register::Si], 12),
            },
            Some(0x1234),
        );
        let payload = RopChain { boxes: vec![multi] }.payload();
        assert_eq!(payload.len(), 12);
        assert_eq!(&payload[4..8], &0x1234u32.to_le_bytes());
        assert_eq!(&payload[8..12], &(JUNK as u32).to_le_bytes());
    }

    #[test]
    fn payload_emits_ret_imm_filler_after_next_address() {
        let mut popping = make_gadget(0x1000, &[Register::Ax], 16);
        Rc::get_mut(&mut popping).unwrap().retn = 8;
        let first = GadgetBox::new(
            GadgetVariant::LoadConst {
                dest: Register::Ax,
                offset: 0,
                gadget: popping,
            },
            Some(0x55),
        );
        let second = load(Register::Bx, 0x2000, 0x66);
        let payload = RopChain {
            boxes: vec![first, second],
        }
        .payload();
        // addr1, value, addr2, 8 filler bytes skipped by ret 8, value2
        assert_eq!(&payload[0..4], &0x1000u32.to_le_bytes());
        assert_eq!(&payload[4..8], &0x55u32.to_le_bytes());
        assert_eq!(&payload[8..12], &0x2000u32.to_le_bytes());
        assert_eq!(&payload[20..24], &0x66u32.to_le_bytes());
        assert_eq!(payload.len(), 24);
    }
}
