/*  file:       arch.rs
    desc:       Architecture context for the target CPU mode: the tracked
                register set, pointer width, and capstone mode. Constructed
                once from the parsed binary and passed explicitly to every
                component that needs it.
 */

use std::fmt;

// Arch describes the target CPU mode. Chain construction only makes sense
// for the two x86 flavors: the execve ABI, the stack-slot serialization,
// and the gadget classifier all assume them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    X86_64,
}

// The eight tracked general-purpose registers. One logical name covers both
// the 32- and 64-bit variant; rendering picks the right spelling from the
// Arch. Ordered and hashable so register sets can live in BTreeSets and
// iteration over them is deterministic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Register {
    Ax,
    Bx,
    Cx,
    Dx,
    Si,
    Di,
    Bp,
    Sp,
}

// Operations tag arithmetic gadget variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Add,
    Sub,
    Mul,
    Div,
    Xor,
    Or,
    And,
}

// Arch method impls
impl Arch {
    // from_obj_arch() returns the corresponding Arch for a given
    // object::Architecture, or None for anything the chain builder can't
    // target.
    pub fn from_obj_arch(arch: object::Architecture) -> Option<Self> {
        match arch {
            object::Architecture::I386 => Some(Arch::X86),
            object::Architecture::X86_64 | object::Architecture::X86_64_X32 => Some(Arch::X86_64),
            _ => None,
        }
    }

    // to_cs_mode() returns the capstone disassembly mode for this Arch.
    pub fn to_cs_mode(&self) -> capstone::arch::x86::ArchMode {
        match self {
            Arch::X86 => capstone::arch::x86::ArchMode::Mode32,
            Arch::X86_64 => capstone::arch::x86::ArchMode::Mode64,
        }
    }

    // bits() returns the pointer width in bits.
    pub fn bits(&self) -> u32 {
        match self {
            Arch::X86 => 32,
            Arch::X86_64 => 64,
        }
    }

    // word_bytes() returns the pointer width in bytes.
    pub fn word_bytes(&self) -> u64 {
        (self.bits() / 8) as u64
    }

    // max_int() returns the largest representable unsigned integer for this
    // pointer width.
    pub fn max_int(&self) -> u64 {
        match self {
            Arch::X86 => u32::MAX as u64,
            Arch::X86_64 => u64::MAX,
        }
    }

    // registers() returns the fixed, ordered register set for this arch.
    pub fn registers(&self) -> &'static [Register] {
        &Register::ALL
    }
}

// impl std::fmt::Display for Arch
impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Arch::X86 => write!(f, "x86"),
            Arch::X86_64 => write!(f, "x86_64"),
        }
    }
}

// Register method impls
impl Register {
    // every tracked register, in a fixed order
    pub const ALL: [Register; 8] = [
        Register::Ax,
        Register::Bx,
        Register::Cx,
        Register::Dx,
        Register::Si,
        Register::Di,
        Register::Bp,
        Register::Sp,
    ];

    // name() returns the architecture-specific register name.
    pub fn name(&self, arch: Arch) -> &'static str {
        match arch {
            Arch::X86 => match self {
                Register::Ax => "eax",
                Register::Bx => "ebx",
                Register::Cx => "ecx",
                Register::Dx => "edx",
                Register::Si => "esi",
                Register::Di => "edi",
                Register::Bp => "ebp",
                Register::Sp => "esp",
            },
            Arch::X86_64 => match self {
                Register::Ax => "rax",
                Register::Bx => "rbx",
                Register::Cx => "rcx",
                Register::Dx => "rdx",
                Register::Si => "rsi",
                Register::Di => "rdi",
                Register::Bp => "rbp",
                Register::Sp => "rsp",
            },
        }
    }
}

// Operation method impls
impl Operation {
    // apply() evaluates the operation over two register-sized values,
    // wrapping and masking to the arch's pointer width. Division by zero
    // has no defined result.
    pub fn apply(&self, lhs: u64, rhs: u64, arch: Arch) -> Option<u64> {
        let result = match self {
            Operation::Add => lhs.wrapping_add(rhs),
            Operation::Sub => lhs.wrapping_sub(rhs),
            Operation::Mul => lhs.wrapping_mul(rhs),
            Operation::Div => {
                if rhs == 0 {
                    return None;
                }
                lhs / rhs
            }
            Operation::Xor => lhs ^ rhs,
            Operation::Or => lhs | rhs,
            Operation::And => lhs & rhs,
        };
        Some(result & arch.max_int())
    }
}

// impl std::fmt::Display for Operation
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operation::Add => write!(f, "+"),
            Operation::Sub => write!(f, "-"),
            Operation::Mul => write!(f, "*"),
            Operation::Div => write!(f, "/"),
            Operation::Xor => write!(f, "^"),
            Operation::Or => write!(f, "|"),
            Operation::And => write!(f, "&"),
        }
    }
}
