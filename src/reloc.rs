//! Relocation arithmetic.
//!
//! Pure address computation, separated from the unsafe memory writes in
//! the loader: given a relocation type, the site address being patched,
//! the resolved target address and the addend currently encoded at the
//! site, produce the value to write. Unknown relocation types are fatal:
//! a skipped relocation yields silently-wrong execution.

use crate::error::{BofError, Result};
use crate::parser::Machine;

pub const IMAGE_REL_AMD64_ADDR64: u16 = 0x0001;
pub const IMAGE_REL_AMD64_ADDR32NB: u16 = 0x0003;
pub const IMAGE_REL_AMD64_REL32: u16 = 0x0004;
pub const IMAGE_REL_AMD64_REL32_5: u16 = 0x0009;

pub const IMAGE_REL_I386_DIR32: u16 = 0x0006;
pub const IMAGE_REL_I386_REL32: u16 = 0x0014;

/// The value a relocation resolves to, sized per its type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Patch {
    U32(u32),
    U64(u64),
}

impl Patch {
    /// Bytes written at the relocation site.
    pub fn size(&self) -> usize {
        match self {
            Patch::U32(_) => 4,
            Patch::U64(_) => 8,
        }
    }
}

/// Computes the patch for one relocation record.
///
/// `site` is the runtime address of the bytes being rewritten, `target`
/// the resolved address of the referenced symbol, and `addend` the value
/// currently stored at the site (sign-extended for 32-bit sites).
///
/// Relative types subtract the address of the next instruction: the site
/// plus the 4 patch bytes, plus the 0..=5 extra operand bytes encoded in
/// the REL32_X type tag.
pub fn compute(machine: Machine, type_: u16, site: u64, target: u64, addend: i64) -> Result<Patch> {
    let target = target.wrapping_add(addend as u64);
    match machine {
        Machine::X64 => match type_ {
            IMAGE_REL_AMD64_ADDR64 => Ok(Patch::U64(target)),
            IMAGE_REL_AMD64_ADDR32NB => {
                Ok(Patch::U32(target.wrapping_sub(site.wrapping_add(4)) as u32))
            }
            t @ IMAGE_REL_AMD64_REL32..=IMAGE_REL_AMD64_REL32_5 => {
                let next = site.wrapping_add(4).wrapping_add((t - IMAGE_REL_AMD64_REL32) as u64);
                Ok(Patch::U32(target.wrapping_sub(next) as u32))
            }
            other => Err(BofError::UnsupportedRelocation(other)),
        },
        Machine::X86 => match type_ {
            IMAGE_REL_I386_DIR32 => Ok(Patch::U32(target as u32)),
            IMAGE_REL_I386_REL32 => {
                Ok(Patch::U32(target.wrapping_sub(site.wrapping_add(4)) as u32))
            }
            other => Err(BofError::UnsupportedRelocation(other)),
        },
    }
}

/// Bytes occupied by a relocation site of this type. The loader reads the
/// addend from (and bounds-checks its write against) this many bytes.
pub fn width(machine: Machine, type_: u16) -> Result<usize> {
    compute(machine, type_, 0, 0, 0).map(|p| p.size())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_follows_type() {
        assert_eq!(width(Machine::X64, IMAGE_REL_AMD64_ADDR64).unwrap(), 8);
        assert_eq!(width(Machine::X64, IMAGE_REL_AMD64_REL32).unwrap(), 4);
        assert_eq!(width(Machine::X86, IMAGE_REL_I386_DIR32).unwrap(), 4);
        assert!(width(Machine::X64, 0xbeef).is_err());
    }

    #[test]
    fn addr64_is_absolute_plus_addend() {
        let p = compute(Machine::X64, IMAGE_REL_AMD64_ADDR64, 0x1000, 0x7fff_0000_1000, 0x10).unwrap();
        assert_eq!(p, Patch::U64(0x7fff_0000_1010));
        assert_eq!(p.size(), 8);
    }

    #[test]
    fn rel32_is_target_minus_next_instruction() {
        // target 0x2000, site 0x1000: displacement relative to site + 4
        let p = compute(Machine::X64, IMAGE_REL_AMD64_REL32, 0x1000, 0x2000, 0).unwrap();
        assert_eq!(p, Patch::U32(0x2000 - 0x1004));
    }

    #[test]
    fn rel32_applies_addend() {
        let p = compute(Machine::X64, IMAGE_REL_AMD64_REL32, 0x1000, 0x2000, -4).unwrap();
        assert_eq!(p, Patch::U32(0x2000u32.wrapping_sub(0x1004).wrapping_sub(4)));
    }

    #[test]
    fn rel32_x_accounts_for_trailing_operand_bytes() {
        for extra in 0..=5u16 {
            let p = compute(
                Machine::X64,
                IMAGE_REL_AMD64_REL32 + extra,
                0x1000,
                0x2000,
                0,
            )
            .unwrap();
            assert_eq!(p, Patch::U32(0x2000 - (0x1004 + extra as u32)));
        }
    }

    #[test]
    fn rel32_backward_reference_is_negative() {
        let p = compute(Machine::X64, IMAGE_REL_AMD64_REL32, 0x2000, 0x1000, 0).unwrap();
        assert_eq!(p, Patch::U32((-(0x1004i64) as i32) as u32));
    }

    #[test]
    fn addr32nb_is_relative_like_rel32() {
        let p = compute(Machine::X64, IMAGE_REL_AMD64_ADDR32NB, 0x1000, 0x3000, 8).unwrap();
        assert_eq!(p, Patch::U32(0x3008 - 0x1004));
    }

    #[test]
    fn i386_dir32_is_absolute() {
        let p = compute(Machine::X86, IMAGE_REL_I386_DIR32, 0x1000, 0x0040_2000, 0x20).unwrap();
        assert_eq!(p, Patch::U32(0x0040_2020));
        assert_eq!(p.size(), 4);
    }

    #[test]
    fn i386_rel32() {
        let p = compute(Machine::X86, IMAGE_REL_I386_REL32, 0x5000, 0x4000, 0).unwrap();
        assert_eq!(p, Patch::U32(0x4000u32.wrapping_sub(0x5004)));
    }

    #[test]
    fn unknown_types_are_fatal() {
        assert!(matches!(
            compute(Machine::X64, 0x00ff, 0, 0, 0).unwrap_err(),
            BofError::UnsupportedRelocation(0x00ff)
        ));
        // an x86-only type is not valid for x64 and vice versa
        assert!(matches!(
            compute(Machine::X64, IMAGE_REL_I386_REL32, 0, 0, 0).unwrap_err(),
            BofError::UnsupportedRelocation(_)
        ));
        assert!(matches!(
            compute(Machine::X86, IMAGE_REL_AMD64_REL32, 0, 0, 0).unwrap_err(),
            BofError::UnsupportedRelocation(_)
        ));
    }
}
