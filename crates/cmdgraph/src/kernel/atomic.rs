//! Dword atomic read-modify-write semantics.
//!
//! Every operation works on the 32-bit pattern stored in memory; [`ElementKind`] decides how the
//! bits are interpreted for arithmetic and comparisons. Operand order for the compare-exchange
//! forms is `[expected, desired]`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AtomicOp {
    Inc,
    Dec,
    Add,
    Sub,
    Min,
    Max,
    Xchg,
    CmpXchg,
    And,
    Or,
    Xor,
    Load,
    Store,
    FAdd,
    FSub,
    FMin,
    FMax,
    FCmpXchg,
}

impl AtomicOp {
    pub fn operand_count(self) -> usize {
        match self {
            AtomicOp::Inc | AtomicOp::Dec | AtomicOp::Load => 0,
            AtomicOp::CmpXchg | AtomicOp::FCmpXchg => 2,
            _ => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            AtomicOp::FAdd | AtomicOp::FSub | AtomicOp::FMin | AtomicOp::FMax | AtomicOp::FCmpXchg
        )
    }

    fn is_bitwise_move(self) -> bool {
        matches!(self, AtomicOp::Xchg | AtomicOp::Load | AtomicOp::Store)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementKind {
    U32,
    I32,
    F32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AtomicError {
    #[error("{op:?} expects {expected} operand(s), got {found}")]
    OperandCount {
        op: AtomicOp,
        expected: usize,
        found: usize,
    },
    #[error("{op:?} is not defined for {kind:?} elements")]
    UnsupportedType { op: AtomicOp, kind: ElementKind },
}

/// Element types that fit a dword and can be updated atomically.
pub trait AtomicElement: bytemuck::Pod + Send + Sync {
    const KIND: ElementKind;

    fn to_bits(self) -> u32;

    fn from_bits(bits: u32) -> Self;
}

impl AtomicElement for u32 {
    const KIND: ElementKind = ElementKind::U32;

    fn to_bits(self) -> u32 {
        self
    }

    fn from_bits(bits: u32) -> Self {
        bits
    }
}

impl AtomicElement for i32 {
    const KIND: ElementKind = ElementKind::I32;

    fn to_bits(self) -> u32 {
        self as u32
    }

    fn from_bits(bits: u32) -> Self {
        bits as i32
    }
}

impl AtomicElement for f32 {
    const KIND: ElementKind = ElementKind::F32;

    fn to_bits(self) -> u32 {
        f32::to_bits(self)
    }

    fn from_bits(bits: u32) -> Self {
        f32::from_bits(bits)
    }
}

/// Checks that `op` is defined for `kind` and receives the right number of operands.
pub fn validate(op: AtomicOp, kind: ElementKind, operands: usize) -> Result<(), AtomicError> {
    let expected = op.operand_count();
    if operands != expected {
        return Err(AtomicError::OperandCount {
            op,
            expected,
            found: operands,
        });
    }
    let float_kind = kind == ElementKind::F32;
    if !op.is_bitwise_move() && op.is_float() != float_kind {
        return Err(AtomicError::UnsupportedType { op, kind });
    }
    Ok(())
}

/// Computes the value stored back to memory given the current bits `old`.
pub fn apply(
    op: AtomicOp,
    kind: ElementKind,
    old: u32,
    operands: &[u32],
) -> Result<u32, AtomicError> {
    validate(op, kind, operands.len())?;
    let src = |index: usize| operands[index];
    let new = match op {
        AtomicOp::Inc => old.wrapping_add(1),
        AtomicOp::Dec => old.wrapping_sub(1),
        AtomicOp::Add => old.wrapping_add(src(0)),
        AtomicOp::Sub => old.wrapping_sub(src(0)),
        AtomicOp::Min => match kind {
            ElementKind::I32 => (old as i32).min(src(0) as i32) as u32,
            _ => old.min(src(0)),
        },
        AtomicOp::Max => match kind {
            ElementKind::I32 => (old as i32).max(src(0) as i32) as u32,
            _ => old.max(src(0)),
        },
        AtomicOp::Xchg | AtomicOp::Store => src(0),
        AtomicOp::Load => old,
        AtomicOp::CmpXchg => {
            if old == src(0) {
                src(1)
            } else {
                old
            }
        }
        AtomicOp::And => old & src(0),
        AtomicOp::Or => old | src(0),
        AtomicOp::Xor => old ^ src(0),
        AtomicOp::FAdd => (f32::from_bits(old) + f32::from_bits(src(0))).to_bits(),
        AtomicOp::FSub => (f32::from_bits(old) - f32::from_bits(src(0))).to_bits(),
        AtomicOp::FMin => f32::from_bits(old).min(f32::from_bits(src(0))).to_bits(),
        AtomicOp::FMax => f32::from_bits(old).max(f32::from_bits(src(0))).to_bits(),
        AtomicOp::FCmpXchg => {
            if f32::from_bits(old) == f32::from_bits(src(0)) {
                src(1)
            } else {
                old
            }
        }
    };
    Ok(new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_min_max_respect_signedness() {
        let minus_one = (-1i32) as u32;
        assert_eq!(
            apply(AtomicOp::Min, ElementKind::I32, 5, &[minus_one]).unwrap(),
            minus_one
        );
        assert_eq!(
            apply(AtomicOp::Min, ElementKind::U32, 5, &[minus_one]).unwrap(),
            5
        );
        assert_eq!(
            apply(AtomicOp::Max, ElementKind::U32, 5, &[minus_one]).unwrap(),
            minus_one
        );
    }

    #[test]
    fn cmpxchg_only_swaps_on_match() {
        assert_eq!(
            apply(AtomicOp::CmpXchg, ElementKind::U32, 7, &[7, 42]).unwrap(),
            42
        );
        assert_eq!(
            apply(AtomicOp::CmpXchg, ElementKind::U32, 8, &[7, 42]).unwrap(),
            8
        );
        let old = 1.5f32.to_bits();
        let swapped = apply(
            AtomicOp::FCmpXchg,
            ElementKind::F32,
            old,
            &[1.5f32.to_bits(), 2.5f32.to_bits()],
        )
        .unwrap();
        assert_eq!(f32::from_bits(swapped), 2.5);
    }

    #[test]
    fn wrapping_inc_dec() {
        assert_eq!(apply(AtomicOp::Inc, ElementKind::U32, u32::MAX, &[]).unwrap(), 0);
        assert_eq!(apply(AtomicOp::Dec, ElementKind::U32, 0, &[]).unwrap(), u32::MAX);
    }

    #[test]
    fn float_ops_reject_integer_elements() {
        assert_eq!(
            apply(AtomicOp::FAdd, ElementKind::U32, 0, &[1]),
            Err(AtomicError::UnsupportedType {
                op: AtomicOp::FAdd,
                kind: ElementKind::U32
            })
        );
        assert!(apply(AtomicOp::Add, ElementKind::F32, 0, &[1]).is_err());
        assert!(apply(AtomicOp::Xchg, ElementKind::F32, 0, &[1]).is_ok());
    }

    #[test]
    fn operand_count_is_checked() {
        assert_eq!(
            apply(AtomicOp::CmpXchg, ElementKind::I32, 0, &[1]),
            Err(AtomicError::OperandCount {
                op: AtomicOp::CmpXchg,
                expected: 2,
                found: 1
            })
        );
    }
}
