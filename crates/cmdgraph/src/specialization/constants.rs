//! Specialization constant identities, values and per-submission sets.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// Size of one encoded constant in a constant buffer.
pub const CONSTANT_SLOT_BYTES: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpecConstKind {
    Bool,
    I32,
    U32,
    I64,
    F32,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SpecConstValue {
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl SpecConstValue {
    pub fn kind(&self) -> SpecConstKind {
        match self {
            SpecConstValue::Bool(_) => SpecConstKind::Bool,
            SpecConstValue::I32(_) => SpecConstKind::I32,
            SpecConstValue::U32(_) => SpecConstKind::U32,
            SpecConstValue::I64(_) => SpecConstKind::I64,
            SpecConstValue::F32(_) => SpecConstKind::F32,
            SpecConstValue::F64(_) => SpecConstKind::F64,
        }
    }

    /// Little-endian encoding, zero-padded to a full slot.
    pub fn to_slot(&self) -> [u8; 8] {
        let mut slot = [0u8; 8];
        match *self {
            SpecConstValue::Bool(v) => slot[0] = v as u8,
            SpecConstValue::I32(v) => slot[..4].copy_from_slice(&v.to_le_bytes()),
            SpecConstValue::U32(v) => slot[..4].copy_from_slice(&v.to_le_bytes()),
            SpecConstValue::I64(v) => slot = v.to_le_bytes(),
            SpecConstValue::F32(v) => slot[..4].copy_from_slice(&v.to_le_bytes()),
            SpecConstValue::F64(v) => slot = v.to_le_bytes(),
        }
        slot
    }

    pub fn from_slot(kind: SpecConstKind, slot: [u8; 8]) -> Self {
        let mut low = [0u8; 4];
        low.copy_from_slice(&slot[..4]);
        match kind {
            SpecConstKind::Bool => SpecConstValue::Bool(slot[0] != 0),
            SpecConstKind::I32 => SpecConstValue::I32(i32::from_le_bytes(low)),
            SpecConstKind::U32 => SpecConstValue::U32(u32::from_le_bytes(low)),
            SpecConstKind::I64 => SpecConstValue::I64(i64::from_le_bytes(slot)),
            SpecConstKind::F32 => SpecConstValue::F32(f32::from_le_bytes(low)),
            SpecConstKind::F64 => SpecConstValue::F64(f64::from_le_bytes(slot)),
        }
    }
}

/// Host types that may back a specialization constant.
pub trait SpecConstType: Copy + Send + Sync + 'static {
    const KIND: SpecConstKind;

    fn into_value(self) -> SpecConstValue;

    fn from_value(value: SpecConstValue) -> Option<Self>;
}

macro_rules! impl_spec_const_type {
    ($ty:ty, $variant:ident) => {
        impl SpecConstType for $ty {
            const KIND: SpecConstKind = SpecConstKind::$variant;

            fn into_value(self) -> SpecConstValue {
                SpecConstValue::$variant(self)
            }

            fn from_value(value: SpecConstValue) -> Option<Self> {
                match value {
                    SpecConstValue::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_spec_const_type!(bool, Bool);
impl_spec_const_type!(i32, I32);
impl_spec_const_type!(u32, U32);
impl_spec_const_type!(i64, I64);
impl_spec_const_type!(f32, F32);
impl_spec_const_type!(f64, F64);

/// Declaration of one constant as referenced by a kernel or baked into an image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConstantDecl {
    pub id: u32,
    pub default: SpecConstValue,
}

impl ConstantDecl {
    pub fn kind(&self) -> SpecConstKind {
        self.default.kind()
    }
}

/// Typed handle naming a specialization constant and its default value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpecializationId<T> {
    id: u32,
    default: T,
}

impl<T> SpecializationId<T> {
    pub const fn new(id: u32, default: T) -> Self {
        Self { id, default }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl<T: SpecConstType> SpecializationId<T> {
    pub fn default_value(&self) -> T {
        self.default
    }

    pub fn decl(&self) -> ConstantDecl {
        ConstantDecl {
            id: self.id,
            default: self.default.into_value(),
        }
    }
}

/// Explicitly set constant values; ids not present take their default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecializationConstantSet {
    values: BTreeMap<u32, SpecConstValue>,
}

impl SpecializationConstantSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: SpecConstType>(&mut self, id: &SpecializationId<T>, value: T) {
        self.values.insert(id.id(), value.into_value());
    }

    pub fn set_value(&mut self, id: u32, value: SpecConstValue) {
        self.values.insert(id, value);
    }

    pub fn get(&self, id: u32) -> Option<SpecConstValue> {
        self.values.get(&id).copied()
    }

    pub fn get_typed<T: SpecConstType>(&self, id: &SpecializationId<T>) -> T {
        self.get(id.id())
            .and_then(T::from_value)
            .unwrap_or(id.default)
    }

    pub fn is_set(&self, id: u32) -> bool {
        self.values.contains_key(&id)
    }

    /// Explicit value for `decl` if set, otherwise its default.
    pub fn effective(&self, decl: &ConstantDecl) -> SpecConstValue {
        self.get(decl.id).unwrap_or(decl.default)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, SpecConstValue)> + '_ {
        self.values.iter().map(|(id, value)| (*id, *value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_encoding_is_little_endian() {
        let slot = SpecConstValue::I32(5).to_slot();
        assert_eq!(slot, [5, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            SpecConstValue::from_slot(SpecConstKind::I32, slot),
            SpecConstValue::I32(5)
        );
        let wide = SpecConstValue::F64(-2.5).to_slot();
        assert_eq!(
            SpecConstValue::from_slot(SpecConstKind::F64, wide),
            SpecConstValue::F64(-2.5)
        );
    }

    #[test]
    fn unset_constants_fall_back_to_default() {
        const INT_ID: SpecializationId<i32> = SpecializationId::new(3, 3);
        let mut set = SpecializationConstantSet::new();
        assert_eq!(set.get_typed(&INT_ID), 3);
        assert_eq!(set.effective(&INT_ID.decl()), SpecConstValue::I32(3));
        set.set(&INT_ID, 5);
        assert!(set.is_set(3));
        assert_eq!(set.get_typed(&INT_ID), 5);
    }
}
