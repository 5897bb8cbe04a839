//! Register frames.
//!
//! A frame holds one bank per value kind. Register indices are always
//! relative to a bank: `int[2]` and `ref[2]` are different slots.

use crate::error::{CoreError, CoreResult};
use crate::value::{Value, ValueType};
use serde::{Deserialize, Serialize};

/// Number of registers per bank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameShape {
    /// Integer registers
    pub ints: usize,
    /// Float registers
    pub floats: usize,
    /// String registers
    pub strings: usize,
    /// Boolean registers
    pub booleans: usize,
    /// Reference registers
    pub refs: usize,
}

impl FrameShape {
    /// Empty shape
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            ints: 0,
            floats: 0,
            strings: 0,
            booleans: 0,
            refs: 0,
        }
    }

    /// Size of one bank
    #[must_use]
    pub const fn count(&self, kind: ValueType) -> usize {
        match kind {
            ValueType::Int => self.ints,
            ValueType::Float => self.floats,
            ValueType::String => self.strings,
            ValueType::Boolean => self.booleans,
            ValueType::Ref => self.refs,
        }
    }

    /// Set the size of one bank
    #[must_use]
    pub const fn with(mut self, kind: ValueType, count: usize) -> Self {
        match kind {
            ValueType::Int => self.ints = count,
            ValueType::Float => self.floats = count,
            ValueType::String => self.strings = count,
            ValueType::Boolean => self.booleans = count,
            ValueType::Ref => self.refs = count,
        }
        self
    }

    /// Lay out a list of typed slots one after another per bank.
    ///
    /// Returns the shape needed to hold them and, for each slot, its index
    /// inside its bank.
    #[must_use]
    pub fn layout(types: &[ValueType]) -> (Self, Vec<usize>) {
        let mut shape = Self::empty();
        let mut indices = Vec::with_capacity(types.len());
        for kind in types {
            let next = shape.count(*kind);
            indices.push(next);
            shape = shape.with(*kind, next + 1);
        }
        (shape, indices)
    }
}

/// Typed register frame of one execution context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterFrame {
    ints: Vec<i64>,
    floats: Vec<f64>,
    strings: Vec<String>,
    booleans: Vec<bool>,
    refs: Vec<Value>,
}

impl RegisterFrame {
    /// Create a zeroed frame of the given shape
    #[must_use]
    pub fn with_shape(shape: &FrameShape) -> Self {
        Self {
            ints: vec![0; shape.ints],
            floats: vec![0.0; shape.floats],
            strings: vec![String::new(); shape.strings],
            booleans: vec![false; shape.booleans],
            refs: vec![Value::Nil; shape.refs],
        }
    }

    /// Current shape
    #[must_use]
    pub fn shape(&self) -> FrameShape {
        FrameShape {
            ints: self.ints.len(),
            floats: self.floats.len(),
            strings: self.strings.len(),
            booleans: self.booleans.len(),
            refs: self.refs.len(),
        }
    }

    /// Grow banks so that they hold at least `shape`
    pub fn ensure_shape(&mut self, shape: &FrameShape) {
        if self.ints.len() < shape.ints {
            self.ints.resize(shape.ints, 0);
        }
        if self.floats.len() < shape.floats {
            self.floats.resize(shape.floats, 0.0);
        }
        if self.strings.len() < shape.strings {
            self.strings.resize(shape.strings, String::new());
        }
        if self.booleans.len() < shape.booleans {
            self.booleans.resize(shape.booleans, false);
        }
        if self.refs.len() < shape.refs {
            self.refs.resize(shape.refs, Value::Nil);
        }
    }

    /// Read a register as a value
    ///
    /// # Errors
    ///
    /// Returns error if the index is outside the bank
    pub fn load(&self, kind: ValueType, index: usize) -> CoreResult<Value> {
        let value = match kind {
            ValueType::Int => self.ints.get(index).map(|v| Value::Int(*v)),
            ValueType::Float => self.floats.get(index).map(|v| Value::Float(*v)),
            ValueType::String => self.strings.get(index).map(|v| Value::String(v.clone())),
            ValueType::Boolean => self.booleans.get(index).map(|v| Value::Boolean(*v)),
            ValueType::Ref => self.refs.get(index).cloned(),
        };
        value.ok_or_else(|| self.out_of_range(kind, index))
    }

    /// Write a value into the register of its own kind
    ///
    /// # Errors
    ///
    /// Returns error if the index is outside the bank
    pub fn store(&mut self, index: usize, value: Value) -> CoreResult<()> {
        let kind = value.value_type();
        let len = self.shape().count(kind);
        if index >= len {
            return Err(self.out_of_range(kind, index));
        }
        match value {
            Value::Int(v) => self.ints[index] = v,
            Value::Float(v) => self.floats[index] = v,
            Value::String(v) => self.strings[index] = v,
            Value::Boolean(v) => self.booleans[index] = v,
            other => self.refs[index] = other,
        }
        Ok(())
    }

    /// Write a value after checking it against the declared type
    ///
    /// # Errors
    ///
    /// Returns error on kind mismatch or out-of-range index
    pub fn store_typed(&mut self, kind: ValueType, index: usize, value: Value) -> CoreResult<()> {
        if value.value_type() != kind {
            return Err(CoreError::TypeMismatch {
                expected: kind.to_string(),
                actual: value.value_type().to_string(),
            });
        }
        self.store(index, value)
    }

    /// Load values laid out per bank at `indices`
    ///
    /// # Errors
    ///
    /// Returns error if any index is outside its bank or the lists differ in length
    pub fn load_all(&self, types: &[ValueType], indices: &[usize]) -> CoreResult<Vec<Value>> {
        if types.len() != indices.len() {
            return Err(CoreError::ArityMismatch {
                expected: types.len(),
                actual: indices.len(),
            });
        }
        types
            .iter()
            .zip(indices)
            .map(|(kind, index)| self.load(*kind, *index))
            .collect()
    }

    /// Load arguments into the first registers of each bank, in order
    ///
    /// # Errors
    ///
    /// Returns error on arity or kind mismatch
    pub fn load_args(&mut self, types: &[ValueType], args: &[Value]) -> CoreResult<()> {
        if types.len() != args.len() {
            return Err(CoreError::ArityMismatch {
                expected: types.len(),
                actual: args.len(),
            });
        }
        let (shape, indices) = FrameShape::layout(types);
        self.ensure_shape(&shape);
        for ((kind, index), value) in types.iter().zip(indices).zip(args) {
            self.store_typed(*kind, index, value.clone())?;
        }
        Ok(())
    }

    /// Copy the first registers of each bank, as given by `shape`, from `source`
    pub fn merge_prefix(&mut self, source: &RegisterFrame, shape: &FrameShape) {
        let source_shape = source.shape();
        let limit = FrameShape {
            ints: shape.ints.min(source_shape.ints),
            floats: shape.floats.min(source_shape.floats),
            strings: shape.strings.min(source_shape.strings),
            booleans: shape.booleans.min(source_shape.booleans),
            refs: shape.refs.min(source_shape.refs),
        };
        self.ensure_shape(&limit);
        self.ints[..limit.ints].copy_from_slice(&source.ints[..limit.ints]);
        self.floats[..limit.floats].copy_from_slice(&source.floats[..limit.floats]);
        self.strings[..limit.strings].clone_from_slice(&source.strings[..limit.strings]);
        self.booleans[..limit.booleans].copy_from_slice(&source.booleans[..limit.booleans]);
        self.refs[..limit.refs].clone_from_slice(&source.refs[..limit.refs]);
    }

    /// Integer register shortcut
    #[must_use]
    pub fn int(&self, index: usize) -> Option<i64> {
        self.ints.get(index).copied()
    }

    /// Reference register shortcut
    #[must_use]
    pub fn reference(&self, index: usize) -> Option<&Value> {
        self.refs.get(index)
    }

    fn out_of_range(&self, kind: ValueType, index: usize) -> CoreError {
        CoreError::RegisterOutOfRange {
            bank: kind.name().to_string(),
            index,
            len: self.shape().count(kind),
        }
    }
}
