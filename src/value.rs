//! Typed column values and tuples.
//!
//! [`Value`] is the engine's single-column value. Nulls are a distinct
//! variant; every aggregate routine checks for them explicitly. Values have
//! a total order (`Null` first, then by type, doubles ordered by
//! `f64::total_cmp`) so they can serve as index keys.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::error::MatViewError;

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    Boolean,
    BigInt,
    Double,
    Text,
}

/// A single typed value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    BigInt(i64),
    Double(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value is a numeric zero.
    pub fn is_zero(&self) -> bool {
        match self {
            Value::BigInt(v) => *v == 0,
            Value::Double(v) => *v == 0.0,
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::BigInt(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// The column type this value inhabits, or `None` for null.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::BigInt(_) => Some(ColumnType::BigInt),
            Value::Double(_) => Some(ColumnType::Double),
            Value::Text(_) => Some(ColumnType::Text),
        }
    }

    /// Whether the value may be stored in a column of `ty`.
    pub fn fits(&self, ty: ColumnType) -> bool {
        match self.column_type() {
            None => true,
            Some(ColumnType::BigInt) => matches!(ty, ColumnType::BigInt | ColumnType::Double),
            Some(t) => t == ty,
        }
    }

    /// Checked addition. Integers stay integers; mixing with a double
    /// promotes to double.
    pub fn checked_add(&self, other: &Value) -> Result<Value, MatViewError> {
        match (self, other) {
            (Value::BigInt(a), Value::BigInt(b)) => a
                .checked_add(*b)
                .map(Value::BigInt)
                .ok_or_else(|| MatViewError::NumericOverflow(format!("{a} + {b}"))),
            (Value::Double(_), _) | (_, Value::Double(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => Ok(Value::Double(a + b)),
                    _ => Err(type_mismatch("+", self, other)),
                }
            }
            _ => Err(type_mismatch("+", self, other)),
        }
    }

    /// Checked subtraction, with the same promotion rules as [`checked_add`](Self::checked_add).
    pub fn checked_sub(&self, other: &Value) -> Result<Value, MatViewError> {
        match (self, other) {
            (Value::BigInt(a), Value::BigInt(b)) => a
                .checked_sub(*b)
                .map(Value::BigInt)
                .ok_or_else(|| MatViewError::NumericOverflow(format!("{a} - {b}"))),
            (Value::Double(_), _) | (_, Value::Double(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => Ok(Value::Double(a - b)),
                    _ => Err(type_mismatch("-", self, other)),
                }
            }
            _ => Err(type_mismatch("-", self, other)),
        }
    }

    /// Compare two non-null values of comparable types.
    ///
    /// Integers and doubles compare numerically. Nulls and mismatched types
    /// are rejected; callers handle nulls before comparing.
    pub fn compare(&self, other: &Value) -> Result<Ordering, MatViewError> {
        match (self, other) {
            (Value::BigInt(a), Value::BigInt(b)) => Ok(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Ok(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Ok(a.cmp(b)),
            (Value::Double(_) | Value::BigInt(_), Value::Double(_) | Value::BigInt(_)) => {
                match (self.as_f64(), other.as_f64()) {
                    (Some(a), Some(b)) => Ok(a.total_cmp(&b)),
                    _ => Err(type_mismatch("compare", self, other)),
                }
            }
            _ => Err(type_mismatch("compare", self, other)),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::BigInt(_) => 2,
            Value::Double(_) => 3,
            Value::Text(_) => 4,
        }
    }
}

fn type_mismatch(op: &str, a: &Value, b: &Value) -> MatViewError {
    MatViewError::TypeMismatch(format!("cannot apply {op} to {a:?} and {b:?}"))
}

// Structural equality: doubles compare by bit pattern so that `Value` can be
// an index key. Numeric comparison across types goes through `compare`.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
            Value::BigInt(v) => v.hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::Text(v) => v.hash(state),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::BigInt(a), Value::BigInt(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::BigInt(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::BigInt(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One row's worth of column values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tuple(Vec<Value>);

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Tuple(values)
    }

    /// A tuple of `width` nulls.
    pub fn nulls(width: usize) -> Self {
        Tuple(vec![Value::Null; width])
    }

    pub fn value(&self, index: usize) -> &Value {
        &self.0[index]
    }

    pub fn set_value(&mut self, index: usize, value: Value) {
        self.0[index] = value;
    }

    /// Copy the values at `columns` into a key.
    pub fn project(&self, columns: &[usize]) -> Vec<Value> {
        columns.iter().map(|&c| self.0[c].clone()).collect()
    }

    /// Concatenate two tuples (left columns first).
    pub fn concat(&self, other: &Tuple) -> Tuple {
        let mut values = Vec::with_capacity(self.0.len() + other.0.len());
        values.extend_from_slice(&self.0);
        values.extend_from_slice(&other.0);
        Tuple(values)
    }
}

impl Deref for Tuple {
    type Target = [Value];

    fn deref(&self) -> &[Value] {
        &self.0
    }
}

impl DerefMut for Tuple {
    fn deref_mut(&mut self) -> &mut [Value] {
        &mut self.0
    }
}

impl From<Vec<Value>> for Tuple {
    fn from(values: Vec<Value>) -> Self {
        Tuple(values)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Build a [`Tuple`] from a list of expressions convertible into [`Value`].
#[macro_export]
macro_rules! tuple {
    ($($v:expr),* $(,)?) => {
        $crate::value::Tuple::new(vec![$($crate::value::Value::from($v)),*])
    };
}
