//! Conversion between typed values and their transportable form
//!
//! Everything that crosses the boundary is a [`Value`]: an owned snapshot with
//! no references back into the sender. Records travel as named-field
//! MessagePack, buffers as raw bytes.

use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::channel::{ParamSpec, Primitive, TypeSpec};
use crate::error::{MarshalingError, Position, ShapeError};

/// Transportable representation of one argument or result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Named-field MessagePack encoding of a record
    Record(Bytes),
    Bytes(Bytes),
}

impl Value {
    /// Short description of the runtime shape, used in error reports
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Record(_) => "record",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Whether this value is acceptable for the given type tag
    pub fn conforms_to(&self, spec: TypeSpec) -> bool {
        matches!(
            (self, spec),
            (Self::Unit, TypeSpec::Primitive(Primitive::Unit))
                | (Self::Bool(_), TypeSpec::Primitive(Primitive::Bool))
                | (Self::Int(_), TypeSpec::Primitive(Primitive::Int))
                | (Self::Float(_), TypeSpec::Primitive(Primitive::Float))
                | (Self::Str(_), TypeSpec::Primitive(Primitive::Str))
                | (Self::Record(_), TypeSpec::Record)
                | (Self::Bytes(_), TypeSpec::Bytes)
        )
    }
}

/// A type that can be passed across the boundary
///
/// The set of implementors is closed over the kinds in [`TypeSpec`], minus
/// [`TypeSpec::Context`].
pub trait Marshal: Sized + Send + 'static {
    const SPEC: TypeSpec;

    fn marshal(&self) -> Result<Value, ShapeError>;

    fn unmarshal(value: Value) -> Result<Self, ShapeError>;
}

impl Marshal for () {
    const SPEC: TypeSpec = TypeSpec::Primitive(Primitive::Unit);

    fn marshal(&self) -> Result<Value, ShapeError> {
        Ok(Value::Unit)
    }

    fn unmarshal(value: Value) -> Result<Self, ShapeError> {
        match value {
            Value::Unit => Ok(()),
            other => Err(ShapeError::spec(Self::SPEC, other.shape())),
        }
    }
}

impl Marshal for bool {
    const SPEC: TypeSpec = TypeSpec::Primitive(Primitive::Bool);

    fn marshal(&self) -> Result<Value, ShapeError> {
        Ok(Value::Bool(*self))
    }

    fn unmarshal(value: Value) -> Result<Self, ShapeError> {
        match value {
            Value::Bool(b) => Ok(b),
            other => Err(ShapeError::spec(Self::SPEC, other.shape())),
        }
    }
}

macro_rules! impl_marshal_int {
    ($($ty:ty),*) => {
        $(
            impl Marshal for $ty {
                const SPEC: TypeSpec = TypeSpec::Primitive(Primitive::Int);

                fn marshal(&self) -> Result<Value, ShapeError> {
                    i64::try_from(*self)
                        .map(Value::Int)
                        .map_err(|_| ShapeError::new("int", format!("{} {}", stringify!($ty), self)))
                }

                fn unmarshal(value: Value) -> Result<Self, ShapeError> {
                    match value {
                        Value::Int(n) => <$ty>::try_from(n).map_err(|_| {
                            ShapeError::new(concat!("int in range of ", stringify!($ty)), format!("int {n}"))
                        }),
                        other => Err(ShapeError::spec(Self::SPEC, other.shape())),
                    }
                }
            }
        )*
    };
}

impl_marshal_int!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

impl Marshal for f64 {
    const SPEC: TypeSpec = TypeSpec::Primitive(Primitive::Float);

    fn marshal(&self) -> Result<Value, ShapeError> {
        Ok(Value::Float(*self))
    }

    fn unmarshal(value: Value) -> Result<Self, ShapeError> {
        match value {
            Value::Float(f) => Ok(f),
            other => Err(ShapeError::spec(Self::SPEC, other.shape())),
        }
    }
}

impl Marshal for f32 {
    const SPEC: TypeSpec = TypeSpec::Primitive(Primitive::Float);

    fn marshal(&self) -> Result<Value, ShapeError> {
        Ok(Value::Float(f64::from(*self)))
    }

    fn unmarshal(value: Value) -> Result<Self, ShapeError> {
        match value {
            Value::Float(f) if f.is_finite() && f.abs() > f64::from(f32::MAX) => Err(
                ShapeError::new("float in range of f32", format!("float {f}")),
            ),
            Value::Float(f) => Ok(f as f32),
            other => Err(ShapeError::spec(Self::SPEC, other.shape())),
        }
    }
}

impl Marshal for String {
    const SPEC: TypeSpec = TypeSpec::Primitive(Primitive::Str);

    fn marshal(&self) -> Result<Value, ShapeError> {
        Ok(Value::Str(self.clone()))
    }

    fn unmarshal(value: Value) -> Result<Self, ShapeError> {
        match value {
            Value::Str(s) => Ok(s),
            other => Err(ShapeError::spec(Self::SPEC, other.shape())),
        }
    }
}

impl Marshal for Bytes {
    const SPEC: TypeSpec = TypeSpec::Bytes;

    fn marshal(&self) -> Result<Value, ShapeError> {
        // Detach from the sender's allocation so later reuse of it is never observed.
        Ok(Value::Bytes(Bytes::copy_from_slice(self)))
    }

    fn unmarshal(value: Value) -> Result<Self, ShapeError> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(ShapeError::spec(Self::SPEC, other.shape())),
        }
    }
}

impl Marshal for Vec<u8> {
    const SPEC: TypeSpec = TypeSpec::Bytes;

    fn marshal(&self) -> Result<Value, ShapeError> {
        Ok(Value::Bytes(Bytes::copy_from_slice(self)))
    }

    fn unmarshal(value: Value) -> Result<Self, ShapeError> {
        match value {
            Value::Bytes(b) => Ok(b.to_vec()),
            other => Err(ShapeError::spec(Self::SPEC, other.shape())),
        }
    }
}

/// Structured record passed by value
///
/// Wraps any serde type so it can be used as a channel argument or result:
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct Query { text: String, limit: u32 }
///
/// tether::contract! {
///     pub contract Api => ApiClient {
///         Search = fn search(query: Record<Query>) -> Record<Hits>;
///     }
/// }
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Record<T>(pub T);

impl<T> Record<T> {
    /// Unwrap the record
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Record<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Record<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> Marshal for Record<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    const SPEC: TypeSpec = TypeSpec::Record;

    fn marshal(&self) -> Result<Value, ShapeError> {
        rmp_serde::to_vec_named(&self.0)
            .map(|encoded| Value::Record(Bytes::from(encoded)))
            .map_err(|e| ShapeError::new("record", format!("unserializable value ({e})")))
    }

    fn unmarshal(value: Value) -> Result<Self, ShapeError> {
        match value {
            Value::Record(encoded) => rmp_serde::from_slice(&encoded)
                .map(Record)
                .map_err(|e| ShapeError::new(std::any::type_name::<T>(), format!("record ({e})"))),
            other => Err(ShapeError::spec(Self::SPEC, other.shape())),
        }
    }
}

/// The ordered user arguments of a channel, as a tuple
pub trait ArgList: Sized + Send + 'static {
    const ARITY: usize;

    fn specs(names: &[&'static str]) -> Vec<ParamSpec>;

    fn marshal(&self, channel: &str) -> Result<Vec<Value>, MarshalingError>;

    fn unmarshal(channel: &str, values: Vec<Value>) -> Result<Self, MarshalingError>;
}

const DEFAULT_NAMES: [&str; 6] = ["arg0", "arg1", "arg2", "arg3", "arg4", "arg5"];

fn param_name(names: &[&'static str], index: usize) -> &'static str {
    names.get(index).copied().unwrap_or(DEFAULT_NAMES[index])
}

fn arity_error(channel: &str, expected: usize, actual: usize) -> MarshalingError {
    ShapeError::new(format!("{expected} arguments"), format!("{actual} arguments"))
        .at(channel, Position::Argument(expected.min(actual)))
}

impl ArgList for () {
    const ARITY: usize = 0;

    fn specs(_names: &[&'static str]) -> Vec<ParamSpec> {
        Vec::new()
    }

    fn marshal(&self, _channel: &str) -> Result<Vec<Value>, MarshalingError> {
        Ok(Vec::new())
    }

    fn unmarshal(channel: &str, values: Vec<Value>) -> Result<Self, MarshalingError> {
        if values.is_empty() {
            Ok(())
        } else {
            Err(arity_error(channel, 0, values.len()))
        }
    }
}

macro_rules! impl_arg_list {
    ($arity:expr; $($ty:ident => $idx:tt),+) => {
        impl<$($ty: Marshal),+> ArgList for ($($ty,)+) {
            const ARITY: usize = $arity;

            fn specs(names: &[&'static str]) -> Vec<ParamSpec> {
                vec![$(ParamSpec::new(param_name(names, $idx), <$ty as Marshal>::SPEC)),+]
            }

            fn marshal(&self, channel: &str) -> Result<Vec<Value>, MarshalingError> {
                Ok(vec![$(
                    self.$idx
                        .marshal()
                        .map_err(|e| e.at(channel, Position::Argument($idx)))?
                ),+])
            }

            fn unmarshal(channel: &str, values: Vec<Value>) -> Result<Self, MarshalingError> {
                if values.len() != Self::ARITY {
                    return Err(arity_error(channel, Self::ARITY, values.len()));
                }
                let mut values = values.into_iter();
                Ok(($({
                    let value = values
                        .next()
                        .ok_or_else(|| arity_error(channel, Self::ARITY, $idx))?;
                    <$ty as Marshal>::unmarshal(value)
                        .map_err(|e| e.at(channel, Position::Argument($idx)))?
                },)+))
            }
        }
    };
}

impl_arg_list!(1; A => 0);
impl_arg_list!(2; A => 0, B => 1);
impl_arg_list!(3; A => 0, B => 1, C => 2);
impl_arg_list!(4; A => 0, B => 1, C => 2, D => 3);
impl_arg_list!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
impl_arg_list!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);

/// Decode a result value for `channel`
pub(crate) fn unmarshal_result<T: Marshal>(channel: &str, value: Value) -> Result<T, MarshalingError> {
    T::unmarshal(value).map_err(|e| e.at(channel, Position::Result))
}
