//! Tagged runtime values.
//!
//! A [`Value`] is the unit of data the runtime moves around: variable
//! contents, event payloads, constructor arguments. Structural variants
//! (tuples, named tuples, sequences, sets, maps) own their children; cloning
//! is deep, so two values never share mutable state. The only aliasing is
//! behind foreign values, where cloning goes through the host's registered
//! callback.
//!
//! Equality is structural: reflexive, symmetric, transitive, and `false`
//! across different kinds. Sets compare as sets, maps as key/value
//! associations, both independent of insertion order.
//!
//! Null is an explicit value, never an absence: an event sent without a
//! payload carries [`Value::Null`].

use crate::foreign::{ForeignResolver, ForeignValue};
use crate::id::MachineId;
use crate::types::Type;
use thiserror::Error;

/// Errors from value operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValueError {
    /// Positional access past the end of a structured value.
    #[error("index {index} out of range for {kind} of size {len}")]
    IndexOutOfRange {
        /// Kind of the accessed value.
        kind: &'static str,
        /// The offending index.
        index: usize,
        /// Size of the accessed value.
        len: usize,
    },

    /// Named access with an unknown field name.
    #[error("no field named `{0}`")]
    NoSuchField(String),

    /// An operation applied to the wrong kind of value.
    #[error("expected a {expected}, found a {found}")]
    KindMismatch {
        /// Kind the operation requires.
        expected: &'static str,
        /// Kind that was supplied.
        found: &'static str,
    },

    /// Swap passing used at an ingress boundary.
    #[error("swap argument passing is not allowed at this boundary")]
    SwapAtBoundary,

    /// More than one argument supplied without a tuple type to pack into.
    #[error("packing {0} arguments requires a tuple payload type")]
    MissingTupleType(usize),

    /// Argument count does not match the tuple type's arity.
    #[error("{got} arguments for a tuple type of arity {want}")]
    ArityMismatch {
        /// Arity of the tuple type.
        want: usize,
        /// Number of arguments supplied.
        got: usize,
    },

    /// A foreign type index with no matching declaration.
    #[error("unknown foreign type {0}")]
    UnknownForeignType(u32),
}

/// A tagged runtime value.
#[derive(Clone, Debug)]
pub enum Value {
    /// The distinguished null value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A floating-point number.
    Float(f64),
    /// A string.
    String(String),
    /// A reference to an event, by declaration index.
    Event(u32),
    /// A machine id.
    Machine(MachineId),
    /// A positional tuple.
    Tuple(Vec<Value>),
    /// A named tuple.
    NamedTuple(NamedTuple),
    /// A sequence.
    Seq(Vec<Value>),
    /// A set with structural membership.
    Set(ValueSet),
    /// A map with structural key lookup.
    Map(ValueMap),
    /// An opaque host value.
    Foreign(ForeignValue),
}

impl Value {
    /// Returns the kind of this value, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Event(_) => "event",
            Value::Machine(_) => "machine",
            Value::Tuple(_) => "tuple",
            Value::NamedTuple(_) => "named tuple",
            Value::Seq(_) => "seq",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Foreign(_) => "foreign",
        }
    }

    /// Constructs the default value of a type.
    ///
    /// Foreign defaults are resolved through `foreign`; pass `&()` when the
    /// type is known to be foreign-free.
    pub fn default_of(ty: &Type, foreign: &dyn ForeignResolver) -> Result<Value, ValueError> {
        Ok(match ty {
            Type::Any | Type::Null | Type::Event | Type::Machine => Value::Null,
            Type::Bool => Value::Bool(false),
            Type::Int => Value::Int(0),
            Type::Float => Value::Float(0.0),
            Type::String => Value::String(String::new()),
            Type::Tuple(elems) => Value::Tuple(
                elems
                    .iter()
                    .map(|t| Value::default_of(t, foreign))
                    .collect::<Result<_, _>>()?,
            ),
            Type::NamedTuple(fields) => {
                let mut tuple = NamedTuple::new();
                for (name, t) in fields {
                    tuple.push(name.clone(), Value::default_of(t, foreign)?);
                }
                Value::NamedTuple(tuple)
            }
            Type::Seq(_) => Value::Seq(Vec::new()),
            Type::Set(_) => Value::Set(ValueSet::new()),
            Type::Map(_, _) => Value::Map(ValueMap::new()),
            Type::Foreign(index) => {
                let vtable = foreign
                    .vtable(*index)
                    .ok_or(ValueError::UnknownForeignType(*index))?;
                Value::Foreign(ForeignValue::new_default(*index, vtable))
            }
        })
    }

    /// Returns `true` if this value is acceptable where `ty` is expected.
    ///
    /// Null conforms to the null, event, and machine types. Structural types
    /// check arity, field names, and children recursively. There is no
    /// numeric coercion.
    pub fn conforms_to(&self, ty: &Type) -> bool {
        match (self, ty) {
            (_, Type::Any) => true,
            (Value::Null, Type::Null | Type::Event | Type::Machine) => true,
            (Value::Bool(_), Type::Bool) => true,
            (Value::Int(_), Type::Int) => true,
            (Value::Float(_), Type::Float) => true,
            (Value::String(_), Type::String) => true,
            (Value::Event(_), Type::Event) => true,
            (Value::Machine(_), Type::Machine) => true,
            (Value::Tuple(elems), Type::Tuple(tys)) => {
                elems.len() == tys.len()
                    && elems.iter().zip(tys).all(|(v, t)| v.conforms_to(t))
            }
            (Value::NamedTuple(tuple), Type::NamedTuple(tys)) => {
                tuple.len() == tys.len()
                    && tuple
                        .iter()
                        .zip(tys)
                        .all(|((name, v), (ty_name, t))| name == ty_name && v.conforms_to(t))
            }
            (Value::Seq(elems), Type::Seq(t)) => elems.iter().all(|v| v.conforms_to(t)),
            (Value::Set(set), Type::Set(t)) => set.iter().all(|v| v.conforms_to(t)),
            (Value::Map(map), Type::Map(k, v)) => map
                .iter()
                .all(|(key, value)| key.conforms_to(k) && value.conforms_to(v)),
            (Value::Foreign(f), Type::Foreign(index)) => f.type_index() == *index,
            _ => false,
        }
    }

    /// Packs multiple values into a tuple of the given type.
    ///
    /// Used to repackage multi-argument constructor and send payloads. The
    /// type must be a tuple or named tuple of matching arity.
    pub fn tuple_from_parts(ty: &Type, parts: Vec<Value>) -> Result<Value, ValueError> {
        match ty {
            Type::Tuple(tys) => {
                if tys.len() != parts.len() {
                    return Err(ValueError::ArityMismatch {
                        want: tys.len(),
                        got: parts.len(),
                    });
                }
                Ok(Value::Tuple(parts))
            }
            Type::NamedTuple(tys) => {
                if tys.len() != parts.len() {
                    return Err(ValueError::ArityMismatch {
                        want: tys.len(),
                        got: parts.len(),
                    });
                }
                let mut tuple = NamedTuple::new();
                for ((name, _), value) in tys.iter().zip(parts) {
                    tuple.push(name.clone(), value);
                }
                Ok(Value::NamedTuple(tuple))
            }
            _ => Err(ValueError::MissingTupleType(parts.len())),
        }
    }

    /// Returns the field at `index` of a tuple or named tuple.
    pub fn get_field(&self, index: usize) -> Result<&Value, ValueError> {
        match self {
            Value::Tuple(elems) => elems.get(index).ok_or(ValueError::IndexOutOfRange {
                kind: "tuple",
                index,
                len: elems.len(),
            }),
            Value::NamedTuple(tuple) => tuple.get(index).ok_or(ValueError::IndexOutOfRange {
                kind: "named tuple",
                index,
                len: tuple.len(),
            }),
            other => Err(ValueError::KindMismatch {
                expected: "tuple",
                found: other.kind(),
            }),
        }
    }

    /// Replaces the field at `index` of a tuple or named tuple.
    pub fn set_field(&mut self, index: usize, value: Value) -> Result<(), ValueError> {
        match self {
            Value::Tuple(elems) => {
                let len = elems.len();
                let slot = elems.get_mut(index).ok_or(ValueError::IndexOutOfRange {
                    kind: "tuple",
                    index,
                    len,
                })?;
                *slot = value;
                Ok(())
            }
            Value::NamedTuple(tuple) => tuple.set(index, value),
            other => Err(ValueError::KindMismatch {
                expected: "tuple",
                found: other.kind(),
            }),
        }
    }

    /// Returns the named-tuple field with the given name.
    pub fn field_named(&self, name: &str) -> Result<&Value, ValueError> {
        match self {
            Value::NamedTuple(tuple) => tuple
                .get_named(name)
                .ok_or_else(|| ValueError::NoSuchField(name.to_string())),
            other => Err(ValueError::KindMismatch {
                expected: "named tuple",
                found: other.kind(),
            }),
        }
    }

    /// Replaces the named-tuple field with the given name.
    pub fn set_field_named(&mut self, name: &str, value: Value) -> Result<(), ValueError> {
        match self {
            Value::NamedTuple(tuple) => tuple.set_named(name, value),
            other => Err(ValueError::KindMismatch {
                expected: "named tuple",
                found: other.kind(),
            }),
        }
    }

    /// Returns the element at `index` of a sequence.
    pub fn seq_get(&self, index: usize) -> Result<&Value, ValueError> {
        let elems = self.as_seq()?;
        elems.get(index).ok_or(ValueError::IndexOutOfRange {
            kind: "seq",
            index,
            len: elems.len(),
        })
    }

    /// Inserts an element at `index` of a sequence; `index == len` appends.
    pub fn seq_insert(&mut self, index: usize, value: Value) -> Result<(), ValueError> {
        let elems = self.as_seq_mut()?;
        if index > elems.len() {
            return Err(ValueError::IndexOutOfRange {
                kind: "seq",
                index,
                len: elems.len(),
            });
        }
        elems.insert(index, value);
        Ok(())
    }

    /// Removes and returns the element at `index` of a sequence.
    pub fn seq_remove(&mut self, index: usize) -> Result<Value, ValueError> {
        let elems = self.as_seq_mut()?;
        if index >= elems.len() {
            return Err(ValueError::IndexOutOfRange {
                kind: "seq",
                index,
                len: elems.len(),
            });
        }
        Ok(elems.remove(index))
    }

    /// Inserts into a set; returns `false` if the member was already present.
    pub fn set_insert(&mut self, value: Value) -> Result<bool, ValueError> {
        match self {
            Value::Set(set) => Ok(set.insert(value)),
            other => Err(ValueError::KindMismatch {
                expected: "set",
                found: other.kind(),
            }),
        }
    }

    /// Removes from a set; returns `false` if the member was absent.
    pub fn set_remove(&mut self, value: &Value) -> Result<bool, ValueError> {
        match self {
            Value::Set(set) => Ok(set.remove(value)),
            other => Err(ValueError::KindMismatch {
                expected: "set",
                found: other.kind(),
            }),
        }
    }

    /// Structural set membership.
    pub fn set_contains(&self, value: &Value) -> Result<bool, ValueError> {
        match self {
            Value::Set(set) => Ok(set.contains(value)),
            other => Err(ValueError::KindMismatch {
                expected: "set",
                found: other.kind(),
            }),
        }
    }

    /// Inserts into a map, returning the previous value for the key.
    pub fn map_insert(&mut self, key: Value, value: Value) -> Result<Option<Value>, ValueError> {
        match self {
            Value::Map(map) => Ok(map.insert(key, value)),
            other => Err(ValueError::KindMismatch {
                expected: "map",
                found: other.kind(),
            }),
        }
    }

    /// Removes a key from a map, returning its value.
    pub fn map_remove(&mut self, key: &Value) -> Result<Option<Value>, ValueError> {
        match self {
            Value::Map(map) => Ok(map.remove(key)),
            other => Err(ValueError::KindMismatch {
                expected: "map",
                found: other.kind(),
            }),
        }
    }

    /// Looks up a key in a map.
    pub fn map_get(&self, key: &Value) -> Result<Option<&Value>, ValueError> {
        match self {
            Value::Map(map) => Ok(map.get(key)),
            other => Err(ValueError::KindMismatch {
                expected: "map",
                found: other.kind(),
            }),
        }
    }

    /// Number of elements of a tuple, named tuple, sequence, set, or map.
    pub fn size(&self) -> Result<usize, ValueError> {
        match self {
            Value::Tuple(elems) => Ok(elems.len()),
            Value::NamedTuple(tuple) => Ok(tuple.len()),
            Value::Seq(elems) => Ok(elems.len()),
            Value::Set(set) => Ok(set.len()),
            Value::Map(map) => Ok(map.len()),
            other => Err(ValueError::KindMismatch {
                expected: "collection",
                found: other.kind(),
            }),
        }
    }

    /// Returns `true` for the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Extracts a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extracts an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Extracts an event declaration index.
    pub fn as_event(&self) -> Option<u32> {
        match self {
            Value::Event(e) => Some(*e),
            _ => None,
        }
    }

    /// Extracts a machine id.
    pub fn as_machine(&self) -> Option<&MachineId> {
        match self {
            Value::Machine(id) => Some(id),
            _ => None,
        }
    }

    fn as_seq(&self) -> Result<&Vec<Value>, ValueError> {
        match self {
            Value::Seq(elems) => Ok(elems),
            other => Err(ValueError::KindMismatch {
                expected: "seq",
                found: other.kind(),
            }),
        }
    }

    fn as_seq_mut(&mut self) -> Result<&mut Vec<Value>, ValueError> {
        match self {
            Value::Seq(elems) => Ok(elems),
            other => Err(ValueError::KindMismatch {
                expected: "seq",
                found: other.kind(),
            }),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Event(a), Value::Event(b)) => a == b,
            (Value::Machine(a), Value::Machine(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::NamedTuple(a), Value::NamedTuple(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Foreign(a), Value::Foreign(b)) => a == b,
            _ => false,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

/// A tuple whose fields carry names.
#[derive(Clone, Debug, Default)]
pub struct NamedTuple {
    fields: Vec<(String, Value)>,
}

impl NamedTuple {
    /// Creates an empty named tuple.
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Appends a field.
    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.fields.push((name.into(), value));
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if there are no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the field at `index`.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.fields.get(index).map(|(_, v)| v)
    }

    /// Returns the field with the given name.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Replaces the field at `index`.
    pub fn set(&mut self, index: usize, value: Value) -> Result<(), ValueError> {
        let len = self.fields.len();
        let slot = self.fields.get_mut(index).ok_or(ValueError::IndexOutOfRange {
            kind: "named tuple",
            index,
            len,
        })?;
        slot.1 = value;
        Ok(())
    }

    /// Replaces the field with the given name.
    pub fn set_named(&mut self, name: &str, value: Value) -> Result<(), ValueError> {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => {
                slot.1 = value;
                Ok(())
            }
            None => Err(ValueError::NoSuchField(name.to_string())),
        }
    }

    /// Iterates fields in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().map(|(n, v)| (n, v))
    }
}

impl PartialEq for NamedTuple {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

/// A set with structural membership, independent of insertion order.
#[derive(Clone, Debug, Default)]
pub struct ValueSet {
    items: Vec<Value>,
}

impl ValueSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Inserts a member; returns `false` if it was already present.
    pub fn insert(&mut self, value: Value) -> bool {
        if self.contains(&value) {
            return false;
        }
        self.items.push(value);
        true
    }

    /// Removes a member; returns `false` if it was absent.
    pub fn remove(&mut self, value: &Value) -> bool {
        match self.items.iter().position(|v| v == value) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Structural membership.
    pub fn contains(&self, value: &Value) -> bool {
        self.items.iter().any(|v| v == value)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.items.iter()
    }
}

impl PartialEq for ValueSet {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len()
            && self.items.iter().all(|v| other.contains(v))
    }
}

/// A map with structural key lookup, independent of insertion order.
#[derive(Clone, Debug, Default)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
}

impl ValueMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Inserts or updates a key, returning the previous value.
    pub fn insert(&mut self, key: Value, value: Value) -> Option<Value> {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => Some(std::mem::replace(&mut entry.1, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    /// Removes a key, returning its value.
    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        match self.entries.iter().position(|(k, _)| k == key) {
            Some(pos) => Some(self.entries.remove(pos).1),
            None => None,
        }
    }

    /// Looks up a key.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Returns `true` if the key is present.
    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).map(|ov| ov == v).unwrap_or(false))
    }
}

/// How an argument crosses an ingress boundary.
///
/// Replaces the status-tagged variadic convention: each argument is either
/// deep-copied, moved into the runtime, or (illegally, at these boundaries)
/// swapped.
pub enum Arg<'a> {
    /// The runtime deep-copies; the caller keeps ownership.
    Clone(&'a Value),
    /// The runtime takes ownership.
    Move(Value),
    /// Reserved for in-language swap passing; rejected at ingress boundaries.
    Swap(&'a mut Value),
}

impl Arg<'_> {
    /// Resolves the argument to an owned value.
    pub fn resolve(self) -> Result<Value, ValueError> {
        match self {
            Arg::Clone(value) => Ok(value.clone()),
            Arg::Move(value) => Ok(value),
            Arg::Swap(_) => Err(ValueError::SwapAtBoundary),
        }
    }
}

/// Builds an ingress payload from an argument vector.
///
/// No arguments produce the explicit null payload. A single argument passes
/// through. Multiple arguments are packed into a tuple of `payload_type`,
/// which must then be present and of matching arity.
pub fn payload_from_args(
    args: Vec<Arg<'_>>,
    payload_type: Option<&Type>,
) -> Result<Value, ValueError> {
    match args.len() {
        0 => Ok(Value::Null),
        1 => args.into_iter().next().unwrap().resolve(),
        n => {
            let parts = args
                .into_iter()
                .map(Arg::resolve)
                .collect::<Result<Vec<_>, _>>()?;
            let ty = payload_type.ok_or(ValueError::MissingTupleType(n))?;
            Value::tuple_from_parts(ty, parts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ProcessGuid;
    use proptest::prelude::*;

    #[test]
    fn test_defaults() {
        assert_eq!(Value::default_of(&Type::Int, &()).unwrap(), Value::Int(0));
        assert_eq!(
            Value::default_of(&Type::Bool, &()).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(Value::default_of(&Type::Machine, &()).unwrap(), Value::Null);
        let tuple = Value::default_of(&Type::Tuple(vec![Type::Int, Type::String]), &()).unwrap();
        assert_eq!(
            tuple,
            Value::Tuple(vec![Value::Int(0), Value::String(String::new())])
        );
    }

    #[test]
    fn test_default_foreign_requires_resolver() {
        let err = Value::default_of(&Type::Foreign(3), &()).unwrap_err();
        assert_eq!(err, ValueError::UnknownForeignType(3));
    }

    #[test]
    fn test_cross_kind_equality_is_false() {
        assert_ne!(Value::Int(0), Value::Float(0.0));
        assert_ne!(Value::Null, Value::Int(0));
        assert_ne!(Value::Bool(false), Value::Null);
    }

    #[test]
    fn test_set_equality_ignores_order() {
        let mut a = ValueSet::new();
        a.insert(Value::Int(1));
        a.insert(Value::Int(2));
        let mut b = ValueSet::new();
        b.insert(Value::Int(2));
        b.insert(Value::Int(1));
        assert_eq!(Value::Set(a), Value::Set(b));
    }

    #[test]
    fn test_set_insert_is_idempotent() {
        let mut set = ValueSet::new();
        assert!(set.insert(Value::Int(1)));
        assert!(!set.insert(Value::Int(1)));
        assert_eq!(set.len(), 1);
        assert!(set.remove(&Value::Int(1)));
        assert!(!set.remove(&Value::Int(1)));
    }

    #[test]
    fn test_map_insert_updates() {
        let mut map = ValueMap::new();
        assert_eq!(map.insert(Value::Int(1), Value::String("a".into())), None);
        assert_eq!(
            map.insert(Value::Int(1), Value::String("b".into())),
            Some(Value::String("a".into()))
        );
        assert_eq!(map.get(&Value::Int(1)), Some(&Value::String("b".into())));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_named_tuple_access() {
        let mut tuple = NamedTuple::new();
        tuple.push("count", Value::Int(3));
        tuple.push("label", Value::String("x".into()));
        let mut value = Value::NamedTuple(tuple);

        assert_eq!(value.field_named("count").unwrap(), &Value::Int(3));
        value.set_field_named("count", Value::Int(4)).unwrap();
        assert_eq!(value.get_field(0).unwrap(), &Value::Int(4));
        assert!(matches!(
            value.field_named("missing"),
            Err(ValueError::NoSuchField(_))
        ));
    }

    #[test]
    fn test_seq_ops() {
        let mut seq = Value::Seq(vec![Value::Int(1), Value::Int(3)]);
        seq.seq_insert(1, Value::Int(2)).unwrap();
        assert_eq!(seq.seq_get(1).unwrap(), &Value::Int(2));
        assert_eq!(seq.seq_remove(0).unwrap(), Value::Int(1));
        assert_eq!(seq.size().unwrap(), 2);
        assert!(matches!(
            seq.seq_get(5),
            Err(ValueError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_collection_op_on_wrong_kind() {
        let mut value = Value::Int(1);
        assert!(matches!(
            value.set_insert(Value::Int(2)),
            Err(ValueError::KindMismatch { .. })
        ));
        assert!(matches!(value.size(), Err(ValueError::KindMismatch { .. })));
    }

    #[test]
    fn test_conformance() {
        let id = MachineId::new(ProcessGuid::new(1, 0, 0, 0), 1, "M");
        assert!(Value::Machine(id).conforms_to(&Type::Machine));
        assert!(Value::Null.conforms_to(&Type::Machine));
        assert!(Value::Null.conforms_to(&Type::Event));
        assert!(!Value::Int(1).conforms_to(&Type::Bool));
        assert!(Value::Int(1).conforms_to(&Type::Any));

        let pair = Value::Tuple(vec![Value::Int(1), Value::String("a".into())]);
        assert!(pair.conforms_to(&Type::Tuple(vec![Type::Int, Type::String])));
        assert!(!pair.conforms_to(&Type::Tuple(vec![Type::Int])));
    }

    #[test]
    fn test_tuple_from_parts() {
        let ty = Type::NamedTuple(vec![("a".into(), Type::Int), ("b".into(), Type::Bool)]);
        let packed =
            Value::tuple_from_parts(&ty, vec![Value::Int(1), Value::Bool(true)]).unwrap();
        assert_eq!(packed.field_named("a").unwrap(), &Value::Int(1));

        let err = Value::tuple_from_parts(&ty, vec![Value::Int(1)]).unwrap_err();
        assert_eq!(err, ValueError::ArityMismatch { want: 2, got: 1 });
    }

    #[test]
    fn test_payload_from_args() {
        assert_eq!(payload_from_args(vec![], None).unwrap(), Value::Null);

        let kept = Value::Int(5);
        assert_eq!(
            payload_from_args(vec![Arg::Clone(&kept)], None).unwrap(),
            Value::Int(5)
        );
        // Clone passing leaves the caller's value intact.
        assert_eq!(kept, Value::Int(5));

        assert_eq!(
            payload_from_args(vec![Arg::Move(Value::Int(7))], None).unwrap(),
            Value::Int(7)
        );

        let mut swapped = Value::Int(9);
        let err = payload_from_args(vec![Arg::Swap(&mut swapped)], None).unwrap_err();
        assert_eq!(err, ValueError::SwapAtBoundary);

        let ty = Type::Tuple(vec![Type::Int, Type::Int]);
        let packed = payload_from_args(
            vec![Arg::Move(Value::Int(1)), Arg::Move(Value::Int(2))],
            Some(&ty),
        )
        .unwrap();
        assert_eq!(packed, Value::Tuple(vec![Value::Int(1), Value::Int(2)]));

        let err = payload_from_args(
            vec![Arg::Move(Value::Int(1)), Arg::Move(Value::Int(2))],
            None,
        )
        .unwrap_err();
        assert_eq!(err, ValueError::MissingTupleType(2));
    }

    #[test]
    fn test_clone_isolation_for_structures() {
        let original = Value::Tuple(vec![Value::Seq(vec![Value::Int(1)]), Value::Int(2)]);
        let mut copy = original.clone();
        if let Value::Tuple(elems) = &mut copy {
            elems[0].seq_insert(1, Value::Int(99)).unwrap();
        }
        assert_eq!(
            original,
            Value::Tuple(vec![Value::Seq(vec![Value::Int(1)]), Value::Int(2)])
        );
        assert_ne!(original, copy);
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            (-1.0e9f64..1.0e9).prop_map(Value::Float),
            "[a-z]{0,8}".prop_map(Value::String),
            (0u32..16).prop_map(Value::Event),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Tuple),
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Seq),
                prop::collection::vec(inner, 0..4).prop_map(|items| {
                    let mut set = ValueSet::new();
                    for item in items {
                        set.insert(item);
                    }
                    Value::Set(set)
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_equality_reflexive(v in arb_value()) {
            prop_assert_eq!(&v, &v);
        }

        #[test]
        fn prop_clone_equals_original(v in arb_value()) {
            let copy = v.clone();
            prop_assert_eq!(&copy, &v);
            prop_assert_eq!(&v, &copy);
            // Dropping the clone leaves the original usable.
            drop(copy);
            prop_assert_eq!(&v, &v);
        }
    }
}
