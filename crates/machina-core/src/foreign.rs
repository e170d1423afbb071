//! Foreign values supplied by the host application.
//!
//! A foreign type is opaque to the runtime: its data is a boxed [`Any`] and
//! its behavior (default construction, cloning, equality, hashing) is a set
//! of host callbacks collected in a [`ForeignVtable`]. The vtable travels
//! inside every value of the type, so cloning and comparing foreign values
//! needs no global registry and no reach-back into the process.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque foreign data.
pub type ForeignData = Box<dyn Any + Send>;

/// Host callbacks implementing a foreign type's behavior.
pub struct ForeignVtable {
    /// Produces the type's default value.
    pub make_default: Box<dyn Fn() -> ForeignData + Send + Sync>,
    /// Produces a deep, independent copy.
    pub clone: Box<dyn Fn(&dyn Any) -> ForeignData + Send + Sync>,
    /// Structural equality.
    pub equals: Box<dyn Fn(&dyn Any, &dyn Any) -> bool + Send + Sync>,
    /// Structural hash, consistent with `equals`.
    pub hash: Box<dyn Fn(&dyn Any) -> u64 + Send + Sync>,
}

impl ForeignVtable {
    /// Builds a vtable for a `Clone + PartialEq` host type, with the given
    /// hash function.
    ///
    /// Covers the common case where the foreign data is an ordinary Rust
    /// value; hosts with reference-counted or handle-like data supply the
    /// fields directly instead.
    pub fn for_type<T>(hash: fn(&T) -> u64) -> Arc<Self>
    where
        T: Any + Clone + Default + PartialEq + Send,
    {
        Arc::new(Self {
            make_default: Box::new(|| Box::new(T::default())),
            clone: Box::new(|data| {
                let data = data.downcast_ref::<T>().expect("foreign data type");
                Box::new(data.clone())
            }),
            equals: Box::new(|a, b| {
                match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }),
            hash: Box::new(move |data| {
                data.downcast_ref::<T>().map(hash).unwrap_or(0)
            }),
        })
    }
}

impl fmt::Debug for ForeignVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignVtable").finish_non_exhaustive()
    }
}

/// Resolves a foreign type index to its vtable.
///
/// Implemented by the program declaration tree; `()` is the empty resolver
/// for foreign-free contexts.
pub trait ForeignResolver {
    /// Returns the vtable for the given foreign-type declaration index.
    fn vtable(&self, index: u32) -> Option<Arc<ForeignVtable>>;
}

impl ForeignResolver for () {
    fn vtable(&self, _index: u32) -> Option<Arc<ForeignVtable>> {
        None
    }
}

/// A value of a foreign type.
pub struct ForeignValue {
    type_index: u32,
    vtable: Arc<ForeignVtable>,
    data: ForeignData,
}

impl ForeignValue {
    /// Creates the default value of a foreign type.
    pub fn new_default(type_index: u32, vtable: Arc<ForeignVtable>) -> Self {
        let data = (vtable.make_default)();
        Self {
            type_index,
            vtable,
            data,
        }
    }

    /// Wraps existing host data.
    pub fn from_data(type_index: u32, vtable: Arc<ForeignVtable>, data: ForeignData) -> Self {
        Self {
            type_index,
            vtable,
            data,
        }
    }

    /// Returns the foreign-type declaration index.
    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    /// Borrows the opaque data.
    pub fn data(&self) -> &dyn Any {
        &*self.data
    }

    /// Mutably borrows the opaque data.
    pub fn data_mut(&mut self) -> &mut dyn Any {
        &mut *self.data
    }

    /// Downcasts the data to a concrete host type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }

    /// Returns the structural hash of the data.
    pub fn hash_code(&self) -> u64 {
        (self.vtable.hash)(&*self.data)
    }
}

impl Clone for ForeignValue {
    fn clone(&self) -> Self {
        Self {
            type_index: self.type_index,
            vtable: self.vtable.clone(),
            data: (self.vtable.clone)(&*self.data),
        }
    }
}

impl PartialEq for ForeignValue {
    fn eq(&self, other: &Self) -> bool {
        self.type_index == other.type_index && (self.vtable.equals)(&*self.data, &*other.data)
    }
}

impl fmt::Debug for ForeignValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignValue")
            .field("type_index", &self.type_index)
            .finish_non_exhaustive()
    }
}
