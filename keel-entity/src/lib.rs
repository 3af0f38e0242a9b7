//! Array-based data structures using densely numbered entity references as
//! mapping keys.
//!
//! This crate defines a number of data structures based on densely numbered
//! entity references as mapping keys:
//!
//! - [`EntityRef`] is a trait for entity reference types. An entity reference
//!   is a small index type wrapping a `u32`, giving the owner a type-safe
//!   handle that is trivially copyable and never carries a lifetime.
//! - [`PrimaryMap<K, V>`] owns the storage for the entities themselves and
//!   allocates new references as values are pushed.
//! - [`SecondaryMap<K, V>`] associates further information with entities
//!   allocated by a primary map.
//! - [`ListPool<T>`] and [`EntityList<T>`] provide small growable lists of
//!   entity references, all owned by a single pool so that dropping the pool
//!   releases every list at once.
//! - [`PackedOption<T>`] is an `Option<T>` that uses the reserved `u32::MAX`
//!   encoding instead of a discriminant, for compact in-memory layouts.
//!
//! The combination is the crate's ownership story: the maps and pools are the
//! arenas, the references are the handles, and releasing a whole function's
//! worth of graph storage is a handful of `Vec` drops.

#![deny(missing_docs)]

pub mod packed_option;

mod iter;
mod keys;
mod list;
mod map;
mod primary;
mod set;

pub use self::iter::{Iter, IterMut};
pub use self::keys::Keys;
pub use self::list::{EntityList, ListPool};
pub use self::map::SecondaryMap;
pub use self::packed_option::PackedOption;
pub use self::primary::PrimaryMap;
pub use self::set::EntitySet;

/// A type wrapping a small integer index should implement `EntityRef` so it
/// can be used as the key of an `SecondaryMap` or `EntitySet`.
pub trait EntityRef: Copy + Eq {
    /// Create a new entity reference from a small integer.
    /// This should crash if the requested index is not representable.
    fn new(_: usize) -> Self;

    /// Get the index that was used to create this entity reference.
    fn index(self) -> usize;
}

/// Macro which provides the common implementation of a 32-bit entity
/// reference: `EntityRef`, `ReservedValue`, `Display`, `Debug`, and the
/// `from_u32`/`as_u32` conversions.
#[macro_export]
macro_rules! entity_impl {
    // Basic traits.
    ($entity:ident) => {
        impl $crate::EntityRef for $entity {
            #[inline]
            fn new(index: usize) -> Self {
                debug_assert!(index < ($crate::__core::u32::MAX as usize));
                $entity(index as u32)
            }

            #[inline]
            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl $crate::packed_option::ReservedValue for $entity {
            #[inline]
            fn reserved_value() -> $entity {
                $entity($crate::__core::u32::MAX)
            }

            #[inline]
            fn is_reserved_value(&self) -> bool {
                self.0 == $crate::__core::u32::MAX
            }
        }

        impl $entity {
            /// Create a new instance from a `u32`.
            #[allow(dead_code)]
            #[inline]
            pub fn from_u32(x: u32) -> Self {
                debug_assert!(x < $crate::__core::u32::MAX);
                $entity(x)
            }

            /// Return the underlying index value as a `u32`.
            #[allow(dead_code)]
            #[inline]
            pub fn as_u32(self) -> u32 {
                self.0
            }
        }
    };

    // Include basic `Display` impl using the given display prefix.
    // Display a `Block` reference as "block12".
    ($entity:ident, $display_prefix:expr) => {
        $crate::entity_impl!($entity);

        impl $crate::__core::fmt::Display for $entity {
            fn fmt(
                &self,
                f: &mut $crate::__core::fmt::Formatter,
            ) -> $crate::__core::fmt::Result {
                write!(f, concat!($display_prefix, "{}"), self.0)
            }
        }

        impl $crate::__core::fmt::Debug for $entity {
            fn fmt(
                &self,
                f: &mut $crate::__core::fmt::Formatter,
            ) -> $crate::__core::fmt::Result {
                (self as &dyn $crate::__core::fmt::Display).fmt(f)
            }
        }
    };
}

/// Not part of the public interface; used by `entity_impl!`.
#[doc(hidden)]
pub use core as __core;
