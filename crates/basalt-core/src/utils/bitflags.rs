// Copyright 2026 the Basalt authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A macro to define bitflags in a structured way.

/// Declares a bitflag struct over an unsigned integer type.
///
/// Generates the flag constants plus the usual set operations
/// (`contains`, `intersects`, `insert`, `remove`, `with`) and the
/// bitwise operator impls. `Debug` prints the names of the set flags.
#[macro_export]
macro_rules! basalt_bitflags {
    (
        $(#[$attr:meta])*
        $vis:vis struct $name:ident: $ty:ty {
            $(
                $(#[$flag_attr:meta])*
                const $flag_name:ident = $flag_value:expr;
            )*
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        $vis struct $name {
            bits: $ty,
        }

        impl $name {
            /// An empty set of flags.
            pub const EMPTY: Self = Self { bits: 0 };

            $(
                $(#[$flag_attr])*
                pub const $flag_name: Self = Self { bits: $flag_value };
            )*

            /// Creates a set of flags from raw bits. Unknown bits are kept.
            pub const fn from_bits(bits: $ty) -> Self {
                Self { bits }
            }

            /// Returns the raw value of the flag set.
            pub const fn bits(&self) -> $ty {
                self.bits
            }

            /// Returns `true` if no flag is set.
            pub const fn is_empty(&self) -> bool {
                self.bits == 0
            }

            /// Returns `true` if all flags in `other` are contained within `self`.
            pub const fn contains(&self, other: Self) -> bool {
                (self.bits & other.bits) == other.bits
            }

            /// Returns `true` if any flag in `other` is contained within `self`.
            pub const fn intersects(&self, other: Self) -> bool {
                (self.bits & other.bits) != 0
            }

            /// Inserts the flags in `other` into `self`.
            pub fn insert(&mut self, other: Self) {
                self.bits |= other.bits;
            }

            /// Removes the flags in `other` from `self`.
            pub fn remove(&mut self, other: Self) {
                self.bits &= !other.bits;
            }

            /// Returns a new set with `other` flags inserted.
            #[must_use]
            pub const fn with(mut self, other: Self) -> Self {
                self.bits |= other.bits;
                self
            }
        }

        impl core::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self { bits: self.bits | rhs.bits }
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.bits |= rhs.bits;
            }
        }

        impl core::ops::BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self { bits: self.bits & rhs.bits }
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                let mut first = true;
                $(
                    if $flag_value != 0 && self.contains(Self::$flag_name) {
                        if !first {
                            f.write_str(" | ")?;
                        }
                        first = false;
                        f.write_str(stringify!($flag_name))?;
                    }
                )*
                if first {
                    f.write_str("(empty)")?;
                }
                Ok(())
            }
        }
    };
}
