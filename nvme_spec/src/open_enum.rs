// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A macro for defining open enums: newtypes over an integer whose named
//! values are associated constants, so that values the device reports but
//! this crate does not name still round-trip losslessly.

macro_rules! open_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident: $ty:ty {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $ty);

        #[allow(non_upper_case_globals)]
        impl $name {
            $(
                $(#[$vmeta])*
                pub const $variant: Self = Self($value);
            )*
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                #[allow(unreachable_patterns)]
                match *self {
                    $(
                        Self::$variant => f.pad(stringify!($variant)),
                    )*
                    _ => write!(f, concat!(stringify!($name), "({:#x})"), self.0),
                }
            }
        }

        impl From<$ty> for $name {
            fn from(value: $ty) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $ty {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}
