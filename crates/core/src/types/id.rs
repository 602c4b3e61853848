//! Newtype IDs for type-safe entity references.
//!
//! Cart identifiers come from the remote authority and are opaque strings, so
//! every ID here wraps a `String`. Use the `define_id!` macro to create new
//! wrappers; mixing a `ProductId` with a `LineId` is a compile error.

use uuid::Uuid;

/// Prefix carried by line IDs generated locally before confirmation.
pub const PROVISIONAL_LINE_PREFIX: &str = "tmp-";

/// Macro to define a type-safe opaque ID wrapper.
///
/// Creates a newtype wrapper around `String` with:
/// - `Serialize`/`Deserialize` with `#[serde(transparent)]`
/// - `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`, `PartialOrd`, `Ord`
/// - Conversion methods: `new()`, `as_str()`
/// - `From<&str>`, `From<String>` and `Display` implementations
///
/// # Example
///
/// ```rust
/// # use naked_pineapple_core::define_id;
/// define_id!(WishlistId);
/// define_id!(ReviewId);
///
/// let wishlist = WishlistId::new("w-1");
/// assert_eq!(wishlist.as_str(), "w-1");
///
/// // These are different types, so this won't compile:
/// // let _: ReviewId = wishlist;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            ::serde::Serialize,
            ::serde::Deserialize
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new ID from any string-like value.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the underlying identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id!(ProductId);
define_id!(LineId);
define_id!(CustomerId);

impl LineId {
    /// Generate a temporary line ID for a line the remote authority has not
    /// confirmed yet.
    #[must_use]
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_LINE_PREFIX}{}", Uuid::new_v4()))
    }

    /// Whether this ID was generated locally rather than assigned by the server.
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_LINE_PREFIX)
    }
}
