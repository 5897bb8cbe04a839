//! Identifiers for engine entities.
//!
//! Contexts and invocations are identified by object identity inside the
//! engine. These ids exist so that log lines and hook callbacks can refer to
//! them.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! engine_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Fresh random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "_{}"), self.0.simple())
            }
        }
    };
}

engine_id!(
    /// One per execution context, worker or root
    ContextId,
    "ctx"
);

engine_id!(
    /// Shared by every worker of one callable invocation
    InvocationId,
    "inv"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ContextId::new(), ContextId::new());
        assert_ne!(InvocationId::new(), InvocationId::new());
    }

    #[test]
    fn test_id_display() {
        let ctx = ContextId::new().to_string();
        assert!(ctx.starts_with("ctx_"));
        assert_eq!(ctx.len(), 4 + 32);
        assert!(InvocationId::new().to_string().starts_with("inv_"));
    }

    #[test]
    fn test_id_serializes_as_plain_uuid() {
        let id = InvocationId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json.len(), 36 + 2);
        assert_eq!(serde_json::from_str::<InvocationId>(&json).unwrap(), id);
    }
}
