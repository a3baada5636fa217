//! Interned operation identifiers.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;

use crate::backend::hashing::{fnv1a_hash, Fingerprint, FingerprintHasher, StructuralHash};

/// Namespace of the graph primitives: device data, scalars, dimension queries, placeholders.
pub const PRIM_NAMESPACE: &str = "prim";
/// Namespace of tensor math.
pub const OPS_NAMESPACE: &str = "ops";

struct OpKindEntry {
    namespace: String,
    name: String,
    qualified: String,
    fingerprint: Fingerprint,
}

static INTERNER: Lazy<Mutex<HashMap<(String, String), Arc<OpKindEntry>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Operation identifier compared by identity of its interned entry.
///
/// Interning the same `(namespace, name)` pair twice yields handles that compare equal, so the
/// comparison is a pointer check. The structural fingerprint is derived from the qualified name
/// and therefore does not depend on interning order.
#[derive(Clone)]
pub struct OpKind(Arc<OpKindEntry>);

impl OpKind {
    pub fn new(namespace: &str, name: &str) -> Self {
        let mut interner = INTERNER.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = interner
            .entry((namespace.to_string(), name.to_string()))
            .or_insert_with(|| {
                let qualified = format!("{namespace}::{name}");
                Arc::new(OpKindEntry {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    fingerprint: fnv1a_hash(qualified.as_bytes()),
                    qualified,
                })
            });
        OpKind(Arc::clone(entry))
    }

    pub fn prim(name: &str) -> Self {
        Self::new(PRIM_NAMESPACE, name)
    }

    pub fn ops(name: &str) -> Self {
        Self::new(OPS_NAMESPACE, name)
    }

    pub fn namespace(&self) -> &str {
        &self.0.namespace
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn qualified_name(&self) -> &str {
        &self.0.qualified
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.0.fingerprint
    }
}

impl PartialEq for OpKind {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for OpKind {}

impl Hash for OpKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl StructuralHash for OpKind {
    fn structural_hash(&self, hasher: &mut FingerprintHasher) {
        hasher.write_u64(self.0.fingerprint);
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.qualified)
    }
}

impl fmt::Debug for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpKind({})", self.0.qualified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_identical_handles() {
        let a = OpKind::ops("add");
        let b = OpKind::new("ops", "add");
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_ne!(a, OpKind::ops("sub"));
        assert_ne!(a, OpKind::prim("add"));
    }

    #[test]
    fn renders_qualified_name() {
        let kind = OpKind::prim("device_data");
        assert_eq!(kind.to_string(), "prim::device_data");
        assert_eq!(kind.namespace(), "prim");
        assert_eq!(kind.name(), "device_data");
    }
}
