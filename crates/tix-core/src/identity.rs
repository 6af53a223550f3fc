use uuid::Uuid;

/// Namespace every incident uuid is derived under unless configured otherwise.
pub const DEFAULT_NAMESPACE: Uuid = Uuid::from_u128(0xa3a6b0c2_3e28_4a95_87d8_2a22f3e5b4f2);

/// Derives name-based (v5) uuids so re-ingesting a record always hits the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityAssigner {
    namespace: Uuid,
}

impl IdentityAssigner {
    pub fn new(namespace: Uuid) -> Self {
        Self { namespace }
    }

    pub fn namespace(&self) -> Uuid {
        self.namespace
    }

    pub fn assign(&self, source_prefix: &str, source_event_id: &str) -> Uuid {
        let name = format!("{source_prefix}-{source_event_id}");
        Uuid::new_v5(&self.namespace, name.as_bytes())
    }
}

impl Default for IdentityAssigner {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}
