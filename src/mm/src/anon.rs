use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use memmap::MappingKey;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct AnonGroup {
    id: u64,
    members: Mutex<AnonMembers>,
}

/// Shared handle to the group of regions whose anonymous pages may be
/// shared. Two handles are the same token iff they point at the same group.
#[derive(Clone, Debug)]
pub struct AnonToken(Arc<AnonGroup>);

impl AnonToken {
    pub fn new() -> Self {
        Self(Arc::new(AnonGroup {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
            members: Mutex::new(AnonMembers::default()),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn lock(&self) -> MutexGuard<'_, AnonMembers> {
        self.0.members.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ptr_eq(&self, other: &AnonToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Either side absent, or both the same token.
    pub fn compatible(a: Option<&AnonToken>, b: Option<&AnonToken>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            _ => true,
        }
    }
}

impl Default for AnonToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for AnonToken {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for AnonToken {}

/// Regions currently linked to one token.
#[derive(Debug, Default)]
pub struct AnonMembers(BTreeSet<MappingKey>);

impl AnonMembers {
    pub fn link(&mut self, key: MappingKey) {
        if !self.0.insert(key) {
            panic!("region {:?} linked to anon token twice", key);
        }
    }

    pub fn unlink(&mut self, key: MappingKey) {
        if !self.0.remove(&key) {
            panic!("region {:?} is not linked to this anon token", key);
        }
    }

    pub fn contains(&self, key: MappingKey) -> bool {
        self.0.contains(&key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
