use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{DocumentId, UserId};

/// Document-wide visibility level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Owner only.
    Private,
    /// Anyone may read; only the owner writes.
    ReadAll,
    /// Anyone may read and write.
    EditAll,
    /// Access listed per user.
    Partial,
}

/// Per-user grant, consulted when visibility is [`Visibility::Partial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserGrant {
    ReadOnly,
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub can_read: bool,
    pub can_write: bool,
}

impl PermissionDecision {
    pub const DENIED: Self = Self {
        can_read: false,
        can_write: false,
    };

    pub const READ_ONLY: Self = Self {
        can_read: true,
        can_write: false,
    };

    pub const READ_WRITE: Self = Self {
        can_read: true,
        can_write: true,
    };
}

/// Access control list for one document. The owner always has full access;
/// per-user grants take effect only under `Partial` visibility.
#[derive(Debug, Clone)]
pub struct DocumentAcl {
    pub owner: UserId,
    pub visibility: Visibility,
    pub grants: HashMap<UserId, UserGrant>,
}

impl DocumentAcl {
    pub fn new(owner: UserId, visibility: Visibility) -> Self {
        Self {
            owner,
            visibility,
            grants: HashMap::new(),
        }
    }

    pub fn decide(&self, user: &UserId) -> PermissionDecision {
        if *user == self.owner {
            return PermissionDecision::READ_WRITE;
        }
        match self.visibility {
            Visibility::Private => PermissionDecision::DENIED,
            Visibility::ReadAll => PermissionDecision::READ_ONLY,
            Visibility::EditAll => PermissionDecision::READ_WRITE,
            Visibility::Partial => match self.grants.get(user) {
                Some(UserGrant::Edit) => PermissionDecision::READ_WRITE,
                Some(UserGrant::ReadOnly) => PermissionDecision::READ_ONLY,
                None => PermissionDecision::DENIED,
            },
        }
    }
}

/// Authorization seam for sessions. Checked once at join (a denied read
/// never gets a transport) and re-pushed mid-session through `subscribe`,
/// so revocation reaches a live session without a reconnect.
pub trait PermissionGate: Send + Sync {
    fn authorize_join(&self, doc: &DocumentId, user: &UserId) -> PermissionDecision;

    fn authorize_write(&self, doc: &DocumentId, user: &UserId) -> bool {
        self.authorize_join(doc, user).can_write
    }

    /// Current decision plus future changes for this user on this document.
    fn subscribe(&self, doc: &DocumentId, user: &UserId) -> watch::Receiver<PermissionDecision>;
}

struct DocState {
    acl: DocumentAcl,
    watchers: Vec<(UserId, watch::Sender<PermissionDecision>)>,
}

/// ACL store with live revocation, for embedding and tests.
#[derive(Default)]
pub struct InMemoryGate {
    docs: Mutex<HashMap<DocumentId, DocState>>,
}

impl InMemoryGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_acl(&self, doc: DocumentId, acl: DocumentAcl) {
        let mut docs = self.docs.lock().unwrap();
        let state = docs.entry(doc).or_insert_with(|| DocState {
            acl: acl.clone(),
            watchers: Vec::new(),
        });
        state.acl = acl;
        Self::notify(state);
    }

    pub fn set_visibility(&self, doc: &DocumentId, visibility: Visibility) {
        self.update(doc, |acl| acl.visibility = visibility);
    }

    pub fn grant(&self, doc: &DocumentId, user: UserId, grant: UserGrant) {
        self.update(doc, |acl| {
            acl.grants.insert(user, grant);
        });
    }

    pub fn revoke(&self, doc: &DocumentId, user: &UserId) {
        self.update(doc, |acl| {
            acl.grants.remove(user);
        });
    }

    fn update(&self, doc: &DocumentId, f: impl FnOnce(&mut DocumentAcl)) {
        let mut docs = self.docs.lock().unwrap();
        if let Some(state) = docs.get_mut(doc) {
            f(&mut state.acl);
            Self::notify(state);
        }
    }

    fn notify(state: &mut DocState) {
        state
            .watchers
            .retain(|(_, tx)| !tx.is_closed());
        for (user, tx) in &state.watchers {
            let _ = tx.send(state.acl.decide(user));
        }
    }
}

impl PermissionGate for InMemoryGate {
    fn authorize_join(&self, doc: &DocumentId, user: &UserId) -> PermissionDecision {
        let docs = self.docs.lock().unwrap();
        docs.get(doc)
            .map(|state| state.acl.decide(user))
            .unwrap_or(PermissionDecision::DENIED)
    }

    fn subscribe(&self, doc: &DocumentId, user: &UserId) -> watch::Receiver<PermissionDecision> {
        let mut docs = self.docs.lock().unwrap();
        let current = docs
            .get(doc)
            .map(|state| state.acl.decide(user))
            .unwrap_or(PermissionDecision::DENIED);
        let (tx, rx) = watch::channel(current);
        if let Some(state) = docs.get_mut(doc) {
            state.watchers.push((*user, tx));
        }
        rx
    }
}
