//! Capability checks for versioned objects.
//!
//! Both predicates are pure: the caller gathers the relevant facts (owner,
//! visibility of the current version, the requester's explicit grant, and
//! whether requester and owner are friends) and asks for a verdict. A denied
//! check is simply `false`; translating it into an HTTP status is the job of
//! the request layer.

use crate::types::{AccessLevel, UserId, Visibility};

/// Everything the access predicates need to know about one object and one
/// requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessFacts {
    pub owner: UserId,
    pub visibility: Visibility,
    /// Explicit share held by the requester, if any.
    pub grant: Option<AccessLevel>,
    /// A friendship edge exists between requester and owner.
    pub friends_with_owner: bool,
}

/// Whether `user` may read the object described by `facts`.
pub fn accessible(user: UserId, facts: &AccessFacts) -> bool {
    if user == facts.owner || facts.grant.is_some() {
        return true;
    }
    match facts.visibility {
        Visibility::Public => true,
        Visibility::Friendly => facts.friends_with_owner,
        Visibility::Private => false,
    }
}

/// Whether `user` may modify the object. Visibility never grants write.
pub fn editable(user: UserId, facts: &AccessFacts) -> bool {
    user == facts.owner || facts.grant == Some(AccessLevel::Write)
}

/// Visibility level and the grant map belong to the author alone.
pub fn can_manage_acl(user: UserId, facts: &AccessFacts) -> bool {
    user == facts.owner
}
