//! Who may change what.
//!
//! Every mutating route picks a [`Rule`] and asks [`can_mutate`]. The admin
//! flag is never taken from the token; an [`Actor::Admin`] only exists after
//! the identity record was loaded and its flag checked by [`require_admin`].

use crate::db::models::User;
use crate::error::AppError;

/// The identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Token verified, role not looked up.
    Authenticated(String),
    /// Identity loaded from the store with its admin flag set.
    Admin(String),
}

impl Actor {
    pub fn id(&self) -> &str {
        match self {
            Actor::Authenticated(id) | Actor::Admin(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Only the resource's author.
    Owner,
    /// Any verified admin.
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Edit,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    NotOwner(Action),
    AdminRequired,
}

impl Denial {
    pub fn message(&self) -> &'static str {
        match self {
            Denial::NotOwner(Action::Edit) => "You can only edit your own posts",
            Denial::NotOwner(Action::Delete) => "You can only delete your own posts",
            Denial::AdminRequired => "Admin access required",
        }
    }
}

impl From<Denial> for AppError {
    fn from(denial: Denial) -> Self {
        AppError::Forbidden(denial.message().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(Denial),
}

impl Decision {
    pub fn into_result(self) -> Result<(), AppError> {
        match self {
            Decision::Allow => Ok(()),
            Decision::Deny(denial) => Err(denial.into()),
        }
    }
}

/// Canonical textual form of an identity id.
///
/// Stored author ids and token subjects travel different paths, so both are
/// normalized before comparison.
pub fn canonical_id(id: &str) -> String {
    let trimmed = id.trim();
    match uuid::Uuid::parse_str(trimmed) {
        Ok(uuid) => uuid.hyphenated().to_string(),
        Err(_) => trimmed.to_lowercase(),
    }
}

pub fn same_identity(a: &str, b: &str) -> bool {
    canonical_id(a) == canonical_id(b)
}

pub fn can_mutate(actor: &Actor, resource_owner: &str, rule: Rule, action: Action) -> Decision {
    match rule {
        Rule::Owner => {
            if same_identity(actor.id(), resource_owner) {
                Decision::Allow
            } else {
                Decision::Deny(Denial::NotOwner(action))
            }
        }
        Rule::Admin => match actor {
            Actor::Admin(_) => Decision::Allow,
            Actor::Authenticated(_) => Decision::Deny(Denial::AdminRequired),
        },
    }
}

/// Role gate for admin routes. `user` is the store lookup for the token's
/// identity; a vanished identity has no valid session.
pub fn require_admin(identity_id: &str, user: Option<&User>) -> Result<Actor, AppError> {
    let user = user.ok_or_else(|| AppError::Unauthenticated("User not found".into()))?;
    if !user.is_admin {
        tracing::warn!(user_id = %identity_id, "Admin route refused for non-admin");
        return Err(Denial::AdminRequired.into());
    }
    Ok(Actor::Admin(user.id.clone()))
}

/// Login-time gate: an admin-mode login by a non-admin fails outright
/// instead of issuing a token.
pub fn authorize_login(admin_requested: bool, user: &User) -> Decision {
    if admin_requested && !user.is_admin {
        Decision::Deny(Denial::AdminRequired)
    } else {
        Decision::Allow
    }
}
