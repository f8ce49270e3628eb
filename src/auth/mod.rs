pub mod password;
pub mod policy;
pub mod token;

pub use policy::{can_mutate, canonical_id, Action, Actor, Decision, Denial, Rule};
pub use token::{TokenService, TokenVerdict};
