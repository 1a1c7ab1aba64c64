//! Authorization caches: users and groups, RBAC roles, and strategies.

mod principal;
mod role;
mod strategy;
mod user;

pub use principal::PrincipalResourceContainer;
pub use role::{RoleCache, RoleFilter};
pub use strategy::{StrategyCache, StrategyPredicate, StrategyQuery};
pub use user::UserCache;
