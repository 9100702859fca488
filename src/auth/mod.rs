//! Identity & Policy
//! Mission: Bearer-token validation, role ranks, resource-tenant checks

pub mod jwt;
pub mod middleware;
pub mod models;

pub use jwt::JwtHandler;
pub use middleware::auth_middleware;
pub use models::{Claims, Identity, Role};
