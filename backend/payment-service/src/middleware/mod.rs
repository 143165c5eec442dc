pub mod auth;

pub use auth::{Claims, JwtAuthMiddleware, JwtVerifier, UserId};
