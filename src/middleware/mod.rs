pub mod auth;
pub mod cors;
pub mod limiter;

pub use auth::{AuthGuard, RequireAuth};
pub use cors::Cors;
pub use limiter::{RateLimit, RateLimiter, client_identity, periodic_purge};
