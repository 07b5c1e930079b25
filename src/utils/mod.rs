pub use flag::*;
pub use rate_limiter::*;

mod flag;
pub mod logger;
pub mod net;
mod rate_limiter;
