// Policy engine - matching, sanitization, PII, rate limiting and orchestration

pub mod context;
pub mod honeypots;
pub mod matcher;
pub mod pii;
pub mod rate_limiter;
pub mod sanitizer;
pub mod shield;
pub mod verdict;
