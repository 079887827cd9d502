pub mod auth;
pub mod null;
pub mod rate_limit;
pub mod retry;
pub mod traits;

pub use auth::{ApiCredentials, AuthStamp, RequestSigner};
pub use null::NullTransport;
pub use rate_limit::RateLimiter;
pub use retry::{retry_after_delay, with_retries, RetryPolicy};
pub use traits::{Ack, ExchangeOrder, ExchangeTransport, LimitOrderRequest};
