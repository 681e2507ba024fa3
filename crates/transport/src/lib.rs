//! Connection-pooled NNTP transport.
//!
//! RFC 3977 subset: CAPABILITIES, AUTHINFO USER/PASS, GROUP, POST (with
//! dot-stuffing), ARTICLE, STAT, QUIT, over TCP or TLS. Sessions are
//! exclusive-use: the pool hands one out per operation and a session that
//! sees a network error or a 5xx response is dropped, never returned.

pub mod error;
pub mod pool;
pub mod response;
pub mod retry;
pub mod session;
pub mod testing;

pub use error::{IsTransient, Result, TransportError};
pub use pool::{NntpPool, PooledSession};
pub use response::Response;
pub use retry::{with_retries, RetryPolicy};
pub use session::{suggest_message_id, NntpSession};
