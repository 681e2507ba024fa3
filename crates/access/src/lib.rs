//! Access control: share creation, the opaque token envelope, and the
//! single verification entry point the download engine consumes.
//!
//! Three access types share one token surface. The access-type byte and
//! every other structured field live inside an AEAD envelope keyed from
//! the token's random seed, so an observer holding a token sees only a
//! random string, and an observer without one learns nothing at all.

pub mod error;
pub mod shares;
pub mod token;
pub mod wrapping;

pub use error::{AccessError, Result};
pub use shares::{build_share, verify_access, AccessSpec, Credentials, Recipient};
pub use token::{parse_token, ShareToken, TOKEN_SCHEME};
pub use wrapping::WrappedKeyMaterial;
