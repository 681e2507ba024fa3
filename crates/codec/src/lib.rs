//! Wire codec: yEnc binary-to-text encoding, the compression envelope, and
//! redundancy copy planning.

mod compress;
mod error;
mod redundancy;
mod yenc;

pub use compress::{
    compress_segment, decompress_envelope, CompressionResult, CompressionSkipReason,
};
pub use error::{CodecError, Result};
pub use redundancy::CopyPlan;
pub use yenc::{yenc_decode, yenc_encode, DecodedPart, YencParams};
