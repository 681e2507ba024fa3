//! Article assembly for posting workers.
//!
//! The wire subject is `[<i>/<n>] <outer_subject> yEnc` with a fresh outer
//! token per attempt, so a retried or redundant post of the same segment
//! never repeats a subject.

use codec::{yenc_encode, YencParams};
use crypto::outer_subject;

pub(crate) struct ArticlePlan {
    /// 1-based part number within the object.
    pub part: u32,
    pub total: u32,
    /// Whole-object size advertised in the yEnc header.
    pub object_size: u64,
    /// 1-based inclusive byte range of this part.
    pub begin: u64,
    pub end: u64,
    pub inner: [u8; 16],
}

pub(crate) struct EncodedArticle {
    pub subject: String,
    pub body: Vec<u8>,
    pub outer: String,
}

pub(crate) fn encode_article(plan: &ArticlePlan, payload: &[u8]) -> EncodedArticle {
    let outer = outer_subject(&plan.inner);
    let subject = format!("[{}/{}] {} yEnc", plan.part, plan.total, outer);
    let body = yenc_encode(
        payload,
        &YencParams {
            part: plan.part,
            total: plan.total,
            size: plan.object_size,
            begin: plan.begin,
            end: plan.end,
            name: outer.clone(),
        },
    );
    EncodedArticle {
        subject,
        body,
        outer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_shape_and_fresh_outer_tokens() {
        let plan = ArticlePlan {
            part: 2,
            total: 4,
            object_size: 2_595_088,
            begin: 768_001,
            end: 1_536_000,
            inner: [9u8; 16],
        };
        let payload = vec![1u8; 64];
        let first = encode_article(&plan, &payload);
        let second = encode_article(&plan, &payload);

        assert!(first.subject.starts_with("[2/4] "));
        assert!(first.subject.ends_with(" yEnc"));
        assert_ne!(first.subject, second.subject);
        assert_ne!(first.outer, second.outer);

        let decoded = codec::yenc_decode(&first.body).unwrap();
        assert_eq!(decoded.data, payload);
        assert_eq!(decoded.part, 2);
        assert_eq!(decoded.begin, Some(768_001));
    }
}
