use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

/// Share token: 256 bits of entropy, base64url. No structure reveals the
/// access type; the type byte lives inside the encrypted envelope.
pub fn generate_share_token() -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

/// API key handed to external collaborators at user creation.
pub fn generate_api_key() -> String {
    let mut raw = [0u8; 24];
    OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_unique_and_unstructured() {
        let tokens: HashSet<String> = (0..64).map(|_| generate_share_token()).collect();
        assert_eq!(tokens.len(), 64);
        for token in &tokens {
            // 32 bytes -> 43 base64url chars, no padding, no separator
            assert_eq!(token.len(), 43);
            assert!(!token.contains('='));
        }
    }
}
