use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

const TOKEN_BYTES: usize = 32;

/// Opaque, unguessable capture token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CaptureToken(String);

impl CaptureToken {
    /// 32 bytes from the OS CSPRNG, URL-safe base64 without padding.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Six-digit code the proctor view shows next to the QR code.
    pub fn pairing_code(&self) -> String {
        pairing_code(&self.0)
    }
}

impl fmt::Display for CaptureToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn pairing_code(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{:06}", n % 1_000_000)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Issued,
    Connected,
    Closed,
    Expired,
}

impl TokenState {
    pub fn is_live(&self) -> bool {
        matches!(self, TokenState::Issued | TokenState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tokens_are_unique_and_url_safe() {
        let tokens: HashSet<String> = (0..1000).map(|_| CaptureToken::generate().into_string()).collect();
        assert_eq!(tokens.len(), 1000);
        for t in &tokens {
            assert_eq!(t.len(), 43);
            assert!(t.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn test_pairing_code_is_stable_six_digits() {
        let token = CaptureToken::generate();
        let code = token.pairing_code();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(code, token.pairing_code());
        // sha256("abc") starts with ba7816bf
        assert_eq!(pairing_code("abc"), format!("{:06}", 0xba7816bfu32 % 1_000_000));
    }

    #[test]
    fn test_state_liveness() {
        assert!(TokenState::Issued.is_live());
        assert!(TokenState::Connected.is_live());
        assert!(TokenState::Closed.is_terminal());
        assert!(TokenState::Expired.is_terminal());
    }
}
