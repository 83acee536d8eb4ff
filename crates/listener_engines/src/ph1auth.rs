#![forbid(unsafe_code)]

use listener_kernel_contracts::ph1sess::UserId;
use sha2::{Digest, Sha256};

pub mod reason_codes {
    use listener_kernel_contracts::ReasonCodeId;

    pub const AUTH_OK: ReasonCodeId = ReasonCodeId(0x4155_0001);
    pub const AUTH_MALFORMED: ReasonCodeId = ReasonCodeId(0x4155_00F1);
    pub const AUTH_SIGNATURE_MISMATCH: ReasonCodeId = ReasonCodeId(0x4155_00F2);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    Malformed,
    SignatureMismatch,
}

impl AuthFailure {
    pub fn reason_code(self) -> listener_kernel_contracts::ReasonCodeId {
        match self {
            AuthFailure::Malformed => reason_codes::AUTH_MALFORMED,
            AuthFailure::SignatureMismatch => reason_codes::AUTH_SIGNATURE_MISMATCH,
        }
    }
}

/// Bearer tokens of the form `<user_id>.<hex sha256(secret ":" user_id)>`.
#[derive(Clone)]
pub struct SignedTokenVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignedTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedTokenVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignedTokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, AuthFailure> {
        let secret = secret.into();
        if secret.len() < 16 {
            return Err(AuthFailure::Malformed);
        }
        Ok(Self { secret })
    }

    pub fn mint(&self, user_id: &UserId) -> String {
        format!("{}.{}", user_id.as_str(), self.signature(user_id.as_str()))
    }

    pub fn verify(&self, token: &str) -> Result<UserId, AuthFailure> {
        let (user, sig) = token.rsplit_once('.').ok_or(AuthFailure::Malformed)?;
        let user_id = UserId::new(user).map_err(|_| AuthFailure::Malformed)?;
        if sig.len() != 64 || !sig.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(AuthFailure::Malformed);
        }
        let expected = self.signature(user_id.as_str());
        let diff = expected
            .bytes()
            .zip(sig.to_ascii_lowercase().bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(AuthFailure::SignatureMismatch);
        }
        Ok(user_id)
    }

    fn signature(&self, user: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(b":");
        hasher.update(user.as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}
