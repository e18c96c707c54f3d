//! Domain-separated signing for federation requests.
//!
//! Both schemes sign `SIGNING_DOMAIN || sign_view`; the domain prefix
//! keeps a federation signature from ever validating as anything else,
//! and the sign view excludes the auth field itself.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use aswarm_shared::{SwarmError, SwarmResult};

use super::wire::Auth;

pub const SIGNING_DOMAIN: &[u8] = b"ASWARM-FEDERATION-V1";

type HmacSha256 = Hmac<Sha256>;

/// Private signing material for the local cluster.
pub enum FederationKey {
    Ed25519(SigningKey),
    Hmac(Vec<u8>),
}

impl FederationKey {
    pub fn ed25519_from_bytes(bytes: &[u8; 32]) -> Self {
        Self::Ed25519(SigningKey::from_bytes(bytes))
    }

    pub fn hmac(secret: impl Into<Vec<u8>>) -> Self {
        Self::Hmac(secret.into())
    }

    /// Verifier counterpart handed to peers out of band.
    #[must_use]
    pub fn verifier(&self) -> FederationVerifier {
        match self {
            Self::Ed25519(key) => FederationVerifier::Ed25519(key.verifying_key()),
            Self::Hmac(secret) => FederationVerifier::Hmac(secret.clone()),
        }
    }

    pub fn sign(&self, sign_view: &[u8]) -> SwarmResult<Auth> {
        match self {
            Self::Ed25519(key) => {
                let signature = key.sign(&domain_separated(sign_view));
                Ok(Auth::Ed25519(signature.to_bytes().to_vec()))
            }
            Self::Hmac(secret) => {
                let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| {
                    SwarmError::SignatureInvalid(format!("HMAC key rejected: {}", e))
                })?;
                mac.update(&domain_separated(sign_view));
                Ok(Auth::HmacSha256(mac.finalize().into_bytes().to_vec()))
            }
        }
    }
}

/// Public verification material for one peer.
#[derive(Clone)]
pub enum FederationVerifier {
    Ed25519(VerifyingKey),
    Hmac(Vec<u8>),
}

impl FederationVerifier {
    pub fn verify(&self, sign_view: &[u8], auth: &Auth) -> SwarmResult<()> {
        match (self, auth) {
            (Self::Ed25519(key), Auth::Ed25519(raw)) => {
                let bytes: &[u8; 64] = raw.as_slice().try_into().map_err(|_| {
                    SwarmError::SignatureInvalid(format!(
                        "ed25519 signature is {} bytes, expected 64",
                        raw.len()
                    ))
                })?;
                let signature = Signature::from_bytes(bytes);
                key.verify(&domain_separated(sign_view), &signature)
                    .map_err(|_| SwarmError::SignatureInvalid("ed25519 verify failed".into()))
            }
            (Self::Hmac(secret), Auth::HmacSha256(raw)) => {
                let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| {
                    SwarmError::SignatureInvalid(format!("HMAC key rejected: {}", e))
                })?;
                mac.update(&domain_separated(sign_view));
                mac.verify_slice(raw)
                    .map_err(|_| SwarmError::SignatureInvalid("HMAC verify failed".into()))
            }
            _ => Err(SwarmError::SignatureInvalid(
                "auth scheme does not match the peer's registered verifier".into(),
            )),
        }
    }
}

fn domain_separated(sign_view: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(SIGNING_DOMAIN.len() + sign_view.len());
    message.extend_from_slice(SIGNING_DOMAIN);
    message.extend_from_slice(sign_view);
    message
}
