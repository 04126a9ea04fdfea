use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as Base64Engine;
use base64::Engine;
use ed25519_dalek::{PublicKey, Signature};
use tracing::debug;

/// key: billing-signature-verifier -> purchase authenticity check
///
/// A `false` result is final: the purchase is dropped without acknowledge,
/// ledger mutation or user-visible callback.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, payload: &str, signature: &str) -> bool;
}

/// Accepts a base64 Ed25519 signature over the raw payload bytes when any
/// trusted key verifies it strictly.
#[derive(Debug, Clone)]
pub struct Ed25519SignatureVerifier {
    trust_roots: Vec<PublicKey>,
}

impl Ed25519SignatureVerifier {
    pub fn new(trust_roots: Vec<PublicKey>) -> Self {
        Self { trust_roots }
    }

    pub fn from_base64_keys<I, S>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut trust_roots = Vec::new();
        for key in keys {
            let decoded = Base64Engine
                .decode(key.as_ref().trim())
                .context("invalid purchase public key encoding")?;
            let key = PublicKey::from_bytes(&decoded)
                .map_err(|err| anyhow!("invalid purchase public key: {err}"))?;
            trust_roots.push(key);
        }
        if trust_roots.is_empty() {
            anyhow::bail!("no purchase signing keys configured");
        }
        Ok(Self::new(trust_roots))
    }

    fn parse_signature(signature: &str) -> Result<Signature> {
        let decoded = Base64Engine
            .decode(signature.trim())
            .context("invalid purchase signature encoding")?;
        let bytes: [u8; 64] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("invalid signature length"))?;
        Signature::from_bytes(&bytes).context("failed to parse purchase signature")
    }
}

impl SignatureVerifier for Ed25519SignatureVerifier {
    fn verify(&self, payload: &str, signature: &str) -> bool {
        let signature = match Self::parse_signature(signature) {
            Ok(signature) => signature,
            Err(err) => {
                debug!(?err, "purchase signature rejected before verification");
                return false;
            }
        };
        self.trust_roots
            .iter()
            .any(|key| key.verify_strict(payload.as_bytes(), &signature).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Keypair, SecretKey, Signer};

    fn keypair(seed: u8) -> Keypair {
        let secret = SecretKey::from_bytes(&[seed; 32]).unwrap();
        let public = PublicKey::from(&secret);
        Keypair { secret, public }
    }

    #[test]
    fn accepts_signature_from_trusted_key() {
        let keys = keypair(7);
        let payload = r#"{"purchase_token":"tok-1"}"#;
        let signature = Base64Engine.encode(keys.sign(payload.as_bytes()).to_bytes());
        let verifier =
            Ed25519SignatureVerifier::from_base64_keys([Base64Engine.encode(keys.public.as_bytes())])
                .unwrap();

        assert!(verifier.verify(payload, &signature));
        assert!(!verifier.verify(r#"{"purchase_token":"tok-2"}"#, &signature));
    }

    #[test]
    fn rejects_untrusted_or_malformed_signatures() {
        let trusted = keypair(1);
        let attacker = keypair(2);
        let payload = "payload";
        let forged = Base64Engine.encode(attacker.sign(payload.as_bytes()).to_bytes());
        let verifier = Ed25519SignatureVerifier::new(vec![trusted.public]);

        assert!(!verifier.verify(payload, &forged));
        assert!(!verifier.verify(payload, "not base64!"));
        assert!(!verifier.verify(payload, &Base64Engine.encode([0u8; 12])));
    }

    #[test]
    fn requires_at_least_one_key() {
        let empty: [&str; 0] = [];
        assert!(Ed25519SignatureVerifier::from_base64_keys(empty).is_err());
    }
}
