//! Credential issuing and the trusted-origin policy.
//!
//! Clients trade the long-lived configured token for a short-lived signed
//! session credential over HTTP, then present that credential in the
//! streaming `auth` message. The credential is a compact two-part string:
//! base64url(JSON claims) "." hex(SHA-256(secret || "." || payload)).
//!
//! The transport itself is trusted to a private overlay network; every
//! connection's peer address must match a configured prefix or be loopback.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Default credential lifetime: 24 hours.
pub const DEFAULT_CREDENTIAL_TTL_SECS: u64 = 24 * 60 * 60;

/// Errors from credential verification.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credential is not in the expected two-part form.
    #[error("malformed credential")]
    Malformed,

    /// Signature does not match the payload.
    #[error("invalid signature")]
    InvalidSignature,

    /// Credential is past its expiry.
    #[error("credential expired")]
    Expired,
}

/// Claims carried inside a session credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Peer address the credential was issued to.
    pub client_ip: String,
    /// Issue time, Unix epoch seconds.
    pub issued_at: u64,
    /// Expiry time, Unix epoch seconds.
    pub expires_at: u64,
}

/// Issues and verifies session credentials with a server-local secret.
pub struct TokenIssuer {
    secret: String,
    ttl_secs: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl TokenIssuer {
    pub fn new(secret: String, ttl_secs: u64) -> Self {
        Self { secret, ttl_secs }
    }

    /// Generate a random secret for servers that do not configure one.
    /// Credentials then survive only as long as the process.
    pub fn random_secret() -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Credential lifetime in seconds.
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Issue a credential bound to the requesting peer address.
    pub fn issue(&self, client_ip: IpAddr) -> String {
        let now = now_secs();
        let claims = Claims {
            client_ip: client_ip.to_string(),
            issued_at: now,
            expires_at: now + self.ttl_secs,
        };
        // Claims are plain-old-data; serialization cannot fail.
        let payload = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&claims).unwrap_or_default(),
        );
        let sig = self.sign(&payload);
        format!("{payload}.{sig}")
    }

    /// Verify a credential and return its claims.
    pub fn verify(&self, credential: &str) -> Result<Claims, AuthError> {
        let (payload, sig) = credential.split_once('.').ok_or(AuthError::Malformed)?;
        if !constant_time_eq(self.sign(payload).as_bytes(), sig.as_bytes()) {
            return Err(AuthError::InvalidSignature);
        }
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&bytes).map_err(|_| AuthError::Malformed)?;
        if claims.expires_at <= now_secs() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    fn sign(&self, payload: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b".");
        hasher.update(payload.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Trusted-network policy based on peer address prefixes.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    prefixes: Vec<String>,
}

impl TrustPolicy {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    /// Whether a peer address may talk to this server at all. Loopback is
    /// always allowed; everything else must match a configured prefix.
    pub fn is_trusted(&self, addr: IpAddr) -> bool {
        if addr.is_loopback() {
            return true;
        }
        // IPv4-mapped IPv6 addresses are matched by their v4 form.
        let text = match addr {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4.to_string(),
                None => v6.to_string(),
            },
        };
        self.prefixes.iter().any(|p| text.starts_with(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("test-secret".to_string(), 3600)
    }

    #[test]
    fn test_issue_verify_roundtrip() {
        let issuer = issuer();
        let ip: IpAddr = Ipv4Addr::new(100, 64, 0, 7).into();
        let credential = issuer.issue(ip);
        let claims = issuer.verify(&credential).expect("verify failed");
        assert_eq!(claims.client_ip, "100.64.0.7");
        assert!(claims.expires_at > claims.issued_at);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let issuer = issuer();
        let credential = issuer.issue(Ipv4Addr::LOCALHOST.into());
        let (payload, sig) = credential.split_once('.').unwrap();
        let forged_claims = Claims {
            client_ip: "203.0.113.9".to_string(),
            issued_at: 0,
            expires_at: u64::MAX,
        };
        let forged_payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        assert_ne!(payload, forged_payload);
        let forged = format!("{forged_payload}.{sig}");
        assert!(matches!(
            issuer.verify(&forged),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let credential = issuer().issue(Ipv4Addr::LOCALHOST.into());
        let other = TokenIssuer::new("other-secret".to_string(), 3600);
        assert!(matches!(
            other.verify(&credential),
            Err(AuthError::InvalidSignature)
        ));
    }

    #[test]
    fn test_expired_credential_rejected() {
        let issuer = TokenIssuer::new("test-secret".to_string(), 0);
        let credential = issuer.issue(Ipv4Addr::LOCALHOST.into());
        assert!(matches!(issuer.verify(&credential), Err(AuthError::Expired)));
    }

    #[test]
    fn test_garbage_credential_rejected() {
        let issuer = issuer();
        assert!(matches!(issuer.verify("no-dot"), Err(AuthError::Malformed)));
        assert!(issuer.verify("a.b").is_err());
        assert!(issuer.verify("").is_err());
    }

    #[test]
    fn test_random_secret_is_unique() {
        assert_ne!(TokenIssuer::random_secret(), TokenIssuer::random_secret());
    }

    #[test]
    fn test_trust_policy_prefix_match() {
        let policy = TrustPolicy::new(vec!["100.".to_string()]);
        assert!(policy.is_trusted(Ipv4Addr::new(100, 101, 4, 2).into()));
        assert!(!policy.is_trusted(Ipv4Addr::new(203, 0, 113, 1).into()));
    }

    #[test]
    fn test_trust_policy_loopback_always_allowed() {
        let policy = TrustPolicy::new(vec![]);
        assert!(policy.is_trusted(Ipv4Addr::LOCALHOST.into()));
        assert!(policy.is_trusted(Ipv6Addr::LOCALHOST.into()));
    }

    #[test]
    fn test_trust_policy_ipv4_mapped_ipv6() {
        let policy = TrustPolicy::new(vec!["100.".to_string()]);
        let mapped: IpAddr = Ipv4Addr::new(100, 77, 1, 1).to_ipv6_mapped().into();
        assert!(policy.is_trusted(mapped));
    }

    #[test]
    fn test_prefix_does_not_match_partial_octet() {
        // "10." must not trust 100.x addresses.
        let policy = TrustPolicy::new(vec!["10.".to_string()]);
        assert!(policy.is_trusted(Ipv4Addr::new(10, 0, 0, 5).into()));
        assert!(!policy.is_trusted(Ipv4Addr::new(100, 0, 0, 5).into()));
    }
}
