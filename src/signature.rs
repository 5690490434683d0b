//! The canonical authorization signature scheme.
//!
//! An authorization is signed over its immutable fields joined with literal
//! pipe bytes:
//!
//! ```text
//! id|agentAddress|merchantAddress|amount|currency|timestamp|expiresAt|nonce
//! ```
//!
//! with timestamps rendered in base-10 and `amount` as the exact decimal
//! string carried by the record. The signature is the lowercase hex SHA-256
//! digest of the UTF-8 payload. A wallet-based signature may be layered on
//! top by an embedder; this digest is the contract the ledger enforces.

use sha2::{Digest, Sha256};

use crate::types::Authorization;

/// The pipe-joined payload the digest is computed over.
pub fn signature_payload(auth: &Authorization) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}",
        auth.id,
        auth.agent_address,
        auth.merchant_address,
        auth.amount,
        auth.currency,
        auth.timestamp,
        auth.expires_at,
        auth.nonce,
    )
}

/// The signature the authorization should carry.
pub fn expected_signature(auth: &Authorization) -> String {
    format!("{:x}", Sha256::digest(signature_payload(auth).as_bytes()))
}

/// Whether the carried signature matches the recomputed digest.
pub fn is_valid(auth: &Authorization) -> bool {
    auth.signature == expected_signature(auth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::UnixMillis;
    use crate::types::AuthorizationStatus;

    fn sample() -> Authorization {
        Authorization {
            id: "auth_a".to_string(),
            agent_address: "agentA".to_string(),
            merchant_address: "merchantM".to_string(),
            tool_name: "search".to_string(),
            amount: "0.001".to_string(),
            currency: "USDC".to_string(),
            timestamp: UnixMillis::from_millis(1_700_000_000_000),
            expires_at: UnixMillis::from_millis(1_700_000_600_000),
            nonce: "nonce-1".to_string(),
            signature: String::new(),
            status: AuthorizationStatus::Pending,
            data_hash: None,
        }
    }

    #[test]
    fn payload_joins_fields_with_pipes() {
        assert_eq!(
            signature_payload(&sample()),
            "auth_a|agentA|merchantM|0.001|USDC|1700000000000|1700000600000|nonce-1"
        );
    }

    #[test]
    fn digest_matches_known_vector() {
        assert_eq!(
            expected_signature(&sample()),
            "fcb817fbc687a3fb5bf0517ac808d2f268a5bf5f5386557afc9232cc28a8fa48"
        );
    }

    #[test]
    fn tampered_field_invalidates() {
        let mut auth = sample();
        auth.signature = expected_signature(&auth);
        assert!(is_valid(&auth));

        auth.amount = "0.002".to_string();
        assert!(!is_valid(&auth));
    }

    #[test]
    fn uppercase_hex_is_rejected() {
        let mut auth = sample();
        auth.signature = expected_signature(&auth).to_uppercase();
        assert!(!is_valid(&auth));
    }
}
