//! The PII gate: decides from the role set whether plaintext personal
//! fields may be emitted, and shapes beneficiary records accordingly.
//! Ciphertext envelopes are never withheld; only plaintext is gated.
//! This crate never encrypts.

use std::collections::BTreeSet;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use amani_contracts::{
    BeneficiaryRecord, CipherEnvelope, ENVELOPE_ALGORITHM, EntityType, PiiEnvelopes, PiiPlain, Role,
};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PiiError {
    /// Envelope fields are not decodable (bad hex, wrong lengths).
    MalformedEnvelope(String),
    /// Envelope names an algorithm this build does not seal with.
    UnsupportedAlgorithm(String),
    /// Authenticated decryption failed: wrong key or tampered data.
    /// Fatal for the request; hiding it behind a null would mask a PII
    /// integrity problem.
    DecryptFailed,
}

impl std::fmt::Display for PiiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PiiError::MalformedEnvelope(detail) => {
                write!(f, "malformed cipher envelope: {}", detail)
            }
            PiiError::UnsupportedAlgorithm(tag) => {
                write!(f, "unsupported envelope algorithm: {}", tag)
            }
            PiiError::DecryptFailed => write!(f, "envelope failed authenticated decryption"),
        }
    }
}

impl std::error::Error for PiiError {}

/// True iff the role set may see decrypted PII. A pure function of the
/// role set — never per-row or per-field. The sync endpoints use this
/// same gate; there is no relaxed policy anywhere.
pub fn can_decrypt(roles: &BTreeSet<Role>) -> bool {
    roles.contains(&Role::SuperAdmin) || roles.contains(&Role::SystemAdministrator)
}

/// Unseals cipher envelopes. The single production implementation is
/// [`AesGcmDecryptor`]; tests substitute their own.
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, envelope: &CipherEnvelope) -> Result<String, PiiError>;
}

/// AES-256-GCM over the hex envelope format: 12-byte iv, 16-byte
/// authentication tag, ciphertext, all lowercase hex.
#[derive(Clone)]
pub struct AesGcmDecryptor {
    key: [u8; 32],
}

impl AesGcmDecryptor {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn from_hex(key_hex: &str) -> Result<Self, PiiError> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|_| PiiError::MalformedEnvelope("key must be hex".to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| PiiError::MalformedEnvelope("key must be 32 bytes".to_string()))?;
        Ok(Self::new(key))
    }
}

impl Decryptor for AesGcmDecryptor {
    fn decrypt(&self, envelope: &CipherEnvelope) -> Result<String, PiiError> {
        if envelope.algorithm != ENVELOPE_ALGORITHM {
            return Err(PiiError::UnsupportedAlgorithm(envelope.algorithm.clone()));
        }

        let iv = decode_field(&envelope.iv, "iv")?;
        if iv.len() != 12 {
            return Err(PiiError::MalformedEnvelope(
                "iv must be 12 bytes".to_string(),
            ));
        }
        let auth_tag = decode_field(&envelope.auth_tag, "auth_tag")?;
        if auth_tag.len() != 16 {
            return Err(PiiError::MalformedEnvelope(
                "auth_tag must be 16 bytes".to_string(),
            ));
        }
        let mut sealed = decode_field(&envelope.ciphertext, "ciphertext")?;
        sealed.extend_from_slice(&auth_tag);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| PiiError::MalformedEnvelope("key must be 32 bytes".to_string()))?;
        let plain = cipher
            .decrypt(Nonce::from_slice(&iv), sealed.as_slice())
            .map_err(|_| PiiError::DecryptFailed)?;

        String::from_utf8(plain)
            .map_err(|_| PiiError::MalformedEnvelope("plaintext is not utf-8".to_string()))
    }
}

fn decode_field(hex_value: &str, field: &str) -> Result<Vec<u8>, PiiError> {
    hex::decode(hex_value)
        .map_err(|_| PiiError::MalformedEnvelope(format!("{} must be hex", field)))
}

/// A beneficiary record as serialized to callers: envelopes always
/// present, plaintext only when the gate admitted the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapedBeneficiary {
    pub beneficiary_id: String,
    pub pseudonym: String,
    pub status: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub staff_user_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub pii_enc: PiiEnvelopes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pii: Option<PiiPlain>,
}

/// Shape one record. With `allow_decrypt`, every non-null envelope is
/// unsealed into the parallel `pii` object (null envelopes become null
/// plaintext); otherwise the `pii` key is absent entirely. Callers that
/// receive plaintext must write an audit record and disable response
/// caching — that side of the contract lives at the HTTP layer.
pub fn shape_record(
    record: BeneficiaryRecord,
    decryptor: &dyn Decryptor,
    allow_decrypt: bool,
) -> Result<ShapedBeneficiary, PiiError> {
    let pii = if allow_decrypt {
        Some(unseal_all(&record.pii_enc, decryptor)?)
    } else {
        None
    };

    Ok(ShapedBeneficiary {
        beneficiary_id: record.beneficiary_id,
        pseudonym: record.pseudonym,
        status: record.status,
        entity_id: record.entity_id,
        entity_type: record.entity_type,
        staff_user_id: record.staff_user_id,
        created_at: record.created_at,
        updated_at: record.updated_at,
        pii_enc: record.pii_enc,
        pii,
    })
}

pub fn shape_list(
    records: Vec<BeneficiaryRecord>,
    decryptor: &dyn Decryptor,
    allow_decrypt: bool,
) -> Result<Vec<ShapedBeneficiary>, PiiError> {
    records
        .into_iter()
        .map(|record| shape_record(record, decryptor, allow_decrypt))
        .collect()
}

fn unseal_all(envelopes: &PiiEnvelopes, decryptor: &dyn Decryptor) -> Result<PiiPlain, PiiError> {
    Ok(PiiPlain {
        first_name: unseal(&envelopes.first_name, decryptor)?,
        last_name: unseal(&envelopes.last_name, decryptor)?,
        date_of_birth: unseal(&envelopes.date_of_birth, decryptor)?,
        national_id: unseal(&envelopes.national_id, decryptor)?,
        phone: unseal(&envelopes.phone, decryptor)?,
        email: unseal(&envelopes.email, decryptor)?,
        address: unseal(&envelopes.address, decryptor)?,
    })
}

fn unseal(
    envelope: &Option<CipherEnvelope>,
    decryptor: &dyn Decryptor,
) -> Result<Option<String>, PiiError> {
    match envelope {
        None => Ok(None),
        Some(envelope) => decryptor.decrypt(envelope).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: [u8; 32] = [7u8; 32];

    // Test-only sealer; production code only ever decrypts.
    fn seal(plaintext: &str) -> CipherEnvelope {
        let cipher = Aes256Gcm::new_from_slice(&TEST_KEY).expect("key is 32 bytes");
        let nonce_bytes = [3u8; 12];
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut sealed = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .expect("encryption should succeed");
        let tag = sealed.split_off(sealed.len() - 16);

        CipherEnvelope {
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            iv: hex::encode(nonce_bytes),
            auth_tag: hex::encode(tag),
            ciphertext: hex::encode(sealed),
        }
    }

    fn record(first_name: Option<CipherEnvelope>) -> BeneficiaryRecord {
        BeneficiaryRecord {
            beneficiary_id: "b1".to_string(),
            pseudonym: "BEN-0001".to_string(),
            status: "active".to_string(),
            entity_id: "a1".to_string(),
            entity_type: EntityType::Activity,
            staff_user_id: "u1".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-02T00:00:00Z".to_string(),
            pii_enc: PiiEnvelopes {
                first_name,
                ..PiiEnvelopes::default()
            },
        }
    }

    #[test]
    fn gate_admits_exactly_the_admin_tier() {
        let admit = [
            BTreeSet::from([Role::SuperAdmin]),
            BTreeSet::from([Role::SystemAdministrator]),
            BTreeSet::from([Role::SuperAdmin, Role::ProgramManager]),
        ];
        for roles in &admit {
            assert!(can_decrypt(roles), "{:?} should decrypt", roles);
        }

        let deny = [
            BTreeSet::from([Role::ProgramManager]),
            BTreeSet::from([Role::SubProjectManager, Role::FieldOperator]),
            BTreeSet::new(),
        ];
        for roles in &deny {
            assert!(!can_decrypt(roles), "{:?} should not decrypt", roles);
        }
    }

    #[test]
    fn decrypt_round_trips_the_sealed_value() {
        let decryptor = AesGcmDecryptor::new(TEST_KEY);
        let envelope = seal("Asha");
        assert_eq!(decryptor.decrypt(&envelope).expect("unseal"), "Asha");
    }

    #[test]
    fn wrong_key_is_a_decrypt_failure_not_a_null() {
        let decryptor = AesGcmDecryptor::new([9u8; 32]);
        let envelope = seal("Asha");
        assert_eq!(decryptor.decrypt(&envelope), Err(PiiError::DecryptFailed));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let decryptor = AesGcmDecryptor::new(TEST_KEY);
        let mut envelope = seal("Asha");
        let mut raw = hex::decode(&envelope.ciphertext).expect("hex");
        raw[0] ^= 0xff;
        envelope.ciphertext = hex::encode(raw);
        assert_eq!(decryptor.decrypt(&envelope), Err(PiiError::DecryptFailed));
    }

    #[test]
    fn malformed_envelope_fields_are_rejected_before_decryption() {
        let decryptor = AesGcmDecryptor::new(TEST_KEY);

        let mut envelope = seal("Asha");
        envelope.iv = "zz".to_string();
        assert!(matches!(
            decryptor.decrypt(&envelope),
            Err(PiiError::MalformedEnvelope(_))
        ));

        let mut envelope = seal("Asha");
        envelope.algorithm = "aes-128-cbc".to_string();
        assert!(matches!(
            decryptor.decrypt(&envelope),
            Err(PiiError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn shaped_record_without_clearance_has_no_pii_key() {
        let decryptor = AesGcmDecryptor::new(TEST_KEY);
        let shaped =
            shape_record(record(Some(seal("Asha"))), &decryptor, false).expect("shaping succeeds");
        assert!(shaped.pii.is_none());
        assert!(shaped.pii_enc.first_name.is_some());

        let json = serde_json::to_value(&shaped).expect("serializes");
        assert!(json.get("pii").is_none());
        assert!(json.get("pii_enc").is_some());
    }

    #[test]
    fn shaped_record_with_clearance_decrypts_and_keeps_envelopes() {
        let decryptor = AesGcmDecryptor::new(TEST_KEY);
        let shaped =
            shape_record(record(Some(seal("Asha"))), &decryptor, true).expect("shaping succeeds");
        let pii = shaped.pii.expect("pii should be present");
        assert_eq!(pii.first_name.as_deref(), Some("Asha"));
        assert_eq!(pii.last_name, None);
        assert!(shaped.pii_enc.first_name.is_some());
    }

    #[test]
    fn null_envelope_shapes_to_null_plaintext() {
        let decryptor = AesGcmDecryptor::new(TEST_KEY);
        let shaped = shape_record(record(None), &decryptor, true).expect("shaping succeeds");
        assert_eq!(shaped.pii.expect("pii present").first_name, None);
    }

    #[test]
    fn decrypt_failure_aborts_shaping() {
        let decryptor = AesGcmDecryptor::new([9u8; 32]);
        let err = shape_record(record(Some(seal("Asha"))), &decryptor, true)
            .expect_err("shaping must fail");
        assert_eq!(err, PiiError::DecryptFailed);
    }

    #[test]
    fn list_shaping_applies_the_same_gate_per_record() {
        let decryptor = AesGcmDecryptor::new(TEST_KEY);
        let records = vec![record(Some(seal("Asha"))), record(None)];
        let shaped = shape_list(records, &decryptor, false).expect("shaping succeeds");
        assert_eq!(shaped.len(), 2);
        assert!(shaped.iter().all(|s| s.pii.is_none()));
    }
}
