//! The credential bundle and its bootstrap.
//!
//! A bundle is created once per auth-state directory, then loaded on every
//! start and mutated in place. It is always persisted whole.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::codec::b64;
use crate::crypto::{signal_pub_key, KeyPair, KeyPrimitives, SignedKeyPair};
use crate::error::Result;

pub const ADV_SECRET_LEN: usize = 32;
pub const IDENTITY_ID_LEN: usize = 20;
pub const BACKUP_TOKEN_LEN: usize = 20;
pub const INITIAL_PRE_KEY_ID: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_jid: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedHistoryMessage {
    pub key: MessageKey,
    pub message_timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSettings {
    /// Unarchive chats when a new message arrives.
    pub unarchive_chats: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCreds {
    pub noise_key: KeyPair,
    pub pairing_ephemeral_key_pair: KeyPair,
    pub signed_identity_key: KeyPair,
    pub signed_pre_key: SignedKeyPair,
    pub registration_id: u16,
    pub adv_secret_key: String,
    #[serde(default)]
    pub processed_history_messages: Vec<ProcessedHistoryMessage>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
    #[serde(default)]
    pub account_sync_counter: u32,
    #[serde(default)]
    pub account_settings: AccountSettings,
    pub device_id: String,
    pub phone_id: String,
    #[serde(with = "b64")]
    pub identity_id: Vec<u8>,
    #[serde(default)]
    pub registered: bool,
    #[serde(with = "b64")]
    pub backup_token: Vec<u8>,
    #[serde(default)]
    pub registration: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
}

impl AuthCreds {
    /// Check that the signed pre-key was signed by this bundle's identity key.
    pub fn verify_signed_pre_key(&self, primitives: &dyn KeyPrimitives) -> Result<()> {
        primitives.verify(
            &self.signed_identity_key.public,
            &signal_pub_key(&self.signed_pre_key.key_pair.public),
            &self.signed_pre_key.signature,
        )
    }

    /// Reserve `count` pre-key ids, returning the first one.
    pub fn reserve_pre_key_ids(&mut self, count: u32) -> u32 {
        let first = self.next_pre_key_id;
        self.next_pre_key_id = self.next_pre_key_id.saturating_add(count);
        first
    }

    /// Record that every pre-key id below `next` has been uploaded.
    pub fn mark_pre_keys_uploaded(&mut self, next: u32) {
        self.first_unuploaded_pre_key_id = self.first_unuploaded_pre_key_id.max(next);
    }
}

/// Generate a pre-key and sign its type-prefixed public key with `identity`.
pub fn signed_key_pair(
    primitives: &dyn KeyPrimitives,
    identity: &KeyPair,
    key_id: u32,
) -> Result<SignedKeyPair> {
    let key_pair = primitives.generate_key_pair()?;
    let signature = primitives.sign(&identity.private, &signal_pub_key(&key_pair.public))?;
    Ok(SignedKeyPair {
        key_pair,
        signature,
        key_id,
    })
}

/// Build a brand-new credential bundle. Does not touch storage.
pub fn init_auth_creds(primitives: &dyn KeyPrimitives) -> Result<AuthCreds> {
    let identity = primitives.generate_key_pair()?;
    let signed_pre_key = signed_key_pair(primitives, &identity, INITIAL_PRE_KEY_ID)?;
    let device_uuid = primitives.uuid()?;

    Ok(AuthCreds {
        noise_key: primitives.generate_key_pair()?,
        pairing_ephemeral_key_pair: primitives.generate_key_pair()?,
        signed_identity_key: identity,
        signed_pre_key,
        registration_id: primitives.registration_id()?,
        adv_secret_key: general_purpose::STANDARD.encode(primitives.random_bytes(ADV_SECRET_LEN)?),
        processed_history_messages: vec![],
        next_pre_key_id: INITIAL_PRE_KEY_ID,
        first_unuploaded_pre_key_id: INITIAL_PRE_KEY_ID,
        account_sync_counter: 0,
        account_settings: AccountSettings {
            unarchive_chats: false,
        },
        device_id: general_purpose::URL_SAFE_NO_PAD.encode(device_uuid.as_bytes()),
        phone_id: primitives.uuid()?.to_string(),
        identity_id: primitives.random_bytes(IDENTITY_ID_LEN)?,
        registered: false,
        backup_token: primitives.random_bytes(BACKUP_TOKEN_LEN)?,
        registration: serde_json::Value::Null,
        pairing_code: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CurvePrimitives;
    use crate::error::StoreError;

    struct FailingRng;

    impl KeyPrimitives for FailingRng {
        fn generate_key_pair(&self) -> Result<KeyPair> {
            CurvePrimitives.generate_key_pair()
        }
        fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
            CurvePrimitives.sign(private_key, message)
        }
        fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
            CurvePrimitives.verify(public_key, message, signature)
        }
        fn random_bytes(&self, _len: usize) -> Result<Vec<u8>> {
            Err(StoreError::Crypto("entropy exhausted".into()))
        }
    }

    #[test]
    fn fresh_creds_have_initial_counters() {
        let creds = init_auth_creds(&CurvePrimitives).unwrap();
        assert!(!creds.registered);
        assert_eq!(creds.next_pre_key_id, 1);
        assert_eq!(creds.first_unuploaded_pre_key_id, 1);
        assert_eq!(creds.account_sync_counter, 0);
        assert_eq!(creds.signed_pre_key.key_id, 1);
        assert!(!creds.account_settings.unarchive_chats);
        assert!(creds.processed_history_messages.is_empty());
        assert!(creds.pairing_code.is_none());
        assert!(creds.registration_id <= 0x3FFF);
    }

    #[test]
    fn fresh_creds_field_shapes() {
        let creds = init_auth_creds(&CurvePrimitives).unwrap();
        assert_eq!(creds.identity_id.len(), IDENTITY_ID_LEN);
        assert_eq!(creds.backup_token.len(), BACKUP_TOKEN_LEN);
        let secret = general_purpose::STANDARD.decode(&creds.adv_secret_key).unwrap();
        assert_eq!(secret.len(), ADV_SECRET_LEN);
        let device = general_purpose::URL_SAFE_NO_PAD.decode(&creds.device_id).unwrap();
        assert_eq!(device.len(), 16);
        assert!(uuid::Uuid::parse_str(&creds.phone_id).is_ok());
        assert_ne!(creds.noise_key, creds.signed_identity_key);
        assert_ne!(creds.noise_key, creds.pairing_ephemeral_key_pair);
    }

    #[test]
    fn signed_pre_key_verifies_against_identity() {
        let creds = init_auth_creds(&CurvePrimitives).unwrap();
        creds.verify_signed_pre_key(&CurvePrimitives).unwrap();

        let mut forged = creds.clone();
        forged.signed_pre_key = signed_key_pair(&CurvePrimitives, &creds.noise_key, 1).unwrap();
        assert!(forged.verify_signed_pre_key(&CurvePrimitives).is_err());
    }

    #[test]
    fn primitive_failure_propagates() {
        let err = init_auth_creds(&FailingRng).unwrap_err();
        assert!(matches!(err, StoreError::Crypto(_)));
    }

    #[test]
    fn pre_key_counters_advance() {
        let mut creds = init_auth_creds(&CurvePrimitives).unwrap();
        assert_eq!(creds.reserve_pre_key_ids(30), 1);
        assert_eq!(creds.next_pre_key_id, 31);
        creds.mark_pre_keys_uploaded(31);
        creds.mark_pre_keys_uploaded(5);
        assert_eq!(creds.first_unuploaded_pre_key_id, 31);
    }

    #[test]
    fn json_uses_camel_case_names() {
        let creds = init_auth_creds(&CurvePrimitives).unwrap();
        let json = serde_json::to_value(&creds).unwrap();
        assert_eq!(json["nextPreKeyId"], 1);
        assert_eq!(json["registered"], false);
        assert_eq!(json["accountSettings"]["unarchiveChats"], false);
        assert_eq!(json["signedPreKey"]["keyId"], 1);
        assert!(json["signedIdentityKey"]["public"].is_string());
        assert!(json.get("pairingCode").is_none());
    }
}
