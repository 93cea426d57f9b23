use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use super::codec::buffer;

/// A Curve25519 key pair as stored in the primary credential bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "buffer")]
    pub public: Vec<u8>,
    #[serde(with = "buffer")]
    pub private: Vec<u8>,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Self {
            public: public.as_bytes().to_vec(),
            private: secret.to_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedKeyPair {
    pub key_pair: KeyPair,
    /// Empty until the engine signs the pre-key during registration.
    #[serde(with = "buffer", default)]
    pub signature: Vec<u8>,
    pub key_id: u32,
}

/// The account this device is linked to, known once pairing completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Primary credential bundle, persisted under the `creds` key.
///
/// Fields the session host understands are typed; anything else the
/// protocol engine keeps in the bundle rides along in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub noise_key: KeyPair,
    pub pairing_ephemeral_key_pair: KeyPair,
    pub signed_identity_key: KeyPair,
    pub signed_pre_key: SignedKeyPair,
    pub registration_id: u16,
    #[serde(with = "buffer")]
    pub adv_secret_key: Vec<u8>,
    #[serde(default)]
    pub me: Option<Contact>,
    pub next_pre_key_id: u32,
    pub first_unuploaded_pre_key_id: u32,
    #[serde(default)]
    pub account_sync_counter: u32,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub pairing_code: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Credentials {
    /// Fresh bundle for a device that has never been paired.
    pub fn init() -> Self {
        let mut adv_secret_key = vec![0u8; 32];
        rand::rng().fill_bytes(&mut adv_secret_key);

        Self {
            noise_key: KeyPair::generate(),
            pairing_ephemeral_key_pair: KeyPair::generate(),
            signed_identity_key: KeyPair::generate(),
            signed_pre_key: SignedKeyPair {
                key_pair: KeyPair::generate(),
                signature: Vec::new(),
                key_id: 1,
            },
            registration_id: rand::random::<u16>() & 16383,
            adv_secret_key,
            me: None,
            next_pre_key_id: 1,
            first_unuploaded_pre_key_id: 1,
            account_sync_counter: 0,
            registered: false,
            platform: None,
            pairing_code: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Whether a phone has been linked to these credentials.
    pub fn is_paired(&self) -> bool {
        self.me.is_some()
    }
}
