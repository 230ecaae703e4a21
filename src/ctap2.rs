use std::time::Duration;

use ciborium::Value;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cbor;
use crate::credential::{CredentialStore, StoreError, CREDENTIAL_ID_LEN};
use crate::hid::{RequestHandler, PAYLOAD_MAX};
use crate::presence::{PresenceDecision, PresenceOracle};

// CTAP2 command codes
const CTAP2_MAKE_CREDENTIAL: u8 = 0x01;
const CTAP2_GET_ASSERTION: u8 = 0x02;
const CTAP2_GET_INFO: u8 = 0x04;
const CTAP2_RESET: u8 = 0x07;

// authenticatorData flags
const FLAG_UP: u8 = 0x01;
const FLAG_AT: u8 = 0x40;

const FIDO2_VERSION: &str = "FIDO_2_0";
const U2F_VERSION: &str = "U2F_V2";

/// Largest CTAP2 message advertised in GetInfo.
pub const MAX_MSG_SIZE: u32 = 1200;

/// Budget for the user-presence gesture.
pub const USER_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// CTAP2 status codes as the host observes them. Responses carry one
/// status byte, followed by a CBOR payload only on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CtapStatus {
    Ok = 0x00,
    InvalidCommand = 0x01,
    CborUnexpectedType = 0x11,
    InvalidCbor = 0x12,
    MissingParameter = 0x14,
    CredentialExcluded = 0x19,
    Processing = 0x21,
    InvalidCredential = 0x22,
    UnsupportedAlgorithm = 0x26,
    OperationDenied = 0x27,
    KeyStoreFull = 0x28,
    NoCredentials = 0x2E,
    UserActionTimeout = 0x2F,
    RequestTooLarge = 0x39,
}

impl From<StoreError> for CtapStatus {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NoFreeSlot => CtapStatus::KeyStoreFull,
            StoreError::UnknownCredential => CtapStatus::NoCredentials,
            StoreError::InvalidCredential => CtapStatus::InvalidCredential,
        }
    }
}

/// Summary of the GetInfo surface for embedding UIs and host tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatorInfo {
    pub versions: Vec<String>,
    pub extensions: Vec<String>,
    pub aaguid: String,
    pub options: AuthenticatorOptions,
    pub max_msg_size: u32,
    pub pin_protocols: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatorOptions {
    pub rk: bool,
    pub up: bool,
    pub plat: bool,
}

/// The CTAP2 command engine. Owns the credential store and the
/// user-presence oracle; the transport borrows it per dispatched frame.
pub struct CtapEngine {
    store: CredentialStore,
    presence: Box<dyn PresenceOracle>,
}

impl CtapEngine {
    pub fn new(store: CredentialStore, presence: Box<dyn PresenceOracle>) -> Self {
        log::info!("CTAP2 engine initialized");
        CtapEngine { store, presence }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut CredentialStore {
        &mut self.store
    }

    pub fn into_store(self) -> CredentialStore {
        self.store
    }

    pub fn aaguid(&self) -> [u8; 16] {
        self.store.aaguid()
    }

    pub fn info(&self) -> AuthenticatorInfo {
        AuthenticatorInfo {
            versions: vec![FIDO2_VERSION.to_string(), U2F_VERSION.to_string()],
            extensions: vec![],
            aaguid: hex::encode(self.store.aaguid()),
            options: AuthenticatorOptions {
                rk: false,
                up: true,
                plat: false,
            },
            max_msg_size: MAX_MSG_SIZE,
            pin_protocols: vec![],
        }
    }

    /// Process one CTAP2 request: a command byte and a CBOR payload.
    /// Always produces exactly one response.
    pub fn handle_request(&mut self, request: &[u8]) -> Vec<u8> {
        let Some((&cmd, payload)) = request.split_first() else {
            return vec![CtapStatus::InvalidCbor as u8];
        };
        log::debug!("CTAP2 command 0x{:02X}, {} payload bytes", cmd, payload.len());

        let result = match cmd {
            CTAP2_MAKE_CREDENTIAL => self.make_credential(payload),
            CTAP2_GET_ASSERTION => self.get_assertion(payload),
            CTAP2_GET_INFO => self.get_info(),
            CTAP2_RESET => self.reset(),
            _ => {
                log::warn!("Unsupported CTAP2 command: 0x{:02X}", cmd);
                Err(CtapStatus::InvalidCommand)
            }
        };

        match result {
            Ok(payload) => {
                if 1 + payload.len() > PAYLOAD_MAX {
                    log::error!("Response of {} bytes exceeds transport limit", payload.len());
                    return vec![CtapStatus::RequestTooLarge as u8];
                }
                let mut response = Vec::with_capacity(1 + payload.len());
                response.push(CtapStatus::Ok as u8);
                response.extend_from_slice(&payload);
                response
            }
            Err(status) => {
                log::debug!("CTAP2 command 0x{:02X} failed: 0x{:02X}", cmd, status as u8);
                vec![status as u8]
            }
        }
    }

    fn get_info(&mut self) -> Result<Vec<u8>, CtapStatus> {
        log::debug!("Processing GetInfo");
        let options = Value::Map(vec![
            (cbor::text("rk"), Value::Bool(false)),
            (cbor::text("up"), Value::Bool(true)),
            (cbor::text("plat"), Value::Bool(false)),
        ]);
        let map = Value::Map(vec![
            (
                cbor::int(0x01),
                Value::Array(vec![cbor::text(FIDO2_VERSION), cbor::text(U2F_VERSION)]),
            ),
            (cbor::int(0x02), Value::Array(vec![])),
            (cbor::int(0x03), cbor::bytes(&self.store.aaguid())),
            (cbor::int(0x04), options),
            (cbor::int(0x05), cbor::int(MAX_MSG_SIZE as i64)),
            (cbor::int(0x06), Value::Array(vec![])),
        ]);
        cbor::encode(&map).map_err(|_| CtapStatus::Processing)
    }

    fn make_credential(&mut self, payload: &[u8]) -> Result<Vec<u8>, CtapStatus> {
        log::debug!("Processing MakeCredential");
        let request = cbor::decode(payload).map_err(|_| CtapStatus::InvalidCbor)?;
        let map = cbor::as_map(&request).ok_or(CtapStatus::InvalidCbor)?;

        let client_data_hash = required_hash(map, 0x01)?;

        let rp = cbor::map_get_int(map, 0x02).ok_or(CtapStatus::MissingParameter)?;
        let rp_map = cbor::as_map(rp).ok_or(CtapStatus::CborUnexpectedType)?;
        let rp_id = match cbor::map_get_text(rp_map, "id") {
            Some(v) => cbor::as_text(v).ok_or(CtapStatus::CborUnexpectedType)?,
            None => return Err(CtapStatus::MissingParameter),
        };
        if rp_id.is_empty() {
            return Err(CtapStatus::MissingParameter);
        }

        let user = cbor::map_get_int(map, 0x03).ok_or(CtapStatus::MissingParameter)?;
        let user_map = cbor::as_map(user).ok_or(CtapStatus::CborUnexpectedType)?;
        let user_id = match cbor::map_get_text(user_map, "id") {
            Some(v) => cbor::as_bytes(v).ok_or(CtapStatus::CborUnexpectedType)?,
            None => return Err(CtapStatus::MissingParameter),
        };
        if user_id.is_empty() {
            return Err(CtapStatus::MissingParameter);
        }
        let user_name = cbor::map_get_text(user_map, "name")
            .and_then(cbor::as_text)
            .unwrap_or("");
        let user_display_name = cbor::map_get_text(user_map, "displayName")
            .and_then(cbor::as_text)
            .unwrap_or("");

        // pubKeyCredParams (0x04) is accepted without negotiation: only
        // ES256 is produced.

        if let Some(exclude) = cbor::map_get_int(map, 0x05) {
            let list = cbor::as_array(exclude).ok_or(CtapStatus::CborUnexpectedType)?;
            for descriptor in list {
                let Some(desc_map) = cbor::as_map(descriptor) else {
                    continue;
                };
                let Some(id) = cbor::map_get_text(desc_map, "id").and_then(cbor::as_bytes) else {
                    continue;
                };
                if self.store.find_by_id(id).is_some() {
                    log::warn!("MakeCredential: credential excluded for RP {}", rp_id);
                    return Err(CtapStatus::CredentialExcluded);
                }
            }
        }

        // options (0x07): rk/uv are recorded but not enforced
        let mut rk_requested = false;
        let mut uv_requested = false;
        if let Some(options) = cbor::map_get_int(map, 0x07) {
            if let Some(entries) = cbor::as_map(options) {
                rk_requested = cbor::map_get_text(entries, "rk")
                    .and_then(cbor::as_bool)
                    .unwrap_or(false);
                uv_requested = cbor::map_get_text(entries, "uv")
                    .and_then(cbor::as_bool)
                    .unwrap_or(false);
            }
        }
        log::debug!(
            "MakeCredential: rp={} rk={} uv={}",
            rp_id,
            rk_requested,
            uv_requested
        );

        self.require_user_presence()?;

        let credential = self
            .store
            .create(rp_id, user_id, user_name, user_display_name)?;
        let credential_id = credential.credential_id;
        let public_key_x = credential.public_key_x;
        let public_key_y = credential.public_key_y;
        let sign_count = credential.sign_count;

        let auth_data = attested_authenticator_data(
            rp_id,
            sign_count,
            &self.store.aaguid(),
            &credential_id,
            &public_key_x,
            &public_key_y,
        )?;
        let mut message = auth_data.clone();
        message.extend_from_slice(client_data_hash);
        let signature = self.store.sign(&credential_id, &message)?;

        let response = Value::Map(vec![
            (cbor::int(0x01), cbor::text("packed")),
            (cbor::int(0x02), cbor::bytes(&auth_data)),
            (
                cbor::int(0x03),
                Value::Map(vec![(cbor::text("sig"), cbor::bytes(&signature))]),
            ),
        ]);
        log::info!("MakeCredential OK for RP {}", rp_id);
        cbor::encode(&response).map_err(|_| CtapStatus::Processing)
    }

    fn get_assertion(&mut self, payload: &[u8]) -> Result<Vec<u8>, CtapStatus> {
        log::debug!("Processing GetAssertion");
        let request = cbor::decode(payload).map_err(|_| CtapStatus::InvalidCbor)?;
        let map = cbor::as_map(&request).ok_or(CtapStatus::InvalidCbor)?;

        let rp_id = match cbor::map_get_int(map, 0x01) {
            Some(v) => cbor::as_text(v).ok_or(CtapStatus::CborUnexpectedType)?,
            None => return Err(CtapStatus::MissingParameter),
        };
        let client_data_hash = required_hash(map, 0x02)?;

        // allowList: only a 32-byte id matching a stored credential counts
        let mut allowed_id: Option<[u8; CREDENTIAL_ID_LEN]> = None;
        if let Some(allow) = cbor::map_get_int(map, 0x03) {
            let list = cbor::as_array(allow).ok_or(CtapStatus::CborUnexpectedType)?;
            for descriptor in list {
                let Some(desc_map) = cbor::as_map(descriptor) else {
                    continue;
                };
                let Some(id) = cbor::map_get_text(desc_map, "id").and_then(cbor::as_bytes) else {
                    continue;
                };
                if self.store.find_by_id(id).is_some() {
                    if let Ok(id) = id.try_into() {
                        allowed_id = Some(id);
                        break;
                    }
                }
            }
        }

        let credential_id: [u8; CREDENTIAL_ID_LEN] = match allowed_id {
            Some(id) => id,
            None => self
                .store
                .find_by_rp(rp_id)
                .map(|c| c.credential_id)
                .ok_or(CtapStatus::NoCredentials)?,
        };

        let mut up_requested = true;
        if let Some(options) = cbor::map_get_int(map, 0x05) {
            if let Some(entries) = cbor::as_map(options) {
                up_requested = cbor::map_get_text(entries, "up")
                    .and_then(cbor::as_bool)
                    .unwrap_or(true);
            }
        }
        if up_requested {
            self.require_user_presence()?;
        }

        let sign_count = self.store.advance_sign_count(&credential_id)?;
        let auth_data = assertion_authenticator_data(rp_id, sign_count);
        let mut message = auth_data.clone();
        message.extend_from_slice(client_data_hash);
        let signature = self.store.sign(&credential_id, &message)?;

        let response = Value::Map(vec![
            (
                cbor::int(0x01),
                Value::Map(vec![
                    (cbor::text("id"), cbor::bytes(&credential_id)),
                    (cbor::text("type"), cbor::text("public-key")),
                ]),
            ),
            (cbor::int(0x02), cbor::bytes(&auth_data)),
            (cbor::int(0x03), cbor::bytes(&signature)),
        ]);
        log::info!("GetAssertion OK for RP {} (count {})", rp_id, sign_count);
        cbor::encode(&response).map_err(|_| CtapStatus::Processing)
    }

    fn reset(&mut self) -> Result<Vec<u8>, CtapStatus> {
        self.store.reset();
        log::info!("Authenticator reset");
        Ok(Vec::new())
    }

    fn require_user_presence(&mut self) -> Result<(), CtapStatus> {
        match self.presence.request_presence(USER_PRESENCE_TIMEOUT) {
            PresenceDecision::Allowed => Ok(()),
            PresenceDecision::Denied => {
                log::warn!("User presence denied");
                Err(CtapStatus::OperationDenied)
            }
            PresenceDecision::TimedOut => {
                log::warn!("User presence timed out");
                Err(CtapStatus::UserActionTimeout)
            }
        }
    }
}

impl RequestHandler for CtapEngine {
    fn handle_cbor(&mut self, request: &[u8]) -> Vec<u8> {
        self.handle_request(request)
    }
}

/// Required 32-byte hash field, e.g. clientDataHash.
fn required_hash<'a>(
    map: &'a [(Value, Value)],
    key: i64,
) -> Result<&'a [u8], CtapStatus> {
    let value = cbor::map_get_int(map, key).ok_or(CtapStatus::MissingParameter)?;
    let hash = cbor::as_bytes(value).ok_or(CtapStatus::CborUnexpectedType)?;
    if hash.len() != 32 {
        return Err(CtapStatus::CborUnexpectedType);
    }
    Ok(hash)
}

fn rp_id_hash(rp_id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(rp_id.as_bytes());
    hasher.finalize().into()
}

/// 37-byte authenticator data for assertions:
/// `SHA-256(rpId) || flags || sign_count_be32`.
fn assertion_authenticator_data(rp_id: &str, sign_count: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(37);
    data.extend_from_slice(&rp_id_hash(rp_id));
    data.push(FLAG_UP);
    data.extend_from_slice(&sign_count.to_be_bytes());
    data
}

/// Authenticator data with attested credential data:
/// `SHA-256(rpId) || flags || sign_count_be32 || AAGUID ||
/// cred_id_len_be16 || credential_id || COSE key`.
fn attested_authenticator_data(
    rp_id: &str,
    sign_count: u32,
    aaguid: &[u8; 16],
    credential_id: &[u8; CREDENTIAL_ID_LEN],
    public_key_x: &[u8; 32],
    public_key_y: &[u8; 32],
) -> Result<Vec<u8>, CtapStatus> {
    let cose_key = Value::Map(vec![
        (cbor::int(1), cbor::int(2)),   // kty: EC2
        (cbor::int(3), cbor::int(-7)),  // alg: ES256
        (cbor::int(-1), cbor::int(1)),  // crv: P-256
        (cbor::int(-2), cbor::bytes(public_key_x)),
        (cbor::int(-3), cbor::bytes(public_key_y)),
    ]);

    let mut data = Vec::with_capacity(196);
    data.extend_from_slice(&rp_id_hash(rp_id));
    data.push(FLAG_UP | FLAG_AT);
    data.extend_from_slice(&sign_count.to_be_bytes());
    data.extend_from_slice(aaguid);
    data.extend_from_slice(&(CREDENTIAL_ID_LEN as u16).to_be_bytes());
    data.extend_from_slice(credential_id);
    data.extend_from_slice(&cbor::encode(&cose_key).map_err(|_| CtapStatus::Processing)?);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{AutoApprove, AutoDeny};
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{Signature, VerifyingKey};

    struct NeverResolves;

    impl PresenceOracle for NeverResolves {
        fn request_presence(&mut self, _timeout: Duration) -> PresenceDecision {
            PresenceDecision::TimedOut
        }
    }

    fn engine() -> CtapEngine {
        CtapEngine::new(CredentialStore::new(), Box::new(AutoApprove))
    }

    fn make_credential_request(rp_id: &str) -> Vec<u8> {
        let map = Value::Map(vec![
            (cbor::int(0x01), cbor::bytes(&[0u8; 32])),
            (
                cbor::int(0x02),
                Value::Map(vec![(cbor::text("id"), cbor::text(rp_id))]),
            ),
            (
                cbor::int(0x03),
                Value::Map(vec![
                    (cbor::text("id"), cbor::bytes(&[0x01, 0x02])),
                    (cbor::text("name"), cbor::text("u")),
                    (cbor::text("displayName"), cbor::text("U")),
                ]),
            ),
            (
                cbor::int(0x04),
                Value::Array(vec![Value::Map(vec![
                    (cbor::text("alg"), cbor::int(-7)),
                    (cbor::text("type"), cbor::text("public-key")),
                ])]),
            ),
        ]);
        let mut request = vec![CTAP2_MAKE_CREDENTIAL];
        request.extend_from_slice(&cbor::encode(&map).unwrap());
        request
    }

    fn get_assertion_request(rp_id: &str) -> Vec<u8> {
        let map = Value::Map(vec![
            (cbor::int(0x01), cbor::text(rp_id)),
            (cbor::int(0x02), cbor::bytes(&[0u8; 32])),
        ]);
        let mut request = vec![CTAP2_GET_ASSERTION];
        request.extend_from_slice(&cbor::encode(&map).unwrap());
        request
    }

    fn response_map(response: &[u8]) -> Vec<(Value, Value)> {
        assert_eq!(response[0], CtapStatus::Ok as u8);
        match cbor::decode(&response[1..]).unwrap() {
            Value::Map(m) => m,
            other => panic!("expected map, got {:?}", other),
        }
    }

    fn verify_signature(x: &[u8], y: &[u8], message: &[u8], der: &[u8]) {
        let mut sec1 = vec![0x04];
        sec1.extend_from_slice(x);
        sec1.extend_from_slice(y);
        let key = VerifyingKey::from_sec1_bytes(&sec1).unwrap();
        let signature = Signature::from_der(der).unwrap();
        key.verify(message, &signature).unwrap();
    }

    #[test]
    fn test_get_info_canonical_prefix() {
        let mut engine = engine();
        let response = engine.handle_request(&[CTAP2_GET_INFO]);
        assert_eq!(response[0], 0x00);
        // map(6), key 1, array(2), text(8) "FIDO_2_0"
        assert_eq!(
            &response[1..6],
            &[0xA6, 0x01, 0x82, 0x68, b'F'][..]
        );
        assert_eq!(&response[5..13], &b"FIDO_2_0"[..]);

        let map = response_map(&response);
        assert_eq!(map.len(), 6);
        let aaguid = cbor::map_get_int(&map, 0x03).and_then(cbor::as_bytes).unwrap();
        assert_eq!(aaguid, &engine.aaguid()[..]);
        let options = cbor::map_get_int(&map, 0x04).and_then(cbor::as_map).unwrap();
        assert_eq!(cbor::map_get_text(options, "rk").and_then(cbor::as_bool), Some(false));
        assert_eq!(cbor::map_get_text(options, "up").and_then(cbor::as_bool), Some(true));
        assert_eq!(cbor::map_get_text(options, "plat").and_then(cbor::as_bool), Some(false));
        assert_eq!(
            cbor::map_get_int(&map, 0x05).and_then(cbor::as_u64),
            Some(MAX_MSG_SIZE as u64)
        );
    }

    #[test]
    fn test_make_credential_happy_path() {
        let mut engine = engine();
        let response = engine.handle_request(&make_credential_request("example.com"));
        let map = response_map(&response);

        assert_eq!(
            cbor::map_get_int(&map, 0x01).and_then(cbor::as_text),
            Some("packed")
        );

        let auth_data = cbor::map_get_int(&map, 0x02).and_then(cbor::as_bytes).unwrap();
        assert_eq!(&auth_data[..32], &rp_id_hash("example.com")[..]);
        assert_eq!(auth_data[32], FLAG_UP | FLAG_AT); // 0x41
        assert_eq!(&auth_data[33..37], &[0, 0, 0, 0][..]);
        assert_eq!(&auth_data[37..53], &engine.aaguid()[..]);
        assert_eq!(&auth_data[53..55], &[0x00, 0x20][..]);

        let credential_id = &auth_data[55..87];
        let stored = engine.store().find_by_id(credential_id).unwrap();
        assert_eq!(stored.rp_id, "example.com");
        assert_eq!(stored.user_id, vec![0x01, 0x02]);
        assert_eq!(stored.user_name, "u");
        assert_eq!(stored.user_display_name, "U");

        // COSE key: {1: 2, 3: -7, -1: 1, -2: x, -3: y}
        let cose = cbor::decode(&auth_data[87..]).unwrap();
        let cose = cbor::as_map(&cose).unwrap();
        assert_eq!(cbor::map_get_int(cose, 1).and_then(cbor::as_i64), Some(2));
        assert_eq!(cbor::map_get_int(cose, 3).and_then(cbor::as_i64), Some(-7));
        assert_eq!(cbor::map_get_int(cose, -1).and_then(cbor::as_i64), Some(1));
        let x = cbor::map_get_int(cose, -2).and_then(cbor::as_bytes).unwrap();
        let y = cbor::map_get_int(cose, -3).and_then(cbor::as_bytes).unwrap();
        assert_eq!(x, &stored.public_key_x[..]);
        assert_eq!(y, &stored.public_key_y[..]);

        // self-attestation signature over authData || clientDataHash
        let att_stmt = cbor::map_get_int(&map, 0x03).and_then(cbor::as_map).unwrap();
        let sig = cbor::map_get_text(att_stmt, "sig").and_then(cbor::as_bytes).unwrap();
        let mut message = auth_data.to_vec();
        message.extend_from_slice(&[0u8; 32]);
        verify_signature(x, y, &message, sig);

        // the self-attestation signature leaves the counter at zero
        assert_eq!(stored.sign_count, 0);
    }

    #[test]
    fn test_make_credential_missing_parameters() {
        let mut engine = engine();

        // no clientDataHash
        let map = Value::Map(vec![(
            cbor::int(0x02),
            Value::Map(vec![(cbor::text("id"), cbor::text("example.com"))]),
        )]);
        let mut request = vec![CTAP2_MAKE_CREDENTIAL];
        request.extend_from_slice(&cbor::encode(&map).unwrap());
        assert_eq!(
            engine.handle_request(&request),
            vec![CtapStatus::MissingParameter as u8]
        );

        // clientDataHash of the wrong width
        let map = Value::Map(vec![
            (cbor::int(0x01), cbor::bytes(&[0u8; 16])),
            (
                cbor::int(0x02),
                Value::Map(vec![(cbor::text("id"), cbor::text("example.com"))]),
            ),
            (
                cbor::int(0x03),
                Value::Map(vec![(cbor::text("id"), cbor::bytes(&[1]))]),
            ),
        ]);
        let mut request = vec![CTAP2_MAKE_CREDENTIAL];
        request.extend_from_slice(&cbor::encode(&map).unwrap());
        assert_eq!(
            engine.handle_request(&request),
            vec![CtapStatus::CborUnexpectedType as u8]
        );
    }

    #[test]
    fn test_make_credential_invalid_cbor() {
        let mut engine = engine();
        let response = engine.handle_request(&[CTAP2_MAKE_CREDENTIAL, 0xFF, 0xFF]);
        assert_eq!(response, vec![CtapStatus::InvalidCbor as u8]);
    }

    #[test]
    fn test_make_credential_exclude_list() {
        let mut engine = engine();
        let response = engine.handle_request(&make_credential_request("example.com"));
        let map = response_map(&response);
        let auth_data = cbor::map_get_int(&map, 0x02).and_then(cbor::as_bytes).unwrap();
        let credential_id = auth_data[55..87].to_vec();

        let map = Value::Map(vec![
            (cbor::int(0x01), cbor::bytes(&[0u8; 32])),
            (
                cbor::int(0x02),
                Value::Map(vec![(cbor::text("id"), cbor::text("example.com"))]),
            ),
            (
                cbor::int(0x03),
                Value::Map(vec![(cbor::text("id"), cbor::bytes(&[7]))]),
            ),
            (
                cbor::int(0x05),
                Value::Array(vec![Value::Map(vec![
                    (cbor::text("id"), cbor::bytes(&credential_id)),
                    (cbor::text("type"), cbor::text("public-key")),
                ])]),
            ),
        ]);
        let mut request = vec![CTAP2_MAKE_CREDENTIAL];
        request.extend_from_slice(&cbor::encode(&map).unwrap());
        assert_eq!(
            engine.handle_request(&request),
            vec![CtapStatus::CredentialExcluded as u8]
        );
    }

    #[test]
    fn test_presence_denied_and_timeout() {
        let mut denied = CtapEngine::new(CredentialStore::new(), Box::new(AutoDeny));
        assert_eq!(
            denied.handle_request(&make_credential_request("example.com")),
            vec![CtapStatus::OperationDenied as u8]
        );

        let mut stuck = CtapEngine::new(CredentialStore::new(), Box::new(NeverResolves));
        assert_eq!(
            stuck.handle_request(&make_credential_request("example.com")),
            vec![CtapStatus::UserActionTimeout as u8]
        );
    }

    #[test]
    fn test_key_store_full() {
        let mut engine = engine();
        for i in 0..crate::credential::MAX_CREDENTIALS {
            let response = engine.handle_request(&make_credential_request(&format!("rp{}.com", i)));
            assert_eq!(response[0], CtapStatus::Ok as u8);
        }
        assert_eq!(
            engine.handle_request(&make_credential_request("overflow.com")),
            vec![CtapStatus::KeyStoreFull as u8]
        );
    }

    #[test]
    fn test_get_assertion_after_make_credential() {
        let mut engine = engine();
        let response = engine.handle_request(&make_credential_request("example.com"));
        let map = response_map(&response);
        let auth_data = cbor::map_get_int(&map, 0x02).and_then(cbor::as_bytes).unwrap();
        let credential_id = auth_data[55..87].to_vec();
        let cose = cbor::decode(&auth_data[87..]).unwrap();
        let cose = cbor::as_map(&cose).unwrap();
        let x = cbor::map_get_int(cose, -2).and_then(cbor::as_bytes).unwrap().to_vec();
        let y = cbor::map_get_int(cose, -3).and_then(cbor::as_bytes).unwrap().to_vec();

        let response = engine.handle_request(&get_assertion_request("example.com"));
        let map = response_map(&response);

        let descriptor = cbor::map_get_int(&map, 0x01).and_then(cbor::as_map).unwrap();
        assert_eq!(
            cbor::map_get_text(descriptor, "id").and_then(cbor::as_bytes),
            Some(credential_id.as_slice())
        );
        assert_eq!(
            cbor::map_get_text(descriptor, "type").and_then(cbor::as_text),
            Some("public-key")
        );

        let auth_data = cbor::map_get_int(&map, 0x02).and_then(cbor::as_bytes).unwrap();
        assert_eq!(auth_data.len(), 37);
        assert_eq!(&auth_data[..32], &rp_id_hash("example.com")[..]);
        assert_eq!(auth_data[32], FLAG_UP);
        assert_eq!(&auth_data[33..37], &[0, 0, 0, 1][..]);

        let sig = cbor::map_get_int(&map, 0x03).and_then(cbor::as_bytes).unwrap();
        let mut message = auth_data.to_vec();
        message.extend_from_slice(&[0u8; 32]);
        verify_signature(&x, &y, &message, sig);
    }

    #[test]
    fn test_sign_count_strictly_increases() {
        let mut engine = engine();
        engine.handle_request(&make_credential_request("example.com"));

        let mut last = 0u32;
        for _ in 0..5 {
            let response = engine.handle_request(&get_assertion_request("example.com"));
            let map = response_map(&response);
            let auth_data = cbor::map_get_int(&map, 0x02).and_then(cbor::as_bytes).unwrap();
            let count = u32::from_be_bytes(auth_data[33..37].try_into().unwrap());
            assert!(count > last);
            last = count;
        }
        assert_eq!(
            engine
                .store()
                .find_by_rp("example.com")
                .unwrap()
                .sign_count,
            last
        );
    }

    #[test]
    fn test_get_assertion_allow_list_selects_credential() {
        let mut engine = engine();
        engine.handle_request(&make_credential_request("example.com"));
        let response = engine.handle_request(&make_credential_request("example.com"));
        let map = response_map(&response);
        let auth_data = cbor::map_get_int(&map, 0x02).and_then(cbor::as_bytes).unwrap();
        let second_id = auth_data[55..87].to_vec();

        let map = Value::Map(vec![
            (cbor::int(0x01), cbor::text("example.com")),
            (cbor::int(0x02), cbor::bytes(&[0u8; 32])),
            (
                cbor::int(0x03),
                Value::Array(vec![Value::Map(vec![
                    (cbor::text("id"), cbor::bytes(&second_id)),
                    (cbor::text("type"), cbor::text("public-key")),
                ])]),
            ),
        ]);
        let mut request = vec![CTAP2_GET_ASSERTION];
        request.extend_from_slice(&cbor::encode(&map).unwrap());
        let response = engine.handle_request(&request);
        let map = response_map(&response);
        let descriptor = cbor::map_get_int(&map, 0x01).and_then(cbor::as_map).unwrap();
        assert_eq!(
            cbor::map_get_text(descriptor, "id").and_then(cbor::as_bytes),
            Some(second_id.as_slice())
        );
    }

    #[test]
    fn test_get_assertion_no_credentials() {
        let mut engine = engine();
        assert_eq!(
            engine.handle_request(&get_assertion_request("example.com")),
            vec![CtapStatus::NoCredentials as u8]
        );
    }

    #[test]
    fn test_get_assertion_up_false_skips_gate() {
        let mut engine = CtapEngine::new(CredentialStore::new(), Box::new(AutoApprove));
        engine.handle_request(&make_credential_request("example.com"));

        // swap in a denying oracle; up=false must still succeed
        engine.presence = Box::new(AutoDeny);
        let map = Value::Map(vec![
            (cbor::int(0x01), cbor::text("example.com")),
            (cbor::int(0x02), cbor::bytes(&[0u8; 32])),
            (
                cbor::int(0x05),
                Value::Map(vec![(cbor::text("up"), Value::Bool(false))]),
            ),
        ]);
        let mut request = vec![CTAP2_GET_ASSERTION];
        request.extend_from_slice(&cbor::encode(&map).unwrap());
        let response = engine.handle_request(&request);
        assert_eq!(response[0], CtapStatus::Ok as u8);

        // and the default (up absent) hits the gate
        let response = engine.handle_request(&get_assertion_request("example.com"));
        assert_eq!(response, vec![CtapStatus::OperationDenied as u8]);
    }

    #[test]
    fn test_reset_clears_store() {
        let mut engine = engine();
        engine.handle_request(&make_credential_request("example.com"));
        assert_eq!(engine.store().count(), 1);

        let response = engine.handle_request(&[CTAP2_RESET]);
        assert_eq!(response, vec![CtapStatus::Ok as u8]);
        assert_eq!(engine.store().count(), 0);

        assert_eq!(
            engine.handle_request(&get_assertion_request("example.com")),
            vec![CtapStatus::NoCredentials as u8]
        );
    }

    #[test]
    fn test_unknown_command_and_empty_request() {
        let mut engine = engine();
        assert_eq!(
            engine.handle_request(&[0x42]),
            vec![CtapStatus::InvalidCommand as u8]
        );
        assert_eq!(engine.handle_request(&[]), vec![CtapStatus::InvalidCbor as u8]);
    }

    #[test]
    fn test_info_serialization() {
        let engine = engine();
        let info = engine.info();
        assert_eq!(info.versions, vec!["FIDO_2_0", "U2F_V2"]);
        assert!(!info.options.rk);
        assert!(info.options.up);

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("FIDO_2_0"));
        assert!(json.contains(&info.aaguid));
    }
}
