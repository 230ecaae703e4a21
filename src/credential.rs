use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;

/// Number of credential slots in the store.
pub const MAX_CREDENTIALS: usize = 10;

/// Credential identifiers are always 32 random bytes.
pub const CREDENTIAL_ID_LEN: usize = 32;

const RP_ID_MAX: usize = 127;
const USER_ID_MAX: usize = 64;
const USER_NAME_MAX: usize = 63;

const STORE_FILE_TYPE: &str = "FIDO2 Credential Store";
const STORE_VERSION: u32 = 1;

/// Typed failures of the credential store. Persistence I/O uses
/// `anyhow`; these are the conditions the CTAP2 layer maps to wire
/// status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    NoFreeSlot,
    UnknownCredential,
    InvalidCredential,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NoFreeSlot => write!(f, "no free credential slot"),
            StoreError::UnknownCredential => write!(f, "no such credential"),
            StoreError::InvalidCredential => write!(f, "credential key material unusable"),
        }
    }
}

impl std::error::Error for StoreError {}

/// One credential slot: a P-256 keypair bound to a relying party and
/// user, plus the monotonic signature counter.
#[derive(Debug, Clone)]
pub struct Credential {
    pub credential_id: [u8; CREDENTIAL_ID_LEN],
    private_key: [u8; 32],
    pub public_key_x: [u8; 32],
    pub public_key_y: [u8; 32],
    pub rp_id: String,
    pub user_id: Vec<u8>,
    pub user_name: String,
    pub user_display_name: String,
    pub sign_count: u32,
    valid: bool,
}

impl Credential {
    fn empty() -> Self {
        Credential {
            credential_id: [0u8; CREDENTIAL_ID_LEN],
            private_key: [0u8; 32],
            public_key_x: [0u8; 32],
            public_key_y: [0u8; 32],
            rp_id: String::new(),
            user_id: Vec::new(),
            user_name: String::new(),
            user_display_name: String::new(),
            sign_count: 0,
            valid: false,
        }
    }

    /// Zero the key material in place before the slot is reusable.
    fn wipe(&mut self) {
        self.credential_id = [0u8; CREDENTIAL_ID_LEN];
        self.private_key = [0u8; 32];
        self.public_key_x = [0u8; 32];
        self.public_key_y = [0u8; 32];
        self.rp_id.clear();
        self.user_id.clear();
        self.user_name.clear();
        self.user_display_name.clear();
        self.sign_count = 0;
        self.valid = false;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Truncate to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Fixed-capacity table of credentials. The store exclusively owns its
/// slots; lookups hand out borrows. The AAGUID lives in the store header
/// so the device identity survives restarts together with the
/// credentials.
pub struct CredentialStore {
    slots: Vec<Credential>,
    aaguid: [u8; 16],
    path: Option<PathBuf>,
}

impl CredentialStore {
    /// In-memory store with a freshly generated AAGUID.
    pub fn new() -> Self {
        let mut aaguid = [0u8; 16];
        OsRng.fill_bytes(&mut aaguid);
        CredentialStore {
            slots: (0..MAX_CREDENTIALS).map(|_| Credential::empty()).collect(),
            aaguid,
            path: None,
        }
    }

    /// Store backed by a file. A missing file is not an error: the store
    /// starts empty and keeps its generated AAGUID. A present but
    /// malformed file aborts the load and leaves the store empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut store = Self::new();
        if path.exists() {
            store.load_from(&path)?;
        }
        store.path = Some(path);
        Ok(store)
    }

    pub fn aaguid(&self) -> [u8; 16] {
        self.aaguid
    }

    pub fn has_backing_file(&self) -> bool {
        self.path.is_some()
    }

    /// Create a credential in the first free slot.
    pub fn create(
        &mut self,
        rp_id: &str,
        user_id: &[u8],
        user_name: &str,
        user_display_name: &str,
    ) -> Result<&Credential, StoreError> {
        let slot = self
            .slots
            .iter()
            .position(|c| !c.valid)
            .ok_or(StoreError::NoFreeSlot)?;

        let mut credential_id = [0u8; CREDENTIAL_ID_LEN];
        loop {
            OsRng.fill_bytes(&mut credential_id);
            if self.find_by_id(&credential_id).is_none() {
                break;
            }
        }

        let signing_key = SigningKey::random(&mut OsRng);
        let point = signing_key.verifying_key().to_encoded_point(false);
        let (x, y) = match (point.x(), point.y()) {
            (Some(x), Some(y)) => (x, y),
            _ => return Err(StoreError::InvalidCredential),
        };

        let cred = &mut self.slots[slot];
        cred.wipe();
        cred.credential_id = credential_id;
        cred.private_key = signing_key.to_bytes().into();
        cred.public_key_x.copy_from_slice(x.as_slice());
        cred.public_key_y.copy_from_slice(y.as_slice());
        cred.rp_id = truncate_utf8(rp_id, RP_ID_MAX);
        cred.user_id = user_id[..user_id.len().min(USER_ID_MAX)].to_vec();
        cred.user_name = truncate_utf8(user_name, USER_NAME_MAX);
        cred.user_display_name = truncate_utf8(user_display_name, USER_NAME_MAX);
        cred.sign_count = 0;
        cred.valid = true;

        log::info!("Created credential for RP {} in slot {}", cred.rp_id, slot);
        Ok(&self.slots[slot])
    }

    /// First valid credential registered for this relying party.
    pub fn find_by_rp(&self, rp_id: &str) -> Option<&Credential> {
        self.slots.iter().find(|c| c.valid && c.rp_id == rp_id)
    }

    /// Credential with this exact 32-byte id; any other length misses.
    pub fn find_by_id(&self, credential_id: &[u8]) -> Option<&Credential> {
        if credential_id.len() != CREDENTIAL_ID_LEN {
            return None;
        }
        self.slots
            .iter()
            .find(|c| c.valid && c.credential_id.as_slice() == credential_id)
    }

    /// ECDSA P-256 over SHA-256 of `message`, DER encoded
    /// (`30 len 02 r 02 s`). Does not touch the signature counter;
    /// assertion flows advance it explicitly before signing so the
    /// signed counter value is the stored one.
    pub fn sign(&self, credential_id: &[u8], message: &[u8]) -> Result<Vec<u8>, StoreError> {
        let cred = self
            .find_by_id(credential_id)
            .ok_or(StoreError::UnknownCredential)?;
        let key = SigningKey::from_bytes(&p256::FieldBytes::from(cred.private_key))
            .map_err(|_| StoreError::InvalidCredential)?;
        let signature: Signature = key
            .try_sign(message)
            .map_err(|_| StoreError::InvalidCredential)?;
        log::debug!("Signed {} bytes for RP {}", message.len(), cred.rp_id);
        Ok(signature.to_der().as_bytes().to_vec())
    }

    /// Pre-sign counter increment: the returned value is both written
    /// into the authenticator data and kept in the slot.
    pub fn advance_sign_count(&mut self, credential_id: &[u8]) -> Result<u32, StoreError> {
        if credential_id.len() != CREDENTIAL_ID_LEN {
            return Err(StoreError::UnknownCredential);
        }
        let cred = self
            .slots
            .iter_mut()
            .find(|c| c.valid && c.credential_id.as_slice() == credential_id)
            .ok_or(StoreError::UnknownCredential)?;
        cred.sign_count = cred.sign_count.saturating_add(1);
        Ok(cred.sign_count)
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|c| c.valid).count()
    }

    /// Wipe every slot, key material included. The AAGUID is the model
    /// identity, not user data, and survives.
    pub fn reset(&mut self) {
        for cred in &mut self.slots {
            cred.wipe();
        }
        log::info!("All credentials reset");
    }

    /// Write the store to its backing file, if one was configured.
    pub fn persist(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| anyhow!("credential store has no backing file"))?;
        self.save_to(path)
    }

    /// Serialize every valid slot, densely re-indexed from zero.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        out.push_str(&format!("Filetype: {}\n", STORE_FILE_TYPE));
        out.push_str(&format!("Version: {}\n", STORE_VERSION));
        out.push_str(&format!("Aaguid: {}\n", hex::encode(self.aaguid)));
        out.push_str(&format!("Count: {}\n", self.count()));

        for (saved, cred) in self.slots.iter().filter(|c| c.valid).enumerate() {
            out.push_str(&format!(
                "CredID_{}: {}\n",
                saved,
                hex::encode(cred.credential_id)
            ));
            out.push_str(&format!(
                "PrivKey_{}: {}\n",
                saved,
                hex::encode(cred.private_key)
            ));
            out.push_str(&format!(
                "PubKeyX_{}: {}\n",
                saved,
                hex::encode(cred.public_key_x)
            ));
            out.push_str(&format!(
                "PubKeyY_{}: {}\n",
                saved,
                hex::encode(cred.public_key_y)
            ));
            out.push_str(&format!("RPID_{}: {}\n", saved, cred.rp_id));
            out.push_str(&format!("UserID_{}: {}\n", saved, hex::encode(&cred.user_id)));
            out.push_str(&format!("UserIDLen_{}: {}\n", saved, cred.user_id.len()));
            out.push_str(&format!("UserName_{}: {}\n", saved, cred.user_name));
            out.push_str(&format!("UserDisplay_{}: {}\n", saved, cred.user_display_name));
            out.push_str(&format!("SignCount_{}: {}\n", saved, cred.sign_count));
        }

        fs::write(path, out)
            .with_context(|| format!("Failed to write credential store {}", path.display()))?;
        log::info!("Saved {} credentials to {}", self.count(), path.display());
        Ok(())
    }

    /// All-or-nothing load: the slot table is cleared first, and any
    /// parse failure clears it again before the error is returned.
    fn load_from(&mut self, path: &Path) -> Result<()> {
        self.reset();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read credential store {}", path.display()))?;
        match self.parse(&text) {
            Ok(count) => {
                log::info!("Loaded {} credentials from {}", count, path.display());
                Ok(())
            }
            Err(e) => {
                self.reset();
                Err(e).with_context(|| format!("Malformed credential store {}", path.display()))
            }
        }
    }

    fn parse(&mut self, text: &str) -> Result<usize> {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("malformed line: {:?}", line))?;
            fields.insert(key, value.strip_prefix(' ').unwrap_or(value));
        }

        let filetype = get_field(&fields, "Filetype")?;
        if filetype != STORE_FILE_TYPE {
            return Err(anyhow!("unexpected file type {:?}", filetype));
        }
        let version = get_u32(&fields, "Version")?;
        if version != STORE_VERSION {
            return Err(anyhow!("unsupported store version {}", version));
        }
        self.aaguid = get_hex::<16>(&fields, "Aaguid")?;

        let mut count = get_u32(&fields, "Count")? as usize;
        if count > MAX_CREDENTIALS {
            log::warn!("Count {} exceeds capacity, truncating", count);
            count = MAX_CREDENTIALS;
        }

        for i in 0..count {
            let cred = &mut self.slots[i];
            cred.credential_id = get_hex::<32>(&fields, &format!("CredID_{}", i))?;
            cred.private_key = get_hex::<32>(&fields, &format!("PrivKey_{}", i))?;
            cred.public_key_x = get_hex::<32>(&fields, &format!("PubKeyX_{}", i))?;
            cred.public_key_y = get_hex::<32>(&fields, &format!("PubKeyY_{}", i))?;

            let rp_id = get_field(&fields, &format!("RPID_{}", i))?;
            if rp_id.len() > RP_ID_MAX {
                return Err(anyhow!("RPID_{} exceeds {} bytes", i, RP_ID_MAX));
            }
            cred.rp_id = rp_id.to_string();

            let user_id = hex::decode(get_field(&fields, &format!("UserID_{}", i))?)
                .with_context(|| format!("bad hex in UserID_{}", i))?;
            if user_id.len() > USER_ID_MAX {
                return Err(anyhow!("UserID_{} exceeds {} bytes", i, USER_ID_MAX));
            }
            let user_id_len = get_u32(&fields, &format!("UserIDLen_{}", i))? as usize;
            if user_id_len != user_id.len() {
                return Err(anyhow!(
                    "UserIDLen_{} ({}) disagrees with UserID_{} ({} bytes)",
                    i,
                    user_id_len,
                    i,
                    user_id.len()
                ));
            }
            cred.user_id = user_id;

            cred.user_name = get_field(&fields, &format!("UserName_{}", i))?.to_string();
            cred.user_display_name =
                get_field(&fields, &format!("UserDisplay_{}", i))?.to_string();
            cred.sign_count = get_u32(&fields, &format!("SignCount_{}", i))?;
            cred.valid = true;
        }

        Ok(count)
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CredentialStore {
    fn drop(&mut self) {
        for cred in &mut self.slots {
            cred.wipe();
        }
    }
}

fn get_field<'a>(fields: &HashMap<&str, &'a str>, key: &str) -> Result<&'a str> {
    fields
        .get(key)
        .copied()
        .ok_or_else(|| anyhow!("missing key {}", key))
}

fn get_u32(fields: &HashMap<&str, &str>, key: &str) -> Result<u32> {
    get_field(fields, key)?
        .parse::<u32>()
        .with_context(|| format!("bad integer in {}", key))
}

fn get_hex<const N: usize>(fields: &HashMap<&str, &str>, key: &str) -> Result<[u8; N]> {
    let raw = hex::decode(get_field(fields, key)?).with_context(|| format!("bad hex in {}", key))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| anyhow!("{} must be {} bytes", key, N))
}
