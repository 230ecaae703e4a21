//! Device-side FIDO2/CTAP2 authenticator.
//!
//! The crate covers the two subsystems a security key is built around:
//! the CTAPHID framing transport (packet reassembly over 64-byte HID
//! reports, channel allocation, the channel lock) and the CTAP2 command
//! engine (CBOR requests, authenticator data and attestation
//! construction, ECDSA P-256 signing, the persistent credential store).
//! The USB endpoint, the display, and the gesture UI stay outside and
//! plug in through the [`transport::ReportSink`] and
//! [`presence::PresenceOracle`] seams.

pub mod cbor;
pub mod credential;
pub mod ctap2;
pub mod hid;
pub mod presence;
pub mod transport;

pub use credential::{Credential, CredentialStore, StoreError, CREDENTIAL_ID_LEN, MAX_CREDENTIALS};
pub use ctap2::{AuthenticatorInfo, AuthenticatorOptions, CtapEngine, CtapStatus};
pub use hid::{CtapHid, HidError, HidOutput, RequestHandler, BROADCAST_CID, HID_REPORT_LEN, PAYLOAD_MAX};
pub use presence::{presence_channel, AutoApprove, AutoDeny, ChannelPresence, PresenceDecision, PresenceOracle, PresenceResolver};
pub use transport::{ReportSink, TransportEvent, TransportHandle};
