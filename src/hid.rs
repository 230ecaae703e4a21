use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;

/// CTAPHID reports are fixed 64 bytes.
pub const HID_REPORT_LEN: usize = 64;

const INIT_HEADER_LEN: usize = 7;
const CONT_HEADER_LEN: usize = 5;

/// Payload bytes carried by an initialization frame.
pub const INIT_PAYLOAD_LEN: usize = HID_REPORT_LEN - INIT_HEADER_LEN;

/// Payload bytes carried by a continuation frame.
pub const CONT_PAYLOAD_LEN: usize = HID_REPORT_LEN - CONT_HEADER_LEN;

/// Largest reassembled payload: one init frame plus 128 continuations.
pub const PAYLOAD_MAX: usize = INIT_PAYLOAD_LEN + 128 * CONT_PAYLOAD_LEN;

/// Broadcast channel, used only for INIT.
pub const BROADCAST_CID: u32 = 0xFFFF_FFFF;

const TYPE_INIT: u8 = 0x80;

// CTAPHID commands (without the frame-type bit)
const CMD_PING: u8 = 0x01;
const CMD_MSG: u8 = 0x03;
const CMD_LOCK: u8 = 0x04;
const CMD_INIT: u8 = 0x06;
const CMD_WINK: u8 = 0x08;
const CMD_CBOR: u8 = 0x10;
const CMD_ERROR: u8 = 0x3F;

// CTAPHID interface and device versions reported by INIT
const CTAPHID_IF_VERSION: u8 = 2;
const DEVICE_VERSION_MAJOR: u8 = 1;
const DEVICE_VERSION_MINOR: u8 = 0;
const DEVICE_VERSION_BUILD: u8 = 1;

// INIT capability flags
pub const CAP_WINK: u8 = 0x01;
pub const CAP_CBOR: u8 = 0x04;
pub const CAP_NMSG: u8 = 0x08;

/// CTAPHID protocol error codes, sent in a one-byte 0x3F frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HidError {
    InvalidCmd = 0x01,
    InvalidPar = 0x02,
    InvalidLen = 0x03,
    InvalidSeq = 0x04,
    MsgTimeout = 0x05,
    ChannelBusy = 0x06,
    LockRequired = 0x0A,
    SyncFail = 0x0B,
    Other = 0x7F,
}

/// Seam between the transport and the command layers: CBOR frames go to
/// the CTAP2 engine, MSG frames to a legacy CTAP1/U2F engine when one is
/// wired in.
pub trait RequestHandler {
    fn handle_cbor(&mut self, request: &[u8]) -> Vec<u8>;

    /// Legacy U2F message. The default reply is ISO 7816 SW 6D00
    /// (instruction not supported).
    fn handle_msg(&mut self, _request: &[u8]) -> Vec<u8> {
        vec![0x6D, 0x00]
    }
}

/// One in-flight reassembly. Born on an init frame, grown by
/// continuations, consumed exactly once when complete.
#[derive(Debug)]
struct Reassembly {
    cid: u32,
    cmd: u8,
    total_len: usize,
    next_seq: u8,
    payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct ChannelLock {
    cid: u32,
    deadline: Instant,
}

/// Side effects of one report: frames to transmit, an unlock timer to
/// arm, and the wink indication.
#[derive(Debug, Default)]
pub struct HidOutput {
    pub reports: Vec<[u8; HID_REPORT_LEN]>,
    pub lock_timer: Option<Duration>,
    pub wink: bool,
}

/// The CTAPHID framing state machine: packet reassembly, channel
/// allocation, the channel lock, and command dispatch. Purely
/// synchronous; the transport worker feeds it reports and a clock.
pub struct CtapHid {
    reassembly: Option<Reassembly>,
    channels: Vec<u32>,
    lock: Option<ChannelLock>,
}

impl CtapHid {
    pub fn new() -> Self {
        CtapHid {
            reassembly: None,
            channels: Vec::new(),
            lock: None,
        }
    }

    /// Feed one 64-byte report. Frames the protocol drops silently
    /// (locked-out channel, bad sequence, oversize length) produce an
    /// empty output.
    pub fn handle_report<H: RequestHandler>(
        &mut self,
        report: &[u8; HID_REPORT_LEN],
        handler: &mut H,
        now: Instant,
    ) -> HidOutput {
        let mut output = HidOutput::default();
        self.expire_lock(now);

        let cid = u32::from_le_bytes([report[0], report[1], report[2], report[3]]);

        if report[4] & TYPE_INIT != 0 {
            let cmd = report[4] & !TYPE_INIT;
            let total_len = usize::from(u16::from_be_bytes([report[5], report[6]]));
            if total_len > PAYLOAD_MAX {
                log::warn!(
                    "Dropping frame on {:08X}: declared length {} too large",
                    cid,
                    total_len
                );
                self.reassembly = None;
                return output;
            }

            let take = total_len.min(INIT_PAYLOAD_LEN);
            let mut payload = Vec::with_capacity(total_len);
            payload.extend_from_slice(&report[INIT_HEADER_LEN..INIT_HEADER_LEN + take]);
            let frame = Reassembly {
                cid,
                cmd,
                total_len,
                next_seq: 0,
                payload,
            };

            if frame.payload.len() == frame.total_len {
                self.reassembly = None;
                self.dispatch(frame, handler, now, &mut output);
            } else {
                log::debug!(
                    "Frame on {:08X} awaiting {} continuation bytes",
                    cid,
                    frame.total_len - frame.payload.len()
                );
                self.reassembly = Some(frame);
            }
        } else {
            let seq = report[4];
            let Some(frame) = self.reassembly.as_mut() else {
                log::debug!("Unexpected continuation on {:08X}", cid);
                return output;
            };
            if frame.cid != cid || frame.next_seq != seq {
                log::debug!(
                    "Continuation mismatch on {:08X}: seq {} (expected {} on {:08X})",
                    cid,
                    seq,
                    frame.next_seq,
                    frame.cid
                );
                return output;
            }

            let remaining = frame.total_len - frame.payload.len();
            let take = remaining.min(CONT_PAYLOAD_LEN);
            frame.payload.extend_from_slice(&report[CONT_HEADER_LEN..CONT_HEADER_LEN + take]);
            frame.next_seq = frame.next_seq.wrapping_add(1);

            if frame.payload.len() == frame.total_len {
                if let Some(frame) = self.reassembly.take() {
                    self.dispatch(frame, handler, now, &mut output);
                }
            }
        }

        output
    }

    /// Drop the lock once its deadline has passed. Stale timer ticks for
    /// a superseded lock leave a newer lock in place.
    pub fn expire_lock(&mut self, now: Instant) {
        if let Some(lock) = self.lock {
            if lock.deadline <= now {
                log::debug!("Lock on {:08X} expired", lock.cid);
                self.lock = None;
            }
        }
    }

    /// Connect/disconnect: abandon any partial frame and the lock.
    /// Allocated channel ids stay reserved; hosts re-INIT anyway.
    pub fn reset(&mut self) {
        self.reassembly = None;
        self.lock = None;
    }

    fn dispatch<H: RequestHandler>(
        &mut self,
        frame: Reassembly,
        handler: &mut H,
        now: Instant,
        output: &mut HidOutput,
    ) {
        log::debug!(
            "Req cid={:08X} cmd=0x{:02X} len={}",
            frame.cid,
            frame.cmd,
            frame.total_len
        );

        if let Some(lock) = self.lock {
            if frame.cid != lock.cid {
                log::warn!("Lock check failed for {:08X}", frame.cid);
                return;
            }
        }

        match frame.cmd {
            CMD_PING => self.queue_response(frame.cid, CMD_PING, &frame.payload, output),
            CMD_MSG => {
                let response = handler.handle_msg(&frame.payload);
                self.queue_bounded(frame.cid, CMD_MSG, response, output);
            }
            CMD_CBOR => {
                let response = handler.handle_cbor(&frame.payload);
                self.queue_bounded(frame.cid, CMD_CBOR, response, output);
            }
            CMD_LOCK => self.handle_lock(&frame, now, output),
            CMD_INIT => self.handle_init(&frame, output),
            CMD_WINK => {
                if !frame.payload.is_empty() {
                    self.queue_error(frame.cid, HidError::InvalidLen, output);
                    return;
                }
                output.wink = true;
                self.queue_response(frame.cid, CMD_WINK, &[], output);
            }
            other => {
                log::warn!("Unknown CTAPHID command: 0x{:02X}", other);
                self.queue_error(frame.cid, HidError::InvalidCmd, output);
            }
        }
    }

    fn handle_lock(&mut self, frame: &Reassembly, now: Instant, output: &mut HidOutput) {
        if frame.payload.len() != 1 {
            self.queue_error(frame.cid, HidError::InvalidLen, output);
            return;
        }
        let seconds = frame.payload[0];
        if seconds == 0 {
            log::info!("Lock cleared by {:08X}", frame.cid);
            self.lock = None;
        } else {
            let hold = Duration::from_secs(u64::from(seconds));
            self.lock = Some(ChannelLock {
                cid: frame.cid,
                deadline: now + hold,
            });
            output.lock_timer = Some(hold);
            log::info!("Lock held by {:08X} for {}s", frame.cid, seconds);
        }
        self.queue_response(frame.cid, CMD_LOCK, &[], output);
    }

    fn handle_init(&mut self, frame: &Reassembly, output: &mut HidOutput) {
        if frame.payload.len() != 8 || frame.cid != BROADCAST_CID {
            log::warn!(
                "INIT validation failed (cid={:08X}, len={})",
                frame.cid,
                frame.payload.len()
            );
            self.queue_error(frame.cid, HidError::InvalidPar, output);
            return;
        }

        let new_cid = self.allocate_cid();
        log::info!("Allocated channel {:08X}", new_cid);

        let mut payload = [0u8; 17];
        payload[0..8].copy_from_slice(&frame.payload);
        payload[8..12].copy_from_slice(&new_cid.to_le_bytes());
        payload[12] = CTAPHID_IF_VERSION;
        payload[13] = DEVICE_VERSION_MAJOR;
        payload[14] = DEVICE_VERSION_MINOR;
        payload[15] = DEVICE_VERSION_BUILD;
        payload[16] = CAP_CBOR;
        self.queue_response(frame.cid, CMD_INIT, &payload, output);
    }

    fn allocate_cid(&mut self) -> u32 {
        loop {
            let cid = OsRng.next_u32();
            if cid == 0 || cid == BROADCAST_CID || self.channels.contains(&cid) {
                continue;
            }
            self.channels.push(cid);
            return cid;
        }
    }

    /// Responses from external handlers get a size check before
    /// fragmentation.
    fn queue_bounded(&self, cid: u32, cmd: u8, response: Vec<u8>, output: &mut HidOutput) {
        if response.len() > PAYLOAD_MAX {
            log::error!("Handler response of {} bytes too large", response.len());
            self.queue_error(cid, HidError::Other, output);
            return;
        }
        self.queue_response(cid, cmd, &response, output);
    }

    /// Fragment a payload into one init frame and as many continuation
    /// frames as needed, zero-padded to the report size.
    fn queue_response(&self, cid: u32, cmd: u8, payload: &[u8], output: &mut HidOutput) {
        let total_len = payload.len();
        let mut report = [0u8; HID_REPORT_LEN];
        report[0..4].copy_from_slice(&cid.to_le_bytes());
        report[4] = cmd | TYPE_INIT;
        report[5..7].copy_from_slice(&(total_len as u16).to_be_bytes());
        let first = total_len.min(INIT_PAYLOAD_LEN);
        report[INIT_HEADER_LEN..INIT_HEADER_LEN + first].copy_from_slice(&payload[..first]);
        output.reports.push(report);

        let mut sent = first;
        let mut seq = 0u8;
        while sent < total_len {
            let mut report = [0u8; HID_REPORT_LEN];
            report[0..4].copy_from_slice(&cid.to_le_bytes());
            report[4] = seq;
            let take = (total_len - sent).min(CONT_PAYLOAD_LEN);
            report[CONT_HEADER_LEN..CONT_HEADER_LEN + take]
                .copy_from_slice(&payload[sent..sent + take]);
            output.reports.push(report);
            sent += take;
            seq = seq.wrapping_add(1);
        }
    }

    fn queue_error(&self, cid: u32, error: HidError, output: &mut HidOutput) {
        log::warn!("Sending error 0x{:02X} on {:08X}", error as u8, cid);
        self.queue_response(cid, CMD_ERROR, &[error as u8], output);
    }
}

impl Default for CtapHid {
    fn default() -> Self {
        Self::new()
    }
}
