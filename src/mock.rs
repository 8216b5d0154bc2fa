//! In-memory reader and card simulation.
//!
//! [`MockHsm`] models a terminal service with pluggable readers, each
//! optionally holding a simulated SmartCard-HSM: elementary files keyed by
//! 16-bit identifier, PIN verification with a retry counter, and the two
//! signature primitives (identity raw RSA, DER-encoded ECDSA of a
//! configurable length).
//!
//! The simulation backs the test suites and the CLI binaries' simulation
//! mode. Readers and cards can be plugged, unplugged and re-provisioned
//! while connections are open, which is how the removal paths are
//! exercised.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::apdu::Command;
use crate::card::{
    EF_DEV_AUT, FAMILY_DATA_DESCRIPTOR, FAMILY_DATA_OBJECT, FAMILY_KEY_DESCRIPTOR,
    FAMILY_PRIVATE_KEY, HSM_AID, SIGN_OP_ECDSA, SIGN_OP_RSA_RAW,
};
use crate::reader::{CardConnection, ReaderFeatures, ReaderTransport, TransportError};
use crate::template::TemplateHeader;

/// Default ATR (first entry of the recognition allow-list).
pub const DEFAULT_ATR: [u8; 24] = [
    0x3B, 0xFE, 0x18, 0x00, 0x00, 0x81, 0x31, 0xFE, 0x45, 0x80, 0x31, 0x81, 0x54, 0x48, 0x53,
    0x4D, 0x31, 0x73, 0x80, 0x21, 0x40, 0x81, 0x07, 0xFA,
];

/// Default user PIN of a freshly built card.
pub const DEFAULT_USER_PIN: &str = "648219";
/// Default SO-PIN (16 hex digits).
pub const DEFAULT_SO_PIN: &str = "3537363231383830";

/// Template flavours the builder can provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// 2048-bit RSA: fixed 256-byte signature.
    Rsa2048,
    /// prime256 ECDSA: 72-byte signature area, DER fix-up on sign.
    EcdsaP256,
}

impl SignatureKind {
    fn signature_size(self) -> u16 {
        match self {
            SignatureKind::Rsa2048 => 256,
            SignatureKind::EcdsaP256 => 72,
        }
    }
}

// ============================================================================
// CARD
// ============================================================================

/// One simulated card.
#[derive(Debug, Clone)]
pub struct MockCard {
    pub atr: Vec<u8>,
    user_pin: Vec<u8>,
    so_pin: Vec<u8>,
    tries_left: u8,
    pin_initialized: bool,
    selected: bool,
    user_verified: bool,
    files: BTreeMap<u16, Vec<u8>>,
    /// Length of DER signatures produced by the ECDSA primitive.
    ecdsa_sig_len: usize,
    generation: u64,
    dkek_total: u8,
    dkek_imported: u8,
}

impl Default for MockCard {
    fn default() -> Self {
        MockCard::new()
    }
}

impl MockCard {
    /// A provisioned card: default PINs, an RSA signing pair labelled
    /// `sign0` (key `CC01`/`C401`, template `CD05`/`C905`).
    pub fn new() -> MockCard {
        MockCard::blank().with_signing_setup("sign0", SignatureKind::Rsa2048, 0x01, 0x05)
    }

    /// A card with PINs but no files.
    pub fn blank() -> MockCard {
        MockCard {
            atr: DEFAULT_ATR.to_vec(),
            user_pin: DEFAULT_USER_PIN.as_bytes().to_vec(),
            so_pin: hex::decode(DEFAULT_SO_PIN).unwrap_or_default(),
            tries_left: 3,
            pin_initialized: true,
            selected: false,
            user_verified: false,
            files: BTreeMap::new(),
            ecdsa_sig_len: 72,
            generation: 0,
            dkek_total: 0,
            dkek_imported: 0,
        }
    }

    /// A card whose user PIN was never set.
    pub fn with_uninitialized_pin(mut self) -> MockCard {
        self.pin_initialized = false;
        self
    }

    pub fn with_atr(mut self, atr: &[u8]) -> MockCard {
        self.atr = atr.to_vec();
        self
    }

    pub fn with_file(mut self, fid: u16, content: Vec<u8>) -> MockCard {
        self.files.insert(fid, content);
        self
    }

    /// Length of DER signatures returned by the ECDSA primitive (70–72).
    pub fn with_ecdsa_sig_len(mut self, len: usize) -> MockCard {
        self.ecdsa_sig_len = len;
        self
    }

    /// Provision a key/template pair under `label` with the given local
    /// names (`key_name` for the `CC`/`C4` pair, `data_name` for `CD`/`C9`).
    pub fn with_signing_setup(
        mut self,
        label: &str,
        kind: SignatureKind,
        key_name: u8,
        data_name: u8,
    ) -> MockCard {
        let key_fid = u16::from(FAMILY_PRIVATE_KEY) << 8 | u16::from(key_name);
        let key_desc_fid = u16::from(FAMILY_KEY_DESCRIPTOR) << 8 | u16::from(key_name);
        let data_fid = u16::from(FAMILY_DATA_OBJECT) << 8 | u16::from(data_name);
        let data_desc_fid = u16::from(FAMILY_DATA_DESCRIPTOR) << 8 | u16::from(data_name);

        self.files.insert(key_fid, Vec::new());
        self.files.insert(key_desc_fid, descriptor_with_label(label));
        self.files
            .insert(data_fid, build_template_file(kind, &[0xCE; 32]));
        self.files.insert(data_desc_fid, descriptor_with_label(label));
        self
    }

    pub fn file(&self, fid: u16) -> Option<&Vec<u8>> {
        self.files.get(&fid)
    }

    fn process(&mut self, capdu: &[u8]) -> Vec<u8> {
        let Ok(cmd) = Command::parse(capdu) else {
            return sw_only(0x6F00);
        };
        match (cmd.cla, cmd.ins) {
            (0x00, 0xA4) => self.select(&cmd),
            _ if !self.selected => sw_only(0x6985),
            (0x00, 0x20) => self.verify(&cmd),
            (0x00, 0x2C) => self.reset_retry_counter(&cmd),
            (0x00, 0x24) => self.change_reference_data(&cmd),
            (0x80, 0x58) => self.enumerate(&cmd),
            (0x00, 0xB1) => self.read_binary(&cmd),
            (0x00, 0xD7) => self.update_binary(&cmd),
            (0x80, 0x68) => self.sign(&cmd),
            (0x80, 0x50) => self.initialize(&cmd),
            (0x80, 0x52) => self.import_dkek_share(&cmd),
            (0x80, 0x72) => self.wrap_key(&cmd),
            (0x80, 0x74) => self.unwrap_key(&cmd),
            _ => sw_only(0x6D00),
        }
    }

    fn select(&mut self, cmd: &Command) -> Vec<u8> {
        if cmd.p1 == 0x04 && cmd.data == HSM_AID {
            self.selected = true;
            self.user_verified = false;
            sw_only(0x9000)
        } else {
            sw_only(0x6A82)
        }
    }

    fn verify(&mut self, cmd: &Command) -> Vec<u8> {
        match cmd.p2 {
            0x81 => {
                if !self.pin_initialized {
                    return sw_only(0x6A88);
                }
                if cmd.data.is_empty() {
                    return if self.user_verified {
                        sw_only(0x9000)
                    } else {
                        sw_only(0x63C0 | u16::from(self.tries_left))
                    };
                }
                if self.tries_left == 0 {
                    return sw_only(0x6982);
                }
                if cmd.data == self.user_pin {
                    self.user_verified = true;
                    self.tries_left = 3;
                    sw_only(0x9000)
                } else {
                    self.tries_left -= 1;
                    if self.tries_left == 0 {
                        sw_only(0x6982)
                    } else {
                        sw_only(0x63C0 | u16::from(self.tries_left))
                    }
                }
            }
            0x88 => {
                if cmd.data == self.so_pin {
                    sw_only(0x9000)
                } else {
                    sw_only(0x63CF)
                }
            }
            _ => sw_only(0x6A86),
        }
    }

    fn reset_retry_counter(&mut self, cmd: &Command) -> Vec<u8> {
        if cmd.p2 != 0x81 {
            return sw_only(0x6A86);
        }
        match cmd.p1 {
            // SO-PIN only: unblock
            0x01 => {
                if cmd.data == self.so_pin {
                    self.tries_left = 3;
                    sw_only(0x9000)
                } else {
                    sw_only(0x63CF)
                }
            }
            // SO-PIN plus new user PIN
            0x00 => {
                if cmd.data.len() < 8 + 6 || &cmd.data[..8] != self.so_pin.as_slice() {
                    return sw_only(0x63CF);
                }
                self.user_pin = cmd.data[8..].to_vec();
                self.tries_left = 3;
                self.pin_initialized = true;
                sw_only(0x9000)
            }
            _ => sw_only(0x6A86),
        }
    }

    fn change_reference_data(&mut self, cmd: &Command) -> Vec<u8> {
        match cmd.p2 {
            0x81 => {
                let half = cmd.data.len() / 2;
                if cmd.data.len() % 2 != 0 || cmd.data[..half] != self.user_pin[..] {
                    return sw_only(0x63C0 | u16::from(self.tries_left));
                }
                self.user_pin = cmd.data[half..].to_vec();
                sw_only(0x9000)
            }
            0x88 => {
                if cmd.data.len() != 16 || &cmd.data[..8] != self.so_pin.as_slice() {
                    return sw_only(0x63CF);
                }
                self.so_pin = cmd.data[8..].to_vec();
                sw_only(0x9000)
            }
            _ => sw_only(0x6A86),
        }
    }

    fn enumerate(&mut self, cmd: &Command) -> Vec<u8> {
        let mut body = Vec::new();
        for fid in self.files.keys() {
            body.push((fid >> 8) as u8);
            body.push(*fid as u8);
        }
        body.truncate(cmd.le.unwrap_or(body.len()));
        with_sw(body, 0x9000)
    }

    fn read_binary(&mut self, cmd: &Command) -> Vec<u8> {
        let fid = u16::from(cmd.p1) << 8 | u16::from(cmd.p2);
        if cmd.p1 == FAMILY_PRIVATE_KEY {
            // key material is never readable
            return sw_only(0x6982);
        }
        if cmd.data.len() != 4 || cmd.data[0] != 0x54 || cmd.data[1] != 0x02 {
            return sw_only(0x6A86);
        }
        let off = (usize::from(cmd.data[2]) << 8) | usize::from(cmd.data[3]);
        let Some(file) = self.files.get(&fid) else {
            return sw_only(0x6A82);
        };
        let wanted = cmd.le.unwrap_or(0);
        if off >= file.len() {
            return sw_only(0x6282);
        }
        let end = file.len().min(off + wanted);
        let body = file[off..end].to_vec();
        let sw = if end == file.len() && wanted > body.len() {
            0x6282
        } else {
            0x9000
        };
        with_sw(body, sw)
    }

    fn update_binary(&mut self, cmd: &Command) -> Vec<u8> {
        let fid = u16::from(cmd.p1) << 8 | u16::from(cmd.p2);
        if fid == EF_DEV_AUT {
            // the device-authentication file is written at manufacturing
            return sw_only(0x6982);
        }
        if cmd.data.len() < 6
            || cmd.data[0] != 0x54
            || cmd.data[1] != 0x02
            || cmd.data[4] != 0x53
            || cmd.data[5] != 0x00
        {
            return sw_only(0x6A86);
        }
        let off = (usize::from(cmd.data[2]) << 8) | usize::from(cmd.data[3]);
        let payload = &cmd.data[6..];
        let file = self.files.entry(fid).or_default();
        if file.len() < off + payload.len() {
            file.resize(off + payload.len(), 0);
        }
        file[off..off + payload.len()].copy_from_slice(payload);
        sw_only(0x9000)
    }

    fn sign(&mut self, cmd: &Command) -> Vec<u8> {
        if !self.user_verified {
            return sw_only(0x6982);
        }
        let key_fid = u16::from(FAMILY_PRIVATE_KEY) << 8 | u16::from(cmd.p1);
        if !self.files.contains_key(&key_fid) {
            return sw_only(0x6A88);
        }
        match cmd.p2 {
            // raw modular exponentiation: the simulation is the identity
            SIGN_OP_RSA_RAW => with_sw(cmd.data.clone(), 0x9000),
            SIGN_OP_ECDSA => with_sw(ecdsa_der_signature(self.ecdsa_sig_len), 0x9000),
            _ => sw_only(0x6A86),
        }
    }

    fn initialize(&mut self, cmd: &Command) -> Vec<u8> {
        // walk the TLV body for PIN (81), initialization code (82) and the
        // DKEK share count (92)
        let mut ix = 0;
        let data = &cmd.data;
        self.dkek_total = 0;
        self.dkek_imported = 0;
        while ix + 2 <= data.len() {
            let tag = data[ix];
            let len = data[ix + 1] as usize;
            if ix + 2 + len > data.len() {
                return sw_only(0x6A80);
            }
            let value = &data[ix + 2..ix + 2 + len];
            match tag {
                0x81 => {
                    self.user_pin = value.to_vec();
                    self.pin_initialized = true;
                    self.tries_left = 3;
                }
                0x82 => self.so_pin = value.to_vec(),
                0x92 => self.dkek_total = value.first().copied().unwrap_or(0),
                _ => {}
            }
            ix += 2 + len;
        }
        sw_only(0x9000)
    }

    fn import_dkek_share(&mut self, cmd: &Command) -> Vec<u8> {
        if cmd.data.len() != 32 {
            return sw_only(0x6700);
        }
        self.dkek_imported += 1;
        let outstanding = self.dkek_total.saturating_sub(self.dkek_imported);
        let mut body = vec![self.dkek_total, outstanding];
        body.extend_from_slice(&[0x4B; 8]); // key check value
        with_sw(body, 0x9000)
    }

    fn wrap_key(&mut self, cmd: &Command) -> Vec<u8> {
        if !self.user_verified {
            return sw_only(0x6982);
        }
        let key_fid = u16::from(FAMILY_PRIVATE_KEY) << 8 | u16::from(cmd.p1);
        if !self.files.contains_key(&key_fid) {
            return sw_only(0x6A88);
        }
        with_sw(vec![0x57; 64], 0x9000)
    }

    fn unwrap_key(&mut self, cmd: &Command) -> Vec<u8> {
        if !self.user_verified {
            return sw_only(0x6982);
        }
        if cmd.data.is_empty() {
            return sw_only(0x6700);
        }
        let key_fid = u16::from(FAMILY_PRIVATE_KEY) << 8 | u16::from(cmd.p1);
        self.files.insert(key_fid, Vec::new());
        sw_only(0x9000)
    }
}

fn sw_only(sw: u16) -> Vec<u8> {
    vec![(sw >> 8) as u8, sw as u8]
}

fn with_sw(mut body: Vec<u8>, sw: u16) -> Vec<u8> {
    body.push((sw >> 8) as u8);
    body.push(sw as u8);
    body
}

/// A DER `SEQUENCE { INTEGER r, INTEGER s }` of exactly `len` bytes
/// (70, 71 or 72).
fn ecdsa_der_signature(len: usize) -> Vec<u8> {
    fn integer(wide: bool) -> Vec<u8> {
        if wide {
            // leading zero keeps the high-bit byte positive
            let mut v = vec![0x02, 0x21, 0x00];
            v.extend_from_slice(&[0x91; 32]);
            v
        } else {
            let mut v = vec![0x02, 0x20];
            v.extend_from_slice(&[0x11; 32]);
            v
        }
    }
    let (r_wide, s_wide) = match len {
        70 => (false, false),
        71 => (true, false),
        _ => (true, true),
    };
    let mut content = integer(r_wide);
    content.extend_from_slice(&integer(s_wide));
    let mut out = vec![0x30, content.len() as u8];
    out.extend_from_slice(&content);
    out
}

// ============================================================================
// TEMPLATE FILE BUILDER
// ============================================================================

/// Minimal-DER TLV.
fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push(len as u8);
    }
    out.extend_from_slice(content);
    out
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Descriptor file content: constructed outer element, inner sequence,
/// UTF-8 label.
pub fn descriptor_with_label(label: &str) -> Vec<u8> {
    let text = der(0x0C, label.as_bytes());
    let mut inner_content = text;
    // trailing fields of the descriptor are irrelevant to the label walk
    inner_content.extend_from_slice(&der(0x04, &[0x01]));
    let inner = der(0x30, &inner_content);
    der(0xA0, &inner)
}

/// Build a complete template file: the 20-byte patch-plan header followed
/// by a structurally valid detached CMS envelope with placeholder signing
/// time, message digest and signature.
pub fn build_template_file(kind: SignatureKind, cert_id: &[u8; 32]) -> Vec<u8> {
    const OID_SIGNED_DATA: [u8; 11] = [0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02];
    const OID_DATA: [u8; 11] = [0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x01];
    const OID_CONTENT_TYPE: [u8; 11] = [0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x09, 0x03];
    const OID_SIGNING_TIME: [u8; 11] = [0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x09, 0x05];
    const OID_MESSAGE_DIGEST: [u8; 11] = [0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x09, 0x04];
    const OID_SHA256: [u8; 11] = [0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01];
    const OID_RSA_SHA256: [u8; 11] = [0x06, 0x09, 0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x01, 0x0B];
    const OID_ECDSA_SHA256: [u8; 10] = [0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02];

    let time_placeholder = b"130101000000Z";
    let digest_placeholder = [0xDD_u8; 32];

    // signed attributes: content type, signing time, message digest
    let attr_content_type = {
        let mut c = OID_CONTENT_TYPE.to_vec();
        c.extend_from_slice(&der(0x31, &OID_DATA));
        der(0x30, &c)
    };
    let attr_signing_time = {
        let mut c = OID_SIGNING_TIME.to_vec();
        c.extend_from_slice(&der(0x31, &der(0x17, time_placeholder)));
        der(0x30, &c)
    };
    let attr_message_digest = {
        let mut c = OID_MESSAGE_DIGEST.to_vec();
        c.extend_from_slice(&der(0x31, &der(0x04, &digest_placeholder)));
        der(0x30, &c)
    };
    let mut attrs_content = attr_content_type;
    attrs_content.extend_from_slice(&attr_signing_time);
    attrs_content.extend_from_slice(&attr_message_digest);
    // stored as [0] IMPLICIT; hashed with a SET tag
    let signed_attrs = der(0xA0, &attrs_content);

    let digest_alg = {
        let mut c = OID_SHA256.to_vec();
        c.extend_from_slice(&der(0x05, &[]));
        der(0x30, &c)
    };
    let signature_alg = match kind {
        SignatureKind::Rsa2048 => {
            let mut c = OID_RSA_SHA256.to_vec();
            c.extend_from_slice(&der(0x05, &[]));
            der(0x30, &c)
        }
        SignatureKind::EcdsaP256 => der(0x30, &OID_ECDSA_SHA256),
    };
    let signature_placeholder = vec![0xA5_u8; kind.signature_size() as usize];

    let signer_info = {
        let mut c = der(0x02, &[0x01]);
        c.extend_from_slice(&der(0x30, &der(0x02, &[0x2A]))); // signer id
        c.extend_from_slice(&digest_alg);
        c.extend_from_slice(&signed_attrs);
        c.extend_from_slice(&signature_alg);
        c.extend_from_slice(&der(0x04, &signature_placeholder));
        der(0x30, &c)
    };
    let signer_infos = der(0x31, &signer_info);

    // certificate blob large enough for the two-byte length forms the
    // patch walk expects
    let certificate = {
        let mut c = cert_id.to_vec();
        c.extend_from_slice(&[0xCB; 280]);
        der(0x30, &c)
    };
    let certificates = der(0xA0, &certificate);

    let signed_data = {
        let mut c = der(0x02, &[0x01]);
        c.extend_from_slice(&der(0x31, &digest_alg)); // digest algorithms
        c.extend_from_slice(&der(0x30, &OID_DATA)); // encapsulated content
        c.extend_from_slice(&certificates);
        c.extend_from_slice(&signer_infos);
        der(0x30, &c)
    };
    let envelope = {
        let mut c = OID_SIGNED_DATA.to_vec();
        c.extend_from_slice(&der(0xA0, &signed_data));
        der(0x30, &c)
    };

    // locate the patch offsets by their placeholders
    let sig_attr_off = find_subslice(&envelope, &signed_attrs).unwrap_or(0);
    let signing_time_off = find_subslice(&envelope, time_placeholder).unwrap_or(0);
    let msg_digest_off = find_subslice(&envelope, &digest_placeholder).unwrap_or(0);
    let signature_off = find_subslice(&envelope, &signature_placeholder).unwrap_or(0);
    let cert_id_off = find_subslice(&envelope, cert_id).unwrap_or(0);

    let header = TemplateHeader {
        version: 0,
        header_len: 20,
        hash_len: 32,
        cert_id_off: cert_id_off as u16,
        sig_attr_off: sig_attr_off as u16,
        sig_attr_len: signed_attrs.len() as u16,
        signing_time_off: signing_time_off as u16,
        msg_digest_off: msg_digest_off as u16,
        signature_off: signature_off as u16,
        signature_size: kind.signature_size(),
        envelope_len: envelope.len() as u16,
    };

    let mut file = header.to_bytes().to_vec();
    file.extend_from_slice(&envelope);
    file
}

// ============================================================================
// TRANSPORT
// ============================================================================

struct ReaderSlot {
    name: String,
    card: Option<MockCard>,
    verify_pin_direct: u32,
}

struct HsmState {
    readers: Vec<ReaderSlot>,
    service_up: bool,
    next_generation: u64,
}

/// The simulated terminal service; clones share the same state.
#[derive(Clone)]
pub struct MockHsm {
    state: Arc<Mutex<HsmState>>,
}

pub struct MockHsmBuilder {
    readers: Vec<ReaderSlot>,
}

impl MockHsmBuilder {
    /// A reader holding a default provisioned card.
    pub fn reader(mut self, name: &str) -> Self {
        self.readers.push(ReaderSlot {
            name: name.to_string(),
            card: Some(MockCard::new()),
            verify_pin_direct: 0,
        });
        self
    }

    /// A reader with no card inserted.
    pub fn empty_reader(mut self, name: &str) -> Self {
        self.readers.push(ReaderSlot { name: name.to_string(), card: None, verify_pin_direct: 0 });
        self
    }

    /// A reader holding the given card.
    pub fn reader_with(mut self, name: &str, card: MockCard) -> Self {
        self.readers.push(ReaderSlot {
            name: name.to_string(),
            card: Some(card),
            verify_pin_direct: 0,
        });
        self
    }

    /// A reader with an integrated PIN pad (direct PIN verification).
    pub fn pinpad_reader(mut self, name: &str) -> Self {
        self.readers.push(ReaderSlot {
            name: name.to_string(),
            card: Some(MockCard::new()),
            verify_pin_direct: 0x0031_3550,
        });
        self
    }

    pub fn build(self) -> MockHsm {
        let mut state = HsmState { readers: self.readers, service_up: true, next_generation: 1 };
        for reader in state.readers.iter_mut() {
            if let Some(card) = reader.card.as_mut() {
                card.generation = state.next_generation;
                state.next_generation += 1;
            }
        }
        MockHsm { state: Arc::new(Mutex::new(state)) }
    }
}

impl MockHsm {
    pub fn builder() -> MockHsmBuilder {
        MockHsmBuilder { readers: Vec::new() }
    }

    /// The transport handle to hand to the library.
    pub fn transport(&self) -> Arc<dyn ReaderTransport> {
        Arc::new(MockTransport { state: Arc::clone(&self.state) })
    }

    /// Detach a reader; open connections observe "reader gone".
    pub fn unplug_reader(&self, name: &str) {
        self.state.lock().readers.retain(|r| r.name != name);
    }

    /// Attach a reader holding a default card.
    pub fn plug_reader(&self, name: &str) {
        let mut state = self.state.lock();
        let mut card = MockCard::new();
        card.generation = state.next_generation;
        state.next_generation += 1;
        state.readers.push(ReaderSlot {
            name: name.to_string(),
            card: Some(card),
            verify_pin_direct: 0,
        });
    }

    /// Withdraw the card; open connections observe "card removed".
    pub fn remove_card(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(reader) = state.readers.iter_mut().find(|r| r.name == name) {
            reader.card = None;
        }
    }

    /// Insert a card into an attached reader.
    pub fn insert_card(&self, name: &str, mut card: MockCard) {
        let mut state = self.state.lock();
        card.generation = state.next_generation;
        state.next_generation += 1;
        if let Some(reader) = state.readers.iter_mut().find(|r| r.name == name) {
            reader.card = Some(card);
        }
    }

    pub fn insert_default_card(&self, name: &str) {
        self.insert_card(name, MockCard::new());
    }

    /// Stop the terminal service; enumeration and connects fail until
    /// restarted.
    pub fn stop_service(&self) {
        self.state.lock().service_up = false;
    }

    pub fn start_service(&self) {
        self.state.lock().service_up = true;
    }

    /// Overwrite a file on the card in `reader` (re-provisioning).
    pub fn rewrite_card_file(&self, reader: &str, fid: u16, content: Vec<u8>) {
        let mut state = self.state.lock();
        if let Some(card) = state
            .readers
            .iter_mut()
            .find(|r| r.name == reader)
            .and_then(|r| r.card.as_mut())
        {
            card.files.insert(fid, content);
        }
    }

    /// Read a file from the card in `reader`.
    pub fn card_file(&self, reader: &str, fid: u16) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state
            .readers
            .iter()
            .find(|r| r.name == reader)
            .and_then(|r| r.card.as_ref())
            .and_then(|c| c.files.get(&fid))
            .cloned()
    }

    /// Change the length of ECDSA signatures produced by the card.
    pub fn set_ecdsa_sig_len(&self, reader: &str, len: usize) {
        let mut state = self.state.lock();
        if let Some(card) = state
            .readers
            .iter_mut()
            .find(|r| r.name == reader)
            .and_then(|r| r.card.as_mut())
        {
            card.ecdsa_sig_len = len;
        }
    }
}

struct MockTransport {
    state: Arc<Mutex<HsmState>>,
}

impl ReaderTransport for MockTransport {
    fn list_readers(&self) -> Result<Vec<String>, TransportError> {
        let state = self.state.lock();
        if !state.service_up {
            return Err(TransportError::ServiceUnavailable);
        }
        Ok(state.readers.iter().map(|r| r.name.clone()).collect())
    }

    fn connect(&self, reader_name: &str) -> Result<Box<dyn CardConnection>, TransportError> {
        let state = self.state.lock();
        if !state.service_up {
            return Err(TransportError::ServiceUnavailable);
        }
        let reader = state
            .readers
            .iter()
            .find(|r| r.name == reader_name)
            .ok_or(TransportError::ReaderGone)?;
        let card = reader.card.as_ref().ok_or(TransportError::NoCard)?;
        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            reader_name: reader_name.to_string(),
            generation: card.generation,
            atr: card.atr.clone(),
            verify_pin_direct: reader.verify_pin_direct,
        }))
    }
}

struct MockConnection {
    state: Arc<Mutex<HsmState>>,
    reader_name: String,
    generation: u64,
    atr: Vec<u8>,
    verify_pin_direct: u32,
}

impl MockConnection {
    fn with_card<R>(
        &self,
        f: impl FnOnce(&mut MockCard) -> R,
    ) -> Result<R, TransportError> {
        let mut state = self.state.lock();
        let reader = state
            .readers
            .iter_mut()
            .find(|r| r.name == self.reader_name)
            .ok_or(TransportError::ReaderGone)?;
        let card = reader.card.as_mut().ok_or(TransportError::CardRemoved)?;
        if card.generation != self.generation {
            return Err(TransportError::CardRemoved);
        }
        Ok(f(card))
    }
}

impl CardConnection for MockConnection {
    fn transmit(&mut self, capdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.with_card(|card| card.process(capdu))
    }

    fn status(&mut self) -> Result<(), TransportError> {
        self.with_card(|_| ())
    }

    fn atr(&self) -> &[u8] {
        &self.atr
    }

    fn features(&mut self) -> Result<ReaderFeatures, TransportError> {
        Ok(ReaderFeatures { verify_pin_direct: self.verify_pin_direct })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::{HsmChannel, Pin};
    use crate::template::{self, TemplateHeader, TEMPLATE_HEADER_LEN};

    fn connect(hsm: &MockHsm, reader: &str) -> Box<dyn CardConnection> {
        hsm.transport().connect(reader).unwrap()
    }

    #[test]
    fn select_and_pin_flow() {
        let hsm = MockHsm::builder().reader("r").build();
        let mut conn = connect(&hsm, "r");
        let mut channel = HsmChannel::new(conn.as_mut());
        channel.select_app().unwrap();
        let pin = Pin::user(DEFAULT_USER_PIN).unwrap();
        channel.verify_user_pin(&pin).unwrap();
    }

    #[test]
    fn wrong_pin_burns_tries_until_blocked() {
        let hsm = MockHsm::builder().reader("r").build();
        let mut conn = connect(&hsm, "r");
        let mut channel = HsmChannel::new(conn.as_mut());
        channel.select_app().unwrap();
        let wrong = Pin::user("000000").unwrap();
        assert_eq!(
            channel.verify_user_pin(&wrong).unwrap_err(),
            crate::CkError::PinIncorrect { tries_left: 2 }
        );
        assert_eq!(
            channel.verify_user_pin(&wrong).unwrap_err(),
            crate::CkError::PinIncorrect { tries_left: 1 }
        );
        assert_eq!(channel.verify_user_pin(&wrong).unwrap_err(), crate::CkError::PinLocked);

        // SO-PIN unblocks
        let so = Pin::security_officer(DEFAULT_SO_PIN).unwrap();
        channel.unlock_pin(&so).unwrap();
        let right = Pin::user(DEFAULT_USER_PIN).unwrap();
        channel.verify_user_pin(&right).unwrap();
    }

    #[test]
    fn enumerate_lists_provisioned_files() {
        let hsm = MockHsm::builder().reader("r").build();
        let mut conn = connect(&hsm, "r");
        let mut channel = HsmChannel::new(conn.as_mut());
        channel.select_app().unwrap();
        let dir = channel.enumerate_objects().unwrap();
        assert!(dir.contains(&(0xC4, 0x01)));
        assert!(dir.contains(&(0xCC, 0x01)));
        assert!(dir.contains(&(0xC9, 0x05)));
        assert!(dir.contains(&(0xCD, 0x05)));
    }

    #[test]
    fn key_files_are_never_readable() {
        let hsm = MockHsm::builder().reader("r").build();
        let mut conn = connect(&hsm, "r");
        let mut channel = HsmChannel::new(conn.as_mut());
        channel.select_app().unwrap();
        assert!(channel.read_file(0xCC01, 0, 16).is_err());
    }

    #[test]
    fn read_write_round_trip_with_eof() {
        let hsm = MockHsm::builder().reader("r").build();
        let mut conn = connect(&hsm, "r");
        let mut channel = HsmChannel::new(conn.as_mut());
        channel.select_app().unwrap();
        channel.write_file(0x2F01, 0, b"hello world").unwrap();
        assert_eq!(channel.read_file(0x2F01, 0, 5).unwrap(), b"hello");
        // reading past the end yields the tail with an end-of-file status
        assert_eq!(channel.read_file(0x2F01, 6, 64).unwrap(), b"world");
    }

    #[test]
    fn device_authentication_file_is_write_protected() {
        let hsm = MockHsm::builder().reader("r").build();
        let mut conn = connect(&hsm, "r");
        let mut channel = HsmChannel::new(conn.as_mut());
        channel.select_app().unwrap();
        assert!(channel.write_file(EF_DEV_AUT, 0, b"forged").is_err());
    }

    #[test]
    fn removal_is_visible_to_open_connections() {
        let hsm = MockHsm::builder().reader("r").build();
        let mut conn = connect(&hsm, "r");
        conn.status().unwrap();
        hsm.remove_card("r");
        assert_eq!(conn.status().unwrap_err(), TransportError::CardRemoved);

        // a new card is a different card, even for the old connection
        hsm.insert_default_card("r");
        assert_eq!(conn.status().unwrap_err(), TransportError::CardRemoved);

        hsm.unplug_reader("r");
        assert_eq!(conn.status().unwrap_err(), TransportError::ReaderGone);
    }

    #[test]
    fn descriptor_matches_label_walk() {
        let descriptor = descriptor_with_label("sign0");
        assert!(template::find_label("sign0", &descriptor));
        assert!(!template::find_label("other", &descriptor));
    }

    #[test]
    fn built_template_offsets_are_consistent() {
        for kind in [SignatureKind::Rsa2048, SignatureKind::EcdsaP256] {
            let file = build_template_file(kind, &[0xCE; 32]);
            let header = TemplateHeader::parse(&file[..TEMPLATE_HEADER_LEN]).unwrap();
            let envelope = &file[TEMPLATE_HEADER_LEN..];
            assert_eq!(envelope.len(), header.envelope_len as usize);
            assert_eq!(
                &envelope[header.signing_time_off as usize..][..13],
                b"130101000000Z"
            );
            assert_eq!(envelope[header.sig_attr_off as usize], 0xA0);
            assert_eq!(
                &envelope[header.cert_id_off as usize..][..32],
                &[0xCE; 32]
            );
            // signature octet-string wrapper sits right before the signature
            if kind == SignatureKind::EcdsaP256 {
                assert_eq!(envelope[header.signature_off as usize - 1], 72);
            }
        }
    }

    #[test]
    fn ecdsa_signature_lengths() {
        for len in [70, 71, 72] {
            let sig = ecdsa_der_signature(len);
            assert_eq!(sig.len(), len);
            assert_eq!(sig[0], 0x30);
            assert_eq!(sig[1] as usize, len - 2);
        }
    }
}
