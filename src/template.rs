//! Signature-template discovery and loading.
//!
//! A signature template is a data-object file on the card holding a 20-byte
//! patch plan followed by a complete, pre-assembled detached CMS envelope.
//! The template belongs to the private key carrying the same label; the
//! label lives in the descriptor file paired with each data or key file.
//!
//! ## Discovery
//!
//! The object directory lists (family, name) pairs. For every private-key
//! entry the paired key descriptor is read and its label compared
//! byte-for-byte (case-sensitive); the same walk over the data-object
//! entries finds the template. Both halves must exist.
//!
//! ## Patch plan
//!
//! All header fields are big-endian on the card. Offsets address the
//! envelope, which starts at file offset 20.
//!
//! ```text
//! Version:u8      HeaderLen:u8
//! HashLen:u16     CertIdOff:u16
//! SigAttrOff:u16  SigAttrLen:u16
//! SigningTimeOff:u16
//! MsgDigestOff:u16
//! SignatureOff:u16  SignatureSize:u16
//! EnvelopeLen:u16
//! ```

use thiserror::Error;
use tracing::debug;

use crate::apdu::MAX_TRANSPORT_PAYLOAD;
use crate::card::{
    HsmChannel, FAMILY_DATA_DESCRIPTOR, FAMILY_DATA_OBJECT, FAMILY_KEY_DESCRIPTOR,
    FAMILY_PRIVATE_KEY,
};
use crate::error::CkError;

pub const TEMPLATE_VERSION: u8 = 0;
pub const TEMPLATE_HEADER_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("key '{0}' not found")]
    KeyNotFound(String),

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("template malformed")]
    Malformed,

    #[error("template version unsupported")]
    VersionUnsupported,

    #[error("unsupported key size {0}")]
    UnsupportedKeySize(usize),

    #[error("signing time out of range")]
    TimeOutOfRange,

    #[error("unsupported hash length {0}")]
    HashLenUnsupported(usize),

    #[error(transparent)]
    Card(#[from] CkError),
}

pub type Result<T> = std::result::Result<T, TemplateError>;

// ============================================================================
// HEADER
// ============================================================================

/// The parsed patch plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemplateHeader {
    pub version: u8,
    pub header_len: u8,
    pub hash_len: u16,
    pub cert_id_off: u16,
    pub sig_attr_off: u16,
    pub sig_attr_len: u16,
    pub signing_time_off: u16,
    pub msg_digest_off: u16,
    pub signature_off: u16,
    pub signature_size: u16,
    pub envelope_len: u16,
}

impl TemplateHeader {
    /// Parse and validate the 20-byte header.
    pub fn parse(raw: &[u8]) -> Result<TemplateHeader> {
        if raw.len() != TEMPLATE_HEADER_LEN {
            return Err(TemplateError::Malformed);
        }
        let be16 = |i: usize| u16::from(raw[i]) << 8 | u16::from(raw[i + 1]);
        let header = TemplateHeader {
            version: raw[0],
            header_len: raw[1],
            hash_len: be16(2),
            cert_id_off: be16(4),
            sig_attr_off: be16(6),
            sig_attr_len: be16(8),
            signing_time_off: be16(10),
            msg_digest_off: be16(12),
            signature_off: be16(14),
            signature_size: be16(16),
            envelope_len: be16(18),
        };
        if header.version != TEMPLATE_VERSION || header.header_len as usize != TEMPLATE_HEADER_LEN {
            return Err(TemplateError::VersionUnsupported);
        }
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        let sig_attr_off = u32::from(self.sig_attr_off);
        let sig_attr_end = sig_attr_off + u32::from(self.sig_attr_len);
        let signing_time_off = u32::from(self.signing_time_off);
        let msg_digest_off = u32::from(self.msg_digest_off);
        let signature_off = u32::from(self.signature_off);

        if self.hash_len != 32 {
            // only a 256-bit hash is supported
            return Err(TemplateError::Malformed);
        }
        if !(sig_attr_off > 0 && sig_attr_end < signature_off) {
            return Err(TemplateError::Malformed);
        }
        if !(sig_attr_off < signing_time_off && signing_time_off + 13 <= sig_attr_end) {
            return Err(TemplateError::Malformed);
        }
        if !(sig_attr_off < msg_digest_off
            && msg_digest_off + u32::from(self.hash_len) <= sig_attr_end)
        {
            return Err(TemplateError::Malformed);
        }
        if !(signature_off > 0
            && signature_off + u32::from(self.signature_size) <= u32::from(self.envelope_len))
        {
            return Err(TemplateError::Malformed);
        }
        Ok(())
    }

    /// Header in its on-card big-endian form.
    pub fn to_bytes(&self) -> [u8; TEMPLATE_HEADER_LEN] {
        let mut out = [0u8; TEMPLATE_HEADER_LEN];
        out[0] = self.version;
        out[1] = self.header_len;
        let mut put = |i: usize, v: u16| {
            out[i] = (v >> 8) as u8;
            out[i + 1] = v as u8;
        };
        put(2, self.hash_len);
        put(4, self.cert_id_off);
        put(6, self.sig_attr_off);
        put(8, self.sig_attr_len);
        put(10, self.signing_time_off);
        put(12, self.msg_digest_off);
        put(14, self.signature_off);
        put(16, self.signature_size);
        put(18, self.envelope_len);
        out
    }
}

// ============================================================================
// LABEL MATCHING
// ============================================================================

/// Walk a descriptor file's leading tag/length chain down to its first
/// UTF-8 text primitive and compare it with `label` byte-for-byte
/// (case-sensitive).
///
/// The chain is: an outer constructed element (sequence or context tag), an
/// inner sequence, then the text primitive. Labels of 128 bytes or more are
/// never matched.
pub(crate) fn find_label(label: &str, buf: &[u8]) -> bool {
    let mut ix = 0usize;

    for accepted in [[0x30u8, 0xA0], [0x30, 0x30]] {
        if ix >= buf.len() || (buf[ix] != accepted[0] && buf[ix] != accepted[1]) {
            return false;
        }
        ix += 1;
        if ix >= buf.len() {
            return false;
        }
        let len_byte = buf[ix] as usize;
        ix += 1;
        if len_byte >= 0x80 {
            // skip over the long-form length octets
            ix += len_byte & 0x7F;
        }
    }

    if ix >= buf.len() || buf[ix] != 0x0C {
        return false;
    }
    ix += 1;
    if ix >= buf.len() {
        return false;
    }
    let len = buf[ix] as usize;
    ix += 1;
    if len >= 0x80 {
        return false;
    }
    let end = ix + len;
    if end > buf.len() {
        return false;
    }
    &buf[ix..end] == label.as_bytes()
}

// ============================================================================
// DISCOVERY & LOADING
// ============================================================================

/// Find the (key fid, template fid) pair carrying `label`.
pub fn discover(channel: &mut HsmChannel<'_>, label: &str) -> Result<(u16, u16)> {
    let directory = channel.enumerate_objects()?;
    let key_fid = find_labelled(
        channel,
        &directory,
        FAMILY_PRIVATE_KEY,
        FAMILY_KEY_DESCRIPTOR,
        label,
    )
    .ok_or_else(|| TemplateError::KeyNotFound(label.to_string()))?;
    let template_fid = find_labelled(
        channel,
        &directory,
        FAMILY_DATA_OBJECT,
        FAMILY_DATA_DESCRIPTOR,
        label,
    )
    .ok_or_else(|| TemplateError::TemplateNotFound(label.to_string()))?;
    Ok((key_fid, template_fid))
}

fn find_labelled(
    channel: &mut HsmChannel<'_>,
    directory: &[(u8, u8)],
    data_family: u8,
    descriptor_family: u8,
    label: &str,
) -> Option<u16> {
    for &(family, name) in directory {
        if family != data_family {
            continue;
        }
        if !directory.contains(&(descriptor_family, name)) {
            continue;
        }
        let descriptor_fid = u16::from(descriptor_family) << 8 | u16::from(name);
        // an unreadable descriptor is skipped, not fatal
        let Ok(descriptor) = channel.read_file(descriptor_fid, 0, 256) else {
            continue;
        };
        if !descriptor.is_empty() && find_label(label, &descriptor) {
            return Some(u16::from(data_family) << 8 | u16::from(name));
        }
    }
    None
}

/// A loaded template: patch plan plus the in-memory envelope.
#[derive(Debug, Clone)]
pub struct Template {
    pub(crate) label: String,
    pub(crate) key_fid: u16,
    pub(crate) template_fid: u16,
    pub(crate) header: TemplateHeader,
    pub(crate) cms: Vec<u8>,
    /// Current envelope length; the ECDSA fix-up may shrink it below the
    /// header's value.
    pub(crate) envelope_len: usize,
}

impl Template {
    /// Discover, read and validate the template for `label`.
    pub fn load(channel: &mut HsmChannel<'_>, label: &str) -> Result<Template> {
        let (key_fid, template_fid) = discover(channel, label)?;

        let raw_header = channel.read_file(template_fid, 0, TEMPLATE_HEADER_LEN)?;
        if raw_header.len() != TEMPLATE_HEADER_LEN {
            debug!(label, "template header short read");
            return Err(TemplateError::Malformed);
        }
        let header = TemplateHeader::parse(&raw_header)?;

        let total = header.envelope_len as usize;
        let mut cms = Vec::with_capacity(total);
        while cms.len() < total {
            let chunk = (total - cms.len()).min(MAX_TRANSPORT_PAYLOAD);
            let off = TEMPLATE_HEADER_LEN + cms.len();
            let part = channel.read_file(template_fid, off as u16, chunk)?;
            if part.len() != chunk {
                debug!(label, off, chunk, got = part.len(), "template body short read");
                return Err(TemplateError::Malformed);
            }
            cms.extend_from_slice(&part);
        }
        debug!(label, key_fid, template_fid, envelope_len = total, "template loaded");
        Ok(Template {
            label: label.to_string(),
            key_fid,
            template_fid,
            header,
            cms,
            envelope_len: total,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn key_fid(&self) -> u16 {
        self.key_fid
    }

    pub fn template_fid(&self) -> u16 {
        self.template_fid
    }

    pub fn header(&self) -> &TemplateHeader {
        &self.header
    }

    /// The envelope in its current (possibly shrunk) length.
    pub fn envelope(&self) -> &[u8] {
        &self.cms[..self.envelope_len]
    }

    /// Re-read the certificate id from the card and compare with the loaded
    /// copy. A mismatch means the template was re-provisioned.
    pub fn cert_id_current(&self, channel: &mut HsmChannel<'_>) -> Result<bool> {
        let cert_off = self.header.cert_id_off as usize;
        if cert_off + 32 > self.cms.len() {
            return Ok(false);
        }
        let off = TEMPLATE_HEADER_LEN + cert_off;
        let on_card = channel.read_file(self.template_fid, off as u16, 32)?;
        Ok(on_card.len() == 32 && on_card == self.cms[cert_off..cert_off + 32])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> TemplateHeader {
        TemplateHeader {
            version: 0,
            header_len: 20,
            hash_len: 32,
            cert_id_off: 64,
            sig_attr_off: 200,
            sig_attr_len: 107,
            signing_time_off: 240,
            msg_digest_off: 270,
            signature_off: 400,
            signature_size: 72,
            envelope_len: 480,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = valid_header();
        let parsed = TemplateHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_rejects_wrong_version() {
        let mut header = valid_header();
        header.version = 1;
        assert_eq!(
            TemplateHeader::parse(&header.to_bytes()).unwrap_err(),
            TemplateError::VersionUnsupported
        );
        let mut header = valid_header();
        header.header_len = 24;
        assert_eq!(
            TemplateHeader::parse(&header.to_bytes()).unwrap_err(),
            TemplateError::VersionUnsupported
        );
    }

    #[test]
    fn header_rejects_bad_geometry() {
        let cases: Vec<fn(&mut TemplateHeader)> = vec![
            |h| h.hash_len = 20,
            |h| h.sig_attr_off = 0,
            |h| h.sig_attr_len = 300, // attrs run into the signature
            |h| h.signing_time_off = 150, // before the attrs
            |h| h.signing_time_off = 301, // time does not fit in the attrs
            |h| h.msg_digest_off = 290,   // digest does not fit in the attrs
            |h| h.signature_off = 0,
            |h| h.signature_size = 100, // signature exceeds the envelope
        ];
        for mutate in cases {
            let mut header = valid_header();
            mutate(&mut header);
            assert_eq!(
                TemplateHeader::parse(&header.to_bytes()).unwrap_err(),
                TemplateError::Malformed,
            );
        }
    }

    #[test]
    fn header_rejects_short_input() {
        assert_eq!(
            TemplateHeader::parse(&[0u8; 12]).unwrap_err(),
            TemplateError::Malformed
        );
    }

    fn descriptor(label: &str) -> Vec<u8> {
        let text: Vec<u8> = [&[0x0C, label.len() as u8], label.as_bytes()].concat();
        let inner: Vec<u8> = [&[0x30, text.len() as u8], text.as_slice()].concat();
        [&[0xA0, inner.len() as u8], inner.as_slice()].concat()
    }

    #[test]
    fn label_walk_matches_exactly() {
        let buf = descriptor("sign0");
        assert!(find_label("sign0", &buf));
        assert!(!find_label("Sign0", &buf), "labels are case sensitive");
        assert!(!find_label("sign", &buf));
        assert!(!find_label("sign00", &buf));
    }

    #[test]
    fn label_walk_rejects_malformed_chains() {
        assert!(!find_label("x", &[]));
        assert!(!find_label("x", &[0x04, 0x01, b'x']));
        // truncated after the outer element
        assert!(!find_label("x", &[0x30, 0x05]));
        // missing text primitive
        assert!(!find_label("x", &[0x30, 0x04, 0x30, 0x02, 0x02, 0x00]));
    }

    #[test]
    fn label_walk_skips_long_form_lengths() {
        // outer context tag with a long-form length
        let text: Vec<u8> = [&[0x0C, 1], b"x".as_slice()].concat();
        let inner: Vec<u8> = [&[0x30, text.len() as u8], text.as_slice()].concat();
        let mut buf = vec![0xA0, 0x81, inner.len() as u8];
        buf.extend_from_slice(&inner);
        assert!(find_label("x", &buf));
    }
}
