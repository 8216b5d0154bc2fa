//! The template patching engine.
//!
//! Producing a detached CMS signature normally means assembling the whole
//! ASN.1 structure. For a fixed key and certificate the envelope only varies
//! in three places: the signing time, the message digest and the signature
//! itself. The engine therefore loads the pre-assembled envelope from the
//! card once and patches those three fields per sign, leaving a bit-for-bit
//! valid envelope after a single private-key primitive on the card.
//!
//! For RSA the signature size is constant and the padded PKCS#1 v1.5 block
//! is built in place. For ECDSA the card returns a DER signature of 70, 71
//! or 72 bytes, and every ancestor length field of the envelope is adjusted
//! downwards to match.
//!
//! [`TemplateSigner`] keeps a single-slot cache of the last template. The
//! cache survives across signs for the same label as long as the on-card
//! certificate id still matches; any mismatch or error drops it. The engine
//! is single-threaded by contract: callers serialise.

use chrono::{DateTime, Datelike, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::card::{HsmChannel, SIGN_OP_ECDSA, SIGN_OP_RSA_RAW};
use crate::template::{Result, Template, TemplateError};

/// DigestInfo prefix for SHA-256 in PKCS#1 v1.5 signatures:
/// `SEQUENCE { SEQUENCE { OID sha256, NULL }, OCTET STRING (32) }`.
pub const DIGEST_INFO_SHA256: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

const RSA_SIGNATURE_SIZE: u16 = 256;
const ECDSA_SIGNATURE_SIZE: u16 = 72;

/// Signing years are encoded with two digits; the envelope format holds
/// until the end of 2049.
const MIN_SIGNING_YEAR: i32 = 2013;
const MAX_SIGNING_YEAR_EXCLUSIVE: i32 = 2050;

// ============================================================================
// SIGNER
// ============================================================================

/// Template-based signer with a single-slot template cache.
#[derive(Debug, Default)]
pub struct TemplateSigner {
    cached: Option<Template>,
}

impl TemplateSigner {
    pub fn new() -> TemplateSigner {
        TemplateSigner::default()
    }

    /// The cached template, if any.
    pub fn cached(&self) -> Option<&Template> {
        self.cached.as_ref()
    }

    /// Drop the cached template.
    pub fn release(&mut self) {
        self.cached = None;
    }

    /// Sign a 32-byte document hash under `label`, returning the patched
    /// envelope.
    ///
    /// The returned slice borrows the internal envelope and is invalidated
    /// by the next call.
    pub fn sign_hash<'a>(
        &'a mut self,
        channel: &mut HsmChannel<'_>,
        label: &str,
        hash: &[u8],
    ) -> Result<&'a [u8]> {
        self.sign_hash_at(channel, label, hash, Utc::now())
    }

    /// [`Self::sign_hash`] with an explicit signing time.
    pub fn sign_hash_at<'a>(
        &'a mut self,
        channel: &mut HsmChannel<'_>,
        label: &str,
        hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<&'a [u8]> {
        if hash.len() != 32 {
            return Err(TemplateError::HashLenUnsupported(hash.len()));
        }

        if let Some(template) = self.cached.as_ref() {
            let reusable = template.label() == label
                && template.cert_id_current(channel).unwrap_or(false);
            if !reusable {
                debug!(label, "cached template stale, dropping");
                self.cached = None;
            }
        }
        if self.cached.is_none() {
            self.cached = Some(Template::load(channel, label)?);
        }
        let Some(template) = self.cached.as_mut() else {
            return Err(TemplateError::Malformed);
        };

        match patch_and_sign(template, channel, hash, now) {
            Ok(()) => {
                let Some(template) = self.cached.as_ref() else {
                    return Err(TemplateError::Malformed);
                };
                info!(label, len = template.envelope().len(), "envelope signed");
                Ok(template.envelope())
            }
            Err(e) => {
                // engine errors invalidate the cache
                self.cached = None;
                Err(e)
            }
        }
    }
}

fn patch_and_sign(
    template: &mut Template,
    channel: &mut HsmChannel<'_>,
    hash: &[u8],
    now: DateTime<Utc>,
) -> Result<()> {
    match template.header().signature_size {
        RSA_SIGNATURE_SIZE => patch_rsa(template, channel, hash, now),
        ECDSA_SIGNATURE_SIZE => patch_ecdsa(template, channel, hash, now),
        other => Err(TemplateError::UnsupportedKeySize(other as usize)),
    }
}

// ============================================================================
// PATCHING
// ============================================================================

/// Patch signing time and message digest, then hash the signed attributes.
///
/// The signed-attributes block is encoded `[0] IMPLICIT` inside the
/// envelope but must be hashed under its `SET` tag; the tag byte is swapped
/// for the duration of the hash and restored.
fn patch_signed_attributes(
    template: &mut Template,
    hash: &[u8],
    now: DateTime<Utc>,
) -> Result<[u8; 32]> {
    let header = *template.header();
    if !(MIN_SIGNING_YEAR..MAX_SIGNING_YEAR_EXCLUSIVE).contains(&now.year()) {
        return Err(TemplateError::TimeOutOfRange);
    }
    let signing_time = now.format("%y%m%d%H%M%SZ").to_string();

    let time_off = header.signing_time_off as usize;
    template.cms[time_off..time_off + 13].copy_from_slice(signing_time.as_bytes());

    let digest_off = header.msg_digest_off as usize;
    template.cms[digest_off..digest_off + 32].copy_from_slice(hash);

    let attr_off = header.sig_attr_off as usize;
    let attr_len = header.sig_attr_len as usize;
    let old_tag = template.cms[attr_off];
    template.cms[attr_off] = 0x31; // SET for the hash
    let digest = Sha256::digest(&template.cms[attr_off..attr_off + attr_len]);
    template.cms[attr_off] = old_tag;

    Ok(digest.into())
}

/// RSA: build the PKCS#1 v1.5 block in place and run the raw private-key
/// operation. Input and output share the signature area of the envelope.
fn patch_rsa(
    template: &mut Template,
    channel: &mut HsmChannel<'_>,
    hash: &[u8],
    now: DateTime<Utc>,
) -> Result<()> {
    let attrs_hash = patch_signed_attributes(template, hash, now)?;
    let header = *template.header();
    let sig_off = header.signature_off as usize;
    let sig_size = header.signature_size as usize;

    // 0x00 0x01 0xFF..0xFF 0x00 DigestInfo hash, sized to the modulus
    let block = &mut template.cms[sig_off..sig_off + sig_size];
    let mut ix = sig_size;
    ix -= 32;
    block[ix..ix + 32].copy_from_slice(&attrs_hash);
    ix -= DIGEST_INFO_SHA256.len();
    block[ix..ix + DIGEST_INFO_SHA256.len()].copy_from_slice(&DIGEST_INFO_SHA256);
    ix -= 1;
    block[ix] = 0x00;
    for byte in block[2..ix].iter_mut() {
        *byte = 0xFF;
    }
    block[1] = 0x01;
    block[0] = 0x00;

    let padded = template.cms[sig_off..sig_off + sig_size].to_vec();
    let signature = channel.sign(
        template.key_fid() as u8,
        SIGN_OP_RSA_RAW,
        &padded,
        sig_size,
    )?;
    if signature.len() != sig_size {
        return Err(TemplateError::UnsupportedKeySize(signature.len()));
    }
    template.cms[sig_off..sig_off + sig_size].copy_from_slice(&signature);
    Ok(())
}

/// ECDSA: sign the attributes hash and fix the envelope lengths up for the
/// variable DER signature size.
fn patch_ecdsa(
    template: &mut Template,
    channel: &mut HsmChannel<'_>,
    hash: &[u8],
    now: DateTime<Utc>,
) -> Result<()> {
    restore_lengths(template)?;
    let attrs_hash = patch_signed_attributes(template, hash, now)?;
    let header = *template.header();
    let sig_off = header.signature_off as usize;
    let sig_size = header.signature_size as usize;

    let signature = channel.sign(template.key_fid() as u8, SIGN_OP_ECDSA, &attrs_hash, sig_size)?;
    if !(70..=72).contains(&signature.len()) {
        return Err(TemplateError::UnsupportedKeySize(signature.len()));
    }
    template.cms[sig_off..sig_off + signature.len()].copy_from_slice(&signature);

    let delta = (sig_size - signature.len()) as i32;
    if delta > 0 {
        adjust_envelope_lengths(&mut template.cms, sig_off, delta)?;
        template.envelope_len -= delta as usize;
    }
    Ok(())
}

/// Undo a previous fix-up so repeated signs always start from the loaded
/// envelope geometry.
fn restore_lengths(template: &mut Template) -> Result<()> {
    let loaded = template.header().envelope_len as usize;
    if template.envelope_len < loaded {
        let grow = (loaded - template.envelope_len) as i32;
        let sig_off = template.header().signature_off as usize;
        adjust_envelope_lengths(&mut template.cms, sig_off, -grow)?;
        template.envelope_len = loaded;
    }
    Ok(())
}

/// Walk the envelope from the top and shrink every length field that
/// contains the signature by `delta` (negative `delta` grows them back).
///
/// The walk pins the exact tag sequence of the envelope; any other tag
/// means the template does not have the expected shape.
fn adjust_envelope_lengths(cms: &mut [u8], signature_off: usize, delta: i32) -> Result<()> {
    fn tag_at(cms: &[u8], p: usize, want: &[u8]) -> Result<()> {
        if p + want.len() > cms.len() || &cms[p..p + want.len()] != want {
            return Err(TemplateError::Malformed);
        }
        Ok(())
    }
    fn adjust16(cms: &mut [u8], p: usize, delta: i32) -> Result<()> {
        if p + 4 > cms.len() {
            return Err(TemplateError::Malformed);
        }
        let l = (i32::from(cms[p + 2]) << 8 | i32::from(cms[p + 3])) - delta;
        cms[p + 2] = (l >> 8) as u8;
        cms[p + 3] = l as u8;
        Ok(())
    }
    fn skip_short(cms: &[u8], p: usize, tag: u8) -> Result<usize> {
        if p + 2 > cms.len() || cms[p] != tag {
            return Err(TemplateError::Malformed);
        }
        Ok(p + 2 + cms[p + 1] as usize)
    }

    let mut p = 0usize;

    // outer SEQUENCE
    tag_at(cms, p, &[0x30, 0x82])?;
    adjust16(cms, p, delta)?;
    p += 4;

    // content-type OID
    if p + 2 > cms.len() || cms[p] != 0x06 {
        return Err(TemplateError::Malformed);
    }
    p += 2 + cms[p + 1] as usize;

    // [0] EXPLICIT content
    tag_at(cms, p, &[0xA0, 0x82])?;
    adjust16(cms, p, delta)?;
    p += 4;

    // SignedData SEQUENCE
    tag_at(cms, p, &[0x30, 0x82])?;
    adjust16(cms, p, delta)?;
    p += 4;

    // version INTEGER, digest algorithms SET, encapsulated content SEQUENCE
    p = skip_short(cms, p, 0x02)?;
    p = skip_short(cms, p, 0x31)?;
    p = skip_short(cms, p, 0x30)?;

    // certificates [0]
    tag_at(cms, p, &[0xA0, 0x82])?;
    if p + 4 > cms.len() {
        return Err(TemplateError::Malformed);
    }
    p += 4 + ((cms[p + 2] as usize) << 8 | cms[p + 3] as usize);

    // signer-info SET, one-byte long form
    tag_at(cms, p, &[0x31, 0x81])?;
    if p + 3 > cms.len() {
        return Err(TemplateError::Malformed);
    }
    cms[p + 2] = (i32::from(cms[p + 2]) - delta) as u8;
    p += 3;

    // SignerInfo SEQUENCE, one-byte long form
    tag_at(cms, p, &[0x30, 0x81])?;
    cms[p + 2] = (i32::from(cms[p + 2]) - delta) as u8;

    // signature OCTET STRING wrapper directly before the signature
    if signature_off == 0 || signature_off > cms.len() {
        return Err(TemplateError::Malformed);
    }
    cms[signature_off - 1] = (i32::from(cms[signature_off - 1]) - delta) as u8;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{build_template_file, SignatureKind};
    use crate::template::{TemplateHeader, TEMPLATE_HEADER_LEN};

    fn template_from_file(file: &[u8]) -> Template {
        let header = TemplateHeader::parse(&file[..TEMPLATE_HEADER_LEN]).unwrap();
        Template {
            label: "sign0".to_string(),
            key_fid: 0xCC01,
            template_fid: 0xCD05,
            header,
            cms: file[TEMPLATE_HEADER_LEN..].to_vec(),
            envelope_len: header.envelope_len as usize,
        }
    }

    #[test]
    fn built_template_passes_header_validation() {
        for kind in [SignatureKind::Rsa2048, SignatureKind::EcdsaP256] {
            let file = build_template_file(kind, &[0xCE; 32]);
            TemplateHeader::parse(&file[..TEMPLATE_HEADER_LEN]).unwrap();
        }
    }

    #[test]
    fn signed_attributes_patch_writes_time_and_digest() {
        let file = build_template_file(SignatureKind::Rsa2048, &[0xCE; 32]);
        let mut template = template_from_file(&file);
        let hash = [0x5Au8; 32];
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:34:56Z")
            .unwrap()
            .with_timezone(&Utc);

        let attrs_hash = patch_signed_attributes(&mut template, &hash, now).unwrap();

        let h = *template.header();
        let time = &template.cms[h.signing_time_off as usize..][..13];
        assert_eq!(time, b"260801123456Z");
        let digest = &template.cms[h.msg_digest_off as usize..][..32];
        assert_eq!(digest, &hash);

        // the attributes were hashed under a SET tag, and the envelope tag
        // was restored afterwards
        assert_eq!(template.cms[h.sig_attr_off as usize], 0xA0);
        let mut reference = template.cms[h.sig_attr_off as usize..][..h.sig_attr_len as usize].to_vec();
        reference[0] = 0x31;
        let expected: [u8; 32] = Sha256::digest(&reference).into();
        assert_eq!(attrs_hash, expected);
    }

    #[test]
    fn signing_time_year_bounds() {
        let file = build_template_file(SignatureKind::Rsa2048, &[0xCE; 32]);
        let mut template = template_from_file(&file);
        let hash = [0u8; 32];
        for (ts, ok) in [
            ("1999-12-31T23:59:59Z", false),
            ("2013-01-01T00:00:00Z", true),
            ("2049-12-31T23:59:59Z", true),
            ("2050-01-01T00:00:00Z", false),
        ] {
            let now = DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc);
            let result = patch_signed_attributes(&mut template, &hash, now);
            assert_eq!(result.is_ok(), ok, "timestamp {ts}");
            if !ok {
                assert_eq!(result.unwrap_err(), TemplateError::TimeOutOfRange);
            }
        }
    }

    #[test]
    fn length_fixup_round_trips() {
        let file = build_template_file(SignatureKind::EcdsaP256, &[0xCE; 32]);
        let mut template = template_from_file(&file);
        let pristine = template.cms.clone();
        let sig_off = template.header().signature_off as usize;

        adjust_envelope_lengths(&mut template.cms, sig_off, 2).unwrap();
        assert_ne!(template.cms, pristine);
        adjust_envelope_lengths(&mut template.cms, sig_off, -2).unwrap();
        assert_eq!(template.cms, pristine);
    }

    #[test]
    fn length_fixup_rejects_unexpected_tags() {
        let file = build_template_file(SignatureKind::EcdsaP256, &[0xCE; 32]);
        let mut template = template_from_file(&file);
        template.cms[0] = 0x31;
        let sig_off = template.header().signature_off as usize;
        assert_eq!(
            adjust_envelope_lengths(&mut template.cms, sig_off, 2).unwrap_err(),
            TemplateError::Malformed
        );
    }
}
