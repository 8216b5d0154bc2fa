//! SmartCard-HSM command set.
//!
//! [`HsmChannel`] frames the card commands the rest of the crate needs over
//! a borrowed [`CardConnection`]: application selection, PIN verification,
//! elementary-file I/O, object enumeration, the two signature primitives and
//! the administrative commands used by `schsm-tool`.
//!
//! Elementary files are addressed by a 16-bit identifier whose high byte
//! selects the file family and whose low byte is the local name. Families
//! with a shared low byte belong together (a data file and its descriptor).

use tracing::{debug, trace};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::apdu::{self, StatusWord, MAX_TRANSPORT_PAYLOAD};
use crate::error::{CkError, Result};
use crate::reader::CardConnection;

/// Application identifier of the SmartCard-HSM applet:
/// iso(1) org(3) dod(6) internet(1) private(4) enterprise(1)
/// CardContact(24991) iso7816(2) smartcardhsm(1).
pub const HSM_AID: [u8; 11] = [
    0xE8, 0x2B, 0x06, 0x01, 0x04, 0x01, 0x81, 0xC3, 0x1F, 0x02, 0x01,
];

/// File families used by the signing core.
pub const FAMILY_PRIVATE_KEY: u8 = 0xCC;
pub const FAMILY_KEY_DESCRIPTOR: u8 = 0xC4;
pub const FAMILY_DATA_OBJECT: u8 = 0xCD;
pub const FAMILY_DATA_DESCRIPTOR: u8 = 0xC9;

/// Device-authentication file: written at manufacturing, never writable.
pub const EF_DEV_AUT: u16 = 0x2F02;

/// Sign-operation selectors (P2 of the SIGN command).
pub const SIGN_OP_RSA_RAW: u8 = 0x20;
pub const SIGN_OP_ECDSA: u8 = 0x70;

/// PIN reference identifiers (P2 of VERIFY / CHANGE REFERENCE DATA).
const REF_USER_PIN: u8 = 0x81;
const REF_SO_PIN: u8 = 0x88;

// ============================================================================
// PIN MATERIAL
// ============================================================================

/// PIN bytes, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Pin(Vec<u8>);

impl Pin {
    /// A user PIN: 6 to 16 characters.
    pub fn user(pin: &str) -> Result<Pin> {
        if !(6..=16).contains(&pin.len()) {
            return Err(CkError::PinLenRange);
        }
        Ok(Pin(pin.as_bytes().to_vec()))
    }

    /// An SO-PIN: exactly 16 hex digits, decoded to 8 bytes.
    pub fn security_officer(so_pin: &str) -> Result<Pin> {
        if so_pin.len() != 16 {
            return Err(CkError::PinLenRange);
        }
        let bytes = hex::decode(so_pin).map_err(|_| CkError::ArgumentsBad)?;
        Ok(Pin(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never echo PIN material
        write!(f, "Pin(<{} bytes>)", self.0.len())
    }
}

// ============================================================================
// CHANNEL
// ============================================================================

/// Card command framing over one connection.
///
/// Obtained from a locked slot (the borrow ties every card I/O to the held
/// slot lock) or directly from a standalone connection in the signer path.
pub struct HsmChannel<'a> {
    conn: &'a mut dyn CardConnection,
}

impl<'a> HsmChannel<'a> {
    pub fn new(conn: &'a mut dyn CardConnection) -> Self {
        HsmChannel { conn }
    }

    /// Encode, transmit and split one APDU.
    ///
    /// `0x6Cxx` (response larger than the supplied buffer) is surfaced as
    /// [`CkError::BufferTooSmall`]; every other status word is handed to the
    /// caller for command-specific interpretation.
    pub fn transmit(
        &mut self,
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        data: &[u8],
        le: Option<usize>,
    ) -> Result<(Vec<u8>, StatusWord)> {
        let capdu =
            apdu::encode_command(cla, ins, p1, p2, data, le).map_err(|_| CkError::ArgumentsBad)?;
        if ins == 0x20 {
            trace!(cla, ins, p1, p2, "C-APDU (VERIFY, body withheld)");
        } else {
            trace!(cla, ins, p1, p2, lc = data.len(), "C-APDU {}", hex::encode(&capdu));
        }
        let rapdu = self.conn.transmit(&capdu).map_err(CkError::from)?;
        let (body, sw) = apdu::decode_response(&rapdu).map_err(|_| CkError::DeviceError)?;
        trace!(lr = body.len(), %sw, "R-APDU");
        if sw.is_wrong_le() {
            return Err(CkError::BufferTooSmall);
        }
        if let Some(expected) = le {
            if body.len() > expected {
                // the transport must never hand back more than was asked for
                return Err(CkError::DeviceError);
            }
        }
        Ok((body.to_vec(), sw))
    }

    /// SELECT the SmartCard-HSM application.
    pub fn select_app(&mut self) -> Result<()> {
        let (_, sw) = self.transmit(0x00, 0xA4, 0x04, 0x0C, &HSM_AID, None)?;
        if !sw.is_ok() {
            debug!(%sw, "applet selection rejected");
            return Err(CkError::TokenNotRecognized);
        }
        Ok(())
    }

    /// VERIFY the user PIN.
    pub fn verify_user_pin(&mut self, pin: &Pin) -> Result<()> {
        self.verify_pin(REF_USER_PIN, pin)
    }

    /// VERIFY the SO-PIN.
    pub fn verify_so_pin(&mut self, pin: &Pin) -> Result<()> {
        self.verify_pin(REF_SO_PIN, pin)
    }

    fn verify_pin(&mut self, reference: u8, pin: &Pin) -> Result<()> {
        let (_, sw) = self.transmit(0x00, 0x20, 0x00, reference, pin.as_bytes(), None)?;
        classify_pin_status(sw)
    }

    /// VERIFY with an empty body: probes the PIN state without consuming an
    /// attempt. Returns the raw status word.
    pub fn pin_status(&mut self) -> Result<StatusWord> {
        let (_, sw) = self.transmit(0x00, 0x20, 0x00, REF_USER_PIN, &[], None)?;
        Ok(sw)
    }

    /// Drop card authentication state by re-selecting the application.
    pub fn logout(&mut self) -> Result<()> {
        self.select_app()
    }

    /// ENUMERATE OBJECTS: the on-card object directory as (family, name)
    /// pairs.
    pub fn enumerate_objects(&mut self) -> Result<Vec<(u8, u8)>> {
        let (body, sw) = self.transmit(0x80, 0x58, 0x00, 0x00, &[], Some(256))?;
        if !sw.is_file_ok() {
            return Err(CkError::DeviceError);
        }
        Ok(body.chunks_exact(2).map(|c| (c[0], c[1])).collect())
    }

    /// READ BINARY: up to `len` bytes of file `fid` starting at `off`.
    /// A short result means the end of the file was reached.
    pub fn read_file(&mut self, fid: u16, off: u16, len: usize) -> Result<Vec<u8>> {
        if len > MAX_TRANSPORT_PAYLOAD {
            return Err(CkError::ArgumentsBad);
        }
        let off_tlv = [0x54, 0x02, (off >> 8) as u8, off as u8];
        let (body, sw) = self.transmit(
            0x00,
            0xB1,
            (fid >> 8) as u8,
            fid as u8,
            &off_tlv,
            Some(len),
        )?;
        if !sw.is_file_ok() {
            return Err(CkError::DeviceError);
        }
        Ok(body)
    }

    /// UPDATE BINARY: write `data` into file `fid` at `off`.
    pub fn write_file(&mut self, fid: u16, off: u16, data: &[u8]) -> Result<()> {
        if data.len() > MAX_TRANSPORT_PAYLOAD - 6 {
            return Err(CkError::ArgumentsBad);
        }
        let mut body = Vec::with_capacity(6 + data.len());
        body.extend_from_slice(&[0x54, 0x02, (off >> 8) as u8, off as u8, 0x53, 0x00]);
        body.extend_from_slice(data);
        let (_, sw) = self.transmit(0x00, 0xD7, (fid >> 8) as u8, fid as u8, &body, None)?;
        if !sw.is_ok() {
            return Err(CkError::DeviceError);
        }
        Ok(())
    }

    /// SIGN: run the selected private-key primitive on `data`.
    ///
    /// `op` is [`SIGN_OP_RSA_RAW`] (input is the padded block, output has the
    /// same size) or [`SIGN_OP_ECDSA`] (input is the hash, output is a DER
    /// signature of variable length).
    pub fn sign(&mut self, key_name: u8, op: u8, data: &[u8], expected: usize) -> Result<Vec<u8>> {
        let (body, sw) = self.transmit(0x80, 0x68, key_name, op, data, Some(expected))?;
        if !sw.is_file_ok() {
            debug!(%sw, key_name, op, "sign command rejected");
            return Err(CkError::DeviceError);
        }
        Ok(body)
    }

    // ------------------------------------------------------------------------
    // Administrative commands (schsm-tool)
    // ------------------------------------------------------------------------

    /// INITIALIZE DEVICE followed by the import of any DKEK shares.
    ///
    /// Returns, per imported share, (total shares, outstanding shares, key
    /// check value).
    pub fn initialize_device(
        &mut self,
        pin: &Pin,
        so_pin: &Pin,
        dkek_shares: &[[u8; 32]],
    ) -> Result<Vec<DkekShareStatus>> {
        let mut body = Vec::new();
        // configuration options (currently fixed)
        body.extend_from_slice(&[0x80, 0x02, 0x00, 0x01]);
        body.push(0x81);
        body.push(pin.as_bytes().len() as u8);
        body.extend_from_slice(pin.as_bytes());
        // initialization code == SO-PIN
        body.extend_from_slice(&[0x82, 0x08]);
        body.extend_from_slice(so_pin.as_bytes());
        // retry counter initial value
        body.extend_from_slice(&[0x91, 0x01, 0x03]);
        if !dkek_shares.is_empty() {
            body.extend_from_slice(&[0x92, 0x01, dkek_shares.len() as u8]);
        }
        let (_, sw) = self.transmit(0x80, 0x50, 0x00, 0x00, &body, None)?;
        if !sw.is_ok() {
            return Err(CkError::DeviceError);
        }

        let mut statuses = Vec::new();
        for share in dkek_shares {
            let (buf, sw) = self.transmit(0x80, 0x52, 0x00, 0x00, share, Some(10))?;
            if !sw.is_ok() || buf.len() < 10 {
                return Err(CkError::DeviceError);
            }
            let mut kcv = [0u8; 8];
            kcv.copy_from_slice(&buf[2..10]);
            statuses.push(DkekShareStatus {
                total_shares: buf[0],
                outstanding_shares: buf[1],
                key_check_value: kcv,
            });
        }
        Ok(statuses)
    }

    /// RESET RETRY COUNTER using the SO-PIN only (unblocks the user PIN).
    pub fn unlock_pin(&mut self, so_pin: &Pin) -> Result<()> {
        let (_, sw) = self.transmit(0x00, 0x2C, 0x01, REF_USER_PIN, so_pin.as_bytes(), None)?;
        classify_pin_status(sw)
    }

    /// RESET RETRY COUNTER, setting a new user PIN with the SO-PIN.
    pub fn set_pin(&mut self, so_pin: &Pin, new_pin: &Pin) -> Result<()> {
        let mut body = Vec::with_capacity(8 + new_pin.as_bytes().len());
        body.extend_from_slice(so_pin.as_bytes());
        body.extend_from_slice(new_pin.as_bytes());
        let (_, sw) = self.transmit(0x00, 0x2C, 0x00, REF_USER_PIN, &body, None)?;
        body.zeroize();
        classify_pin_status(sw)
    }

    /// CHANGE REFERENCE DATA for the user PIN. Old and new must have the
    /// same length.
    pub fn change_pin(&mut self, old: &Pin, new: &Pin) -> Result<()> {
        if old.as_bytes().len() != new.as_bytes().len() {
            return Err(CkError::PinLenRange);
        }
        let mut body = Vec::with_capacity(old.as_bytes().len() * 2);
        body.extend_from_slice(old.as_bytes());
        body.extend_from_slice(new.as_bytes());
        let (_, sw) = self.transmit(0x00, 0x24, 0x00, REF_USER_PIN, &body, None)?;
        body.zeroize();
        classify_pin_status(sw)
    }

    /// CHANGE REFERENCE DATA for the SO-PIN.
    pub fn change_so_pin(&mut self, old: &Pin, new: &Pin) -> Result<()> {
        let mut body = Vec::with_capacity(16);
        body.extend_from_slice(old.as_bytes());
        body.extend_from_slice(new.as_bytes());
        let (_, sw) = self.transmit(0x00, 0x24, 0x00, REF_SO_PIN, &body, None)?;
        body.zeroize();
        classify_pin_status(sw)
    }

    /// WRAP KEY: export key `key_id` under the device encryption key.
    pub fn wrap_key(&mut self, key_id: u8) -> Result<Vec<u8>> {
        check_key_id(key_id)?;
        let (body, sw) = self.transmit(0x80, 0x72, key_id, 0x92, &[], Some(1024))?;
        if !sw.is_ok() {
            return Err(CkError::DeviceError);
        }
        Ok(body)
    }

    /// UNWRAP KEY: import wrapped key material as key `key_id`.
    pub fn unwrap_key(&mut self, key_id: u8, wrapped: &[u8]) -> Result<()> {
        check_key_id(key_id)?;
        if wrapped.is_empty() {
            return Err(CkError::ArgumentsBad);
        }
        let (_, sw) = self.transmit(0x80, 0x74, key_id, 0x93, wrapped, None)?;
        if !sw.is_ok() {
            return Err(CkError::DeviceError);
        }
        Ok(())
    }
}

/// Result of importing one device-encryption-key share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DkekShareStatus {
    pub total_shares: u8,
    pub outstanding_shares: u8,
    pub key_check_value: [u8; 8],
}

fn check_key_id(key_id: u8) -> Result<()> {
    if (1..=127).contains(&key_id) {
        Ok(())
    } else {
        Err(CkError::ArgumentsBad)
    }
}

/// Map a PIN-command status word onto the API error catalogue.
fn classify_pin_status(sw: StatusWord) -> Result<()> {
    if sw.is_ok() {
        return Ok(());
    }
    if let Some(tries_left) = sw.pin_tries_left() {
        return Err(CkError::PinIncorrect { tries_left });
    }
    match sw {
        StatusWord::AUTH_METHOD_BLOCKED => Err(CkError::PinLocked),
        StatusWord::WRONG_LENGTH => Err(CkError::PinLenRange),
        _ => Err(CkError::DeviceError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_format_rules() {
        assert!(Pin::user("12345").is_err());
        assert!(Pin::user("648219").is_ok());
        assert!(Pin::user("0123456789abcdef").is_ok());
        assert!(Pin::user("0123456789abcdef0").is_err());
        assert!(Pin::security_officer("3537363231383830").is_ok());
        assert!(Pin::security_officer("35373632313838").is_err());
        assert!(Pin::security_officer("zz37363231383830").is_err());
    }

    #[test]
    fn so_pin_decodes_to_binary() {
        let pin = Pin::security_officer("3537363231383830").unwrap();
        assert_eq!(pin.as_bytes(), b"57621880");
    }

    #[test]
    fn pin_status_classification() {
        assert_eq!(classify_pin_status(StatusWord::OK), Ok(()));
        assert_eq!(
            classify_pin_status(StatusWord(0x63C2)),
            Err(CkError::PinIncorrect { tries_left: 2 })
        );
        assert_eq!(classify_pin_status(StatusWord(0x6982)), Err(CkError::PinLocked));
        assert_eq!(classify_pin_status(StatusWord(0x6700)), Err(CkError::PinLenRange));
        assert_eq!(classify_pin_status(StatusWord(0x6F00)), Err(CkError::DeviceError));
    }

    #[test]
    fn key_id_bounds() {
        assert!(check_key_id(0).is_err());
        assert!(check_key_id(1).is_ok());
        assert!(check_key_id(127).is_ok());
        assert!(check_key_id(128).is_err());
    }
}
