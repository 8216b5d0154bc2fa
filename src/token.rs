//! Token state.
//!
//! A token is the recognised card inside a slot: authentication state, the
//! public and private object lists and the handle counter. It is created by
//! the detection path when a card with a known answer-to-reset appears and
//! destroyed with its slot or on removal.

use tracing::debug;

use crate::apdu::StatusWord;
use crate::card::{HsmChannel, Pin};
use crate::error::{CkError, Result};
use crate::object::{Object, ObjectHandle};
use crate::reader::ReaderFeatures;

/// Expected answer-to-reset values of the supported card revisions.
const KNOWN_ATRS: [[u8; 24]; 2] = [
    [
        0x3B, 0xFE, 0x18, 0x00, 0x00, 0x81, 0x31, 0xFE, 0x45, 0x80, 0x31, 0x81, 0x54, 0x48, 0x53,
        0x4D, 0x31, 0x73, 0x80, 0x21, 0x40, 0x81, 0x07, 0xFA,
    ],
    [
        0x3B, 0xDE, 0x96, 0xFF, 0x81, 0x91, 0xFE, 0x1F, 0xC3, 0x80, 0x31, 0x81, 0x54, 0x48, 0x53,
        0x4D, 0x31, 0x73, 0x80, 0x21, 0x40, 0x81, 0x07, 0x92,
    ],
];

/// Token capability flags.
pub mod flags {
    pub const WRITE_PROTECTED: u32 = 0x0000_0002;
    pub const LOGIN_REQUIRED: u32 = 0x0000_0004;
    pub const USER_PIN_INITIALIZED: u32 = 0x0000_0008;
    /// PIN entry happens on a reader-integrated pad.
    pub const PROTECTED_AUTHENTICATION_PATH: u32 = 0x0000_0100;
    pub const TOKEN_INITIALIZED: u32 = 0x0000_0400;
}

/// Authenticated user classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserType {
    /// Normal user: unlocks private objects and key use.
    User,
    /// Security officer: administrative functions.
    SecurityOfficer,
}

/// Descriptive token information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub flags: u32,
}

// ============================================================================
// TOKEN
// ============================================================================

#[derive(Debug)]
pub struct Token {
    pub info: TokenInfo,
    user_type: Option<UserType>,
    next_object_handle: ObjectHandle,
    public_objects: Vec<Object>,
    private_objects: Vec<Object>,
    sync_count: u64,
}

impl Token {
    /// Recognise the card behind `channel` and build its token state.
    ///
    /// Checks the answer-to-reset against the allow-list, selects the HSM
    /// application and probes the PIN status to learn whether the user PIN
    /// has been initialised. Reader features decide whether the token
    /// advertises a protected authentication path.
    pub fn detect(atr: &[u8], channel: &mut HsmChannel<'_>, features: ReaderFeatures) -> Result<Token> {
        if !KNOWN_ATRS.iter().any(|known| known.as_slice() == atr) {
            debug!(atr = %hex::encode(atr), "ATR not recognised");
            return Err(CkError::TokenNotRecognized);
        }
        channel.select_app()?;

        let mut token_flags = flags::TOKEN_INITIALIZED | flags::LOGIN_REQUIRED;
        let pin_status = channel.pin_status()?;
        if pin_status != StatusWord::REFERENCE_DATA_NOT_FOUND {
            token_flags |= flags::USER_PIN_INITIALIZED;
        }
        if features.verify_pin_direct != 0 {
            debug!("reader verifies PINs directly, advertising protected authentication path");
            token_flags |= flags::PROTECTED_AUTHENTICATION_PATH;
        }

        Ok(Token {
            info: TokenInfo {
                label: "SmartCard-HSM".to_string(),
                manufacturer: "CardContact".to_string(),
                model: "SmartCard-HSM".to_string(),
                flags: token_flags,
            },
            user_type: None,
            next_object_handle: 1,
            public_objects: Vec::new(),
            private_objects: Vec::new(),
            sync_count: 0,
        })
    }

    /// Construct token state directly (detection bypass for tests).
    pub fn with_flags(token_flags: u32) -> Token {
        Token {
            info: TokenInfo {
                label: "SmartCard-HSM".to_string(),
                manufacturer: "CardContact".to_string(),
                model: "SmartCard-HSM".to_string(),
                flags: token_flags,
            },
            user_type: None,
            next_object_handle: 1,
            public_objects: Vec::new(),
            private_objects: Vec::new(),
            sync_count: 0,
        }
    }

    pub fn user_type(&self) -> Option<UserType> {
        self.user_type
    }

    pub fn user_pin_initialized(&self) -> bool {
        self.info.flags & flags::USER_PIN_INITIALIZED != 0
    }

    // ------------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------------

    /// Verify the PIN for `user_type` on the card and record the login.
    ///
    /// Preconditions (no prior login, PIN initialised, session-flag rules)
    /// are checked by the caller; this only drives the card.
    pub fn log_in(
        &mut self,
        channel: &mut HsmChannel<'_>,
        user_type: UserType,
        pin: &Pin,
    ) -> Result<()> {
        match user_type {
            UserType::User => channel.verify_user_pin(pin)?,
            UserType::SecurityOfficer => channel.verify_so_pin(pin)?,
        }
        self.user_type = Some(user_type);
        Ok(())
    }

    /// Clear the login state, drop all private objects and reset the card's
    /// security environment.
    pub fn log_out(&mut self, channel: &mut HsmChannel<'_>) -> Result<()> {
        self.user_type = None;
        self.private_objects.clear();
        channel.logout()
    }

    /// Drop login state without touching the card (card already gone).
    pub fn clear_authentication(&mut self) {
        self.user_type = None;
        self.private_objects.clear();
    }

    // ------------------------------------------------------------------------
    // Object lists
    // ------------------------------------------------------------------------

    /// Link an object, assigning a fresh handle unless it already has one.
    /// Returns the object's handle.
    pub fn add_object(&mut self, mut object: Object, public: bool) -> ObjectHandle {
        if object.handle == 0 {
            object.handle = self.next_object_handle;
            self.next_object_handle = self.next_object_handle.wrapping_add(1);
            if self.next_object_handle == 0 {
                self.next_object_handle = 1;
            }
        }
        object.dirty = true;
        object.public_obj = public;
        let handle = object.handle;
        if public {
            self.public_objects.push(object);
        } else {
            self.private_objects.push(object);
        }
        handle
    }

    pub fn find_object(&self, handle: ObjectHandle, public: bool) -> Option<&Object> {
        self.list(public).iter().find(|o| o.handle == handle)
    }

    pub fn find_object_mut(&mut self, handle: ObjectHandle, public: bool) -> Option<&mut Object> {
        self.list_mut(public).iter_mut().find(|o| o.handle == handle)
    }

    /// Unlink an object, returning it to the caller.
    pub fn take_object(&mut self, handle: ObjectHandle, public: bool) -> Option<Object> {
        let list = self.list_mut(public);
        let pos = list.iter().position(|o| o.handle == handle)?;
        Some(list.remove(pos))
    }

    pub fn public_objects(&self) -> &[Object] {
        &self.public_objects
    }

    pub fn private_objects(&self) -> &[Object] {
        &self.private_objects
    }

    /// Persist dirty token objects.
    ///
    /// Object provisioning formats are owned by external tooling; this
    /// clears the dirty flags and counts the synchronisation for
    /// diagnostics.
    pub fn synchronize(&mut self) -> Result<()> {
        for object in self.public_objects.iter_mut().chain(self.private_objects.iter_mut()) {
            object.dirty = false;
        }
        self.sync_count += 1;
        Ok(())
    }

    /// Number of synchronisations performed since detection.
    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }

    fn list(&self, public: bool) -> &Vec<Object> {
        if public {
            &self.public_objects
        } else {
            &self.private_objects
        }
    }

    fn list_mut(&mut self, public: bool) -> &mut Vec<Object> {
        if public {
            &mut self.public_objects
        } else {
            &mut self.private_objects
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{attr, class, Attribute};

    fn data_object(label: &[u8]) -> Object {
        Object::data_from_template(&[
            Attribute::class(class::DATA),
            Attribute::new(attr::LABEL, label.to_vec()),
        ])
        .unwrap()
    }

    #[test]
    fn handles_are_unique_across_lists() {
        let mut token = Token::with_flags(flags::USER_PIN_INITIALIZED);
        let a = token.add_object(data_object(b"a"), true);
        let b = token.add_object(data_object(b"b"), false);
        let c = token.add_object(data_object(b"c"), true);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert!(token.find_object(a, true).is_some());
        assert!(token.find_object(b, false).is_some());
        assert!(token.find_object(b, true).is_none());
    }

    #[test]
    fn handle_counter_skips_zero_on_wrap() {
        let mut token = Token::with_flags(0);
        token.next_object_handle = u64::MAX;
        let last = token.add_object(data_object(b"x"), true);
        assert_eq!(last, u64::MAX);
        let wrapped = token.add_object(data_object(b"y"), true);
        assert_eq!(wrapped, 1);
    }

    #[test]
    fn clearing_authentication_drops_private_objects() {
        let mut token = Token::with_flags(flags::USER_PIN_INITIALIZED);
        token.add_object(data_object(b"pub"), true);
        token.add_object(data_object(b"priv"), false);
        token.clear_authentication();
        assert_eq!(token.public_objects().len(), 1);
        assert!(token.private_objects().is_empty());
        assert_eq!(token.user_type(), None);
    }

    #[test]
    fn synchronize_clears_dirty_and_counts() {
        let mut token = Token::with_flags(0);
        let h = token.add_object(data_object(b"a"), true);
        assert!(token.find_object(h, true).unwrap().dirty);
        token.synchronize().unwrap();
        assert!(!token.find_object(h, true).unwrap().dirty);
        assert_eq!(token.sync_count(), 1);
    }
}
