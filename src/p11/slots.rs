//! Slot, token and mechanism operations.

use std::sync::Arc;

use crate::error::{CkError, Result};
use crate::p11::{mech_flags, Mechanism, MechanismInfo, Module};
use crate::slot::{SlotId, SlotInfo};
use crate::token::TokenInfo;

/// Mechanisms reported by `get_mechanism_list`.
const MECHANISM_LIST: [Mechanism; 8] = [
    Mechanism::RsaX509,
    Mechanism::RsaPkcs,
    Mechanism::Sha1RsaPkcs,
    Mechanism::Sha256RsaPkcs,
    Mechanism::Sha1RsaPkcsPss,
    Mechanism::Sha256RsaPkcsPss,
    Mechanism::Ecdsa,
    Mechanism::EcdsaSha1,
];

impl Module {
    /// Enumerate slot ids, optionally restricted to slots currently holding
    /// a token. Runs a pool update first, so the result reflects the live
    /// reader set.
    pub fn get_slot_list(&self, token_present: bool) -> Result<Vec<SlotId>> {
        let ctx = self.ctx()?;
        ctx.slot_pool.update()?;

        let mut ids = Vec::new();
        for slot in ctx.slot_pool.slots() {
            if token_present {
                let Ok(mut guard) = ctx.slot_pool.find_and_lock(slot.id()) else {
                    continue;
                };
                let slot = Arc::clone(guard.slot());
                if guard.get_token(&slot).is_ok() {
                    ids.push(slot.id());
                }
            } else if !slot.closed() {
                ids.push(slot.id());
            }
        }
        Ok(ids)
    }

    /// Information about one slot.
    pub fn get_slot_info(&self, slot_id: SlotId) -> Result<SlotInfo> {
        let ctx = self.ctx()?;
        ctx.slot_pool.update()?;
        let mut guard = ctx.slot_pool.find_and_lock(slot_id)?;
        let slot = Arc::clone(guard.slot());
        // refresh token presence for the info flags; absence is not an error
        let _ = guard.get_token(&slot);
        Ok(guard.info(&slot))
    }

    /// Information about the token in one slot.
    pub fn get_token_info(&self, slot_id: SlotId) -> Result<TokenInfo> {
        let ctx = self.ctx()?;
        let mut guard = ctx.slot_pool.find_and_lock(slot_id)?;
        let slot = Arc::clone(guard.slot());
        let token = guard.get_token(&slot)?;
        Ok(token.info.clone())
    }

    /// Mechanisms supported by the token in one slot.
    pub fn get_mechanism_list(&self, slot_id: SlotId) -> Result<Vec<Mechanism>> {
        let ctx = self.ctx()?;
        let mut guard = ctx.slot_pool.find_and_lock(slot_id)?;
        let slot = Arc::clone(guard.slot());
        guard.get_token(&slot)?;
        Ok(MECHANISM_LIST.to_vec())
    }

    /// Capability information about one mechanism.
    pub fn get_mechanism_info(&self, slot_id: SlotId, mechanism: Mechanism) -> Result<MechanismInfo> {
        let ctx = self.ctx()?;
        let mut guard = ctx.slot_pool.find_and_lock(slot_id)?;
        let slot = Arc::clone(guard.slot());
        guard.get_token(&slot)?;

        let info = match mechanism {
            Mechanism::RsaX509
            | Mechanism::RsaPkcs
            | Mechanism::Sha1RsaPkcs
            | Mechanism::Sha256RsaPkcs
            | Mechanism::Sha1RsaPkcsPss
            | Mechanism::Sha256RsaPkcsPss => MechanismInfo {
                min_key_size: 1024,
                max_key_size: 2048,
                flags: mech_flags::SIGN
                    | mech_flags::HW
                    | mech_flags::ENCRYPT
                    | mech_flags::DECRYPT
                    | mech_flags::GENERATE_KEY_PAIR,
            },
            Mechanism::Ecdsa | Mechanism::EcdsaSha1 => MechanismInfo {
                min_key_size: 192,
                max_key_size: 320,
                flags: mech_flags::SIGN | mech_flags::HW | mech_flags::VERIFY | mech_flags::GENERATE_KEY_PAIR,
            },
            Mechanism::RsaPkcsKeyPairGen => MechanismInfo {
                min_key_size: 1024,
                max_key_size: 2048,
                flags: mech_flags::GENERATE_KEY_PAIR | mech_flags::HW,
            },
            Mechanism::EcKeyPairGen => MechanismInfo {
                min_key_size: 192,
                max_key_size: 320,
                flags: mech_flags::GENERATE_KEY_PAIR | mech_flags::HW,
            },
        };
        Ok(info)
    }

    /// Token initialisation is delegated to provisioning tooling.
    pub fn init_token(&self, slot_id: SlotId, _so_pin: &[u8], _label: &str) -> Result<()> {
        let ctx = self.ctx()?;
        let _guard = ctx.slot_pool.find_and_lock(slot_id)?;
        if ctx.session_pool.first_by_slot(slot_id).is_some() {
            return Err(CkError::SessionExists);
        }
        Err(CkError::FunctionNotSupported)
    }

    /// Slot-event waiting is not offered.
    pub fn wait_for_slot_event(&self) -> Result<SlotId> {
        self.ctx()?;
        Err(CkError::FunctionNotSupported)
    }
}
