//! The cryptographic-token API surface.
//!
//! [`Module`] is the process context: it owns the slot pool and the session
//! pool between `initialize` and `finalize` and exposes the operation subset
//! of the token API. Operations are grouped the way the interface groups
//! them: slot and token functions in [`slots`], session functions in
//! [`sessions`], object functions in [`objects`].

mod objects;
mod sessions;
mod slots;

pub use sessions::SessionInfo;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CkError, Result};
use crate::reader::ReaderTransport;
use crate::session::SessionPool;
use crate::slot::SlotPool;

/// Library identification returned by `get_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryInfo {
    pub interface_version: (u8, u8),
    pub library_version: (u8, u8),
    pub manufacturer: String,
    pub description: String,
}

/// Advertised mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    RsaX509,
    RsaPkcs,
    Sha1RsaPkcs,
    Sha256RsaPkcs,
    Sha1RsaPkcsPss,
    Sha256RsaPkcsPss,
    Ecdsa,
    EcdsaSha1,
    /// Advertised for key-pair generation; generation itself is not
    /// implemented.
    RsaPkcsKeyPairGen,
    EcKeyPairGen,
}

/// Mechanism capability flags.
pub mod mech_flags {
    pub const HW: u32 = 0x0000_0001;
    pub const ENCRYPT: u32 = 0x0000_0100;
    pub const DECRYPT: u32 = 0x0000_0200;
    pub const SIGN: u32 = 0x0000_0800;
    pub const VERIFY: u32 = 0x0000_2000;
    pub const GENERATE_KEY_PAIR: u32 = 0x0001_0000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MechanismInfo {
    pub min_key_size: u32,
    pub max_key_size: u32,
    pub flags: u32,
}

pub(crate) struct ModuleState {
    pub slot_pool: SlotPool,
    pub session_pool: SessionPool,
    pub info: LibraryInfo,
}

/// The process context of the token API.
///
/// Created empty; [`Module::initialize`] installs the pools over a reader
/// transport, [`Module::finalize`] tears them down again. Every operation in
/// between is safe to call from any number of threads.
#[derive(Default)]
pub struct Module {
    state: RwLock<Option<Arc<ModuleState>>>,
}

impl Module {
    pub fn new() -> Module {
        Module::default()
    }

    /// Install the process context over `transport`.
    pub fn initialize(&self, transport: Arc<dyn ReaderTransport>) -> Result<()> {
        let mut state = self.state.write();
        if state.is_some() {
            return Err(CkError::AlreadyInitialized);
        }
        *state = Some(Arc::new(ModuleState {
            slot_pool: SlotPool::new(transport),
            session_pool: SessionPool::new(),
            info: LibraryInfo {
                interface_version: (2, 20),
                library_version: (0, 9),
                manufacturer: "CardContact".to_string(),
                description: "SmartCard-HSM token access layer".to_string(),
            },
        }));
        Ok(())
    }

    /// Tear the process context down: every session is dropped and every
    /// slot is closed.
    pub fn finalize(&self) -> Result<()> {
        let state = self.state.write().take().ok_or(CkError::NotInitialized)?;
        state.session_pool.terminate();
        state.slot_pool.terminate();
        Ok(())
    }

    pub fn get_info(&self) -> Result<LibraryInfo> {
        Ok(self.ctx()?.info.clone())
    }

    pub(crate) fn ctx(&self) -> Result<Arc<ModuleState>> {
        self.state.read().clone().ok_or(CkError::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHsm;

    #[test]
    fn lifecycle_gates_every_operation() {
        let module = Module::new();
        assert_eq!(module.get_info().unwrap_err(), CkError::NotInitialized);
        assert_eq!(module.finalize().unwrap_err(), CkError::NotInitialized);

        let hsm = MockHsm::builder().reader("reader-a").build();
        module.initialize(hsm.transport()).unwrap();
        assert!(module.get_info().is_ok());
        assert_eq!(
            module.initialize(hsm.transport()).unwrap_err(),
            CkError::AlreadyInitialized
        );

        module.finalize().unwrap();
        assert_eq!(module.get_info().unwrap_err(), CkError::NotInitialized);

        // a second initialize starts a fresh context
        module.initialize(hsm.transport()).unwrap();
        assert!(module.get_info().is_ok());
    }
}
