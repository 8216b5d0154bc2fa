//! Session operations: open/close, info, login/logout.

use std::sync::Arc;

use tracing::warn;

use crate::card::Pin;
use crate::error::{CkError, Result};
use crate::p11::{Module, ModuleState};
use crate::session::{Session, SessionFlags, SessionHandle, SessionState};
use crate::slot::{SlotGuard, SlotId};
use crate::token::UserType;

/// Information about one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub slot_id: SlotId,
    pub state: SessionState,
    pub flags: SessionFlags,
    pub device_error: u64,
}

/// Canonical entry point for session-scoped operations.
///
/// Pins the session, resolves and pins its slot, acquires the slot lock,
/// then drops both pins. A slot observed `closed` at any point reports
/// "device removed"; a slot without a token reports "token not present".
pub(crate) fn find_session_and_lock_slot(
    ctx: &ModuleState,
    handle: SessionHandle,
) -> Result<(Arc<Session>, SlotGuard)> {
    let session_pin = ctx.session_pool.find_and_pin(handle)?;
    let slot_pin = ctx
        .slot_pool
        .find_and_pin(session_pin.session().slot_id())
        .map_err(|_| CkError::DeviceRemoved)?;
    if slot_pin.slot().closed() {
        return Err(CkError::DeviceRemoved);
    }

    let guard = Arc::clone(slot_pin.slot()).lock();
    let session = Arc::clone(session_pin.session());
    drop(slot_pin);
    drop(session_pin);

    if guard.slot().closed() {
        return Err(CkError::DeviceRemoved);
    }
    if guard.token().is_none() {
        return Err(CkError::TokenNotPresent);
    }
    Ok((session, guard))
}

impl Module {
    /// Open a session on a slot. The `serial` flag is mandatory.
    pub fn open_session(&self, slot_id: SlotId, session_flags: SessionFlags) -> Result<SessionHandle> {
        let ctx = self.ctx()?;
        if !session_flags.serial {
            return Err(CkError::SessionParallelNotSupported);
        }

        let mut guard = ctx.slot_pool.find_and_lock(slot_id)?;
        let slot = Arc::clone(guard.slot());
        let token = guard.get_token(&slot)?;
        if !session_flags.rw && token.user_type() == Some(UserType::SecurityOfficer) {
            return Err(CkError::SessionReadWriteSoExists);
        }

        guard.session_count += 1;
        if !session_flags.rw {
            guard.read_only_session_count += 1;
        }
        drop(guard);

        Ok(ctx.session_pool.add(slot_id, session_flags))
    }

    /// Close a session.
    ///
    /// Rejected with [`CkError::FunctionFailed`] while another thread has
    /// the session pinned. Closing the last session of a slot logs a
    /// logged-in user out.
    pub fn close_session(&self, handle: SessionHandle) -> Result<()> {
        let ctx = self.ctx()?;
        let session = ctx.session_pool.take(handle)?;

        let Some(slot) = ctx.slot_pool.find(session.slot_id()) else {
            return Ok(());
        };
        let mut guard = Arc::clone(&slot).lock();
        guard.session_count = guard.session_count.saturating_sub(1);
        if !session.flags().rw {
            guard.read_only_session_count = guard.read_only_session_count.saturating_sub(1);
        }
        if guard.session_count == 0
            && guard.token().is_some_and(|t| t.user_type().is_some())
        {
            if let Err(e) = guard.logout_token() {
                warn!(slot = slot.id(), error = %e, "logout on last session close failed");
            }
        }
        Ok(())
    }

    /// Close every session on a slot.
    pub fn close_all_sessions(&self, slot_id: SlotId) -> Result<()> {
        let ctx = self.ctx()?;
        while let Some(handle) = ctx.session_pool.first_by_slot(slot_id) {
            self.close_session(handle)?;
        }
        Ok(())
    }

    /// Information about one session.
    pub fn get_session_info(&self, handle: SessionHandle) -> Result<SessionInfo> {
        let ctx = self.ctx()?;
        let (session, mut guard) = find_session_and_lock_slot(&ctx, handle)?;
        let slot = Arc::clone(guard.slot());
        let token = guard.get_token(&slot)?;
        let state = SessionState::of(session.flags(), token);
        Ok(SessionInfo { slot_id: slot.id(), state, flags: session.flags(), device_error: 0 })
    }

    /// Log a user into the token behind a session.
    ///
    /// `pin` is the user PIN (6–16 characters) or, for the security officer,
    /// 16 hex digits. Officer logins require a read-write session and no
    /// read-only session anywhere on the slot.
    pub fn login(&self, handle: SessionHandle, user_type: UserType, pin: &str) -> Result<()> {
        let ctx = self.ctx()?;
        let (session, mut guard) = find_session_and_lock_slot(&ctx, handle)?;
        let slot = Arc::clone(guard.slot());
        let token = guard.get_token(&slot)?;

        if token.user_type().is_some() {
            return Err(CkError::UserAlreadyLoggedIn);
        }
        let pin = match user_type {
            UserType::User => {
                if !token.user_pin_initialized() {
                    return Err(CkError::UserPinNotInitialized);
                }
                Pin::user(pin)?
            }
            UserType::SecurityOfficer => {
                if !session.flags().rw {
                    return Err(CkError::SessionReadOnly);
                }
                if guard.read_only_session_count > 0 {
                    return Err(CkError::SessionReadOnlyExists);
                }
                Pin::security_officer(pin)?
            }
        };
        guard.login_token(user_type, &pin)
    }

    /// Log the current user out.
    pub fn logout(&self, handle: SessionHandle) -> Result<()> {
        let ctx = self.ctx()?;
        let (_, mut guard) = find_session_and_lock_slot(&ctx, handle)?;
        let slot = Arc::clone(guard.slot());
        let token = guard.get_token(&slot)?;
        if token.user_type().is_none() {
            return Err(CkError::UserNotLoggedIn);
        }
        guard.logout_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHsm;

    const RW: SessionFlags = SessionFlags { rw: true, serial: true };
    const RO: SessionFlags = SessionFlags { rw: false, serial: true };

    const USER_PIN: &str = "648219";
    const SO_PIN: &str = "3537363231383830";

    fn module_with(hsm: &MockHsm) -> Module {
        let module = Module::new();
        module.initialize(hsm.transport()).unwrap();
        module.get_slot_list(false).unwrap();
        module
    }

    fn slot_counts(module: &Module, slot_id: SlotId) -> (u32, u32) {
        let ctx = module.ctx().unwrap();
        let guard = ctx.slot_pool.find(slot_id).unwrap().lock();
        (guard.session_count, guard.read_only_session_count)
    }

    #[test]
    fn serial_flag_is_mandatory() {
        let hsm = MockHsm::builder().reader("reader-a").build();
        let module = module_with(&hsm);
        assert_eq!(
            module
                .open_session(1, SessionFlags { rw: true, serial: false })
                .unwrap_err(),
            CkError::SessionParallelNotSupported
        );
    }

    #[test]
    fn open_close_round_trip_keeps_counts_balanced() {
        let hsm = MockHsm::builder().reader("reader-a").build();
        let module = module_with(&hsm);

        assert_eq!(module.get_slot_list(true).unwrap(), vec![1]);
        let handle = module.open_session(1, RW).unwrap();
        assert_eq!(handle, 1);
        assert_eq!(slot_counts(&module, 1), (1, 0));

        module.close_session(handle).unwrap();
        assert_eq!(slot_counts(&module, 1), (0, 0));

        // the slot itself survives
        assert_eq!(module.get_slot_list(false).unwrap(), vec![1]);
        assert_eq!(module.close_session(handle).unwrap_err(), CkError::SessionHandleInvalid);
    }

    #[test]
    fn read_only_sessions_are_counted() {
        let hsm = MockHsm::builder().reader("reader-a").build();
        let module = module_with(&hsm);
        let ro1 = module.open_session(1, RO).unwrap();
        let _rw = module.open_session(1, RW).unwrap();
        let ro2 = module.open_session(1, RO).unwrap();
        assert_eq!(slot_counts(&module, 1), (3, 2));
        module.close_session(ro1).unwrap();
        module.close_session(ro2).unwrap();
        assert_eq!(slot_counts(&module, 1), (1, 0));
    }

    #[test]
    fn session_state_follows_login() {
        let hsm = MockHsm::builder().reader("reader-a").build();
        let module = module_with(&hsm);
        let handle = module.open_session(1, RW).unwrap();
        assert_eq!(module.get_session_info(handle).unwrap().state, SessionState::RwPublic);

        module.login(handle, UserType::User, USER_PIN).unwrap();
        assert_eq!(
            module.get_session_info(handle).unwrap().state,
            SessionState::RwUserFunctions
        );

        module.logout(handle).unwrap();
        assert_eq!(module.get_session_info(handle).unwrap().state, SessionState::RwPublic);
        assert_eq!(module.logout(handle).unwrap_err(), CkError::UserNotLoggedIn);
    }

    #[test]
    fn officer_login_preconditions() {
        let hsm = MockHsm::builder().reader("reader-a").build();
        let module = module_with(&hsm);

        // a read-only session alone rejects the officer
        let ro1 = module.open_session(1, RO).unwrap();
        assert_eq!(
            module.login(ro1, UserType::SecurityOfficer, SO_PIN).unwrap_err(),
            CkError::SessionReadOnly
        );
        let ro2 = module.open_session(1, RO).unwrap();
        assert_eq!(
            module.login(ro2, UserType::SecurityOfficer, SO_PIN).unwrap_err(),
            CkError::SessionReadOnly
        );

        // a read-write session still fails while any read-only session exists
        let rw = module.open_session(1, RW).unwrap();
        assert_eq!(
            module.login(rw, UserType::SecurityOfficer, SO_PIN).unwrap_err(),
            CkError::SessionReadOnlyExists
        );

        // close the read-only sessions, then the officer gets in
        module.close_session(ro1).unwrap();
        module.close_session(ro2).unwrap();
        module.login(rw, UserType::SecurityOfficer, SO_PIN).unwrap();
        assert_eq!(
            module.get_session_info(rw).unwrap().state,
            SessionState::RwSoFunctions
        );

        // no read-only session can open while the officer is logged in
        assert_eq!(module.open_session(1, RO).unwrap_err(), CkError::SessionReadWriteSoExists);
    }

    #[test]
    fn double_login_is_rejected() {
        let hsm = MockHsm::builder().reader("reader-a").build();
        let module = module_with(&hsm);
        let handle = module.open_session(1, RW).unwrap();
        module.login(handle, UserType::User, USER_PIN).unwrap();
        assert_eq!(
            module.login(handle, UserType::User, USER_PIN).unwrap_err(),
            CkError::UserAlreadyLoggedIn
        );
    }

    #[test]
    fn wrong_pin_reports_tries_left() {
        let hsm = MockHsm::builder().reader("reader-a").build();
        let module = module_with(&hsm);
        let handle = module.open_session(1, RW).unwrap();
        let err = module.login(handle, UserType::User, "999999").unwrap_err();
        assert_eq!(err, CkError::PinIncorrect { tries_left: 2 });
    }

    #[test]
    fn closing_last_session_logs_user_out() {
        let hsm = MockHsm::builder().reader("reader-a").build();
        let module = module_with(&hsm);
        let a = module.open_session(1, RW).unwrap();
        let b = module.open_session(1, RW).unwrap();
        module.login(a, UserType::User, USER_PIN).unwrap();
        module.close_session(a).unwrap();

        // still logged in: another session remains
        assert_eq!(
            module.get_session_info(b).unwrap().state,
            SessionState::RwUserFunctions
        );
        module.close_session(b).unwrap();

        let c = module.open_session(1, RW).unwrap();
        assert_eq!(module.get_session_info(c).unwrap().state, SessionState::RwPublic);
    }

    #[test]
    fn close_all_sessions_drains_one_slot() {
        let hsm = MockHsm::builder().reader("reader-a").reader("reader-b").build();
        let module = module_with(&hsm);
        for _ in 0..3 {
            module.open_session(1, RO).unwrap();
        }
        let other = module.open_session(2, RW).unwrap();
        module.close_all_sessions(1).unwrap();
        assert_eq!(slot_counts(&module, 1), (0, 0));
        // the other slot's session is untouched
        assert!(module.get_session_info(other).is_ok());
    }

    #[test]
    fn session_on_removed_card_reports_device_removed() {
        let hsm = MockHsm::builder().reader("reader-a").build();
        let module = module_with(&hsm);
        let handle = module.open_session(1, RW).unwrap();
        hsm.unplug_reader("reader-a");
        module.get_slot_list(false).unwrap();
        assert_eq!(module.get_session_info(handle).unwrap_err(), CkError::DeviceRemoved);
    }
}
