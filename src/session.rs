//! Sessions and the session pool.
//!
//! A session is an application's view on one slot/token pair. Its mutable
//! state (session objects, search cursor, crypto accumulator) is guarded by
//! its own small mutex, locked strictly after the owning slot's lock. The
//! pool hands out monotonic non-zero 64-bit handles and pins sessions with
//! an atomic queueing counter while a thread is between pool lookup and
//! slot lock acquisition.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use zeroize::Zeroize;

use crate::error::{CkError, Result};
use crate::object::{Object, ObjectHandle};
use crate::token::{Token, UserType};

pub type SessionHandle = u64;

/// First handle of the session-object range; token handles stay below it.
const SESSION_OBJECT_HANDLE_BASE: ObjectHandle = 0xA000;

/// Session open flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionFlags {
    /// Read-write session (read-only otherwise).
    pub rw: bool,
    /// Legacy "serial" bit; must always be set by callers.
    pub serial: bool,
}

/// Session states, computed from the token's login state and the session's
/// read-write flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    RoPublic,
    RwPublic,
    RoUserFunctions,
    RwUserFunctions,
    RwSoFunctions,
}

impl SessionState {
    /// The state table: officer logins only exist read-write.
    pub fn of(flags: SessionFlags, token: &Token) -> SessionState {
        match token.user_type() {
            Some(UserType::User) => {
                if flags.rw {
                    SessionState::RwUserFunctions
                } else {
                    SessionState::RoUserFunctions
                }
            }
            Some(UserType::SecurityOfficer) => SessionState::RwSoFunctions,
            None => {
                if flags.rw {
                    SessionState::RwPublic
                } else {
                    SessionState::RoPublic
                }
            }
        }
    }

    pub fn is_user(self) -> bool {
        matches!(self, SessionState::RoUserFunctions | SessionState::RwUserFunctions)
    }
}

// ============================================================================
// SESSION
// ============================================================================

/// Snapshot of a finished object search.
#[derive(Debug, Default)]
pub struct SearchState {
    pub handles: Vec<ObjectHandle>,
    /// Pagination cursor: number of handles already returned.
    pub collected: usize,
}

/// Accumulator for multi-part operations that feed a single on-card
/// primitive. Wiped on clear and on drop.
#[derive(Debug, Default)]
pub struct CryptoBuffer {
    data: Vec<u8>,
}

impl CryptoBuffer {
    pub fn append(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn clear(&mut self) {
        self.data.zeroize();
        self.data.clear();
    }
}

impl Drop for CryptoBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

/// Mutable per-session state; lock order is slot lock first, then this.
#[derive(Debug, Default)]
pub struct SessionData {
    objects: Vec<Object>,
    next_object_handle: ObjectHandle,
    pub search: Option<SearchState>,
    pub crypto_buffer: CryptoBuffer,
}

impl SessionData {
    /// Link a session object; handles start in a range disjoint from token
    /// handles.
    pub fn add_object(&mut self, mut object: Object) -> ObjectHandle {
        if self.next_object_handle == 0 {
            self.next_object_handle = SESSION_OBJECT_HANDLE_BASE;
        }
        object.handle = self.next_object_handle;
        object.dirty = false;
        self.next_object_handle += 1;
        let handle = object.handle;
        self.objects.push(object);
        handle
    }

    pub fn find_object(&self, handle: ObjectHandle) -> Option<&Object> {
        self.objects.iter().find(|o| o.handle == handle)
    }

    pub fn find_object_mut(&mut self, handle: ObjectHandle) -> Option<&mut Object> {
        self.objects.iter_mut().find(|o| o.handle == handle)
    }

    pub fn remove_object(&mut self, handle: ObjectHandle) -> Option<Object> {
        let pos = self.objects.iter().position(|o| o.handle == handle)?;
        Some(self.objects.remove(pos))
    }

    pub fn objects(&self) -> &[Object] {
        &self.objects
    }
}

#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    slot_id: u64,
    flags: SessionFlags,
    queuing: AtomicU32,
    data: Mutex<SessionData>,
}

impl Session {
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn slot_id(&self) -> u64 {
        self.slot_id
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn data(&self) -> &Mutex<SessionData> {
        &self.data
    }

    pub fn queued(&self) -> u32 {
        self.queuing.load(Ordering::SeqCst)
    }
}

/// Pin guard: keeps a session's queueing counter raised until dropped.
#[derive(Debug)]
pub struct SessionPin {
    session: Arc<Session>,
}

impl SessionPin {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for SessionPin {
    fn drop(&mut self) {
        self.session.queuing.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// SESSION POOL
// ============================================================================

#[derive(Default)]
struct PoolInner {
    sessions: Vec<Arc<Session>>,
    next_handle: SessionHandle,
}

/// The process-wide session list.
#[derive(Default)]
pub struct SessionPool {
    inner: Mutex<PoolInner>,
}

impl SessionPool {
    pub fn new() -> SessionPool {
        SessionPool { inner: Mutex::new(PoolInner { sessions: Vec::new(), next_handle: 1 }) }
    }

    /// Create a session bound to `slot_id` and assign its handle.
    pub fn add(&self, slot_id: u64, flags: SessionFlags) -> SessionHandle {
        let mut inner = self.inner.lock();
        let handle = inner.next_handle;
        inner.next_handle = inner.next_handle.wrapping_add(1);
        if inner.next_handle == 0 {
            // valid handles are non-zero
            inner.next_handle = 1;
        }
        inner.sessions.push(Arc::new(Session {
            handle,
            slot_id,
            flags,
            queuing: AtomicU32::new(0),
            data: Mutex::new(SessionData::default()),
        }));
        handle
    }

    /// Locate a session and raise its queueing counter before the pool lock
    /// is released, so a concurrent close cannot free it from under the
    /// caller.
    pub fn find_and_pin(&self, handle: SessionHandle) -> Result<SessionPin> {
        if handle == 0 {
            return Err(CkError::SessionHandleInvalid);
        }
        let inner = self.inner.lock();
        let session = inner
            .sessions
            .iter()
            .find(|s| s.handle == handle)
            .cloned()
            .ok_or(CkError::SessionHandleInvalid)?;
        session.queuing.fetch_add(1, Ordering::SeqCst);
        Ok(SessionPin { session })
    }

    /// Unlink a session. Fails with [`CkError::FunctionFailed`] while any
    /// other thread has it pinned.
    pub fn take(&self, handle: SessionHandle) -> Result<Arc<Session>> {
        let mut inner = self.inner.lock();
        let pos = inner
            .sessions
            .iter()
            .position(|s| s.handle == handle)
            .ok_or(CkError::SessionHandleInvalid)?;
        if inner.sessions[pos].queued() > 0 {
            return Err(CkError::FunctionFailed);
        }
        Ok(inner.sessions.remove(pos))
    }

    /// First session bound to `slot_id`, if any.
    pub fn first_by_slot(&self, slot_id: u64) -> Option<SessionHandle> {
        self.inner
            .lock()
            .sessions
            .iter()
            .find(|s| s.slot_id == slot_id)
            .map(|s| s.handle)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Count sessions on one slot: total and read-only.
    pub fn count_by_slot(&self, slot_id: u64) -> (usize, usize) {
        let inner = self.inner.lock();
        let total = inner.sessions.iter().filter(|s| s.slot_id == slot_id).count();
        let ro = inner
            .sessions
            .iter()
            .filter(|s| s.slot_id == slot_id && !s.flags.rw)
            .count();
        (total, ro)
    }

    /// Drop every session (library finalisation).
    pub fn terminate(&self) {
        self.inner.lock().sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::flags as token_flags;

    const RW: SessionFlags = SessionFlags { rw: true, serial: true };
    const RO: SessionFlags = SessionFlags { rw: false, serial: true };

    #[test]
    fn handles_are_monotonic_and_nonzero() {
        let pool = SessionPool::new();
        let a = pool.add(1, RW);
        let b = pool.add(1, RO);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(pool.count(), 2);
        assert_eq!(pool.count_by_slot(1), (2, 1));
        assert_eq!(pool.count_by_slot(7), (0, 0));
    }

    #[test]
    fn pinned_session_cannot_be_taken() {
        let pool = SessionPool::new();
        let handle = pool.add(1, RW);
        let pin = pool.find_and_pin(handle).unwrap();
        assert_eq!(pool.take(handle).unwrap_err(), CkError::FunctionFailed);
        drop(pin);
        assert!(pool.take(handle).is_ok());
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn zero_handle_is_always_invalid() {
        let pool = SessionPool::new();
        assert_eq!(pool.find_and_pin(0).unwrap_err(), CkError::SessionHandleInvalid);
    }

    #[test]
    fn state_table() {
        let mut token = Token::with_flags(token_flags::USER_PIN_INITIALIZED);
        assert_eq!(SessionState::of(RO, &token), SessionState::RoPublic);
        assert_eq!(SessionState::of(RW, &token), SessionState::RwPublic);

        // no card involved: set the login state directly through the
        // narrowest crate API
        token_login_for_test(&mut token, UserType::User);
        assert_eq!(SessionState::of(RO, &token), SessionState::RoUserFunctions);
        assert_eq!(SessionState::of(RW, &token), SessionState::RwUserFunctions);

        token.clear_authentication();
        token_login_for_test(&mut token, UserType::SecurityOfficer);
        assert_eq!(SessionState::of(RW, &token), SessionState::RwSoFunctions);
    }

    fn token_login_for_test(token: &mut Token, user: UserType) {
        use crate::mock::MockHsm;
        let hsm = MockHsm::builder().reader("r").build();
        let mut conn = hsm.transport().connect("r").unwrap();
        let mut channel = crate::card::HsmChannel::new(conn.as_mut());
        channel.select_app().unwrap();
        let pin = match user {
            UserType::User => crate::card::Pin::user("648219").unwrap(),
            UserType::SecurityOfficer => {
                crate::card::Pin::security_officer("3537363231383830").unwrap()
            }
        };
        token.log_in(&mut channel, user, &pin).unwrap();
    }

    #[test]
    fn session_object_handles_use_disjoint_range() {
        let mut data = SessionData::default();
        let o = Object::default();
        let h = data.add_object(o);
        assert_eq!(h, SESSION_OBJECT_HANDLE_BASE);
        let h2 = data.add_object(Object::default());
        assert_eq!(h2, SESSION_OBJECT_HANDLE_BASE + 1);
    }

    #[test]
    fn crypto_buffer_accumulates_and_clears() {
        let mut buffer = CryptoBuffer::default();
        buffer.append(b"part one ");
        buffer.append(b"part two");
        assert_eq!(buffer.data(), b"part one part two");
        buffer.clear();
        assert!(buffer.data().is_empty());
    }
}
