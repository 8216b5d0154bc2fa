//! Slots and the slot pool.
//!
//! A slot binds one reader name to a stable library-assigned id. All mutable
//! slot state lives behind the slot's own mutex; the pool lock only guards
//! the list, the id counter and the `present`/`closed` flags.
//!
//! ## The queueing protocol
//!
//! Looking a slot up and locking it are two steps, and the pool lock is
//! never held across the second one. The window in between is covered by an
//! atomic queueing counter:
//!
//! 1. under the pool lock, locate the slot and raise its counter,
//! 2. release the pool lock,
//! 3. acquire the slot lock (may block),
//! 4. lower the counter.
//!
//! The destroyer (the enumeration pass in [`SlotPool::update`]) marks a
//! vanished slot `closed`, then takes its lock while still holding the pool
//! lock; if the counter is non-zero at that point, destruction is deferred
//! to a later pass. A queued thread therefore always acquires either a live
//! slot or one it can observe `closed` on, never freed memory. Lock order
//! for paths that take both locks is pool first, then slot.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tracing::{debug, warn};

use crate::card::HsmChannel;
use crate::error::{CkError, Result};
use crate::reader::{ReaderTransport, TransportError};
use crate::token::Token;

pub type SlotId = u64;

/// Slot capability flags.
pub mod flags {
    pub const TOKEN_PRESENT: u32 = 0x0000_0001;
    pub const REMOVABLE_DEVICE: u32 = 0x0000_0002;
    pub const HW_SLOT: u32 = 0x0000_0004;
}

/// Descriptive slot information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// The reader name.
    pub description: String,
    pub manufacturer: String,
    pub flags: u32,
    pub hardware_version: (u8, u8),
    pub firmware_version: (u8, u8),
}

// ============================================================================
// SLOT
// ============================================================================

/// State guarded by the slot lock.
#[derive(Default)]
pub struct SlotState {
    connection: Option<Box<dyn crate::reader::CardConnection>>,
    token: Option<Token>,
    pub session_count: u32,
    pub read_only_session_count: u32,
    /// Control code of the reader's direct PIN verification, zero if absent.
    pub verify_pin_direct: u32,
}

pub struct Slot {
    id: SlotId,
    reader_name: String,
    transport: Arc<dyn ReaderTransport>,
    queuing: AtomicU32,
    /// Seen by the latest enumeration pass; pool-lock discipline.
    present: AtomicBool,
    /// Monotonic: once set the slot only awaits destruction.
    closed: AtomicBool,
    state: Arc<Mutex<SlotState>>,
}

impl Slot {
    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn present(&self) -> bool {
        self.present.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> u32 {
        self.queuing.load(Ordering::SeqCst)
    }

    /// Acquire the slot lock (step 3 of the protocol). Callers arriving from
    /// a pool lookup hold a [`SlotPin`] across this call.
    pub fn lock(self: Arc<Slot>) -> SlotGuard {
        SlotGuard { state: self.state.lock_arc(), slot: self }
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("reader_name", &self.reader_name)
            .field("present", &self.present())
            .field("closed", &self.closed())
            .finish()
    }
}

/// Pin guard covering the lookup-to-lock window.
pub struct SlotPin {
    slot: Arc<Slot>,
}

impl SlotPin {
    pub fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }
}

impl Drop for SlotPin {
    fn drop(&mut self) {
        self.slot.queuing.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owned slot lock. Held for the whole of any slot-scoped operation; every
/// card I/O runs through [`SlotState::channel`] on a live guard, which ties
/// the transmit to the lock by construction.
pub struct SlotGuard {
    slot: Arc<Slot>,
    state: ArcMutexGuard<RawMutex, SlotState>,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard").field("slot", &self.slot).finish()
    }
}

impl SlotGuard {
    pub fn slot(&self) -> &Arc<Slot> {
        &self.slot
    }

    pub fn id(&self) -> SlotId {
        self.slot.id
    }
}

impl std::ops::Deref for SlotGuard {
    type Target = SlotState;
    fn deref(&self) -> &SlotState {
        &self.state
    }
}

impl std::ops::DerefMut for SlotGuard {
    fn deref_mut(&mut self) -> &mut SlotState {
        &mut self.state
    }
}

impl SlotState {
    /// Card channel over the slot's connection.
    pub fn channel(&mut self) -> Result<HsmChannel<'_>> {
        match self.connection.as_deref_mut() {
            Some(conn) => Ok(HsmChannel::new(conn)),
            None => Err(CkError::DeviceError),
        }
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn token_mut(&mut self) -> Option<&mut Token> {
        self.token.as_mut()
    }

    /// Return the slot's token, driving card detection or removal checks as
    /// a side effect.
    pub fn get_token(&mut self, slot: &Slot) -> Result<&mut Token> {
        if slot.closed() {
            return Err(CkError::DeviceRemoved);
        }
        if self.token.is_some() {
            self.check_removed_token(slot)?;
        } else {
            self.check_new_token(slot)?;
        }
        self.token.as_mut().ok_or(CkError::TokenNotPresent)
    }

    fn check_new_token(&mut self, slot: &Slot) -> Result<()> {
        // a stale connection from an earlier card is re-established
        self.connection = None;
        match slot.transport.connect(&slot.reader_name) {
            Ok(conn) => self.connection = Some(conn),
            Err(TransportError::NoCard) | Err(TransportError::CardRemoved) => {
                return Err(CkError::TokenNotPresent)
            }
            Err(TransportError::ReaderGone) => {
                self.close(slot);
                return Err(CkError::DeviceRemoved);
            }
            Err(e) => {
                warn!(reader = slot.reader_name.as_str(), error = %e, "connect failed");
                return Err(CkError::DeviceError);
            }
        }
        let Some(conn) = self.connection.as_deref_mut() else {
            return Err(CkError::DeviceError);
        };
        let features = conn.features().unwrap_or_default();
        self.verify_pin_direct = features.verify_pin_direct;
        let atr = conn.atr().to_vec();
        let mut channel = HsmChannel::new(conn);
        let token = Token::detect(&atr, &mut channel, features)?;
        debug!(slot = slot.id, reader = slot.reader_name.as_str(), "token detected");
        self.token = Some(token);
        Ok(())
    }

    fn check_removed_token(&mut self, slot: &Slot) -> Result<()> {
        let Some(conn) = self.connection.as_deref_mut() else {
            self.token = None;
            return Err(CkError::TokenNotPresent);
        };
        match conn.status() {
            Ok(()) => Ok(()),
            Err(TransportError::CardRemoved) | Err(TransportError::NoCard) => {
                debug!(slot = slot.id, "token removed");
                self.token = None;
                self.connection = None;
                Err(CkError::TokenNotPresent)
            }
            Err(TransportError::ReaderGone) => {
                debug!(slot = slot.id, "reader gone");
                self.close(slot);
                Err(CkError::DeviceRemoved)
            }
            Err(e) => {
                warn!(slot = slot.id, error = %e, "status probe failed");
                self.close(slot);
                Err(CkError::DeviceError)
            }
        }
    }

    /// Mark the slot closed and give up card and token.
    pub fn close(&mut self, slot: &Slot) {
        slot.closed.store(true, Ordering::SeqCst);
        self.connection = None;
        self.token = None;
    }

    /// Verify `pin` on the card and record the login on the token.
    pub fn login_token(
        &mut self,
        user_type: crate::token::UserType,
        pin: &crate::card::Pin,
    ) -> Result<()> {
        let token = self.token.as_mut().ok_or(CkError::TokenNotPresent)?;
        let conn = self.connection.as_deref_mut().ok_or(CkError::DeviceError)?;
        let mut channel = HsmChannel::new(conn);
        token.log_in(&mut channel, user_type, pin)
    }

    /// Log the token's user out: clear authentication state, drop private
    /// objects and reset the card's security environment.
    pub fn logout_token(&mut self) -> Result<()> {
        let token = self.token.as_mut().ok_or(CkError::TokenNotPresent)?;
        match self.connection.as_deref_mut() {
            Some(conn) => {
                let mut channel = HsmChannel::new(conn);
                token.log_out(&mut channel)
            }
            None => {
                token.clear_authentication();
                Ok(())
            }
        }
    }

    /// Persist dirty token objects.
    pub fn synchronize_token(&mut self) -> Result<()> {
        let token = self.token.as_mut().ok_or(CkError::DeviceRemoved)?;
        token.synchronize()
    }

    /// Slot information as reported to applications.
    pub fn info(&self, slot: &Slot) -> SlotInfo {
        let mut info_flags = flags::REMOVABLE_DEVICE | flags::HW_SLOT;
        if self.token.is_some() {
            info_flags |= flags::TOKEN_PRESENT;
        }
        SlotInfo {
            description: slot.reader_name.clone(),
            manufacturer: "CardContact".to_string(),
            flags: info_flags,
            hardware_version: (0, 0),
            firmware_version: (0, 0),
        }
    }
}

// ============================================================================
// SLOT POOL
// ============================================================================

struct PoolInner {
    slots: Vec<Arc<Slot>>,
    next_id: SlotId,
}

/// The process-wide slot list, reconciled against the live reader set by
/// [`SlotPool::update`].
pub struct SlotPool {
    transport: Arc<dyn ReaderTransport>,
    inner: Mutex<PoolInner>,
    /// Single-flight flag for `update`.
    busy: AtomicBool,
}

impl SlotPool {
    pub fn new(transport: Arc<dyn ReaderTransport>) -> SlotPool {
        SlotPool {
            transport,
            inner: Mutex::new(PoolInner { slots: Vec::new(), next_id: 1 }),
            busy: AtomicBool::new(false),
        }
    }

    /// Reconcile the pool against the live reader list.
    ///
    /// Single-flight: a caller that observed another update in progress
    /// returns as soon as it holds the pool lock, on the assumption that a
    /// fresh enumeration just completed. Slots whose reader vanished are
    /// marked closed; destruction is deferred while any thread is queued on
    /// the slot.
    pub fn update(&self) -> Result<()> {
        let was_busy = self.busy.load(Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if was_busy {
            return Ok(());
        }
        self.busy.store(true, Ordering::SeqCst);

        for slot in &inner.slots {
            slot.present.store(false, Ordering::SeqCst);
        }
        let result = self.refresh_readers(&mut inner);
        if result.is_ok() {
            self.collect_vanished(&mut inner);
        }

        self.busy.store(false, Ordering::SeqCst);
        result
    }

    fn refresh_readers(&self, inner: &mut PoolInner) -> Result<()> {
        let readers = self.transport.list_readers().map_err(|e| {
            warn!(error = %e, "reader enumeration failed");
            CkError::DeviceError
        })?;
        for reader in readers {
            if let Some(slot) = inner
                .slots
                .iter()
                .find(|s| !s.closed() && s.reader_name == reader)
            {
                slot.present.store(true, Ordering::SeqCst);
                continue;
            }
            let id = inner.next_id;
            inner.next_id += 1;
            debug!(slot = id, reader = reader.as_str(), "slot added");
            inner.slots.push(Arc::new(Slot {
                id,
                reader_name: reader,
                transport: Arc::clone(&self.transport),
                queuing: AtomicU32::new(0),
                present: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                state: Arc::new(Mutex::new(SlotState::default())),
            }));
        }
        Ok(())
    }

    fn collect_vanished(&self, inner: &mut PoolInner) {
        let mut i = 0;
        while i < inner.slots.len() {
            let slot = Arc::clone(&inner.slots[i]);
            if slot.present() {
                i += 1;
                continue;
            }
            slot.closed.store(true, Ordering::SeqCst);
            // pool -> slot lock order; see module docs
            let mut state = slot.state.lock();
            if slot.queued() > 0 {
                // a thread is between lookup and lock; it will observe
                // `closed`, and a later pass collects the slot
                debug!(slot = slot.id, "destruction deferred, threads queued");
                i += 1;
                continue;
            }
            state.token = None;
            state.connection = None;
            drop(state);
            debug!(slot = slot.id, reader = slot.reader_name.as_str(), "slot destroyed");
            inner.slots.remove(i);
        }
    }

    /// Locate a slot and raise its queueing counter under the pool lock.
    pub fn find_and_pin(&self, id: SlotId) -> Result<SlotPin> {
        let inner = self.inner.lock();
        let slot = inner
            .slots
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(CkError::SlotIdInvalid)?;
        slot.queuing.fetch_add(1, Ordering::SeqCst);
        Ok(SlotPin { slot })
    }

    /// Canonical entry point for slot-scoped operations: look up, pin, lock.
    pub fn find_and_lock(&self, id: SlotId) -> Result<SlotGuard> {
        let pin = {
            let inner = self.inner.lock();
            let slot = inner
                .slots
                .iter()
                .find(|s| s.id == id)
                .ok_or(CkError::SlotIdInvalid)?;
            if slot.closed() {
                return Err(CkError::DeviceError);
            }
            slot.queuing.fetch_add(1, Ordering::SeqCst);
            SlotPin { slot: Arc::clone(slot) }
        };
        let guard = Arc::clone(pin.slot()).lock();
        drop(pin);
        if guard.slot().closed() {
            return Err(CkError::DeviceRemoved);
        }
        Ok(guard)
    }

    pub fn find(&self, id: SlotId) -> Option<Arc<Slot>> {
        self.inner.lock().slots.iter().find(|s| s.id == id).cloned()
    }

    /// Snapshot of the current slot list.
    pub fn slots(&self) -> Vec<Arc<Slot>> {
        self.inner.lock().slots.clone()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Close every slot and drop the list (library finalisation).
    pub fn terminate(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.drain(..) {
            let mut state = slot.state.lock();
            state.close(&slot);
        }
    }
}
