//! # schsm - SmartCard-HSM Token Access Layer
//!
//! `schsm` drives a SmartCard-HSM through a card-reader transport and
//! exposes two front-ends on top of one card command core:
//!
//! - a **cryptoki-style token API** ([`p11::Module`]): slot enumeration,
//!   sessions, login state, data objects and attribute search, safe to use
//!   from any number of threads;
//! - a **template-based signer** ([`signer::HsmSigner`]): produces detached
//!   CMS signatures by patching a pre-assembled envelope stored on the card,
//!   so a complete signature file costs one hash and one private-key
//!   operation on the card - no host-side crypto library involved.
//!
//! ## Architecture
//!
//! ```text
//! application ── p11::Module ──┐                  ┌─ signer::HsmSigner
//!        slots / sessions /    │                  │  template engine
//!        tokens / objects      │                  │  (sign::TemplateSigner)
//!                              ▼                  ▼
//!                        card::HsmChannel (APDU framing)
//!                              │
//!                    reader::ReaderTransport (trait)
//!                              │
//!              platform backend  /  mock::MockHsm (bundled)
//! ```
//!
//! The reader transport is a trait boundary: a production backend wraps the
//! platform's terminal service in its own crate, while [`mock`] ships an
//! in-memory simulation used by the test suites and the CLI binaries.
//!
//! ## Concurrency model
//!
//! Slots and sessions live in pools guarded by pool locks; each slot has
//! its own lock serialising all card I/O on that slot. Lookups pin their
//! target with an atomic queueing counter between pool lookup and lock
//! acquisition, so reader removal can never free a slot out from under a
//! waiting thread. The template engine and signer are single-threaded by
//! contract.
//!
//! ## Example
//!
//! ```rust
//! use schsm::mock::{MockHsm, DEFAULT_USER_PIN};
//! use schsm::{Module, SessionFlags, UserType};
//!
//! let hsm = MockHsm::builder().reader("reader 0").build();
//! let module = Module::new();
//! module.initialize(hsm.transport()).unwrap();
//!
//! let slots = module.get_slot_list(true).unwrap();
//! let session = module
//!     .open_session(slots[0], SessionFlags { rw: true, serial: true })
//!     .unwrap();
//! module.login(session, UserType::User, DEFAULT_USER_PIN).unwrap();
//! module.logout(session).unwrap();
//! module.close_session(session).unwrap();
//! module.finalize().unwrap();
//! ```

pub mod apdu;
pub mod card;
pub mod error;
pub mod mock;
pub mod object;
pub mod p11;
pub mod reader;
pub mod session;
pub mod sign;
pub mod signer;
pub mod slot;
pub mod template;
pub mod token;

pub use card::Pin;
pub use error::{CkError, Result};
pub use p11::{LibraryInfo, Mechanism, MechanismInfo, Module, SessionInfo};
pub use session::{SessionFlags, SessionState};
pub use sign::TemplateSigner;
pub use signer::HsmSigner;
pub use template::TemplateError;
pub use token::UserType;
