//! End-to-end scenarios for the token API over the simulated transport.

use std::sync::Arc;
use std::thread;

use schsm::mock::{MockCard, MockHsm, DEFAULT_USER_PIN};
use schsm::object::{attr, class, AttrQueryResult, Attribute, AttributeQuery};
use schsm::token::flags as token_flags;
use schsm::{CkError, Module, SessionFlags, UserType};

const RW: SessionFlags = SessionFlags { rw: true, serial: true };
const RO: SessionFlags = SessionFlags { rw: false, serial: true };
const SO_PIN: &str = "3537363231383830";

fn module_over(hsm: &MockHsm) -> Module {
    let module = Module::new();
    module.initialize(hsm.transport()).unwrap();
    // populate the slot pool the way applications do
    module.get_slot_list(false).unwrap();
    module
}

#[test]
fn open_close_round_trip() {
    let hsm = MockHsm::builder().reader("reader 0").build();
    let module = module_over(&hsm);

    assert_eq!(module.get_slot_list(true).unwrap(), vec![1]);
    let session = module.open_session(1, RW).unwrap();
    assert_eq!(session, 1);
    module.close_session(session).unwrap();

    // no slot was destroyed by the round trip, and the session is gone
    assert_eq!(module.get_slot_list(true).unwrap(), vec![1]);
    assert_eq!(
        module.get_session_info(session).unwrap_err(),
        CkError::SessionHandleInvalid
    );
    module.finalize().unwrap();
}

#[test]
fn full_lifecycle_with_login_and_objects() {
    let hsm = MockHsm::builder().reader("reader 0").build();
    let module = module_over(&hsm);
    let session = module.open_session(1, RW).unwrap();
    module.login(session, UserType::User, DEFAULT_USER_PIN).unwrap();

    let handle = module
        .create_object(
            session,
            &[
                Attribute::class(class::DATA),
                Attribute::boolean(attr::TOKEN, true),
                Attribute::boolean(attr::PRIVATE, false),
                Attribute::new(attr::LABEL, b"config".to_vec()),
                Attribute::new(attr::VALUE, b"v=1".to_vec()),
            ],
        )
        .unwrap();

    let mut queries = vec![AttributeQuery::value_of(attr::VALUE, 16)];
    module.get_attribute_value(session, handle, &mut queries).unwrap();
    assert_eq!(queries[0].result, AttrQueryResult::Value(b"v=1".to_vec()));

    module.find_objects_init(session, &[Attribute::new(attr::LABEL, b"config".to_vec())]).unwrap();
    assert_eq!(module.find_objects(session, 8).unwrap(), vec![handle]);
    module.find_objects_final(session).unwrap();

    module.destroy_object(session, handle).unwrap();
    module.logout(session).unwrap();
    module.close_session(session).unwrap();
    module.finalize().unwrap();
}

#[test]
fn officer_login_requires_exclusive_rw() {
    let hsm = MockHsm::builder().reader("reader 0").build();
    let module = module_over(&hsm);

    let ro = module.open_session(1, RO).unwrap();
    let rw = module.open_session(1, RW).unwrap();
    assert_eq!(
        module.login(rw, UserType::SecurityOfficer, SO_PIN).unwrap_err(),
        CkError::SessionReadOnlyExists
    );
    module.close_session(ro).unwrap();
    module.login(rw, UserType::SecurityOfficer, SO_PIN).unwrap();
}

#[test]
fn foreign_card_is_not_recognized() {
    let hsm = MockHsm::builder()
        .reader_with("reader 0", MockCard::blank().with_atr(&[0x3B, 0x12, 0x34]))
        .build();
    let module = module_over(&hsm);
    assert!(module.get_slot_list(true).unwrap().is_empty());
    assert_eq!(module.open_session(1, RW).unwrap_err(), CkError::TokenNotRecognized);
}

#[test]
fn pinpad_reader_advertises_protected_path() {
    let hsm = MockHsm::builder().pinpad_reader("pad reader").build();
    let module = module_over(&hsm);
    module.get_slot_list(false).unwrap();
    let info = module.get_token_info(1).unwrap();
    assert_ne!(info.flags & token_flags::PROTECTED_AUTHENTICATION_PATH, 0);
}

#[test]
fn uninitialized_pin_blocks_user_login() {
    let hsm = MockHsm::builder()
        .reader_with("reader 0", MockCard::new().with_uninitialized_pin())
        .build();
    let module = module_over(&hsm);
    let session = module.open_session(1, RW).unwrap();
    assert_eq!(
        module.login(session, UserType::User, DEFAULT_USER_PIN).unwrap_err(),
        CkError::UserPinNotInitialized
    );
}

#[test]
fn removed_reader_invalidates_sessions_then_slot() {
    let hsm = MockHsm::builder().reader("reader 0").build();
    let module = module_over(&hsm);
    let session = module.open_session(1, RW).unwrap();

    hsm.unplug_reader("reader 0");
    // the next enumeration marks (and here also collects) the slot
    assert!(module.get_slot_list(false).unwrap().is_empty());
    assert_eq!(module.get_session_info(session).unwrap_err(), CkError::DeviceRemoved);

    // replugging yields a fresh slot id; the old session stays dead
    hsm.plug_reader("reader 0");
    assert_eq!(module.get_slot_list(false).unwrap(), vec![2]);
    assert_eq!(module.get_session_info(session).unwrap_err(), CkError::DeviceRemoved);
}

#[test]
fn card_swap_is_token_not_present_until_redetected() {
    let hsm = MockHsm::builder().reader("reader 0").build();
    let module = module_over(&hsm);
    let session = module.open_session(1, RW).unwrap();

    hsm.remove_card("reader 0");
    assert_eq!(module.get_session_info(session).unwrap_err(), CkError::TokenNotPresent);

    // a new card in the same reader keeps the slot id and is detected by
    // the next token access
    hsm.insert_default_card("reader 0");
    assert_eq!(module.get_token_info(1).unwrap().label, "SmartCard-HSM");
    let fresh = module.open_session(1, RW).unwrap();
    module.close_session(fresh).unwrap();
}

#[test]
fn migrated_object_visible_only_to_user_sessions() {
    let hsm = MockHsm::builder().reader("reader 0").build();
    let module = module_over(&hsm);
    let session = module.open_session(1, RW).unwrap();
    module.login(session, UserType::User, DEFAULT_USER_PIN).unwrap();

    let handle = module
        .create_object(
            session,
            &[
                Attribute::class(class::DATA),
                Attribute::boolean(attr::TOKEN, false),
                Attribute::boolean(attr::PRIVATE, false),
                Attribute::new(attr::LABEL, b"secret".to_vec()),
                Attribute::new(attr::VALUE, b"payload".to_vec()),
            ],
        )
        .unwrap();
    module
        .set_attribute_value(session, handle, &[Attribute::boolean(attr::PRIVATE, true)])
        .unwrap();

    // logged in: reachable
    module.find_objects_init(session, &[Attribute::new(attr::LABEL, b"secret".to_vec())]).unwrap();
    assert_eq!(module.find_objects(session, 8).unwrap(), vec![handle]);
    module.find_objects_final(session).unwrap();

    // logged out: private objects disappear from search and lookup
    module.logout(session).unwrap();
    module.find_objects_init(session, &[Attribute::new(attr::LABEL, b"secret".to_vec())]).unwrap();
    assert!(module.find_objects(session, 8).unwrap().is_empty());
    module.find_objects_final(session).unwrap();
}

#[test]
fn parallel_session_churn_keeps_counters_balanced() {
    let hsm = MockHsm::builder().reader("reader 0").build();
    let module = Arc::new(module_over(&hsm));
    module.get_slot_list(false).unwrap();

    let mut workers = Vec::new();
    for worker in 0..8 {
        let module = Arc::clone(&module);
        workers.push(thread::spawn(move || {
            for i in 0..25 {
                let flags = if (worker + i) % 2 == 0 { RW } else { RO };
                let session = module.open_session(1, flags).unwrap();
                let _ = module.get_session_info(session);
                module.close_session(session).unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    // the read-only counter drained to zero, so an officer login succeeds
    let rw = module.open_session(1, RW).unwrap();
    module.login(rw, UserType::SecurityOfficer, SO_PIN).unwrap();
    module.close_all_sessions(1).unwrap();
    module.finalize().unwrap();
}
