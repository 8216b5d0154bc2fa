//! Object operations: create/destroy, size, attributes, search.

use std::sync::Arc;

use crate::error::{CkError, Result};
use crate::object::{attr, Attribute, AttributeQuery, Object, ObjectHandle};
use crate::p11::sessions::find_session_and_lock_slot;
use crate::p11::Module;
use crate::session::{SearchState, SessionData, SessionHandle, SessionState};
use crate::slot::SlotGuard;

/// Where an object handle resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Session,
    TokenPublic,
    TokenPrivate,
}

fn object_mut<'a>(
    location: Location,
    data: &'a mut SessionData,
    guard: &'a mut SlotGuard,
    handle: ObjectHandle,
) -> Result<&'a mut Object> {
    let object = match location {
        Location::Session => data.find_object_mut(handle),
        Location::TokenPublic => guard
            .token_mut()
            .ok_or(CkError::TokenNotPresent)?
            .find_object_mut(handle, true),
        Location::TokenPrivate => guard
            .token_mut()
            .ok_or(CkError::TokenNotPresent)?
            .find_object_mut(handle, false),
    };
    object.ok_or(CkError::ObjectHandleInvalid)
}

impl Module {
    /// Create an object from an attribute template.
    ///
    /// Only data-class objects are supported. Token objects require a
    /// read-write user session and are persisted immediately; if
    /// persistence fails the object is unlinked again.
    pub fn create_object(
        &self,
        session_handle: SessionHandle,
        template: &[Attribute],
    ) -> Result<ObjectHandle> {
        let ctx = self.ctx()?;
        let (session, mut guard) = find_session_and_lock_slot(&ctx, session_handle)?;
        let object = Object::data_from_template(template)?;

        if object.token_obj {
            let token = guard.token().ok_or(CkError::DeviceRemoved)?;
            if SessionState::of(session.flags(), token) != SessionState::RwUserFunctions {
                return Err(CkError::SessionReadOnly);
            }
            let public = object.public_obj;
            let handle = guard
                .token_mut()
                .ok_or(CkError::DeviceRemoved)?
                .add_object(object, public);
            if let Err(e) = guard.synchronize_token() {
                if let Some(token) = guard.token_mut() {
                    token.take_object(handle, public);
                }
                return Err(e);
            }
            Ok(handle)
        } else {
            Ok(session.data().lock().add_object(object))
        }
    }

    /// Object copying is not offered.
    pub fn copy_object(&self, session_handle: SessionHandle, _object: ObjectHandle) -> Result<ObjectHandle> {
        let ctx = self.ctx()?;
        let _ = find_session_and_lock_slot(&ctx, session_handle)?;
        Err(CkError::FunctionNotSupported)
    }

    /// Destroy an object: session objects are unlinked directly, token
    /// objects are removed from the card and synchronised.
    pub fn destroy_object(
        &self,
        session_handle: SessionHandle,
        object_handle: ObjectHandle,
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let (session, mut guard) = find_session_and_lock_slot(&ctx, session_handle)?;

        let mut data = session.data().lock();
        if data.remove_object(object_handle).is_some() {
            return Ok(());
        }
        drop(data);

        let token = guard.token().ok_or(CkError::DeviceRemoved)?;
        let state = SessionState::of(session.flags(), token);
        let token = guard.token_mut().ok_or(CkError::DeviceRemoved)?;
        let removed = if token.take_object(object_handle, true).is_some() {
            true
        } else if state == SessionState::RwUserFunctions {
            token.take_object(object_handle, false).is_some()
        } else {
            false
        };
        if !removed {
            return Err(CkError::ObjectHandleInvalid);
        }
        guard.synchronize_token().map_err(|_| CkError::FunctionFailed)
    }

    /// Size of the serialized object.
    pub fn get_object_size(
        &self,
        session_handle: SessionHandle,
        object_handle: ObjectHandle,
    ) -> Result<usize> {
        let ctx = self.ctx()?;
        let (session, guard) = find_session_and_lock_slot(&ctx, session_handle)?;
        let data = session.data().lock();
        let object = locate(&session, &guard, &data, object_handle)?;
        Ok(object.serialized_size())
    }

    /// Read attributes into `queries` cells.
    ///
    /// Every cell is populated regardless of failures; the returned error is
    /// the one observed on the *last* failing cell, so a trailing "buffer
    /// too small" overwrites an earlier "sensitive" or "type invalid".
    pub fn get_attribute_value(
        &self,
        session_handle: SessionHandle,
        object_handle: ObjectHandle,
        queries: &mut [AttributeQuery],
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let (session, guard) = find_session_and_lock_slot(&ctx, session_handle)?;
        let data = session.data().lock();
        let object = locate(&session, &guard, &data, object_handle)?;

        let mut verdict = Ok(());
        for query in queries.iter_mut() {
            if let Some(e) = object.query_attribute(query) {
                verdict = Err(e);
            }
        }
        verdict
    }

    /// Write attributes.
    ///
    /// Token objects may only be modified in a read-write user session.
    /// Flipping the private flag from false to true migrates the object
    /// onto the token's private list; the reverse change is forbidden. If
    /// synchronisation fails after a migration the object stays migrated
    /// and the error is reported.
    pub fn set_attribute_value(
        &self,
        session_handle: SessionHandle,
        object_handle: ObjectHandle,
        template: &[Attribute],
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let (session, mut guard) = find_session_and_lock_slot(&ctx, session_handle)?;
        let mut data = session.data().lock();

        let token = guard.token().ok_or(CkError::DeviceRemoved)?;
        let state = SessionState::of(session.flags(), token);
        let mut location = if data.find_object(object_handle).is_some() {
            Location::Session
        } else {
            if state != SessionState::RwUserFunctions {
                return Err(CkError::ObjectHandleInvalid);
            }
            if token.find_object(object_handle, true).is_some() {
                Location::TokenPublic
            } else if token.find_object(object_handle, false).is_some() {
                Location::TokenPrivate
            } else {
                return Err(CkError::ObjectHandleInvalid);
            }
        };

        for attribute in template {
            let object = object_mut(location, &mut data, &mut guard, object_handle)?;
            let Some(current) = object.attribute(attribute.kind) else {
                // no manufacturer-specific attributes
                return Err(CkError::TemplateIncomplete);
            };

            if attribute.kind == attr::PRIVATE {
                let old = current.as_bool();
                let new = attribute.as_bool();
                if old && !new {
                    return Err(CkError::TemplateInconsistent);
                }
                if !old && new {
                    location = self.migrate_to_private(
                        location,
                        &mut data,
                        &mut guard,
                        object_handle,
                    )?;
                }
            } else {
                let object = object_mut(location, &mut data, &mut guard, object_handle)?;
                let Some(current) = object.attribute_mut(attribute.kind) else {
                    return Err(CkError::TemplateIncomplete);
                };
                current.value = attribute.value.clone();
                object.dirty = true;
                guard.synchronize_token()?;
            }
        }
        Ok(())
    }

    /// Public→private migration: unlink the object where it lives, relink
    /// it as a private token object under the same handle, synchronise.
    fn migrate_to_private(
        &self,
        location: Location,
        data: &mut SessionData,
        guard: &mut SlotGuard,
        object_handle: ObjectHandle,
    ) -> Result<Location> {
        let mut moved = match location {
            Location::Session => data
                .remove_object(object_handle)
                .ok_or(CkError::ObjectHandleInvalid)?,
            Location::TokenPublic => guard
                .token_mut()
                .ok_or(CkError::DeviceRemoved)?
                .take_object(object_handle, true)
                .ok_or(CkError::ObjectHandleInvalid)?,
            Location::TokenPrivate => return Ok(Location::TokenPrivate),
        };
        if let Some(private_attr) = moved.attribute_mut(attr::PRIVATE) {
            private_attr.value = vec![1];
        }
        moved.token_obj = true;
        moved.public_obj = false;
        moved.dirty = true;
        guard
            .token_mut()
            .ok_or(CkError::DeviceRemoved)?
            .add_object(moved, false);
        guard.synchronize_token()?;
        Ok(Location::TokenPrivate)
    }

    /// Start a snapshot search over session and token objects matching
    /// every attribute of `template` exactly.
    pub fn find_objects_init(
        &self,
        session_handle: SessionHandle,
        template: &[Attribute],
    ) -> Result<()> {
        let ctx = self.ctx()?;
        let (session, guard) = find_session_and_lock_slot(&ctx, session_handle)?;
        let mut data = session.data().lock();
        // an unfinished search is dropped
        data.search = None;

        let token = guard.token().ok_or(CkError::DeviceRemoved)?;
        let state = SessionState::of(session.flags(), token);

        let mut handles: Vec<ObjectHandle> = Vec::new();
        for object in data.objects() {
            if object.matches_template(template) {
                handles.push(object.handle);
            }
        }
        for object in token.public_objects() {
            if object.matches_template(template) {
                handles.push(object.handle);
            }
        }
        if state.is_user() {
            for object in token.private_objects() {
                if object.matches_template(template) {
                    handles.push(object.handle);
                }
            }
        }
        data.search = Some(SearchState { handles, collected: 0 });
        Ok(())
    }

    /// Return up to `max` handles from the running search.
    pub fn find_objects(
        &self,
        session_handle: SessionHandle,
        max: usize,
    ) -> Result<Vec<ObjectHandle>> {
        let ctx = self.ctx()?;
        let (session, _guard) = find_session_and_lock_slot(&ctx, session_handle)?;
        let mut data = session.data().lock();
        let Some(search) = data.search.as_mut() else {
            return Ok(Vec::new());
        };
        let remaining = search.handles.len() - search.collected;
        let count = remaining.min(max);
        let page = search.handles[search.collected..search.collected + count].to_vec();
        search.collected += count;
        Ok(page)
    }

    /// Drop the search snapshot.
    pub fn find_objects_final(&self, session_handle: SessionHandle) -> Result<()> {
        let ctx = self.ctx()?;
        let (session, _guard) = find_session_and_lock_slot(&ctx, session_handle)?;
        session.data().lock().search = None;
        Ok(())
    }
}

/// Resolve an object handle for read access: session objects first, then
/// public token objects, then private token objects when the session is in
/// a user state.
fn locate<'a>(
    session: &Arc<crate::session::Session>,
    guard: &'a SlotGuard,
    data: &'a SessionData,
    handle: ObjectHandle,
) -> Result<&'a Object> {
    if let Some(object) = data.find_object(handle) {
        return Ok(object);
    }
    let token = guard.token().ok_or(CkError::DeviceRemoved)?;
    if let Some(object) = token.find_object(handle, true) {
        return Ok(object);
    }
    let state = SessionState::of(session.flags(), token);
    if state.is_user() {
        if let Some(object) = token.find_object(handle, false) {
            return Ok(object);
        }
    }
    Err(CkError::ObjectHandleInvalid)
}
