//! Objects and attributes.
//!
//! An object is a stable handle plus a list of typed attributes. Objects
//! carry flags deciding where they live (session vs token, public vs
//! private) and whether their value attribute may be read back.

use crate::error::{CkError, Result};

pub type ObjectHandle = u64;

/// Attribute type codes (the subset the data-object class uses).
pub mod attr {
    pub const CLASS: u32 = 0x0000;
    pub const TOKEN: u32 = 0x0001;
    pub const PRIVATE: u32 = 0x0002;
    pub const LABEL: u32 = 0x0003;
    pub const APPLICATION: u32 = 0x0010;
    pub const VALUE: u32 = 0x0011;
    pub const OBJECT_ID: u32 = 0x0012;
}

/// Object classes. Only data objects can be created through this module.
pub mod class {
    pub const DATA: u64 = 0x0000;
}

/// One typed attribute: type code plus raw value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub kind: u32,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(kind: u32, value: impl Into<Vec<u8>>) -> Attribute {
        Attribute { kind, value: value.into() }
    }

    /// A class attribute carries an 8-byte little-endian class code.
    pub fn class(value: u64) -> Attribute {
        Attribute::new(attr::CLASS, value.to_le_bytes().to_vec())
    }

    /// A boolean attribute is a single byte, non-zero for true.
    pub fn boolean(kind: u32, value: bool) -> Attribute {
        Attribute::new(kind, vec![u8::from(value)])
    }

    pub fn as_bool(&self) -> bool {
        self.value.first().is_some_and(|b| *b != 0)
    }
}

/// Outcome cell of a single [`get`](Object) attribute query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrQueryResult {
    /// Not yet filled in.
    Pending,
    /// Unknown attribute type or sensitive value: the length sentinel.
    Unavailable,
    /// Length inquiry, or the supplied buffer was too small: true length.
    Length(usize),
    /// Value copied out.
    Value(Vec<u8>),
}

/// One cell of a multi-attribute query.
#[derive(Debug, Clone)]
pub struct AttributeQuery {
    pub kind: u32,
    /// `None` asks only for the length; `Some(n)` offers an `n`-byte buffer.
    pub capacity: Option<usize>,
    pub result: AttrQueryResult,
}

impl AttributeQuery {
    pub fn length_of(kind: u32) -> AttributeQuery {
        AttributeQuery { kind, capacity: None, result: AttrQueryResult::Pending }
    }

    pub fn value_of(kind: u32, capacity: usize) -> AttributeQuery {
        AttributeQuery { kind, capacity: Some(capacity), result: AttrQueryResult::Pending }
    }
}

// ============================================================================
// OBJECT
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Object {
    pub handle: ObjectHandle,
    pub attributes: Vec<Attribute>,
    /// Persisted on the token (as opposed to living in a session).
    pub token_obj: bool,
    pub public_obj: bool,
    /// The value attribute of a sensitive object cannot be read back.
    pub sensitive_obj: bool,
    /// Set on every mutation; cleared by token synchronisation.
    pub dirty: bool,
}

impl Object {
    /// Build a data-class object from a creation template.
    ///
    /// The template must carry the class attribute with an 8-byte-encoded
    /// class value; only [`class::DATA`] is supported.
    pub fn data_from_template(template: &[Attribute]) -> Result<Object> {
        let class_attr = template
            .iter()
            .find(|a| a.kind == attr::CLASS)
            .ok_or(CkError::TemplateIncomplete)?;
        if class_attr.value.len() != 8 {
            return Err(CkError::AttributeValueInvalid);
        }
        let mut class_bytes = [0u8; 8];
        class_bytes.copy_from_slice(&class_attr.value);
        let class = u64::from_le_bytes(class_bytes);
        if class != class::DATA {
            return Err(CkError::FunctionFailed);
        }

        let mut object = Object::default();
        let mut token_obj = false;
        let mut public_obj = true;
        for a in template {
            match a.kind {
                attr::TOKEN => token_obj = a.as_bool(),
                attr::PRIVATE => public_obj = !a.as_bool(),
                _ => {}
            }
            object.attributes.push(a.clone());
        }
        // storage attributes the template may omit still exist on the object
        if !template.iter().any(|a| a.kind == attr::TOKEN) {
            object.attributes.push(Attribute::boolean(attr::TOKEN, false));
        }
        if !template.iter().any(|a| a.kind == attr::PRIVATE) {
            object.attributes.push(Attribute::boolean(attr::PRIVATE, false));
        }
        object.token_obj = token_obj;
        object.public_obj = public_obj;
        Ok(object)
    }

    pub fn attribute(&self, kind: u32) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.kind == kind)
    }

    pub fn attribute_mut(&mut self, kind: u32) -> Option<&mut Attribute> {
        self.attributes.iter_mut().find(|a| a.kind == kind)
    }

    /// Exact-match template predicate: every template attribute must exist
    /// with the same type, length and bytes.
    pub fn matches_template(&self, template: &[Attribute]) -> bool {
        template.iter().all(|t| {
            self.attribute(t.kind)
                .is_some_and(|a| a.value == t.value)
        })
    }

    /// Size of the serialized object: per attribute a type word, a length
    /// word and the value bytes.
    pub fn serialized_size(&self) -> usize {
        self.attributes
            .iter()
            .map(|a| 4 + 4 + a.value.len())
            .sum()
    }

    /// Fill one query cell per the attribute-read policy. Returns the error
    /// kind observed for this cell, if any.
    pub fn query_attribute(&self, query: &mut AttributeQuery) -> Option<CkError> {
        let Some(attribute) = self.attribute(query.kind) else {
            query.result = AttrQueryResult::Unavailable;
            return Some(CkError::AttributeTypeInvalid);
        };
        if query.kind == attr::VALUE && self.sensitive_obj {
            query.result = AttrQueryResult::Unavailable;
            return Some(CkError::AttributeSensitive);
        }
        match query.capacity {
            None => {
                query.result = AttrQueryResult::Length(attribute.value.len());
                None
            }
            Some(capacity) if capacity >= attribute.value.len() => {
                query.result = AttrQueryResult::Value(attribute.value.clone());
                None
            }
            Some(_) => {
                query.result = AttrQueryResult::Length(attribute.value.len());
                Some(CkError::BufferTooSmall)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_template(private: bool) -> Vec<Attribute> {
        vec![
            Attribute::class(class::DATA),
            Attribute::boolean(attr::TOKEN, false),
            Attribute::boolean(attr::PRIVATE, private),
            Attribute::new(attr::LABEL, b"note".to_vec()),
            Attribute::new(attr::VALUE, b"payload".to_vec()),
        ]
    }

    #[test]
    fn data_object_from_template() {
        let object = Object::data_from_template(&data_template(false)).unwrap();
        assert!(!object.token_obj);
        assert!(object.public_obj);
        assert_eq!(object.attribute(attr::VALUE).unwrap().value, b"payload");
    }

    #[test]
    fn class_attribute_is_mandatory() {
        let template = vec![Attribute::boolean(attr::TOKEN, false)];
        assert_eq!(
            Object::data_from_template(&template).unwrap_err(),
            CkError::TemplateIncomplete
        );
    }

    #[test]
    fn class_value_must_be_eight_bytes() {
        let template = vec![Attribute::new(attr::CLASS, vec![0u8; 4])];
        assert_eq!(
            Object::data_from_template(&template).unwrap_err(),
            CkError::AttributeValueInvalid
        );
    }

    #[test]
    fn only_data_class_supported() {
        let template = vec![Attribute::class(0x0002)];
        assert_eq!(
            Object::data_from_template(&template).unwrap_err(),
            CkError::FunctionFailed
        );
    }

    #[test]
    fn template_matching_is_exact() {
        let object = Object::data_from_template(&data_template(false)).unwrap();
        assert!(object.matches_template(&[Attribute::new(attr::LABEL, b"note".to_vec())]));
        assert!(!object.matches_template(&[Attribute::new(attr::LABEL, b"Note".to_vec())]));
        assert!(!object.matches_template(&[Attribute::new(attr::LABEL, b"not".to_vec())]));
        assert!(!object.matches_template(&[Attribute::new(0x9999, b"note".to_vec())]));
        assert!(object.matches_template(&[]));
    }

    #[test]
    fn query_policy_length_inquiry() {
        let object = Object::data_from_template(&data_template(false)).unwrap();
        let mut q = AttributeQuery::length_of(attr::VALUE);
        assert_eq!(object.query_attribute(&mut q), None);
        assert_eq!(q.result, AttrQueryResult::Length(7));
    }

    #[test]
    fn query_policy_buffer_too_small() {
        let object = Object::data_from_template(&data_template(false)).unwrap();
        let mut q = AttributeQuery::value_of(attr::VALUE, 3);
        assert_eq!(object.query_attribute(&mut q), Some(CkError::BufferTooSmall));
        assert_eq!(q.result, AttrQueryResult::Length(7));
    }

    #[test]
    fn query_policy_sensitive_and_unknown() {
        let mut object = Object::data_from_template(&data_template(true)).unwrap();
        object.sensitive_obj = true;

        let mut q = AttributeQuery::value_of(attr::VALUE, 64);
        assert_eq!(object.query_attribute(&mut q), Some(CkError::AttributeSensitive));
        assert_eq!(q.result, AttrQueryResult::Unavailable);

        let mut q = AttributeQuery::value_of(0x4444, 64);
        assert_eq!(object.query_attribute(&mut q), Some(CkError::AttributeTypeInvalid));
        assert_eq!(q.result, AttrQueryResult::Unavailable);
    }
}
