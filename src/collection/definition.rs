// Collection and index definitions.
//
// An index definition names the indexed field path (or composite field
// list), uniqueness, sparseness, the required flag, and an optional
// extractor computing the key from the whole document. Document
// validation is pluggable; the built-in schema validator checks required
// fields and property types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{DbError, Result};
use crate::index::IndexKey;

/// Computes an index key from a whole document.
pub type KeyExtractor = Arc<dyn Fn(&Value) -> Option<IndexKey> + Send + Sync>;

/// Default separator for composite keys rendered as strings.
const DEFAULT_SEPARATOR: &str = ":";

/// Definition of one collection index.
#[derive(Clone)]
pub struct IndexDefinition {
    /// Index name, unique within the collection.
    pub name: String,
    /// Field paths (dot-separated); more than one makes a composite key.
    pub fields: Vec<String>,
    /// At most one document id per key.
    pub unique: bool,
    /// Skip documents whose key is null or missing instead of indexing
    /// them under the null key.
    pub sparse: bool,
    /// Reject documents whose key is null or missing.
    pub required: bool,
    /// Separator joining composite key parts into one string key; when
    /// absent composite keys stay structural.
    pub separator: Option<String>,
    /// Optional extractor overriding field access.
    pub extractor: Option<KeyExtractor>,
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("unique", &self.unique)
            .field("sparse", &self.sparse)
            .field("required", &self.required)
            .field("separator", &self.separator)
            .field("extractor", &self.extractor.is_some())
            .finish()
    }
}

impl IndexDefinition {
    /// Single-field index over `field`.
    pub fn field(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: vec![field.into()],
            unique: false,
            sparse: false,
            required: false,
            separator: None,
            extractor: None,
        }
    }

    /// Composite index over several fields joined by `separator`.
    pub fn composite(
        name: impl Into<String>,
        fields: Vec<String>,
        separator: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            fields,
            unique: false,
            sparse: false,
            required: false,
            separator: separator.or_else(|| Some(DEFAULT_SEPARATOR.to_string())),
            extractor: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_extractor(
        mut self,
        extractor: impl Fn(&Value) -> Option<IndexKey> + Send + Sync + 'static,
    ) -> Self {
        self.extractor = Some(Arc::new(extractor));
        self
    }

    /// Raw key for the document: extractor first, otherwise field access
    /// (composite keys concatenate with the declared separator). `None`
    /// when the key is null or any composite part is missing.
    pub fn compute_key(&self, document: &Value) -> Option<IndexKey> {
        if let Some(extractor) = &self.extractor {
            return extractor(document);
        }

        if self.fields.len() == 1 {
            let value = lookup_path(document, &self.fields[0])?;
            let key = IndexKey::from_json(value);
            if key.is_null() {
                return None;
            }
            return Some(key);
        }

        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = lookup_path(document, field)?;
            let key = IndexKey::from_json(value);
            if key.is_null() {
                return None;
            }
            parts.push(key);
        }

        match &self.separator {
            Some(sep) => {
                let joined: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
                Some(IndexKey::Str(joined.join(sep)))
            }
            None => Some(IndexKey::composite(parts)),
        }
    }

    /// Key to index for the document, applying sparse/required rules:
    /// `Ok(None)` means "skip this document".
    pub fn key_for(&self, document: &Value) -> Result<Option<IndexKey>> {
        match self.compute_key(document) {
            Some(key) => Ok(Some(key)),
            None if self.required => Err(DbError::Validation(format!(
                "index {}: required key is null or missing",
                self.name
            ))),
            None if self.sparse => Ok(None),
            None => Ok(Some(IndexKey::Null)),
        }
    }
}

/// Dot-separated field path traversal.
fn lookup_path<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Result of validating a document against a collection's schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Success,
    Failure { errors: Vec<String> },
}

impl ValidationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ValidationOutcome::Success)
    }

    pub fn errors(&self) -> &[String] {
        match self {
            ValidationOutcome::Success => &[],
            ValidationOutcome::Failure { errors } => errors,
        }
    }
}

/// Pluggable document validator.
pub trait DocumentValidator: Send + Sync {
    fn validate(&self, document: &Value) -> ValidationOutcome;
}

/// Validator accepting every document.
pub struct AcceptAllValidator;

impl DocumentValidator for AcceptAllValidator {
    fn validate(&self, _document: &Value) -> ValidationOutcome {
        ValidationOutcome::Success
    }
}

/// Expected JSON type of a schema property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl PropertyType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            PropertyType::String => value.is_string(),
            PropertyType::Number => value.is_number(),
            PropertyType::Integer => value.is_i64() || value.is_u64(),
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::Object => value.is_object(),
            PropertyType::Array => value.is_array(),
            PropertyType::Any => true,
        }
    }
}

/// Schema validator: required properties, property types, and whether
/// undeclared properties are allowed.
#[derive(Debug, Clone, Default)]
pub struct SchemaValidator {
    required: Vec<String>,
    properties: HashMap<String, PropertyType>,
    deny_additional: bool,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, property: impl Into<String>) -> Self {
        self.required.push(property.into());
        self
    }

    pub fn property(mut self, name: impl Into<String>, property_type: PropertyType) -> Self {
        self.properties.insert(name.into(), property_type);
        self
    }

    pub fn deny_additional(mut self) -> Self {
        self.deny_additional = true;
        self
    }
}

impl DocumentValidator for SchemaValidator {
    fn validate(&self, document: &Value) -> ValidationOutcome {
        let Some(object) = document.as_object() else {
            return ValidationOutcome::Failure {
                errors: vec!["document must be an object".to_string()],
            };
        };

        let mut errors = Vec::new();

        for required in &self.required {
            if !object.contains_key(required) {
                errors.push(format!("required property '{}' is missing", required));
            }
        }

        for (key, value) in object {
            match self.properties.get(key) {
                Some(property_type) => {
                    if !value.is_null() && !property_type.matches(value) {
                        errors.push(format!(
                            "property '{}' has unexpected type (wanted {:?})",
                            key, property_type
                        ));
                    }
                }
                None => {
                    if self.deny_additional {
                        errors.push(format!("additional property '{}' is not allowed", key));
                    }
                }
            }
        }

        if errors.is_empty() {
            ValidationOutcome::Success
        } else {
            ValidationOutcome::Failure { errors }
        }
    }
}

/// Configuration of one collection.
#[derive(Clone)]
pub struct CollectionConfig {
    pub name: String,
    /// Field holding the primary identifier.
    pub id_field: String,
    pub validator: Option<Arc<dyn DocumentValidator>>,
    pub indexes: Vec<IndexDefinition>,
}

impl fmt::Debug for CollectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionConfig")
            .field("name", &self.name)
            .field("id_field", &self.id_field)
            .field("validator", &self.validator.is_some())
            .field("indexes", &self.indexes)
            .finish()
    }
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id_field: "id".to_string(),
            validator: None,
            indexes: Vec::new(),
        }
    }

    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn validator(mut self, validator: Arc<dyn DocumentValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn index(mut self, definition: IndexDefinition) -> Self {
        self.indexes.push(definition);
        self
    }
}
