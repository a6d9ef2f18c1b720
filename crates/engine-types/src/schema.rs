//! # Schema Registry
//!
//! Maps `(topic, action, version)` to a payload shape description and checks
//! envelopes against it. Deliberately structural only: adding optional fields
//! or bumping a version is a registry change, never a broker change.
//!
//! ## Validation Rules
//!
//! - A schema with no fields accepts any payload.
//! - Otherwise the payload must be a JSON object (or `null` when no field is
//!   required).
//! - Required fields must be present and non-null.
//! - Present fields must match their declared kind.
//! - Unknown fields are tolerated (forward compatibility).

use crate::envelope::MessageEnvelope;
use crate::errors::SchemaError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Registry key: the full message type signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaKey {
    pub topic: String,
    pub action: String,
    pub version: String,
}

impl SchemaKey {
    pub fn new(
        topic: impl Into<String>,
        action: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            action: action.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} v{}", self.topic, self.action, self.version)
    }
}

/// Shape of a single payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    /// Homogeneous array.
    Array(Box<FieldKind>),
    /// Nested object, optionally with its own shape.
    Object(Option<PayloadSchema>),
    /// String restricted to an inline value set.
    Enum(Vec<String>),
    /// String restricted to a value table registered on the registry.
    NamedEnum(String),
    Any,
}

/// A named payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Payload shape for one message type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSchema {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl PayloadSchema {
    /// A schema that accepts any payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required field.
    #[must_use]
    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec::required(name, kind));
        self
    }

    /// Add an optional field.
    #[must_use]
    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec::optional(name, kind));
        self
    }

    fn has_required(&self) -> bool {
        self.fields.iter().any(|f| f.required)
    }
}

/// Whether the broker validates every envelope or only on explicit request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Validate every published envelope.
    Strict,
    /// Validate only when asked.
    #[default]
    Permissive,
}

impl FromStr for ValidationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "permissive" => Ok(Self::Permissive),
            other => Err(format!("unknown validation mode: {other}")),
        }
    }
}

/// Registry of payload schemas and enum value tables.
///
/// Every lookup table lives on the instance; there is no process-wide state.
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<SchemaKey, PayloadSchema>>,
    enums: RwLock<HashMap<String, Vec<String>>>,
    mode: ValidationMode,
}

impl SchemaRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(mode: ValidationMode) -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            enums: RwLock::new(HashMap::new()),
            mode,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.mode == ValidationMode::Strict
    }

    /// Register the payload shape of a message type.
    ///
    /// Registering an identical schema again is a no-op.
    ///
    /// # Errors
    ///
    /// - `SchemaError::Conflict` - a different schema is already registered
    pub fn register(
        &self,
        topic: impl Into<String>,
        action: impl Into<String>,
        version: impl Into<String>,
        schema: PayloadSchema,
    ) -> Result<(), SchemaError> {
        let key = SchemaKey::new(topic, action, version);
        let mut schemas = self.schemas.write();

        if let Some(existing) = schemas.get(&key) {
            if *existing == schema {
                return Ok(());
            }
            return Err(SchemaError::Conflict {
                topic: key.topic,
                action: key.action,
                version: key.version,
            });
        }

        debug!(schema = %key, fields = schema.fields.len(), "Schema registered");
        schemas.insert(key, schema);
        Ok(())
    }

    /// Register a named enum value table.
    ///
    /// # Errors
    ///
    /// - `SchemaError::EnumConflict` - the name is taken by a different table
    pub fn register_enum<I, S>(&self, name: impl Into<String>, values: I) -> Result<(), SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let mut enums = self.enums.write();

        match enums.get(&name) {
            Some(existing) if *existing == values => Ok(()),
            Some(_) => Err(SchemaError::EnumConflict { name }),
            None => {
                enums.insert(name, values);
                Ok(())
            }
        }
    }

    /// Values of a registered enum table.
    #[must_use]
    pub fn enum_values(&self, name: &str) -> Option<Vec<String>> {
        self.enums.read().get(name).cloned()
    }

    /// Whether `value` is a member of the named enum table.
    #[must_use]
    pub fn is_enum_member(&self, name: &str, value: &str) -> bool {
        self.enums
            .read()
            .get(name)
            .is_some_and(|values| values.iter().any(|v| v == value))
    }

    #[must_use]
    pub fn contains(&self, topic: &str, action: &str, version: &str) -> bool {
        self.schemas
            .read()
            .contains_key(&SchemaKey::new(topic, action, version))
    }

    /// Number of registered message types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate an envelope against the schema of its message type.
    ///
    /// # Errors
    ///
    /// - `SchemaError::Validation` - no schema registered, or payload mismatch
    pub fn validate(&self, envelope: &MessageEnvelope) -> Result<(), SchemaError> {
        self.validate_payload(
            envelope.topic(),
            envelope.action(),
            envelope.version(),
            envelope.payload(),
        )
    }

    /// Validate a bare payload against a registered message type.
    ///
    /// # Errors
    ///
    /// - `SchemaError::Validation` - no schema registered, or payload mismatch
    pub fn validate_payload(
        &self,
        topic: &str,
        action: &str,
        version: &str,
        payload: &Value,
    ) -> Result<(), SchemaError> {
        let key = SchemaKey::new(topic, action, version);
        let schema = self.schemas.read().get(&key).cloned();

        let fail = |detail: String| SchemaError::Validation {
            topic: topic.to_string(),
            action: action.to_string(),
            version: version.to_string(),
            detail,
        };

        let Some(schema) = schema else {
            return Err(fail("no schema registered".to_string()));
        };

        let enums = self.enums.read();
        check_object(&schema, payload, "payload", &enums).map_err(fail)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new(ValidationMode::default())
    }
}

fn check_object(
    schema: &PayloadSchema,
    value: &Value,
    path: &str,
    enums: &HashMap<String, Vec<String>>,
) -> Result<(), String> {
    if schema.fields.is_empty() {
        return Ok(());
    }

    let empty = Map::new();
    let object = match value {
        Value::Object(object) => object,
        Value::Null if !schema.has_required() => &empty,
        other => {
            return Err(format!(
                "{path} must be an object, found {}",
                json_type(other)
            ))
        }
    };

    for field in &schema.fields {
        let field_path = format!("{path}.{}", field.name);
        match object.get(&field.name) {
            None | Some(Value::Null) => {
                if field.required {
                    return Err(format!("missing required field {field_path}"));
                }
            }
            Some(field_value) => check_kind(&field.kind, field_value, &field_path, enums)?,
        }
    }

    Ok(())
}

fn check_kind(
    kind: &FieldKind,
    value: &Value,
    path: &str,
    enums: &HashMap<String, Vec<String>>,
) -> Result<(), String> {
    let mismatch = |expected: &str| {
        Err(format!(
            "{path} must be {expected}, found {}",
            json_type(value)
        ))
    };

    match kind {
        FieldKind::Any => Ok(()),
        FieldKind::String if value.is_string() => Ok(()),
        FieldKind::String => mismatch("a string"),
        FieldKind::Integer if value.is_i64() || value.is_u64() => Ok(()),
        FieldKind::Integer => mismatch("an integer"),
        FieldKind::Number if value.is_number() => Ok(()),
        FieldKind::Number => mismatch("a number"),
        FieldKind::Boolean if value.is_boolean() => Ok(()),
        FieldKind::Boolean => mismatch("a boolean"),
        FieldKind::Array(inner) => {
            let Some(items) = value.as_array() else {
                return mismatch("an array");
            };
            for (index, item) in items.iter().enumerate() {
                check_kind(inner, item, &format!("{path}[{index}]"), enums)?;
            }
            Ok(())
        }
        FieldKind::Object(None) if value.is_object() => Ok(()),
        FieldKind::Object(None) => mismatch("an object"),
        FieldKind::Object(Some(nested)) => {
            if !value.is_object() {
                return mismatch("an object");
            }
            check_object(nested, value, path, enums)
        }
        FieldKind::Enum(values) => check_member(values, value, path),
        FieldKind::NamedEnum(name) => match enums.get(name) {
            Some(values) => check_member(values, value, path),
            None => Err(format!("{path} refers to unknown enum {name}")),
        },
    }
}

fn check_member(values: &[String], value: &Value, path: &str) -> Result<(), String> {
    match value.as_str() {
        Some(s) if values.iter().any(|v| v == s) => Ok(()),
        Some(s) => Err(format!("{path} has invalid value {s}")),
        None => Err(format!(
            "{path} must be an enum string, found {}",
            json_type(value)
        )),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set_property_schema() -> PayloadSchema {
        PayloadSchema::new()
            .required("name", FieldKind::String)
            .required("value", FieldKind::String)
    }

    fn registry() -> SchemaRegistry {
        let registry = SchemaRegistry::new(ValidationMode::Strict);
        registry
            .register("PropertyManager", "SetProperty", "3.2", set_property_schema())
            .unwrap();
        registry
    }

    #[test]
    fn test_register_identical_is_noop() {
        let registry = registry();
        registry
            .register("PropertyManager", "SetProperty", "3.2", set_property_schema())
            .unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_register_conflict() {
        let registry = registry();
        let result = registry.register(
            "PropertyManager",
            "SetProperty",
            "3.2",
            PayloadSchema::new().required("name", FieldKind::Integer),
        );
        assert!(matches!(result, Err(SchemaError::Conflict { .. })));
    }

    #[test]
    fn test_new_version_is_independent() {
        let registry = registry();
        registry
            .register(
                "PropertyManager",
                "SetProperty",
                "4.0",
                set_property_schema().optional("persist", FieldKind::Boolean),
            )
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_validate_accepts_unknown_fields() {
        let registry = registry();
        let envelope = MessageEnvelope::publish(
            "PropertyManager",
            "SetProperty",
            "3.2",
            json!({"name": "locale", "value": "en-US", "addedLater": 7}),
        );
        assert!(registry.validate(&envelope).is_ok());
    }

    #[test]
    fn test_validate_missing_required_field() {
        let registry = registry();
        let envelope = MessageEnvelope::publish(
            "PropertyManager",
            "SetProperty",
            "3.2",
            json!({"name": "locale"}),
        );
        let Err(SchemaError::Validation { detail, version, .. }) = registry.validate(&envelope)
        else {
            panic!("expected validation error");
        };
        assert!(detail.contains("payload.value"));
        assert_eq!(version, "3.2");
    }

    #[test]
    fn test_validate_unregistered_version() {
        let registry = registry();
        let envelope = MessageEnvelope::publish(
            "PropertyManager",
            "SetProperty",
            "9.9",
            json!({"name": "locale", "value": "en-US"}),
        );
        let Err(SchemaError::Validation { detail, .. }) = registry.validate(&envelope) else {
            panic!("expected validation error");
        };
        assert_eq!(detail, "no schema registered");
    }

    #[test]
    fn test_validate_wrong_type() {
        let registry = registry();
        let result = registry.validate_payload(
            "PropertyManager",
            "SetProperty",
            "3.2",
            &json!({"name": 1, "value": "x"}),
        );
        assert!(matches!(result, Err(SchemaError::Validation { .. })));
    }

    #[test]
    fn test_named_enum_owned_by_registry() {
        let registry = SchemaRegistry::default();
        registry
            .register_enum("AlertState", ["READY", "STARTED", "STOPPED", "SNOOZED"])
            .unwrap();
        registry
            .register(
                "Alerts",
                "AlertStateChanged",
                "1.0",
                PayloadSchema::new()
                    .required("alertToken", FieldKind::String)
                    .required("state", FieldKind::NamedEnum("AlertState".into())),
            )
            .unwrap();

        assert!(registry.is_enum_member("AlertState", "SNOOZED"));
        assert!(registry
            .validate_payload(
                "Alerts",
                "AlertStateChanged",
                "1.0",
                &json!({"alertToken": "t", "state": "STARTED"}),
            )
            .is_ok());
        assert!(registry
            .validate_payload(
                "Alerts",
                "AlertStateChanged",
                "1.0",
                &json!({"alertToken": "t", "state": "EXPLODED"}),
            )
            .is_err());

        // A second registry shares nothing with the first.
        assert!(SchemaRegistry::default().enum_values("AlertState").is_none());
    }

    #[test]
    fn test_enum_conflict() {
        let registry = SchemaRegistry::default();
        registry.register_enum("Focus", ["FOREGROUND"]).unwrap();
        registry.register_enum("Focus", ["FOREGROUND"]).unwrap();
        assert!(matches!(
            registry.register_enum("Focus", ["BACKGROUND"]),
            Err(SchemaError::EnumConflict { .. })
        ));
    }

    #[test]
    fn test_nested_array_of_objects() {
        let registry = SchemaRegistry::default();
        let entry = PayloadSchema::new().required("name", FieldKind::String);
        registry
            .register(
                "AddressBook",
                "AddNames",
                "1.0",
                PayloadSchema::new().required(
                    "names",
                    FieldKind::Array(Box::new(FieldKind::Object(Some(entry)))),
                ),
            )
            .unwrap();

        let bad = json!({"names": [{"name": "a"}, {"nick": "b"}]});
        let Err(SchemaError::Validation { detail, .. }) =
            registry.validate_payload("AddressBook", "AddNames", "1.0", &bad)
        else {
            panic!("expected validation error");
        };
        assert!(detail.contains("payload.names[1].name"));
    }

    #[test]
    fn test_null_payload_with_optional_fields_only() {
        let registry = SchemaRegistry::default();
        registry
            .register(
                "Network",
                "GetStatus",
                "1.0",
                PayloadSchema::new().optional("verbose", FieldKind::Boolean),
            )
            .unwrap();
        assert!(registry
            .validate_payload("Network", "GetStatus", "1.0", &Value::Null)
            .is_ok());
    }

    #[test]
    fn test_validation_mode_parse() {
        assert_eq!("STRICT".parse::<ValidationMode>(), Ok(ValidationMode::Strict));
        assert!("loose".parse::<ValidationMode>().is_err());
    }
}
