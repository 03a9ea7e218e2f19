//! Property descriptors and normalization.

use crate::error::Error;
use crate::value::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// The storage type of a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyType {
    /// Text string
    Text,
    /// Floating point number
    Number,
    /// 64-bit integer
    Integer,
    /// Boolean
    Boolean,
    /// Timestamp
    Date,
    /// Structured object payload
    Object,
    /// Auto-generated integer key
    Serial,
    /// Binary data
    Binary,
    /// Geometric point
    Point,
    /// A type registered on the engine by name
    Custom(String),
}

impl PropertyType {
    /// Name used in declarations and diagnostics.
    pub fn name(&self) -> &str {
        match self {
            PropertyType::Text => "text",
            PropertyType::Number => "number",
            PropertyType::Integer => "integer",
            PropertyType::Boolean => "boolean",
            PropertyType::Date => "date",
            PropertyType::Object => "object",
            PropertyType::Serial => "serial",
            PropertyType::Binary => "binary",
            PropertyType::Point => "point",
            PropertyType::Custom(name) => name,
        }
    }
}

/// Generator for property default values.
pub type DefaultFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// A fully-normalized property descriptor.
///
/// Built either directly or through [`Property::normalize`] from a schema
/// declaration. Once attached to a model the descriptor never changes.
#[derive(Clone)]
pub struct Property {
    /// Logical name used on instances
    pub name: String,
    /// Storage column name
    pub maps_to: String,
    /// Storage type
    pub kind: PropertyType,
    /// Part of the model key
    pub key: bool,
    /// Must be non-null to save
    pub required: bool,
    /// Excluded from the default projection, loaded on demand
    pub lazyload: bool,
    /// Visible in plain-data renderings of an instance
    pub enumerable: bool,
    /// Run validations even when the value is null
    pub always_validate: bool,
    /// Static default value
    pub default: Option<Value>,
    /// Generated default value, wins over `default`
    pub default_fn: Option<DefaultFn>,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("maps_to", &self.maps_to)
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("required", &self.required)
            .field("lazyload", &self.lazyload)
            .field("enumerable", &self.enumerable)
            .field("always_validate", &self.always_validate)
            .field("default", &self.default)
            .field("has_default_fn", &self.default_fn.is_some())
            .finish()
    }
}

impl Property {
    /// Create a property of the given type with defaults filled in.
    pub fn new(name: impl Into<String>, kind: PropertyType) -> Self {
        let name = name.into();
        Self {
            maps_to: name.clone(),
            name,
            kind,
            key: false,
            required: false,
            lazyload: false,
            enumerable: true,
            always_validate: false,
            default: None,
            default_fn: None,
        }
    }

    /// Create a serial key property, the shape used for synthetic `id` keys.
    pub fn serial_key(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Serial).with_key(true)
    }

    /// Set the storage column name.
    #[must_use]
    pub fn with_maps_to(mut self, maps_to: impl Into<String>) -> Self {
        self.maps_to = maps_to.into();
        self
    }

    /// Mark as part of the model key.
    #[must_use]
    pub fn with_key(mut self, key: bool) -> Self {
        self.key = key;
        self
    }

    /// Mark as required.
    #[must_use]
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Exclude from the default projection.
    #[must_use]
    pub fn with_lazyload(mut self, lazyload: bool) -> Self {
        self.lazyload = lazyload;
        self
    }

    /// Control visibility in plain-data renderings.
    #[must_use]
    pub fn with_enumerable(mut self, enumerable: bool) -> Self {
        self.enumerable = enumerable;
        self
    }

    /// Run validations even for null values.
    #[must_use]
    pub fn with_always_validate(mut self, always_validate: bool) -> Self {
        self.always_validate = always_validate;
        self
    }

    /// Set a static default value.
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Set a generated default value.
    #[must_use]
    pub fn with_default_fn(mut self, default_fn: DefaultFn) -> Self {
        self.default_fn = Some(default_fn);
        self
    }

    /// Whether this property's key values are generated by the store.
    pub fn is_serial(&self) -> bool {
        matches!(self.kind, PropertyType::Serial)
    }

    /// Produce the default value for a fresh instance, if any.
    pub fn default_value(&self) -> Option<Value> {
        if let Some(f) = &self.default_fn {
            return Some(f());
        }
        self.default.clone()
    }

    /// Normalize a schema declaration into a full descriptor.
    ///
    /// Shorthand declarations carry only a type; full declarations may carry
    /// any flag. Custom type names must already be registered on the engine.
    pub fn normalize(
        name: &str,
        decl: PropertyDecl,
        custom_types: &HashSet<String>,
    ) -> Result<Self, Error> {
        let mut property = match decl {
            PropertyDecl::Kind(kind) => Property::new(name, kind),
            PropertyDecl::Full(mut property) => {
                if property.name.is_empty() {
                    property.name = name.to_string();
                }
                if property.maps_to.is_empty() {
                    property.maps_to = property.name.clone();
                }
                property
            }
        };

        if let PropertyType::Custom(type_name) = &property.kind {
            if !custom_types.contains(type_name) {
                return Err(Error::NoSupport(format!(
                    "unknown property type '{type_name}'"
                )));
            }
        }

        // Key properties are never written as null placeholders.
        if property.key {
            property.required = false;
        }

        Ok(property)
    }

    /// Coerce an incoming value toward this property's storage type.
    ///
    /// Coercion is lenient: values that cannot be represented pass through
    /// untouched and are left for validation to reject.
    pub fn coerce(&self, value: Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        match self.kind {
            PropertyType::Integer | PropertyType::Serial => match value.as_i64() {
                Some(v) => Value::Integer(v),
                None => value,
            },
            PropertyType::Number => match value.as_f64() {
                Some(v) => Value::Real(v),
                None => value,
            },
            PropertyType::Boolean => match value.as_bool() {
                Some(v) => Value::Bool(v),
                None => value,
            },
            PropertyType::Date => match value.as_i64() {
                Some(v) => Value::Date(v),
                None => value,
            },
            PropertyType::Text => match value {
                Value::Text(_) => value,
                Value::Integer(v) => Value::Text(v.to_string()),
                Value::Real(v) => Value::Text(v.to_string()),
                Value::Bool(v) => Value::Text(v.to_string()),
                other => other,
            },
            PropertyType::Object => match value {
                Value::Json(_) => value,
                Value::Text(s) => match serde_json::from_str(&s) {
                    Ok(parsed) => Value::Json(parsed),
                    Err(_) => Value::Text(s),
                },
                other => other,
            },
            PropertyType::Binary => match value {
                Value::Bytes(_) => value,
                Value::Text(s) => Value::Bytes(s.into_bytes()),
                other => other,
            },
            PropertyType::Point | PropertyType::Custom(_) => value,
        }
    }
}

/// A property as written in a schema, before normalization.
#[derive(Debug, Clone)]
pub enum PropertyDecl {
    /// Shorthand: just the type, every flag defaulted
    Kind(PropertyType),
    /// Full declaration
    Full(Property),
}

impl From<PropertyType> for PropertyDecl {
    fn from(kind: PropertyType) -> Self {
        PropertyDecl::Kind(kind)
    }
}

impl From<Property> for PropertyDecl {
    fn from(property: Property) -> Self {
        PropertyDecl::Full(property)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_custom_types() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn test_shorthand_normalization() {
        let p = Property::normalize(
            "name",
            PropertyDecl::Kind(PropertyType::Text),
            &no_custom_types(),
        )
        .unwrap();

        assert_eq!(p.name, "name");
        assert_eq!(p.maps_to, "name");
        assert_eq!(p.kind, PropertyType::Text);
        assert!(!p.key);
        assert!(!p.required);
        assert!(!p.lazyload);
        assert!(p.enumerable);
    }

    #[test]
    fn test_full_normalization_fills_names() {
        let decl = Property::new("", PropertyType::Integer).with_required(true);
        let p = Property::normalize("age", PropertyDecl::Full(decl), &no_custom_types()).unwrap();

        assert_eq!(p.name, "age");
        assert_eq!(p.maps_to, "age");
        assert!(p.required);
    }

    #[test]
    fn test_maps_to_preserved() {
        let decl = Property::new("createdAt", PropertyType::Date).with_maps_to("created_at");
        let p =
            Property::normalize("createdAt", PropertyDecl::Full(decl), &no_custom_types()).unwrap();

        assert_eq!(p.name, "createdAt");
        assert_eq!(p.maps_to, "created_at");
    }

    #[test]
    fn test_unknown_custom_type_rejected() {
        let result = Property::normalize(
            "location",
            PropertyDecl::Kind(PropertyType::Custom("geo".to_string())),
            &no_custom_types(),
        );
        assert!(matches!(result, Err(Error::NoSupport(_))));
    }

    #[test]
    fn test_registered_custom_type_accepted() {
        let mut types = HashSet::new();
        types.insert("geo".to_string());

        let p = Property::normalize(
            "location",
            PropertyDecl::Kind(PropertyType::Custom("geo".to_string())),
            &types,
        )
        .unwrap();
        assert_eq!(p.kind, PropertyType::Custom("geo".to_string()));
    }

    #[test]
    fn test_key_property_not_required() {
        let decl = Property::new("id", PropertyType::Serial)
            .with_key(true)
            .with_required(true);
        let p = Property::normalize("id", PropertyDecl::Full(decl), &no_custom_types()).unwrap();

        assert!(p.key);
        assert!(!p.required);
    }

    #[test]
    fn test_coerce_integer() {
        let p = Property::new("age", PropertyType::Integer);
        assert_eq!(
            p.coerce(Value::Text("42".to_string())),
            Value::Integer(42)
        );
        assert_eq!(p.coerce(Value::Bool(true)), Value::Integer(1));
        assert_eq!(p.coerce(Value::Null), Value::Null);
        // Unconvertible values pass through for validation to reject.
        assert_eq!(
            p.coerce(Value::Text("abc".to_string())),
            Value::Text("abc".to_string())
        );
    }

    #[test]
    fn test_coerce_text() {
        let p = Property::new("label", PropertyType::Text);
        assert_eq!(p.coerce(Value::Integer(7)), Value::Text("7".to_string()));
        assert_eq!(
            p.coerce(Value::Text("x".to_string())),
            Value::Text("x".to_string())
        );
    }

    #[test]
    fn test_coerce_object_parses_json_text() {
        let p = Property::new("meta", PropertyType::Object);
        let coerced = p.coerce(Value::Text("{\"a\":1}".to_string()));
        assert_eq!(coerced, Value::Json(serde_json::json!({"a": 1})));

        let not_json = p.coerce(Value::Text("plain".to_string()));
        assert_eq!(not_json, Value::Text("plain".to_string()));
    }

    #[test]
    fn test_coerce_date() {
        let p = Property::new("createdAt", PropertyType::Date);
        assert_eq!(p.coerce(Value::Integer(1000)), Value::Date(1000));
    }

    #[test]
    fn test_default_fn_wins() {
        let p = Property::new("token", PropertyType::Text)
            .with_default(Value::Text("static".to_string()))
            .with_default_fn(Arc::new(|| Value::Text("generated".to_string())));
        assert_eq!(p.default_value(), Some(Value::Text("generated".to_string())));
    }

    #[test]
    fn test_serial_key_helper() {
        let p = Property::serial_key("id");
        assert!(p.key);
        assert!(p.is_serial());
        assert_eq!(p.maps_to, "id");
    }
}
