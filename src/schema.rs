//! The companion directive schema: a declarative JSON document listing every
//! legal directive key and the JSON kind of its value. Loaded once, `$ref`
//! links resolved eagerly, then used to verify each directive payload at the
//! traversal boundary.

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Schema bundled with the tool; a grammar tree may override it by shipping
/// its own `schema.json` next to the grammars.
const BUNDLED: &str = include_str!("../schema/schema.json");

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaDoc {
    #[serde(default)]
    definitions: IndexMap<String, KeySchema>,
    properties: IndexMap<String, KeySchema>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeySchema {
    #[serde(rename = "$ref")]
    reference: Option<String>,
    #[serde(rename = "type")]
    kind: Option<KindSpec>,
    #[serde(rename = "const")]
    literal: Option<Value>,
    properties: Option<IndexMap<String, KeySchema>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum KindSpec {
    One(JsonKind),
    Any(Vec<JsonKind>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum JsonKind {
    Null,
    String,
    Array,
    Object,
    Boolean,
    Integer,
}

impl JsonKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            JsonKind::Null => value.is_null(),
            JsonKind::String => value.is_string(),
            JsonKind::Array => value.is_array(),
            JsonKind::Object => value.is_object(),
            JsonKind::Boolean => value.is_boolean(),
            JsonKind::Integer => value.is_i64() || value.is_u64(),
        }
    }
}

/// Deserialize with JSON-path context in error messages.
fn from_str_with_path<T: serde::de::DeserializeOwned>(src: &str) -> Result<T> {
    let de = &mut serde_json::Deserializer::from_str(src);
    serde_path_to_error::deserialize::<_, T>(de).map_err(|err| {
        let path = err.path().to_string();
        Error::resolution(format!("bad schema document at {path}: {}", err.into_inner()))
    })
}

impl SchemaDoc {
    pub fn bundled() -> Self {
        Self::from_source(BUNDLED).expect("bundled schema document is well-formed")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_source(&source)
    }

    pub fn from_source(source: &str) -> Result<Self> {
        let mut doc: SchemaDoc = from_str_with_path(source)?;
        let definitions = doc.definitions.clone();
        for schema in doc.definitions.values_mut() {
            resolve(schema, &definitions)?;
        }
        let definitions = doc.definitions.clone();
        for schema in doc.properties.values_mut() {
            resolve(schema, &definitions)?;
        }
        Ok(doc)
    }

    pub fn type_properties(&self) -> &IndexMap<String, KeySchema> {
        &self.properties
    }

    pub fn member_properties(&self) -> &IndexMap<String, KeySchema> {
        self.definitions
            .get("member")
            .and_then(|s| s.properties.as_ref())
            .unwrap_or(&self.properties)
    }

    /// Reject unknown keys and values whose JSON kind disagrees with the
    /// declared one; recurse into declared object keys.
    pub fn verify(
        &self,
        payload: &serde_json::Map<String, Value>,
        props: &IndexMap<String, KeySchema>,
        location: &str,
    ) -> Result<()> {
        for (key, value) in payload {
            let Some(schema) = props.get(key) else {
                return Err(Error::directive(format!("undefined directive '{key}'"), location));
            };
            if let Some(literal) = &schema.literal {
                if value != literal {
                    return Err(Error::directive(
                        format!("directive '{key}' must be {literal}"),
                        location,
                    ));
                }
                continue;
            }
            let ok = match &schema.kind {
                Some(KindSpec::One(kind)) => kind.matches(value),
                Some(KindSpec::Any(kinds)) => kinds.iter().any(|k| k.matches(value)),
                None => true,
            };
            if !ok {
                return Err(Error::directive(
                    format!("directive '{key}:{value}' has the wrong value kind"),
                    location,
                ));
            }
            if let (Value::Object(map), Some(props)) = (value, &schema.properties) {
                self.verify(map, props, location)?;
            }
        }
        Ok(())
    }
}

/// Splice `#/definitions/<name>` links in place, depth first.
fn resolve(schema: &mut KeySchema, definitions: &IndexMap<String, KeySchema>) -> Result<()> {
    if let Some(link) = schema.reference.take() {
        let name = link
            .strip_prefix("#/definitions/")
            .ok_or_else(|| Error::resolution(format!("unsupported schema reference '{link}'")))?;
        let mut definition = definitions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::resolution(format!("undefined schema definition '{name}'")))?;
        resolve(&mut definition, definitions)?;
        if schema.kind.is_none() {
            schema.kind = definition.kind;
        }
        if schema.literal.is_none() {
            schema.literal = definition.literal;
        }
        if schema.properties.is_none() {
            schema.properties = definition.properties;
        }
    }
    if let Some(props) = &mut schema.properties {
        for sub in props.values_mut() {
            resolve(sub, definitions)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> serde_json::Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn bundled_schema_resolves_refs() {
        let doc = SchemaDoc::bundled();
        let clearfunc = doc.type_properties().get("clearfunc").unwrap();
        assert!(clearfunc.properties.as_ref().unwrap().contains_key("output"));
    }

    #[test]
    fn unknown_key_is_fatal() {
        let doc = SchemaDoc::bundled();
        let p = payload(json!({ "bogus": true }));
        let err = doc.verify(&p, doc.type_properties(), "/a.rng/x.define").unwrap_err();
        assert!(err.to_string().contains("undefined directive 'bogus'"));
    }

    #[test]
    fn wrong_value_kind_is_fatal() {
        let doc = SchemaDoc::bundled();
        let p = payload(json!({ "opt": "yes" }));
        assert!(doc.verify(&p, doc.type_properties(), "loc").is_err());
    }

    #[test]
    fn nested_objects_verify_recursively() {
        let doc = SchemaDoc::bundled();
        let good = payload(json!({ "parsefunc": { "noctxt": true } }));
        assert!(doc.verify(&good, doc.type_properties(), "loc").is_ok());
        let bad = payload(json!({ "parsefunc": { "noctxt": "yes" } }));
        assert!(doc.verify(&bad, doc.type_properties(), "loc").is_err());
    }
}
