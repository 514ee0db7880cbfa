//! Structural parser for `$jsonSchema`-style encryption schemas.
//!
//! ```json
//! {
//!   "bsonType": "object",
//!   "encryptMetadata": { "keyId": [{ "$binary": { "base64": "...", "subType": "04" } }] },
//!   "properties": {
//!     "accountNumber": {
//!       "encrypt": {
//!         "bsonType": "string",
//!         "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic"
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! `encryptMetadata` may appear at any level and is inherited by nested
//! properties. Key ids are read from the value tree; nothing is ever spliced
//! into JSON text.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};

use crate::data_key::KeyId;
use crate::envelope::Algorithm;
use crate::error::{Error, Result};
use crate::schema::{CollectionSchema, KeyRef};
use crate::value::ValueType;

#[derive(Clone, Default)]
struct Inherited {
    key: Option<KeyRef>,
    algorithm: Option<Algorithm>,
}

pub(crate) fn parse(collection: String, schema: &Value) -> Result<CollectionSchema> {
    let root = as_object(schema, "schema")?;
    let inherited = read_metadata(root, &Inherited::default())?;

    let mut builder = CollectionSchema::builder(collection);
    if let Some(key) = inherited.key.clone() {
        builder = builder.metadata_key(key);
    }

    let mut fields = Vec::new();
    collect(root, "", &inherited, &mut fields)?;
    for (path, algorithm, key, bson_type) in fields {
        builder = builder.typed_field(path, algorithm, Some(key), bson_type);
    }
    builder.build()
}

fn collect(
    node: &Map<String, Value>,
    prefix: &str,
    inherited: &Inherited,
    out: &mut Vec<(String, Algorithm, KeyRef, Option<ValueType>)>,
) -> Result<()> {
    let Some(properties) = node.get("properties") else {
        return Ok(());
    };
    for (name, property) in as_object(properties, "properties")? {
        let path = if prefix.is_empty() { name.clone() } else { format!("{prefix}.{name}") };
        let property = as_object(property, &path)?;

        if let Some(encrypt) = property.get("encrypt") {
            if property.contains_key("properties") {
                return Err(Error::InvalidSchema(format!(
                    "'{path}' cannot both be encrypted and declare properties"
                )));
            }
            out.push(read_encrypt(&path, as_object(encrypt, &path)?, inherited)?);
        } else {
            let nested = read_metadata(property, inherited)?;
            collect(property, &path, &nested, out)?;
        }
    }
    Ok(())
}

fn read_metadata(node: &Map<String, Value>, inherited: &Inherited) -> Result<Inherited> {
    let mut result = inherited.clone();
    if let Some(metadata) = node.get("encryptMetadata") {
        let metadata = as_object(metadata, "encryptMetadata")?;
        if let Some(key) = metadata.get("keyId") {
            result.key = Some(read_key_id(key)?);
        }
        if let Some(algorithm) = metadata.get("algorithm") {
            result.algorithm = Some(read_algorithm(algorithm)?);
        }
    }
    Ok(result)
}

fn read_encrypt(
    path: &str,
    encrypt: &Map<String, Value>,
    inherited: &Inherited,
) -> Result<(String, Algorithm, KeyRef, Option<ValueType>)> {
    let algorithm = match encrypt.get("algorithm") {
        Some(value) => read_algorithm(value)?,
        None => inherited
            .algorithm
            .ok_or_else(|| Error::InvalidSchema(format!("'{path}' has no algorithm")))?,
    };
    let key = match encrypt.get("keyId") {
        Some(value) => read_key_id(value)?,
        None => inherited
            .key
            .clone()
            .ok_or_else(|| Error::InvalidSchema(format!("'{path}' has no keyId")))?,
    };
    let bson_type = match encrypt.get("bsonType") {
        Some(Value::String(keyword)) => Some(ValueType::from_keyword(keyword).ok_or_else(|| {
            Error::InvalidSchema(format!("'{path}' has unsupported bsonType '{keyword}'"))
        })?),
        Some(_) => {
            return Err(Error::InvalidSchema(format!("'{path}' bsonType must be a single string")))
        }
        None => None,
    };
    Ok((path.to_string(), algorithm, key, bson_type))
}

fn read_algorithm(value: &Value) -> Result<Algorithm> {
    serde_json::from_value(value.clone())
        .map_err(|_| Error::InvalidSchema(format!("unsupported algorithm {value}")))
}

fn read_key_id(value: &Value) -> Result<KeyRef> {
    match value {
        Value::Array(ids) => match ids.as_slice() {
            [single] => read_uuid(single).map(KeyRef::Id),
            _ => Err(Error::InvalidSchema("keyId must list exactly one key".into())),
        },
        Value::String(pointer) if pointer.starts_with('/') => Err(Error::InvalidSchema(format!(
            "keyId pointer '{pointer}' is not supported; reference the key by id"
        ))),
        other => Err(Error::InvalidSchema(format!("keyId must be an array, got {other}"))),
    }
}

fn read_uuid(value: &Value) -> Result<KeyId> {
    if let Some(text) = value.get("$uuid").and_then(Value::as_str) {
        return text.parse();
    }
    if let Some(text) = value.as_str() {
        return text.parse();
    }

    let binary = value
        .get("$binary")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::InvalidSchema(format!("keyId entry is not a UUID: {value}")))?;
    let subtype = binary.get("subType").and_then(Value::as_str).unwrap_or_default();
    if subtype != "04" && subtype != "4" {
        return Err(Error::InvalidSchema(format!(
            "keyId binary has subtype '{subtype}', expected 04"
        )));
    }
    let encoded = binary
        .get("base64")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidSchema("keyId binary has no base64 payload".into()))?;
    let bytes: [u8; 16] = STANDARD
        .decode(encoded)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::InvalidSchema("keyId binary is not 16 bytes of base64".into()))?;
    Ok(KeyId::from_bytes(bytes))
}

fn as_object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| Error::InvalidSchema(format!("'{what}' must be an object")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binary_key(id: &KeyId) -> Value {
        json!({ "$binary": { "base64": STANDARD.encode(id.as_bytes()), "subType": "04" } })
    }

    #[test]
    fn test_parse_original_layout() {
        let key_id = KeyId::new_v4();
        let schema = json!({
            "bsonType": "object",
            "encryptMetadata": { "keyId": [binary_key(&key_id)] },
            "properties": {
                "accountNumber": {
                    "encrypt": {
                        "bsonType": "string",
                        "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic"
                    }
                }
            }
        });

        let parsed = CollectionSchema::from_json_schema("fle-example.user", &schema).unwrap();

        assert_eq!(parsed.collection(), "fle-example.user");
        assert_eq!(parsed.metadata_key(), Some(&KeyRef::Id(key_id)));
        let [spec] = parsed.fields() else { panic!("expected one field") };
        assert_eq!(spec.field_path(), "accountNumber");
        assert_eq!(spec.algorithm(), Algorithm::Deterministic);
        assert_eq!(spec.key(), &KeyRef::Id(key_id));
        assert_eq!(spec.bson_type(), Some(ValueType::String));
    }

    #[test]
    fn test_nested_properties_inherit_metadata() {
        let outer = KeyId::new_v4();
        let inner = KeyId::new_v4();
        let schema = json!({
            "encryptMetadata": {
                "keyId": [{ "$uuid": outer.to_string() }],
                "algorithm": "randomized"
            },
            "properties": {
                "ssn": { "encrypt": {} },
                "profile": {
                    "bsonType": "object",
                    "encryptMetadata": { "keyId": [inner.to_string()] },
                    "properties": {
                        "email": { "encrypt": { "algorithm": "deterministic" } }
                    }
                }
            }
        });

        let parsed = CollectionSchema::from_json_schema("user", &schema).unwrap();
        let fields = parsed.fields();

        let ssn = fields.iter().find(|f| f.field_path() == "ssn").unwrap();
        assert_eq!(ssn.key(), &KeyRef::Id(outer));
        assert_eq!(ssn.algorithm(), Algorithm::Randomized);

        let email = fields.iter().find(|f| f.field_path() == "profile.email").unwrap();
        assert_eq!(email.key(), &KeyRef::Id(inner));
        assert_eq!(email.algorithm(), Algorithm::Deterministic);
    }

    #[test]
    fn test_missing_key_rejected() {
        let schema = json!({
            "properties": { "ssn": { "encrypt": { "algorithm": "randomized" } } }
        });
        let result = CollectionSchema::from_json_schema("user", &schema);
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_key_pointer_rejected() {
        let schema = json!({
            "properties": {
                "ssn": { "encrypt": { "algorithm": "randomized", "keyId": "/keyName" } }
            }
        });
        assert!(matches!(
            CollectionSchema::from_json_schema("user", &schema),
            Err(Error::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_wrong_binary_subtype_rejected() {
        let schema = json!({
            "encryptMetadata": {
                "keyId": [{ "$binary": { "base64": STANDARD.encode([0u8; 16]), "subType": "00" } }]
            },
            "properties": { "ssn": { "encrypt": { "algorithm": "randomized" } } }
        });
        assert!(matches!(
            CollectionSchema::from_json_schema("user", &schema),
            Err(Error::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let key_id = KeyId::new_v4();
        let schema = json!({
            "properties": {
                "ssn": { "encrypt": { "algorithm": "Indexed", "keyId": [binary_key(&key_id)] } }
            }
        });
        assert!(matches!(
            CollectionSchema::from_json_schema("user", &schema),
            Err(Error::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_schema_map_registration() {
        let key_id = KeyId::new_v4();
        let map = json!({
            "fle-example.user": {
                "encryptMetadata": { "keyId": [binary_key(&key_id)] },
                "properties": {
                    "accountNumber": {
                        "encrypt": { "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic" }
                    }
                }
            }
        });

        let registry = crate::schema::SchemaRegistry::new();
        registry.register_schema_map(&map).unwrap();

        let spec = registry.lookup("fle-example.user", "accountNumber").unwrap();
        assert_eq!(spec.key(), &KeyRef::Id(key_id));
    }
}
