//! Integration tests for fledoc with `LocalKeyProvider`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use fledoc::envelope::is_encrypted_value;
use fledoc::prelude::*;
use fledoc_key_local::LocalKeyProvider;
use proptest::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

const USERS: &str = "fle-example.user";

fn doc(value: Value) -> Document {
    value.as_object().cloned().expect("object literal")
}

fn local_vault() -> Arc<DataKeyVault> {
    let provider = LocalKeyProvider::generate().expect("Failed to generate master key");
    Arc::new(DataKeyVault::new(provider, InMemoryKeyVault::new()))
}

fn json_schema_for(key_id: &KeyId) -> Value {
    json!({
        USERS: {
            "bsonType": "object",
            "encryptMetadata": {
                "keyId": [{
                    "$binary": { "base64": STANDARD.encode(key_id.as_bytes()), "subType": "04" }
                }]
            },
            "properties": {
                "accountNumber": {
                    "encrypt": {
                        "bsonType": "string",
                        "algorithm": "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic"
                    }
                }
            }
        }
    })
}

fn user_client() -> (EncryptingCollectionClient<Arc<InMemoryDocumentStore>>, KeyId) {
    let vault = local_vault();
    let key_id = vault.create_data_key(["example"]).expect("Failed to create data key");

    let schemas = Arc::new(SchemaRegistry::new());
    schemas.register_schema_map(&json_schema_for(&key_id)).expect("Failed to register schema");

    let store = Arc::new(InMemoryDocumentStore::new());
    (EncryptingCollectionClient::new(store, vault, schemas), key_id)
}

#[test]
fn test_end_to_end_account_lookup() {
    let (client, key_id) = user_client();

    client
        .insert(USERS, doc(json!({ "name": "TAROOO", "accountNumber": "123456" })))
        .expect("Insert failed");

    let raw = client.store().raw_documents(USERS);
    assert_eq!(raw.len(), 1);
    assert!(is_encrypted_value(&raw[0]["accountNumber"]));
    assert_eq!(raw[0]["name"], "TAROOO");
    let serialized = serde_json::to_string(&raw[0]).unwrap();
    assert!(!serialized.contains("123456"), "plaintext reached the store");

    let envelope = CipherEnvelope::from_value(&raw[0]["accountNumber"]).unwrap().unwrap();
    assert_eq!(envelope.key_id(), key_id);
    assert_eq!(envelope.algorithm(), Algorithm::Deterministic);

    let found = client
        .find(USERS, &doc(json!({ "accountNumber": "123456" })))
        .expect("Find failed");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["name"], "TAROOO");
    assert_eq!(found[0]["accountNumber"], "123456");

    let none = client.find(USERS, &doc(json!({ "accountNumber": "654321" }))).expect("Find failed");
    assert!(none.is_empty());
}

#[test]
fn test_equal_values_share_ciphertext_within_a_field() {
    let (client, _) = user_client();
    client.insert(USERS, doc(json!({ "accountNumber": "1" }))).unwrap();
    client.insert(USERS, doc(json!({ "accountNumber": "1" }))).unwrap();

    let raw = client.store().raw_documents(USERS);
    assert_eq!(raw[0]["accountNumber"], raw[1]["accountNumber"]);
    assert_eq!(client.find(USERS, &doc(json!({ "accountNumber": "1" }))).unwrap().len(), 2);
}

#[test]
fn test_unregistered_collection_is_untouched() {
    let (client, _) = user_client();
    client.insert("fle-example.audit", doc(json!({ "accountNumber": "123456" }))).unwrap();

    let raw = client.store().raw_documents("fle-example.audit");
    assert_eq!(raw[0]["accountNumber"], "123456");
}

#[test]
fn test_envelope_moved_between_collections_fails() {
    let vault = local_vault();
    let first = vault.create_data_key(["first"]).unwrap();
    let second = vault.create_data_key(["second"]).unwrap();

    let schemas = Arc::new(SchemaRegistry::new());
    for (collection, key) in [("a", first), ("b", second)] {
        schemas
            .register(
                CollectionSchema::builder(collection)
                    .metadata_key(key)
                    .field("secret", Algorithm::Randomized)
                    .build()
                    .unwrap(),
            )
            .unwrap();
    }
    let store = Arc::new(InMemoryDocumentStore::new());
    let client = EncryptingCollectionClient::new(Arc::clone(&store), Arc::clone(&vault), schemas);

    client.insert("a", doc(json!({ "_id": 1, "secret": "for a" }))).unwrap();
    let stolen = store.raw_documents("a")[0]["secret"].clone();
    store.insert("b", doc(json!({ "_id": 1, "secret": stolen }))).unwrap();

    assert!(matches!(client.find("b", &doc(json!({}))), Err(Error::Integrity)));
    assert_eq!(client.find("a", &doc(json!({}))).unwrap()[0]["secret"], "for a");
}

#[test]
fn test_deleted_key_fails_whole_read() {
    let (client, key_id) = user_client();
    client.insert(USERS, doc(json!({ "accountNumber": "123456" }))).unwrap();

    client.vault().delete_key(&key_id).unwrap();

    let result = client.find(USERS, &doc(json!({})));
    assert!(matches!(result, Err(Error::KeyNotFound(_))));
}

#[test]
fn test_other_master_key_cannot_read() {
    let store = Arc::new(InMemoryKeyVault::new());
    let owner =
        DataKeyVault::from_shared(Arc::new(LocalKeyProvider::generate().unwrap()), store.clone());
    let key_id = owner.create_data_key(["example"]).unwrap();

    let intruder =
        DataKeyVault::from_shared(Arc::new(LocalKeyProvider::generate().unwrap()), store);
    let result = intruder.get_data_key(&key_id);
    assert!(matches!(result, Err(Error::Integrity)));

    let documents = Arc::new(InMemoryDocumentStore::new());
    let schemas = Arc::new(SchemaRegistry::new());
    schemas.register_schema_map(&json_schema_for(&key_id)).unwrap();
    EncryptingCollectionClient::new(Arc::clone(&documents), Arc::new(owner), Arc::clone(&schemas))
        .insert(USERS, doc(json!({ "accountNumber": "123456" })))
        .unwrap();
    let reader = EncryptingCollectionClient::new(documents, Arc::new(intruder), schemas);
    let read = reader.find(USERS, &doc(json!({})));
    assert!(matches!(read, Err(Error::KeyNotFound(_) | Error::Integrity)));
}

#[test]
fn test_master_key_file_survives_restart() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let key_path = temp_dir.path().join("master.key");
    let key_store = Arc::new(InMemoryKeyVault::new());
    let documents = Arc::new(InMemoryDocumentStore::new());

    let provider = LocalKeyProvider::generate().unwrap();
    provider.write_to_file(&key_path).unwrap();
    let vault = Arc::new(DataKeyVault::from_shared(Arc::new(provider), key_store.clone()));
    let key_id = vault.create_data_key(["example"]).unwrap();
    let schemas = Arc::new(SchemaRegistry::new());
    schemas.register_schema_map(&json_schema_for(&key_id)).unwrap();
    EncryptingCollectionClient::new(Arc::clone(&documents), vault, Arc::clone(&schemas))
        .insert(USERS, doc(json!({ "accountNumber": "123456" })))
        .unwrap();

    let reloaded = LocalKeyProvider::from_file(&key_path).unwrap();
    let vault = Arc::new(DataKeyVault::from_shared(Arc::new(reloaded), key_store));
    let client = EncryptingCollectionClient::new(documents, vault, schemas);

    let found = client.find_one(USERS, &doc(json!({ "accountNumber": "123456" }))).unwrap();
    assert!(found.is_some());
}

#[test]
fn test_rotation_keeps_documents_readable() {
    let (client, _) = user_client();
    client.insert(USERS, doc(json!({ "accountNumber": "123456" }))).unwrap();

    let report = client
        .vault()
        .rotate_master_key(Arc::new(LocalKeyProvider::generate().unwrap()))
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.rotated.len(), 1);

    client.vault().clear();
    let found = client.find(USERS, &doc(json!({ "accountNumber": "123456" }))).unwrap();
    assert_eq!(found.len(), 1);
}

#[test]
fn test_bootstrap_converges_on_one_key() {
    let client = EncryptingCollectionClient::new(
        InMemoryDocumentStore::new(),
        local_vault(),
        Arc::new(SchemaRegistry::new()),
    );
    let options = BootstrapOptions::new(USERS, "example")
        .field("accountNumber", Algorithm::Deterministic);

    let first = client.bootstrap(options.clone()).unwrap();
    let second = client.bootstrap(options).unwrap();

    assert_eq!(first, second);
    assert_eq!(client.vault().list_keys().unwrap().len(), 1);

    client.insert(USERS, doc(json!({ "name": "TAROOO", "accountNumber": "123456" }))).unwrap();
    let found = client
        .find_one(USERS, &doc(json!({ "accountNumber": "123456" })))
        .unwrap()
        .unwrap();
    assert_eq!(found["name"], "TAROOO");
}

#[test]
fn test_config_file_drives_schemas() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("fledoc.toml");
    std::fs::write(
        &path,
        r#"
key_vault_namespace = "fle-example.keys"

[schemas."fle-example.user"]
metadata_key = { alt_name = "example" }

[[schemas."fle-example.user".fields]]
path = "accountNumber"
algorithm = "deterministic"
bson_type = "string"
"#,
    )
    .unwrap();

    let config = EncryptionConfig::from_path(&path).unwrap();
    let key_store = Arc::new(config.key_vault());
    assert_eq!(key_store.namespace(), "fle-example.keys");

    let provider = Arc::new(LocalKeyProvider::generate().unwrap());
    let vault = Arc::new(DataKeyVault::from_shared(provider, key_store.clone()));
    vault.create_data_key(["example"]).unwrap();
    assert_eq!(key_store.len(), 1);
    let schemas = Arc::new(SchemaRegistry::new());
    config.register_all(&schemas).unwrap();
    let client = EncryptingCollectionClient::new(InMemoryDocumentStore::new(), vault, schemas);

    assert!(matches!(
        client.insert(USERS, doc(json!({ "accountNumber": 123456 }))),
        Err(Error::FieldType { .. })
    ));
    client.insert(USERS, doc(json!({ "accountNumber": "123456" }))).unwrap();
    assert_eq!(client.find(USERS, &doc(json!({ "accountNumber": "123456" }))).unwrap().len(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_string_round_trip(value in ".{0,64}", deterministic in any::<bool>()) {
        let (client, _) = user_client();
        let algorithm = if deterministic {
            Algorithm::Deterministic
        } else {
            Algorithm::Randomized
        };
        let key = KeyRef::AltName("example".into());

        let encrypted = client
            .encrypt_value(&json!(value), algorithm, &key, USERS, "note")
            .unwrap();
        prop_assert!(is_encrypted_value(&encrypted));
        prop_assert_eq!(client.decrypt_value(&encrypted, USERS, "note").unwrap(), json!(value));
    }

    #[test]
    fn prop_integer_round_trip(value in any::<i64>()) {
        let (client, _) = user_client();
        let key = KeyRef::AltName("example".into());

        let encrypted = client
            .encrypt_value(&json!(value), Algorithm::Deterministic, &key, USERS, "n")
            .unwrap();
        prop_assert_eq!(client.decrypt_value(&encrypted, USERS, "n").unwrap(), json!(value));
    }

    #[test]
    fn prop_any_bit_flip_is_rejected(index in any::<prop::sample::Index>(), bit in 0u8..8) {
        let (client, _) = user_client();
        let key = KeyRef::AltName("example".into());
        let encrypted = client
            .encrypt_value(&json!("123456"), Algorithm::Deterministic, &key, USERS, "accountNumber")
            .unwrap();

        let envelope = CipherEnvelope::from_value(&encrypted).unwrap().unwrap();
        let mut bytes = envelope.to_bytes().unwrap();
        let position = index.index(bytes.len());
        bytes[position] ^= 1 << bit;
        let tampered = json!({ "$binary": { "base64": STANDARD.encode(&bytes), "subType": "06" } });

        prop_assert!(client.decrypt_value(&tampered, USERS, "accountNumber").is_err());
    }
}
