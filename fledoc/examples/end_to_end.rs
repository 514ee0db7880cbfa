//! End-to-end walkthrough: local master key, data key with an alt name,
//! `$jsonSchema` map, encrypted insert and a query on the encrypted field.
//!
//! Run with `RUST_LOG=debug` to see the vault and client at work.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use fledoc::prelude::*;
use fledoc_key_local::LocalKeyProvider;
use serde_json::json;

const USERS: &str = "fle-example.user";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== fledoc end-to-end ===\n");

    // 1. Local 96-byte master key
    let provider = LocalKeyProvider::generate()?;
    println!("Master key: {}", provider.master_key());

    // 2. Key vault (default settings: keyvault.datakeys) and a data key named "example"
    let config = EncryptionConfig::default();
    let key_store = Arc::new(config.key_vault());
    let vault = Arc::new(DataKeyVault::from_shared(Arc::new(provider), key_store.clone()));
    let key_id = vault.create_data_key(["example"])?;
    println!("Data key:   {key_id} (alt name \"example\")\n");

    // 3. Schema map: accountNumber is encrypted deterministically
    let schema_map = json!({
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
    });
    let schemas = Arc::new(SchemaRegistry::new());
    schemas.register_schema_map(&schema_map)?;

    // 4. Insert through the encrypting client
    let store = Arc::new(InMemoryDocumentStore::new());
    let client = EncryptingCollectionClient::new(Arc::clone(&store), vault, schemas);

    let user = json!({ "name": "TAROOO", "accountNumber": "123456" });
    if let Some(document) = user.as_object() {
        client.insert(USERS, document.clone())?;
    }

    println!("Stored document (what the server sees):");
    for raw in store.raw_documents(USERS) {
        println!("  {}", serde_json::to_string_pretty(&raw)?);
    }

    // 5. Query by the encrypted field
    let mut filter = Filter::new();
    filter.insert("accountNumber".into(), json!("123456"));
    let found = client.find(USERS, &filter)?;

    println!("\nQuery {{accountNumber: \"123456\"}} returned {} document(s):", found.len());
    for document in &found {
        println!("  {}", serde_json::to_string_pretty(document)?);
    }

    // 6. Key vault contents
    println!("\nKeys in {}: {}", key_store.namespace(), key_store.len());

    println!("\n=== done ===");
    Ok(())
}
