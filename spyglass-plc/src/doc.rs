//! Projection of a subject's latest operation into a DID document.
//!
//! The stored operation object is schema-loose; every field is coerced at
//! use and a shape mismatch yields [`Error::Malformed`], distinct from
//! [`Error::NotFound`].

use serde_json::Value;
use spyglass_types::did_doc::{DidDocument, Service, VerificationMethod};

use crate::store::PlcStore;

const CONTEXTS: [&str; 3] = [
    "https://www.w3.org/ns/did/v1",
    "https://w3id.org/security/multikey/v1",
    "https://w3id.org/security/suites/secp256k1-2019/v1",
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    #[error("malformed operation: {0}")]
    Malformed(&'static str),
    #[error("failed to decode stored operation: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Projects the current DID document for a subject from its most recent
/// non-nullified operation.
pub async fn did_document(store: &PlcStore, did: &str) -> Result<DidDocument, Error> {
    let op = store.latest_op(did).await?.ok_or(Error::NotFound)?;
    let operation: Value = serde_json::from_str(&op.operation)?;
    project(did, &operation)
}

/// A pure function of (subject, operation object); repeated projection of
/// the same operation yields an identical document.
pub fn project(did: &str, operation: &Value) -> Result<DidDocument, Error> {
    let op = operation.as_object().ok_or(Error::Malformed("operation is not an object"))?;

    let aka = op
        .get("alsoKnownAs")
        .and_then(Value::as_array)
        .ok_or(Error::Malformed("alsoKnownAs is not an array"))?;
    let also_known_as = aka
        .iter()
        .map(|value| {
            value
                .as_str()
                .map(str::to_string)
                .ok_or(Error::Malformed("alsoKnownAs entry is not a string"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut services = Vec::new();
    if let Some(Value::Object(entries)) = op.get("services") {
        for (id, service) in entries {
            let service =
                service.as_object().ok_or(Error::Malformed("service is not an object"))?;
            let r#type = service
                .get("type")
                .and_then(Value::as_str)
                .ok_or(Error::Malformed("service has no 'type' key"))?;
            let endpoint = service
                .get("endpoint")
                .and_then(Value::as_str)
                .ok_or(Error::Malformed("service has no 'endpoint' key"))?;
            services.push(Service {
                id: format!("#{id}"),
                r#type: r#type.to_string(),
                service_endpoint: endpoint.to_string(),
            });
        }
    }

    let mut verification_methods = Vec::new();
    if let Some(Value::Object(entries)) = op.get("verificationMethods") {
        for (id, key) in entries {
            let key = key
                .as_str()
                .ok_or(Error::Malformed("verification method key is not a string"))?;
            verification_methods.push(VerificationMethod {
                id: format!("{did}#{id}"),
                r#type: "Multikey".to_string(),
                controller: did.to_string(),
                public_key_multibase: Some(
                    key.strip_prefix("did:key:").unwrap_or(key).to_string(),
                ),
            });
        }
    }

    Ok(DidDocument {
        context: CONTEXTS.iter().map(|c| c.to_string()).collect(),
        id: did.to_string(),
        also_known_as: Some(also_known_as),
        verification_method: Some(verification_methods),
        service: Some(services),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::temp_store;
    use crate::store::OpRow;

    fn operation() -> Value {
        serde_json::json!({
            "type": "plc_operation",
            "alsoKnownAs": ["at://alice.test"],
            "services": {
                "atproto_pds": {
                    "type": "AtprotoPersonalDataServer",
                    "endpoint": "https://pds.example"
                }
            },
            "verificationMethods": {"atproto": "did:key:zABC"},
            "sig": "c2lnbmF0dXJl"
        })
    }

    #[test]
    fn projects_the_document() {
        let doc = project("did:plc:xyz", &operation()).expect("projection succeeds");

        assert_eq!(doc.id, "did:plc:xyz");
        assert_eq!(doc.context.len(), 3);
        assert_eq!(doc.also_known_as.as_deref(), Some(&["at://alice.test".to_string()][..]));

        let services = doc.service.as_deref().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "#atproto_pds");
        assert_eq!(services[0].r#type, "AtprotoPersonalDataServer");
        assert_eq!(services[0].service_endpoint, "https://pds.example");

        let methods = doc.verification_method.as_deref().unwrap();
        assert_eq!(methods.len(), 1);
        assert_eq!(methods[0].id, "did:plc:xyz#atproto");
        assert_eq!(methods[0].r#type, "Multikey");
        assert_eq!(methods[0].controller, "did:plc:xyz");
        assert_eq!(methods[0].public_key_multibase.as_deref(), Some("zABC"));
    }

    #[test]
    fn projection_is_deterministic() {
        let operation = operation();
        let a = serde_json::to_vec(&project("did:plc:xyz", &operation).unwrap()).unwrap();
        let b = serde_json::to_vec(&project("did:plc:xyz", &operation).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn shape_mismatches_are_malformed() {
        for bad in [
            serde_json::json!("not an object"),
            serde_json::json!({"services": {}}),
            serde_json::json!({"alsoKnownAs": "not an array"}),
            serde_json::json!({"alsoKnownAs": [42]}),
            serde_json::json!({"alsoKnownAs": [], "services": {"x": "not an object"}}),
            serde_json::json!({"alsoKnownAs": [], "services": {"x": {"type": "T"}}}),
            serde_json::json!({"alsoKnownAs": [], "verificationMethods": {"k": {}}}),
        ] {
            assert!(
                matches!(project("did:plc:xyz", &bad), Err(Error::Malformed(_))),
                "expected malformed error for {bad}"
            );
        }
    }

    #[tokio::test]
    async fn not_found_is_distinct() {
        let (store, _dir) = temp_store().await;
        assert!(matches!(did_document(&store, "did:plc:xyz").await, Err(Error::NotFound)));
    }

    #[tokio::test]
    async fn projects_from_the_store() {
        let (store, _dir) = temp_store().await;
        store
            .insert_ops(&[OpRow {
                did: "did:plc:xyz".into(),
                cid: "bafy".into(),
                created_at: "2023-02-01T00:00:00.000000000Z".into(),
                nullified: false,
                operation: operation().to_string(),
                handle: "alice.test".into(),
                pds: "https://pds.example".into(),
            }])
            .await
            .unwrap();

        let doc = did_document(&store, "did:plc:xyz").await.expect("document projects");
        assert_eq!(doc.id, "did:plc:xyz");
        assert_eq!(doc.service.as_deref().unwrap()[0].service_endpoint, "https://pds.example");
    }
}
