//! The projected current-state view over a subject's operation history.

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub also_known_as: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_method: Option<Vec<VerificationMethod>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<Vec<Service>>,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    pub r#type: String,
    pub controller: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_multibase: Option<String>,
}

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub r#type: String,
    pub service_endpoint: String,
}

impl DidDocument {
    /// Returns the handle listed first in `alsoKnownAs`, with the `at://`
    /// scheme stripped.
    pub fn handle(&self) -> Option<&str> {
        self.also_known_as
            .as_ref()
            .and_then(|aka| aka.first())
            .map(|aka| aka.strip_prefix("at://").unwrap_or(aka))
    }

    /// Returns the endpoint of the `#atproto_pds` service, if declared.
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.service.as_ref().and_then(|services| {
            services
                .iter()
                .find(|s| s.id == "#atproto_pds" || s.id.ends_with("#atproto_pds"))
                .map(|s| s.service_endpoint.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DidDocument {
        DidDocument {
            context: vec!["https://www.w3.org/ns/did/v1".into()],
            id: "did:plc:xyz".into(),
            also_known_as: Some(vec!["at://alice.test".into()]),
            verification_method: None,
            service: Some(vec![Service {
                id: "#atproto_pds".into(),
                r#type: "AtprotoPersonalDataServer".into(),
                service_endpoint: "https://pds.example".into(),
            }]),
        }
    }

    #[test]
    fn handle_strips_scheme() {
        assert_eq!(doc().handle(), Some("alice.test"));
    }

    #[test]
    fn pds_endpoint() {
        assert_eq!(doc().pds_endpoint(), Some("https://pds.example"));
        let mut doc = doc();
        doc.service = None;
        assert_eq!(doc.pds_endpoint(), None);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(doc()).expect("serialize");
        assert!(json.get("@context").is_some());
        assert!(json.get("alsoKnownAs").is_some());
        assert_eq!(json["service"][0]["serviceEndpoint"], "https://pds.example");
    }
}
