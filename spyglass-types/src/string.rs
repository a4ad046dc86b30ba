//! [String formats] used by the AT Protocol Lexicon.
//!
//! [String formats]: https://atproto.com/specs/lexicon#string-formats

use regex::Regex;
use serde::{de::Error, Deserialize, Deserializer, Serialize};
use std::{cell::OnceCell, ops::Deref, str::FromStr};

/// Common trait implementations for string formats that are newtype wrappers
/// around `String`.
macro_rules! string_newtype {
    ($name:ident) => {
        impl FromStr for $name {
            type Err = &'static str;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s.into())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let value = Deserialize::deserialize(deserializer)?;
                Self::new(value).map_err(D::Error::custom)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }
    };
}

/// An AT Protocol identifier: either a DID or a handle.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, Hash)]
#[serde(untagged)]
pub enum AtIdentifier {
    Did(Did),
    Handle(Handle),
}

impl FromStr for AtIdentifier {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(did) = s.parse() {
            Ok(AtIdentifier::Did(did))
        } else {
            s.parse().map(AtIdentifier::Handle)
        }
    }
}

impl AsRef<str> for AtIdentifier {
    fn as_ref(&self) -> &str {
        match self {
            AtIdentifier::Did(did) => did.as_ref(),
            AtIdentifier::Handle(handle) => handle.as_ref(),
        }
    }
}

/// A generic [DID identifier].
///
/// [DID identifier]: https://atproto.com/specs/did
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Hash)]
#[serde(transparent)]
pub struct Did(String);
string_newtype!(Did);

impl Did {
    #[allow(clippy::borrow_interior_mutable_const, clippy::declare_interior_mutable_const)]
    /// Parses a `Did` from the given string.
    pub fn new(did: String) -> Result<Self, &'static str> {
        const RE_DID: OnceCell<Regex> = OnceCell::new();

        // https://atproto.com/specs/did#at-protocol-did-identifier-syntax
        if did.len() > 2048 {
            Err("DID too long")
        } else if !RE_DID
            .get_or_init(|| Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").unwrap())
            .is_match(&did)
        {
            Err("Invalid DID")
        } else {
            Ok(Self(did))
        }
    }

    /// Returns the DID method.
    pub fn method(&self) -> &str {
        &self.0[..4 + self.0[4..].find(':').unwrap()]
    }

    /// Returns the DID as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// A [handle identifier].
///
/// [handle identifier]: https://atproto.com/specs/handle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Hash)]
#[serde(transparent)]
pub struct Handle(String);
string_newtype!(Handle);

impl Handle {
    #[allow(clippy::borrow_interior_mutable_const, clippy::declare_interior_mutable_const)]
    /// Parses a `Handle` from the given string.
    pub fn new(handle: String) -> Result<Self, &'static str> {
        const RE_HANDLE: OnceCell<Regex> = OnceCell::new();

        // https://atproto.com/specs/handle#handle-identifier-syntax
        if handle.len() > 253 {
            Err("Handle too long")
        } else if !RE_HANDLE
            .get_or_init(|| Regex::new(r"^([a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?$").unwrap())
            .is_match(&handle)
        {
            Err("Invalid handle")
        } else {
            Ok(Self(handle))
        }
    }

    /// Returns the handle as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// A [namespaced identifier] naming a record collection.
///
/// [namespaced identifier]: https://atproto.com/specs/nsid
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Hash)]
#[serde(transparent)]
pub struct Nsid(String);
string_newtype!(Nsid);

impl Nsid {
    #[allow(clippy::borrow_interior_mutable_const, clippy::declare_interior_mutable_const)]
    /// Parses an NSID from the given string.
    pub fn new(nsid: String) -> Result<Self, &'static str> {
        const RE_NSID: OnceCell<Regex> = OnceCell::new();

        if nsid.len() > 317 {
            Err("NSID too long")
        } else if !RE_NSID
            .get_or_init(|| Regex::new(r"^[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+(\.[a-zA-Z]([a-zA-Z]{0,61}[a-zA-Z])?)$").unwrap())
            .is_match(&nsid)
        {
            Err("Invalid NSID")
        } else {
            Ok(Self(nsid))
        }
    }

    /// Returns the domain authority part of the NSID.
    pub fn domain_authority(&self) -> &str {
        let split = self.0.rfind('.').expect("enforced by constructor");
        &self.0[..split]
    }

    /// Returns the name segment of the NSID.
    pub fn name(&self) -> &str {
        let split = self.0.rfind('.').expect("enforced by constructor");
        &self.0[split + 1..]
    }

    /// Returns the NSID as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// A record key (`rkey`) naming an individual record within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Hash)]
pub struct RecordKey(String);
string_newtype!(RecordKey);

impl RecordKey {
    #[allow(clippy::borrow_interior_mutable_const, clippy::declare_interior_mutable_const)]
    /// Parses a `RecordKey` from the given string.
    pub fn new(s: String) -> Result<Self, &'static str> {
        const RE_RKEY: OnceCell<Regex> = OnceCell::new();

        if [".", ".."].contains(&s.as_str()) {
            Err("Disallowed rkey")
        } else if !RE_RKEY
            .get_or_init(|| Regex::new(r"^[a-zA-Z0-9.\-_:~]{1,512}$").unwrap())
            .is_match(&s)
        {
            Err("Invalid rkey")
        } else {
            Ok(Self(s))
        }
    }

    /// Returns the record key as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// A record path, the `collection/rkey` pair addressing a record inside a
/// repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPath {
    pub collection: Nsid,
    pub rkey: RecordKey,
}

impl FromStr for RecordPath {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (collection, rkey) = s.split_once('/').ok_or("record path must be collection/rkey")?;
        if rkey.contains('/') {
            return Err("record path must have exactly two segments");
        }
        Ok(Self { collection: collection.parse()?, rkey: rkey.parse()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{from_str, to_string};

    #[test]
    fn valid_did() {
        for valid in ["did:plc:z72i7hdynmk6r22z27h6tvur", "did:web:example.com", "did:a:b"] {
            let did = Did::new(valid.into()).expect("did should be valid");
            assert_eq!(did.as_str(), valid);
        }
        assert_eq!(Did::new("did:plc:abcd".into()).unwrap().method(), "did:plc");
    }

    #[test]
    fn invalid_did() {
        for invalid in ["", "did:", "did:plc:", "plc:abcd", "did:PLC:abcd", "did:plc:ab cd"] {
            assert!(Did::new(invalid.into()).is_err(), "invalid DID `{invalid}` parsed as valid");
        }
    }

    #[test]
    fn valid_handle() {
        for valid in ["alice.test", "bsky.app", "xn--ls8h.test", "a.co"] {
            assert!(Handle::new(valid.into()).is_ok(), "valid handle `{valid}` rejected");
        }
    }

    #[test]
    fn invalid_handle() {
        for invalid in ["", "alice", ".test", "alice..test", "alice.test.", "al ice.test"] {
            assert!(
                Handle::new(invalid.into()).is_err(),
                "invalid handle `{invalid}` parsed as valid"
            );
        }
    }

    #[test]
    fn valid_nsid() {
        let nsid = Nsid::new("app.bsky.feed.post".into()).expect("nsid should be valid");
        assert_eq!(nsid.domain_authority(), "app.bsky.feed");
        assert_eq!(nsid.name(), "post");
    }

    #[test]
    fn invalid_nsid() {
        for invalid in ["", "app", "app.bsky", "app.bsky.feed.*", "app..feed.post"] {
            assert!(Nsid::new(invalid.into()).is_err(), "invalid NSID `{invalid}` parsed as valid");
        }
    }

    #[test]
    fn record_key() {
        assert!(RecordKey::new("3jqfcqzm3fo2j".into()).is_ok());
        assert!(RecordKey::new("self".into()).is_ok());
        assert!(RecordKey::new(".".into()).is_err());
        assert!(RecordKey::new("..".into()).is_err());
        assert!(RecordKey::new("a/b".into()).is_err());
        assert!(RecordKey::new("".into()).is_err());
    }

    #[test]
    fn record_path() {
        let path: RecordPath = "app.bsky.feed.post/3jqfcqzm3fo2j".parse().expect("valid path");
        assert_eq!(path.collection.as_str(), "app.bsky.feed.post");
        assert_eq!(path.rkey.as_str(), "3jqfcqzm3fo2j");

        assert!("app.bsky.feed.post".parse::<RecordPath>().is_err());
        assert!("app.bsky.feed.post/a/b".parse::<RecordPath>().is_err());
        assert!("nonsense/3jqfcqzm3fo2j".parse::<RecordPath>().is_err());
    }

    #[test]
    fn at_identifier() {
        match "did:plc:z72i7hdynmk6r22z27h6tvur".parse::<AtIdentifier>().expect("valid") {
            AtIdentifier::Did(did) => assert_eq!(did.as_str(), "did:plc:z72i7hdynmk6r22z27h6tvur"),
            AtIdentifier::Handle(_) => panic!("parsed as handle"),
        }
        match "alice.test".parse::<AtIdentifier>().expect("valid") {
            AtIdentifier::Handle(handle) => assert_eq!(handle.as_str(), "alice.test"),
            AtIdentifier::Did(_) => panic!("parsed as did"),
        }
        assert!("not an identifier".parse::<AtIdentifier>().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let did = from_str::<Did>(r#""did:plc:abcd""#).expect("deserialize");
        assert_eq!(to_string(&did).expect("serialize"), r#""did:plc:abcd""#);
        assert!(from_str::<Did>(r#""bogus""#).is_err());
    }
}
