use ipld_core::cid::Cid;
use ipld_core::ipld::Ipld;
use serde::{Deserialize, Serialize};

/// Representation of an IPLD link.
///
/// Serializes as a native CBOR tag 42 link in binary codecs and as the
/// `{"$link": "..."}` form in human-readable ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidLink(pub Cid);

#[derive(Serialize, Deserialize)]
struct Link {
    #[serde(rename = "$link")]
    link: String,
}

impl Serialize for CidLink {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            Link { link: self.0.to_string() }.serialize(serializer)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for CidLink {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let ipld = Ipld::deserialize(deserializer)?;
        match &ipld {
            Ipld::Link(cid) => {
                return Ok(Self(*cid));
            }
            Ipld::Map(map) => {
                if map.len() == 1 {
                    if let Some(Ipld::String(link)) = map.get("$link") {
                        return Ok(Self(
                            Cid::try_from(link.as_str()).map_err(serde::de::Error::custom)?,
                        ));
                    }
                }
            }
            _ => {}
        }
        Err(serde::de::Error::custom("Invalid cid-link"))
    }
}

impl TryFrom<&str> for CidLink {
    type Error = ipld_core::cid::Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Ok(Self(Cid::try_from(s)?))
    }
}

impl std::fmt::Display for CidLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
