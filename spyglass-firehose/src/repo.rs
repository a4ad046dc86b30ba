//! Record lookup over the block bundle of a single commit.

use ipld_core::{cid::Cid, ipld::Ipld};
use serde::Deserialize;
use spyglass_types::string::Did;

use crate::{car::CarIndex, mst};

/// A signed repository commit object.
///
/// Defined in: https://atproto.com/specs/repository
#[derive(Deserialize, Debug, Clone)]
pub struct SignedCommit {
    /// the account DID associated with the repo, in strictly normalized form
    pub did: Did,
    /// fixed value of 3 for this repo format version
    pub version: i64,
    /// pointer to the top of the repo contents tree structure (MST)
    pub data: Cid,
    /// revision of the repo, used as a logical clock
    pub rev: String,
    /// pointer (by hash) to a previous commit object for this repository
    #[serde(default)]
    pub prev: Option<Cid>,
    /// cryptographic signature of this commit, as raw bytes
    pub sig: Ipld,
}

/// A read-only view over the repository slice carried by a commit frame.
pub struct Repository<'b> {
    blocks: &'b CarIndex,
    commit: SignedCommit,
}

impl<'b> Repository<'b> {
    /// Opens the repository rooted at the given commit CID.
    pub fn open(blocks: &'b CarIndex, root: Cid) -> Result<Self, Error> {
        let bytes = blocks.get(&root).ok_or(Error::MissingCommit(root))?;
        let commit: SignedCommit = serde_ipld_dagcbor::from_slice(bytes)?;
        Ok(Self { blocks, commit })
    }

    pub fn commit(&self) -> &SignedCommit {
        &self.commit
    }

    /// Returns the record at `path` (`collection/rkey`) together with the
    /// CID under which its bytes appear in the bundle, or `None` if the
    /// tree has no such key.
    pub fn get_record(&self, path: &str) -> Result<Option<(Cid, &'b [u8])>, Error> {
        let Some(cid) = mst::locate(self.blocks, self.commit.data, path)? else {
            return Ok(None);
        };
        let bytes = self.blocks.get(&cid).ok_or(Error::MissingRecord(cid))?;
        Ok(Some((cid, bytes)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("commit object {0} is not present in the block bundle")]
    MissingCommit(Cid),
    #[error("record block {0} is not present in the block bundle")]
    MissingRecord(Cid),
    #[error("MST error: {0}")]
    Mst(#[from] mst::Error),
    #[error("serde_ipld_dagcbor decoding error: {0}")]
    Parse(#[from] serde_ipld_dagcbor::DecodeError<std::convert::Infallible>),
}
