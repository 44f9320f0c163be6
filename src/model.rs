//! Ledger model: block variants and the append-only chain they form.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::crypto::digest_canonical;
use crate::message::Request;

/// Previous hash carried by the genesis entry.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// What a block needs to know about a request.
pub trait RequestRecord {
    fn id(&self) -> &str;
    fn message(&self) -> &str;
    fn action(&self) -> &str;
    fn date(&self) -> &str;
}

/// What a block needs to know about a finalized bundle.
pub trait BundleRecord {
    type Request: RequestRecord;

    fn request(&self) -> &Self::Request;
    fn canonical_json(&self) -> serde_json::Result<String>;
}

/// Records that a request was opened for voting. Its hash is the request id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestBlock {
    pub previous_hash: String,
    pub hash: String,
    #[serde(rename = "requestID")]
    pub request_id: String,
    pub message: String,
    pub action: String,
    pub date: String,
}

impl RequestBlock {
    pub fn new<R: RequestRecord>(request: &R, previous_hash: impl Into<String>) -> Self {
        Self {
            previous_hash: previous_hash.into(),
            hash: request.id().to_string(),
            request_id: request.id().to_string(),
            message: request.message().to_string(),
            action: request.action().to_string(),
            date: request.date().to_string(),
        }
    }

    /// Rebuild the request this block was opened for.
    pub fn request(&self) -> Request {
        Request {
            id: self.request_id.clone(),
            message: self.message.clone(),
            action: self.action.clone(),
            date: self.date.clone(),
        }
    }
}

/// Records the finalized outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleBlock {
    pub previous_hash: String,
    pub hash: String,
    #[serde(rename = "requestID")]
    pub request_id: String,
    /// Canonical JSON of the bundle, captured when the block was built.
    pub bundle_payload: String,
}

impl BundleBlock {
    pub fn new<B: BundleRecord>(
        bundle: &B,
        previous_hash: impl Into<String>,
    ) -> serde_json::Result<Self> {
        let previous_hash = previous_hash.into();
        let request_id = bundle.request().id().to_string();
        let bundle_payload = bundle.canonical_json()?;
        let hash = compute_bundle_hash(&previous_hash, &request_id, &bundle_payload)?;
        Ok(Self {
            previous_hash,
            hash,
            request_id,
            bundle_payload,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BundleHashInput<'a> {
    previous_hash: &'a str,
    #[serde(rename = "requestID")]
    request_id: &'a str,
    bundle_payload: &'a str,
}

/// SHA-256 hex over the canonical JSON of `{bundlePayload, previousHash, requestID}`.
pub fn compute_bundle_hash(
    previous_hash: &str,
    request_id: &str,
    bundle_payload: &str,
) -> serde_json::Result<String> {
    digest_canonical(&BundleHashInput {
        previous_hash,
        request_id,
        bundle_payload,
    })
}

/// One ledger entry. Persisted with a `variant` tag of `request` or `bundle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "lowercase")]
pub enum Block {
    Request(RequestBlock),
    Bundle(BundleBlock),
}

impl Block {
    pub fn hash(&self) -> &str {
        match self {
            Block::Request(b) => &b.hash,
            Block::Bundle(b) => &b.hash,
        }
    }

    pub fn previous_hash(&self) -> &str {
        match self {
            Block::Request(b) => &b.previous_hash,
            Block::Bundle(b) => &b.previous_hash,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Block::Request(b) => &b.request_id,
            Block::Bundle(b) => &b.request_id,
        }
    }

    /// Whether the stored hash is the one this block's contents produce.
    pub fn has_valid_hash(&self) -> bool {
        match self {
            Block::Request(b) => b.hash == b.request_id,
            Block::Bundle(b) => {
                compute_bundle_hash(&b.previous_hash, &b.request_id, &b.bundle_payload)
                    .is_ok_and(|h| h == b.hash)
            }
        }
    }
}

impl From<RequestBlock> for Block {
    fn from(block: RequestBlock) -> Self {
        Block::Request(block)
    }
}

impl From<BundleBlock> for Block {
    fn from(block: BundleBlock) -> Self {
        Block::Bundle(block)
    }
}

/// Why an append was refused. The chain is untouched in every case.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppendRejection {
    #[error("block links to {found}, head is {expected}")]
    Linkage { expected: String, found: String },

    #[error("hash {0} is already on the chain")]
    DuplicateHash(String),

    #[error("request {0} already has a bundle block")]
    DuplicateBundle(String),
}

/// Why a restored entry sequence is not a valid chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("chain has no entries")]
    Empty,

    #[error("genesis entry must be a request block with previous hash \"0\"")]
    BadGenesis,

    #[error("entry {index}: stored hash does not match block contents")]
    HashMismatch { index: usize },

    #[error("entry {index}: {source}")]
    Rejected {
        index: usize,
        #[source]
        source: AppendRejection,
    },
}

/// Ordered, append-only sequence of blocks starting at a genesis request block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    entries: Vec<Block>,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain {
    /// A chain holding only the genesis block.
    pub fn new() -> Self {
        Self {
            entries: vec![Self::create_genesis()],
        }
    }

    fn create_genesis() -> Block {
        let bootstrap = Request {
            id: "genesis".into(),
            message: "genesis".into(),
            action: "approval".into(),
            date: "01 Jan 1970".into(),
        };
        RequestBlock::new(&bootstrap, GENESIS_PREVIOUS_HASH).into()
    }

    /// Rebuild a chain from restored entries, re-checking every invariant and
    /// every stored hash.
    pub fn from_entries(entries: Vec<Block>) -> Result<Self, ChainError> {
        let mut entries = entries.into_iter();
        let genesis = entries.next().ok_or(ChainError::Empty)?;
        match &genesis {
            Block::Request(b) if b.previous_hash == GENESIS_PREVIOUS_HASH => {}
            _ => return Err(ChainError::BadGenesis),
        }
        if !genesis.has_valid_hash() {
            return Err(ChainError::HashMismatch { index: 0 });
        }

        let mut chain = Self {
            entries: vec![genesis],
        };
        for (index, block) in entries.enumerate().map(|(i, b)| (i + 1, b)) {
            if !block.has_valid_hash() {
                return Err(ChainError::HashMismatch { index });
            }
            chain
                .check(&block)
                .map_err(|source| ChainError::Rejected { index, source })?;
            chain.entries.push(block);
        }
        Ok(chain)
    }

    pub fn entries(&self) -> &[Block] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn head(&self) -> &Block {
        self.entries
            .last()
            .expect("chain always holds its genesis block")
    }

    /// Append `block` if it extends the head; `false` leaves the chain as it was.
    pub fn append(&mut self, block: impl Into<Block>) -> bool {
        self.try_append(block).is_ok()
    }

    pub fn try_append(&mut self, block: impl Into<Block>) -> Result<(), AppendRejection> {
        let block = block.into();
        if let Err(rejection) = self.check(&block) {
            warn!(hash = %block.hash(), request_id = %block.request_id(), "Append rejected: {rejection}");
            return Err(rejection);
        }
        info!(
            hash = %block.hash(),
            request_id = %block.request_id(),
            height = self.entries.len(),
            "Appended block"
        );
        self.entries.push(block);
        Ok(())
    }

    fn check(&self, block: &Block) -> Result<(), AppendRejection> {
        let head = self.head().hash();
        if block.previous_hash() != head {
            return Err(AppendRejection::Linkage {
                expected: head.to_string(),
                found: block.previous_hash().to_string(),
            });
        }

        if self.find_by_hash(block.hash()).is_some() {
            return Err(AppendRejection::DuplicateHash(block.hash().to_string()));
        }

        if let Block::Bundle(bundle) = block {
            if self
                .find_bundle_block_by_request_id(&bundle.request_id)
                .is_some()
            {
                return Err(AppendRejection::DuplicateBundle(bundle.request_id.clone()));
            }
        }
        Ok(())
    }

    pub fn find_by_hash(&self, hash: &str) -> Option<&Block> {
        self.entries.iter().find(|b| b.hash() == hash)
    }

    pub fn find_bundle_block_by_request_id(&self, request_id: &str) -> Option<&BundleBlock> {
        self.entries.iter().find_map(|b| match b {
            Block::Bundle(bundle) if bundle.request_id == request_id => Some(bundle),
            _ => None,
        })
    }

    pub fn find_request_block(&self, request_id: &str) -> Option<&RequestBlock> {
        self.entries.iter().find_map(|b| match b {
            Block::Request(request) if request.request_id == request_id => Some(request),
            _ => None,
        })
    }

    /// Walk the whole chain and describe every broken invariant found.
    pub fn verify(&self) -> Vec<String> {
        let mut errors = vec![];
        let mut hashes = HashSet::new();
        let mut bundled = HashSet::new();

        for (i, b) in self.entries.iter().enumerate() {
            // linkage
            if i > 0 {
                let prev = &self.entries[i - 1];
                if b.previous_hash() != prev.hash() {
                    errors.push(format!("block {i} previous hash mismatch"));
                }
            } else if b.previous_hash() != GENESIS_PREVIOUS_HASH || !matches!(b, Block::Request(_)) {
                errors.push("genesis must be a request block with previous hash \"0\"".to_string());
            }

            if !b.has_valid_hash() {
                errors.push(format!("block {i} hash mismatch"));
            }
            if !hashes.insert(b.hash()) {
                errors.push(format!("block {i} duplicates hash {}", b.hash()));
            }
            if let Block::Bundle(bundle) = b {
                if !bundled.insert(bundle.request_id.as_str()) {
                    errors.push(format!(
                        "block {i} is a second bundle for request {}",
                        bundle.request_id
                    ));
                }
            }
        }
        errors
    }
}
