//! CAR file parsing for ATProto repositories.
//!
//! Two callers: commit frames on the firehose carry a small CAR block store
//! with the records touched by the commit ([`parse_block_map`]), and repo
//! rescans pull the whole repository as one CAR and walk its MST to recover
//! every `collection/rkey` path ([`parse_repo_car`]).

use std::collections::HashMap;
use std::io::Cursor;

use ipld_core::cid::Cid;
use iroh_car::CarReader;
use serde::de::DeserializeOwned;
use tracing::{trace, warn};

use crate::AtprotoError;

/// A record pulled out of a full-repo CAR.
#[derive(Debug, Clone)]
pub struct CarRecord {
    /// MST key, `collection/rkey`.
    pub path: String,
    /// CID of the record block.
    pub cid: String,
    /// Raw DAG-CBOR record bytes.
    pub data: Vec<u8>,
}

/// Result of walking a full-repo CAR.
#[derive(Debug, Default)]
pub struct RepoCar {
    /// Repository revision from the signed commit.
    pub rev: Option<String>,
    pub records: Vec<CarRecord>,
}

/// Read all blocks of a CAR into a CID-keyed map, returning the roots.
pub async fn parse_block_map(
    data: &[u8],
) -> Result<(Vec<Cid>, HashMap<String, Vec<u8>>), AtprotoError> {
    let cursor = Cursor::new(data);
    let mut reader = CarReader::new(cursor)
        .await
        .map_err(|e| AtprotoError::CarParse(format!("failed to read CAR header: {e}")))?;

    let roots = reader.header().roots().to_vec();
    let mut blocks = HashMap::new();

    loop {
        match reader.next_block().await {
            Ok(Some((cid, block))) => {
                blocks.insert(cid.to_string(), block);
            }
            Ok(None) => break,
            Err(e) => {
                return Err(AtprotoError::CarParse(format!("failed to read block: {e}")));
            }
        }
    }

    Ok((roots, blocks))
}

/// Walk a full-repo CAR and collect every record with its MST path.
pub async fn parse_repo_car(car_bytes: &[u8]) -> Result<RepoCar, AtprotoError> {
    let (roots, blocks) = parse_block_map(car_bytes).await?;

    let Some(commit_cid) = roots.first() else {
        return Err(AtprotoError::CarParse("CAR file has no roots".to_string()));
    };

    let commit_data = blocks
        .get(&commit_cid.to_string())
        .ok_or_else(|| AtprotoError::CarParse("commit block not found".to_string()))?;

    let commit: Commit = parse_cbor(commit_data)?;

    let mut result = RepoCar {
        rev: Some(commit.rev),
        records: Vec::new(),
    };

    walk_mst_node(&commit.data.to_string(), &blocks, "", &mut result)?;

    Ok(result)
}

/// ATProto signed commit structure (repo format v3).
#[derive(Debug, serde::Deserialize)]
struct Commit {
    #[allow(dead_code)]
    did: String,
    #[allow(dead_code)]
    version: u32,
    /// The data MST root CID.
    data: Cid,
    /// Repository revision in TID format.
    rev: String,
    #[allow(dead_code)]
    prev: Option<Cid>,
    #[allow(dead_code)]
    #[serde(with = "serde_bytes")]
    sig: Vec<u8>,
}

/// An MST node (NodeData): optional left subtree plus ordered entries.
#[derive(Debug, serde::Deserialize)]
struct MstNode {
    #[serde(rename = "l")]
    left: Option<Cid>,
    #[serde(rename = "e", default)]
    entries: Vec<MstEntry>,
}

/// An MST tree entry. Keys are prefix-compressed against the previous entry
/// in the same node; the first entry of a node has `p = 0`.
#[derive(Debug, serde::Deserialize)]
struct MstEntry {
    #[serde(rename = "p", default)]
    prefix_len: usize,
    #[serde(rename = "k")]
    key_suffix: serde_bytes::ByteBuf,
    #[serde(rename = "v")]
    value: Option<Cid>,
    #[serde(rename = "t")]
    tree: Option<Cid>,
}

fn parse_cbor<T: DeserializeOwned>(data: &[u8]) -> Result<T, AtprotoError> {
    serde_ipld_dagcbor::from_slice(data).map_err(|e| AtprotoError::CborDecode(format!("{e}")))
}

const MAX_KEY_SUFFIX_LEN: usize = 512;

fn walk_mst_node(
    cid: &str,
    blocks: &HashMap<String, Vec<u8>>,
    key_prefix: &str,
    result: &mut RepoCar,
) -> Result<(), AtprotoError> {
    let Some(data) = blocks.get(cid) else {
        warn!(cid = %cid, "MST node block not found");
        return Ok(());
    };

    let node: MstNode = parse_cbor(data)?;

    if let Some(ref left) = node.left {
        walk_mst_node(&left.to_string(), blocks, key_prefix, result)?;
    }

    let mut prev_key = key_prefix.to_string();

    for entry in &node.entries {
        if entry.key_suffix.len() > MAX_KEY_SUFFIX_LEN {
            warn!(
                suffix_len = entry.key_suffix.len(),
                "key suffix too long, skipping entry"
            );
            continue;
        }

        let key_suffix = String::from_utf8_lossy(&entry.key_suffix);

        let full_key = if entry.prefix_len > 0 {
            if entry.prefix_len > prev_key.len() {
                warn!(
                    prefix_len = entry.prefix_len,
                    prev_key_len = prev_key.len(),
                    "prefix_len exceeds previous key length, using suffix only"
                );
                key_suffix.to_string()
            } else {
                format!("{}{}", &prev_key[..entry.prefix_len], key_suffix)
            }
        } else {
            key_suffix.to_string()
        };

        if let Some(ref value_cid) = entry.value {
            let value_cid = value_cid.to_string();
            match blocks.get(&value_cid) {
                Some(record) => result.records.push(CarRecord {
                    path: full_key.clone(),
                    cid: value_cid,
                    data: record.clone(),
                }),
                None => {
                    warn!(cid = %value_cid, key = %full_key, "record block not found");
                }
            }
        }

        if let Some(ref tree) = entry.tree {
            walk_mst_node(&tree.to_string(), blocks, &full_key, result)?;
        }

        trace!(key = %full_key, "walked MST entry");
        prev_key = full_key;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parse_repo_car_empty_data() {
        assert!(parse_repo_car(&[]).await.is_err());
    }

    #[tokio::test]
    async fn test_parse_repo_car_invalid_data() {
        assert!(parse_repo_car(&[0, 1, 2, 3, 4, 5]).await.is_err());
    }

    #[test]
    fn test_mst_entry_prefix_compression() {
        // Keys reconstruct as prefix(prev, p) + suffix.
        let prev = "app.bsky.feed.post/3abc";
        let suffix = "xyz";
        let p = 19usize; // "app.bsky.feed.post/".len()
        let full = format!("{}{}", &prev[..p], suffix);
        assert_eq!(full, "app.bsky.feed.post/xyz");
    }
}
