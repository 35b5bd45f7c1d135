use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::document::Visibility;
use crate::role::RoleCode;

/// Denormalized permission snapshot carried on every chunk document so
/// the index can filter without a join back to C2, per spec §4.3/§4.9.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: Uuid,
    pub owner_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub visibility: Visibility,
    pub shared_with_users: BTreeSet<Uuid>,
    pub shared_with_roles: BTreeSet<RoleCode>,
    pub filename: String,
    pub filepath: Option<String>,
    pub checksum: String,
    pub file_type: String,
    pub original_file_url: Option<String>,
    pub page_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub version_id: Uuid,
    pub page_number: u32,
    pub local_index: u32,
    pub text: String,
    pub vector: Option<Vec<f32>>,
    pub metadata: ChunkMetadata,
}

/// `chunk_id = hash(version_id, page, local_index)` from spec §3: a
/// deterministic id so re-running the Chunk stage after a crash produces
/// identical ids (task idempotence, spec §8).
pub fn derive_chunk_id(version_id: Uuid, page_number: u32, local_index: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version_id.as_bytes());
    hasher.update(page_number.to_be_bytes());
    hasher.update(local_index.to_be_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
