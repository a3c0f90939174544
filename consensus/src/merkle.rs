use crate::header::sha256d;
use crate::types::Txid;

/// Merkle root over transaction ids. Odd levels pair their last node with
/// itself. Returns `None` for an empty list.
pub fn merkle_root(txids: &[Txid]) -> Option<[u8; 32]> {
    if txids.is_empty() {
        return None;
    }
    let mut level = txids.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let left = pair[0];
                let right = pair.get(1).copied().unwrap_or(left);
                let mut joined = [0u8; 64];
                joined[..32].copy_from_slice(&left);
                joined[32..].copy_from_slice(&right);
                sha256d(&joined)
            })
            .collect();
    }
    Some(level[0])
}
