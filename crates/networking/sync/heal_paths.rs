//! Ordering and merging of trie-heal requests.
//!
//! Heal paths are sorted by (account path, storage path) so that consecutive
//! storage-node requests for the same account can be merged into a single
//! path set, roughly halving wire volume when many same-account nodes heal
//! together.

use std::cmp::Ordering;

use ethereum_types::H256;
use vela_trie::sync::SyncPath;

/// A merged wire request: the first element is an account path (compact or
/// full key bytes), any further elements are storage paths under that account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrieNodePathSet(pub Vec<Vec<u8>>);

fn cmp_sync_paths(a: &SyncPath, b: &SyncPath) -> Ordering {
    match a.0[0].cmp(&b.0[0]) {
        Ordering::Equal => {}
        other => return other,
    }
    match a.len().cmp(&b.len()) {
        Ordering::Equal => {}
        other => return other,
    }
    if a.len() == 2 {
        return a.0[1].cmp(&b.0[1]);
    }
    Ordering::Equal
}

/// Merges sorted sync paths so that several storage requests concerning the
/// same account collapse into one path set. Requires sorted input.
fn merge(sync_paths: &[SyncPath]) -> Vec<TrieNodePathSet> {
    let mut result: Vec<TrieNodePathSet> = Vec::new();
    for path in sync_paths {
        if path.len() == 1 {
            // account reference
            result.push(TrieNodePathSet(path.0.clone()));
            continue;
        }
        // storage reference: extend the previous set if it shares the account
        match result.last_mut() {
            Some(last) if last.0[0] == path.0[0] => last.0.push(path.0[1].clone()),
            _ => result.push(TrieNodePathSet(path.0.clone())),
        }
    }
    result
}

/// Sorts heal requests into the total order required for merging, then builds
/// the merged path sets. Returns the reordered paths and hashes alongside the
/// sync paths and the wire-ready sets.
pub fn sort_by_account_path(
    paths: Vec<Vec<u8>>,
    hashes: Vec<H256>,
) -> (Vec<Vec<u8>>, Vec<H256>, Vec<SyncPath>, Vec<TrieNodePathSet>) {
    let mut entries: Vec<(Vec<u8>, H256, SyncPath)> = paths
        .into_iter()
        .zip(hashes)
        .map(|(path, hash)| {
            let sync_path = SyncPath::from_hex(&path);
            (path, hash, sync_path)
        })
        .collect();
    entries.sort_by(|a, b| cmp_sync_paths(&a.2, &b.2));

    let mut paths = Vec::with_capacity(entries.len());
    let mut hashes = Vec::with_capacity(entries.len());
    let mut sync_paths = Vec::with_capacity(entries.len());
    for (path, hash, sync_path) in entries {
        paths.push(path);
        hashes.push(hash);
        sync_paths.push(sync_path);
    }
    let path_sets = merge(&sync_paths);
    (paths, hashes, sync_paths, path_sets)
}
