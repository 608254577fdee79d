//! Volume ownership election.
//!
//! Every controller instance computes the same owner for a volume from the
//! same inputs, so at most one instance mutates it while the others no-op.
//! Preference order:
//!
//! 1. the desired attach node (`spec.node_id`), when it is ready;
//! 2. the node the current engine sits on, when it is ready;
//! 3. the ready node with the smallest digest of `volume ‖ node`.
//!
//! The digest step is a pure function of the current live membership, so a
//! node joining or leaving rebalances detached volumes deterministically
//! across the survivors. Stale liveness views are tolerated: a non-owner
//! that wrongly believes it owns a volume will lose every datastore write
//! race to the real owner's committed versions, and a missed ownership
//! change heals on the next reconcile.

use sha3::{Digest, Sha3_256};

use dbv_common::{Engine, Node, Volume};

/// Compute the owning controller for `volume`. `None` when no node is ready.
#[must_use]
pub fn elect_owner(volume: &Volume, engines: &[Engine], nodes: &[Node]) -> Option<String> {
    let ready = |name: &str| -> bool {
        nodes
            .iter()
            .any(|n| n.name() == name && n.is_ready())
    };

    if !volume.spec.node_id.is_empty() && ready(&volume.spec.node_id) {
        return Some(volume.spec.node_id.clone());
    }

    for engine in engines {
        let node = &engine.spec.instance.node_id;
        if !node.is_empty() && ready(node) {
            return Some(node.clone());
        }
    }

    nodes
        .iter()
        .filter(|n| n.is_ready())
        .min_by_key(|n| stable_digest(volume.name(), n.name()))
        .map(|n| n.name().to_string())
}

fn stable_digest(volume_name: &str, node_name: &str) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(volume_name.as_bytes());
    hasher.update(b"/");
    hasher.update(node_name.as_bytes());
    hasher.finalize().into()
}
