//! Label/annotation keys and child-name generation.

use rand::Rng;

/// Label carrying the owning volume's name on engines and replicas.
pub const VOLUME_KEY: &str = "dbv.io/volume";
/// Label carrying the scheduled node on replicas.
pub const NODE_KEY: &str = "dbv.io/node";
/// Label carrying the scheduled disk on replicas.
pub const DISK_KEY: &str = "dbv.io/disk";

/// Finalizer token held by volumes until teardown completes.
pub const CORE_FINALIZER: &str = "dbv.io/core";

/// Node label gating default-disk provisioning: `true`, `false` or `config`.
pub const CREATE_DEFAULT_DISK_LABEL: &str = "dbv.io/create-default-disk";
pub const CREATE_DEFAULT_DISK_TRUE: &str = "true";
pub const CREATE_DEFAULT_DISK_CONFIG: &str = "config";

/// Node annotation with a JSON list of disk specs (label value `config`).
pub const DEFAULT_DISKS_ANNOTATION: &str = "dbv.io/default-disks-config";
/// Node annotation with a JSON list of default node tags.
pub const DEFAULT_NODE_TAGS_ANNOTATION: &str = "dbv.io/default-node-tags";

const RANDOM_ID_LENGTH: usize = 8;
const RANDOM_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Random lowercase-alphanumeric suffix for child names.
#[must_use]
pub fn random_id() -> String {
    let mut rng = rand::thread_rng();
    (0..RANDOM_ID_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..RANDOM_ID_ALPHABET.len());
            RANDOM_ID_ALPHABET[idx] as char
        })
        .collect()
}

/// Engine instance name: `<volume>-e-<randID>`.
#[must_use]
pub fn generate_engine_name(volume_name: &str) -> String {
    format!("{}-e-{}", volume_name, random_id())
}

/// Replica instance name: `<volume>-r-<randID>`.
#[must_use]
pub fn generate_replica_name(volume_name: &str) -> String {
    format!("{}-r-{}", volume_name, random_id())
}

/// Compose the backup URL stored in `volume.spec.from_backup`.
#[must_use]
pub fn backup_url(backup_target: &str, backup_name: &str, backup_volume: &str) -> String {
    format!(
        "{}?backup={}&volume={}",
        backup_target, backup_name, backup_volume
    )
}

/// Split a backup URL into (backup name, backup volume).
#[must_use]
pub fn parse_backup_url(url: &str) -> Option<(String, String)> {
    let (_, query) = url.split_once('?')?;
    let mut backup = None;
    let mut volume = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("backup", v)) => backup = Some(v.to_string()),
            Some(("volume", v)) => volume = Some(v.to_string()),
            _ => {}
        }
    }
    Some((backup?, volume?))
}
