//! Node-scoped configuration reconciliation.
//!
//! Each daemon reconciles exactly one node: the one whose name matches its
//! controller id. Other nodes' keys are observed and skipped. Both
//! operations are idempotent:
//!
//! - **Default disk provisioning**: gated by the
//!   `create-default-disk-labeled-nodes` setting and the node's
//!   `create-default-disk` label. Label `true` provisions one disk at the
//!   `default-data-path` setting; label `config` provisions every disk in
//!   the node's default-disks annotation; anything else does nothing.
//!   Provisioning only applies to nodes with no disks registered yet.
//! - **Default tag propagation**: a node with no tags adopts the tag list
//!   from its default-node-tags annotation.

use std::sync::Arc;

use tracing::{info, warn};

use dbv_common::labels::{
    CREATE_DEFAULT_DISK_CONFIG, CREATE_DEFAULT_DISK_LABEL, CREATE_DEFAULT_DISK_TRUE,
    DEFAULT_DISKS_ANNOTATION, DEFAULT_NODE_TAGS_ANNOTATION,
};
use dbv_common::meta::ObjectMeta;
use dbv_common::node::{
    parse_default_disk_annotation, parse_node_tag_annotation, DefaultDiskConfig,
};
use dbv_common::settings::SettingName;
use dbv_common::{Disk, DiskSpec, Node};
use dbv_datastore::DataStore;

use crate::error::ControllerError;
use crate::events::EventRecorder;

pub struct NodeController {
    ds: DataStore,
    controller_id: String,
    #[allow(dead_code)]
    recorder: Arc<dyn EventRecorder>,
}

impl NodeController {
    pub fn new(ds: DataStore, controller_id: impl Into<String>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            ds,
            controller_id: controller_id.into(),
            recorder,
        }
    }

    pub fn reconcile(&self, node_name: &str) -> Result<(), ControllerError> {
        if node_name != self.controller_id {
            // Not ours; another daemon owns this node.
            return Ok(());
        }
        let node = match self.ds.get_node(node_name) {
            Ok(node) => node,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let node = self.sync_default_disks(node)?;
        self.sync_default_tags(node)?;
        Ok(())
    }

    fn sync_default_disks(&self, node: Node) -> Result<Node, ControllerError> {
        if !self
            .ds
            .get_setting_as_bool(SettingName::CreateDefaultDiskLabeledNodes)?
        {
            return Ok(node);
        }
        // Only a blank node gets defaults; operator-managed disks win.
        if !node.spec.disk_path_map.is_empty() {
            return Ok(node);
        }
        let Some(label) = node.meta.labels.get(CREATE_DEFAULT_DISK_LABEL) else {
            return Ok(node);
        };

        let disk_configs: Vec<DefaultDiskConfig> = match label.to_lowercase().as_str() {
            CREATE_DEFAULT_DISK_TRUE => {
                let path = self.ds.get_setting_value(SettingName::DefaultDataPath);
                vec![DefaultDiskConfig {
                    path,
                    storage_reserved: 0,
                    allow_scheduling: true,
                    tags: vec![],
                }]
            }
            CREATE_DEFAULT_DISK_CONFIG => {
                let Some(raw) = node.meta.annotations.get(DEFAULT_DISKS_ANNOTATION) else {
                    return Ok(node);
                };
                match parse_default_disk_annotation(raw) {
                    Ok(configs) => configs,
                    Err(e) => {
                        warn!(
                            node = node.name(),
                            "unparseable default-disks annotation: {}", e
                        );
                        return Ok(node);
                    }
                }
            }
            "false" => return Ok(node),
            other => {
                warn!(node = node.name(), label = other, "invalid create-default-disk label");
                return Ok(node);
            }
        };
        if disk_configs.is_empty() {
            return Ok(node);
        }

        let mut node = node;
        for (index, config) in disk_configs.iter().enumerate() {
            let disk_id = format!("{}-disk-{}", node.name(), index);
            let disk = Disk {
                meta: ObjectMeta::named(&disk_id),
                spec: DiskSpec {
                    node_id: node.name().to_string(),
                    path: config.path.clone(),
                    storage_reserved: config.storage_reserved,
                    allow_scheduling: config.allow_scheduling,
                    tags: config.tags.clone(),
                },
                status: Default::default(),
            };
            match self.ds.create_disk(disk) {
                Ok(_) => {
                    info!(node = node.name(), disk = %disk_id, path = %config.path, "default disk created");
                }
                Err(e) if matches!(e, dbv_datastore::DatastoreError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            node.spec
                .disk_path_map
                .insert(disk_id, config.path.clone());
        }
        Ok(self.ds.update_node(node)?)
    }

    fn sync_default_tags(&self, node: Node) -> Result<(), ControllerError> {
        if !node.spec.tags.is_empty() {
            return Ok(());
        }
        let Some(raw) = node.meta.annotations.get(DEFAULT_NODE_TAGS_ANNOTATION) else {
            return Ok(());
        };
        let tags = match parse_node_tag_annotation(raw) {
            Ok(tags) => tags,
            Err(e) => {
                warn!(node = node.name(), "unparseable default-node-tags annotation: {}", e);
                return Ok(());
            }
        };
        if tags.is_empty() {
            return Ok(());
        }
        let mut node = node;
        node.spec.tags = tags;
        info!(node = node.name(), "default node tags applied");
        self.ds.update_node(node)?;
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
