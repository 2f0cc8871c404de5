//! Pipeline nodes: an operator instance plus its enable and picker state.

use std::hash::Hasher;

use pixpipe_cache::{HashNode, ModuleId, OperationTags};
use serde::Serialize;
use siphasher::sip::SipHasher13;

use crate::ops::Operator;

/// One instance of an operator in the pipe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    /// Module identity, unique within a pipe.
    pub module: ModuleId,
    /// Display name, also the cache label of the node's output.
    pub name: &'static str,
    /// The operation and its parameters.
    pub op: Operator,
    /// Disabled nodes are skipped during evaluation.
    pub enabled: bool,
    /// Whether the node samples the color picker on its output.
    pub color_pick: bool,
}

impl Node {
    /// An enabled node that does not pick colors.
    #[must_use]
    pub const fn new(module: u32, name: &'static str, op: Operator) -> Self {
        Self {
            module: ModuleId(module),
            name,
            op,
            enabled: true,
            color_pick: false,
        }
    }
}

impl HashNode for Node {
    fn module(&self) -> ModuleId {
        self.module
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disabled nodes hash only their identity, so parameter edits on a
    /// disabled node keep the cache warm.
    fn content_hash(&self) -> u64 {
        let mut hasher = SipHasher13::new();
        hasher.write_u32(self.module.0);
        hasher.write_u8(u8::from(self.enabled));
        if self.enabled {
            self.op.hash_params(&mut hasher);
        }
        hasher.finish()
    }

    fn operation_tags(&self) -> OperationTags {
        self.op.tags()
    }

    fn requests_color_pick(&self) -> bool {
        self.color_pick
    }
}
