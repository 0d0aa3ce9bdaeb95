//! The versioned, wire-serializable snapshot of node states that the
//! control process publishes and every distributor/storage node observes:
//! [`ClusterState`].

use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::node::{Node, NodeType};
use crate::state::{NodeState, State};

/// A versioned snapshot of per-node states plus the overall cluster state
/// and distribution-bit count.
///
/// Internally this only stores entries that differ from the implicit
/// default ("Up, no description") — see [`NodeState::is_default_up`] — and
/// trims trailing down-nodes, matching the sparse wire representation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ClusterState {
    pub version: u32,
    pub cluster_state: State,
    pub distribution_bits: u8,
    distributor_count: u16,
    storage_count: u16,
    node_states: BTreeMap<(NodeType, u16), NodeState>,
}

impl ClusterState {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            cluster_state: State::Up,
            distribution_bits: 16,
            distributor_count: 0,
            storage_count: 0,
            node_states: BTreeMap::new(),
        }
    }

    pub fn distribution_bit_count(&self) -> u8 {
        self.distribution_bits
    }

    pub fn node_count(&self, node_type: NodeType) -> u16 {
        match node_type {
            NodeType::Distributor => self.distributor_count,
            NodeType::Storage => self.storage_count,
        }
    }

    /// Lookup order: explicit entry, else default-Down if beyond the
    /// type's node count, else default-Up.
    pub fn node_state(&self, node: Node) -> NodeState {
        if let Some(state) = self.node_states.get(&(node.node_type, node.index)) {
            return state.clone();
        }
        if node.index >= self.node_count(node.node_type) {
            NodeState::down()
        } else {
            NodeState::up()
        }
    }

    /// Installs a node state, backfilling the type's node count if needed
    /// and erasing the entry again if it turns out to equal the implicit
    /// default (keeps the sparse invariant intact after mutation).
    pub fn set_node_state(&mut self, node: Node, state: NodeState) {
        let count = match node.node_type {
            NodeType::Distributor => &mut self.distributor_count,
            NodeType::Storage => &mut self.storage_count,
        };
        if node.index >= *count {
            *count = node.index + 1;
        }
        if state.is_default_up() {
            self.node_states.remove(&(node.node_type, node.index));
        } else {
            self.node_states.insert((node.node_type, node.index), state);
        }
        self.remove_extra_elements();
    }

    /// Drops the trailing run of default-Down entries from each type's
    /// count so the node count only ever reflects the highest index of a
    /// node that is not implicitly down.
    fn remove_extra_elements(&mut self) {
        for node_type in [NodeType::Distributor, NodeType::Storage] {
            let mut count = self.node_count(node_type);
            while count > 0 {
                let idx = count - 1;
                let explicit = self.node_states.get(&(node_type, idx));
                let effectively_down = match explicit {
                    Some(s) => s.state == State::Down,
                    None => false,
                };
                if effectively_down {
                    self.node_states.remove(&(node_type, idx));
                    count -= 1;
                } else {
                    break;
                }
            }
            match node_type {
                NodeType::Distributor => self.distributor_count = count,
                NodeType::Storage => self.storage_count = count,
            }
        }
    }

    /// Canonical single-line token-stream serialization. Writer order is
    /// `version`, `cluster`, `bits`, then each node type's count followed
    /// by its per-node fragments in ascending index order.
    pub fn serialize(&self) -> String {
        let mut tokens = Vec::new();
        tokens.push(format!("version:{}", self.version));
        if self.cluster_state != State::Up {
            tokens.push(format!("cluster:{}", self.cluster_state.serialized()));
        }
        if self.distribution_bits != 16 {
            tokens.push(format!("bits:{}", self.distribution_bits));
        }
        for node_type in [NodeType::Distributor, NodeType::Storage] {
            let count = self.node_count(node_type);
            if count > 0 {
                tokens.push(format!("{}:{}", node_type.wire_tag(), count));
            }
            for idx in 0..count {
                if let Some(state) = self.node_states.get(&(node_type, idx)) {
                    let fragment = state.serialize();
                    for kv in fragment.split_whitespace() {
                        tokens.push(format!("{}.{}.{}", node_type.wire_tag(), idx, kv));
                    }
                }
            }
        }
        tokens.join(" ")
    }

    /// Forgiving parser: unknown keys are ignored, relative keys (starting
    /// with `.`) inherit the node-type/index prefix of the previous
    /// absolute key, matching the wire format's token-stream convention.
    pub fn parse(serialized: &str) -> Result<ClusterState, ConfigError> {
        let mut cluster_state = ClusterState::new(0);
        let mut pending: BTreeMap<(NodeType, u16), Vec<(String, String)>> = BTreeMap::new();
        let mut last_absolute_path: Option<(NodeType, u16)> = None;

        for raw_token in serialized.split_whitespace() {
            let Some((key, value)) = raw_token.split_once(':') else {
                continue;
            };
            let key = if let Some(rest) = key.strip_prefix('.') {
                match last_absolute_path {
                    Some((node_type, idx)) => {
                        format!("{}.{}.{}", node_type.wire_tag(), idx, rest)
                    }
                    None => continue,
                }
            } else {
                key.to_string()
            };

            let parts: Vec<&str> = key.split('.').collect();
            match parts.as_slice() {
                ["version"] => {
                    cluster_state.version = value.parse().map_err(|_| ConfigError::InvalidToken(value.to_string()))?;
                }
                ["cluster"] => {
                    cluster_state.cluster_state = State::parse(value)?;
                }
                ["bits"] => {
                    cluster_state.distribution_bits =
                        value.parse().map_err(|_| ConfigError::InvalidToken(value.to_string()))?;
                }
                ["distributor"] => {
                    cluster_state.distributor_count =
                        value.parse().map_err(|_| ConfigError::InvalidToken(value.to_string()))?;
                }
                ["storage"] => {
                    cluster_state.storage_count =
                        value.parse().map_err(|_| ConfigError::InvalidToken(value.to_string()))?;
                }
                [type_tag, idx_str, field] => {
                    let node_type = match *type_tag {
                        "distributor" => NodeType::Distributor,
                        "storage" => NodeType::Storage,
                        _ => continue,
                    };
                    let Ok(idx) = idx_str.parse::<u16>() else { continue };
                    last_absolute_path = Some((node_type, idx));
                    pending
                        .entry((node_type, idx))
                        .or_default()
                        .push(((*field).to_string(), value.to_string()));
                }
                // Unknown key shape: ignored for forward compatibility.
                _ => {}
            }
        }

        for ((node_type, idx), fields) in pending {
            let token_refs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let node_state = NodeState::parse(&token_refs)?;
            let count = match node_type {
                NodeType::Distributor => &mut cluster_state.distributor_count,
                NodeType::Storage => &mut cluster_state.storage_count,
            };
            if idx >= *count {
                *count = idx + 1;
            }
            if !node_state.is_default_up() {
                cluster_state.node_states.insert((node_type, idx), node_state);
            }
        }
        cluster_state.remove_extra_elements();
        Ok(cluster_state)
    }

    /// Iterates the explicit (non-default) node states only.
    pub fn explicit_node_states(&self) -> impl Iterator<Item = (Node, &NodeState)> {
        self.node_states
            .iter()
            .map(|(&(node_type, idx), state)| (Node::new(node_type, idx), state))
    }
}
