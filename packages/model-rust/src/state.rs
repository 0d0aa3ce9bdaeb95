//! Node state: the small closed set of lifecycle states a node can be in or
//! be asked to move to, plus the per-node state record ([`NodeState`]) that
//! carries it.

use std::fmt;

use crate::error::ConfigError;
use crate::node::NodeType;

/// One of the seven legal node states.
///
/// Each state carries a one-character wire form, a numeric rank used by the
/// wanted-state demotion rule, and validity masks describing where the state
/// may legally appear: as a node's self-reported state, as an externally set
/// "wanted" state, and as the overall cluster state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum State {
    Unknown,
    Maintenance,
    Down,
    Stopping,
    Initializing,
    Retired,
    Up,
}

impl State {
    pub const ALL: [State; 7] = [
        State::Unknown,
        State::Maintenance,
        State::Down,
        State::Stopping,
        State::Initializing,
        State::Retired,
        State::Up,
    ];

    pub fn serialized(self) -> char {
        match self {
            State::Unknown => '-',
            State::Maintenance => 'm',
            State::Down => 'd',
            State::Stopping => 's',
            State::Initializing => 'i',
            State::Retired => 'r',
            State::Up => 'u',
        }
    }

    /// Wanted-state demotion rule: a rank gate, not an ordering. A node
    /// already at some rank may only be demoted (or left alone) by an
    /// externally set wanted state whose rank is `<= ` its own.
    pub fn rank(self) -> u8 {
        match self {
            State::Unknown => 0,
            State::Maintenance => 1,
            State::Down => 2,
            State::Stopping => 3,
            State::Initializing => 4,
            State::Retired => 5,
            State::Up => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Unknown => "Unknown",
            State::Maintenance => "Maintenance",
            State::Down => "Down",
            State::Stopping => "Stopping",
            State::Initializing => "Initializing",
            State::Retired => "Retired",
            State::Up => "Up",
        }
    }

    pub fn parse(serialized: &str) -> Result<State, ConfigError> {
        let c = serialized
            .chars()
            .next()
            .ok_or_else(|| ConfigError::InvalidState(serialized.to_string()))?;
        State::ALL
            .into_iter()
            .find(|s| s.serialized() == c)
            .ok_or_else(|| ConfigError::InvalidState(serialized.to_string()))
    }

    /// Whether a node may self-report this state. Identical for both node
    /// types in the reference validity table, but kept as a per-type query
    /// since `NodeType` is part of the contract callers hold.
    pub fn valid_reported_node_state(self, _node_type: NodeType) -> bool {
        matches!(self, State::Unknown | State::Stopping | State::Initializing | State::Up)
    }

    /// Whether `self` may be set as a *wanted* state.
    pub fn valid_wanted_node_state(self, _node_type: NodeType) -> bool {
        matches!(self, State::Maintenance | State::Down | State::Retired | State::Up)
    }

    /// Whether this state may appear as the overall cluster state.
    pub fn valid_cluster_state(self) -> bool {
        matches!(self, State::Down | State::Stopping | State::Initializing | State::Up)
    }

    /// A node in `self` may have its wanted state set to `wanted` only if
    /// `wanted`'s rank does not exceed `self`'s rank (can't "wish" a node
    /// into a healthier state than it is capable of from where it stands).
    pub fn may_set_wanted_state_for_this_node_state(self, wanted: State) -> bool {
        wanted.rank() <= self.rank()
    }

    /// Check membership in a mask string of serialized chars, e.g. `"uim"`
    /// for {Up, Initializing, Maintenance}.
    pub fn one_of(self, mask: &str) -> bool {
        mask.chars().any(|c| c == self.serialized())
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Default for State {
    fn default() -> Self {
        State::Up
    }
}

/// Progress threshold below which two `Initializing` states are considered
/// the same for the purpose of listing bucket contents; small jitter in
/// init-progress shouldn't be treated as a meaningful state change.
pub const LISTING_BUCKETS_INIT_PROGRESS_LIMIT: f64 = 0.01;

/// A node's reported or wanted condition: a [`State`] plus the extra
/// parameters needed to interpret it (capacity, progress, bit budget, etc).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeState {
    pub state: State,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub description: String,
    pub capacity: f64,
    pub init_progress: f64,
    pub min_used_bits: u8,
    pub start_timestamp: u64,
}

impl NodeState {
    pub fn new(state: State) -> Self {
        Self {
            state,
            description: String::new(),
            capacity: 1.0,
            init_progress: 0.0,
            min_used_bits: 16,
            start_timestamp: 0,
        }
    }

    pub fn up() -> Self {
        Self::new(State::Up)
    }

    pub fn down() -> Self {
        Self::new(State::Down)
    }

    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_min_used_bits(mut self, min_used_bits: u8) -> Result<Self, ConfigError> {
        self.set_min_used_bits(min_used_bits)?;
        Ok(self)
    }

    pub fn set_min_used_bits(&mut self, min_used_bits: u8) -> Result<(), ConfigError> {
        if !(1..=58).contains(&min_used_bits) {
            return Err(ConfigError::OutOfRange {
                field: "min_used_bits",
                value: f64::from(min_used_bits),
                low: 1.0,
                high: 58.0,
            });
        }
        self.min_used_bits = min_used_bits;
        Ok(())
    }

    pub fn set_init_progress(&mut self, init_progress: f64) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&init_progress) {
            return Err(ConfigError::OutOfRange {
                field: "init_progress",
                value: init_progress,
                low: 0.0,
                high: 1.0,
            });
        }
        self.init_progress = init_progress;
        Ok(())
    }

    /// Validates the state for the given node type and rejects
    /// distributor-only nonsense like a non-default capacity.
    pub fn verify_support_for_node_type(&self, node_type: NodeType) -> Result<(), ConfigError> {
        if !self.state.valid_reported_node_state(node_type) && !self.state.valid_wanted_node_state(node_type) {
            return Err(ConfigError::InvalidStateForNodeType {
                state: self.state.name(),
                node_type,
            });
        }
        if node_type == NodeType::Distributor && (self.capacity - 1.0).abs() > f64::EPSILON {
            return Err(ConfigError::InvalidStateForNodeType {
                state: "capacity set on distributor",
                node_type,
            });
        }
        Ok(())
    }

    /// Equality ignoring description, and ignoring small init-progress
    /// jitter while both sides are `Initializing`.
    pub fn similar_to(&self, other: &NodeState) -> bool {
        if self.state != other.state {
            return false;
        }
        if (self.capacity - other.capacity).abs() > f64::EPSILON {
            return false;
        }
        if self.min_used_bits != other.min_used_bits {
            return false;
        }
        if self.state == State::Initializing {
            return (self.init_progress - other.init_progress).abs()
                < LISTING_BUCKETS_INIT_PROGRESS_LIMIT;
        }
        true
    }

    /// `true` if this is indistinguishable from the implicit default
    /// ("Up, no description") used to elide entries from a sparse
    /// [`crate::cluster_state::ClusterState`] serialization.
    pub fn is_default_up(&self) -> bool {
        self.state == State::Up
            && self.description.is_empty()
            && (self.capacity - 1.0).abs() < f64::EPSILON
            && self.init_progress == 0.0
            && self.min_used_bits == 16
            && self.start_timestamp == 0
    }

    /// Serializes as `s:<code> c:<capacity> b:<bits> i:<progress> t:<ts>
    /// m:<description>`, omitting fields equal to their default, matching
    /// the wire format's "empty string means Up, default" convention.
    pub fn serialize(&self) -> String {
        if self.is_default_up() {
            return String::new();
        }
        let mut parts = Vec::new();
        if self.state != State::Up {
            parts.push(format!("s:{}", self.state.serialized()));
        }
        if (self.capacity - 1.0).abs() > f64::EPSILON {
            parts.push(format!("c:{}", fmt_double(self.capacity)));
        }
        if self.min_used_bits != 16 {
            parts.push(format!("b:{}", self.min_used_bits));
        }
        if self.state == State::Initializing && self.init_progress != 0.0 {
            parts.push(format!("i:{}", fmt_double(self.init_progress)));
        }
        if self.start_timestamp != 0 {
            parts.push(format!("t:{}", self.start_timestamp));
        }
        if !self.description.is_empty() {
            parts.push(format!("m:{}", escape_description(&self.description)));
        }
        parts.join(" ")
    }

    /// Parses the `key:value` tokens of a single node's state fragment.
    pub fn parse(tokens: &[(&str, &str)]) -> Result<NodeState, ConfigError> {
        let mut node_state = NodeState::up();
        for &(key, value) in tokens {
            match key {
                "s" => node_state.state = State::parse(value)?,
                "c" => {
                    node_state.capacity = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidToken(value.to_string()))?;
                }
                "b" => {
                    let bits: u8 = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidToken(value.to_string()))?;
                    node_state.set_min_used_bits(bits)?;
                }
                "i" => {
                    let progress: f64 = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidToken(value.to_string()))?;
                    node_state.set_init_progress(progress)?;
                }
                "t" => {
                    node_state.start_timestamp = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidToken(value.to_string()))?;
                }
                "m" => node_state.description = unescape_description(value),
                // Unknown keys are ignored for forward compatibility.
                _ => {}
            }
        }
        Ok(node_state)
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::up()
    }
}

fn fmt_double(value: f64) -> String {
    if (value.fract()).abs() < f64::EPSILON {
        format!("{value}")
    } else {
        let s = format!("{value}");
        s
    }
}

fn escape_description(s: &str) -> String {
    s.replace('\\', "\\\\").replace(' ', "\\x20")
}

fn unescape_description(s: &str) -> String {
    s.replace("\\x20", " ").replace("\\\\", "\\")
}
