//! Object and node identifiers: lightweight, ordered, copyable.

/// A cluster-wide identifier for a simulated object.
///
/// Ids are dense: a placement of `n` objects uses `O0..O(n-1)`. The newtype
/// keeps object ids from being confused with sequence numbers or ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectId(u32);

impl ObjectId {
    /// Create an object id from a raw integer.
    #[inline]
    pub const fn new(id: u32) -> Self {
        ObjectId(id)
    }

    /// Return the underlying integer.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The id as a vector index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "O{}", self.0)
    }
}

/// Identifier of a cluster node (one process, or one in-process endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(u32);

impl NodeId {
    /// The node that coordinates GVT rounds.
    pub const COORDINATOR: NodeId = NodeId(0);

    /// Create a node id from a raw integer.
    #[inline]
    pub const fn new(id: u32) -> Self {
        NodeId(id)
    }

    /// Return the underlying integer.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The id as a vector index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node{}", self.0)
    }
}
