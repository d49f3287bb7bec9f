use std::fmt;

/// Identifier for a process group within one distributed run.
///
/// `Global` covers every rank, `Leaders` holds one rank per node and
/// `Node(id)` the ranks co-located on that node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupId {
    Global,
    Leaders,
    Node(usize),
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupId::Global => write!(f, "global"),
            GroupId::Leaders => write!(f, "leaders"),
            GroupId::Node(id) => write!(f, "node/{id}"),
        }
    }
}

/// A named set of ranks that collective operations are issued over.
///
/// Groups are derived once by `ProcessTopology` and treated as opaque
/// handles by callers; member ranks are kept sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    id: GroupId,
    ranks: Vec<usize>,
}

impl ProcessGroup {
    /// Creates a new group from an id and its member ranks.
    ///
    /// # Arguments
    /// * `id` - The group identifier.
    /// * `ranks` - The member ranks, in any order.
    ///
    /// # Returns
    /// A new `ProcessGroup` with its ranks sorted.
    pub fn new(id: GroupId, mut ranks: Vec<usize>) -> Self {
        ranks.sort_unstable();
        Self { id, ranks }
    }

    /// Returns the group identifier.
    pub fn id(&self) -> &GroupId {
        &self.id
    }

    /// Returns the member ranks in ascending order.
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Returns the number of member ranks.
    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    /// Returns whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// Returns whether `rank` belongs to this group.
    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.binary_search(&rank).is_ok()
    }
}
