use halo_core::{CellHandle, Rank};

/// What a schedule step does with its particle lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GhostKind {
    /// The step's node sends its lists to every other node, which store
    /// them in their mirrors.
    Broadcast,
    /// Every node contributes the forces of its copy of the lists; the
    /// step's node accumulates them into its own particles.
    Reduce,
}

/// One round of a ghost communication schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhostCommunication {
    pub kind: GhostKind,
    /// Stage the outgoing buffer during an earlier round.
    pub prefetch: bool,
    /// Root of the round.
    pub node: Rank,
    /// Particle lists taking part, by cell handle.
    pub part_lists: Vec<CellHandle>,
}

impl GhostCommunication {
    pub fn new(node: Rank, part_lists: Vec<CellHandle>) -> Self {
        Self {
            kind: GhostKind::Broadcast,
            prefetch: false,
            node,
            part_lists,
        }
    }

    /// Whether `rank` puts data on the wire in this round.
    pub fn is_send_op(&self, rank: Rank) -> bool {
        match self.kind {
            GhostKind::Broadcast => self.node == rank,
            GhostKind::Reduce => true,
        }
    }

    /// Whether `rank` writes received data into its lists in this round.
    pub fn is_recv_op(&self, rank: Rank) -> bool {
        match self.kind {
            GhostKind::Broadcast => self.node != rank,
            GhostKind::Reduce => self.node == rank,
        }
    }

    pub fn is_prefetchable(&self, rank: Rank) -> bool {
        self.prefetch && self.is_send_op(rank)
    }
}

/// Ordered communication plan, built once per topology and replayed by
/// [`crate::ghost::ghost_communicator`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GhostCommunicator {
    pub communications: Vec<GhostCommunication>,
}

impl GhostCommunicator {
    /// A schedule without steps.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.communications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.communications.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, GhostCommunication> {
        self.communications.iter()
    }
}
