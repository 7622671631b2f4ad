//! Links a local [`State`](crate::state::State) to its counterpart on the
//! peer, tracking the handshake the two sides run before updates flow.

use std::collections::HashSet;

use crate::error::{FailureReason, NetworkError, NetworkResult};

/// Wire identifier for a link, scoped to the connection it lives on.
pub type LinkId = u16;

/// Handle into a connection's `State` arena. Kept as a plain index rather
/// than a reference so links can be stored alongside the states they
/// refer to without running into borrow or ownership cycles.
pub type StateId = usize;

/// Which side originated the link and therefore owns the writable state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkDirection {
    /// This side owns the state and pushes updates out.
    Outgoing,
    /// This side mirrors a remote state and only applies updates in.
    Incoming,
}

/// Lifecycle of a link, mirroring the handshake exchanged over
/// `LINK_UP`/`LINK_DOWN`/`LINK_UPDATE`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkStatus {
    /// Not established; no updates are sent or accepted.
    Down,
    /// `LINK_UP` sent (or received), waiting for the peer to confirm.
    Listening,
    /// Handshake complete; updates flow.
    Up,
}

/// A link between a local state and its remote counterpart.
pub struct StateLink {
    link_id: LinkId,
    state_id: StateId,
    direction: LinkDirection,
    status: LinkStatus,
    dirty: HashSet<usize>,
}

impl StateLink {
    pub fn new(link_id: LinkId, state_id: StateId, direction: LinkDirection) -> StateLink {
        StateLink {
            link_id,
            state_id,
            direction,
            status: LinkStatus::Down,
            dirty: HashSet::new(),
        }
    }

    #[inline]
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    #[inline]
    pub fn state_id(&self) -> StateId {
        self.state_id
    }

    #[inline]
    pub fn direction(&self) -> LinkDirection {
        self.direction
    }

    #[inline]
    pub fn status(&self) -> LinkStatus {
        self.status
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.status == LinkStatus::Up
    }

    /// Moves a freshly created link into `Listening`, the state it sits
    /// in while waiting for the peer's acknowledgement.
    pub fn listen(&mut self) -> NetworkResult<()> {
        if self.status != LinkStatus::Down {
            return Err(NetworkError::Fatal(FailureReason::Generic));
        }
        self.status = LinkStatus::Listening;
        Ok(())
    }

    /// Completes the handshake; only valid from `Listening`.
    pub fn bring_up(&mut self) -> NetworkResult<()> {
        if self.status != LinkStatus::Listening {
            return Err(NetworkError::Fatal(FailureReason::Generic));
        }
        self.status = LinkStatus::Up;
        Ok(())
    }

    /// Tears the link down. Idempotent: tearing down an already-down link
    /// is a no-op rather than an error, since both a local close and a
    /// peer-initiated `LINK_DOWN` can race to call this.
    pub fn tear_down(&mut self) {
        self.status = LinkStatus::Down;
        self.dirty.clear();
    }

    /// Marks a value index dirty, to be included in the next
    /// `LINK_UPDATE` this link sends. No-op on an `Incoming` link, which
    /// never originates updates.
    pub fn mark_dirty(&mut self, value_index: usize) {
        if self.direction == LinkDirection::Outgoing {
            self.dirty.insert(value_index);
        }
    }

    /// Drains the set of value indices pending an outgoing update.
    pub fn drain_dirty(&mut self) -> Vec<usize> {
        self.dirty.drain().collect()
    }

    #[inline]
    pub fn has_pending_updates(&self) -> bool {
        !self.dirty.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_down_to_listening_to_up() {
        let mut link = StateLink::new(1, 0, LinkDirection::Outgoing);
        assert_eq!(link.status(), LinkStatus::Down);
        link.listen().unwrap();
        assert_eq!(link.status(), LinkStatus::Listening);
        link.bring_up().unwrap();
        assert_eq!(link.status(), LinkStatus::Up);
        assert!(link.is_up());
    }

    #[test]
    fn bring_up_without_listening_first_fails() {
        let mut link = StateLink::new(1, 0, LinkDirection::Outgoing);
        assert!(link.bring_up().is_err());
    }

    #[test]
    fn tear_down_is_idempotent() {
        let mut link = StateLink::new(1, 0, LinkDirection::Outgoing);
        link.tear_down();
        link.listen().unwrap();
        link.bring_up().unwrap();
        link.tear_down();
        link.tear_down();
        assert_eq!(link.status(), LinkStatus::Down);
    }

    #[test]
    fn incoming_link_ignores_mark_dirty() {
        let mut link = StateLink::new(1, 0, LinkDirection::Incoming);
        link.mark_dirty(3);
        assert!(!link.has_pending_updates());
    }

    #[test]
    fn outgoing_link_tracks_and_drains_dirty_indices() {
        let mut link = StateLink::new(1, 0, LinkDirection::Outgoing);
        link.mark_dirty(2);
        link.mark_dirty(5);
        link.mark_dirty(2);
        assert!(link.has_pending_updates());
        let mut drained = link.drain_dirty();
        drained.sort_unstable();
        assert_eq!(drained, vec![2, 5]);
        assert!(!link.has_pending_updates());
    }

    #[test]
    fn tear_down_clears_pending_dirty_indices() {
        let mut link = StateLink::new(1, 0, LinkDirection::Outgoing);
        link.mark_dirty(1);
        link.tear_down();
        assert!(!link.has_pending_updates());
    }
}
