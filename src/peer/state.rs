//! Choke and interest state, one small machine per direction.
//!
//! Transition methods return whether the state actually changed, which the
//! senders use to stay idempotent: a transition that is already in effect
//! produces no wire traffic.

/// Whether requests are being served in one direction of a connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum ChokeState {
    #[default]
    Choked,
    Unchoked,
}

impl ChokeState {
    pub fn choke(&mut self) -> bool {
        let changed = *self == ChokeState::Unchoked;
        *self = ChokeState::Choked;
        changed
    }

    pub fn unchoke(&mut self) -> bool {
        let changed = *self == ChokeState::Choked;
        *self = ChokeState::Unchoked;
        changed
    }

    pub fn is_choked(&self) -> bool {
        *self == ChokeState::Choked
    }
}

/// Whether one side wants pieces the other side has.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum InterestState {
    #[default]
    NotInterested,
    Interested,
}

impl InterestState {
    pub fn set_interested(&mut self) -> bool {
        let changed = *self == InterestState::NotInterested;
        *self = InterestState::Interested;
        changed
    }

    pub fn clear_interested(&mut self) -> bool {
        let changed = *self == InterestState::Interested;
        *self = InterestState::NotInterested;
        changed
    }

    pub fn is_interested(&self) -> bool {
        *self == InterestState::Interested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_idempotent() {
        let mut choke = ChokeState::default();
        assert!(choke.is_choked());
        assert!(!choke.choke());
        assert!(choke.unchoke());
        assert!(!choke.unchoke());
        assert!(choke.choke());

        let mut interest = InterestState::default();
        assert!(!interest.is_interested());
        assert!(!interest.clear_interested());
        assert!(interest.set_interested());
        assert!(!interest.set_interested());
        assert!(interest.clear_interested());
    }
}
