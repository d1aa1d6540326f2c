//! Transfer lifecycle.
//!
//! Forward transitions follow the role's phase chain one step at a time;
//! `Failed` and `Canceled` are reachable from any non-terminal state.
//! Terminal states accept nothing.

use arbor_protocol::TransferState;

use crate::TransferError;

/// Which side of the transfer a state machine belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// The single legal forward successor of `state`, if any.
    pub fn successor(self, state: TransferState) -> Option<TransferState> {
        use TransferState::*;
        match (self, state) {
            (_, Initialized) => Some(Started),
            (Role::Sender, Started) => Some(Transferred),
            (Role::Sender, Transferred) => Some(Prepared),
            (Role::Receiver, Started) => Some(Prepared),
            (_, Prepared) => Some(Committed),
            _ => None,
        }
    }
}

/// Lifecycle of one transfer on one side.
#[derive(Debug, Clone)]
pub struct StateMachine {
    role: Role,
    state: TransferState,
}

impl StateMachine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: TransferState::Initialized,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Fails with `AlreadyFinished` once a terminal state is reached.
    pub fn ensure_active(&self) -> Result<(), TransferError> {
        if self.state.is_terminal() {
            return Err(TransferError::AlreadyFinished(format!(
                "transfer is {}",
                self.state
            )));
        }
        Ok(())
    }

    /// Moves to `next` if the transition is legal for this role.
    pub fn transition(&mut self, next: TransferState) -> Result<(), TransferError> {
        self.ensure_active()?;
        let legal = match next {
            TransferState::Failed | TransferState::Canceled => true,
            _ => self.role.successor(self.state) == Some(next),
        };
        if !legal {
            return Err(TransferError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Moves to `Failed`. Returns `false` if already terminal.
    pub fn fail(&mut self) -> bool {
        self.transition(TransferState::Failed).is_ok()
    }

    /// Moves to `Canceled`. Returns `false` if already terminal.
    pub fn cancel(&mut self) -> bool {
        self.transition(TransferState::Canceled).is_ok()
    }
}
