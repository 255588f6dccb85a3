//! Authoritative call state machine.
//!
//! The state gates which inputs a session accepts: utterances dispatch only
//! from `listening`, barge-in applies only during `speaking`, and nothing
//! leaves `ended`. Transitions are checked against an explicit allow-table;
//! invalid requests return a typed error instead of being silently ignored.

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// Where a call currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Created, media stream not yet started.
    Idle,
    /// Speaking the opening line.
    Greeting,
    /// Waiting for caller speech.
    Listening,
    /// A dialogue turn is in flight.
    Processing,
    /// Agent audio is playing out.
    Speaking,
    /// The booking tool is working.
    BookingAppointment,
    /// The customer directory is being queried.
    LookingUpCustomer,
    /// Handing the caller to a human; recognition no longer dispatches.
    Transferring,
    /// Answering-machine handling.
    Voicemail,
    /// Winding down; cleanup is running.
    Ending,
    /// Terminal. Nothing leaves this state.
    Ended,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        self == CallState::Ended
    }
}

/// All states, for table-driven tests and diagnostics.
pub const ALL_STATES: [CallState; 11] = [
    CallState::Idle,
    CallState::Greeting,
    CallState::Listening,
    CallState::Processing,
    CallState::Speaking,
    CallState::BookingAppointment,
    CallState::LookingUpCustomer,
    CallState::Transferring,
    CallState::Voicemail,
    CallState::Ending,
    CallState::Ended,
];

/// An applied transition, observable by the session and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub from: CallState,
    pub to: CallState,
}

/// Whether `from -> to` is a legal transition.
fn allowed(from: CallState, to: CallState) -> bool {
    use CallState::*;

    // Every live state can be forced into Ending by hangup or a terminal
    // tool action.
    if to == Ending && !matches!(from, Ending | Ended) {
        return true;
    }

    match from {
        Idle => matches!(to, Greeting),
        Greeting => matches!(to, Listening),
        Listening => matches!(
            to,
            Processing | BookingAppointment | LookingUpCustomer | Transferring | Voicemail
        ),
        Processing => matches!(
            to,
            Speaking
                | Listening
                | BookingAppointment
                | LookingUpCustomer
                | Transferring
                | Voicemail
        ),
        Speaking => matches!(
            to,
            Listening | BookingAppointment | LookingUpCustomer | Transferring | Voicemail
        ),
        BookingAppointment | LookingUpCustomer => matches!(to, Processing | Speaking | Listening),
        Transferring => false,
        Voicemail => matches!(to, Listening | Speaking),
        Ending => matches!(to, Ended),
        Ended => false,
    }
}

/// Tracks the current state and applies validated transitions.
#[derive(Debug)]
pub struct StateMachine {
    current: CallState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: CallState::Idle,
        }
    }

    pub fn current(&self) -> CallState {
        self.current
    }

    pub fn can_transition(&self, to: CallState) -> bool {
        allowed(self.current, to)
    }

    /// Apply a transition.
    ///
    /// Returns the observable change, or `None` for the idempotent repeat
    /// of entering `Ended`.
    ///
    /// # Errors
    ///
    /// Returns a state error when the allow-table rejects the transition.
    pub fn transition(&mut self, to: CallState) -> Result<Option<StateChange>> {
        if self.current == CallState::Ended && to == CallState::Ended {
            return Ok(None);
        }
        if !allowed(self.current, to) {
            return Err(AgentError::State(format!(
                "invalid transition {:?} -> {to:?}",
                self.current
            )));
        }
        let change = StateChange {
            from: self.current,
            to,
        };
        self.current = to;
        Ok(Some(change))
    }

    /// Force the machine into `Ending` from any live state.
    ///
    /// Returns `None` when already ending or ended, so repeated teardown
    /// signals never emit a second change.
    pub fn force_ending(&mut self) -> Option<StateChange> {
        if matches!(self.current, CallState::Ending | CallState::Ended) {
            return None;
        }
        let change = StateChange {
            from: self.current,
            to: CallState::Ending,
        };
        self.current = CallState::Ending;
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn normal_call_flow() {
        let mut machine = StateMachine::new();
        for to in [
            CallState::Greeting,
            CallState::Listening,
            CallState::Processing,
            CallState::Speaking,
            CallState::Listening,
            CallState::Ending,
            CallState::Ended,
        ] {
            let change = machine.transition(to).unwrap().unwrap();
            assert_eq!(change.to, to);
        }
        assert!(machine.current().is_terminal());
    }

    #[test]
    fn barge_in_returns_speaking_to_listening() {
        let mut machine = StateMachine::new();
        machine.transition(CallState::Greeting).unwrap();
        machine.transition(CallState::Listening).unwrap();
        machine.transition(CallState::Processing).unwrap();
        machine.transition(CallState::Speaking).unwrap();
        let change = machine.transition(CallState::Listening).unwrap().unwrap();
        assert_eq!(change.from, CallState::Speaking);
        assert_eq!(change.to, CallState::Listening);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut machine = StateMachine::new();
        assert!(machine.transition(CallState::Speaking).is_err());
        assert!(machine.transition(CallState::Listening).is_err());

        machine.transition(CallState::Greeting).unwrap();
        machine.transition(CallState::Listening).unwrap();
        // Listening never jumps straight to speaking.
        assert!(machine.transition(CallState::Speaking).is_err());
        assert_eq!(machine.current(), CallState::Listening);
    }

    #[test]
    fn entering_ended_is_idempotent() {
        let mut machine = StateMachine::new();
        machine.force_ending();
        assert_eq!(
            machine.transition(CallState::Ended).unwrap(),
            Some(StateChange {
                from: CallState::Ending,
                to: CallState::Ended
            })
        );
        assert_eq!(machine.transition(CallState::Ended).unwrap(), None);
    }

    #[test]
    fn nothing_leaves_ended() {
        let mut machine = StateMachine::new();
        machine.force_ending();
        machine.transition(CallState::Ended).unwrap();
        for to in ALL_STATES {
            if to != CallState::Ended {
                assert!(machine.transition(to).is_err(), "ended -> {to:?} accepted");
            }
        }
    }

    #[test]
    fn every_live_state_can_be_forced_to_ending() {
        for from in ALL_STATES {
            if matches!(from, CallState::Ending | CallState::Ended) {
                continue;
            }
            assert!(allowed(from, CallState::Ending), "{from:?} cannot end");
        }
    }

    #[test]
    fn force_ending_is_single_shot() {
        let mut machine = StateMachine::new();
        machine.transition(CallState::Greeting).unwrap();
        assert!(machine.force_ending().is_some());
        assert!(machine.force_ending().is_none());
        assert_eq!(machine.current(), CallState::Ending);
    }

    #[test]
    fn action_states_reachable_from_dialogue_states() {
        let action_states = [
            CallState::BookingAppointment,
            CallState::LookingUpCustomer,
            CallState::Transferring,
            CallState::Voicemail,
        ];
        for from in [
            CallState::Listening,
            CallState::Processing,
            CallState::Speaking,
        ] {
            for to in action_states {
                assert!(allowed(from, to), "{from:?} -> {to:?} rejected");
            }
        }
    }

    #[test]
    fn transferring_only_exits_to_ending() {
        for to in ALL_STATES {
            let legal = allowed(CallState::Transferring, to);
            assert_eq!(legal, to == CallState::Ending, "transferring -> {to:?}");
        }
    }

    #[test]
    fn ended_only_reachable_from_ending() {
        for from in ALL_STATES {
            let legal = allowed(from, CallState::Ended);
            assert_eq!(legal, from == CallState::Ending, "{from:?} -> ended");
        }
    }
}
