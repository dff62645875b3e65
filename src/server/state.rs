//! State machine of a single server call.
//!
//! [`CallState`] is a plain value: it decides what happens with every part
//! crossing the call, while the resources of the call (handler task, request
//! channel, response writer, transport) are owned by the call driver which
//! acts on the returned [`Decision`].

use crate::{error::ProtocolViolation, parts::PartKind};

/// Lifecycle of the handler of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerPhase {
    /// Waiting for the request metadata, no handler runs yet.
    Idle,
    /// The handler task was spawned.
    Active,
    /// The call completed, its end was (or is being) sent.
    Completed,
}

/// Progress of the request stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundState {
    /// No request metadata received yet.
    AwaitingMetadata,
    /// Metadata received, request messages may follow.
    Receiving,
    /// The client closed the request stream.
    Closed,
}

/// Progress of the response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundState {
    /// Response headers were not sent yet.
    HeadersPending,
    /// Response headers were sent, messages may follow.
    Streaming,
    /// The end of the call was sent.
    Ended,
}

/// Direction of a part relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// A request part received from the client.
    Inbound,
    /// A response part sent to the client.
    Outbound,
}

/// What to do with a part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Process the part.
    Forward,
    /// The part violates the protocol, cancel the call.
    Cancel(ProtocolViolation),
    /// Silently drop the part, e.g. because the call already completed.
    Drop,
}

/// Outcome of [`CallState::on_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// The handler was active and its resources have to be released.
    pub release_handler: bool,
    /// No end was sent yet, one has to be synthesized.
    pub send_end: bool,
}

/// Composite state of a server call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallState {
    handler: HandlerPhase,
    inbound: InboundState,
    outbound: OutboundState,
}

impl Default for CallState {
    fn default() -> Self {
        Self::new()
    }
}

impl CallState {
    /// The state of a call that did not receive anything yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            handler: HandlerPhase::Idle,
            inbound: InboundState::AwaitingMetadata,
            outbound: OutboundState::HeadersPending,
        }
    }

    /// The lifecycle phase of the handler.
    #[must_use]
    pub const fn handler(&self) -> HandlerPhase {
        self.handler
    }

    /// The progress of the request stream.
    #[must_use]
    pub const fn inbound(&self) -> InboundState {
        self.inbound
    }

    /// The progress of the response stream.
    #[must_use]
    pub const fn outbound(&self) -> OutboundState {
        self.outbound
    }

    /// Returns `true` once the call completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.handler == HandlerPhase::Completed
    }

    /// Decide on a part received from the client.
    pub fn on_receive(&mut self, kind: PartKind) -> Decision {
        self.transition(Direction::Inbound, kind)
    }

    /// Decide on a part about to be sent to the client.
    pub fn on_send(&mut self, kind: PartKind) -> Decision {
        self.transition(Direction::Outbound, kind)
    }

    /// Record that the handler task was spawned.
    ///
    /// Returns `false` (and changes nothing) unless the handler was idle
    /// and the request metadata was received.
    pub fn on_handler_started(&mut self) -> bool {
        if self.handler == HandlerPhase::Idle && self.inbound != InboundState::AwaitingMetadata {
            self.handler = HandlerPhase::Active;
            true
        } else {
            false
        }
    }

    /// Move the call to [`HandlerPhase::Completed`], whatever its state.
    pub fn on_cancel(&mut self) -> CancelOutcome {
        let outcome = CancelOutcome {
            release_handler: self.handler == HandlerPhase::Active,
            send_end: self.outbound != OutboundState::Ended,
        };
        self.handler = HandlerPhase::Completed;
        self.inbound = InboundState::Closed;
        outcome
    }

    /// The transition function shared by both directions.
    pub fn transition(&mut self, direction: Direction, kind: PartKind) -> Decision {
        match direction {
            Direction::Inbound => self.transition_inbound(kind),
            Direction::Outbound => self.transition_outbound(kind),
        }
    }

    fn transition_inbound(&mut self, kind: PartKind) -> Decision {
        if self.handler == HandlerPhase::Completed {
            return Decision::Drop;
        }

        let (next, decision) = match (kind, self.inbound) {
            (PartKind::Metadata, InboundState::AwaitingMetadata) => {
                (InboundState::Receiving, Decision::Forward)
            }
            (PartKind::Metadata, state) => (state, violation("request metadata received twice")),
            (PartKind::Message, InboundState::AwaitingMetadata) => (
                InboundState::AwaitingMetadata,
                violation("request message received before metadata"),
            ),
            (PartKind::Message, InboundState::Closed) => (
                InboundState::Closed,
                violation("request message received after end of stream"),
            ),
            (PartKind::End, InboundState::AwaitingMetadata) => (
                InboundState::AwaitingMetadata,
                violation("end of stream received before metadata"),
            ),
            (PartKind::End, InboundState::Closed) => {
                (InboundState::Closed, violation("end of stream received twice"))
            }
            (PartKind::Message, InboundState::Receiving) => {
                (InboundState::Receiving, self.forward_if_active())
            }
            (PartKind::End, InboundState::Receiving) => {
                (InboundState::Closed, self.forward_if_active())
            }
        };

        self.inbound = next;
        decision
    }

    fn transition_outbound(&mut self, kind: PartKind) -> Decision {
        match (kind, self.outbound) {
            // the end is the only part which may still go out once the
            // call completed, as long as none was sent before
            (PartKind::End, OutboundState::HeadersPending | OutboundState::Streaming) => {
                self.outbound = OutboundState::Ended;
                self.handler = HandlerPhase::Completed;
                Decision::Forward
            }
            (_, OutboundState::Ended) => Decision::Drop,
            _ if self.handler != HandlerPhase::Active => Decision::Drop,
            (PartKind::Metadata, OutboundState::HeadersPending) => {
                self.outbound = OutboundState::Streaming;
                Decision::Forward
            }
            (PartKind::Metadata, OutboundState::Streaming) => Decision::Drop,
            (PartKind::Message, OutboundState::Streaming) => Decision::Forward,
            (PartKind::Message, OutboundState::HeadersPending) => {
                violation("response message sent before headers")
            }
        }
    }

    fn forward_if_active(&self) -> Decision {
        if self.handler == HandlerPhase::Active {
            Decision::Forward
        } else {
            Decision::Drop
        }
    }
}

fn violation(reason: &'static str) -> Decision {
    Decision::Cancel(ProtocolViolation::new(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn started() -> CallState {
        let mut state = CallState::new();
        assert_eq!(state.on_receive(PartKind::Metadata), Decision::Forward);
        assert!(state.on_handler_started());
        state
    }

    #[test]
    fn happy_path() {
        let mut state = started();
        assert_eq!(state.handler(), HandlerPhase::Active);

        assert_eq!(state.on_receive(PartKind::Message), Decision::Forward);
        assert_eq!(state.on_receive(PartKind::End), Decision::Forward);
        assert_eq!(state.inbound(), InboundState::Closed);

        assert_eq!(state.on_send(PartKind::Metadata), Decision::Forward);
        assert_eq!(state.on_send(PartKind::Message), Decision::Forward);
        assert_eq!(state.on_send(PartKind::Message), Decision::Forward);
        assert_eq!(state.on_send(PartKind::End), Decision::Forward);

        assert!(state.is_completed());
        assert_eq!(state.outbound(), OutboundState::Ended);
    }

    #[test]
    fn handler_starts_only_once() {
        let mut state = CallState::new();
        assert!(!state.on_handler_started());
        state.on_receive(PartKind::Metadata);
        assert!(state.on_handler_started());
        assert!(!state.on_handler_started());
    }

    #[test]
    fn inbound_violations() {
        let mut state = CallState::new();
        assert!(matches!(
            state.on_receive(PartKind::Message),
            Decision::Cancel(_)
        ));

        let mut state = CallState::new();
        assert!(matches!(state.on_receive(PartKind::End), Decision::Cancel(_)));

        let mut state = started();
        assert!(matches!(
            state.on_receive(PartKind::Metadata),
            Decision::Cancel(_)
        ));

        let mut state = started();
        state.on_receive(PartKind::End);
        assert!(matches!(
            state.on_receive(PartKind::Message),
            Decision::Cancel(_)
        ));
        assert!(matches!(state.on_receive(PartKind::End), Decision::Cancel(_)));
    }

    #[test]
    fn message_before_headers_is_a_violation() {
        let mut state = started();
        match state.on_send(PartKind::Message) {
            Decision::Cancel(violation) => {
                assert_eq!(violation.reason(), "response message sent before headers");
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn headers_only_once() {
        let mut state = started();
        assert_eq!(state.on_send(PartKind::Metadata), Decision::Forward);
        assert_eq!(state.on_send(PartKind::Metadata), Decision::Drop);
    }

    #[test]
    fn trailers_only_end() {
        let mut state = started();
        assert_eq!(state.on_send(PartKind::End), Decision::Forward);
        assert_eq!(state.on_send(PartKind::End), Decision::Drop);
    }

    #[test]
    fn everything_dropped_after_completion() {
        let mut state = started();
        state.on_send(PartKind::End);
        for kind in [PartKind::Metadata, PartKind::Message, PartKind::End] {
            assert_eq!(state.on_receive(kind), Decision::Drop);
            assert_eq!(state.on_send(kind), Decision::Drop);
        }
    }

    #[test]
    fn cancel_before_metadata_still_sends_end() {
        let mut state = CallState::new();
        let outcome = state.on_cancel();
        assert!(!outcome.release_handler);
        assert!(outcome.send_end);
        assert!(state.is_completed());

        assert_eq!(state.on_send(PartKind::Message), Decision::Drop);
        assert_eq!(state.on_send(PartKind::End), Decision::Forward);
        assert_eq!(state.on_send(PartKind::End), Decision::Drop);
    }

    #[test]
    fn cancel_after_end_sends_nothing() {
        let mut state = started();
        state.on_send(PartKind::End);
        let outcome = state.on_cancel();
        assert!(!outcome.release_handler);
        assert!(!outcome.send_end);
    }

    #[test]
    fn cancel_active_call() {
        let mut state = started();
        state.on_send(PartKind::Metadata);
        let outcome = state.on_cancel();
        assert!(outcome.release_handler);
        assert!(outcome.send_end);
        assert_eq!(state.on_receive(PartKind::Message), Decision::Drop);
    }

    #[derive(Debug, Clone, Copy)]
    enum Event {
        Receive(PartKind),
        Send(PartKind),
        Started,
        Cancel,
    }

    impl Arbitrary for Event {
        fn arbitrary(g: &mut Gen) -> Self {
            let kind = *g
                .choose(&[PartKind::Metadata, PartKind::Message, PartKind::End])
                .unwrap();
            match u8::arbitrary(g) % 4 {
                0 => Self::Receive(kind),
                1 => Self::Send(kind),
                2 => Self::Started,
                _ => Self::Cancel,
            }
        }
    }

    #[quickcheck]
    fn at_most_one_end_is_sent(events: Vec<Event>) -> bool {
        let mut state = CallState::new();
        let mut ends = 0;
        for event in events {
            match event {
                Event::Receive(kind) => {
                    if let Decision::Cancel(_) = state.on_receive(kind)
                        && state.on_cancel().send_end
                        && state.on_send(PartKind::End) == Decision::Forward
                    {
                        ends += 1;
                    }
                }
                Event::Send(kind) => {
                    if state.on_send(kind) == Decision::Forward && kind == PartKind::End {
                        ends += 1;
                    }
                }
                Event::Started => {
                    state.on_handler_started();
                }
                Event::Cancel => {
                    if state.on_cancel().send_end
                        && state.on_send(PartKind::End) == Decision::Forward
                    {
                        ends += 1;
                    }
                }
            }
        }
        ends <= 1
    }
}
