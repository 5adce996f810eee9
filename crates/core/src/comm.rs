//! Cross-stage messaging: the closed protocol message set, the transport
//! seam, and the router that dispatches every exchange.
//!
//! All coordination is synchronous message exchange keyed to the current
//! step, forming a strict lock-step barrier: no stage begins step t+1 until
//! step t's required exchanges have completed everywhere. Because of that,
//! the next message a stage expects is always deterministic, so each stage
//! reads from a single ordered inbox and treats any other arrival as a
//! fatal protocol violation. There is no retry path; retrying would
//! desynchronize the barrier and corrupt cache state.
//!
//! Rather than branching on "which broadcast to call" by topology position,
//! every exchange is one of the named [`StageMessage`] variants, dispatched
//! through [`StageRouter`].

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

use candle_core::{DType, Tensor};
use thiserror::Error;

use crate::topology::{StageTopology, ANCHOR_STAGE};

/// Errors raised by the message layer. All are fatal mid-run.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A stage received a message variant it was not expecting.
    #[error("expected {expected} message, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    /// A message belonged to a different step than the one executing.
    #[error("message for step {got} arrived while executing step {expected}")]
    StepMismatch { expected: u64, got: u64 },

    /// An activation envelope had the wrong shape.
    #[error("activation shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// An activation envelope had the wrong dtype.
    #[error("activation dtype mismatch: expected {expected:?}, got {actual:?}")]
    DtypeMismatch { expected: DType, actual: DType },

    /// A peer stage went away mid-call.
    #[error("channel to stage {stage} closed")]
    ChannelClosed { stage: usize },
}

/// Expected shape and dtype of an incoming activation envelope.
///
/// Sized once per distinct `(batch_size, sequence_length)` and reused while
/// the shape is stable; every arrival is revalidated against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationShape {
    pub dims: Vec<usize>,
    pub dtype: DType,
}

impl ActivationShape {
    /// Shape of an inter-stage activation for `[batch, seq_len, hidden]`.
    pub fn new(batch_size: usize, seq_len: usize, hidden_size: usize) -> Self {
        Self {
            dims: vec![batch_size, seq_len, hidden_size],
            dtype: DType::F32,
        }
    }

    fn check(&self, tensor: &Tensor) -> Result<(), ProtocolError> {
        if tensor.dims() != self.dims.as_slice() {
            return Err(ProtocolError::ShapeMismatch {
                expected: self.dims.clone(),
                actual: tensor.dims().to_vec(),
            });
        }
        if tensor.dtype() != self.dtype {
            return Err(ProtocolError::DtypeMismatch {
                expected: self.dtype,
                actual: tensor.dtype(),
            });
        }
        Ok(())
    }
}

/// The closed set of protocol messages exchanged between stages.
///
/// Per-step messages carry a `step` tag; a tag that does not match the
/// receiver's current step is a fatal [`ProtocolError::StepMismatch`].
#[derive(Debug, Clone)]
pub enum StageMessage {
    /// Activation hand-off to the next stage.
    Activation { step: u64, hidden: Tensor },
    /// Activation plus the unioned exited-upstream bit (early-exit mode).
    ExitTaggedActivation {
        step: u64,
        hidden: Tensor,
        exited: bool,
    },
    /// Finalized tokens for one step, delivered to the anchor stage.
    ///
    /// `log_probs` holds the per-row log-probabilities gathered for the
    /// slice processed this step (may be empty when not requested).
    /// `exited` marks delivery from an early-exit rather than the last
    /// stage's regular sampling path.
    TokenAndLogProb {
        step: u64,
        tokens: Vec<u32>,
        log_probs: Vec<Vec<f32>>,
        exited: bool,
    },
    /// Per-step control bits broadcast to every stage.
    StepOutcome { step: u64, done: bool, exited: bool },
    /// Surviving beam rows (and the done bit) broadcast from the last stage.
    BeamChoice {
        step: u64,
        indices: Vec<u32>,
        done: bool,
    },
    /// Reordered beam token rows, last stage to anchor.
    BeamTokens { step: u64, rows: Vec<Vec<u32>> },
    /// End-of-call lengths and optional log-probabilities, last to anchor.
    Summary {
        lengths: Vec<u32>,
        log_probs: Option<Vec<Vec<f32>>>,
    },
    /// End-of-call beam results, last to anchor.
    BeamSummary {
        scores: Vec<f32>,
        sequences: Vec<Vec<u32>>,
    },
}

impl StageMessage {
    fn kind(&self) -> &'static str {
        match self {
            Self::Activation { .. } => "Activation",
            Self::ExitTaggedActivation { .. } => "ExitTaggedActivation",
            Self::TokenAndLogProb { .. } => "TokenAndLogProb",
            Self::StepOutcome { .. } => "StepOutcome",
            Self::BeamChoice { .. } => "BeamChoice",
            Self::BeamTokens { .. } => "BeamTokens",
            Self::Summary { .. } => "Summary",
            Self::BeamSummary { .. } => "BeamSummary",
        }
    }
}

/// Ordered point-to-point message exchange between stages.
///
/// Implementations must preserve per-channel ordering: a message for step t
/// must never overtake step t-1's message from the same sender.
pub trait StageTransport: Send {
    /// Send a message to the given stage. Blocking sends are allowed.
    fn send(&self, dst: usize, msg: StageMessage) -> Result<(), ProtocolError>;

    /// Block until the next message for this stage arrives.
    fn recv(&self) -> Result<StageMessage, ProtocolError>;
}

fn check_step(expected: u64, got: u64) -> Result<(), ProtocolError> {
    if expected != got {
        return Err(ProtocolError::StepMismatch { expected, got });
    }
    Ok(())
}

/// Dispatches every protocol exchange for one stage.
///
/// Point-to-point sends go to ring neighbours or the anchor; broadcasts are
/// fanned out as point-to-point sends from the source stage. All receive
/// paths validate message kind, step tag, and (for activations) shape.
pub struct StageRouter<T: StageTransport> {
    topology: StageTopology,
    transport: T,
}

impl<T: StageTransport> StageRouter<T> {
    pub fn new(topology: StageTopology, transport: T) -> Self {
        Self {
            topology,
            transport,
        }
    }

    pub fn topology(&self) -> &StageTopology {
        &self.topology
    }

    fn fan_out(&self, msg: StageMessage) -> Result<(), ProtocolError> {
        // anchor copy last: the anchor resumes the loop as soon as its copy
        // lands, and its next-step sends must queue behind this message in
        // every other inbox
        for dst in (0..self.topology.num_stages).rev() {
            if dst != self.topology.stage_id {
                self.transport.send(dst, msg.clone())?;
            }
        }
        Ok(())
    }

    // ── activation hand-offs ────────────────────────────────────────────

    pub fn send_activation_to_next(&self, step: u64, hidden: Tensor) -> Result<(), ProtocolError> {
        self.transport
            .send(self.topology.next_stage(), StageMessage::Activation { step, hidden })
    }

    pub fn recv_activation_from_prev(
        &self,
        step: u64,
        expected: &ActivationShape,
    ) -> Result<Tensor, ProtocolError> {
        match self.transport.recv()? {
            StageMessage::Activation { step: got, hidden } => {
                check_step(step, got)?;
                expected.check(&hidden)?;
                Ok(hidden)
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "Activation",
                got: other.kind(),
            }),
        }
    }

    pub fn send_exit_tagged_to_next(
        &self,
        step: u64,
        hidden: Tensor,
        exited: bool,
    ) -> Result<(), ProtocolError> {
        self.transport.send(
            self.topology.next_stage(),
            StageMessage::ExitTaggedActivation {
                step,
                hidden,
                exited,
            },
        )
    }

    pub fn recv_exit_tagged_from_prev(
        &self,
        step: u64,
        expected: &ActivationShape,
    ) -> Result<(Tensor, bool), ProtocolError> {
        match self.transport.recv()? {
            StageMessage::ExitTaggedActivation {
                step: got,
                hidden,
                exited,
            } => {
                check_step(step, got)?;
                expected.check(&hidden)?;
                Ok((hidden, exited))
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "ExitTaggedActivation",
                got: other.kind(),
            }),
        }
    }

    // ── token delivery to the anchor ────────────────────────────────────

    pub fn send_token_to_anchor(
        &self,
        step: u64,
        tokens: Vec<u32>,
        log_probs: Vec<Vec<f32>>,
        exited: bool,
    ) -> Result<(), ProtocolError> {
        self.transport.send(
            ANCHOR_STAGE,
            StageMessage::TokenAndLogProb {
                step,
                tokens,
                log_probs,
                exited,
            },
        )
    }

    /// The anchor receives exactly one token message per step, regardless
    /// of which stage finalized it.
    pub fn recv_token_at_anchor(
        &self,
        step: u64,
    ) -> Result<(Vec<u32>, Vec<Vec<f32>>, bool), ProtocolError> {
        match self.transport.recv()? {
            StageMessage::TokenAndLogProb {
                step: got,
                tokens,
                log_probs,
                exited,
            } => {
                check_step(step, got)?;
                Ok((tokens, log_probs, exited))
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "TokenAndLogProb",
                got: other.kind(),
            }),
        }
    }

    // ── per-step control broadcast ──────────────────────────────────────

    pub fn broadcast_outcome(&self, step: u64, done: bool, exited: bool) -> Result<(), ProtocolError> {
        self.fan_out(StageMessage::StepOutcome { step, done, exited })
    }

    pub fn recv_outcome(&self, step: u64) -> Result<(bool, bool), ProtocolError> {
        match self.transport.recv()? {
            StageMessage::StepOutcome {
                step: got,
                done,
                exited,
            } => {
                check_step(step, got)?;
                Ok((done, exited))
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "StepOutcome",
                got: other.kind(),
            }),
        }
    }

    // ── beam exchanges ──────────────────────────────────────────────────

    pub fn broadcast_beam_choice(
        &self,
        step: u64,
        indices: Vec<u32>,
        done: bool,
    ) -> Result<(), ProtocolError> {
        self.fan_out(StageMessage::BeamChoice {
            step,
            indices,
            done,
        })
    }

    pub fn recv_beam_choice(&self, step: u64) -> Result<(Vec<u32>, bool), ProtocolError> {
        match self.transport.recv()? {
            StageMessage::BeamChoice {
                step: got,
                indices,
                done,
            } => {
                check_step(step, got)?;
                Ok((indices, done))
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "BeamChoice",
                got: other.kind(),
            }),
        }
    }

    pub fn send_beam_tokens_to_anchor(
        &self,
        step: u64,
        rows: Vec<Vec<u32>>,
    ) -> Result<(), ProtocolError> {
        self.transport
            .send(ANCHOR_STAGE, StageMessage::BeamTokens { step, rows })
    }

    pub fn recv_beam_tokens_at_anchor(&self, step: u64) -> Result<Vec<Vec<u32>>, ProtocolError> {
        match self.transport.recv()? {
            StageMessage::BeamTokens { step: got, rows } => {
                check_step(step, got)?;
                Ok(rows)
            }
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "BeamTokens",
                got: other.kind(),
            }),
        }
    }

    // ── end-of-call results ─────────────────────────────────────────────

    pub fn send_summary_to_anchor(
        &self,
        lengths: Vec<u32>,
        log_probs: Option<Vec<Vec<f32>>>,
    ) -> Result<(), ProtocolError> {
        self.transport
            .send(ANCHOR_STAGE, StageMessage::Summary { lengths, log_probs })
    }

    pub fn recv_summary_at_anchor(&self) -> Result<(Vec<u32>, Option<Vec<Vec<f32>>>), ProtocolError> {
        match self.transport.recv()? {
            StageMessage::Summary { lengths, log_probs } => Ok((lengths, log_probs)),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "Summary",
                got: other.kind(),
            }),
        }
    }

    pub fn send_beam_summary_to_anchor(
        &self,
        scores: Vec<f32>,
        sequences: Vec<Vec<u32>>,
    ) -> Result<(), ProtocolError> {
        self.transport
            .send(ANCHOR_STAGE, StageMessage::BeamSummary { scores, sequences })
    }

    pub fn recv_beam_summary_at_anchor(&self) -> Result<(Vec<f32>, Vec<Vec<u32>>), ProtocolError> {
        match self.transport.recv()? {
            StageMessage::BeamSummary { scores, sequences } => Ok((scores, sequences)),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "BeamSummary",
                got: other.kind(),
            }),
        }
    }
}

/// In-process transport backed by channels, one inbox per stage.
///
/// Gives single-process simulation of a multi-stage topology: create one
/// ring, move each endpoint into its stage's thread. Channel FIFO order
/// provides the per-channel ordering the protocol requires.
pub struct LocalRing;

impl LocalRing {
    /// Create transport endpoints for `num_stages` stages.
    pub fn new(num_stages: usize) -> Vec<LocalStageTransport> {
        assert!(num_stages > 0, "num_stages must be > 0");
        let mut senders: Vec<Sender<StageMessage>> = Vec::with_capacity(num_stages);
        let mut inboxes: Vec<Receiver<StageMessage>> = Vec::with_capacity(num_stages);
        for _ in 0..num_stages {
            let (tx, rx) = channel();
            senders.push(tx);
            inboxes.push(rx);
        }
        inboxes
            .into_iter()
            .enumerate()
            .map(|(stage_id, inbox)| LocalStageTransport {
                stage_id,
                peers: senders.clone(),
                inbox: Mutex::new(inbox),
            })
            .collect()
    }
}

/// One stage's endpoint of a [`LocalRing`].
pub struct LocalStageTransport {
    stage_id: usize,
    peers: Vec<Sender<StageMessage>>,
    inbox: Mutex<Receiver<StageMessage>>,
}

impl StageTransport for LocalStageTransport {
    fn send(&self, dst: usize, msg: StageMessage) -> Result<(), ProtocolError> {
        debug_assert_ne!(dst, self.stage_id, "stage must not message itself");
        self.peers
            .get(dst)
            .ok_or(ProtocolError::ChannelClosed { stage: dst })?
            .send(msg)
            .map_err(|_| ProtocolError::ChannelClosed { stage: dst })
    }

    fn recv(&self) -> Result<StageMessage, ProtocolError> {
        let inbox = self
            .inbox
            .lock()
            .map_err(|_| ProtocolError::ChannelClosed {
                stage: self.stage_id,
            })?;
        inbox.recv().map_err(|_| ProtocolError::ChannelClosed {
            stage: self.stage_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn activation(step: u64, dims: &[usize]) -> StageMessage {
        StageMessage::Activation {
            step,
            hidden: Tensor::zeros(dims, DType::F32, &Device::Cpu).unwrap(),
        }
    }

    fn two_stage_routers() -> (StageRouter<LocalStageTransport>, StageRouter<LocalStageTransport>) {
        let mut ring = LocalRing::new(2);
        let t1 = ring.pop().unwrap();
        let t0 = ring.pop().unwrap();
        (
            StageRouter::new(StageTopology::new(0, 2, 4), t0),
            StageRouter::new(StageTopology::new(1, 2, 4), t1),
        )
    }

    #[test]
    fn activation_roundtrip_preserves_shape() {
        let (first, last) = two_stage_routers();
        let hidden = Tensor::ones(&[2, 3, 4], DType::F32, &Device::Cpu).unwrap();
        first.send_activation_to_next(5, hidden).unwrap();

        let expected = ActivationShape::new(2, 3, 4);
        let received = last.recv_activation_from_prev(5, &expected).unwrap();
        assert_eq!(received.dims(), &[2, 3, 4]);
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let (first, last) = two_stage_routers();
        let hidden = Tensor::ones(&[2, 3, 4], DType::F32, &Device::Cpu).unwrap();
        first.send_activation_to_next(0, hidden).unwrap();

        let expected = ActivationShape::new(2, 3, 8);
        let err = last.recv_activation_from_prev(0, &expected).unwrap_err();
        assert!(matches!(err, ProtocolError::ShapeMismatch { .. }));
    }

    #[test]
    fn wrong_step_is_fatal() {
        let (first, last) = two_stage_routers();
        let hidden = Tensor::ones(&[1, 1, 4], DType::F32, &Device::Cpu).unwrap();
        first.send_activation_to_next(3, hidden).unwrap();

        let expected = ActivationShape::new(1, 1, 4);
        let err = last.recv_activation_from_prev(4, &expected).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::StepMismatch {
                expected: 4,
                got: 3
            }
        ));
    }

    #[test]
    fn wrong_variant_is_fatal() {
        // anchor expects a token message but an activation arrives
        let mut ring = LocalRing::new(2);
        let t1 = ring.pop().unwrap();
        let t0 = ring.pop().unwrap();
        t1.send(0, activation(0, &[1, 1, 4])).unwrap();
        let anchor = StageRouter::new(StageTopology::new(0, 2, 4), t0);
        let err = anchor.recv_token_at_anchor(0).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage { .. }));
    }

    #[test]
    fn broadcast_reaches_every_other_stage() {
        let mut ring = LocalRing::new(3);
        let t2 = ring.pop().unwrap();
        let t1 = ring.pop().unwrap();
        let t0 = ring.pop().unwrap();
        let r0 = StageRouter::new(StageTopology::new(0, 3, 6), t0);
        let r1 = StageRouter::new(StageTopology::new(1, 3, 6), t1);
        let r2 = StageRouter::new(StageTopology::new(2, 3, 6), t2);

        r2.broadcast_beam_choice(7, vec![1, 0], false).unwrap();
        assert_eq!(r0.recv_beam_choice(7).unwrap(), (vec![1, 0], false));
        assert_eq!(r1.recv_beam_choice(7).unwrap(), (vec![1, 0], false));
    }

    #[test]
    fn summary_roundtrip() {
        let (first, last) = two_stage_routers();
        last.send_summary_to_anchor(vec![5, 7], Some(vec![vec![-0.1, -0.2]]))
            .unwrap();
        let (lengths, log_probs) = first.recv_summary_at_anchor().unwrap();
        assert_eq!(lengths, vec![5, 7]);
        assert_eq!(log_probs.unwrap()[0], vec![-0.1, -0.2]);
    }

    #[test]
    fn broadcast_enqueues_the_anchor_copy_last() {
        use std::sync::Arc;

        struct Recording(Arc<Mutex<Vec<usize>>>);

        impl StageTransport for Recording {
            fn send(&self, dst: usize, _msg: StageMessage) -> Result<(), ProtocolError> {
                self.0.lock().unwrap().push(dst);
                Ok(())
            }

            fn recv(&self) -> Result<StageMessage, ProtocolError> {
                Err(ProtocolError::ChannelClosed { stage: 0 })
            }
        }

        let sends = Arc::new(Mutex::new(Vec::new()));
        let last = StageRouter::new(StageTopology::new(3, 4, 8), Recording(sends.clone()));
        last.broadcast_outcome(2, false, false).unwrap();
        assert_eq!(*sends.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn dropped_peer_surfaces_as_channel_closed() {
        let mut ring = LocalRing::new(2);
        let t1 = ring.pop().unwrap();
        drop(ring); // stage 0 endpoint gone
        let err = t1.send(0, activation(0, &[1, 1, 1])).unwrap_err();
        assert!(matches!(err, ProtocolError::ChannelClosed { stage: 0 }));
    }
}
