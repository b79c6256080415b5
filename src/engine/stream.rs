//! Streams bridging the step loop and output consumers.
//!
//! Each request owns a [`GenerationStream`]: a mutex-protected queue of
//! per-step frames pushed by the pipeline and drained by the handle
//! owner, who may block on [`GenerationHandle::read`] or poll with
//! [`GenerationHandle::can_read`]. Dropping the handle cooperatively
//! aborts the request at the next step.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::core::sequence::{FinishReason, RequestId, SequenceId};

/// One sequence's share of a step frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// Parent sequence id; set on the frame that announces a fork.
    pub parent_id: Option<SequenceId>,
    /// The token generated this step.
    pub token_id: u32,
    /// Cumulative log-probability of the sequence so far.
    pub cumulative_log_prob: f32,
    /// Set on the final frame of the sequence.
    pub finish_reason: Option<FinishReason>,
}

/// One step's worth of outputs, keyed by sequence id.
pub type GenerationOutputs = HashMap<SequenceId, GenerationOutput>;

/// Accumulated result of one trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// The trajectory.
    pub seq_id: SequenceId,
    /// Every generated token, in order.
    pub token_ids: Vec<u32>,
    /// Ranking score (length-penalized for beam search).
    pub score: f32,
    /// Why the trajectory ended.
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Default)]
struct StreamState {
    queue: VecDeque<GenerationOutputs>,
    finished: bool,
    dropped: bool,
    status: Option<FinishReason>,
}

/// Mutex-protected frame queue between pipeline and consumer.
#[derive(Debug, Default)]
pub struct GenerationStream {
    state: Mutex<StreamState>,
    cv: Condvar,
}

impl GenerationStream {
    /// Create a stream behind an [`Arc`] so producer and consumer share it.
    pub fn create() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push one step frame. No-op after the stream finished.
    pub(crate) fn push(&self, outputs: GenerationOutputs) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.finished {
            state.queue.push_back(outputs);
            self.cv.notify_all();
        }
    }

    /// Mark the stream finished and wake blocked readers.
    pub(crate) fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finished = true;
        self.cv.notify_all();
    }

    /// Finish with a request-level status (ignored, aborted, stopped).
    pub(crate) fn finish_with(&self, status: FinishReason) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finished = true;
        state.status = Some(status);
        self.cv.notify_all();
    }

    /// Request-level finish status, if any was recorded.
    pub fn finish_status(&self) -> Option<FinishReason> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.status
    }

    /// Whether the producer finished the stream.
    pub fn generation_finished(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.finished && state.queue.is_empty()
    }

    /// Whether a frame is ready without blocking.
    pub fn can_read(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        !state.queue.is_empty()
    }

    /// Pop the next frame, blocking until one arrives or the stream
    /// finishes. Returns `None` once the stream is drained and finished.
    pub fn read(&self) -> Option<GenerationOutputs> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(outputs) = state.queue.pop_front() {
                return Some(outputs);
            }
            if state.finished {
                return None;
            }
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Signal cooperative cancellation.
    pub(crate) fn mark_dropped(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.dropped = true;
    }

    /// Whether the consumer abandoned the stream.
    pub(crate) fn is_dropped(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.dropped
    }
}

/// Consumer-side handle of one request.
///
/// Dropping the handle signals the pipeline to abandon the request at
/// its next step; output already consumed stays valid.
#[derive(Debug)]
pub struct GenerationHandle {
    request_id: RequestId,
    stream: Arc<GenerationStream>,
}

impl GenerationHandle {
    /// Attach a handle to a stream.
    pub(crate) fn new(request_id: RequestId, stream: Arc<GenerationStream>) -> Self {
        Self { request_id, stream }
    }

    /// Request this handle belongs to.
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Whether generation finished and every frame was consumed.
    pub fn generation_finished(&self) -> bool {
        self.stream.generation_finished()
    }

    /// Whether a frame can be read without blocking.
    pub fn can_read(&self) -> bool {
        self.stream.can_read()
    }

    /// Request-level finish status (ignored, aborted, stopped), if any.
    pub fn finish_status(&self) -> Option<FinishReason> {
        self.stream.finish_status()
    }

    /// Read one step frame, blocking until available or finished.
    pub fn read(&self) -> Option<GenerationOutputs> {
        self.stream.read()
    }

    /// Drain the stream into per-trajectory results.
    ///
    /// Blocks until the producer finishes. A frame carrying a
    /// `parent_id` starts the child from the parent's already-streamed
    /// prefix, so every result holds its full token sequence.
    pub fn read_all(&self) -> Vec<GenerationResult> {
        let mut partial: HashMap<SequenceId, GenerationResult> = HashMap::new();
        let mut order: Vec<SequenceId> = Vec::new();

        while let Some(frame) = self.stream.read() {
            // Forked children first: their base is the parent's prefix
            // from previous frames, before this frame's parent token.
            for (&seq_id, output) in &frame {
                if partial.contains_key(&seq_id) {
                    continue;
                }
                let base = output
                    .parent_id
                    .and_then(|parent| partial.get(&parent))
                    .map(|parent| parent.token_ids.clone())
                    .unwrap_or_default();
                partial.insert(
                    seq_id,
                    GenerationResult {
                        seq_id,
                        token_ids: base,
                        score: 0.0,
                        finish_reason: None,
                    },
                );
                order.push(seq_id);
            }
            for (seq_id, output) in frame {
                if let Some(entry) = partial.get_mut(&seq_id) {
                    entry.token_ids.push(output.token_id);
                    entry.score = output.cumulative_log_prob;
                    entry.finish_reason = output.finish_reason;
                }
            }
        }

        order
            .into_iter()
            .filter_map(|seq_id| partial.remove(&seq_id))
            .collect()
    }
}

impl Drop for GenerationHandle {
    fn drop(&mut self) {
        self.stream.mark_dropped();
    }
}

/// Callback capability for streaming tokens during a blocking generate.
///
/// Used single-threaded on the step thread; no async machinery needed.
pub trait Streamer {
    /// Receive one token. Return `false` to stop generation.
    fn put(&mut self, token_id: u32) -> bool;

    /// Generation ended; flush any buffered state.
    fn end(&mut self);
}
