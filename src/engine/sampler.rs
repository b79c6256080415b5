//! Token sampling strategies.
//!
//! Turns logits rows into next-token choices per sampling policy:
//!
//! - **Beam search** whenever `num_groups * group_size > 1`, delegated
//!   to the [`GroupBeamSearcher`](super::beam::GroupBeamSearcher)
//! - **Greedy** (argmax, ties to the lowest token id) at zero
//!   temperature
//! - **Multinomial** otherwise, with repetition penalty, no-repeat
//!   n-gram masking, temperature scaling, top-k and top-p filtering
//!
//! ## Sampling Pipeline (multinomial)
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ Repetition penalty / n-gram mask
//!     ▼ Temperature scaling
//!     ▼ Top-k filtering (optional)
//!     ▼ Softmax (f32, max-subtracted)
//!     ▼ Top-p filtering (optional)
//!     ▼ Renormalize + Sample
//! Selected token
//! ```

use std::collections::{HashMap, HashSet};

use rand::distributions::Distribution;
use rand::SeedableRng;

use crate::core::sequence::{
    FinishReason, RequestId, SequenceGroup, SequenceId, SequenceIdAllocator,
};
use crate::engine::beam::GroupBeamSearcher;
use crate::error::{Error, Result};

/// One logits row in `f32`.
pub type LogitsRow = Vec<f32>;

/// A mutation of a sequence group decided by the sampler.
///
/// The pipeline applies updates in order; forks always precede the
/// parent's own append so children copy the pre-append state.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceUpdate {
    /// Append one generated token to an existing sequence.
    Append {
        seq_id: SequenceId,
        token_id: u32,
        log_prob: f32,
    },
    /// Fork `parent_seq_id` into `child_seq_id` and append a token to
    /// the child.
    Fork {
        parent_seq_id: SequenceId,
        child_seq_id: SequenceId,
        token_id: u32,
        log_prob: f32,
    },
    /// Remove a pruned trajectory.
    Drop { seq_id: SequenceId },
    /// Finish a trajectory.
    Finish {
        seq_id: SequenceId,
        reason: FinishReason,
    },
}

/// Sampler verdict for one group in one step.
#[derive(Debug, Default)]
pub struct GroupSamplerOutput {
    /// Updates to apply, in order.
    pub updates: Vec<SequenceUpdate>,
}

/// Token sampler dispatching on the group's sampling policy.
pub struct Sampler {
    /// Random number generator for multinomial draws.
    rng: rand::rngs::StdRng,
    /// Per-request beam search state.
    beams: HashMap<RequestId, GroupBeamSearcher>,
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler {
    /// Create a sampler seeded from entropy.
    pub fn new() -> Self {
        Self {
            rng: rand::rngs::StdRng::from_entropy(),
            beams: HashMap::new(),
        }
    }

    /// Create a sampler with a fixed seed for reproducibility.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: rand::rngs::StdRng::seed_from_u64(seed),
            beams: HashMap::new(),
        }
    }

    /// Sample the next tokens for one group.
    ///
    /// `rows` maps every running sequence to its next-token logits row.
    /// Fork updates mint child ids from `seq_ids`.
    ///
    /// # Errors
    ///
    /// Returns an error if a running sequence has no logits row.
    pub fn sample_group(
        &mut self,
        group: &SequenceGroup,
        rows: &HashMap<SequenceId, LogitsRow>,
        seq_ids: &SequenceIdAllocator,
        eos_token_id: Option<u32>,
    ) -> Result<GroupSamplerOutput> {
        let params = group.sampling_params();

        if params.is_beam_search() {
            let searcher = self
                .beams
                .entry(group.request_id())
                .or_insert_with(|| GroupBeamSearcher::new(params.clone()));
            return searcher.step(group, rows, seq_ids, eos_token_id);
        }

        let mut output = GroupSamplerOutput::default();

        // Parallel sampling forks the root into `n` trajectories at the
        // first decode step; every fork shares the prompt blocks.
        let running: Vec<&_> = group.running_sequences().collect();
        let want = params.num_live_sequences();
        if params.is_multinomial() && running.len() == 1 && running[0].generated_len() == 0 {
            let root = running[0];
            let row = rows
                .get(&root.seq_id())
                .ok_or(Error::SequenceNotFound(root.seq_id()))?;

            let mut targets = vec![(root.seq_id(), None)];
            for _ in 1..want {
                targets.push((root.seq_id(), Some(seq_ids.next())));
            }
            // Forks first so children copy the pre-append state.
            targets.sort_by_key(|(_, child)| child.is_none());
            for (parent, child) in targets {
                let (token_id, log_prob) = self.sample_row(group, root, row)?;
                match child {
                    Some(child_seq_id) => output.updates.push(SequenceUpdate::Fork {
                        parent_seq_id: parent,
                        child_seq_id,
                        token_id,
                        log_prob,
                    }),
                    None => output.updates.push(SequenceUpdate::Append {
                        seq_id: parent,
                        token_id,
                        log_prob,
                    }),
                }
            }
            return Ok(output);
        }

        for seq in running {
            let row = rows
                .get(&seq.seq_id())
                .ok_or(Error::SequenceNotFound(seq.seq_id()))?;
            let (token_id, log_prob) = self.sample_row(group, seq, row)?;
            output.updates.push(SequenceUpdate::Append {
                seq_id: seq.seq_id(),
                token_id,
                log_prob,
            });
        }
        Ok(output)
    }

    /// Validate speculative candidate tokens greedily.
    ///
    /// `rows` holds one logits row per unprocessed token of a sequence;
    /// `candidates` are the tokens following the first unprocessed one.
    /// Returns the number of accepted candidates and the token (with
    /// log-prob) sampled after the last accepted position.
    pub fn validate_greedy(
        &self,
        rows: &[LogitsRow],
        candidates: &[u32],
    ) -> (usize, u32, f32) {
        let mut accepted = 0;
        for (row, &candidate) in rows.iter().zip(candidates) {
            let (token, _) = greedy_pick(row);
            if token != candidate {
                break;
            }
            accepted += 1;
        }
        // The row after the last accepted candidate decides the next
        // verified token.
        let row = &rows[accepted.min(rows.len() - 1)];
        let (token, log_prob) = greedy_pick(row);
        (accepted, token, log_prob)
    }

    /// Forget per-request sampler state once a request retires.
    pub fn drop_request(&mut self, request_id: RequestId) {
        self.beams.remove(&request_id);
    }

    /// Sample one token from a row according to the group's params.
    fn sample_row(
        &mut self,
        group: &SequenceGroup,
        seq: &crate::core::sequence::Sequence,
        row: &LogitsRow,
    ) -> Result<(u32, f32)> {
        let params = group.sampling_params();

        if params.is_greedy() {
            return Ok(greedy_pick(row));
        }

        let mut logits = row.clone();

        if params.repetition_penalty != 1.0 {
            let mut seen: HashSet<u32> = seq.generated_ids().iter().copied().collect();
            seen.extend(group.prompt_ids().iter().copied());
            apply_repetition_penalty(&mut logits, &seen, params.repetition_penalty);
        }

        if params.no_repeat_ngram_size > 0 {
            let history = group.full_token_ids(seq);
            for token in banned_ngram_tokens(&history, params.no_repeat_ngram_size) {
                logits[token as usize] = f32::NEG_INFINITY;
            }
        }

        for logit in logits.iter_mut() {
            *logit /= params.temperature;
        }

        // Top-k keeps the k highest logits.
        let mut kept: Vec<usize> = (0..logits.len()).collect();
        if params.top_k > 0 && params.top_k < logits.len() {
            kept.sort_by(|&a, &b| {
                logits[b]
                    .partial_cmp(&logits[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            kept.truncate(params.top_k);
        }

        let kept_logits: Vec<f32> = kept.iter().map(|&idx| logits[idx]).collect();
        let mut probs = softmax(&kept_logits);

        // Top-p keeps the smallest prefix of the sorted distribution
        // whose mass reaches `top_p`.
        if params.top_p < 1.0 {
            let mut order: Vec<usize> = (0..probs.len()).collect();
            order.sort_by(|&a, &b| {
                probs[b]
                    .partial_cmp(&probs[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let mut cumulative = 0.0f32;
            let mut cutoff = order.len();
            for (rank, &idx) in order.iter().enumerate() {
                cumulative += probs[idx];
                if cumulative >= params.top_p {
                    cutoff = rank + 1;
                    break;
                }
            }
            order.truncate(cutoff);
            kept = order.iter().map(|&idx| kept[idx]).collect();
            probs = order.iter().map(|&idx| probs[idx]).collect();
        }

        // Renormalize and draw.
        let sum: f32 = probs.iter().sum();
        let weights: Vec<f64> = probs.iter().map(|&p| (p / sum) as f64).collect();
        let dist = rand::distributions::WeightedIndex::new(&weights)
            .map_err(|e| Error::InvalidConfig(format!("degenerate distribution: {e}")))?;
        let choice = dist.sample(&mut self.rng);

        let token_id = kept[choice] as u32;
        let log_prob = log_softmax(&logits)[token_id as usize];
        Ok((token_id, log_prob))
    }
}

/// Argmax with ties resolved to the lowest token id.
pub fn greedy_pick(row: &LogitsRow) -> (u32, f32) {
    let mut best = 0usize;
    for (idx, &logit) in row.iter().enumerate() {
        if logit > row[best] {
            best = idx;
        }
    }
    (best as u32, log_softmax(row)[best])
}

/// Softmax in `f32`, numerically stabilized by max subtraction.
pub fn softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = row.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

/// Log-softmax in `f32`, numerically stabilized by max subtraction.
pub fn log_softmax(row: &[f32]) -> Vec<f32> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum: f32 = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
    row.iter().map(|&v| v - max - log_sum).collect()
}

/// Penalize tokens that already occurred: positive logits divide by the
/// penalty, negative ones multiply.
fn apply_repetition_penalty(logits: &mut [f32], seen: &HashSet<u32>, penalty: f32) {
    for &token in seen {
        if let Some(logit) = logits.get_mut(token as usize) {
            if *logit > 0.0 {
                *logit /= penalty;
            } else {
                *logit *= penalty;
            }
        }
    }
}

/// Tokens that would complete an n-gram already present in `history`.
fn banned_ngram_tokens(history: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || history.len() + 1 < n {
        return Vec::new();
    }
    let prefix = &history[history.len() + 1 - n..];
    let mut banned = Vec::new();
    for window in history.windows(n) {
        if &window[..n - 1] == prefix {
            banned.push(window[n - 1]);
        }
    }
    banned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_tie_breaks_to_lowest_id() {
        let row = vec![0.0, 3.0, 3.0, 1.0];
        let (token, _) = greedy_pick(&row);
        assert_eq!(token, 1);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_banned_ngram_tokens() {
        // History ends with [1, 2]; the bigram-completing token after
        // any earlier [1, 2] is banned for n = 3.
        let history = vec![1, 2, 9, 5, 1, 2];
        assert_eq!(banned_ngram_tokens(&history, 3), vec![9]);
        assert!(banned_ngram_tokens(&history, 0).is_empty());
        assert!(banned_ngram_tokens(&[1], 3).is_empty());
    }

    #[test]
    fn test_validate_greedy_accepts_matching_prefix() {
        let sampler = Sampler::with_seed(0);
        // Rows peak at 5, 6, 7; candidates claim 5, 6, 9.
        let mut rows = Vec::new();
        for peak in [5usize, 6, 7] {
            let mut row = vec![0.0f32; 10];
            row[peak] = 10.0;
            rows.push(row);
        }
        let (accepted, next, _) = sampler.validate_greedy(&rows, &[5, 6, 9]);
        assert_eq!(accepted, 2);
        assert_eq!(next, 7);
    }
}
