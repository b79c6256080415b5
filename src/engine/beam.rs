//! Diverse (grouped) beam search.
//!
//! Beams are partitioned into `num_groups` groups of `group_size`
//! beams. Groups expand sequentially within a step; each group's
//! logits are penalized by `diversity_penalty` for every token already
//! chosen by earlier groups in the same step (Hamming diversity).
//! Finished hypotheses are ranked by length-penalized score and
//! `stop_criteria` decides when a group stops extending beams.

use std::collections::{HashMap, HashSet};

use crate::config::{SamplingParams, StopCriteria};
use crate::core::sequence::{
    FinishReason, SequenceGroup, SequenceId, SequenceIdAllocator,
};
use crate::engine::sampler::{log_softmax, GroupSamplerOutput, LogitsRow, SequenceUpdate};
use crate::error::{Error, Result};

/// One group of beams plus its finished hypotheses.
#[derive(Debug, Default)]
struct BeamGroup {
    /// Running beam sequence ids.
    beams: Vec<SequenceId>,
    /// Length-penalized scores of finished hypotheses, best kept first.
    finished_scores: Vec<f32>,
    /// Whether the group stopped extending beams.
    done: bool,
}

impl BeamGroup {
    /// Keep only the `group_size` best hypothesis scores.
    fn prune_finished(&mut self, group_size: usize) {
        self.finished_scores
            .sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        self.finished_scores.truncate(group_size);
    }
}

/// Per-request state of a diverse beam search.
pub struct GroupBeamSearcher {
    params: SamplingParams,
    groups: Vec<BeamGroup>,
}

impl GroupBeamSearcher {
    /// Create the searcher for one request.
    pub fn new(params: SamplingParams) -> Self {
        Self {
            params,
            groups: Vec::new(),
        }
    }

    /// Expand every beam group by one token.
    ///
    /// # Errors
    ///
    /// Returns an error if a running beam has no logits row.
    pub fn step(
        &mut self,
        group: &SequenceGroup,
        rows: &HashMap<SequenceId, LogitsRow>,
        seq_ids: &SequenceIdAllocator,
        eos_token_id: Option<u32>,
    ) -> Result<GroupSamplerOutput> {
        let group_size = self.params.group_size;

        if self.groups.is_empty() {
            // Every group starts from the root trajectory; the claimed
            // set below turns the overlap into forks.
            let root = group
                .running_sequences()
                .next()
                .map(|seq| seq.seq_id())
                .ok_or(Error::RequestNotFound(group.request_id()))?;
            self.groups = (0..self.params.num_groups)
                .map(|_| BeamGroup {
                    beams: vec![root],
                    ..BeamGroup::default()
                })
                .collect();
        }

        let mut forks: Vec<SequenceUpdate> = Vec::new();
        let mut finishes: Vec<SequenceUpdate> = Vec::new();
        let mut appends: Vec<SequenceUpdate> = Vec::new();

        let mut old_beams: HashSet<SequenceId> = HashSet::new();
        let mut claimed: HashSet<SequenceId> = HashSet::new();
        let mut dropped: HashSet<SequenceId> = HashSet::new();
        let mut diversity_counts: HashMap<u32, usize> = HashMap::new();

        for beam_group in &mut self.groups {
            if beam_group.done {
                continue;
            }
            old_beams.extend(beam_group.beams.iter().copied());

            // Candidate expansion: per beam the 2 * group_size best
            // continuations, diversity-penalized against earlier groups.
            let mut candidates: Vec<(SequenceId, u32, f32, f32)> = Vec::new();
            for &beam_id in &beam_group.beams {
                let Some(seq) = group.sequence(beam_id).filter(|seq| !seq.is_finished()) else {
                    continue;
                };
                let row = rows.get(&beam_id).ok_or(Error::SequenceNotFound(beam_id))?;
                let mut log_probs = log_softmax(row);
                if self.params.diversity_penalty != 0.0 {
                    for (&token, &count) in &diversity_counts {
                        if let Some(lp) = log_probs.get_mut(token as usize) {
                            *lp -= self.params.diversity_penalty * count as f32;
                        }
                    }
                }

                let cum = seq.cumulative_log_prob();
                let mut order: Vec<usize> = (0..log_probs.len()).collect();
                order.sort_by(|&a, &b| {
                    log_probs[b]
                        .partial_cmp(&log_probs[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for &token in order.iter().take(2 * group_size) {
                    candidates.push((beam_id, token as u32, log_probs[token], cum));
                }
            }
            candidates.sort_by(|a, b| {
                (b.3 + b.2)
                    .partial_cmp(&(a.3 + a.2))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            // Selection: finished hypotheses do not consume beam slots.
            let mut selected: Vec<(SequenceId, u32, f32, f32)> = Vec::new();
            for (parent, token, log_prob, cum) in candidates {
                if selected.len() == group_size {
                    break;
                }
                let is_eos = !self.params.ignore_eos && Some(token) == eos_token_id;
                if is_eos {
                    let parent_seq = group
                        .sequence(parent)
                        .ok_or(Error::SequenceNotFound(parent))?;
                    let hyp_len = parent_seq.generated_len() + 1;
                    let score =
                        (cum + log_prob) / (hyp_len as f32).powf(self.params.length_penalty);
                    beam_group.finished_scores.push(score);

                    let child_seq_id = seq_ids.next();
                    forks.push(SequenceUpdate::Fork {
                        parent_seq_id: parent,
                        child_seq_id,
                        token_id: token,
                        log_prob,
                    });
                    finishes.push(SequenceUpdate::Finish {
                        seq_id: child_seq_id,
                        reason: FinishReason::EndOfSequence,
                    });
                } else {
                    selected.push((parent, token, log_prob, cum));
                }
            }

            // Reconciliation: the first continuation of a parent appends
            // in place, every further one forks. All forks are applied
            // before any append, so children copy pre-append state.
            let mut new_beams = Vec::with_capacity(selected.len());
            let mut best_running = f32::NEG_INFINITY;
            for (parent, token, log_prob, cum) in selected {
                best_running = best_running.max(cum + log_prob);
                *diversity_counts.entry(token).or_default() += 1;
                if claimed.insert(parent) {
                    appends.push(SequenceUpdate::Append {
                        seq_id: parent,
                        token_id: token,
                        log_prob,
                    });
                    new_beams.push(parent);
                } else {
                    let child_seq_id = seq_ids.next();
                    forks.push(SequenceUpdate::Fork {
                        parent_seq_id: parent,
                        child_seq_id,
                        token_id: token,
                        log_prob,
                    });
                    new_beams.push(child_seq_id);
                }
            }
            beam_group.beams = new_beams;

            // Stop criteria.
            beam_group.prune_finished(group_size);
            let enough_finished = beam_group.finished_scores.len() >= group_size;
            beam_group.done = match self.params.stop_criteria {
                StopCriteria::Early => enough_finished,
                StopCriteria::Heuristic => {
                    // A running beam can at best keep its current sum;
                    // compare against the worst kept hypothesis.
                    let cur_len = (group.context_len() + 1) as f32;
                    let best_possible =
                        best_running / cur_len.powf(self.params.length_penalty);
                    enough_finished
                        && beam_group
                            .finished_scores
                            .last()
                            .is_some_and(|&worst| worst >= best_possible)
                }
                StopCriteria::Never => false,
            };

            if beam_group.done {
                for &beam_id in &beam_group.beams {
                    if dropped.insert(beam_id) {
                        claimed.insert(beam_id);
                    }
                }
                beam_group.beams.clear();
            }
        }

        // Parents no earlier group continued are pruned.
        for beam_id in old_beams {
            if !claimed.contains(&beam_id) {
                dropped.insert(beam_id);
            }
        }

        let mut output = GroupSamplerOutput::default();
        output.updates.extend(forks);
        output.updates.extend(finishes);
        output.updates.extend(appends);
        output
            .updates
            .extend(dropped.into_iter().map(|seq_id| SequenceUpdate::Drop { seq_id }));
        Ok(output)
    }
}
