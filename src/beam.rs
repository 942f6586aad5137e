//! Synchronous beam search over a scoring closure.
//!
//! The caller supplies `score_fn`, which maps the currently decoded ids
//! `[batch · beam, cur_len]` to next-symbol logits `[batch · beam, vocab]`.
//! Decoding always runs for `decode_length` steps; the returned ids keep
//! the seed symbol at position 0.

use anyhow::Result;
use ndarray::{s, Array1, Array2, Array3};

use crate::activations::log_softmax_1d;

#[derive(Clone, Debug)]
struct BeamHypothesis {
    tokens: Vec<u32>,
    score: f32,
}

impl BeamHypothesis {
    /// Score normalized by the standard `((5 + len) / 6)^alpha` penalty.
    fn normalized_score(&self, alpha: f32) -> f32 {
        if alpha == 0.0 {
            return self.score;
        }
        let len = self.tokens.len().saturating_sub(1) as f32;
        self.score / ((5.0 + len) / 6.0).powf(alpha)
    }
}

/// Beam-search decode `decode_length` symbols per batch row.
///
/// Returns `[batch, beam_size, decode_length + 1]` ids sorted by
/// normalized score, best beam first; position 0 holds the seed id.
/// With `eos` set, a hypothesis that emits it stops growing (it is
/// padded with further `eos` symbols at no cost).
pub fn beam_search<F>(
    mut score_fn: F,
    initial_ids: &Array1<u32>,
    beam_size: usize,
    decode_length: usize,
    vocab_size: usize,
    alpha: f32,
    eos: Option<u32>,
) -> Result<Array3<u32>>
where
    F: FnMut(&Array2<u32>) -> Result<Array2<f32>>,
{
    let batch = initial_ids.len();
    assert!(beam_size >= 1, "beam_size must be at least 1");

    // Only beam 0 starts alive so the first expansion does not produce
    // duplicate hypotheses.
    let mut beams: Vec<Vec<BeamHypothesis>> = (0..batch)
        .map(|b| {
            (0..beam_size)
                .map(|i| BeamHypothesis {
                    tokens: vec![initial_ids[b]],
                    score: if i == 0 { 0.0 } else { f32::NEG_INFINITY },
                })
                .collect()
        })
        .collect();

    for step in 0..decode_length {
        let cur_len = step + 1;
        let mut ids = Array2::<u32>::zeros((batch * beam_size, cur_len));
        for b in 0..batch {
            for i in 0..beam_size {
                for (t, &tok) in beams[b][i].tokens.iter().enumerate() {
                    ids[[b * beam_size + i, t]] = tok;
                }
            }
        }

        let logits = score_fn(&ids)?;
        assert_eq!(
            logits.dim(),
            (batch * beam_size, vocab_size),
            "score_fn returned wrong logits shape"
        );

        for b in 0..batch {
            let mut candidates: Vec<BeamHypothesis> = Vec::with_capacity(beam_size * 2);
            for i in 0..beam_size {
                let beam = &beams[b][i];
                if beam.score == f32::NEG_INFINITY {
                    continue;
                }
                if let Some(eos_id) = eos {
                    if *beam.tokens.last().expect("beams are never empty") == eos_id
                        && beam.tokens.len() > 1
                    {
                        // Finished: pad with eos at no cost.
                        let mut tokens = beam.tokens.clone();
                        tokens.push(eos_id);
                        candidates.push(BeamHypothesis {
                            tokens,
                            score: beam.score,
                        });
                        continue;
                    }
                }

                let row = logits.row(b * beam_size + i).to_owned();
                let log_probs = log_softmax_1d(&row);
                let mut indexed: Vec<(usize, f32)> =
                    log_probs.iter().cloned().enumerate().collect();
                indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
                for &(token, lp) in indexed.iter().take(beam_size * 2) {
                    let mut tokens = beam.tokens.clone();
                    tokens.push(token as u32);
                    candidates.push(BeamHypothesis {
                        tokens,
                        score: beam.score + lp,
                    });
                }
            }

            candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
            candidates.truncate(beam_size);
            while candidates.len() < beam_size {
                let mut filler = candidates
                    .last()
                    .cloned()
                    .expect("at least one candidate survives");
                filler.score = f32::NEG_INFINITY;
                candidates.push(filler);
            }
            beams[b] = candidates;
        }
    }

    let mut out = Array3::<u32>::zeros((batch, beam_size, decode_length + 1));
    for b in 0..batch {
        beams[b].sort_by(|x, y| {
            y.normalized_score(alpha)
                .partial_cmp(&x.normalized_score(alpha))
                .unwrap()
        });
        for i in 0..beam_size {
            for (t, &tok) in beams[b][i].tokens.iter().enumerate() {
                out[[b, i, t]] = tok;
            }
        }
    }
    Ok(out)
}

/// Convenience wrapper returning only the best beam, seed stripped:
/// `[batch, decode_length]`.
pub fn beam_search_best<F>(
    score_fn: F,
    initial_ids: &Array1<u32>,
    beam_size: usize,
    decode_length: usize,
    vocab_size: usize,
    alpha: f32,
    eos: Option<u32>,
) -> Result<Array2<u32>>
where
    F: FnMut(&Array2<u32>) -> Result<Array2<f32>>,
{
    let ids = beam_search(
        score_fn,
        initial_ids,
        beam_size,
        decode_length,
        vocab_size,
        alpha,
        eos,
    )?;
    let batch = ids.shape()[0];
    let mut out = Array2::<u32>::zeros((batch, decode_length));
    out.assign(&ids.slice(s![.., 0, 1..]));
    Ok(out)
}
