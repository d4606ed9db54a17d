//! Score functions over embedding matrices
//!
//! Rows are items, columns are embedding dimensions. `score(q, c)` returns a
//! `(q.nrows(), c.nrows())` matrix.

use crate::SearchError;
use ndarray::{Array2, ArrayView2, Axis};
use std::fmt;
use std::str::FromStr;

/// Value written in place of NaN scores. Strictly below any finite similarity.
pub const NAN_SCORE: f32 = f32::MIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreFunction {
    CosSim,
    Dot,
}

impl ScoreFunction {
    pub fn description(&self) -> &'static str {
        match self {
            ScoreFunction::CosSim => "Cosine Similarity",
            ScoreFunction::Dot => "Dot Product",
        }
    }

    pub fn score(&self, queries: ArrayView2<f32>, corpus: ArrayView2<f32>) -> Array2<f32> {
        match self {
            ScoreFunction::CosSim => cos_sim(queries, corpus),
            ScoreFunction::Dot => dot_score(queries, corpus),
        }
    }
}

impl FromStr for ScoreFunction {
    type Err = SearchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cos_sim" => Ok(Self::CosSim),
            "dot" => Ok(Self::Dot),
            _ => Err(SearchError::UnknownScoreFunction(s.to_string())),
        }
    }
}

impl fmt::Display for ScoreFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScoreFunction::CosSim => write!(f, "cos_sim"),
            ScoreFunction::Dot => write!(f, "dot"),
        }
    }
}

pub fn dot_score(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Array2<f32> {
    a.dot(&b.t())
}

/// No epsilon in the norm: a zero row yields NaN scores, which callers replace with
/// [`NAN_SCORE`].
pub fn cos_sim(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Array2<f32> {
    let a = normalize_rows(a);
    let b = normalize_rows(b);
    a.dot(&b.t())
}

fn normalize_rows(m: ArrayView2<f32>) -> Array2<f32> {
    let norms = m.map_axis(Axis(1), |row| row.dot(&row).sqrt());
    &m / &norms.insert_axis(Axis(1))
}

/// Returns the number of replaced entries
pub fn replace_nan(scores: &mut Array2<f32>) -> usize {
    let mut replaced = 0;
    scores.mapv_inplace(|v| {
        if v.is_nan() {
            replaced += 1;
            NAN_SCORE
        } else {
            v
        }
    });
    replaced
}
