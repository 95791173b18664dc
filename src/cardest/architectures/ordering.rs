//! Autoregressive variable orderings and the ensemble builder.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::cardest::data::{Column, ColumnRole};
use crate::cardest::error::{CardEstError, Result};
use crate::cardest::settings::{OrderKeyword, OrderSeed};

/// A permutation over training column indices together with its inverse.
///
/// In the natural form `perm[i]` is the column generated at position `i`
/// and `inverse[c]` is the rank of column `c`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ordering {
    perm: Vec<usize>,
    inverse: Vec<usize>,
}

impl Ordering {
    pub fn natural(n: usize) -> Self {
        Self {
            perm: (0..n).collect(),
            inverse: (0..n).collect(),
        }
    }

    /// Validate that `perm` is a bijection over `0..perm.len()`.
    pub fn from_order(perm: Vec<usize>) -> Result<Self> {
        let n = perm.len();
        let mut inverse = vec![usize::MAX; n];
        for (pos, &col) in perm.iter().enumerate() {
            if col >= n {
                return Err(CardEstError::MalformedOrdering(format!(
                    "index {col} out of range for {n} columns"
                )));
            }
            if inverse[col] != usize::MAX {
                return Err(CardEstError::MalformedOrdering(format!(
                    "index {col} appears more than once in {perm:?}"
                )));
            }
            inverse[col] = pos;
        }
        Ok(Self { perm, inverse })
    }

    pub fn len(&self) -> usize {
        self.perm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perm.is_empty()
    }

    /// Columns in generation order.
    pub fn column_order(&self) -> &[usize] {
        &self.perm
    }

    /// `ranks()[c]` is the position of column `c`.
    pub fn ranks(&self) -> &[usize] {
        &self.inverse
    }
}

/// Builds the ensemble of orderings a model is trained with.
#[derive(Debug, Clone)]
pub struct OrderingBuilder {
    roles: Vec<ColumnRole>,
    factor_groups: Vec<Vec<usize>>,
    content_only: bool,
    indicators_at_front: bool,
    fixed: Option<Ordering>,
}

impl OrderingBuilder {
    pub fn new(columns: &[Column]) -> Self {
        Self {
            roles: columns.iter().map(|c| c.role).collect(),
            factor_groups: Vec::new(),
            content_only: true,
            indicators_at_front: true,
            fixed: None,
        }
    }

    /// Sub-variable index groups (ascending) that must stay contiguous.
    pub fn with_factor_groups(mut self, groups: Vec<Vec<usize>>) -> Self {
        self.factor_groups = groups;
        self
    }

    pub fn content_only(mut self, enabled: bool) -> Self {
        self.content_only = enabled;
        self
    }

    pub fn indicators_at_front(mut self, enabled: bool) -> Self {
        self.indicators_at_front = enabled;
        self
    }

    /// Ordering returned when no ensemble is requested.
    pub fn with_fixed(mut self, fixed: Ordering) -> Self {
        self.fixed = Some(fixed);
        self
    }

    pub fn num_columns(&self) -> usize {
        self.roles.len()
    }

    /// Resolve the single fixed ordering from an explicit `order` and an
    /// optional `order_seed` post-processing step.
    pub fn fixed_ordering(
        &self,
        order: Option<&[usize]>,
        order_seed: Option<OrderSeed>,
    ) -> Result<Ordering> {
        let n = self.num_columns();
        let mut perm: Vec<usize> = match order {
            Some(o) => o.to_vec(),
            None => (0..n).collect(),
        };
        if perm.len() != n {
            return Err(CardEstError::MalformedOrdering(format!(
                "order has {} entries for {n} columns",
                perm.len()
            )));
        }
        match order_seed {
            Some(OrderSeed::Keyword(OrderKeyword::Reverse)) => perm.reverse(),
            Some(OrderSeed::Seed(seed)) => perm.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => {}
        }
        let perm = self.keep_factors_contiguous(perm);
        Ordering::from_order(perm)
    }

    /// Build `count` orderings. With `count <= 1` the fixed (or natural)
    /// ordering is returned unchanged.
    pub fn build(&self, count: usize) -> Result<Vec<Ordering>> {
        let n = self.num_columns();
        if count <= 1 {
            let single = self.fixed.clone().unwrap_or_else(|| Ordering::natural(n));
            if single.len() != n {
                return Err(CardEstError::MalformedOrdering(format!(
                    "fixed ordering covers {} of {n} columns",
                    single.len()
                )));
            }
            return Ok(vec![single]);
        }

        let mut orderings = Vec::with_capacity(count);
        for i in 0..count {
            let mut rng = StdRng::seed_from_u64(i as u64 + 1);
            let perm = if self.content_only {
                self.bracketed_permutation(&mut rng)
            } else {
                let mut all: Vec<usize> = (0..n).collect();
                all.shuffle(&mut rng);
                all
            };

            let distinct: BTreeSet<usize> = perm.iter().copied().collect();
            if distinct.len() != n || perm.len() != n {
                return Err(CardEstError::MalformedOrdering(format!(
                    "ordering {i} has {} distinct of {} entries for {n} columns",
                    distinct.len(),
                    perm.len()
                )));
            }

            let ordering = Ordering::from_order(self.keep_factors_contiguous(perm))?;
            debug!("Ordering {i}: {:?}", ordering.column_order());
            orderings.push(ordering);
        }
        Ok(orderings)
    }

    fn bracketed_permutation(&self, rng: &mut StdRng) -> Vec<usize> {
        let bracket = |role: ColumnRole| -> Vec<usize> {
            self.roles
                .iter()
                .enumerate()
                .filter(|&(_, &r)| r == role)
                .map(|(i, _)| i)
                .collect()
        };
        let mut content = bracket(ColumnRole::Content);
        let mut indicators = bracket(ColumnRole::Indicator);
        let mut fanouts = bracket(ColumnRole::Fanout);
        content.shuffle(rng);
        indicators.shuffle(rng);
        fanouts.shuffle(rng);

        let mut perm = Vec::with_capacity(self.roles.len());
        if self.indicators_at_front {
            perm.extend(indicators);
            perm.extend(content);
        } else {
            perm.extend(content);
            perm.extend(indicators);
        }
        perm.extend(fanouts);
        perm
    }

    /// Move every later sub-variable directly behind the first one of its
    /// group, in ascending sub-variable order.
    fn keep_factors_contiguous(&self, mut perm: Vec<usize>) -> Vec<usize> {
        for group in &self.factor_groups {
            let Some((&first, rest)) = group.split_first() else {
                continue;
            };
            for (j, &sub) in rest.iter().enumerate() {
                if let Some(at) = perm.iter().position(|&c| c == sub) {
                    perm.remove(at);
                }
                let base = perm.iter().position(|&c| c == first).unwrap_or(0);
                perm.insert(base + j + 1, sub);
            }
        }
        perm
    }
}
