//! Greedy nearest-neighbour matching on a scalar distance.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use tracing::{debug, info, warn};

use crate::config::{Estimand, MatchOrder};
use crate::error::{CausalError, Result};

/// Seed for random ordering when none is configured.
pub const DEFAULT_SEED: u64 = 42;

/// Settings for [`nearest_neighbors`].
#[derive(Debug, Clone, Copy)]
pub struct NearestOptions {
    pub estimand: Estimand,
    pub ratio: usize,
    pub replace: bool,
    /// Maximum absolute distance between matched units
    pub caliper: Option<f64>,
    pub order: MatchOrder,
    pub seed: Option<u64>,
}

/// Order in which focal units choose their matches.
fn focal_order(distance: &[f64], focal: &[usize], order: MatchOrder, seed: Option<u64>) -> Vec<usize> {
    let mut units = focal.to_vec();
    let by_distance = |a: &usize, b: &usize| {
        distance[*a]
            .partial_cmp(&distance[*b])
            .unwrap_or(Ordering::Equal)
    };
    match order {
        MatchOrder::Largest => units.sort_by(|a, b| by_distance(b, a).then(a.cmp(b))),
        MatchOrder::Smallest => units.sort_by(|a, b| by_distance(a, b).then(a.cmp(b))),
        MatchOrder::Random => {
            let mut rng = StdRng::seed_from_u64(seed.unwrap_or(DEFAULT_SEED));
            units.shuffle(&mut rng);
        }
        MatchOrder::Data => units.sort_unstable(),
    }
    units
}

/// Match focal units to their nearest non-focal neighbours.
///
/// Focal units are treated units for ATT and controls for ATC. Matching
/// proceeds in rounds: every focal unit gets its first match before any
/// gets a second, and a focal unit left without a match in one round is
/// skipped in later rounds. Ties go to the lowest unit index.
///
/// Returns `(focal, matched)` unit pairs.
pub fn nearest_neighbors(
    distance: &[f64],
    treated: &[bool],
    eligible: &[bool],
    options: &NearestOptions,
) -> Result<Vec<(usize, usize)>> {
    let focal_is_treated = match options.estimand {
        Estimand::Att => true,
        Estimand::Atc => false,
        Estimand::Ate => {
            return Err(CausalError::InvalidConfig(
                "nearest-neighbour matching supports ATT and ATC only".to_string(),
            ));
        }
    };
    if options.ratio == 0 {
        return Err(CausalError::InvalidConfig("ratio must be at least 1".to_string()));
    }

    let focal: Vec<usize> = (0..distance.len())
        .filter(|&i| eligible[i] && treated[i] == focal_is_treated)
        .collect();
    let pool: Vec<usize> = (0..distance.len())
        .filter(|&i| eligible[i] && treated[i] != focal_is_treated)
        .collect();

    if focal.is_empty() || pool.is_empty() {
        return Err(CausalError::InsufficientData(format!(
            "{} focal and {} candidate units available for matching",
            focal.len(),
            pool.len()
        )));
    }
    if !options.replace && pool.len() < focal.len() {
        warn!(
            "Fewer candidate units ({}) than focal units ({}); some focal units will not be matched",
            pool.len(),
            focal.len()
        );
    }

    let order = focal_order(distance, &focal, options.order, options.seed);
    let mut available = vec![true; distance.len()];
    let mut matches: Vec<Vec<usize>> = vec![Vec::new(); distance.len()];

    for round in 0..options.ratio {
        let mut matched_this_round = 0usize;
        for &f in &order {
            if matches[f].len() < round {
                continue;
            }

            let mut best: Option<(usize, f64)> = None;
            for &c in &pool {
                if !available[c] || matches[f].contains(&c) {
                    continue;
                }
                let gap = (distance[f] - distance[c]).abs();
                if options.caliper.is_some_and(|cal| gap > cal) {
                    continue;
                }
                // Pool is in index order, so strict comparison keeps the
                // lowest index among ties.
                if best.is_none_or(|(_, g)| gap < g) {
                    best = Some((c, gap));
                }
            }

            if let Some((c, _)) = best {
                matches[f].push(c);
                if !options.replace {
                    available[c] = false;
                }
                matched_this_round += 1;
            }
        }
        debug!("Matching round {}: {} focal units matched", round + 1, matched_this_round);
    }

    let unmatched = focal.iter().filter(|&&f| matches[f].is_empty()).count();
    if unmatched > 0 {
        warn!("{} focal units found no admissible match", unmatched);
    }

    let pairs: Vec<(usize, usize)> = focal
        .iter()
        .flat_map(|&f| matches[f].iter().map(move |&c| (f, c)))
        .collect();
    info!(
        "Nearest-neighbour matching: {} pairs for {} of {} focal units",
        pairs.len(),
        focal.len() - unmatched,
        focal.len()
    );
    Ok(pairs)
}

/// One subclass per focal unit that found a match, numbered in unit order.
pub fn pair_subclasses(n: usize, pairs: &[(usize, usize)]) -> Vec<Option<usize>> {
    let mut subclass = vec![None; n];
    let mut next = 0;
    for (focal, other) in pairs {
        let id = match subclass[*focal] {
            Some(id) => id,
            None => {
                let id = next;
                next += 1;
                subclass[*focal] = Some(id);
                id
            }
        };
        subclass[*other] = Some(id);
    }
    subclass
}
