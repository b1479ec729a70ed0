//! Optimal full matching.
//!
//! A full matching partitions units into subclasses that each contain one
//! treated unit and at least one control, or one control and at least one
//! treated unit, minimizing the total treated–control distance inside
//! subclasses. Such a partition is a minimum-weight edge cover of the
//! bipartite distance graph whose components are stars.
//!
//! The cover is found exactly: with `μ(v)` the cheapest edge at `v`, a
//! maximum-weight matching under weights `μ(t) + μ(c) - d(t, c)` plus the
//! cheapest edge of every vertex it leaves uncovered is a minimum cover.
//! Redundant edges (both endpoints covered twice) are pruned afterwards,
//! which only happens on zero-cost ties and leaves every component a star.

use std::cmp::Ordering;
use tracing::{debug, info, warn};

use crate::error::{CausalError, Result};
use crate::matching::hungarian::max_weight_matching;

/// Subclasses and treated–control edges of a full matching.
#[derive(Debug, Clone, PartialEq)]
pub struct FullMatching {
    pub subclass: Vec<Option<usize>>,
    /// `(treated, control)` unit pairs inside subclasses
    pub edges: Vec<(usize, usize)>,
    /// Eligible units with no admissible partner
    pub unmatched: usize,
}

fn admissible(gap: f64, caliper: Option<f64>) -> bool {
    caliper.is_none_or(|c| gap <= c)
}

fn find(parent: &mut [usize], x: usize) -> usize {
    let mut root = x;
    while parent[root] != root {
        root = parent[root];
    }
    let mut node = x;
    while parent[node] != root {
        let next = parent[node];
        parent[node] = root;
        node = next;
    }
    root
}

/// Full matching of eligible units on the absolute distance difference.
pub fn full_match(
    distance: &[f64],
    treated: &[bool],
    eligible: &[bool],
    caliper: Option<f64>,
) -> Result<FullMatching> {
    let n = distance.len();
    let t_all: Vec<usize> = (0..n).filter(|&i| eligible[i] && treated[i]).collect();
    let c_all: Vec<usize> = (0..n).filter(|&i| eligible[i] && !treated[i]).collect();

    // Keep only units with at least one admissible partner.
    let has_partner = |u: usize, others: &[usize]| {
        others
            .iter()
            .any(|&o| admissible((distance[u] - distance[o]).abs(), caliper))
    };
    let t_units: Vec<usize> = t_all.iter().copied().filter(|&t| has_partner(t, &c_all)).collect();
    let c_units: Vec<usize> = c_all.iter().copied().filter(|&c| has_partner(c, &t_all)).collect();
    let unmatched = (t_all.len() - t_units.len()) + (c_all.len() - c_units.len());
    if unmatched > 0 {
        warn!("{} units have no admissible partner within the caliper", unmatched);
    }

    if t_units.is_empty() || c_units.is_empty() {
        return Err(CausalError::MatchingFailed(
            "no admissible treated-control pairs".to_string(),
        ));
    }

    let (nt, nc) = (t_units.len(), c_units.len());
    let gap = |a: usize, b: usize| (distance[t_units[a]] - distance[c_units[b]]).abs();

    let mut mu_t = vec![f64::INFINITY; nt];
    let mut mu_c = vec![f64::INFINITY; nc];
    let mut best_t = vec![0usize; nt];
    let mut best_c = vec![0usize; nc];
    for a in 0..nt {
        for b in 0..nc {
            let d = gap(a, b);
            if !admissible(d, caliper) {
                continue;
            }
            // Strict comparisons keep the lowest index among ties.
            if d < mu_t[a] {
                mu_t[a] = d;
                best_t[a] = b;
            }
            if d < mu_c[b] {
                mu_c[b] = d;
                best_c[b] = a;
            }
        }
    }

    let weight: Vec<Vec<f64>> = (0..nt)
        .map(|a| {
            (0..nc)
                .map(|b| {
                    let d = gap(a, b);
                    if admissible(d, caliper) {
                        (mu_t[a] + mu_c[b] - d).max(0.0)
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect();

    let matching = max_weight_matching(&weight);
    debug!("Edge-cover matching core: {} edges", matching.len());

    let mut edges: Vec<(usize, usize)> = matching.clone();
    let mut covered_t = vec![false; nt];
    let mut covered_c = vec![false; nc];
    for &(a, b) in &matching {
        covered_t[a] = true;
        covered_c[b] = true;
    }
    for a in 0..nt {
        if !covered_t[a] {
            edges.push((a, best_t[a]));
        }
    }
    for b in 0..nc {
        if !covered_c[b] {
            edges.push((best_c[b], b));
        }
    }
    edges.sort_unstable();
    edges.dedup();

    // Drop redundant edges, most expensive first.
    let mut deg_t = vec![0usize; nt];
    let mut deg_c = vec![0usize; nc];
    for &(a, b) in &edges {
        deg_t[a] += 1;
        deg_c[b] += 1;
    }
    let mut by_cost = edges.clone();
    by_cost.sort_by(|x, y| {
        gap(y.0, y.1)
            .partial_cmp(&gap(x.0, x.1))
            .unwrap_or(Ordering::Equal)
            .then(y.cmp(x))
    });
    let mut removed = Vec::new();
    for &(a, b) in &by_cost {
        if deg_t[a] >= 2 && deg_c[b] >= 2 {
            deg_t[a] -= 1;
            deg_c[b] -= 1;
            removed.push((a, b));
        }
    }
    edges.retain(|e| !removed.contains(e));

    // Components of the cover become subclasses.
    let mut parent: Vec<usize> = (0..nt + nc).collect();
    for &(a, b) in &edges {
        let ra = find(&mut parent, a);
        let rb = find(&mut parent, nt + b);
        if ra != rb {
            parent[ra] = rb;
        }
    }

    let mut members: Vec<(usize, usize)> = Vec::with_capacity(nt + nc);
    for a in 0..nt {
        members.push((t_units[a], find(&mut parent, a)));
    }
    for b in 0..nc {
        members.push((c_units[b], find(&mut parent, nt + b)));
    }
    members.sort_unstable();

    let mut subclass = vec![None; n];
    let mut ids: Vec<(usize, usize)> = Vec::new();
    for (unit, root) in members {
        let id = match ids.iter().find(|(r, _)| *r == root) {
            Some((_, id)) => *id,
            None => {
                let id = ids.len();
                ids.push((root, id));
                id
            }
        };
        subclass[unit] = Some(id);
    }

    let total: f64 = edges.iter().map(|&(a, b)| gap(a, b)).sum();
    info!(
        "Full matching: {} subclasses over {} treated and {} control units (total distance {:.4})",
        ids.len(),
        nt,
        nc,
        total
    );

    Ok(FullMatching {
        subclass,
        edges: edges
            .into_iter()
            .map(|(a, b)| (t_units[a], c_units[b]))
            .collect(),
        unmatched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_full_matching_groups_neighbours() {
        // treated: 0, 1; controls: 2..=5
        let distance = [0.1, 0.5, 0.12, 0.13, 0.52, 0.9];
        let treated = [true, true, false, false, false, false];
        let m = full_match(&distance, &treated, &[true; 6], None).unwrap();
        assert_eq!(
            m.subclass,
            vec![Some(0), Some(1), Some(0), Some(0), Some(1), Some(1)]
        );
        assert_eq!(m.edges.len(), 4);
        assert_eq!(m.unmatched, 0);
    }

    #[test]
    fn test_one_control_many_treated() {
        let distance = [0.4, 0.6, 0.55, 0.5];
        let treated = [true, true, true, false];
        let m = full_match(&distance, &treated, &[true; 4], None).unwrap();
        assert!(m.subclass.iter().all(|s| *s == Some(0)));
    }

    #[test]
    fn test_every_subclass_is_a_star() {
        let distance = [0.2, 0.2, 0.2, 0.2, 0.3, 0.7, 0.71, 0.69];
        let treated = [true, true, false, false, true, false, true, true];
        let m = full_match(&distance, &treated, &[true; 8], None).unwrap();

        let k = m.subclass.iter().flatten().max().unwrap() + 1;
        for s in 0..k {
            let nt = (0..8).filter(|&i| m.subclass[i] == Some(s) && treated[i]).count();
            let nc = (0..8).filter(|&i| m.subclass[i] == Some(s) && !treated[i]).count();
            assert!(nt >= 1 && nc >= 1);
            assert!(nt == 1 || nc == 1, "subclass {} has {} treated and {} controls", s, nt, nc);
        }
    }

    #[test]
    fn test_caliper_discards_isolated_units() {
        let distance = [0.1, 0.5, 0.11, 0.52, 0.95];
        let treated = [true, true, false, false, false];
        let m = full_match(&distance, &treated, &[true; 5], Some(0.1)).unwrap();
        assert_eq!(m.subclass[4], None);
        assert_eq!(m.unmatched, 1);
        assert_eq!(m.subclass[0], m.subclass[2]);
        assert_eq!(m.subclass[1], m.subclass[3]);
    }

    #[test]
    fn test_ineligible_units_ignored() {
        let distance = [0.1, 0.12, 0.5];
        let treated = [true, false, false];
        let m = full_match(&distance, &treated, &[true, true, false], None).unwrap();
        assert_eq!(m.subclass, vec![Some(0), Some(0), None]);
        assert_eq!(m.unmatched, 0);
    }
}
