//! Rectangular assignment problem (Hungarian algorithm with potentials).

/// Minimum-cost assignment.
///
/// `cost` is a dense `rows x cols` matrix. Every row is assigned when
/// `rows <= cols`, every column otherwise. Returns the assigned column of
/// each row. Runs in `O(n² m)` for `n = min(rows, cols)`.
pub fn solve_assignment(cost: &[Vec<f64>]) -> Vec<Option<usize>> {
    let rows = cost.len();
    let cols = cost.first().map_or(0, Vec::len);
    if rows == 0 || cols == 0 {
        return vec![None; rows];
    }

    if rows > cols {
        let transposed: Vec<Vec<f64>> = (0..cols)
            .map(|j| (0..rows).map(|i| cost[i][j]).collect())
            .collect();
        let by_col = solve_assignment(&transposed);
        let mut by_row = vec![None; rows];
        for (j, i) in by_col.into_iter().enumerate() {
            if let Some(i) = i {
                by_row[i] = Some(j);
            }
        }
        return by_row;
    }

    let (n, m) = (rows, cols);
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; m + 1];
    // owner[j]: 1-based row currently assigned to column j, 0 if free
    let mut owner = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        owner[0] = i;
        let mut j0 = 0usize;
        let mut min_v = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = owner[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0usize;

            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = cost[i0 - 1][j - 1] - u[i0] - v[j];
                if reduced < min_v[j] {
                    min_v[j] = reduced;
                    way[j] = j0;
                }
                if min_v[j] < delta {
                    delta = min_v[j];
                    j1 = j;
                }
            }

            for j in 0..=m {
                if used[j] {
                    u[owner[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_v[j] -= delta;
                }
            }

            j0 = j1;
            if owner[j0] == 0 {
                break;
            }
        }

        // Augment along the alternating path.
        loop {
            let j1 = way[j0];
            owner[j0] = owner[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut assignment = vec![None; n];
    for j in 1..=m {
        if owner[j] != 0 {
            assignment[owner[j] - 1] = Some(j - 1);
        }
    }
    assignment
}

/// Maximum-weight matching in a bipartite graph with non-negative weights.
///
/// Returns `(row, col)` pairs whose weight is strictly positive.
pub fn max_weight_matching(weight: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let cost: Vec<Vec<f64>> = weight
        .iter()
        .map(|row| row.iter().map(|w| -w.max(0.0)).collect())
        .collect();
    solve_assignment(&cost)
        .into_iter()
        .enumerate()
        .filter_map(|(i, j)| j.filter(|&j| weight[i][j] > 0.0).map(|j| (i, j)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn total(cost: &[Vec<f64>], assignment: &[Option<usize>]) -> f64 {
        assignment
            .iter()
            .enumerate()
            .filter_map(|(i, j)| j.map(|j| cost[i][j]))
            .sum()
    }

    #[test]
    fn test_square_assignment() {
        let cost = vec![
            vec![4.0, 1.0, 3.0],
            vec![2.0, 0.0, 5.0],
            vec![3.0, 2.0, 2.0],
        ];
        let assignment = solve_assignment(&cost);
        assert_eq!(total(&cost, &assignment), 5.0);
        assert_eq!(assignment, vec![Some(1), Some(0), Some(2)]);
    }

    #[test]
    fn test_rectangular_both_orientations() {
        let wide = vec![vec![10.0, 1.0, 7.0], vec![1.0, 8.0, 9.0]];
        let assignment = solve_assignment(&wide);
        assert_eq!(assignment, vec![Some(1), Some(0)]);

        let tall = vec![vec![10.0, 1.0], vec![1.0, 8.0], vec![7.0, 9.0]];
        let assignment = solve_assignment(&tall);
        assert_eq!(assignment, vec![Some(1), Some(0), None]);
    }

    #[test]
    fn test_max_weight_matching_skips_zero_edges() {
        let weight = vec![vec![0.0, 3.0], vec![0.0, 2.0]];
        let pairs = max_weight_matching(&weight);
        assert_eq!(pairs, vec![(0, 1)]);
    }

    #[test]
    fn test_empty() {
        assert!(solve_assignment(&[]).is_empty());
    }
}
