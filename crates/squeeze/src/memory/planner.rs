//! Cost model behind the sort-or-index-scan decision of the initial load.

/// Unit costs, relative to one sequential page read.
#[derive(Debug, Clone, Copy)]
pub struct CostWeights {
    pub seq_page: f64,
    pub random_page: f64,
    pub cpu_tuple: f64,
    pub cpu_index_tuple: f64,
    pub cpu_operator: f64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            seq_page: 1.0,
            random_page: 4.0,
            cpu_tuple: 0.01,
            cpu_index_tuple: 0.005,
            cpu_operator: 0.0025,
        }
    }
}

/// What the planner knows about the table and the clustering index.
#[derive(Debug, Clone, Copy)]
pub struct ClusterStats {
    pub tuples: f64,
    pub pages: f64,
    /// Correlation between index order and physical order, -1..=1
    pub correlation: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterCostModel {
    pub weights: CostWeights,
}

impl ClusterCostModel {
    /// Sequential scan followed by an in-memory sort.
    pub fn seq_scan_and_sort(&self, stats: ClusterStats) -> f64 {
        let w = &self.weights;
        let n = stats.tuples.max(2.0);
        let scan = stats.pages * w.seq_page + stats.tuples * w.cpu_tuple;
        let sort = 2.0 * w.cpu_operator * n * n.log2();
        scan + sort
    }

    /// Full scan in index order. Interpolates between one random fetch per
    /// tuple and a sequential read of every page by the squared correlation.
    pub fn index_scan(&self, stats: ClusterStats) -> f64 {
        let w = &self.weights;
        let max_io = stats.tuples * w.random_page;
        let min_io = stats.pages * w.seq_page;
        let csquared = stats.correlation * stats.correlation;
        let io = max_io + csquared * (min_io - max_io);
        io + stats.tuples * (w.cpu_index_tuple + w.cpu_tuple)
    }

    pub fn sort_is_cheaper(&self, stats: ClusterStats) -> bool {
        self.seq_scan_and_sort(stats) < self.index_scan(stats)
    }
}

/// Pearson correlation of physical positions listed in index order.
pub fn correlation(positions: &[u64]) -> f64 {
    let n = positions.len();
    if n < 2 {
        return 1.0;
    }
    let nf = n as f64;
    let mean_rank = (nf - 1.0) / 2.0;
    let mean_pos = positions.iter().map(|p| *p as f64).sum::<f64>() / nf;

    let (mut cov, mut var_rank, mut var_pos) = (0.0, 0.0, 0.0);
    for (rank, pos) in positions.iter().enumerate() {
        let dr = rank as f64 - mean_rank;
        let dp = *pos as f64 - mean_pos;
        cov += dr * dp;
        var_rank += dr * dr;
        var_pos += dp * dp;
    }
    if var_pos == 0.0 {
        return 1.0;
    }
    cov / (var_rank * var_pos).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation() {
        assert!((correlation(&[0, 1, 2, 3]) - 1.0).abs() < 1e-9);
        assert!((correlation(&[3, 2, 1, 0]) + 1.0).abs() < 1e-9);
        assert_eq!(correlation(&[5]), 1.0);
    }

    #[test]
    fn test_clustered_table_prefers_index_scan() {
        let model = ClusterCostModel::default();
        let stats = ClusterStats {
            tuples: 1000.0,
            pages: 5.0,
            correlation: 1.0,
        };
        assert!(!model.sort_is_cheaper(stats));

        let shuffled = ClusterStats {
            correlation: 0.05,
            ..stats
        };
        assert!(model.sort_is_cheaper(shuffled));
    }
}
