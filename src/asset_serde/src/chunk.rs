use serde::Serialize;

const FILE_THRESHOLD: usize = 500;
const ROW_THRESHOLD: u64 = 100_000;

/// What the planner is balancing. Files are sized by bytes, row batches by
/// record count; each kind scales its bin count differently for large inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlanKind {
    Files,
    Rows,
}

#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    pub workers: usize,
    pub kind: PlanKind,
}

#[derive(Debug, Clone)]
pub struct ChunkPlan<T> {
    pub chunks: Vec<Vec<T>>,
    totals: Vec<u64>,
}

impl<T> ChunkPlan<T> {
    pub fn totals(&self) -> &[u64] {
        &self.totals
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn into_chunks(self) -> Vec<Vec<T>> {
        self.chunks
    }
}

impl ChunkPlanner {
    pub fn new(workers: usize, kind: PlanKind) -> ChunkPlanner {
        ChunkPlanner {
            workers: workers.max(1),
            kind,
        }
    }

    pub fn files(workers: usize) -> ChunkPlanner {
        Self::new(workers, PlanKind::Files)
    }

    pub fn rows(workers: usize) -> ChunkPlanner {
        Self::new(workers, PlanKind::Rows)
    }

    /// Number of bins to spread `item_count` items totalling `total_size` over.
    pub fn bin_count(&self, item_count: usize, total_size: u64) -> usize {
        let w = self.workers;
        let bins = match self.kind {
            PlanKind::Files if item_count > FILE_THRESHOLD => {
                (w * 4).min((item_count / 50).max(8)).min(32)
            }
            PlanKind::Rows if total_size > ROW_THRESHOLD => {
                let by_volume = usize::try_from(total_size / 10_000).unwrap_or(usize::MAX);
                (w * 4).min(by_volume.max(w * 2)).min(w * 8)
            }
            _ => w,
        };
        bins.max(1)
    }

    /// Greedy largest-first bin packing. Each item goes to the bin with the
    /// smallest running total (fewest items, then lowest index on ties);
    /// empty bins are dropped.
    /// The spread between the fullest and emptiest bin never exceeds the
    /// largest single item.
    pub fn plan<T>(&self, items: Vec<(T, u64)>) -> ChunkPlan<T> {
        let total_size: u64 = items.iter().map(|(_, size)| *size).sum();
        let bins = self.bin_count(items.len(), total_size);

        let mut items = items;
        items.sort_by(|a, b| b.1.cmp(&a.1));

        let mut chunks: Vec<Vec<T>> = (0..bins).map(|_| Vec::new()).collect();
        let mut totals = vec![0u64; bins];
        for (item, size) in items {
            // zero-sized items still spread across bins
            let target = (0..bins)
                .min_by_key(|&index| (totals[index], chunks[index].len(), index))
                .unwrap_or(0);
            chunks[target].push(item);
            totals[target] += size;
        }

        let (chunks, totals) = chunks
            .into_iter()
            .zip(totals)
            .filter(|(chunk, _)| !chunk.is_empty())
            .unzip();
        ChunkPlan { chunks, totals }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_file_bin_count() {
        let planner = ChunkPlanner::files(4);
        assert_eq!(planner.bin_count(10, 1_000), 4);
        assert_eq!(planner.bin_count(501, 1_000), 10);
        assert_eq!(planner.bin_count(5_000, 1_000), 16);

        let wide = ChunkPlanner::files(16);
        assert_eq!(wide.bin_count(5_000, 1_000), 32);
        assert_eq!(wide.bin_count(600, 1_000), 12);
    }

    #[test]
    fn test_row_bin_count() {
        let planner = ChunkPlanner::rows(4);
        assert_eq!(planner.bin_count(3, 50_000), 4);
        assert_eq!(planner.bin_count(3, 150_000), 15);
        assert_eq!(planner.bin_count(3, 120_000), 12);
        assert_eq!(planner.bin_count(3, 10_000_000), 16);
    }

    #[test]
    fn test_plan_balances_largest_first() {
        let planner = ChunkPlanner::files(2);
        let plan = planner.plan(vec![("a", 5), ("b", 7), ("c", 3), ("d", 4)]);
        assert_eq!(plan.chunks, vec![vec!["b", "c"], vec!["a", "d"]]);
        assert_eq!(plan.totals(), &[10, 9]);
    }

    #[test]
    fn test_plan_drops_empty_bins() {
        let planner = ChunkPlanner::files(8);
        let plan = planner.plan(vec![("only", 42u64), ("other", 1)]);
        assert_eq!(plan.len(), 2);

        let empty = planner.plan(Vec::<(&str, u64)>::new());
        assert!(empty.is_empty());
    }

    fn plan_kind() -> impl Strategy<Value = PlanKind> {
        prop_oneof![Just(PlanKind::Files), Just(PlanKind::Rows)]
    }

    proptest! {
        #[test]
        fn prop_spread_bounded_by_largest_item(
            sizes in prop::collection::vec(0u64..10_000, 0..1_200),
            workers in 1usize..12,
            kind in plan_kind(),
        ) {
            let planner = ChunkPlanner::new(workers, kind);
            let total: u64 = sizes.iter().sum();
            let expected_bins = planner.bin_count(sizes.len(), total).min(sizes.len());
            let items: Vec<(usize, u64)> = sizes.iter().copied().enumerate().collect();
            let plan = planner.plan(items);

            let placed: usize = plan.chunks.iter().map(Vec::len).sum();
            prop_assert_eq!(placed, sizes.len());
            prop_assert!(plan.chunks.iter().all(|chunk| !chunk.is_empty()));
            prop_assert_eq!(plan.len(), expected_bins);
            prop_assert_eq!(plan.totals().iter().sum::<u64>(), total);

            if let (Some(max), Some(min)) = (plan.totals().iter().max(), plan.totals().iter().min()) {
                let largest = sizes.iter().copied().max().unwrap_or(0);
                prop_assert!(max - min <= largest);
            }
        }

        #[test]
        fn prop_large_inputs_scale_bin_count(
            items in 501usize..1_200,
            workers in 1usize..12,
        ) {
            let files = ChunkPlanner::files(workers);
            let bins = files.bin_count(items, 0);
            prop_assert_eq!(bins, (workers * 4).min((items / 50).max(8)).min(32));

            let rows = ChunkPlanner::rows(workers);
            let total = items as u64 * 1_000;
            let bins = rows.bin_count(1, total);
            prop_assert!(bins >= workers * 2 && bins <= workers * 4);
        }
    }
}
