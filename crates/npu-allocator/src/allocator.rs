use std::collections::HashSet;
use std::fmt;

use tracing::debug;

use crate::hint::TopologyHintProvider;
use crate::Device;

/// Upper bound on the number of subsets scored before switching to greedy growth.
const DEFAULT_SEARCH_BUDGET: u64 = 200_000;

/// Chooses which units a container should receive.
pub trait NpuAllocator: Send + Sync {
    /// Returns `size` units drawn from `available` that contain every unit in
    /// `required`, ordered as they appear in `available`.
    ///
    /// When `available` cannot fill the request the answer is as large as
    /// possible; when `required` alone exceeds `size`, all of `required` is
    /// returned.
    fn allocate<'a>(
        &self,
        available: &[&'a dyn Device],
        required: &[&'a dyn Device],
        size: usize,
    ) -> Vec<&'a dyn Device>;
}

/// Picks the subset with the highest sum of pairwise topology hints.
///
/// Every subset is scored in lexicographic order of `available` and the first
/// best one wins, so results are stable for a stable input order.
pub struct ScoreBasedOptimalNpuAllocator {
    hint_provider: Box<dyn TopologyHintProvider>,
    search_budget: u64,
}

impl fmt::Debug for ScoreBasedOptimalNpuAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoreBasedOptimalNpuAllocator")
            .field("search_budget", &self.search_budget)
            .finish_non_exhaustive()
    }
}

impl ScoreBasedOptimalNpuAllocator {
    pub fn new(hint_provider: impl TopologyHintProvider + 'static) -> Self {
        Self {
            hint_provider: Box::new(hint_provider),
            search_budget: DEFAULT_SEARCH_BUDGET,
        }
    }

    pub fn with_search_budget(mut self, search_budget: u64) -> Self {
        self.search_budget = search_budget;
        self
    }

    fn hint_matrix(&self, devices: &[&dyn Device]) -> Vec<Vec<u64>> {
        devices
            .iter()
            .map(|a| {
                devices
                    .iter()
                    .map(|b| {
                        u64::from(
                            self.hint_provider
                                .hint(a.topology_hint_key(), b.topology_hint_key()),
                        )
                    })
                    .collect()
            })
            .collect()
    }
}

impl NpuAllocator for ScoreBasedOptimalNpuAllocator {
    fn allocate<'a>(
        &self,
        available: &[&'a dyn Device],
        required: &[&'a dyn Device],
        size: usize,
    ) -> Vec<&'a dyn Device> {
        let mut required_ids = HashSet::new();
        let mut pool: Vec<&'a dyn Device> = Vec::with_capacity(available.len() + required.len());
        for &device in required {
            if required_ids.insert(device.id()) {
                pool.push(device);
            }
        }
        let fixed = pool.len();

        let mut candidate_ids = HashSet::new();
        for &device in available {
            if !required_ids.contains(device.id()) && candidate_ids.insert(device.id()) {
                pool.push(device);
            }
        }
        let candidates = pool.len() - fixed;
        let need = size.saturating_sub(fixed);

        if need == 0 || need >= candidates {
            let take = fixed + need.min(candidates);
            pool.truncate(take);
            return order_like(available, pool);
        }

        let matrix = self.hint_matrix(&pool);
        let picked = if binomial(candidates as u64, need as u64) <= self.search_budget {
            exhaustive(&matrix, fixed, need)
        } else {
            debug!(
                candidates,
                need, "subset space exceeds search budget, growing greedily"
            );
            greedy(&matrix, fixed, need)
        };

        let mut chosen: Vec<&'a dyn Device> = pool[..fixed].to_vec();
        chosen.extend(picked.into_iter().map(|index| pool[index]));
        order_like(available, chosen)
    }
}

/// Scores every `need`-sized subset of `fixed..matrix.len()` joined with `0..fixed`.
fn exhaustive(matrix: &[Vec<u64>], fixed: usize, need: usize) -> Vec<usize> {
    let total = matrix.len();
    let mut combination: Vec<usize> = (fixed..fixed + need).collect();
    let mut best: Option<(u64, Vec<usize>)> = None;

    loop {
        let score = subset_score(matrix, fixed, &combination);
        if best.as_ref().is_none_or(|(best_score, _)| score > *best_score) {
            best = Some((score, combination.clone()));
        }

        // advance to the next combination in lexicographic order
        let Some(position) = (0..need).rev().find(|&i| combination[i] < total - need + i) else {
            break;
        };
        combination[position] += 1;
        for i in position + 1..need {
            combination[i] = combination[i - 1] + 1;
        }
    }

    best.map(|(_, combination)| combination).unwrap_or_default()
}

fn subset_score(matrix: &[Vec<u64>], fixed: usize, combination: &[usize]) -> u64 {
    let mut score = 0;
    for (i, &a) in combination.iter().enumerate() {
        score += (0..fixed).map(|r| matrix[a][r]).sum::<u64>();
        score += combination[i + 1..].iter().map(|&b| matrix[a][b]).sum::<u64>();
    }
    score
}

fn greedy(matrix: &[Vec<u64>], fixed: usize, need: usize) -> Vec<usize> {
    let mut members: Vec<usize> = (0..fixed).collect();
    let mut picked = Vec::with_capacity(need);

    for _ in 0..need {
        let mut best: Option<(u64, usize)> = None;
        for candidate in fixed..matrix.len() {
            if picked.contains(&candidate) {
                continue;
            }
            let gain: u64 = members.iter().map(|&m| matrix[candidate][m]).sum();
            if best.is_none_or(|(best_gain, _)| gain > best_gain) {
                best = Some((gain, candidate));
            }
        }
        let Some((_, candidate)) = best else {
            break;
        };
        members.push(candidate);
        picked.push(candidate);
    }

    picked
}

/// `n choose k`, saturating at `u64::MAX`.
fn binomial(n: u64, k: u64) -> u64 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut result: u64 = 1;
    for i in 0..k {
        match result.checked_mul(n - i) {
            Some(product) => result = product / (i + 1),
            None => return u64::MAX,
        }
    }
    result
}

fn order_like<'a>(
    available: &[&'a dyn Device],
    mut chosen: Vec<&'a dyn Device>,
) -> Vec<&'a dyn Device> {
    chosen.sort_by_key(|device| {
        available
            .iter()
            .position(|candidate| candidate.id() == device.id())
            .unwrap_or(usize::MAX)
    });
    chosen
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::hint::TopologyHint;

    struct MockDevice(String);

    impl Device for MockDevice {
        fn id(&self) -> &str {
            &self.0
        }

        fn topology_hint_key(&self) -> &str {
            &self.0
        }
    }

    /// Eight boards on two sockets, paired behind switches within each socket.
    fn two_socket_hint(a: &str, b: &str) -> TopologyHint {
        if a == b {
            return 70;
        }
        let (a, b) = match (a.parse::<u32>(), b.parse::<u32>()) {
            (Ok(a), Ok(b)) => (a.min(b), a.max(b)),
            _ => return 0,
        };
        if a / 4 != b / 4 {
            10
        } else if a / 2 == b / 2 {
            30
        } else {
            20
        }
    }

    fn devices(count: usize) -> Vec<MockDevice> {
        (0..count).map(|i| MockDevice(i.to_string())).collect()
    }

    fn select<'d>(ids: &[usize], all: &'d [MockDevice]) -> Vec<&'d dyn Device> {
        ids.iter().map(|&i| &all[i] as &dyn Device).collect()
    }

    fn ids(devices: &[&dyn Device]) -> Vec<String> {
        devices.iter().map(|device| device.id().to_string()).collect()
    }

    fn run(
        allocator: &ScoreBasedOptimalNpuAllocator,
        all: &[MockDevice],
        available: &[usize],
        required: &[usize],
        size: usize,
    ) -> Vec<String> {
        ids(&allocator.allocate(&select(available, all), &select(required, all), size))
    }

    fn strings(ids: &[usize]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn prefers_closest_devices_without_requirements() {
        let all = devices(8);
        let allocator = ScoreBasedOptimalNpuAllocator::new(two_socket_hint);

        assert_eq!(run(&allocator, &all, &[0, 1, 2, 3], &[], 1), strings(&[0]));
        assert_eq!(run(&allocator, &all, &[0, 1, 2, 3], &[], 2), strings(&[0, 1]));
        assert_eq!(run(&allocator, &all, &[0, 1, 2, 3], &[], 3), strings(&[0, 1, 2]));
        assert_eq!(
            run(&allocator, &all, &[0, 1, 2, 3], &[], 4),
            strings(&[0, 1, 2, 3])
        );
    }

    #[test]
    fn keeps_required_devices() {
        let all = devices(8);
        let allocator = ScoreBasedOptimalNpuAllocator::new(two_socket_hint);

        assert_eq!(run(&allocator, &all, &[0, 1, 2, 3], &[3], 1), strings(&[3]));
        assert_eq!(run(&allocator, &all, &[0, 1, 2, 3], &[3], 2), strings(&[2, 3]));
        assert_eq!(
            run(&allocator, &all, &[0, 1, 2, 3], &[3], 3),
            strings(&[0, 1, 3])
        );
        assert_eq!(run(&allocator, &all, &[0, 1, 2, 3], &[2], 2), strings(&[2, 3]));
        assert_eq!(
            run(&allocator, &all, &[0, 1, 2, 3], &[2, 3], 2),
            strings(&[2, 3])
        );
        assert_eq!(
            run(&allocator, &all, &[0, 1, 2, 3], &[2, 3], 4),
            strings(&[0, 1, 2, 3])
        );
    }

    #[test]
    fn second_socket() {
        let all = devices(8);
        let allocator = ScoreBasedOptimalNpuAllocator::new(two_socket_hint);

        assert_eq!(run(&allocator, &all, &[4, 5, 6, 7], &[], 1), strings(&[4]));
        assert_eq!(run(&allocator, &all, &[4, 5, 6, 7], &[], 2), strings(&[4, 5]));
        assert_eq!(
            run(&allocator, &all, &[4, 5, 6, 7], &[], 3),
            strings(&[4, 5, 6])
        );
        assert_eq!(
            run(&allocator, &all, &[4, 5, 6, 7], &[], 4),
            strings(&[4, 5, 6, 7])
        );
    }

    #[test]
    fn spans_sockets_when_needed() {
        let all = devices(8);
        let allocator = ScoreBasedOptimalNpuAllocator::new(two_socket_hint);
        let everything = [0, 1, 2, 3, 4, 5, 6, 7];

        assert_eq!(
            run(&allocator, &all, &everything, &[], 5),
            strings(&[0, 1, 2, 3, 4])
        );
        assert_eq!(
            run(&allocator, &all, &everything, &[], 6),
            strings(&[0, 1, 2, 3, 4, 5])
        );
        assert_eq!(
            run(&allocator, &all, &everything, &[], 7),
            strings(&[0, 1, 2, 3, 4, 5, 6])
        );
        assert_eq!(run(&allocator, &all, &everything, &[], 8), strings(&everything));
    }

    #[test]
    fn short_supply_returns_everything() {
        let all = devices(8);
        let allocator = ScoreBasedOptimalNpuAllocator::new(two_socket_hint);

        assert_eq!(run(&allocator, &all, &[5, 1], &[], 4), strings(&[5, 1]));
        assert_eq!(run(&allocator, &all, &[0, 1], &[0, 1], 1), strings(&[0, 1]));
    }

    #[test]
    fn greedy_fallback_stays_on_one_socket() {
        let all = devices(8);
        let allocator =
            ScoreBasedOptimalNpuAllocator::new(two_socket_hint).with_search_budget(0);

        assert_eq!(
            run(&allocator, &all, &[0, 1, 2, 3, 4, 5, 6, 7], &[], 4),
            strings(&[0, 1, 2, 3])
        );
        assert_eq!(
            run(&allocator, &all, &[0, 1, 2, 3, 4, 5, 6, 7], &[6], 2),
            strings(&[6, 7])
        );
    }

    #[test]
    fn binomial_saturates() {
        assert_eq!(binomial(8, 2), 28);
        assert_eq!(binomial(4, 4), 1);
        assert_eq!(binomial(128, 64), u64::MAX);
    }
}
