//! 查询轮换
//!
//! 每次执行只采集查询源中的一部分查询。顺序策略和类别均衡策略的游标按周期ID保存，
//! 下一次执行从上次结束的位置继续。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use serpline_core::models::{Query, RotationStrategy};

const UNCATEGORIZED: &str = "uncategorized";

#[derive(Default)]
struct Cursors {
    sequential: HashMap<String, usize>,
    /// (周期ID, 类别) -> 游标
    category: HashMap<(String, String), usize>,
}

#[derive(Default)]
pub struct QueryRotation {
    cursors: Mutex<Cursors>,
}

impl QueryRotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按策略选出最多 `count` 条查询
    pub fn select(
        &self,
        cycle_id: &str,
        strategy: RotationStrategy,
        queries: &[Query],
        count: usize,
    ) -> Vec<Query> {
        let count = count.min(queries.len());
        if count == 0 {
            return Vec::new();
        }
        match strategy {
            RotationStrategy::Sequential => self.sequential(cycle_id, queries, count),
            RotationStrategy::Random => random(queries, count),
            RotationStrategy::CategoryBalanced => self.category_balanced(cycle_id, queries, count),
        }
    }

    fn sequential(&self, cycle_id: &str, queries: &[Query], count: usize) -> Vec<Query> {
        let mut cursors = self.lock();
        let cursor = cursors
            .sequential
            .entry(cycle_id.to_string())
            .or_insert(0);
        let start = *cursor % queries.len();
        *cursor = (start + count) % queries.len();

        (0..count)
            .map(|offset| queries[(start + offset) % queries.len()].clone())
            .collect()
    }

    fn category_balanced(&self, cycle_id: &str, queries: &[Query], count: usize) -> Vec<Query> {
        let mut groups: BTreeMap<&str, Vec<&Query>> = BTreeMap::new();
        for query in queries {
            let category = query.category.as_deref().unwrap_or(UNCATEGORIZED);
            groups.entry(category).or_default().push(query);
        }

        let mut cursors = self.lock();
        let starts: Vec<usize> = groups
            .keys()
            .map(|category| {
                cursors
                    .category
                    .get(&(cycle_id.to_string(), category.to_string()))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();
        let mut taken = vec![0usize; groups.len()];

        let mut selected = Vec::with_capacity(count);
        while selected.len() < count {
            for (index, members) in groups.values().enumerate() {
                if selected.len() == count {
                    break;
                }
                if taken[index] < members.len() {
                    let position = (starts[index] + taken[index]) % members.len();
                    selected.push(members[position].clone());
                    taken[index] += 1;
                }
            }
        }

        for (index, (category, members)) in groups.iter().enumerate() {
            let next = (starts[index] + taken[index]) % members.len();
            cursors
                .category
                .insert((cycle_id.to_string(), category.to_string()), next);
        }
        selected
    }

    /// 删除周期的游标
    pub fn reset(&self, cycle_id: &str) {
        let mut cursors = self.lock();
        cursors.sequential.remove(cycle_id);
        cursors.category.retain(|(id, _), _| id != cycle_id);
    }

    fn lock(&self) -> MutexGuard<'_, Cursors> {
        self.cursors.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn random(queries: &[Query], count: usize) -> Vec<Query> {
    let mut rng = rand::rng();
    rand::seq::index::sample(&mut rng, queries.len(), count)
        .into_iter()
        .map(|index| queries[index].clone())
        .collect()
}
