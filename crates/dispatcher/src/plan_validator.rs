//! 执行计划的依赖图校验
//!
//! 子任务放在扁平数组中，依赖用下标表示，Kahn 算法做拓扑排序；
//! 排序未覆盖全部节点时，在剩余节点中找出一个环用于报错。

use std::collections::{HashMap, HashSet};

use orchestrator_core::{OrchestratorError, OrchestratorResult, PlanTaskSpec};

/// 通过校验的计划图
#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    /// 拓扑顺序（下标）
    pub order: Vec<usize>,
    /// (子任务下标, 前置任务下标)
    pub edges: Vec<(usize, usize)>,
}

pub fn validate_plan(specs: &[PlanTaskSpec]) -> OrchestratorResult<ValidatedPlan> {
    if specs.is_empty() {
        return Err(OrchestratorError::validation("执行计划至少需要一个子任务"));
    }

    let mut index: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
    for (idx, spec) in specs.iter().enumerate() {
        if spec.id.trim().is_empty() {
            return Err(OrchestratorError::validation(format!(
                "第 {} 个子任务缺少ID",
                idx + 1
            )));
        }
        if spec.task_type.trim().is_empty() {
            return Err(OrchestratorError::validation(format!(
                "子任务 {} 缺少任务类型",
                spec.id
            )));
        }
        if matches!(spec.max_retries, Some(n) if n < 0) {
            return Err(OrchestratorError::validation(format!(
                "子任务 {} 的重试次数不能为负数",
                spec.id
            )));
        }
        if index.insert(spec.id.as_str(), idx).is_some() {
            return Err(OrchestratorError::validation(format!(
                "子任务ID重复: {}",
                spec.id
            )));
        }
    }

    let mut edges = Vec::new();
    let mut upstream: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (idx, spec) in specs.iter().enumerate() {
        let mut seen = HashSet::new();
        for dep in &spec.depends_on {
            let Some(&dep_idx) = index.get(dep.as_str()) else {
                return Err(OrchestratorError::UnknownDependency {
                    task_id: spec.id.clone(),
                    dependency_id: dep.clone(),
                });
            };
            if seen.insert(dep_idx) {
                upstream[idx].push(dep_idx);
                edges.push((idx, dep_idx));
            }
        }
    }

    let order = topological_order(&upstream);
    if order.len() < specs.len() {
        let cycle = find_cycle(&upstream, &order)
            .into_iter()
            .map(|idx| specs[idx].id.clone())
            .collect();
        return Err(OrchestratorError::CyclicDependency { cycle });
    }

    Ok(ValidatedPlan { order, edges })
}

fn topological_order(upstream: &[Vec<usize>]) -> Vec<usize> {
    let n = upstream.len();
    let mut in_degree: Vec<usize> = upstream.iter().map(Vec::len).collect();
    let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (idx, deps) in upstream.iter().enumerate() {
        for &dep in deps {
            downstream[dep].push(idx);
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).rev().collect();
    let mut order = Vec::with_capacity(n);
    while let Some(idx) = ready.pop() {
        order.push(idx);
        for &next in &downstream[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(next);
            }
        }
    }
    order
}

/// 在未能排序的节点中沿依赖边走，直到重复访问某个节点
fn find_cycle(upstream: &[Vec<usize>], sorted: &[usize]) -> Vec<usize> {
    let sorted: HashSet<usize> = sorted.iter().copied().collect();
    let Some(start) = (0..upstream.len()).find(|i| !sorted.contains(i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        // 剩余节点都至少有一条指向剩余节点的依赖
        let Some(&next) = upstream[current].iter().find(|d| !sorted.contains(d)) else {
            return path;
        };
        if let Some(&pos) = position.get(&next) {
            let mut cycle: Vec<usize> = path[pos..].to_vec();
            cycle.push(next);
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}
