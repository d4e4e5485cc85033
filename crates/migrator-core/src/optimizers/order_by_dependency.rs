use super::Optimizer;
use crate::Result;
use crate::model::{BuildObjectModel, Target};
use std::collections::BTreeMap;
use tracing::error;

/// Stable reorder that puts every target after the targets it depends on.
///
/// Targets already in dependency order keep their positions. A dependency
/// cycle is reported and broken at the edge that closes it.
pub struct OrderByDependency;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn visit(
    idx: usize,
    targets: &[Target],
    index: &BTreeMap<String, usize>,
    marks: &mut [Mark],
    order: &mut Vec<usize>,
) {
    marks[idx] = Mark::InProgress;
    let mut deps: Vec<usize> = targets[idx]
        .all_dependencies()
        .into_iter()
        .filter_map(|dep| index.get(dep).copied())
        .filter(|&dep| dep != idx)
        .collect();
    deps.sort_unstable();
    deps.dedup();
    for dep in deps {
        match marks[dep] {
            Mark::Done => {}
            Mark::InProgress => error!(
                target = targets[idx].output(),
                dependency = targets[dep].output(),
                "dependency cycle found"
            ),
            Mark::Unvisited => visit(dep, targets, index, marks, order),
        }
    }
    marks[idx] = Mark::Done;
    order.push(idx);
}

impl Optimizer for OrderByDependency {
    fn name(&self) -> &'static str {
        "order_by_dependency"
    }

    fn optimize(&self, model: &BuildObjectModel) -> Result<BuildObjectModel> {
        let index = model.output_index();
        let mut marks = vec![Mark::Unvisited; model.len()];
        let mut order = Vec::with_capacity(model.len());
        for idx in 0..model.len() {
            if marks[idx] == Mark::Unvisited {
                visit(idx, &model.targets, &index, &mut marks, &mut order);
            }
        }
        Ok(BuildObjectModel::new(
            order.into_iter().map(|idx| model.targets[idx].clone()).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Module, ModuleType, TargetKind};

    fn module(output: &str, deps: &[&str]) -> Target {
        let mut m = Module::new(ModuleType::StaticLib, output);
        m.dependencies = deps.iter().map(|d| d.to_string()).collect();
        Target::from(TargetKind::Module(m))
    }

    fn outputs(model: &BuildObjectModel) -> Vec<&str> {
        model.targets.iter().map(Target::output).collect()
    }

    #[test]
    fn test_dependencies_move_before_dependents() {
        let model = BuildObjectModel::new(vec![
            module("app", &["libb", "liba"]),
            module("other", &[]),
            module("liba", &[]),
            module("libb", &["liba"]),
        ]);
        let result = OrderByDependency.optimize(&model).unwrap();
        assert_eq!(outputs(&result), vec!["liba", "libb", "app", "other"]);
    }

    #[test]
    fn test_ordered_model_is_unchanged() {
        let model = BuildObjectModel::new(vec![
            module("a", &[]),
            module("b", &["a"]),
            module("c", &[]),
            module("d", &["b", "c"]),
        ]);
        let result = OrderByDependency.optimize(&model).unwrap();
        assert_eq!(result, model);
    }

    #[test]
    fn test_cycle_is_broken() {
        let model = BuildObjectModel::new(vec![
            module("a", &["b"]),
            module("b", &["a"]),
            module("c", &["missing"]),
        ]);
        let result = OrderByDependency.optimize(&model).unwrap();
        assert_eq!(outputs(&result), vec!["b", "a", "c"]);
    }
}
