//! 依赖检查器
//!
//! 对一批插件做依赖解析并给出确定性的加载顺序：
//! 先按 (priority, 小写 id) 排序，再做后序深度优先遍历，依赖总是排在依赖方之前

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::dependency::{Comparator, DependencyConstraint};
use super::types::{PluginDescriptor, PluginId, PluginLocation};
use super::version::PluginVersion;

/// 依赖解析错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("依赖未找到: {dependency} (被 {plugin} 依赖)")]
    DependencyNotFound {
        plugin: PluginId,
        dependency: PluginId,
    },

    #[error("版本不满足: {plugin} 要求 {dependency}{comparator}{required}，实际版本 {actual}")]
    VersionNotSatisfied {
        plugin: PluginId,
        dependency: PluginId,
        comparator: Comparator,
        required: PluginVersion,
        actual: PluginVersion,
    },

    #[error("检测到循环依赖: {}", CyclePath(.cycle))]
    CycleDetected { cycle: Vec<PluginId> },
}

struct CyclePath<'a>(&'a [PluginId]);

impl fmt::Display for CyclePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", id)?;
        }
        Ok(())
    }
}

/// 已安装插件台账
///
/// 当依赖不在本批次中时，检查器回退到台账查询已安装/已加载的版本
pub trait PluginLedger: Send + Sync {
    fn installed_version(&self, id: &PluginId) -> Option<PluginVersion>;
}

/// 空台账
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyLedger;

impl PluginLedger for EmptyLedger {
    fn installed_version(&self, _id: &PluginId) -> Option<PluginVersion> {
        None
    }
}

impl PluginLedger for HashMap<PluginId, PluginVersion> {
    fn installed_version(&self, id: &PluginId) -> Option<PluginVersion> {
        self.get(id).cloned()
    }
}

impl<L: PluginLedger + ?Sized> PluginLedger for Arc<L> {
    fn installed_version(&self, id: &PluginId) -> Option<PluginVersion> {
        (**self).installed_version(id)
    }
}

/// 按顺序查询多个台账，取第一个命中的版本
#[derive(Clone, Default)]
pub struct LayeredLedger {
    layers: Vec<Arc<dyn PluginLedger>>,
}

impl LayeredLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, ledger: Arc<dyn PluginLedger>) -> Self {
        self.layers.push(ledger);
        self
    }
}

impl PluginLedger for LayeredLedger {
    fn installed_version(&self, id: &PluginId) -> Option<PluginVersion> {
        self.layers
            .iter()
            .find_map(|layer| layer.installed_version(id))
    }
}

/// 待排序的插件条目
///
/// `payload` 由调用方携带，排序后原样返回
#[derive(Debug, Clone)]
pub struct SortableEntry<T> {
    pub descriptor: Arc<PluginDescriptor>,
    pub location: PluginLocation,
    pub payload: T,
}

impl<T> SortableEntry<T> {
    pub fn new(descriptor: Arc<PluginDescriptor>, location: PluginLocation, payload: T) -> Self {
        Self {
            descriptor,
            location,
            payload,
        }
    }

    pub fn id(&self) -> &PluginId {
        &self.descriptor.id
    }

    pub fn version(&self) -> &PluginVersion {
        &self.descriptor.version
    }

    pub fn priority(&self) -> i32 {
        self.descriptor.priority
    }
}

/// 本批次中比台账版本更新的插件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeedUpgrade {
    pub id: PluginId,
    pub installed: PluginVersion,
    pub incoming: PluginVersion,
}

/// 依赖检查结果
#[derive(Debug)]
pub struct DependencyCheckResult<T> {
    /// 依赖在前的加载顺序
    pub result: Vec<SortableEntry<T>>,
    pub need_upgrade: Vec<NeedUpgrade>,
}

impl<T> DependencyCheckResult<T> {
    pub fn ordered_ids(&self) -> Vec<PluginId> {
        self.result.iter().map(|e| e.id().clone()).collect()
    }

    pub fn needs_upgrade(&self, id: &PluginId) -> bool {
        self.need_upgrade.iter().any(|u| &u.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    InProgress,
    Done,
}

/// 单次解析的工作集
struct Walk<'a, T> {
    entries: &'a [SortableEntry<T>],
    index: &'a HashMap<PluginId, usize>,
    states: Vec<VisitState>,
    stack: Vec<usize>,
    order: Vec<usize>,
}

/// 依赖检查器
pub struct DependencyChecker<'a> {
    ledger: &'a dyn PluginLedger,
}

impl<'a> DependencyChecker<'a> {
    pub fn new(ledger: &'a dyn PluginLedger) -> Self {
        Self { ledger }
    }

    /// 计算加载顺序
    ///
    /// 同一 id 出现多次时保留排序后的第一个；任何依赖错误都使整批失败
    pub fn determine_load_order<T>(
        &self,
        mut entries: Vec<SortableEntry<T>>,
    ) -> Result<DependencyCheckResult<T>, ResolveError> {
        // 同优先级同 id 时新版本在前，其后按位置与原始拼写排定全序
        entries.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.id().cmp(b.id()))
                .then_with(|| b.version().cmp(a.version()))
                .then_with(|| a.location.to_string().cmp(&b.location.to_string()))
                .then_with(|| a.id().as_str().cmp(b.id().as_str()))
        });

        let mut index: HashMap<PluginId, usize> = HashMap::with_capacity(entries.len());
        let mut unique = Vec::with_capacity(entries.len());
        for entry in entries {
            if index.contains_key(entry.id()) {
                warn!(
                    "[依赖检查] 插件 id 重复，忽略后出现的条目: {} ({})",
                    entry.id(),
                    entry.location
                );
                continue;
            }
            index.insert(entry.id().clone(), unique.len());
            unique.push(entry);
        }

        let mut walk = Walk {
            entries: &unique,
            index: &index,
            states: vec![VisitState::Unvisited; unique.len()],
            stack: Vec::new(),
            order: Vec::with_capacity(unique.len()),
        };
        for i in 0..unique.len() {
            if walk.states[i] == VisitState::Unvisited {
                self.visit(&mut walk, i)?;
            }
        }
        let order = walk.order;

        let need_upgrade: Vec<NeedUpgrade> = order
            .iter()
            .filter_map(|&i| {
                let entry = &unique[i];
                let installed = self.ledger.installed_version(entry.id())?;
                (installed < *entry.version()).then(|| NeedUpgrade {
                    id: entry.id().clone(),
                    installed,
                    incoming: entry.version().clone(),
                })
            })
            .collect();

        let mut slots: Vec<Option<SortableEntry<T>>> = unique.into_iter().map(Some).collect();
        let result: Vec<SortableEntry<T>> =
            order.iter().filter_map(|&i| slots[i].take()).collect();

        debug!(
            "[依赖检查] 解析完成: {} 个插件，{} 个需要升级",
            result.len(),
            need_upgrade.len()
        );

        Ok(DependencyCheckResult {
            result,
            need_upgrade,
        })
    }

    fn visit<T>(&self, walk: &mut Walk<'_, T>, i: usize) -> Result<(), ResolveError> {
        walk.states[i] = VisitState::InProgress;
        walk.stack.push(i);

        let entries = walk.entries;
        let entry = &entries[i];
        for dep in &entry.descriptor.dependencies {
            match walk.index.get(&dep.target_id).copied() {
                Some(j) => {
                    check_version(entry.id(), dep, entries[j].version())?;
                    match walk.states[j] {
                        VisitState::InProgress => {
                            let start = walk.stack.iter().position(|&k| k == j).unwrap_or(0);
                            let mut cycle: Vec<PluginId> = walk.stack[start..]
                                .iter()
                                .map(|&k| entries[k].id().clone())
                                .collect();
                            cycle.push(entries[j].id().clone());
                            return Err(ResolveError::CycleDetected { cycle });
                        }
                        VisitState::Unvisited => self.visit(walk, j)?,
                        VisitState::Done => {}
                    }
                }
                None => match self.ledger.installed_version(&dep.target_id) {
                    Some(installed) => check_version(entry.id(), dep, &installed)?,
                    None => {
                        return Err(ResolveError::DependencyNotFound {
                            plugin: entry.id().clone(),
                            dependency: dep.target_id.clone(),
                        })
                    }
                },
            }
        }

        walk.stack.pop();
        walk.states[i] = VisitState::Done;
        walk.order.push(i);
        Ok(())
    }
}

fn check_version(
    plugin: &PluginId,
    dep: &DependencyConstraint,
    actual: &PluginVersion,
) -> Result<(), ResolveError> {
    if dep.is_satisfied_by(actual) {
        return Ok(());
    }
    Err(ResolveError::VersionNotSatisfied {
        plugin: plugin.clone(),
        dependency: dep.target_id.clone(),
        comparator: dep.comparator,
        required: dep.required_version.clone(),
        actual: actual.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn descriptor(id: &str, version: &str, priority: i32, deps: &[&str]) -> Arc<PluginDescriptor> {
        Arc::new(PluginDescriptor {
            id: PluginId::new(id),
            name: id.to_string(),
            version: PluginVersion::parse(version).unwrap(),
            priority,
            description: String::new(),
            author: None,
            dependencies: deps
                .iter()
                .map(|d| DependencyConstraint::parse(d).unwrap())
                .collect(),
            binary_module: format!("{id}.so"),
            entry_point: "create_plugin".to_string(),
            min_host_version: None,
        })
    }

    fn entry(id: &str, version: &str, priority: i32, deps: &[&str]) -> SortableEntry<()> {
        SortableEntry::new(
            descriptor(id, version, priority, deps),
            PluginLocation::Local(PathBuf::from(format!("/plugins/{id}"))),
            (),
        )
    }

    fn ids(result: &DependencyCheckResult<()>) -> Vec<String> {
        result.result.iter().map(|e| e.id().to_string()).collect()
    }

    #[test]
    fn test_dependency_loaded_first() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let result = checker
            .determine_load_order(vec![
                entry("A", "1.0.0", 0, &[]),
                entry("B", "1.0.0", 0, &["A>=1.0.0"]),
            ])
            .unwrap();
        assert_eq!(ids(&result), vec!["A", "B"]);
    }

    #[test]
    fn test_dependency_overrides_priority() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let result = checker
            .determine_load_order(vec![
                entry("B", "1.0.0", 0, &["A>=1.0.0"]),
                entry("A", "1.0.0", 10, &[]),
            ])
            .unwrap();
        assert_eq!(ids(&result), vec!["A", "B"], "依赖必须排在依赖方之前");
    }

    #[test]
    fn test_missing_dependency_fails_batch() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let err = checker
            .determine_load_order(vec![entry("B", "1.0.0", 0, &["X"])])
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::DependencyNotFound {
                plugin: PluginId::new("B"),
                dependency: PluginId::new("X"),
            }
        );
        assert!(err.to_string().contains("X"));
    }

    #[test]
    fn test_version_not_satisfied() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let err = checker
            .determine_load_order(vec![
                entry("A", "1.0.0", 0, &[]),
                entry("B", "1.0.0", 0, &["A>=2.0.0"]),
            ])
            .unwrap_err();
        match err {
            ResolveError::VersionNotSatisfied {
                dependency,
                required,
                actual,
                ..
            } => {
                assert_eq!(dependency, PluginId::new("A"));
                assert_eq!(required, PluginVersion::new(2, 0, 0));
                assert_eq!(actual, PluginVersion::new(1, 0, 0));
            }
            other => panic!("期望版本不满足错误，实际: {other:?}"),
        }
    }

    #[test]
    fn test_same_and_lesser_comparators_in_batch() {
        let checker = DependencyChecker::new(&EmptyLedger);
        assert!(checker
            .determine_load_order(vec![
                entry("A", "1.0.0", 0, &[]),
                entry("B", "1.0.0", 0, &["A==1.0.0"]),
                entry("C", "1.0.0", 0, &["A<=1.5.0"]),
            ])
            .is_ok());

        assert!(checker
            .determine_load_order(vec![
                entry("A", "2.0.0", 0, &[]),
                entry("C", "1.0.0", 0, &["A<=1.5.0"]),
            ])
            .is_err());
    }

    #[test]
    fn test_priority_then_id_ordering() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let result = checker
            .determine_load_order(vec![
                entry("zeta", "1.0.0", 1, &[]),
                entry("Beta", "1.0.0", 0, &[]),
                entry("alpha", "1.0.0", 0, &[]),
                entry("first", "1.0.0", -5, &[]),
            ])
            .unwrap();
        assert_eq!(ids(&result), vec!["first", "alpha", "Beta", "zeta"]);
    }

    #[test]
    fn test_cycle_detected_regardless_of_priority() {
        let checker = DependencyChecker::new(&EmptyLedger);
        for (pa, pb) in [(0, 0), (5, -5), (-5, 5)] {
            let err = checker
                .determine_load_order(vec![
                    entry("A", "1.0.0", pa, &["B"]),
                    entry("B", "1.0.0", pb, &["A"]),
                ])
                .unwrap_err();
            match err {
                ResolveError::CycleDetected { cycle } => {
                    assert_eq!(cycle.len(), 3);
                    assert_eq!(cycle.first(), cycle.last(), "环路径首尾应相同");
                }
                other => panic!("期望循环依赖错误，实际: {other:?}"),
            }
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let err = checker
            .determine_load_order(vec![entry("A", "1.0.0", 0, &["a"])])
            .unwrap_err();
        assert!(matches!(err, ResolveError::CycleDetected { .. }));
        assert!(err.to_string().contains("A -> A"));
    }

    #[test]
    fn test_ledger_fallback_and_need_upgrade() {
        let mut ledger: HashMap<PluginId, PluginVersion> = HashMap::new();
        ledger.insert(PluginId::new("A"), PluginVersion::new(1, 0, 0));
        ledger.insert(PluginId::new("core"), PluginVersion::new(3, 0, 0));
        let checker = DependencyChecker::new(&ledger);

        let result = checker
            .determine_load_order(vec![
                entry("a", "1.2.0", 0, &[]),
                entry("B", "1.0.0", 0, &["core>=2.0"]),
            ])
            .unwrap();

        assert_eq!(ids(&result), vec!["a", "B"]);
        assert_eq!(
            result.need_upgrade,
            vec![NeedUpgrade {
                id: PluginId::new("A"),
                installed: PluginVersion::new(1, 0, 0),
                incoming: PluginVersion::new(1, 2, 0),
            }]
        );
        assert!(result.needs_upgrade(&PluginId::new("A")));
        assert!(!result.needs_upgrade(&PluginId::new("B")));
    }

    #[test]
    fn test_batch_entry_takes_precedence_over_ledger() {
        let mut ledger: HashMap<PluginId, PluginVersion> = HashMap::new();
        ledger.insert(PluginId::new("A"), PluginVersion::new(1, 0, 0));
        let checker = DependencyChecker::new(&ledger);

        let result = checker.determine_load_order(vec![
            entry("A", "2.0.0", 0, &[]),
            entry("B", "1.0.0", 0, &["A>=2.0"]),
        ]);
        assert!(result.is_ok(), "本批次中的新版本应优先于台账版本");
    }

    #[test]
    fn test_duplicate_ids_first_wins() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let result = checker
            .determine_load_order(vec![
                entry("dup", "2.0.0", 5, &[]),
                entry("DUP", "1.0.0", 0, &[]),
            ])
            .unwrap();
        assert_eq!(result.result.len(), 1);
        assert_eq!(*result.result[0].version(), PluginVersion::new(1, 0, 0));
    }

    #[test]
    fn test_duplicate_ids_same_priority_independent_of_input_order() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let forward = checker
            .determine_load_order(vec![entry("dup", "2.0.0", 0, &[]), entry("DUP", "1.0.0", 0, &[])])
            .unwrap();
        let reversed = checker
            .determine_load_order(vec![entry("DUP", "1.0.0", 0, &[]), entry("dup", "2.0.0", 0, &[])])
            .unwrap();

        assert_eq!(forward.result.len(), 1);
        assert_eq!(reversed.result.len(), 1);
        assert_eq!(*forward.result[0].version(), PluginVersion::new(2, 0, 0), "同优先级时应保留新版本");
        assert_eq!(*reversed.result[0].version(), PluginVersion::new(2, 0, 0), "结果不应依赖输入顺序");
        assert_eq!(forward.result[0].location, reversed.result[0].location);
    }

    #[test]
    fn test_duplicate_same_version_broken_by_location() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let at = |path: &str| {
            SortableEntry::new(
                descriptor("dup", "1.0.0", 0, &[]),
                PluginLocation::Local(PathBuf::from(path)),
                (),
            )
        };
        let forward = checker.determine_load_order(vec![at("/b/dup"), at("/a/dup")]).unwrap();
        let reversed = checker.determine_load_order(vec![at("/a/dup"), at("/b/dup")]).unwrap();
        assert_eq!(forward.result[0].location, PluginLocation::Local(PathBuf::from("/a/dup")));
        assert_eq!(reversed.result[0].location, PluginLocation::Local(PathBuf::from("/a/dup")));
    }

    #[test]
    fn test_payload_travels_with_entry() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let entries = vec![
            SortableEntry::new(descriptor("B", "1.0.0", 0, &["A"]), PluginLocation::Remote("https://x/b.zip".into()), 7usize),
            SortableEntry::new(descriptor("A", "1.0.0", 0, &[]), PluginLocation::Remote("https://x/a.zip".into()), 3usize),
        ];
        let result = checker.determine_load_order(entries).unwrap();
        let payloads: Vec<usize> = result.result.iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![3, 7]);
    }

    #[test]
    fn test_empty_batch() {
        let checker = DependencyChecker::new(&EmptyLedger);
        let result = checker.determine_load_order(Vec::<SortableEntry<()>>::new()).unwrap();
        assert!(result.result.is_empty());
        assert!(result.need_upgrade.is_empty());
    }

    #[test]
    fn test_layered_ledger_first_hit_wins() {
        let live: HashMap<PluginId, PluginVersion> =
            [(PluginId::new("core"), PluginVersion::new(2, 0, 0))].into();
        let persisted: HashMap<PluginId, PluginVersion> = [
            (PluginId::new("core"), PluginVersion::new(1, 0, 0)),
            (PluginId::new("extra"), PluginVersion::new(0, 3, 0)),
        ]
        .into();
        let ledger = LayeredLedger::new()
            .with_layer(Arc::new(live))
            .with_layer(Arc::new(persisted));

        assert_eq!(
            ledger.installed_version(&PluginId::new("CORE")),
            Some(PluginVersion::new(2, 0, 0))
        );
        assert_eq!(
            ledger.installed_version(&PluginId::new("extra")),
            Some(PluginVersion::new(0, 3, 0))
        );
        assert_eq!(ledger.installed_version(&PluginId::new("none")), None);
    }

    /// 生成无环依赖图：第 i 个插件只能依赖编号更小的插件
    fn arb_dag() -> impl Strategy<Value = Vec<(i32, Vec<usize>)>> {
        (1usize..10).prop_flat_map(|n| {
            (
                prop::collection::vec(-3i32..3, n),
                prop::collection::vec(prop::collection::vec(any::<bool>(), n), n),
            )
                .prop_map(move |(priorities, matrix)| {
                    (0..n)
                        .map(|i| {
                            let deps = (0..i).filter(|&j| matrix[i][j]).collect();
                            (priorities[i], deps)
                        })
                        .collect()
                })
        })
    }

    fn build_entries(graph: &[(i32, Vec<usize>)]) -> Vec<SortableEntry<()>> {
        graph
            .iter()
            .enumerate()
            .map(|(i, (priority, deps))| {
                let dep_names: Vec<String> = deps.iter().map(|j| format!("p{j}")).collect();
                let dep_refs: Vec<&str> = dep_names.iter().map(String::as_str).collect();
                entry(&format!("p{i}"), "1.0.0", *priority, &dep_refs)
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// 任意无环图：每个依赖都排在依赖方之前，且结果与输入顺序无关
        #[test]
        fn load_order_respects_dependencies(graph in arb_dag(), seed in any::<u64>()) {
            let checker = DependencyChecker::new(&EmptyLedger);

            let entries = build_entries(&graph);
            let result = checker.determine_load_order(entries).unwrap();
            let order = ids(&result);
            prop_assert_eq!(order.len(), graph.len());

            let position: HashMap<String, usize> =
                order.iter().enumerate().map(|(pos, id)| (id.clone(), pos)).collect();
            for (i, (_, deps)) in graph.iter().enumerate() {
                for j in deps {
                    let dependency = format!("p{}", j);
                    let dependent = format!("p{}", i);
                    prop_assert!(position[&dependency] < position[&dependent]);
                }
            }

            let mut shuffled = build_entries(&graph);
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();
            let again = checker.determine_load_order(shuffled).unwrap();
            prop_assert_eq!(order, ids(&again), "相同输入集合必须得到相同顺序");
        }
    }
}
