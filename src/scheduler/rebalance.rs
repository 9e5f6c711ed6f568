//! Rebalancing plans.
//!
//! Planning is pure: it works on a snapshot of fixed loads and says
//! what to move. The manager applies the plan.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::common::GroupId;
use crate::common::ProcessorId;
use crate::common::TenantId;

#[derive(Debug, Clone, PartialEq)]
pub struct GroupLoad {
    pub id: GroupId,
    pub tenant: TenantId,
    pub load: f64,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorLoad {
    pub id: ProcessorId,
    pub isolated: bool,
    pub groups: Vec<GroupLoad>,
}

impl ProcessorLoad {
    pub fn load(&self) -> f64 {
        self.groups.iter().map(|g| g.load).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub group: GroupId,
    pub from: ProcessorId,
    pub to: ProcessorId,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FirstFitPlan {
    pub moves: Vec<Move>,
    /// Pulled groups no underloaded processor could take. They stay
    /// where they are.
    pub unplaced: Vec<GroupId>,
}

struct Item<'a> {
    group: &'a GroupLoad,
    from: ProcessorId,
}

struct Bin {
    id: ProcessorId,
    capacity: f64,
}

/// First-fit bin packing of groups pulled off processors above the
/// average load onto processors below it.
///
/// Nothing happens unless some processor is over `overload`.
/// Isolated processors take no part.
pub fn first_fit(processors: &[ProcessorLoad], overload: f64) -> FirstFitPlan {
    let normal: Vec<&ProcessorLoad> = processors.iter().filter(|p| !p.isolated).collect();
    if normal.len() < 2 || !normal.iter().any(|p| p.load() > overload) {
        return FirstFitPlan::default();
    }
    let total: f64 = normal.iter().map(|p| p.load()).sum();
    let desirable = total / normal.len() as f64;

    let mut items = Vec::new();
    let mut bins = Vec::new();
    for processor in &normal {
        let mut load = processor.load();
        if load > desirable {
            let mut groups: Vec<&GroupLoad> = processor.groups.iter().collect();
            groups.sort_by(|a, b| b.load.total_cmp(&a.load).then_with(|| a.id.cmp(&b.id)));
            for group in groups {
                if load <= desirable {
                    break;
                }
                load -= group.load;
                items.push(Item {
                    group,
                    from: processor.id,
                });
            }
        } else if load < desirable {
            bins.push(Bin {
                id: processor.id,
                capacity: desirable - load,
            });
        }
    }

    let mut plan = FirstFitPlan::default();
    let mut rest = Vec::new();
    for item in items {
        match bins.iter_mut().find(|bin| bin.capacity >= item.group.load) {
            Some(bin) => {
                bin.capacity -= item.group.load;
                plan.moves.push(Move {
                    group: item.group.id.clone(),
                    from: item.from,
                    to: bin.id,
                });
            }
            None => rest.push(item),
        }
    }
    for item in rest {
        match bins.iter_mut().find(|bin| bin.capacity > 0.0) {
            Some(bin) => {
                bin.capacity -= item.group.load;
                plan.moves.push(Move {
                    group: item.group.id.clone(),
                    from: item.from,
                    to: bin.id,
                });
            }
            None => plan.unplaced.push(item.group.id.clone()),
        }
    }
    plan
}

/// Fold `from` into `into`, a group of the same tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub from: GroupId,
    pub into: GroupId,
    pub from_processor: ProcessorId,
    pub into_processor: ProcessorId,
}

/// Plan merges of split tenant groups off overloaded processors.
///
/// A group on a processor above `overload` is merged into a sibling
/// on the least loaded processor hosting one, as long as its own
/// processor stays at or above the midpoint target and the receiving
/// one does not go over it.
pub fn plan_group_merges(
    processors: &[ProcessorLoad],
    underload: f64,
    overload: f64,
    max_merges: usize,
) -> Vec<MergePlan> {
    let target = (underload + overload) / 2.0;
    let mut loads: BTreeMap<ProcessorId, f64> = processors
        .iter()
        .filter(|p| !p.isolated)
        .map(|p| (p.id, p.load()))
        .collect();
    let mut consumed: BTreeSet<&GroupId> = BTreeSet::new();
    let mut plans = Vec::new();

    let mut overloaded: Vec<&ProcessorLoad> = processors
        .iter()
        .filter(|p| !p.isolated && p.load() > overload)
        .collect();
    overloaded.sort_by(|a, b| b.load().total_cmp(&a.load()).then(a.id.cmp(&b.id)));

    for high in overloaded {
        let mut groups: Vec<&GroupLoad> = high.groups.iter().filter(|g| !g.running).collect();
        groups.sort_by(|a, b| b.load.total_cmp(&a.load).then_with(|| a.id.cmp(&b.id)));
        for group in groups {
            if plans.len() >= max_merges {
                return plans;
            }
            if consumed.contains(&group.id) {
                continue;
            }
            let sibling = processors
                .iter()
                .filter(|p| p.id != high.id && !p.isolated)
                .flat_map(|p| p.groups.iter().map(move |g| (p.id, g)))
                .filter(|(_, g)| g.tenant == group.tenant && g.id != group.id)
                .filter(|(_, g)| !consumed.contains(&g.id))
                .min_by(|a, b| loads[&a.0].total_cmp(&loads[&b.0]).then(a.0.cmp(&b.0)));
            let Some((low, sibling)) = sibling else {
                continue;
            };
            let (high_load, low_load) = (loads[&high.id], loads[&low]);
            if high_load - group.load >= target && low_load + group.load <= target {
                loads.insert(high.id, high_load - group.load);
                loads.insert(low, low_load + group.load);
                consumed.insert(&group.id);
                plans.push(MergePlan {
                    from: group.id.clone(),
                    into: sibling.id.clone(),
                    from_processor: high.id,
                    into_processor: low,
                });
            }
        }
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn group(id: &str, tenant: &str, load: f64) -> GroupLoad {
        GroupLoad {
            id: id.into(),
            tenant: tenant.into(),
            load,
            running: false,
        }
    }

    fn processor(id: usize, groups: Vec<GroupLoad>) -> ProcessorLoad {
        ProcessorLoad {
            id: ProcessorId(id),
            isolated: false,
            groups,
        }
    }

    fn apply(processors: &[ProcessorLoad], moves: &[Move]) -> Vec<ProcessorLoad> {
        let mut out: Vec<ProcessorLoad> = processors.to_vec();
        for mv in moves {
            let from = out.iter_mut().find(|p| p.id == mv.from).unwrap();
            let pos = from.groups.iter().position(|g| g.id == mv.group).unwrap();
            let g = from.groups.remove(pos);
            out.iter_mut().find(|p| p.id == mv.to).unwrap().groups.push(g);
        }
        out
    }

    #[test]
    fn balanced_processors_are_left_alone() {
        let procs = vec![
            processor(0, vec![group("a", "t", 0.3)]),
            processor(1, vec![group("b", "t", 0.3)]),
        ];
        assert_eq!(first_fit(&procs, 0.8), FirstFitPlan::default());
    }

    #[test]
    fn overloaded_processor_sheds_to_idle_one() {
        let procs = vec![
            processor(0, vec![group("a", "t", 0.5), group("b", "t", 0.4)]),
            processor(1, vec![]),
        ];
        let plan = first_fit(&procs, 0.8);
        assert_eq!(
            plan.moves,
            vec![Move {
                group: "a".into(),
                from: ProcessorId(0),
                to: ProcessorId(1),
            }]
        );
        assert!(plan.unplaced.is_empty());
    }

    #[test]
    fn isolated_processors_are_not_bins() {
        let mut idle = processor(1, vec![]);
        idle.isolated = true;
        let procs = vec![
            processor(0, vec![group("a", "t", 0.9)]),
            idle,
            processor(2, vec![group("b", "t", 0.1)]),
        ];
        let plan = first_fit(&procs, 0.8);
        assert!(plan.moves.iter().all(|m| m.to != ProcessorId(1)));
    }

    #[test]
    fn second_pass_overfills_a_bin_with_room() {
        let procs = vec![
            processor(0, vec![group("big", "t", 1.0)]),
            processor(1, vec![group("x", "t", 0.2)]),
        ];
        // Average 0.6: the only bin has 0.4 of room, less than the item.
        let plan = first_fit(&procs, 0.8);
        assert_eq!(plan.moves.len(), 1);
        assert_eq!(plan.moves[0].to, ProcessorId(1));
    }

    #[test]
    fn merges_split_tenant_into_lighter_sibling() {
        let procs = vec![
            processor(0, vec![group("hot", "t1", 0.2), group("other", "t2", 0.8)]),
            processor(1, vec![group("cold", "t1", 0.1)]),
        ];
        let plans = plan_group_merges(&procs, 0.4, 0.8, 4);
        assert_eq!(
            plans,
            vec![MergePlan {
                from: "hot".into(),
                into: "cold".into(),
                from_processor: ProcessorId(0),
                into_processor: ProcessorId(1),
            }]
        );
    }

    #[test]
    fn merge_respects_the_target() {
        // Moving 0.5 would push the receiver to 0.8 > 0.6.
        let procs = vec![
            processor(0, vec![group("hot", "t1", 0.5), group("other", "t2", 0.6)]),
            processor(1, vec![group("cold", "t1", 0.3)]),
        ];
        assert!(plan_group_merges(&procs, 0.4, 0.8, 4).is_empty());
    }

    #[test]
    fn merges_are_capped_per_round() {
        let procs = vec![
            processor(
                0,
                vec![
                    group("a1", "a", 0.1),
                    group("b1", "b", 0.1),
                    group("big", "z", 0.8),
                ],
            ),
            processor(1, vec![group("a2", "a", 0.0), group("b2", "b", 0.0)]),
        ];
        assert_eq!(plan_group_merges(&procs, 0.4, 0.8, 1).len(), 1);
        assert_eq!(plan_group_merges(&procs, 0.4, 0.8, 5).len(), 2);
    }

    #[test]
    fn running_groups_are_not_merged() {
        let mut hot = group("hot", "t1", 0.2);
        hot.running = true;
        let procs = vec![
            processor(0, vec![hot, group("other", "t2", 0.8)]),
            processor(1, vec![group("cold", "t1", 0.1)]),
        ];
        assert!(plan_group_merges(&procs, 0.4, 0.8, 4).is_empty());
    }

    fn arb_processors() -> impl Strategy<Value = Vec<ProcessorLoad>> {
        prop::collection::vec(prop::collection::vec(0.0f64..1.0, 0..6), 2..6).prop_map(|procs| {
            let mut n = 0;
            procs
                .into_iter()
                .enumerate()
                .map(|(pid, loads)| {
                    let groups = loads
                        .into_iter()
                        .map(|load| {
                            n += 1;
                            group(&format!("g{n}"), "t", load)
                        })
                        .collect();
                    processor(pid, groups)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn first_fit_conserves_load_and_groups(procs in arb_processors()) {
            let plan = first_fit(&procs, 0.8);
            let after = apply(&procs, &plan.moves);

            let before_total: f64 = procs.iter().map(ProcessorLoad::load).sum();
            let after_total: f64 = after.iter().map(ProcessorLoad::load).sum();
            prop_assert!((before_total - after_total).abs() < 1e-9);

            let mut seen: HashMap<GroupId, usize> = HashMap::new();
            for g in after.iter().flat_map(|p| p.groups.iter()) {
                *seen.entry(g.id.clone()).or_default() += 1;
            }
            let expected: usize = procs.iter().map(|p| p.groups.len()).sum();
            prop_assert_eq!(seen.len(), expected);
            prop_assert!(seen.values().all(|n| *n == 1));

            for mv in &plan.moves {
                prop_assert_ne!(mv.from, mv.to);
            }
        }
    }
}
