// tests/scheduler_properties.rs

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use statdag::dag::{QueryDefinition, QueryOutcome, Scheduler};
use statdag::types::QueryStatus;
use uuid::Uuid;

/// Random acyclic query sets: query N may only depend on queries 0..N-1.
fn dag_strategy(max_queries: usize) -> impl Strategy<Value = Vec<QueryDefinition>> {
    (1..=max_queries).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..n), n).prop_map(
            move |raw_deps| {
                raw_deps
                    .into_iter()
                    .enumerate()
                    .map(|(i, potential)| {
                        let mut def = QueryDefinition::new(format!("q{i}"), format!("select {i}"));
                        if i > 0 {
                            let deps: HashSet<usize> = potential.into_iter().map(|d| d % i).collect();
                            for dep in deps {
                                def = def.after(format!("q{dep}"));
                            }
                        }
                        def
                    })
                    .collect()
            },
        )
    })
}

fn upstream_of(defs: &[QueryDefinition], name: &str) -> HashSet<String> {
    let by_name: HashMap<&str, &QueryDefinition> =
        defs.iter().map(|d| (d.name.as_str(), d)).collect();
    let mut seen = HashSet::new();
    let mut stack = vec![name.to_string()];
    while let Some(current) = stack.pop() {
        for dep in &by_name[current.as_str()].dependencies {
            if seen.insert(dep.clone()) {
                stack.push(dep.clone());
            }
        }
    }
    seen
}

proptest! {
    #[test]
    fn queries_only_run_after_their_dependencies_succeed(
        defs in dag_strategy(12),
        failing in proptest::collection::hash_set(0..12usize, 0..4),
    ) {
        let failing: HashSet<String> = failing.into_iter().map(|i| format!("q{i}")).collect();
        let mut scheduler = Scheduler::new(Uuid::new_v4(), &defs).unwrap();
        let mut dispatched = HashSet::new();

        for _ in 0..=defs.len() {
            let wave = scheduler.step_wave();
            if wave.newly_scheduled.is_empty() {
                break;
            }
            for query in &wave.newly_scheduled {
                for dep in scheduler.dependencies_of(&query.name) {
                    prop_assert_eq!(scheduler.status_of(dep), Some(QueryStatus::Success));
                }
                dispatched.insert(query.name.clone());
            }
            for query in wave.newly_scheduled {
                let outcome = if failing.contains(&query.name) {
                    QueryOutcome::Failed("injected".to_string())
                } else {
                    QueryOutcome::Success(vec![])
                };
                scheduler.step_completion(&query.name, outcome);
            }
        }

        prop_assert!(scheduler.is_finished());

        for def in &defs {
            let upstream = upstream_of(&defs, &def.name);
            let blocked = upstream.iter().any(|u| failing.contains(u));
            let status = scheduler.status_of(&def.name);

            if blocked {
                prop_assert!(!dispatched.contains(&def.name), "{} ran after a failed dependency", def.name);
                prop_assert_eq!(status, Some(QueryStatus::Error));
            } else if failing.contains(&def.name) {
                prop_assert_eq!(status, Some(QueryStatus::Error));
            } else {
                prop_assert_eq!(status, Some(QueryStatus::Success));
            }
        }
    }
}
