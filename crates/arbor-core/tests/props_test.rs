//! Property-based tests: random flat dependency DAGs with failing nodes
//! must preserve the lifecycle invariants.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;

use arbor_core::{Task, TaskBuilder, TaskState};
use arbor_test_utils::{StateRecorder, TransitionRecord, run_test_loop, settle};

#[derive(Debug, Clone)]
struct NodeSpec {
    deps: Vec<usize>,
    fails: bool,
}

fn tree_strategy() -> impl Strategy<Value = Vec<NodeSpec>> {
    prop::collection::vec(
        (prop::collection::vec(any::<prop::sample::Index>(), 0..3), any::<bool>()),
        1..6,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, (indices, fails))| {
                let mut deps: Vec<usize> = indices
                    .into_iter()
                    .filter(|_| i > 0)
                    .map(|index| index.index(i))
                    .collect();
                deps.sort_unstable();
                deps.dedup();
                NodeSpec { deps, fails }
            })
            .collect()
    })
}

struct TreeRun {
    log: Vec<TransitionRecord>,
    finals: Vec<(String, TaskState)>,
}

fn run_tree(spec: Vec<NodeSpec>) -> TreeRun {
    let recorder: Rc<RefCell<Option<StateRecorder>>> = Rc::new(RefCell::new(None));
    let tasks: Rc<RefCell<Vec<Task>>> = Rc::new(RefCell::new(Vec::new()));

    let recorder_in = Rc::clone(&recorder);
    let tasks_in = Rc::clone(&tasks);
    run_test_loop(move |root| async move {
        *recorder_in.borrow_mut() = Some(StateRecorder::subscribe(&root));
        // Absorb child aborts so the whole tree gets to settle.
        root.set_error_handler(None, |_| async { Ok(()) });
        let mut spawned: Vec<Task> = Vec::new();
        for (i, node) in spec.iter().enumerate() {
            let fails = node.fails;
            let task = TaskBuilder::new()
                .name(format!("n{i}"))
                .on_run(move |_| async move {
                    if fails {
                        anyhow::bail!("boom");
                    }
                    Ok(())
                })
                .spawn()?;
            for dep in &node.deps {
                task.depends_on(&spawned[*dep])?;
            }
            spawned.push(task);
        }
        settle(50).await;
        tasks_in.borrow_mut().extend(spawned);
        Ok(())
    })
    .expect("shielded root should finish cleanly");

    let log = recorder.borrow().as_ref().unwrap().collect();
    let finals = tasks
        .borrow()
        .iter()
        .map(|task| (task.path(), task.state()))
        .collect();
    TreeRun { log, finals }
}

fn transitions_for<'a>(
    log: &'a [TransitionRecord],
    path: &str,
) -> Vec<&'a TransitionRecord> {
    log.iter().filter(|record| record.path == path).collect()
}

fn index_of(log: &[TransitionRecord], path: &str, state: TaskState) -> Option<usize> {
    log.iter().position(|r| r.path == path && r.state == state)
}

fn terminal_index(log: &[TransitionRecord], path: &str) -> Option<usize> {
    log.iter().position(|r| r.path == path && r.state.is_terminal())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn generated_trees_preserve_lifecycle_invariants(spec in tree_strategy()) {
        let run = run_tree(spec.clone());

        for (i, node) in spec.iter().enumerate() {
            let path = format!("n{i}");
            let (_, final_state) = run
                .finals
                .iter()
                .find(|(p, _)| *p == path)
                .expect("every node was spawned");

            // Every task settles.
            prop_assert!(final_state.is_terminal(), "{path} ended in {final_state}");

            // Its observed transition sequence is a legal path.
            let transitions = transitions_for(&run.log, &path);
            prop_assert!(!transitions.is_empty(), "{path} emitted no transitions");
            prop_assert_eq!(transitions[0].previous, None);
            prop_assert_eq!(transitions[0].state, TaskState::Preparing);
            let mut terminal_seen = false;
            for pair in transitions.windows(2) {
                prop_assert_eq!(
                    pair[1].previous,
                    Some(pair[0].state),
                    "{}: transition gap",
                    &path
                );
            }
            for record in &transitions {
                if let Some(previous) = record.previous {
                    prop_assert!(
                        TaskState::is_valid_transition(previous, record.state),
                        "{}: illegal {} -> {}",
                        &path,
                        previous,
                        record.state
                    );
                }
                prop_assert!(!terminal_seen, "{}: transition after terminal state", &path);
                terminal_seen = record.state.is_terminal();
            }
            prop_assert_eq!(
                transitions.last().unwrap().state,
                *final_state,
                "{}: final state must match the last transition",
                &path
            );

            // Dependency edges: a node only runs after all of its
            // dependencies are done; a node with an unsettled dependency
            // never completes.
            for dep in &node.deps {
                let dep_path = format!("n{dep}");
                let dep_final = run
                    .finals
                    .iter()
                    .find(|(p, _)| *p == dep_path)
                    .map(|(_, s)| *s)
                    .unwrap();
                if *final_state == TaskState::Done {
                    prop_assert_eq!(
                        dep_final,
                        TaskState::Done,
                        "{} is done but its dependency {} is not",
                        &path,
                        &dep_path
                    );
                    let dep_done = terminal_index(&run.log, &dep_path).unwrap();
                    let started = index_of(&run.log, &path, TaskState::Running).unwrap();
                    prop_assert!(
                        dep_done < started,
                        "{} started before dependency {} settled",
                        &path,
                        &dep_path
                    );
                }
                if dep_final == TaskState::Failed && *final_state == TaskState::Done {
                    prop_assert!(false, "{} completed over a failed dependency", &path);
                }
            }
        }

        // The root settles last: no transition is recorded after its
        // terminal one.
        if let Some(root_terminal) = terminal_index(&run.log, "root") {
            prop_assert_eq!(root_terminal, run.log.len() - 1);
        }
    }
}
