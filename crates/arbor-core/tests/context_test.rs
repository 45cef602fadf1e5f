//! Integration tests for hierarchical context variables.

use std::cell::RefCell;
use std::rc::Rc;

use arbor_core::{ContextVar, TaskBuilder};
use arbor_test_utils::{run_test_loop, settle};

#[test]
fn overrides_resolve_through_the_ancestor_chain() {
    let reads: Rc<RefCell<Vec<(String, u32)>>> = Rc::new(RefCell::new(Vec::new()));
    let var = Rc::new(ContextVar::with_default("depth", 0u32));

    let reads_in = Rc::clone(&reads);
    let var_in = Rc::clone(&var);
    run_test_loop(move |_root| async move {
        let var = var_in;
        let reads = reads_in;
        var.set(1); // override on the root
        let outer_var = Rc::clone(&var);
        let outer_reads = Rc::clone(&reads);
        TaskBuilder::new()
            .name("outer")
            .on_run(move |_| async move {
                let var = outer_var;
                let reads = outer_reads;
                reads.borrow_mut().push(("outer-before".into(), var.get().unwrap()));
                var.set(2); // override on "outer"
                reads.borrow_mut().push(("outer-after".into(), var.get().unwrap()));
                let inner_var = Rc::clone(&var);
                let inner_reads = Rc::clone(&reads);
                TaskBuilder::new()
                    .name("inner")
                    .on_run(move |_| async move {
                        inner_reads
                            .borrow_mut()
                            .push(("inner".into(), inner_var.get().unwrap()));
                        Ok(())
                    })
                    .spawn()?;
                Ok(())
            })
            .spawn()?;
        settle(10).await;
        reads.borrow_mut().push(("root".into(), var.get().unwrap()));
        Ok(())
    })
    .expect("loop should finish cleanly");

    assert_eq!(
        *reads.borrow(),
        vec![
            ("outer-before".to_string(), 1),
            ("outer-after".to_string(), 2),
            ("inner".to_string(), 2),
            ("root".to_string(), 1),
        ]
    );
}

#[test]
fn reads_fall_back_to_the_default_without_overrides() {
    let reads: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let var = Rc::new(ContextVar::with_default("jobs", 4u32));

    let reads_in = Rc::clone(&reads);
    let var_in = Rc::clone(&var);
    run_test_loop(move |_root| async move {
        let reads = Rc::clone(&reads_in);
        let var = Rc::clone(&var_in);
        TaskBuilder::new()
            .name("worker")
            .on_run(move |_| async move {
                reads.borrow_mut().push(var.get().unwrap());
                Ok(())
            })
            .spawn()?;
        Ok(())
    })
    .expect("loop should finish cleanly");

    assert_eq!(*reads.borrow(), vec![4]);
}

#[test]
fn missing_variable_without_default_errors_inside_the_loop() {
    let outcomes: Rc<RefCell<Vec<bool>>> = Rc::new(RefCell::new(Vec::new()));
    let var: Rc<ContextVar<u32>> = Rc::new(ContextVar::new("unset"));

    let outcomes_in = Rc::clone(&outcomes);
    let var_in = Rc::clone(&var);
    run_test_loop(move |_root| async move {
        outcomes_in.borrow_mut().push(var_in.get().is_err());
        Ok(())
    })
    .expect("loop should finish cleanly");

    assert_eq!(*outcomes.borrow(), vec![true]);
}

#[test]
fn unset_removes_the_nearest_override_only() {
    let reads: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let var = Rc::new(ContextVar::with_default("level", 0u32));

    let reads_in = Rc::clone(&reads);
    let var_in = Rc::clone(&var);
    run_test_loop(move |_root| async move {
        let var = var_in;
        let reads = reads_in;
        var.set(1); // root override
        let worker_var = Rc::clone(&var);
        let worker_reads = Rc::clone(&reads);
        TaskBuilder::new()
            .name("worker")
            .on_run(move |_| async move {
                worker_var.set(2);
                worker_reads.borrow_mut().push(worker_var.get().unwrap());
                worker_var.unset().unwrap();
                worker_reads.borrow_mut().push(worker_var.get().unwrap());
                assert!(worker_var.unset().is_err(), "no override left on this task");
                Ok(())
            })
            .spawn()?;
        Ok(())
    })
    .expect("loop should finish cleanly");

    assert_eq!(*reads.borrow(), vec![2, 1], "unset falls back to the root override");
}

#[test]
fn bound_view_acts_as_the_target_task() {
    let reads: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    let var = Rc::new(ContextVar::with_default("slot", 0u32));

    let reads_in = Rc::clone(&reads);
    let var_in = Rc::clone(&var);
    run_test_loop(move |_root| async move {
        let var = var_in;
        let reads = Rc::clone(&reads_in);
        let worker_var = Rc::clone(&var);
        let worker = TaskBuilder::new()
            .name("worker")
            .on_run(move |_| async move {
                settle(5).await;
                reads.borrow_mut().push(worker_var.get().unwrap());
                Ok(())
            })
            .spawn()?;

        let view = var.bind(&worker);
        view.set(7);
        reads_in.borrow_mut().push(view.get().unwrap());
        settle(10).await;
        view.unset().unwrap();
        Ok(())
    })
    .expect("loop should finish cleanly");

    assert_eq!(
        *reads.borrow(),
        vec![7, 7],
        "the view writes land on the bound task and are visible inside it"
    );
}
