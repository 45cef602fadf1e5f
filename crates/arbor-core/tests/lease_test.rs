//! Integration tests for lease-gated admission.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use arbor_core::{LocalLeaseClient, Task, TaskBuilder, TaskState};
use arbor_test_utils::{ManualLeaseClient, run_test_loop, run_test_loop_with, settle};

#[test]
fn lease_gates_admission_until_granted() {
    let client = ManualLeaseClient::new();
    let states: Rc<RefCell<Vec<TaskState>>> = Rc::new(RefCell::new(Vec::new()));
    let release_states: Rc<RefCell<Vec<TaskState>>> = Rc::new(RefCell::new(Vec::new()));
    let worker_slot: Rc<RefCell<Option<Task>>> = Rc::new(RefCell::new(None));

    {
        let worker_slot = Rc::clone(&worker_slot);
        let release_states = Rc::clone(&release_states);
        client.on_release(move || {
            if let Some(worker) = worker_slot.borrow().as_ref() {
                release_states.borrow_mut().push(worker.state());
            }
        });
    }

    let client_in = client.clone();
    let states_in = Rc::clone(&states);
    let worker_in = Rc::clone(&worker_slot);
    run_test_loop_with(Some(Rc::new(client.clone())), move |_root| async move {
        let worker = TaskBuilder::new()
            .name("worker")
            .use_lease(true)
            .on_run(|_| async { Ok(()) })
            .spawn()?;
        *worker_in.borrow_mut() = Some(worker.clone());

        settle(10).await;
        states_in.borrow_mut().push(worker.state());

        client_in.grant_next();
        settle(10).await;
        states_in.borrow_mut().push(worker.state());
        Ok(())
    })
    .expect("loop should finish cleanly");

    assert_eq!(
        *states.borrow(),
        vec![TaskState::Pending, TaskState::Done],
        "the task must sit in pending until the lease is granted"
    );
    assert_eq!(client.granted(), 1);
    assert_eq!(client.released(), 1);
    assert_eq!(
        *release_states.borrow(),
        vec![TaskState::Running],
        "the lease is released while leaving running, before the done transition"
    );
}

#[test]
fn pool_capacity_serialises_lease_gated_tasks() {
    let max_active = Rc::new(Cell::new(0usize));
    let tasks: Rc<RefCell<Vec<Task>>> = Rc::new(RefCell::new(Vec::new()));

    let max_in = Rc::clone(&max_active);
    let tasks_in = Rc::clone(&tasks);
    let client: Rc<LocalLeaseClient> = Rc::new(LocalLeaseClient::with_capacity(1));
    run_test_loop_with(Some(client), move |_root| async move {
        let active = Rc::new(Cell::new(0usize));
        for name in ["first", "second", "third"] {
            let active = Rc::clone(&active);
            let max_active = Rc::clone(&max_in);
            let task = TaskBuilder::new()
                .name(name)
                .use_lease(true)
                .on_run(move |_| async move {
                    active.set(active.get() + 1);
                    max_active.set(max_active.get().max(active.get()));
                    settle(3).await;
                    active.set(active.get() - 1);
                    Ok(())
                })
                .spawn()?;
            tasks_in.borrow_mut().push(task);
        }
        Ok(())
    })
    .expect("loop should finish cleanly");

    assert_eq!(max_active.get(), 1, "one slot means one task body at a time");
    for task in tasks.borrow().iter() {
        assert!(task.is_done(), "task {task} should be done");
    }
}

#[test]
fn lease_flag_is_frozen_after_preparing() {
    let results: Rc<RefCell<Vec<Result<(), String>>>> = Rc::new(RefCell::new(Vec::new()));

    let results_in = Rc::clone(&results);
    run_test_loop(move |_root| async move {
        let results = Rc::clone(&results_in);
        TaskBuilder::new()
            .name("worker")
            .on_prepare({
                let results = Rc::clone(&results);
                move |task| async move {
                    // Still preparing: both directions are allowed.
                    results.borrow_mut().push(task.set_use_lease(true).map_err(|e| e.to_string()));
                    results.borrow_mut().push(task.set_use_lease(false).map_err(|e| e.to_string()));
                    Ok(())
                }
            })
            .on_run(move |task| async move {
                results.borrow_mut().push(task.set_use_lease(true).map_err(|e| e.to_string()));
                Ok(())
            })
            .spawn()?;
        Ok(())
    })
    .expect("loop should finish cleanly");

    let results = results.borrow();
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    let err = results[2].as_ref().unwrap_err();
    assert!(
        err.contains("cannot change lease usage"),
        "unexpected error: {err}"
    );
}

#[test]
fn lease_is_released_when_the_task_is_cancelled() {
    let client = ManualLeaseClient::new();
    let states: Rc<RefCell<Vec<TaskState>>> = Rc::new(RefCell::new(Vec::new()));

    let client_in = client.clone();
    let states_in = Rc::clone(&states);
    run_test_loop_with(Some(Rc::new(client.clone())), move |root| async move {
        root.set_error_handler(None, |_| async { Ok(()) });
        let worker = TaskBuilder::new()
            .name("worker")
            .use_lease(true)
            .on_run(|_| async {
                futures::future::pending::<()>().await;
                Ok(())
            })
            .spawn()?;
        settle(5).await;
        client_in.grant_next();
        settle(5).await;
        states_in.borrow_mut().push(worker.state());
        worker.cancel();
        states_in.borrow_mut().push(worker.state());
        Ok(())
    })
    .expect("loop should finish cleanly");

    assert_eq!(*states.borrow(), vec![TaskState::Running, TaskState::Cancelled]);
    assert_eq!(client.granted(), 1);
    assert_eq!(client.released(), 1, "cancellation must hand the lease back");
}
