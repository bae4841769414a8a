mod common;

use std::time::Duration;

use heddle_core::domain::{
    CommitManifest, EventFilter, NewIteration, NewTask, RunStatus, TaskId, TaskStatus,
    TransitionOptions,
};

const TTL: Duration = Duration::from_secs(60);

fn id(s: &str) -> TaskId {
    TaskId::from(s)
}

#[test]
fn dependent_task_is_dispatched_after_its_dependency_is_done() {
    let clock = common::fixed_clock();
    let o = common::in_memory(&clock);
    o.create_task(NewTask::new("t1", "first").with_priority(0)).unwrap();
    o.create_task(NewTask::new("t2", "second")).unwrap();
    o.block(&id("t2"), &id("t1")).unwrap();

    let first = o.dispatch(&["w1"], 1, TTL).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].task_id(), &id("t1"));
    assert_eq!(first[0].worker_id, "w1");
    assert_eq!(o.get_task(&id("t1")).unwrap().task.status, TaskStatus::Running);

    o.transition(&id("t1"), TaskStatus::Done, TransitionOptions::default())
        .unwrap();

    let second = o.dispatch(&["w1"], 1, TTL).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].task_id(), &id("t2"));
    assert_eq!(o.get_task(&id("t2")).unwrap().task.status, TaskStatus::Running);
}

#[test]
fn ready_order_is_priority_then_creation_then_id() {
    let clock = common::fixed_clock();
    let o = common::in_memory(&clock);
    o.create_task(NewTask::new("b", "low").with_priority(2)).unwrap();
    o.create_task(NewTask::new("z", "same time")).unwrap();
    o.create_task(NewTask::new("a", "same time")).unwrap();
    clock.advance(chrono::Duration::seconds(1));
    o.create_task(NewTask::new("c", "later")).unwrap();
    o.create_task(NewTask::new("u", "urgent").with_priority(0)).unwrap();

    let order: Vec<_> = o
        .dispatch(&["w1", "w2", "w3", "w4", "w5"], 5, TTL)
        .unwrap()
        .into_iter()
        .map(|d| d.task.id.as_str().to_string())
        .collect();
    assert_eq!(order, vec!["u", "a", "z", "c", "b"]);
}

#[test]
fn full_task_lifecycle_through_loop_and_commit() {
    let clock = common::fixed_clock();
    let o = common::in_memory(&clock);
    o.create_task(NewTask::new("t1", "implement parser")).unwrap();
    let dispatched = o.dispatch(&["w1"], 1, TTL).unwrap();
    assert_eq!(dispatched.len(), 1);

    assert!(o
        .claim_path_lease(&id("t1"), "src/parser.rs", "w1", TTL)
        .unwrap());

    let run = o.start_loop(&id("t1"), None).unwrap();
    let retry = o
        .record_iteration(
            &NewIteration::new(run.id, "t1", 1)
                .gate("lint", true)
                .gate("unit", false)
                .failure("hook failed on pre-commit"),
        )
        .unwrap();
    assert!(retry.retry_delay().is_some());
    o.record_iteration(
        &NewIteration::new(run.id, "t1", 2)
            .gate("lint", true)
            .gate("unit", true),
    )
    .unwrap();
    assert_eq!(o.get_run(run.id).unwrap().status, RunStatus::Completed);

    o.enqueue_commit(
        &id("t1"),
        "parser",
        &CommitManifest::new(["src/parser.rs"]).with_revisions("r7", "r7"),
    )
    .unwrap();
    assert!(o.process_commit("w1", "c0ffee", &id("t1")).unwrap().is_committed());

    assert!(o.release_path_lease(&id("t1"), "src/parser.rs", "w1").unwrap());
    o.transition(
        &id("t1"),
        TaskStatus::Done,
        TransitionOptions::expecting(TaskStatus::Running),
    )
    .unwrap();
    assert!(o.release_task_lease(&id("t1"), "w1").unwrap());

    let types: Vec<_> = o
        .list_events(&EventFilter::for_task("t1"))
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            "task.created",
            "task.dispatched",
            "lease.claimed",
            "loop.started",
            "loop.iteration",
            "loop.iteration",
            "commit.enqueued",
            "commit.committed",
            "lease.released",
            "task.transitioned",
            "lease.released",
        ]
    );

    let progress = o.progress().unwrap();
    assert_eq!((progress.total, progress.completed), (1, 1));
    let board = o.board().unwrap();
    assert_eq!(board.task_leases, 0);
    assert_eq!(board.queued_commits, 0);
}

#[test]
fn replay_pages_through_the_whole_log() {
    let clock = common::fixed_clock();
    let o = common::in_memory(&clock);
    for i in 0..7 {
        o.create_task(NewTask::new(format!("t{i}"), "x")).unwrap();
    }

    let mut cursor = None;
    let mut seen = Vec::new();
    loop {
        let page = o.replay_events(cursor, 3).unwrap();
        if page.is_empty() {
            break;
        }
        cursor = page.last().map(|e| e.id);
        seen.extend(page.into_iter().map(|e| e.task_id));
    }
    let expected: Vec<_> = (0..7).map(|i| id(&format!("t{i}"))).collect();
    assert_eq!(seen, expected);
}
