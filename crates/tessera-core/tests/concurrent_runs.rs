//! Cancellation, timeouts and changes that land while cells are running.

mod common;

use std::time::Duration;

use common::{NAP, id, scheduler, value, wait_for};
use futures::StreamExt;
use tessera_core::{CellState, ErrorKind, SchedulerConfig, StateChange};

#[test]
fn test_cancel_running_cell() {
    let (sched, runner) = scheduler(SchedulerConfig::eager());
    sched.on_edit(id(1), "-> a").unwrap();
    sched.on_edit(id(2), "a -> b").unwrap();

    let report = std::thread::scope(|s| {
        let edit = s.spawn(|| sched.on_edit(id(1), "-> a slow").unwrap());
        wait_for(&sched, id(1), CellState::Running);
        assert!(sched.cancel(id(1)).unwrap());
        edit.join().unwrap().report.unwrap()
    });

    assert_eq!(report.executed(), vec![id(1)]);
    assert_eq!(report.error_kind(id(1)), Some(ErrorKind::Cancelled));
    assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Error);
    assert_eq!(sched.state_of(id(2)).unwrap(), CellState::Stale);
    assert_eq!(
        report.get(id(2)).and_then(|r| r.error.as_ref()).and_then(|e| e.origin),
        Some(id(1))
    );

    // The runner noticed and gave up; its failure must not replace the cancel
    runner.open_gate();
    assert_eq!(
        sched.last_error(id(1)).unwrap().map(|e| e.kind),
        Some(ErrorKind::Cancelled)
    );
}

#[test]
fn test_cancel_all_stops_whole_batch() {
    let (sched, _) = scheduler(SchedulerConfig::lazy().with_max_parallelism(2));
    sched.on_edit(id(1), "-> slow1").unwrap();
    sched.on_edit(id(2), "-> slow2").unwrap();

    let report = std::thread::scope(|s| {
        let run = s.spawn(|| sched.run(&[id(1), id(2)]).unwrap());
        wait_for(&sched, id(1), CellState::Running);
        wait_for(&sched, id(2), CellState::Running);
        assert_eq!(sched.cancel_all().unwrap(), vec![id(1), id(2)]);
        run.join().unwrap()
    });

    assert_eq!(report.batches(), vec![vec![id(1), id(2)]]);
    assert_eq!(report.error_kind(id(1)), Some(ErrorKind::Cancelled));
    assert_eq!(report.error_kind(id(2)), Some(ErrorKind::Cancelled));
}

#[test]
fn test_batch_wider_than_pool_waits_queued() {
    let (sched, runner) = scheduler(SchedulerConfig::lazy().with_max_parallelism(1));
    sched.on_edit(id(1), "-> slow1").unwrap();
    sched.on_edit(id(2), "-> slow2").unwrap();

    let report = std::thread::scope(|s| {
        let run = s.spawn(|| sched.run(&[id(1), id(2)]).unwrap());
        wait_for(&sched, id(1), CellState::Running);
        // No free worker yet
        assert_eq!(sched.state_of(id(2)).unwrap(), CellState::Queued);
        assert!(sched.cancel(id(2)).unwrap());
        runner.open_gate();
        run.join().unwrap()
    });

    assert_eq!(report.batches(), vec![vec![id(1), id(2)]]);
    assert_eq!(report.state_of(id(1)), Some(CellState::Idle));
    assert_eq!(report.error_kind(id(2)), Some(ErrorKind::Cancelled));
    assert_eq!(runner.calls(), vec![id(1)]);
}

#[test]
fn test_timeout_ignores_time_waiting_for_worker() {
    let config = SchedulerConfig::lazy()
        .with_max_parallelism(1)
        .with_cell_timeout(NAP * 5 / 2);
    let (sched, runner) = scheduler(config);
    for n in 1..=4 {
        sched.on_edit(id(n), format!("-> nap{n}")).unwrap();
    }

    // The last cell waits three naps for the single worker, longer than
    // the limit, but runs for one
    let report = sched.run(&[id(1), id(2), id(3), id(4)]).unwrap();

    assert_eq!(report.batches(), vec![vec![id(1), id(2), id(3), id(4)]]);
    assert!(report.is_success(), "{report:?}");
    assert_eq!(runner.calls().len(), 4);
    assert_eq!(value(&sched, 4, "nap4"), Some(1));
}

#[test]
fn test_timeout_cancels_slow_cell() {
    let config = SchedulerConfig::eager().with_cell_timeout(Duration::from_millis(50));
    let (sched, _) = scheduler(config);
    sched.on_edit(id(1), "-> fast").unwrap();
    let report = sched.on_edit(id(2), "-> slow").unwrap().report.unwrap();

    assert_eq!(report.error_kind(id(2)), Some(ErrorKind::Timeout));
    assert_eq!(sched.state_of(id(2)).unwrap(), CellState::Error);
    assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Idle);

    // A timed out cell is retried by the next run
    assert_eq!(sched.run(&[id(2)]).unwrap().executed(), vec![id(2)]);
}

#[test]
fn test_edit_while_running_reruns_with_new_code() {
    let (sched, runner) = scheduler(SchedulerConfig::eager());
    sched.on_edit(id(1), "-> a").unwrap();
    sched.on_edit(id(2), "a -> b").unwrap();

    let report = std::thread::scope(|s| {
        let first = s.spawn(|| sched.on_edit(id(1), "-> a slow").unwrap());
        wait_for(&sched, id(1), CellState::Running);

        // Recorded right away, but the running cell is not dispatched again
        let second = sched.on_edit(id(1), "-> a").unwrap();
        assert!(second.report.unwrap().dispatches.is_empty());
        assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Running);

        runner.open_gate();
        first.join().unwrap().report.unwrap()
    });

    assert_eq!(report.batches(), vec![vec![id(1)], vec![id(1)], vec![id(2)]]);
    assert!(report.is_success());
    assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Idle);
    assert_eq!(value(&sched, 2, "b"), Some(2));
}

#[test]
fn test_delete_while_running() {
    let (sched, _) = scheduler(SchedulerConfig::lazy());
    sched.on_edit(id(1), "-> slow").unwrap();
    sched.on_edit(id(2), "-> b").unwrap();

    let report = std::thread::scope(|s| {
        let run = s.spawn(|| sched.run(&[id(1), id(2)]).unwrap());
        wait_for(&sched, id(1), CellState::Running);
        sched.on_delete(id(1)).unwrap();
        run.join().unwrap()
    });

    assert!(report.get(id(1)).is_none());
    assert_eq!(report.state_of(id(2)), Some(CellState::Idle));
    assert!(sched.state_of(id(1)).is_err());
}

#[test]
fn test_disable_while_running_discards_result() {
    let (sched, runner) = scheduler(SchedulerConfig::lazy());
    sched.on_edit(id(1), "-> a slow").unwrap();

    std::thread::scope(|s| {
        let run = s.spawn(|| sched.run(&[id(1)]).unwrap());
        wait_for(&sched, id(1), CellState::Running);
        sched.set_disabled(id(1), true).unwrap();
        runner.open_gate();
        run.join().unwrap();
    });

    assert_eq!(sched.state_of(id(1)).unwrap(), CellState::Disabled);
    assert!(sched.output(id(1)).unwrap().is_none());
}

#[tokio::test]
async fn test_subscription_follows_cell_lifecycle() {
    let (sched, _) = scheduler(SchedulerConfig::eager());
    sched.on_edit(id(1), "-> a").unwrap();

    let mut changes = sched.subscribe_state_changes().unwrap();
    assert_eq!(
        changes.next().await,
        Some(StateChange {
            cell: id(1),
            state: CellState::Idle
        })
    );

    sched.on_edit(id(2), "a -> b").unwrap();
    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.push(changes.next_change().await.unwrap());
    }
    let states: Vec<CellState> = seen.iter().map(|c| c.state).collect();
    assert!(seen.iter().all(|c| c.cell == id(2)));
    assert_eq!(
        states,
        vec![
            CellState::Idle,
            CellState::Stale,
            CellState::Queued,
            CellState::Running,
            CellState::Idle
        ]
    );
    assert!(changes.try_next().is_none());
}
