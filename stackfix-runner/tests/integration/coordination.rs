// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::{Result, ensure};
use maplit::{btreemap, btreeset};
use pretty_assertions::assert_eq;
use serde_json::json;
use stackfix_runner::{
    coordinator::{TestPhase, TestReport, WorkerTransport},
    dependency::CollectedTest,
    errors::{CoordinatorError, FixtureError},
    fixture::{FixtureState, TeardownOutcome},
    identifier::{ResourceName, TestId, WorkerId},
    state::StackState,
};
use std::thread;

fn worker(name: &str) -> WorkerId {
    WorkerId::from_name(name)
}

fn db_tests() -> Vec<CollectedTest> {
    vec![
        CollectedTest::new("tests/test_db.py::t1", ["db", "tmp_path"]),
        CollectedTest::new("tests/test_db.py::t2", ["db"]),
    ]
}

fn call(id: &str) -> TestReport {
    TestReport::new(id, TestPhase::Call)
}

fn names(names: &[&str]) -> Vec<ResourceName> {
    names.iter().map(|name| ResourceName::new(name)).collect()
}

#[test]
fn last_dependent_triggers_teardown() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();

    let mut master = project.coordinator(WorkerId::Master, &factory, "on");
    let mut gw0 = project.coordinator(worker("gw0"), &factory, "on");
    let mut gw1 = project.coordinator(worker("gw1"), &factory, "on");
    assert_eq!(gw0.state_dir(), master.state_dir());
    assert_eq!(gw1.state_dir(), master.state_dir());

    let tests = db_tests();
    gw0.collect(&tests);
    gw1.collect(&tests);

    // gw0 runs t1 and finishes first: t2 hasn't completed, so it must not tear down.
    let state = gw0.fixture("db")?;
    master.record_report(&call("tests/test_db.py::t1"))?;
    assert_eq!(gw0.after_test(&tests[0])?, Vec::<ResourceName>::new());
    assert_eq!(factory.count(Call::is_destroy), 0);

    // gw1 reuses what gw0 provisioned.
    assert_eq!(gw1.fixture("db")?, state);
    assert_eq!(factory.count(Call::is_apply), 1);

    // gw1 finishes t2, sees t1 in the log, and tears down.
    master.record_report(&call("tests/test_db.py::t2"))?;
    assert_eq!(gw1.after_test(&tests[1])?, names(&["db"]));
    assert_eq!(
        factory.calls(),
        vec![
            Call::Init("db@db0".to_owned()),
            Call::Apply("db@db0".to_owned()),
            Call::Destroy("db@db0".to_owned()),
        ]
    );
    assert!(gw1.dependencies().is_empty());

    // gw0 sweeps at the end and finds db already gone.
    let sweep = gw0.session_finish();
    assert_eq!(sweep.torn_down, names(&["db"]));
    ensure!(sweep.is_clean(), "unexpected sweep result: {sweep:?}");
    assert_eq!(factory.count(Call::is_destroy), 1);
    assert_eq!(master.markers().list()?, vec![]);

    // The master collected nothing, so has nothing to sweep.
    let sweep = master.session_finish();
    assert!(sweep.torn_down.is_empty());
    ensure!(sweep.is_clean(), "unexpected sweep result: {sweep:?}");

    Ok(())
}

#[test]
fn workers_racing_provision_once() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let _master = project.coordinator(WorkerId::Master, &factory, "on");

    let states: Vec<StackState> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let project = &project;
                let factory = &factory;
                s.spawn(move || {
                    let mut coordinator =
                        project.coordinator(worker(&format!("gw{n}")), factory, "on");
                    coordinator.fixture("db").unwrap()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(factory.count(Call::is_apply), 1);
    ensure!(
        states.windows(2).all(|pair| pair[0] == pair[1]),
        "every worker sees the same state"
    );
    Ok(())
}

#[test]
fn teardown_failure_with_policy_ignore() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::failing_destroy();
    let mut master = project.coordinator(WorkerId::Master, &factory, "ignore");

    // Without workers, the master runs the tests itself.
    let tests = db_tests();
    master.collect(&tests);
    master.fixture("db")?;
    for test in &tests {
        master.record_report(&call(test.id.as_str()))?;
    }

    assert_eq!(master.after_test(&tests[0])?, names(&["db"]));
    assert_eq!(factory.count(Call::is_destroy), 1);
    assert_eq!(master.markers().list()?, vec![]);
    Ok(())
}

#[test]
fn teardown_failure_with_policy_on() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::failing_destroy();
    let mut master = project.coordinator(WorkerId::Master, &factory, "on");

    let tests = db_tests();
    master.collect(&tests);
    master.fixture("db")?;
    for test in &tests {
        master.record_report(&call(test.id.as_str()))?;
    }

    let err = master.after_test(&tests[1]).unwrap_err();
    ensure!(
        matches!(
            err,
            CoordinatorError::Fixture(FixtureError::TeardownFailed { .. })
        ),
        "unexpected error: {err:?}"
    );

    // The marker is kept so the resource can still be found, and the sweep retries.
    assert_eq!(master.markers().list()?.len(), 1);

    // Later tests don't retry the failed teardown.
    assert_eq!(master.after_test(&tests[0])?, Vec::<ResourceName>::new());
    assert_eq!(factory.count(Call::is_destroy), 1);
    let sweep = master.session_finish();
    assert_eq!(sweep.failures.len(), 1);
    assert_eq!(sweep.failures[0].0, ResourceName::new("db"));
    assert!(sweep.remaining.is_empty());
    assert_eq!(factory.count(Call::is_destroy), 2);
    assert_eq!(master.markers().list()?.len(), 1);
    Ok(())
}

#[test]
fn teardown_off_leaves_resource_provisioned() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let mut master = project.coordinator(WorkerId::Master, &factory, "off");

    let tests = db_tests();
    master.collect(&tests);
    master.fixture("db")?;
    for test in &tests {
        master.record_report(&call(test.id.as_str()))?;
    }

    assert_eq!(master.after_test(&tests[1])?, names(&["db"]));
    assert_eq!(factory.count(Call::is_destroy), 0);
    let markers = master.markers().list()?;
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].0, ResourceName::new("db"));
    Ok(())
}

/// The last two `db` tests finish on different workers before the master logs either of them.
/// Neither worker sees `db` as ready then, so a later, unrelated test must pick it up.
#[test]
fn unrelated_test_tears_down_resource_made_ready_elsewhere() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let mut master = project.coordinator(WorkerId::Master, &factory, "on");
    let mut gw0 = project.coordinator(worker("gw0"), &factory, "on");
    let mut gw1 = project.coordinator(worker("gw1"), &factory, "on");

    let tests = vec![
        CollectedTest::new("t1", ["db"]),
        CollectedTest::new("t2", ["db"]),
        CollectedTest::new("t3", ["cache"]),
    ];
    gw0.collect(&tests);
    gw1.collect(&tests);

    gw0.fixture("db")?;
    gw1.fixture("db")?;
    assert_eq!(gw0.after_test(&tests[0])?, Vec::<ResourceName>::new());
    assert_eq!(gw1.after_test(&tests[1])?, Vec::<ResourceName>::new());
    assert_eq!(factory.count(Call::is_destroy), 0);

    gw0.fixture("cache")?;
    for test in &tests {
        master.record_report(&call(test.id.as_str()))?;
    }
    assert_eq!(gw0.after_test(&tests[2])?, names(&["cache", "db"]));
    assert_eq!(factory.count(Call::is_destroy), 2);
    assert_eq!(master.markers().list()?, vec![]);
    assert!(gw0.dependencies().is_empty());
    Ok(())
}

#[test]
fn sweep_leaves_resources_other_tests_need() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let mut master = project.coordinator(WorkerId::Master, &factory, "on");
    let mut gw0 = project.coordinator(worker("gw0"), &factory, "on");

    let tests = vec![
        CollectedTest::new("t1", ["db", "cache"]),
        CollectedTest::new("t2", ["db"]),
        CollectedTest::new("t3", ["scratch"]),
    ];
    gw0.collect(&tests);
    assert_eq!(
        gw0.dependencies().names().cloned().collect::<Vec<_>>(),
        names(&["cache", "db"])
    );

    gw0.fixture("db")?;
    gw0.fixture("cache")?;
    master.record_report(&TestReport::new("t1", TestPhase::Setup))?;
    master.record_report(&call("t1"))?;
    assert_eq!(gw0.after_test(&tests[0])?, names(&["cache"]));

    // t2 never ran here, and may still be running elsewhere.
    let sweep = gw0.session_finish();
    assert!(sweep.torn_down.is_empty());
    assert_eq!(
        sweep.remaining,
        btreemap! { ResourceName::new("db") => btreeset! { TestId::new("t2") } }
    );
    assert_eq!(
        master
            .markers()
            .list()?
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>(),
        names(&["db"])
    );
    Ok(())
}

#[test]
fn reports_outside_call_phase_are_ignored() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let mut master = project.coordinator(WorkerId::Master, &factory, "on");
    let mut gw0 = project.coordinator(worker("gw0"), &factory, "on");

    let tests = db_tests();
    gw0.collect(&tests);
    gw0.fixture("db")?;
    master.record_report(&TestReport::new("tests/test_db.py::t2", TestPhase::Setup))?;
    master.record_report(&TestReport::new("tests/test_db.py::t2", TestPhase::Teardown))?;
    // Workers never write to the log.
    gw0.record_report(&call("tests/test_db.py::t2"))?;

    assert_eq!(gw0.after_test(&tests[0])?, Vec::<ResourceName>::new());
    assert_eq!(gw0.completed().len(), 1);
    Ok(())
}

/// Each worker only knows the tests it collected. gw0 never collected t2, so it tears `db` down
/// as soon as t1 completes even though gw1 still needs it.
#[test]
fn partial_collection_tears_down_early() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let mut master = project.coordinator(WorkerId::Master, &factory, "on");
    let mut gw0 = project.coordinator(worker("gw0"), &factory, "on");
    let mut gw1 = project.coordinator(worker("gw1"), &factory, "on");

    let tests = db_tests();
    gw0.collect(&tests[..1]);
    gw1.collect(&tests[1..]);

    gw0.fixture("db")?;
    master.record_report(&call("tests/test_db.py::t1"))?;
    assert_eq!(gw0.after_test(&tests[0])?, names(&["db"]));

    // gw1 finds no marker and provisions db a second time.
    gw1.fixture("db")?;
    assert_eq!(factory.count(Call::is_apply), 2);
    master.record_report(&call("tests/test_db.py::t2"))?;
    assert_eq!(gw1.after_test(&tests[1])?, names(&["db"]));
    assert_eq!(factory.count(Call::is_destroy), 2);
    Ok(())
}

#[test]
fn function_scoped_fixtures_are_not_shared() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let mut master = project.coordinator(WorkerId::Master, &factory, "on");

    let err = master.fixture("scratch").unwrap_err();
    ensure!(
        matches!(err, CoordinatorError::FunctionScoped { .. }),
        "unexpected error: {err:?}"
    );

    let (mut first, _) = master.function_fixture("scratch")?;
    let (mut second, _) = master.function_fixture("scratch")?;
    assert_eq!(factory.count(Call::is_apply), 2);
    assert_eq!(master.markers().list()?, vec![]);

    assert_eq!(
        first.tear_down(&master.context())?,
        TeardownOutcome::Destroyed
    );
    assert_eq!(
        second.tear_down(&master.context())?,
        TeardownOutcome::Destroyed
    );
    assert_eq!(first.state(), FixtureState::Destroyed);
    assert_eq!(factory.count(Call::is_destroy), 2);
    Ok(())
}

#[test]
fn shared_fixtures_cannot_be_used_per_test() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let _master = project.coordinator(WorkerId::Master, &factory, "on");
    let mut gw0 = project.coordinator(worker("gw0"), &factory, "on");

    gw0.collect(&db_tests());
    gw0.fixture("db")?;

    let err = gw0.function_fixture("db").unwrap_err();
    ensure!(
        matches!(
            err,
            CoordinatorError::SharedScope { ref name, .. } if *name == ResourceName::new("db")
        ),
        "unexpected error: {err:?}"
    );
    assert_eq!(
        err.to_string(),
        "fixture `db` is shared at scope `session` and is set up through the coordinator"
    );

    // Shared fixtures are rejected even before collection, and nothing is touched.
    let err = gw0.function_fixture("cache").unwrap_err();
    ensure!(
        matches!(err, CoordinatorError::SharedScope { .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(factory.count(Call::is_apply), 1);
    assert_eq!(factory.count(Call::is_destroy), 0);
    assert_eq!(gw0.markers().list()?.len(), 1);
    Ok(())
}

#[test]
fn unknown_fixture() {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let mut master = project.coordinator(WorkerId::Master, &factory, "on");

    let err = master.fixture("queue").unwrap_err();
    assert_eq!(err.to_string(), "unknown fixture `queue`");
}

#[test]
fn state_hook_applies_to_provisioned_state() -> Result<()> {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let _master = project.coordinator(WorkerId::Master, &factory, "on");
    let mut gw0 = project
        .coordinator(worker("gw0"), &factory, "on")
        .with_state_hook(|name: &ResourceName, state: &mut StackState| {
            state
                .outputs_mut()
                .insert("region".to_owned(), json!(format!("us-east-1/{name}")));
        });
    let mut gw1 = project.coordinator(worker("gw1"), &factory, "on");

    let state = gw0.fixture("db")?;
    assert_eq!(state.get("region")?, None);
    assert_eq!(state.outputs().get("region"), Some(&json!("us-east-1/db")));

    // Reusing workers see the hooked state.
    assert_eq!(gw1.fixture("db")?, state);
    assert!(state.get("aws_db_instance.db.id")?.is_some());
    Ok(())
}

#[test]
fn remote_workers_are_rejected() {
    test_init();
    let project = Project::new();
    let factory = RecordingFactory::default();
    let master = project.coordinator(WorkerId::Master, &factory, "on");

    master
        .configure_worker(&worker("gw0"), &WorkerTransport::LocalProcess)
        .unwrap();
    let err = master
        .configure_worker(
            &worker("gw1"),
            &WorkerTransport::Remote {
                spec: "ssh=ci-runner-2".to_owned(),
            },
        )
        .unwrap_err();
    assert!(
        matches!(err, CoordinatorError::UnsupportedWorker { .. }),
        "{err:?}"
    );
}
