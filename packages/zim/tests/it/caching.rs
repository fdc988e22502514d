//! Cache middleware behavior: round trips, skip-on-hit, missing outputs,
//! and the full chain driven through the scheduler.

use std::sync::Arc;

use pretty_assertions::assert_eq;
use zim::{
    cache::{CacheMiddleware, CacheMode},
    path::TryJoinWith,
    runner::{
        BufferedOutputMiddleware, Chain, Code, LoggerMiddleware, RunOpts, Runner, StandardRunner,
    },
    sched::Scheduler,
    store::FsStore,
};

use crate::{load, temporary_directory, write};

fn cached_runner(store: Arc<FsStore>, mode: CacheMode) -> Arc<dyn Runner> {
    Chain::new(vec![Arc::new(CacheMiddleware::new(store, mode, "tester"))])
        .then(Arc::new(StandardRunner))
}

const COUNTING_MANIFEST: &str = r#"
name: widget
rules:
  build:
    inputs: [main.go]
    outputs: [widget-exe]
    command: echo compiled >> "$ARTIFACT"
"#;

#[test]
fn cache_round_trip_skips_the_second_run() {
    let (_guard, root) = temporary_directory();
    write(&root, "widget/component.yaml", COUNTING_MANIFEST);
    write(&root, "widget/main.go", "package main\n");
    let store_dir = root.try_join_dir("store").unwrap();
    let store = Arc::new(FsStore::open(&store_dir).unwrap());

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("build").unwrap();
    let runner = cached_runner(store.clone(), CacheMode::ReadWrite);

    let first = runner.run(&rule, RunOpts::new());
    assert_eq!(first.code, Code::Ok, "{:?}", first.error);
    let output = project.artifacts_dir().as_std_path().join("widget-exe");
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "compiled\n");

    // Remove the local output; the second run must restore it from the
    // cache without executing the command again.
    std::fs::remove_file(&output).unwrap();
    let second = runner.run(&rule, RunOpts::new());
    assert_eq!(second.code, Code::Cached, "{:?}", second.error);
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "compiled\n");
}

#[test]
fn cache_hit_with_matching_local_output_downloads_nothing() {
    let (_guard, root) = temporary_directory();
    write(&root, "widget/component.yaml", COUNTING_MANIFEST);
    write(&root, "widget/main.go", "package main\n");
    let store_dir = root.try_join_dir("store").unwrap();
    let store = Arc::new(FsStore::open(&store_dir).unwrap());

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("build").unwrap();
    let runner = cached_runner(store, CacheMode::ReadWrite);

    assert_eq!(runner.run(&rule, RunOpts::new()).code, Code::Ok);
    // Local output still present and matching: a hit, not a re-run. Had
    // the command re-run, the append would double the file.
    assert_eq!(runner.run(&rule, RunOpts::new()).code, Code::Cached);
    let output = project.artifacts_dir().as_std_path().join("widget-exe");
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "compiled\n");
}

#[test]
fn write_only_mode_never_reads() {
    let (_guard, root) = temporary_directory();
    write(&root, "widget/component.yaml", COUNTING_MANIFEST);
    write(&root, "widget/main.go", "package main\n");
    let store_dir = root.try_join_dir("store").unwrap();
    let store = Arc::new(FsStore::open(&store_dir).unwrap());

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("build").unwrap();
    let runner = cached_runner(store, CacheMode::WriteOnly);

    assert_eq!(runner.run(&rule, RunOpts::new()).code, Code::Ok);
    // Write-only always re-runs, so the append happens twice.
    assert_eq!(runner.run(&rule, RunOpts::new()).code, Code::Ok);
    let output = project.artifacts_dir().as_std_path().join("widget-exe");
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "compiled\ncompiled\n",
    );
}

#[test]
fn skipped_rules_write_nothing_to_the_cache() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
rules:
  gated:
    outputs: [gated-exe]
    command: touch "$ARTIFACT"
    when:
      resource_exists: missing.go
"#,
    );
    let store_dir = root.try_join_dir("store").unwrap();
    let store = Arc::new(FsStore::open(&store_dir).unwrap());

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("gated").unwrap();
    let runner = cached_runner(store, CacheMode::ReadWrite);

    assert_eq!(runner.run(&rule, RunOpts::new()).code, Code::Skipped);
    let stored = std::fs::read_dir(store_dir.as_std_path()).unwrap().count();
    assert_eq!(stored, 0, "a skipped rule must not populate the cache");
}

#[test]
fn sidecar_key_record_is_uploaded() {
    let (_guard, root) = temporary_directory();
    write(&root, "widget/component.yaml", COUNTING_MANIFEST);
    write(&root, "widget/main.go", "package main\n");
    let store_dir = root.try_join_dir("store").unwrap();
    let store = Arc::new(FsStore::open(&store_dir).unwrap());

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("build").unwrap();
    let runner = cached_runner(store, CacheMode::ReadWrite);
    assert_eq!(runner.run(&rule, RunOpts::new()).code, Code::Ok);

    let key = zim::key::compute(&rule).unwrap();
    let sidecar = store_dir
        .as_std_path()
        .join(format!("{}.json", key.hex()));
    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(sidecar).unwrap()).unwrap();
    assert_eq!(record["component"], "widget");
    assert_eq!(record["rule"], "build");
    assert_eq!(record["version"], "0.0.4");
}

#[test]
fn missing_outputs_are_detected_with_every_absent_path() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
rules:
  build:
    outputs: [one, two]
    command: 'true'
"#,
    );

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("build").unwrap();
    let outcome = StandardRunner.run(&rule, RunOpts::new());
    assert_eq!(outcome.code, Code::MissingOutput);
    let message = format!("{:#}", outcome.error.unwrap());
    assert!(message.contains("one"), "{message}");
    assert!(message.contains("two"), "{message}");
}

#[test_log::test]
fn scheduler_runs_the_full_chain_end_to_end() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
rules:
  test:
    inputs: [main.go]
    outputs: [test-results]
    command: echo ok > "$ARTIFACT"
  build:
    inputs: [main.go]
    outputs: [widget-exe]
    command: echo binary > "$ARTIFACT"
    requires:
      - rule: test
"#,
    );
    write(
        &root,
        "dongle/component.yaml",
        r#"
name: dongle
rules:
  build:
    outputs: [dongle-exe]
    command: echo binary > "$ARTIFACT"
    requires:
      - component: widget
        rule: build
"#,
    );
    write(&root, "widget/main.go", "package main\n");
    let store_dir = root.try_join_dir("store").unwrap();
    let store = Arc::new(FsStore::open(&store_dir).unwrap());

    let project = load(&root);
    let targets = project
        .resolve_targets(&["widget.build".to_string(), "dongle.build".to_string()])
        .unwrap();
    let runner = Chain::new(vec![
        Arc::new(BufferedOutputMiddleware),
        Arc::new(LoggerMiddleware),
        Arc::new(CacheMiddleware::new(store, CacheMode::ReadWrite, "tester")),
    ])
    .then(Arc::new(StandardRunner));
    let scheduler = Scheduler::new(runner, 2);

    let first = scheduler.run(&targets, &RunOpts::new()).unwrap();
    assert!(first.is_success(), "{:?}", first.errors);
    assert_eq!(first.codes["widget.test"], Code::Ok);
    assert_eq!(first.codes["widget.build"], Code::Ok);
    assert_eq!(first.codes["dongle.build"], Code::Ok);

    // Second run: everything is served from the cache.
    let project = load(&root);
    let targets = project
        .resolve_targets(&["widget.build".to_string(), "dongle.build".to_string()])
        .unwrap();
    let second = scheduler.run(&targets, &RunOpts::new()).unwrap();
    assert!(second.is_success(), "{:?}", second.errors);
    assert_eq!(second.codes["widget.test"], Code::Cached);
    assert_eq!(second.codes["widget.build"], Code::Cached);
    assert_eq!(second.codes["dongle.build"], Code::Cached);
}
