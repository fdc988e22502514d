//! Per-command dispatch: every command kind leaves the filesystem in the
//! state it promises.

use std::sync::Arc;

use zim::runner::{Code, RunOpts, Runner, StandardRunner};

use crate::{installed, load, temporary_directory, write};

#[test]
fn command_matrix_drives_the_filesystem() {
    if !installed("zip") || !installed("unzip") {
        eprintln!("skipping: zip/unzip not installed");
        return;
    }

    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
rules:
  shuffle:
    commands:
      - zip:
          input: main.go
          output: main.go.zip
      - remove: main.go
      - unzip main.go.zip
      - archive:
          input: main.go
          output: main.go.tgz
      - move:
          src: main.go
          dst: main.go.bak
      - mkdir: the-directory
      - touch the-directory/foo
      - copy:
          src: the-directory
          dst: the-directory-copy
      - cleandir: the-directory-copy
"#,
    );
    write(&root, "widget/main.go", "package main\n");

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("shuffle").unwrap();
    let outcome = StandardRunner.run(&rule, RunOpts::new());
    assert_eq!(outcome.code, Code::Ok, "{:?}", outcome.error);

    let dir = root.as_std_path().join("widget");
    assert!(!dir.join("main.go").exists(), "main.go was moved away");
    assert!(dir.join("main.go.zip").is_file());
    assert!(dir.join("main.go.tgz").is_file());
    assert!(dir.join("main.go.bak").is_file());
    assert!(dir.join("the-directory/foo").is_file());
    assert!(dir.join("the-directory-copy").is_dir());
    assert_eq!(
        std::fs::read_dir(dir.join("the-directory-copy"))
            .unwrap()
            .count(),
        0,
        "cleandir leaves an empty directory",
    );
}

#[test]
fn cleandir_refuses_the_filesystem_root() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
rules:
  wipe:
    commands:
      - cleandir: /
"#,
    );

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("wipe").unwrap();
    let outcome = StandardRunner.run(&rule, RunOpts::new());
    assert_eq!(outcome.code, Code::Error);
}

#[test]
fn unknown_command_kinds_are_fatal() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
rules:
  odd:
    commands:
      - teleport: main.go
"#,
    );

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("odd").unwrap();
    let outcome = StandardRunner.run(&rule, RunOpts::new());
    assert_eq!(outcome.code, Code::Error);
    let message = format!("{:#}", outcome.error.unwrap());
    assert!(message.contains("unknown command kind"), "{message}");
}

#[test]
fn failing_commands_return_exec_error() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
rules:
  broken:
    command: exit 7
"#,
    );

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("broken").unwrap();
    let outcome = StandardRunner.run(&rule, RunOpts::new());
    assert_eq!(outcome.code, Code::ExecError);
    let message = format!("{:#}", outcome.error.unwrap());
    assert!(message.contains("exit code 7"), "{message}");
}

#[test]
fn run_commands_see_the_rule_environment() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
environment:
  GREETING: hello
rules:
  greet:
    local: true
    outputs: [greeting.txt]
    command: echo "$GREETING $NAME" > greeting.txt
"#,
    );

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("greet").unwrap();
    let outcome = StandardRunner.run(&rule, RunOpts::new());
    assert_eq!(outcome.code, Code::Ok, "{:?}", outcome.error);
    let contents =
        std::fs::read_to_string(root.as_std_path().join("widget/greeting.txt")).unwrap();
    assert_eq!(contents, "hello widget\n");
}

#[test]
fn artifact_outputs_land_in_the_artifacts_directory() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
rules:
  build:
    outputs: [widget-exe]
    command: echo binary > "$ARTIFACT"
"#,
    );

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("build").unwrap();
    let outcome = StandardRunner.run(&rule, RunOpts::new());
    assert_eq!(outcome.code, Code::Ok, "{:?}", outcome.error);
    assert!(
        project
            .artifacts_dir()
            .as_std_path()
            .join("widget-exe")
            .is_file(),
    );
}

// Arc is only here so the trait object form used by the scheduler is also
// exercised once outside unit tests.
#[test]
fn standard_runner_works_behind_a_trait_object() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        "name: widget\nrules:\n  noop:\n    command: 'true'\n",
    );
    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("noop").unwrap();
    let runner: Arc<dyn Runner> = Arc::new(StandardRunner);
    assert_eq!(runner.run(&rule, RunOpts::new()).code, Code::Ok);
}
