//! Condition gating: `when` and `unless` over both condition forms.

use pretty_assertions::assert_eq;
use simple_test_case::test_case;
use zim::runner::{Code, RunOpts, Runner, StandardRunner};

use crate::{load, temporary_directory, write};

#[test_case("when", "main.go", Code::Ok; "when present runs")]
#[test_case("when", "missing.go", Code::Skipped; "when missing skips")]
#[test_case("unless", "main.go", Code::Skipped; "unless present skips")]
#[test_case("unless", "missing.go", Code::Ok; "unless missing runs")]
#[test]
fn resource_exists_gates_execution(keyword: &str, pattern: &str, expected: Code) {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        &format!(
            "name: widget\nrules:\n  gated:\n    command: 'true'\n    {keyword}:\n      resource_exists: {pattern}\n",
        ),
    );
    write(&root, "widget/main.go", "package main\n");

    let project = load(&root);
    let rule = project.component("widget").unwrap().rule("gated").unwrap();
    let outcome = StandardRunner.run(&rule, RunOpts::new());
    pretty_assertions::assert_eq!(outcome.code, expected, "{:?}", outcome.error);
}

#[test]
fn script_conditions_compare_trimmed_output() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
rules:
  matched:
    command: 'true'
    when:
      script_succeeds:
        run: echo ready
        with_output: ready
  mismatched:
    command: 'true'
    when:
      script_succeeds:
        run: echo ready
        with_output: not-ready
"#,
    );

    let project = load(&root);
    let widget = project.component("widget").unwrap();
    let matched = StandardRunner.run(&widget.rule("matched").unwrap(), RunOpts::new());
    assert_eq!(matched.code, Code::Ok, "{:?}", matched.error);
    let mismatched = StandardRunner.run(&widget.rule("mismatched").unwrap(), RunOpts::new());
    assert_eq!(mismatched.code, Code::Skipped);
}

#[test]
fn failing_condition_scripts_are_fatal_unless_suppressed() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "widget/component.yaml",
        r#"
name: widget
rules:
  fatal:
    command: 'true'
    when:
      script_succeeds:
        run: exit 1
  suppressed:
    command: 'true'
    when:
      script_succeeds:
        run: exit 1
        suppress_error: true
"#,
    );

    let project = load(&root);
    let widget = project.component("widget").unwrap();
    let fatal = StandardRunner.run(&widget.rule("fatal").unwrap(), RunOpts::new());
    assert_eq!(fatal.code, Code::Error);
    let suppressed = StandardRunner.run(&widget.rule("suppressed").unwrap(), RunOpts::new());
    assert_eq!(suppressed.code, Code::Skipped);
}
