//! Cache key fingerprint tests: golden vectors plus the stability
//! properties the key must uphold.

use pretty_assertions::assert_eq;
use zim::key;

use crate::{load, temporary_directory, write};

const SIMPLE_MANIFEST: &str = r#"
name: my-component
rules:
  test:
    inputs: [main.go]
    outputs: [my-exe]
    command: touch my-exe
"#;

const CONTAINER_MANIFEST: &str = r#"
name: foo
docker:
  image: repo/img:1.2.3
environment:
  VOLUME: "11"
toolchain:
  items:
    - name: example
      command: echo EXAMPLE
rules:
  test:
    inputs: ["${NAME}_test.go", go.mod]
    ignore: [exclude_me.go]
    outputs: [test_results]
    command: go test -v
  build:
    inputs: ["${NAME}.go", go.mod]
    ignore: [exclude_me.go]
    outputs: [foo]
    command: go build
    requires:
      - rule: test
"#;

#[test]
fn golden_key_without_container() {
    let (_guard, root) = temporary_directory();
    write(&root, "my-component/component.yaml", SIMPLE_MANIFEST);
    write(&root, "my-component/main.go", "some source code");

    let project = load(&root);
    let rule = project.component("my-component").unwrap().rule("test").unwrap();
    let key = key::compute(&rule).unwrap();
    assert_eq!(key.hex(), "96eb9c2151042ff5745c38492bb797a7e0319867");
}

#[test]
fn golden_keys_with_container_and_toolchain() {
    let (_guard, root) = temporary_directory();
    write(&root, "foo/component.yaml", CONTAINER_MANIFEST);
    for file in ["foo.go", "foo_test.go", "go.mod", "exclude_me.go"] {
        write(&root, &format!("foo/{file}"), file);
    }

    let project = load(&root);
    let foo = project.component("foo").unwrap();
    let test = key::compute(&foo.rule("test").unwrap()).unwrap();
    assert_eq!(test.hex(), "29831b4e77176cf62edac0f4cfe99b5e64d05b56");
    let build = key::compute(&foo.rule("build").unwrap()).unwrap();
    assert_eq!(build.hex(), "66c540f46e4a6d872d2361553de1c1d43eea383d");
}

#[test]
fn keys_are_deterministic_across_loads() {
    let (_guard, root) = temporary_directory();
    write(&root, "my-component/component.yaml", SIMPLE_MANIFEST);
    write(&root, "my-component/main.go", "some source code");

    let first = {
        let project = load(&root);
        let rule = project.component("my-component").unwrap().rule("test").unwrap();
        key::compute(&rule).unwrap().hex().to_string()
    };
    let second = {
        let project = load(&root);
        let rule = project.component("my-component").unwrap().rule("test").unwrap();
        key::compute(&rule).unwrap().hex().to_string()
    };
    assert_eq!(first, second);
}

#[test]
fn keys_do_not_depend_on_the_repository_location() {
    let (_guard_a, root_a) = temporary_directory();
    let (_guard_b, root_b) = temporary_directory();
    for root in [&root_a, &root_b] {
        write(root, "my-component/component.yaml", SIMPLE_MANIFEST);
        write(root, "my-component/main.go", "some source code");
    }

    let key_a = {
        let project = load(&root_a);
        let rule = project.component("my-component").unwrap().rule("test").unwrap();
        key::compute(&rule).unwrap().hex().to_string()
    };
    let key_b = {
        let project = load(&root_b);
        let rule = project.component("my-component").unwrap().rule("test").unwrap();
        key::compute(&rule).unwrap().hex().to_string()
    };
    assert_eq!(key_a, key_b);
}

#[test]
fn keys_are_insensitive_to_environment_declaration_order() {
    let env_ab = "environment:\n  ALPHA: \"1\"\n  BETA: \"2\"\n";
    let env_ba = "environment:\n  BETA: \"2\"\n  ALPHA: \"1\"\n";
    let manifest = |env: &str| {
        format!(
            "name: my-component\n{env}rules:\n  test:\n    inputs: [main.go]\n    outputs: [my-exe]\n    command: touch my-exe\n",
        )
    };

    let (_guard_a, root_a) = temporary_directory();
    write(&root_a, "my-component/component.yaml", &manifest(env_ab));
    write(&root_a, "my-component/main.go", "some source code");
    let (_guard_b, root_b) = temporary_directory();
    write(&root_b, "my-component/component.yaml", &manifest(env_ba));
    write(&root_b, "my-component/main.go", "some source code");

    let key_of = |root| {
        let project = load(root);
        let rule = project.component("my-component").unwrap().rule("test").unwrap();
        key::compute(&rule).unwrap().hex().to_string()
    };
    assert_eq!(key_of(&root_a), key_of(&root_b));
}

#[test]
fn keys_are_sensitive_to_input_contents() {
    let (_guard, root) = temporary_directory();
    write(&root, "my-component/component.yaml", SIMPLE_MANIFEST);
    write(&root, "my-component/main.go", "some source code");

    let before = {
        let project = load(&root);
        let rule = project.component("my-component").unwrap().rule("test").unwrap();
        key::compute(&rule).unwrap().hex().to_string()
    };

    write(&root, "my-component/main.go", "some source codf");
    let after = {
        let project = load(&root);
        let rule = project.component("my-component").unwrap().rule("test").unwrap();
        key::compute(&rule).unwrap().hex().to_string()
    };
    assert_ne!(before, after);
}

#[test]
fn parameter_bindings_create_distinct_keys() {
    let (_guard, root) = temporary_directory();
    write(
        &root,
        "my-component/component.yaml",
        r#"
name: my-component
rules:
  build:
    inputs: [main.go]
    outputs: ["out-${ARCH}"]
    command: touch out
"#,
    );
    write(&root, "my-component/main.go", "some source code");

    let project = load(&root);
    let component = project.component("my-component").unwrap();
    let amd = component
        .rule_with_params(
            "build",
            [("ARCH".to_string(), "amd64".to_string())].into(),
        )
        .unwrap();
    let arm = component
        .rule_with_params(
            "build",
            [("ARCH".to_string(), "arm64".to_string())].into(),
        )
        .unwrap();
    assert_eq!(amd.node_id(), "my-component.build[ARCH=amd64]");
    assert_ne!(
        key::compute(&amd).unwrap().hex(),
        key::compute(&arm).unwrap().hex(),
    );
}
