use std::{collections::BTreeMap, fs, path::PathBuf};

use dbt_graph::{
    BuildStep, Error, FlagSpec, Generator, GeneratorInput, GeneratorOutput, Mode, Rule,
    flags::{FlagSource, STATE_FILE_NAME},
    graph::GraphError,
};
use expect_test::expect;

use crate::mock::{MockTarget, compile, link, roots};


fn input(include: &[&str]) -> GeneratorInput {
    let mut input = GeneratorInput::new("/ws/src", "/ws/out");
    input.selectors.include = include.iter().map(|s| s.to_string()).collect();
    input
}

fn run(input: GeneratorInput, targets: Vec<(&str, MockTarget)>) -> Result<GeneratorOutput, Error> {
    let mut generator = Generator::new(input)?;
    for (path, target) in targets {
        generator.add_target(path, target)?;
    }
    generator.run()
}

// 1) A single target compiled from a single source.
#[test_log::test]
fn test_end_to_end() {
    let roots = roots();
    let output = run(
        input(&["//lib:A"]),
        vec![("//lib:A", MockTarget::new().step(compile(&roots, "a.c", "a.o")))],
    )
    .unwrap();

    expect![[r#"
        # Generated by dbt-graph; do not edit.
        ninja_required_version = 1.10

        build __always__: phony

        rule cc
          command = cc -c $in -o $out

        # target://lib:A > step 0
        build /ws/out/a.o: cc /ws/src/a.c

        build //lib$:A: phony /ws/out/a.o

        default //lib$:A
    "#]]
    .assert_eq(&output.ninja_file);

    assert_eq!(output.targets.len(), 1);
    let info = &output.targets["//lib:A"];
    assert!(info.selected);
    assert!(!info.runnable);
    assert_eq!(output.selected_targets, ["//lib:A"]);
    assert!(output.flags.is_empty());
    assert!(output.comp_db_rules.is_empty());
    assert_eq!(output.dependency_graph, None);
    assert_eq!(output.build_dir, None);
}

// 2) Two targets disagreeing about a shared output.
#[test]
fn test_conflict_is_fatal() {
    let roots = roots();
    let shared = |command: &str| {
        BuildStep::new(Rule::new("cc").var("command", command))
            .input(roots.src("shared.c").unwrap())
            .output(roots.out("shared.o").unwrap())
    };
    let result = run(
        input(&["//lib:.*"]),
        vec![
            ("//lib:A", MockTarget::new().step(shared("cc -c $in -o $out"))),
            ("//lib:B", MockTarget::new().step(shared("cc -O2 -c $in -o $out"))),
        ],
    );
    let Err(err) = result else {
        panic!("conflicting steps were accepted");
    };
    assert!(matches!(err, Error::Graph(GraphError::RuleConflict { .. })));
    assert!(err.to_string().ends_with("while building: target://lib:B > step 0"));

    let shared = |flags: &str| {
        link(&roots, &[], "shared.o")
            .input(roots.src("shared.c").unwrap())
            .var("flags", flags)
    };
    let result = run(
        input(&["//lib:.*"]),
        vec![
            ("//lib:A", MockTarget::new().step(shared("-O0"))),
            ("//lib:B", MockTarget::new().step(shared("-O2"))),
        ],
    );
    let Err(err) = result else {
        panic!("conflicting steps were accepted");
    };
    let message = err.to_string();
    assert!(message.contains("conflicting build steps for /ws/out/shared.o"));
    assert!(message.contains("first declared by: target://lib:A > step 0"));
    assert!(message.ends_with("while building: target://lib:B > step 0"));
}

// 3) Output does not depend on the order targets were declared in.
#[test]
fn test_output_is_deterministic() {
    let roots = roots();
    let targets = || {
        vec![
            (
                "//app:Main",
                MockTarget::new()
                    .step(compile(&roots, "util.c", "util.o"))
                    .step(compile(&roots, "main.c", "main.o"))
                    .step(link(&roots, &["main.o", "util.o"], "main")),
            ),
            (
                "//lib:Util",
                MockTarget::new().step(compile(&roots, "util.c", "util.o")),
            ),
            ("//lib:helper", MockTarget::new().step(compile(&roots, "h.c", "h.o"))),
        ]
    };
    let forward = run(input(&[".*"]), targets()).unwrap();
    let mut reversed = targets();
    reversed.reverse();
    let backward = run(input(&[".*"]), reversed).unwrap();

    assert_eq!(forward, backward);
    assert_eq!(forward.selected_targets, ["//app:Main", "//lib:Util"]);
    assert!(
        forward
            .ninja_file
            .contains("# target://app:Main > step 0\n# target://lib:Util > step 0\n")
    );
    assert!(!forward.ninja_file.contains("h.o"));
}

// 4) Completions skip realization and never touch the state file.
#[test]
fn test_completions_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut input = GeneratorInput::new("/ws/src", dir.path());
    input.completions_only = true;
    input.persist_flags = true;
    input.selectors.include = vec!["//lib:(".into()];
    input.cmdline_flags.insert("opt".into(), "release".into());

    let mut generator = Generator::new(input).unwrap();
    generator
        .declare_flag(FlagSpec::string("opt").allowed(["debug", "release"]))
        .unwrap();
    generator
        .add_target("//lib:A", MockTarget::new().failing("never built"))
        .unwrap();
    let output = generator.run().unwrap();

    assert!(output.ninja_file.is_empty());
    assert!(output.selected_targets.is_empty());
    assert!(output.targets.contains_key("//lib:A"));
    assert_eq!(output.flags["opt"].value.as_deref(), Some("release"));
    assert!(!dir.path().join(STATE_FILE_NAME).exists());
}

#[test]
fn test_malformed_pattern_is_fatal_outside_completions() {
    let result = run(input(&["//lib:("]), vec![("//lib:A", MockTarget::new())]);
    assert!(matches!(result, Err(Error::Catalog(_))));
}

// 5) Flags persist across runs in the output directory.
#[test]
fn test_flags_persist() {
    let dir = tempfile::tempdir().unwrap();
    let flag = || {
        FlagSpec::string("opt")
            .description("optimization level")
            .allowed(["debug", "release"])
            .default_value("debug")
    };
    let target = || MockTarget::new().reads_flag("opt");

    let mut input = GeneratorInput::new("/ws/src", dir.path());
    input.cmdline_flags.insert("opt".into(), "release".into());
    input.persist_flags = true;
    let mut generator = Generator::new(input).unwrap();
    generator.declare_flag(flag()).unwrap();
    generator.add_target("//lib:A", target()).unwrap();
    let output = generator.run().unwrap();
    assert_eq!(output.flags["opt"].source, Some(FlagSource::CommandLine));

    let state: BTreeMap<String, String> =
        serde_json::from_slice(&fs::read(dir.path().join(STATE_FILE_NAME)).unwrap()).unwrap();
    assert_eq!(state["opt"], "release");

    let mut generator = Generator::new(GeneratorInput::new("/ws/src", dir.path())).unwrap();
    generator.declare_flag(flag()).unwrap();
    generator.add_target("//lib:A", target()).unwrap();
    let output = generator.run().unwrap();
    let opt = &output.flags["opt"];
    assert_eq!(opt.value.as_deref(), Some("release"));
    assert_eq!(opt.source, Some(FlagSource::Persisted));
    assert_eq!(opt.description, "optimization level");
    assert_eq!(opt.allowed, ["debug", "release"]);
}

#[test]
fn test_disallowed_flag_value_is_fatal() {
    let mut input = input(&["//lib:A"]);
    input.cmdline_flags.insert("opt".into(), "fast".into());
    let mut generator = Generator::new(input).unwrap();
    generator
        .declare_flag(FlagSpec::string("opt").allowed(["debug", "release"]))
        .unwrap();
    generator
        .add_target("//lib:A", MockTarget::new().reads_flag("opt"))
        .unwrap();
    let Err(err) = generator.run() else {
        panic!("disallowed value was accepted");
    };
    assert!(err.to_string().contains("not one of the allowed values"));
}

// 6) Response fields for older tools, and the dependency graph.
#[test]
fn test_legacy_fields() {
    let mut input = input(&[]);
    input.legacy = true;
    input.workspace_flags.insert("cc".into(), "clang".into());
    let mut generator = Generator::new(input).unwrap();
    generator.declare_flag(FlagSpec::string("cc")).unwrap();
    generator.declare_flag(FlagSpec::string("unset")).unwrap();
    let output = generator.run().unwrap();

    assert_eq!(output.build_dir, Some(PathBuf::from("/ws/out")));
    let build_flags = output.build_flags.unwrap();
    assert_eq!(build_flags.len(), 1);
    assert_eq!(build_flags["cc"], "clang");
    assert_eq!(output.flags["unset"].value, None);
}

#[test]
fn test_dependency_graph_export() {
    let roots = roots();
    let mut input = input(&["//app:Main"]);
    input.export_graph = true;
    let output = run(
        input,
        vec![(
            "//app:Main",
            MockTarget::new()
                .step(compile(&roots, "main.c", "main.o"))
                .step(link(&roots, &["main.o"], "main")),
        )],
    )
    .unwrap();

    let dot = output.dependency_graph.unwrap();
    assert!(dot.starts_with("digraph"));
    assert!(dot.contains("main.o"));
    assert!(dot.contains("->"));
}

// 7) Modes and arguments.
#[test]
fn test_run_mode_selects_runnable_targets() {
    let roots = roots();
    let mut input = input(&[".*"]);
    input.mode = Mode::Run;
    input.run_args = vec!["--port".into(), "8080".into()];
    let output = run(
        input,
        vec![
            (
                "//app:Server",
                MockTarget::new()
                    .step(compile(&roots, "server.c", "server"))
                    .runnable("/ws/out/server"),
            ),
            ("//lib:Util", MockTarget::new().step(compile(&roots, "util.c", "util.o"))),
        ],
    )
    .unwrap();

    assert_eq!(output.selected_targets, ["//app:Server"]);
    assert!(output.targets["//app:Server"].runnable);
    assert!(!output.targets["//lib:Util"].selected);
    assert!(!output.ninja_file.contains("util.o"));
    assert!(output.ninja_file.contains("command = /ws/out/server --port 8080\n"));
    assert!(output.ninja_file.ends_with("default //app$:Server\n"));
}

#[test]
fn test_version_mismatch() {
    let mut input = input(&[]);
    input.version = 2;
    assert!(matches!(
        Generator::new(input),
        Err(Error::UnsupportedVersion { found: 2, expected: 1 })
    ));
}

#[test]
fn test_duplicate_target_paths() {
    let mut generator = Generator::new(input(&[])).unwrap();
    generator.add_target("//lib:A", MockTarget::new()).unwrap();
    assert!(matches!(
        generator.add_target("//lib:A", MockTarget::new()),
        Err(Error::Catalog(_))
    ));
}
