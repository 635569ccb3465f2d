use predicates::prelude::*;

mod common;

#[test]
fn test_list_empty_shows_header() {
    let mut ctx = common::vcbox();
    ctx.cmd
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("ID"))
        .stdout(predicate::str::contains("STATE"))
        .stdout(predicate::str::contains("CONTAINERS"));
}

#[test]
fn test_list_quiet_sorted() {
    let ctx = common::vcbox();
    ctx.run_ok(&["create", "beta"]);
    ctx.run_ok(&["create", "alpha"]);

    let out = ctx.run_ok(&["list", "-q"]);
    assert_eq!(out, "alpha\nbeta\n");
}

#[test]
fn test_list_table_and_json() {
    let ctx = common::vcbox();
    ctx.run_ok(&["create", "sb"]);
    ctx.run_ok(&["start", "sb"]);

    ctx.new_cmd()
        .arg("ls")
        .assert()
        .success()
        .stdout(predicate::str::contains("sb"))
        .stdout(predicate::str::contains("running"))
        .stdout(predicate::str::contains("1/1"));

    let out = ctx.run_ok(&["list", "--format", "json"]);
    let json: serde_json::Value = serde_json::from_str(&out).unwrap();
    assert_eq!(json[0]["id"], "sb");
    assert_eq!(json[0]["state"], "running");
}

#[test]
fn test_env_roots_are_honored() {
    let ctx = common::vcbox();
    let config = ctx.dir.path().join("env-config");
    let run = ctx.dir.path().join("env-run");

    let mut create = assert_cmd::Command::new(env!("CARGO_BIN_EXE_vcbox"));
    create
        .env("VCBOX_CONFIG_ROOT", &config)
        .env("VCBOX_RUNTIME_ROOT", &run)
        .args(["create", "sb"])
        .assert()
        .success();

    assert!(config.join("sb").join("config.json").is_file());
    assert!(run.join("sb").join("state.json").is_file());
}
