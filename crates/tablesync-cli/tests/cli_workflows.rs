#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::Path;

use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const COLUMNS: &str = r#"[
  {"elementKey": "name", "elementName": "name", "elementType": "string"},
  {"elementKey": "age", "elementName": "age", "elementType": "integer"}
]"#;

fn tsync(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_tsync"));
    cmd.arg("--root").arg(root).arg("--user").arg("tester");
    cmd
}

fn run_json(root: &Path, args: &[&str]) -> Result<Value, Box<dyn std::error::Error>> {
    let output = tsync(root).args(args).output()?;
    assert!(
        output.status.success(),
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Ok(serde_json::from_slice(&output.stdout)?)
}

fn create_people(tmp: &TempDir) -> Result<Value, Box<dyn std::error::Error>> {
    let columns = tmp.path().join("columns.json");
    std::fs::write(&columns, COLUMNS)?;
    let root = tmp.path().join("tables");
    run_json(
        &root,
        &[
            "create",
            "--app",
            "survey",
            "--table",
            "people",
            "--columns",
            columns.to_str().unwrap(),
        ],
    )
}

const TARGET: [&str; 4] = ["--app", "survey", "--table", "people"];

fn with_target<'a>(cmd: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec![cmd];
    args.extend(TARGET);
    args.extend(rest);
    args
}

#[test]
fn create_put_and_diff_round_trip() -> TestResult {
    let tmp = TempDir::new()?;
    let identity = create_people(&tmp)?;
    assert_eq!(identity["appId"], "survey");
    assert!(identity["schemaETag"].as_str().unwrap().starts_with("uuid:"));

    let root = tmp.path().join("tables");
    let row = run_json(
        &root,
        &with_target("put", &["--row-id", "r1", "--value", "name=Ada", "--value", "age=36"]),
    )?;
    assert_eq!(row["rowId"], "r1");

    let diff = run_json(&root, &with_target("diff", &[]))?;
    let rows = diff["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(diff["sequenceValue"], 1);
    assert_eq!(diff["hasMoreResults"], false);

    let got = run_json(&root, &with_target("get", &["--row-id", "r1"]))?;
    assert_eq!(got["rowETag"], row["rowETag"]);

    let change_sets = run_json(&root, &with_target("change-sets", &[]))?;
    assert_eq!(change_sets["changeSets"].as_array().unwrap().len(), 1);

    let tables = run_json(&root, &["list-tables", "--app", "survey"])?;
    assert_eq!(tables.as_array().unwrap().len(), 1);
    Ok(())
}

#[test]
fn stale_etag_is_rejected_with_a_version_mismatch() -> TestResult {
    let tmp = TempDir::new()?;
    create_people(&tmp)?;
    let root = tmp.path().join("tables");

    let first = run_json(&root, &with_target("put", &["--row-id", "r1", "--value", "age=1"]))?;
    let etag = first["rowETag"].as_str().unwrap().to_string();
    run_json(
        &root,
        &with_target("put", &["--row-id", "r1", "--etag", &etag, "--value", "age=2"]),
    )?;

    tsync(&root)
        .args(with_target("put", &["--row-id", "r1", "--etag", &etag, "--value", "age=3"]))
        .assert()
        .failure()
        .stderr(contains("VersionMismatch"));
    Ok(())
}

#[test]
fn deleted_rows_show_up_in_the_change_set_rows() -> TestResult {
    let tmp = TempDir::new()?;
    create_people(&tmp)?;
    let root = tmp.path().join("tables");

    let row = run_json(&root, &with_target("put", &["--row-id", "gone", "--value", "age=9"]))?;
    let etag = row["rowETag"].as_str().unwrap().to_string();
    let tombstone = run_json(
        &root,
        &with_target("delete", &["--row-id", "gone", "--etag", &etag]),
    )?;
    assert_eq!(tombstone["deleted"], true);

    let data_etag = tombstone["dataETagAtModification"].as_str().unwrap().to_string();
    let dead = run_json(
        &root,
        &with_target("change-set-rows", &["--data-etag", &data_etag, "--deleted"]),
    )?;
    assert_eq!(dead["rows"].as_array().unwrap().len(), 1);

    let live = run_json(&root, &with_target("rows", &[]))?;
    assert!(live["rows"].as_array().unwrap().is_empty());
    Ok(())
}

#[test]
fn invalid_schema_and_values_fail_cleanly() -> TestResult {
    let tmp = TempDir::new()?;
    let bad = tmp.path().join("bad.json");
    std::fs::write(
        &bad,
        r#"[{"elementKey": "geo", "elementName": "geo", "elementType": "object"}]"#,
    )?;
    let root = tmp.path().join("tables");

    tsync(&root)
        .args(["create", "--app", "survey", "--table", "t", "--columns"])
        .arg(&bad)
        .assert()
        .failure()
        .stderr(contains("SchemaValidation"));

    create_people(&tmp)?;
    tsync(&root)
        .args(with_target("put", &["--row-id", "r1", "--value", "novalue"]))
        .assert()
        .failure()
        .stderr(contains("expected COLUMN=VALUE"));
    Ok(())
}

#[test]
fn schema_change_moves_to_a_new_generation() -> TestResult {
    let tmp = TempDir::new()?;
    let v1 = create_people(&tmp)?;
    let root = tmp.path().join("tables");
    run_json(&root, &with_target("put", &["--row-id", "r1", "--value", "age=1"]))?;

    let columns = tmp.path().join("columns.json");
    let v2 = run_json(
        &root,
        &[
            "schema",
            "--app",
            "survey",
            "--table",
            "people",
            "--expected",
            v1["schemaETag"].as_str().unwrap(),
            "--columns",
            columns.to_str().unwrap(),
        ],
    )?;
    assert_ne!(v1["schemaETag"], v2["schemaETag"]);

    let rows = run_json(&root, &with_target("rows", &[]))?;
    assert!(rows["rows"].as_array().unwrap().is_empty());

    tsync(&root)
        .args(with_target(
            "rows",
            &["--schema-etag", v1["schemaETag"].as_str().unwrap()],
        ))
        .assert()
        .failure()
        .stderr(contains("schemaETag mismatch"));
    Ok(())
}
