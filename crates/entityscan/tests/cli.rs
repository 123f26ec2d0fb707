//! Exit codes and artifacts of the `entityscan` binary

mod common;

use common::*;
use entityscan::batch::{BatchSummary, SUMMARY_FILE};
use entityscan_telemetry::{checkpoint_path, read_report, RunStatus};
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn entityscan(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_entityscan"))
        .args(args)
        .current_dir(cwd)
        .env_remove("ENTITYSCAN_CONFIG")
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn write_config(dir: &Path) -> String {
    let path = dir.join("patterns.yaml");
    std::fs::write(&path, COMPANY_YAML).unwrap();
    path.display().to_string()
}

#[test]
fn test_scan_writes_report_and_exits_zero() {
    let dir = TempDir::new().unwrap();
    write_lines(dir.path(), "contracts.txt", &mixed_lines(140));
    let config = write_config(dir.path());

    let output = entityscan(&["scan", "--input", "contracts.txt", "--config", &config], dir.path());
    assert_eq!(output.status.code(), Some(0));

    // Default report path is in the working directory
    let report = read_report(dir.path().join("contracts.txt.report.json")).unwrap();
    assert_eq!(report.status, RunStatus::Complete);
    assert_eq!(report.counts.total_records, 140);
    assert_eq!(report.counts.categories.get("company"), Some(&20));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("contracts.txt.report.json"));
}

#[test]
fn test_missing_input_exits_one() {
    let dir = TempDir::new().unwrap();
    let output = entityscan(&["scan", "--input", "nope.txt"], dir.path());
    assert_eq!(output.status.code(), Some(1));
    assert!(!dir.path().join("nope.txt.report.json").exists());
}

#[test]
fn test_invalid_config_exits_one() {
    let dir = TempDir::new().unwrap();
    write_lines(dir.path(), "in.txt", &mixed_lines(10));
    std::fs::write(
        dir.path().join("bad.yaml"),
        "groups:\n  - { name: broken, patterns: [{ regex: '(unclosed' }] }\n",
    )
    .unwrap();

    let output = entityscan(
        &["scan", "--input", "in.txt", "--config", "bad.yaml"],
        dir.path(),
    );
    assert_eq!(output.status.code(), Some(1));

    let check = entityscan(&["check-config", "--config", "bad.yaml"], dir.path());
    assert_eq!(check.status.code(), Some(1));
}

#[test]
fn test_check_config_lists_groups() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path());

    let output = entityscan(&["check-config", "--config", &config], dir.path());
    assert_eq!(output.status.code(), Some(0));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("china_lake"));
    assert!(stdout.contains("company"));
    assert!(stdout.contains("1 inclusion, 1 exclusion"));

    let builtin = entityscan(&["check-config"], dir.path());
    assert_eq!(builtin.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&builtin.stdout).contains("mcf_entity"));
}

#[test]
fn test_resume_from_line_and_merge() {
    let dir = TempDir::new().unwrap();
    write_lines(dir.path(), "in.txt", &mixed_lines(700));
    let config = write_config(dir.path());

    let full = entityscan(
        &["scan", "--input", "in.txt", "--config", &config, "--output", "full.json"],
        dir.path(),
    );
    assert_eq!(full.status.code(), Some(0));

    let tail = entityscan(
        &[
            "scan",
            "--input",
            "in.txt",
            "--config",
            &config,
            "--output",
            "tail.json",
            "--resume-from",
            "350",
        ],
        dir.path(),
    );
    assert_eq!(tail.status.code(), Some(0));
    let tail_report = read_report(dir.path().join("tail.json")).unwrap();
    assert_eq!(tail_report.counts.total_records, 350);
    assert_eq!(tail_report.resumed_from_line, Some(350));

    let merged = entityscan(
        &["merge", "full.json", "tail.json", "--output", "merged.json"],
        dir.path(),
    );
    assert_eq!(merged.status.code(), Some(0));
    let merged_report = read_report(dir.path().join("merged.json")).unwrap();
    assert_eq!(merged_report.counts.total_records, 1050);
    assert_eq!(merged_report.merged_from, vec!["in.txt", "in.txt"]);
}

#[test]
fn test_merge_refuses_mixed_configs() {
    let dir = TempDir::new().unwrap();
    write_lines(dir.path(), "in.txt", &mixed_lines(20));
    let config = write_config(dir.path());

    entityscan(
        &["scan", "--input", "in.txt", "--config", &config, "--output", "a.json"],
        dir.path(),
    );
    entityscan(&["scan", "--input", "in.txt", "--output", "b.json"], dir.path());

    let merged = entityscan(
        &["merge", "a.json", "b.json", "--output", "m.json"],
        dir.path(),
    );
    assert_eq!(merged.status.code(), Some(1));
    assert!(!dir.path().join("m.json").exists());
}

#[test]
fn test_batch_runs_every_input() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir_all(data.join("2023")).unwrap();
    write_lines(&data, "a.txt", &mixed_lines(70));
    write_lines(&data.join("2023"), "a.txt", &mixed_lines(140));
    write_gzip(&data, "b.txt.gz", &mixed_lines(210));
    std::fs::write(data.join("README.md"), "not an input\n").unwrap();
    let config = write_config(dir.path());

    let output = entityscan(
        &[
            "batch",
            "--inputs",
            "data/**/*.txt",
            "data/*.gz",
            "--output-dir",
            "out",
            "--config",
            &config,
            "--jobs",
            "2",
            "--db-shards",
        ],
        dir.path(),
    );
    assert_eq!(output.status.code(), Some(0));

    let out = dir.path().join("out");
    let summary: BatchSummary =
        serde_json::from_str(&std::fs::read_to_string(out.join(SUMMARY_FILE)).unwrap()).unwrap();
    assert_eq!(summary.complete, 3);
    assert_eq!(summary.exit_code(), 0);

    let mut total_matches = 0;
    for report in summary.reports() {
        let report = read_report(dir.path().join(report)).unwrap();
        total_matches += report.counts.total_matches;
    }
    assert_eq!(total_matches, 10 + 20 + 30);

    // Both a.txt inputs get their own report and shard
    assert!(out.join("a.txt.report.json").exists());
    assert!(out.join("a.txt-2.report.json").exists());
    assert!(out.join("a.txt-2.sqlite").exists());
    assert!(!checkpoint_path(&out.join("a.txt.report.json")).exists());

    let shards = ["out/a.txt.sqlite", "out/a.txt-2.sqlite", "out/b.txt.gz.sqlite"];
    let mut args = vec![
        "merge",
        "out/a.txt.report.json",
        "out/a.txt-2.report.json",
        "out/b.txt.gz.report.json",
        "--output",
        "out/merged.json",
        "--db",
        "out/all.sqlite",
        "--shards",
    ];
    args.extend(shards);
    let merged = entityscan(&args, dir.path());
    assert_eq!(merged.status.code(), Some(0));
}
