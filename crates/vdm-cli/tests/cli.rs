use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use httpmock::prelude::*;
use predicates::prelude::*;
use serde_json::json;

fn vdm() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("vdm"));
    cmd.env_remove("VDM_CACHE_DIR").env_remove("RUST_LOG");
    cmd
}

fn describe_page(labels: &[&str]) -> String {
    let results: Vec<_> = labels
        .iter()
        .enumerate()
        .map(|(idx, label)| {
            json!({
                "uri": {"type": "uri", "value": format!("9_6-{}", idx + 1), "label": label},
                "name": {"type": "literal", "value": label}
            })
        })
        .collect();
    json!({"count": labels.len().to_string(), "results": results}).to_string()
}

#[test]
fn help_mentions_core_commands() {
    vdm().arg("--help").assert().success().stdout(
        predicate::str::contains("query")
            .and(predicate::str::contains("schema"))
            .and(predicate::str::contains("entries"))
            .and(predicate::str::contains("status")),
    );
}

#[test]
fn query_is_fetched_once_then_served_from_cache() {
    let caches = TempDir::new().unwrap();
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/fmqlEP")
            .query_param("fmql", "DESCRIBE TYPE 9_6");
        then.status(200)
            .body(r#"{"name":"BUILD","number":"9.6","fields":[]}"#);
    });

    for _ in 0..2 {
        let output = vdm()
            .arg("--caches")
            .arg(caches.path())
            .arg("--endpoint")
            .arg(server.url("/fmqlEP"))
            .args(["query", "CGVISTA", "DESCRIBE TYPE 9.6", "--json"])
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let reply: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(reply["name"], "BUILD");
    }
    mock.assert_hits(1);
    caches
        .child("CGVISTA/DESCRIBE_TYPE_9_6.json")
        .assert(predicate::path::is_file());

    // The cached copy is enough without any backend.
    vdm()
        .arg("--caches")
        .arg(caches.path())
        .args(["query", "CGVISTA", "DESCRIBE TYPE 9_6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("BUILD"));
}

#[test]
fn offline_miss_exits_with_code_2() {
    let caches = TempDir::new().unwrap();
    vdm()
        .arg("--caches")
        .arg(caches.path())
        .args(["query", "GOLD", "SELECT TYPES"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no FMQL backend configured"));
}

#[test]
fn entries_fill_the_cache_and_status_reports_it() {
    let caches = TempDir::new().unwrap();
    let server = MockServer::start();
    let count = server.mock(|when, then| {
        when.method(GET).path("/fmqlEP").query_param("fmql", "COUNT 9_6");
        then.status(200).body(r#"{"count":"3"}"#);
    });
    let page = server.mock(|when, then| {
        when.method(GET)
            .path("/fmqlEP")
            .query_param("fmql", "DESCRIBE 9_6 CSTOP 100 LIMIT 200 OFFSET 0");
        then.status(200)
            .body(describe_page(&["XU*8.0*1", "XU*8.0*2", "OR*3.0*1"]));
    });

    vdm()
        .arg("--caches")
        .arg(caches.path())
        .args(["status", "CGVISTA", "9.6"])
        .assert()
        .success()
        .stdout(predicate::str::contains("incomplete (0 pages cached"));

    vdm()
        .arg("--caches")
        .arg(caches.path())
        .arg("--endpoint")
        .arg(server.url("/fmqlEP"))
        .args(["entries", "CGVISTA", "9_6"])
        .assert()
        .success()
        .stdout("XU*8.0*1\nXU*8.0*2\nOR*3.0*1\n");
    count.assert_hits(1);
    page.assert_hits(1);

    vdm()
        .arg("--caches")
        .arg(caches.path())
        .args(["status", "CGVISTA", "9_6", "--json"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("\"complete\": true")
                .and(predicate::str::contains("\"cached_pages\": 1")),
        );

    // Streaming a complete cache needs no backend.
    vdm()
        .arg("--caches")
        .arg(caches.path())
        .args(["entries", "CGVISTA", "9_6", "--flat"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""name":"OR*3.0*1""#));
}

#[test]
fn schema_skips_files_below_the_minimum() {
    let caches = TempDir::new().unwrap();
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/fmqlEP").query_param("fmql", "SELECT TYPES");
        then.status(200).body(
            json!({"results": [
                {"number": "0.4", "name": "PRINT TEMPLATE", "count": "12"},
                {"number": "9.6", "name": "BUILD", "count": "2104"}
            ]})
            .to_string(),
        );
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/fmqlEP")
            .query_param("fmql", "DESCRIBE TYPE 0_4");
        then.status(200).body(r#"{"name":"PRINT TEMPLATE","number":"0.4"}"#);
    });
    server.mock(|when, then| {
        when.method(GET)
            .path("/fmqlEP")
            .query_param("fmql", "DESCRIBE TYPE 9_6");
        then.status(200).body(r#"{"name":"BUILD","number":"9.6"}"#);
    });

    vdm()
        .arg("--caches")
        .arg(caches.path())
        .arg("--endpoint")
        .arg(server.url("/fmqlEP"))
        .args(["schema", "CGVISTA"])
        .assert()
        .success()
        .stdout("1: 9.6 BUILD (2104)\n");

    // Both types were cached even though only one is listed.
    caches
        .child("CGVISTA/DESCRIBE_TYPE_0_4.json")
        .assert(predicate::path::is_file());
}

#[test]
fn config_file_supplies_the_backend() {
    let caches = TempDir::new().unwrap();
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/fmqlEP").query_param("fmql", "COUNT 200");
        then.status(200).body(r#"{"count":"55"}"#);
    });
    let config = caches.child("vdm.toml");
    config
        .write_str(&format!(
            "caches_root = {:?}\n\n[vistas.CGVISTA]\nendpoint = {:?}\n",
            caches.path().join("Caches").display().to_string(),
            server.url("/fmqlEP"),
        ))
        .unwrap();

    vdm()
        .arg("--config")
        .arg(config.path())
        .args(["query", "CGVISTA", "COUNT 200", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("55"));
    mock.assert();
    caches
        .child("Caches/CGVISTA/COUNT_200.json")
        .assert(predicate::path::missing());
}

#[test]
fn broker_flags_must_come_together() {
    let caches = TempDir::new().unwrap();
    vdm()
        .arg("--caches")
        .arg(caches.path())
        .args(["--host", "127.0.0.1", "query", "CGVISTA", "SELECT TYPES"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--cipher-pad"));
}

#[test]
fn cstop_does_not_combine_with_select() {
    let caches = TempDir::new().unwrap();
    vdm()
        .arg("--caches")
        .arg(caches.path())
        .args(["entries", "CGVISTA", "9_6", "--select", "--cstop", "5"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("cannot be used with"));
    caches
        .child("CGVISTA")
        .assert(predicate::path::missing());
}
