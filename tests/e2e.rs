use std::process::Command;

const HEADER: &str =
    "ride,status,passenger,driver,passenger_completed,driver_completed,escrow_state";

fn run(fixture: &str) -> (String, String, bool) {
    let path = format!("tests/fixtures/{fixture}");
    let output = Command::new(env!("CARGO_BIN_EXE_ride-escrow"))
        .arg(&path)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn valid_script() {
    let (stdout, stderr, success) = run("valid.csv");

    assert!(success);
    assert!(stderr.is_empty(), "unexpected warnings: {stderr}");

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], HEADER);
    assert_eq!(lines[1], "r1,completed,alice,dave,true,true,released");
    assert_eq!(lines[2], "r2,cancelled,bob,erin,false,false,none");
    assert_eq!(lines.len(), 3);
}

#[test]
fn errors_warn_but_do_not_block() {
    let (stdout, stderr, success) = run("with_errors.csv");

    assert!(success);
    assert!(stderr.contains("unrecognized command 'teleport'"));
    assert!(stderr.contains("fund missing fare"));
    assert!(stderr.contains("finish your current ride first"));
    assert!(stderr.contains("not within reach"));
    assert!(stderr.contains("ride 'r9' was never requested"));

    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], HEADER);
    assert_eq!(lines[1], "r1,completed,alice,erin,true,true,none");
    assert_eq!(lines.len(), 2);
}

#[test]
fn missing_script_fails() {
    let (stdout, stderr, success) = run("does_not_exist.csv");

    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("cannot open"));
}
