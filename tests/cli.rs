use std::io::Write;
use std::path::Path;
use std::process::Command;

fn demo(name: &str) -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("demos")
        .join(name)
        .to_string_lossy()
        .to_string()
}

fn run_c1x(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_c1x"))
        .args(args)
        .output()
        .expect("failed to execute c1x");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn config_file(text: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

#[test]
fn test_compile_prints_target_method() {
    let (stdout, stderr, success) = run_c1x(&["compile", &demo("average.json")]);
    assert!(success, "compile should succeed, stderr:\n{}", stderr);
    assert!(stdout.contains("target method Math.average(II)I"), "{}", stdout);
    assert!(stdout.contains("safepoint"), "{}", stdout);
}

#[test]
fn test_compile_json_output() {
    let (stdout, stderr, success) =
        run_c1x(&["compile", &demo("average.json"), "--format", "json"]);
    assert!(success, "compile should succeed, stderr:\n{}", stderr);
    let method: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(method["name"], "Math.average(II)I");
    assert_eq!(method["kind"], "method");
    let stops = method["stops"].as_array().unwrap();
    assert!(stops.iter().any(|s| s["kind"] == "safepoint"));
}

#[test]
fn test_compile_with_ia32_config() {
    let (stdout, stderr, success) = run_c1x(&[
        "compile",
        &demo("average.json"),
        "--config",
        &demo("ia32.toml"),
        "--format",
        "json",
    ]);
    assert!(success, "compile should succeed, stderr:\n{}", stderr);
    let method: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(method["word_size"], 4);
}

#[test]
fn test_config_prints_effective_values() {
    let file = config_file("use_fast_locking = false\n\n[target]\narch = \"ia32\"\n");
    let (stdout, stderr, success) = run_c1x(&["config", "--config", file.path().to_str().unwrap()]);
    assert!(success, "config should succeed, stderr:\n{}", stderr);
    assert!(stdout.contains("use_fast_locking = false"), "{}", stdout);
    assert!(stdout.contains("arch = \"ia32\""), "{}", stdout);
    // untouched options keep their defaults
    assert!(stdout.contains("fast_path_type_check = true"), "{}", stdout);
}

#[test]
fn test_invalid_config_fails() {
    let file = config_file("use_fast_locking = \"sometimes\"\n");
    let (_, stderr, success) = run_c1x(&["config", "--config", file.path().to_str().unwrap()]);
    assert!(!success, "config should fail");
    assert!(stderr.contains("invalid configuration"), "{}", stderr);
}

#[test]
fn test_missing_input_fails() {
    let (_, stderr, success) = run_c1x(&["compile", "does-not-exist.json"]);
    assert!(!success, "compile should fail");
    assert!(stderr.contains("failed to read"), "{}", stderr);
}
