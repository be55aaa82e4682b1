use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn welearn_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("welearn-api");
    path
}

const OVERRIDES: [&str; 8] = [
    "QDRANT_HOST",
    "QDRANT_API_KEY",
    "PG_PASSWORD",
    "PG_DATABASE",
    "AZURE_API_KEY",
    "AZURE_MISTRAL_API_KEY",
    "CLIENT_ORIGINS_REGEX",
    "BIND_ADDR",
];

fn write_config(content: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let config_dir = tmp.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let path = config_dir.join("welearn.toml");
    fs::write(&path, content).unwrap();
    (tmp, path)
}

fn run(config_path: &Path, args: &[&str], env: &[(&str, &str)]) -> (String, String, bool) {
    let binary = welearn_binary();
    let mut cmd = Command::new(&binary);
    for key in OVERRIDES {
        cmd.env_remove(key);
    }
    let output = cmd
        .envs(env.iter().copied())
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run welearn-api binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_check_config_masks_secrets() {
    let (_tmp, config) = write_config(
        r#"[server]
bind = "127.0.0.1:9090"

[postgres]
user = "welearn"
password = "s3cret"
database = "welearn_test"

[chat.llm]
base_url = "https://example.openai.azure.com"
api_key = "sk-live-123"
"#,
    );

    let (stdout, stderr, success) = run(&config, &["check-config"], &[]);
    assert!(success, "check-config failed: {}", stderr);
    assert!(stdout.contains("127.0.0.1:9090"));
    assert!(stdout.contains("welearn_test"));
    assert!(stdout.contains("********"));
    assert!(!stdout.contains("s3cret"));
    assert!(!stdout.contains("sk-live-123"));
}

#[test]
fn test_env_overrides_file_values() {
    let (_tmp, config) = write_config("[qdrant]\nhost = \"qdrant.internal\"\n");

    let (stdout, stderr, success) = run(
        &config,
        &["check-config"],
        &[("QDRANT_HOST", "qdrant.prod"), ("BIND_ADDR", "127.0.0.1:7000")],
    );
    assert!(success, "check-config failed: {}", stderr);
    assert!(stdout.contains("qdrant.prod"));
    assert!(!stdout.contains("qdrant.internal"));
    assert!(stdout.contains("127.0.0.1:7000"));
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");

    let (stdout, stderr, success) = run(&missing, &["check-config"], &[]);
    assert!(success, "check-config failed: {}", stderr);
    assert!(stdout.contains("0.0.0.0:8080"));
    assert!(stdout.contains("/api/v1"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config) = write_config("[search]\nscore_threshold = 1.5\n");
    let (_stdout, stderr, success) = run(&config, &["check-config"], &[]);
    assert!(!success);
    assert!(stderr.contains("score_threshold"), "unexpected stderr: {}", stderr);

    let (_tmp, config) = write_config("[server]\napi_v1_prefix = \"api/v1/\"\n");
    let (_stdout, stderr, success) = run(&config, &["check-config"], &[]);
    assert!(!success);
    assert!(stderr.contains("api_v1_prefix"), "unexpected stderr: {}", stderr);

    let (_tmp, config) = write_config("[server\n");
    let (_stdout, stderr, success) = run(&config, &["check-config"], &[]);
    assert!(!success);
    assert!(stderr.contains("Failed to parse config file"), "unexpected stderr: {}", stderr);
}

#[test]
fn test_help_lists_commands() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _stderr, success) = run(&tmp.path().join("unused.toml"), &["--help"], &[]);
    assert!(success);
    for command in ["serve", "collections", "search", "check-config"] {
        assert!(stdout.contains(command), "missing {} in help", command);
    }
}

#[test]
fn test_example_config_is_valid() {
    let example = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/welearn.example.toml");
    let (stdout, stderr, success) = run(&example, &["check-config"], &[]);
    assert!(success, "example config rejected: {}", stderr);
    assert!(stdout.contains("Mistral-Large-2411"));
}
