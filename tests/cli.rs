use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn deck_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("deck");
    path
}

/// Write a config that needs no API key and points the runtime at
/// `rscript`.
fn setup_test_env(rscript: &str, renderer: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("deck.toml");
    let config = format!(
        r#"[llm]
base_url = "http://127.0.0.1:9/v1"
api_key_env = ""

[runtime]
command = "{}"
timeout_secs = 10

[render]
renderer = "{}"

[server]
bind = "127.0.0.1:7340"
"#,
        rscript, renderer
    );
    fs::write(&config_path, config).unwrap();
    (tmp, config_path)
}

fn run_deck(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = deck_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run deck binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_templates_list() {
    let (_tmp, config) = setup_test_env("Rscript", "passthrough");

    let (stdout, stderr, ok) = run_deck(&config, &["templates", "list"]);
    assert!(ok, "templates list failed: {}", stderr);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 12);
    assert!(lines[0].starts_with("classic"));
    assert!(stdout.contains("contrast="));

    let (stdout, _, ok) = run_deck(&config, &["templates", "list", "--readable"]);
    assert!(ok);
    assert!(stdout.lines().count() < 12);
    assert!(!stdout.contains("fog"));
    assert!(stdout.contains("midnight"));
}

#[test]
fn test_templates_sample() {
    let (_tmp, config) = setup_test_env("Rscript", "passthrough");
    let (stdout, _, ok) = run_deck(&config, &["templates", "sample", "3"]);
    assert!(ok);
    assert_eq!(stdout.lines().count(), 3);
}

#[test]
fn test_templates_work_without_config_file() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (stdout, _, ok) = run_deck(&missing, &["templates", "list"]);
    assert!(ok);
    assert_eq!(stdout.lines().count(), 12);
}

#[test]
fn test_compile_markdown() {
    let (tmp, config) = setup_test_env("Rscript", "passthrough");
    let outline = tmp.path().join("outline.md");
    fs::write(&outline, "# Intro\n---\n## Point\n- first\n- second\n").unwrap();

    let (stdout, stderr, ok) = run_deck(
        &config,
        &["compile", outline.to_str().unwrap(), "--template", "paper", "--markdown"],
    );
    assert!(ok, "compile failed: {}", stderr);
    assert!(stdout.starts_with("---\nmarp: true\n"));
    assert!(stdout.contains("background: #fdf6e3;"));
    assert!(stdout.contains("# Intro\n\n---\n\n## Point\n- first"));
}

#[test]
fn test_compile_writes_out_file() {
    let (tmp, config) = setup_test_env("Rscript", "passthrough");
    let outline = tmp.path().join("outline.md");
    let out = tmp.path().join("deck.md");
    fs::write(&outline, "# Only slide\n").unwrap();

    let (_, stderr, ok) = run_deck(
        &config,
        &["compile", outline.to_str().unwrap(), "--out", out.to_str().unwrap()],
    );
    assert!(ok, "compile failed: {}", stderr);
    assert!(stderr.contains("Wrote"));
    let deck = fs::read_to_string(&out).unwrap();
    assert!(deck.contains("theme: default"));
    assert!(deck.contains("# Only slide"));
}

#[test]
fn test_compile_unknown_template_fails() {
    let (tmp, config) = setup_test_env("Rscript", "passthrough");
    let outline = tmp.path().join("outline.md");
    fs::write(&outline, "# Intro\n").unwrap();

    let (_, stderr, ok) = run_deck(
        &config,
        &["compile", outline.to_str().unwrap(), "--template", "neon"],
    );
    assert!(!ok);
    assert!(stderr.contains("Unknown template: neon"));
}

#[test]
fn test_bad_renderer_config_fails() {
    let (tmp, config) = setup_test_env("Rscript", "pandoc");
    let outline = tmp.path().join("outline.md");
    fs::write(&outline, "# Intro\n").unwrap();

    let (_, stderr, ok) = run_deck(&config, &["compile", outline.to_str().unwrap()]);
    assert!(!ok);
    assert!(stderr.contains("Unknown renderer"));
}

#[cfg(unix)]
#[test]
fn test_exec_with_fake_runtime() {
    use std::os::unix::fs::PermissionsExt;

    let scripts = TempDir::new().unwrap();
    let fake = scripts.path().join("fake-rscript");
    fs::write(
        &fake,
        "#!/bin/sh\nprintf '[1] 2' > \"$(dirname \"$2\")/out.txt\"\n",
    )
    .unwrap();
    fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();

    let (tmp, config) = setup_test_env(fake.to_str().unwrap(), "passthrough");
    let code = tmp.path().join("sum.R");
    fs::write(&code, "1 + 1\n").unwrap();

    let (stdout, stderr, ok) = run_deck(
        &config,
        &["exec", code.to_str().unwrap(), "--kind", "generic"],
    );
    assert!(ok, "exec failed: {}", stderr);
    assert_eq!(stdout.trim(), "[1] 2");
    assert!(stderr.contains("text/plain"));
}
