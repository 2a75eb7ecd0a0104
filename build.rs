use std::process::Command;

fn command_line(cmd: &str, args: &[&str]) -> Option<String> {
  let output = Command::new(cmd).args(args).output().ok()?;
  if !output.status.success() {
    return None;
  }
  let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
  if text.is_empty() {
    None
  } else {
    Some(text)
  }
}

fn main() {
  let commit = command_line("git", &["rev-parse", "--short", "HEAD"])
    .unwrap_or_else(|| "dev".to_string());
  println!("cargo:rustc-env=ASSETPROXY_COMMIT={}", commit);

  let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
  let toolchain =
    command_line(&rustc, &["--version"]).unwrap_or_else(|| "unknown".to_string());
  println!("cargo:rustc-env=ASSETPROXY_RUSTC={}", toolchain);

  println!("cargo:rerun-if-changed=build.rs");
}
