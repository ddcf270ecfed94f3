use std::env;
use std::process::Command;

struct BuildStamp {
    env_key: &'static str,
    github: fn() -> Option<String>,
    git_args: &'static [&'static str],
}

const STAMPS: &[BuildStamp] = &[
    BuildStamp {
        env_key: "CYCLEKEEPER_GIT_TAG",
        github: github_release_tag,
        git_args: &["describe", "--tags", "--exact-match", "HEAD"],
    },
    BuildStamp {
        env_key: "CYCLEKEEPER_GIT_COMMIT",
        github: github_short_sha,
        git_args: &["rev-parse", "--short=12", "HEAD"],
    },
];

fn main() {
    for stamp in STAMPS {
        println!("cargo:rerun-if-env-changed={}", stamp.env_key);
        let value = nonempty(env::var(stamp.env_key).ok())
            .or_else(stamp.github)
            .or_else(|| git_output(stamp.git_args));
        if let Some(value) = value {
            println!("cargo:rustc-env={}={value}", stamp.env_key);
        }
    }
    println!("cargo:rerun-if-changed=.git/HEAD");
}

fn nonempty(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn git_output(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    nonempty(String::from_utf8(output.stdout).ok())
}

fn github_release_tag() -> Option<String> {
    if env::var("GITHUB_REF_TYPE").ok()?.trim() != "tag" {
        return None;
    }
    nonempty(env::var("GITHUB_REF_NAME").ok())
}

fn github_short_sha() -> Option<String> {
    let sha = nonempty(env::var("GITHUB_SHA").ok())?;
    nonempty(Some(sha.chars().take(12).collect()))
}
