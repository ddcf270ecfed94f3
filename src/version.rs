pub(crate) const RELEASE_VERSION: &str = match option_env!("CYCLEKEEPER_GIT_TAG") {
    Some(value) => value,
    None => env!("CARGO_PKG_VERSION"),
};

const BUILD_COMMIT: Option<&str> = option_env!("CYCLEKEEPER_GIT_COMMIT");

/// Version line shown in the startup banner, e.g. `v0.1.0 (1a2b3c4d5e6f)`.
pub(crate) fn banner_version() -> String {
    format_banner_version(RELEASE_VERSION, BUILD_COMMIT)
}

fn format_banner_version(version: &str, commit: Option<&str>) -> String {
    let version = if version.chars().next().is_some_and(|ch| ch.is_ascii_digit()) {
        format!("v{version}")
    } else {
        version.to_string()
    };
    match commit.map(str::trim).filter(|commit| !commit.is_empty()) {
        Some(commit) if !version.contains(commit) => format!("{version} ({commit})"),
        _ => version,
    }
}
