use std::sync::LazyLock;

use crate::build_info::BUILD_INFO;

/// Version string reported by `--version` and the startup log line.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    format_version(
        env!("IMAGE_VERSION"),
        BUILD_INFO.commit_sha1,
        BUILD_INFO.is_dirty(),
    )
});

/// Branch the binary was built from, if known.
pub fn branch() -> Option<&'static str> {
    BUILD_INFO.branch
}

fn format_version(image: &str, sha: Option<&str>, dirty: bool) -> String {
    let sha = sha.map(|sha| &sha[..sha.len().min(8)]).unwrap_or("unknown");
    format!("{image}-{sha}{}", if dirty { "-dirty" } else { "" })
}
