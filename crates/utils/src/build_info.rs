/// Git metadata captured by the build script, absent when building outside a checkout.
pub(crate) struct BuildInfo {
    pub(crate) commit_sha1: Option<&'static str>,
    pub(crate) branch: Option<&'static str>,
    git_dirty: Option<&'static str>,
}

impl BuildInfo {
    pub(crate) fn is_dirty(&self) -> bool {
        is_true(self.git_dirty)
    }
}

pub(crate) const BUILD_INFO: BuildInfo = BuildInfo {
    commit_sha1: option_env!("VERGEN_GIT_SHA"),
    branch: option_env!("VERGEN_GIT_BRANCH"),
    git_dirty: option_env!("VERGEN_GIT_DIRTY"),
};

fn is_true(flag: Option<&str>) -> bool {
    flag.is_some_and(|flag| flag.trim() == "true")
}
