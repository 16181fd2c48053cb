pub fn get_version_info() -> String {
    format!(
        "voipmon {}\nBuild Time: {}\nGit Commit: {}",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME"),
        env!("GIT_COMMIT_HASH"),
    )
}

pub fn get_short_version() -> String {
    format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("GIT_COMMIT_HASH"))
}
