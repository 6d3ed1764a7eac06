use std::path::PathBuf;

/// Path to a stub script under the workspace `test_targets/` directory.
pub(crate) fn test_target(name: &str) -> PathBuf {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let path = manifest_dir.join("../test_targets").join(name);
    if !path.exists() {
        panic!("Test target missing: {path:?}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755));
    }
    path
}
