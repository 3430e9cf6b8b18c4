//! Integration tests for Rootsmith

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Command isolated from the user's config and registry environment
    fn rootsmith(config_dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("rootsmith");
        cmd.env("ROOTSMITH_CONFIG", config_dir.path().join("config.toml"))
            .env_remove("AWS_ACCOUNT_ID")
            .env_remove("AWS_REGION")
            .env_remove("AWS_ECR_REPOSITORY_NAME")
            .env_remove("ENVIRONMENT");
        cmd
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        rootsmith(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("VM root filesystem builder"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        rootsmith(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("rootsmith"));
    }

    #[test]
    fn config_path() {
        let dir = TempDir::new().unwrap();
        rootsmith(&dir)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let dir = TempDir::new().unwrap();
        rootsmith(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("retention_hours = 25"));
    }

    #[test]
    fn config_set_persists() {
        let dir = TempDir::new().unwrap();
        rootsmith(&dir)
            .args(["config", "set", "build.max_rootfs_mb", "2048"])
            .assert()
            .success();

        rootsmith(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_rootfs_mb = 2048"));
    }

    #[test]
    fn config_set_unknown_key() {
        let dir = TempDir::new().unwrap();
        rootsmith(&dir)
            .args(["config", "set", "vm.name", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown key"));
    }

    #[test]
    fn build_rejects_invalid_reference() {
        let dir = TempDir::new().unwrap();
        rootsmith(&dir)
            .args(["build", "bad ref"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid image reference"));
    }

    #[test]
    fn ecr_build_reports_missing_variables() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[registry]\nauth = \"ecr\"\n").unwrap();

        rootsmith(&dir)
            .args(["size", "alpine:3.19"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("AWS_ACCOUNT_ID"))
            .stderr(predicate::str::contains("AWS_ECR_REPOSITORY_NAME"));
    }
}
