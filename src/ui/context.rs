//! Interactive terminal detection

use std::io::IsTerminal;

/// CI systems that set their own marker variable
const CI_VARS: &[&str] = &[
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "BUILDKITE",
    "JENKINS_URL",
    "TF_BUILD",
];

/// Decides how output is rendered
#[derive(Debug, Clone, Copy)]
pub struct UiContext {
    fancy: bool,
}

impl UiContext {
    pub fn detect() -> Self {
        Self {
            fancy: Self::detect_fancy(|key| std::env::var_os(key).is_some()),
        }
    }

    /// Plain output, for tests and log capture
    pub fn plain() -> Self {
        Self { fancy: false }
    }

    pub fn use_fancy_output(&self) -> bool {
        self.fancy
    }

    fn detect_fancy(is_set: impl Fn(&str) -> bool) -> bool {
        std::io::stdout().is_terminal() && !CI_VARS.iter().any(|var| is_set(var))
    }
}
