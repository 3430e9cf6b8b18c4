//! Terminal output for the CLI
//!
//! Styled symbols on an interactive terminal, bracketed tags in CI and
//! when piped.

mod context;
mod output;

pub use context::UiContext;
pub use output::{
    key_value, remark, section, step_error_detail, step_info, step_ok,
    step_ok_detail, step_warn, step_warn_hint,
};
