//! Runtime tool path resolution
//!
//! External tools (docker, git) are invoked through a `{TOOL}_BIN`
//! environment-variable override with a PATH fallback, so packaged
//! deployments can pin exact binaries while development machines just use
//! whatever is installed.

use std::env;

/// Get the path to an external tool.
///
/// Checks `{TOOL}_BIN` (uppercase tool name + "_BIN") and falls back to the
/// tool name itself, which relies on PATH.
pub fn get_tool_path(tool: &str) -> String {
    let env_var = format!("{}_BIN", tool.to_uppercase());
    env::var(&env_var).unwrap_or_else(|_| tool.to_string())
}

/// Common tool names.
pub mod tools {
    pub const DOCKER: &str = "docker";
    pub const GIT: &str = "git";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_tool_path_from_env() {
        env::set_var("TEST_TOOL_BIN", "/custom/path/to/test-tool");
        assert_eq!(get_tool_path("test-tool"), "/custom/path/to/test-tool");
        env::remove_var("TEST_TOOL_BIN");
    }

    #[test]
    fn test_get_tool_path_fallback() {
        env::remove_var("MISSING_TOOL_BIN");
        assert_eq!(get_tool_path("missing-tool"), "missing-tool");
    }
}
