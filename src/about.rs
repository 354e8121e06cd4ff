pub const TRACESCAN_DISPLAY_VERSION: &str = env!("TRACESCAN_DISPLAY_VERSION");
pub const TRACESCAN_BUILD_N: &str = env!("TRACESCAN_BUILD_N");

pub fn version_cli_text() -> String {
    format!(
        "TRACEscan {}\nBuild {}\nMutation detection for sequencing chromatograms",
        TRACESCAN_DISPLAY_VERSION, TRACESCAN_BUILD_N
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_text_names_build() {
        let text = version_cli_text();
        assert!(text.starts_with("TRACEscan "));
        assert!(text.contains(TRACESCAN_BUILD_N));
    }
}
