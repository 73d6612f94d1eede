//! Error classification for nonzero command exits.
//!
//! Some geoprocessing tools exit nonzero after printing noise that is not an
//! actual failure (deprecation notices, projection warnings). Error text
//! matching one of the configured fragments does not mark the command Failed.

/// Default benign fragments; extend per run via
/// `RunConfig::benign_error_patterns`.
pub fn default_benign_patterns() -> Vec<String> {
    [
        "DeprecationWarning",
        "Warning 1:",
        "libpng warning",
        "PROJ: proj_create_from_database",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Case-sensitive substring match against the benign list.
pub fn is_benign(error_text: &str, patterns: &[String]) -> bool {
    !error_text.is_empty() && patterns.iter().any(|p| error_text.contains(p.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_fragment_matches() {
        let patterns = default_benign_patterns();
        assert!(is_benign(
            "Warning 1: TIFF tag GeoPixelScale unknown, ignored",
            &patterns
        ));
        assert!(is_benign(
            "script.py:12: DeprecationWarning: use warp_v2",
            &patterns
        ));
    }

    #[test]
    fn real_errors_do_not_match() {
        let patterns = default_benign_patterns();
        assert!(!is_benign("ERROR 4: in.tif: No such file or directory", &patterns));
        assert!(!is_benign("", &patterns));
    }

    #[test]
    fn custom_patterns_extend_the_list() {
        let patterns = vec!["false error".to_string()];
        assert!(is_benign("tool reported false error, output written", &patterns));
    }
}
