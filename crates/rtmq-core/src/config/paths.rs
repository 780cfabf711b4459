//! Standard locations for rtmq configuration files

use std::path::PathBuf;

/// `$XDG_CONFIG_HOME/rtmq`, or `./rtmq` when no config dir is known
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rtmq")
}

/// Path of a config file inside [`default_config_dir`]
pub fn default_config_path(filename: &str) -> PathBuf {
    default_config_dir().join(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dir_ends_with_rtmq() {
        assert!(default_config_dir().ends_with("rtmq"));
    }

    #[test]
    fn test_config_path_includes_filename() {
        let path = default_config_path("stream.yaml");
        assert!(path.ends_with("rtmq/stream.yaml"));
    }
}
