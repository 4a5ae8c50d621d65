//! HTTP downloads via curl.

use crate::command::CommandArgs;
use std::path::PathBuf;

/// `curl -fsSL --retry 2 -o <dest> <url>`
#[derive(Debug, Clone)]
pub struct CurlDownload {
    pub url: String,
    pub dest: PathBuf,
}

impl CommandArgs for CurlDownload {
    fn program(&self) -> &'static str {
        "curl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-fsSL".to_string(),
            "--retry".to_string(),
            "2".to_string(),
            "--connect-timeout".to_string(),
            "30".to_string(),
            "--create-dirs".to_string(),
            "-o".to_string(),
            self.dest.display().to_string(),
            "--".to_string(),
            self.url.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_args_end_with_url() {
        let args = CurlDownload {
            url: "https://example.org/tool.jar".to_string(),
            dest: PathBuf::from("/opt/tools/tool.jar"),
        }
        .to_cli_args();
        assert_eq!(args.last().unwrap(), "https://example.org/tool.jar");
        let o = args.iter().position(|a| a == "-o").unwrap();
        assert_eq!(args[o + 1], "/opt/tools/tool.jar");
    }
}
