//! CLI interface logic: the outer process-supervision shell's argument surface.

use std::path::PathBuf;
use std::time::Duration;

/// The CLI command with its parameters, parsed from the arguments provided to the process.
#[derive(clap::Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// A primary-index candidate, local path or URL. Repeatable; tried in order
    /// until one resolves.
    #[arg(
        long = "index",
        value_name = "PATH_OR_URL",
        env = "PARA_INDEX",
        value_delimiter = ',',
        help = "A primary index candidate (path or URL), repeatable."
    )]
    pub index: Vec<String>,

    /// A directory of extension override files, `<kind>.<name>.yaml`. Repeatable;
    /// scanned in reverse order, so the last `--extensions` wins.
    #[arg(long = "extensions", value_name = "DIR", help = "An extension directory, repeatable.")]
    pub extensions: Vec<PathBuf>,

    /// Explicit cache root override. See the cache discovery order if omitted.
    #[arg(long, value_name = "CACHE_PATH", help = "Explicit cache root override.")]
    pub cache: Option<PathBuf>,

    /// Maximum age of a cached entry before it is treated as stale.
    #[arg(
        long,
        value_name = "DURATION",
        default_value = "1h",
        value_parser = parse_duration,
        help = "Cache refresh interval, e.g. '1h', '30m'."
    )]
    pub refresh: Duration,

    /// Tear down a stale mount at this path and exit, skipping everything else.
    #[arg(long, value_name = "PATH", help = "Unmount a stale mount at this path and exit.")]
    pub unmount: Option<PathBuf>,

    /// The host tool this instance serves plugins to, e.g. `terraform`. Defaults
    /// to `argv[0]`'s basename suffix if it follows the `para-<host-tool>` shape.
    #[arg(long = "host-tool", value_name = "NAME")]
    pub host_tool: Option<String>,

    /// The command to run as the supervised sub-process, after `--`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw).map_err(|e| e.to_string())
}

impl Cli {
    /// Resolve the host tool name: the explicit flag, or the suffix of
    /// `argv[0]` after the last `-` in a `para-<host-tool>` shaped binary name.
    pub fn resolve_host_tool(&self, argv0: &str) -> Option<String> {
        if let Some(name) = &self.host_tool {
            return Some(name.clone());
        }

        let basename = argv0.rsplit(['/', '\\']).next().unwrap_or(argv0);
        basename
            .strip_prefix("para-")
            .filter(|rest| !rest.is_empty())
            .map(str::to_owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_repeatable_index_and_extensions() {
        let cli = Cli::parse_from([
            "lazyplug",
            "--index",
            "https://example.com/index.yaml",
            "--extensions",
            "/etc/para/ext-a",
            "--extensions",
            "/etc/para/ext-b",
            "--",
            "plan",
        ]);

        assert_eq!(cli.index, vec!["https://example.com/index.yaml".to_owned()]);
        assert_eq!(
            cli.extensions,
            vec![PathBuf::from("/etc/para/ext-a"), PathBuf::from("/etc/para/ext-b")]
        );
        assert_eq!(cli.command, vec!["plan".to_owned()]);
    }

    #[test]
    fn refresh_defaults_to_one_hour() {
        let cli = Cli::parse_from(["lazyplug", "--", "plan"]);
        assert_eq!(cli.refresh, Duration::from_secs(3600));
    }

    #[test]
    fn refresh_parses_humantime_durations() {
        let cli = Cli::parse_from(["lazyplug", "--refresh", "30m", "--", "plan"]);
        assert_eq!(cli.refresh, Duration::from_secs(1800));
    }

    #[test]
    fn host_tool_falls_back_to_argv0_suffix() {
        let cli = Cli::parse_from(["lazyplug", "--", "plan"]);
        assert_eq!(cli.resolve_host_tool("/usr/local/bin/para-terraform"), Some("terraform".to_owned()));
        assert_eq!(cli.resolve_host_tool("/usr/local/bin/lazyplug"), None);
    }

    #[test]
    fn host_tool_flag_overrides_argv0() {
        let cli = Cli::parse_from(["lazyplug", "--host-tool", "packer", "--", "plan"]);
        assert_eq!(cli.resolve_host_tool("para-terraform"), Some("packer".to_owned()));
    }
}
