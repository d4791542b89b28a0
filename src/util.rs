//! Small helpers shared across modules: logger setup and path utilities.

use env_logger::WriteStyle;
use log::LevelFilter;
use owo_colors::{AnsiColors, OwoColorize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOG_LEVEL_COLORS: [AnsiColors; 5] = [
    AnsiColors::BrightRed,
    AnsiColors::Yellow,
    AnsiColors::BrightBlue,
    AnsiColors::Green,
    AnsiColors::Cyan,
];

#[cfg(debug_assertions)]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Trace;
#[cfg(not(debug_assertions))]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// Initialize the logger with the default format
#[cold]
pub(crate) fn setup_logger() {
    env_logger::builder()
        .parse_default_env()
        .filter_level(LOG_LEVEL)
        .write_style(WriteStyle::Auto)
        .format(|formatter, record| {
            let level = record.level();
            // levels start at ordinal 1, so we need to shift them down by 1
            let color = LOG_LEVEL_COLORS[(level as usize) - 1];

            writeln!(
                formatter,
                "[{level}]: {message}",
                level = level.color(color),
                message = record.args()
            )
        })
        .init();
}

/// Expand a leading `~` into the user's home directory. Returns the path unchanged if no
/// home directory can be found or the path doesn't start with `~`.
pub fn expand_tilde(path: &str) -> PathBuf {
    let Some(rest) = path.strip_prefix('~') else {
        return PathBuf::from(path);
    };

    let Some(home) = directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf()) else {
        return PathBuf::from(path);
    };

    let rest = rest.strip_prefix('/').unwrap_or(rest);
    home.join(rest)
}

/// Render a path relative to `$TMPDIR` or `~` for friendlier diagnostics, mirroring the
/// original tool's `simplifyPath`.
pub fn simplify_path(path: &Path) -> String {
    let tmp_dir = std::env::temp_dir();
    if let Ok(stripped) = path.strip_prefix(&tmp_dir) {
        return format!("$TMPDIR/{}", stripped.display());
    }

    if let Some(home) = directories::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf()) {
        if let Ok(stripped) = path.strip_prefix(&home) {
            return format!("~/{}", stripped.display());
        }
    }

    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_without_tilde_is_unchanged() {
        assert_eq!(
            expand_tilde("/etc/para.idx.yaml"),
            PathBuf::from("/etc/para.idx.yaml")
        );
    }

    #[test]
    fn expand_tilde_substitutes_home() {
        let home = directories::BaseDirs::new().unwrap().home_dir().to_path_buf();
        assert_eq!(expand_tilde("~/para.idx.yaml"), home.join("para.idx.yaml"));
    }

    #[test]
    fn simplify_path_uses_tmpdir_shorthand() {
        let path = std::env::temp_dir().join("para-1000");
        assert_eq!(simplify_path(&path), "$TMPDIR/para-1000");
    }
}
