//! Recording file path resolution.
//!
//! A session recording file name is generated from a configurable pattern.
//! The following placeholders are recognised:
//!
//! - `~/` - the user's home directory (only at the start of the pattern).
//!   The `~` is replaced textually, so `~//rec` stays under the home
//!   directory and an unknown home leaves just the root-relative remainder.
//! - `%d` - the current date (`YYYY-MM-DD`)
//! - `%t` - the current time (`HH.MM.SS`)
//! - `%i` - the session identifier
//!
//! If the pattern (after home expansion) names an existing directory, the
//! default pattern [`DEFAULT_RECORDING_PATTERN`] inside that directory is
//! used instead. An empty pattern disables recording.

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// File name pattern used when the configured pattern is a directory.
pub const DEFAULT_RECORDING_PATTERN: &str = "%d %t session %i.dprec";

const HOME_PREFIX: &str = "~/";

/// A recording file name pattern as configured by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordingPattern(String);

impl RecordingPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if recording is disabled.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolves the pattern for a new session using explicit inputs.
    pub fn resolve(
        &self,
        session_id: SessionId,
        now: NaiveDateTime,
        home: Option<&Path>,
    ) -> Option<PathBuf> {
        resolve_recording_path(&self.0, session_id, now, home)
    }

    /// Resolves the pattern using the local clock and the invoking user's
    /// home directory.
    ///
    /// Call this once per session, when the session is created.
    pub fn resolve_now(&self, session_id: SessionId) -> Option<PathBuf> {
        let home = dirs::home_dir();
        self.resolve(session_id, Local::now().naive_local(), home.as_deref())
    }
}

impl From<String> for RecordingPattern {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Expands a recording file name pattern into an absolute path.
///
/// Returns `None` when the pattern is empty, meaning the session is not
/// recorded. Given the same pattern, session id, time and filesystem state
/// the result is always the same.
pub fn resolve_recording_path(
    pattern: &str,
    session_id: SessionId,
    now: NaiveDateTime,
    home: Option<&Path>,
) -> Option<PathBuf> {
    if pattern.is_empty() {
        return None;
    }

    let mut filename = expand_home(pattern, home);

    if Path::new(&filename).is_dir() {
        filename = Path::new(&filename)
            .join(DEFAULT_RECORDING_PATTERN)
            .to_string_lossy()
            .into_owned();
    }

    let filename = filename
        .replace("%d", &now.format("%Y-%m-%d").to_string())
        .replace("%t", &now.format("%H.%M.%S").to_string())
        .replace("%i", &session_id.to_string());

    Some(make_absolute(PathBuf::from(filename)))
}

fn expand_home(pattern: &str, home: Option<&Path>) -> String {
    if !pattern.starts_with(HOME_PREFIX) {
        return pattern.to_string();
    }

    // Textual substitution of the `~`: the remainder keeps its leading slash
    let rest = pattern.strip_prefix('~').unwrap_or(pattern);
    let home = match home {
        Some(home) => home.to_string_lossy().into_owned(),
        None => {
            tracing::warn!(pattern, "Home directory unknown, expanding ~ to nothing");
            String::new()
        }
    };
    format!("{home}{rest}")
}

fn make_absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    std::path::absolute(&path).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn test_now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(14, 7, 2)
            .unwrap()
    }

    #[test]
    fn test_empty_pattern_disables_recording() {
        let result = resolve_recording_path("", SessionId::new(7), test_now(), None);
        assert_eq!(result, None);
        assert!(RecordingPattern::default().is_empty());
    }

    #[test]
    fn test_home_and_placeholders_expanded() {
        let result = resolve_recording_path(
            "~/rec/%d %t session %i.dprec",
            SessionId::new(7),
            test_now(),
            Some(Path::new("/home/u")),
        );
        assert_eq!(
            result,
            Some(PathBuf::from("/home/u/rec/2024-03-05 14.07.02 session 7.dprec"))
        );
    }

    #[test]
    fn test_tilde_only_expanded_at_start() {
        let result = resolve_recording_path(
            "/data/~/%i.dprec",
            SessionId::new(3),
            test_now(),
            Some(Path::new("/home/u")),
        );
        assert_eq!(result, Some(PathBuf::from("/data/~/3.dprec")));
    }

    #[test]
    fn test_repeated_placeholders_all_replaced() {
        let result = resolve_recording_path(
            "/rec/%i/%d-%i.dprec",
            SessionId::new(12),
            test_now(),
            None,
        );
        assert_eq!(result, Some(PathBuf::from("/rec/12/2024-03-05-12.dprec")));
    }

    #[test]
    fn test_existing_directory_uses_default_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = dir.path().to_string_lossy().into_owned();

        let result = resolve_recording_path(&pattern, SessionId::new(7), test_now(), None);

        assert_eq!(
            result,
            Some(dir.path().join("2024-03-05 14.07.02 session 7.dprec"))
        );
    }

    #[test]
    fn test_home_relative_directory_uses_default_pattern() {
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join("rec")).unwrap();

        let result = resolve_recording_path(
            "~/rec",
            SessionId::new(7),
            test_now(),
            Some(home.path()),
        );

        assert_eq!(
            result,
            Some(home.path().join("rec/2024-03-05 14.07.02 session 7.dprec"))
        );
    }

    #[test]
    fn test_relative_pattern_made_absolute() {
        let result =
            resolve_recording_path("rec-%i.dprec", SessionId::new(1), test_now(), None).unwrap();
        assert!(result.is_absolute());
        assert!(result.ends_with("rec-1.dprec"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let pattern = RecordingPattern::new("/rec/%d %t %i.dprec");
        let first = pattern.resolve(SessionId::new(9), test_now(), None);
        let second = pattern.resolve(SessionId::new(9), test_now(), None);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_home_expands_to_root() {
        let result = resolve_recording_path("~/x-%i", SessionId::new(2), test_now(), None);
        assert_eq!(result, Some(PathBuf::from("/x-2")));
    }

    #[test]
    fn test_double_slash_after_tilde_stays_in_home() {
        let result = resolve_recording_path(
            "~//rec/%i.dprec",
            SessionId::new(7),
            test_now(),
            Some(Path::new("/home/u")),
        )
        .unwrap();

        assert!(result.starts_with("/home/u"));
        assert_eq!(result, PathBuf::from("/home/u//rec/7.dprec"));
    }
}
