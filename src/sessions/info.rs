//! Session data model shared between the web server and PTY hosts.

use serde::{Deserialize, Serialize};

/// Characters allowed in a session id (URL-safe base64 alphabet).
const ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Length of a session id.
pub const SESSION_ID_LEN: usize = 8;

/// Which shell a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    /// `$SHELL`, falling back to `/bin/sh`.
    #[default]
    Default,
    Sh,
    Bash,
    Zsh,
    Fish,
}

impl ShellKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Sh => "sh",
            Self::Bash => "bash",
            Self::Zsh => "zsh",
            Self::Fish => "fish",
        }
    }

    /// Resolve to the program to execute.
    pub fn program(self) -> String {
        match self {
            Self::Default => {
                std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
            }
            Self::Sh => "/bin/sh".to_string(),
            Self::Bash => "bash".to_string(),
            Self::Zsh => "zsh".to_string(),
            Self::Fish => "fish".to_string(),
        }
    }
}

impl std::str::FromStr for ShellKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "sh" => Ok(Self::Sh),
            "bash" => Ok(Self::Bash),
            "zsh" => Ok(Self::Zsh),
            "fish" => Ok(Self::Fish),
            other => Err(format!("unknown shell kind: {other}")),
        }
    }
}

impl std::fmt::Display for ShellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one session, as it crosses JSON boundaries (host IPC `Info`
/// payloads, the state WebSocket, and the REST API).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Stable 8-character wire identifier.
    pub id: String,
    /// PID of the child shell.
    pub pid: u32,
    /// Epoch milliseconds when the session was created.
    pub created_at: u64,
    pub is_running: bool,
    /// Set iff `is_running` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_working_directory: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub shell_type: ShellKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Viewer that most recently sent input; only the server fills this in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_viewer_id: Option<String>,
}

/// Generate an 8-character session id from the URL-safe alphabet.
///
/// `thread_rng` is a CSPRNG, so ids are unguessable as well as unique.
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect()
}

/// True when `id` is a well-formed session id.
pub fn is_valid_session_id(id: &str) -> bool {
    id.len() == SESSION_ID_LEN && id.bytes().all(|b| ID_CHARSET.contains(&b))
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Validate terminal dimensions: each axis in `1..10000`.
pub fn valid_dimensions(cols: u16, rows: u16) -> bool {
    (1..10_000).contains(&cols) && (1..10_000).contains(&rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_well_formed() {
        for _ in 0..200 {
            let id = generate_session_id();
            assert!(is_valid_session_id(&id), "bad id: {id}");
        }
    }

    #[test]
    fn generated_ids_are_distinct() {
        let ids: HashSet<String> = (0..100).map(|_| generate_session_id()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn id_validation_rejects_bad_input() {
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("short"));
        assert!(!is_valid_session_id("toolong123"));
        assert!(!is_valid_session_id("has spac"));
        assert!(!is_valid_session_id("slash/!!"));
        assert!(is_valid_session_id("Ab3_-9zX"));
    }

    #[test]
    fn shell_kind_round_trip() {
        for kind in [
            ShellKind::Default,
            ShellKind::Sh,
            ShellKind::Bash,
            ShellKind::Zsh,
            ShellKind::Fish,
        ] {
            let parsed: ShellKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("powershell".parse::<ShellKind>().is_err());
    }

    #[test]
    fn session_info_json_field_names() {
        let info = SessionInfo {
            id: "abcd1234".into(),
            pid: 4242,
            created_at: 1_700_000_000_000,
            is_running: true,
            exit_code: None,
            current_working_directory: Some("/home/me".into()),
            cols: 80,
            rows: 24,
            shell_type: ShellKind::Bash,
            name: Some("build".into()),
            last_active_viewer_id: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], "abcd1234");
        assert_eq!(json["pid"], 4242);
        assert_eq!(json["createdAt"], 1_700_000_000_000u64);
        assert_eq!(json["isRunning"], true);
        assert_eq!(json["currentWorkingDirectory"], "/home/me");
        assert_eq!(json["shellType"], "bash");
        assert_eq!(json["name"], "build");
        // Absent optionals are omitted entirely.
        assert!(json.get("exitCode").is_none());
        assert!(json.get("lastActiveViewerId").is_none());

        let back: SessionInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn exited_session_serializes_exit_code() {
        let info = SessionInfo {
            id: "abcd1234".into(),
            pid: 1,
            created_at: 0,
            is_running: false,
            exit_code: Some(130),
            current_working_directory: None,
            cols: 80,
            rows: 24,
            shell_type: ShellKind::Default,
            name: None,
            last_active_viewer_id: None,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["isRunning"], false);
        assert_eq!(json["exitCode"], 130);
    }

    #[test]
    fn dimension_validation() {
        assert!(valid_dimensions(80, 24));
        assert!(valid_dimensions(1, 1));
        assert!(valid_dimensions(9999, 9999));
        assert!(!valid_dimensions(0, 24));
        assert!(!valid_dimensions(80, 0));
        assert!(!valid_dimensions(10_000, 24));
    }
}
