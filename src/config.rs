use crate::extract::{KeywordExtractor, KeywordMode};
use crate::plan::{CommandPlan, CommandSpec};
use crate::ssh::{SshAuth, SshTarget};
use crate::store::{xlsx_sheet_name_problem, StoreFormat};
use std::collections::HashSet;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from harvest.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct HarvestConfig {
    pub ssh: SshConfig,
    pub collect: CollectConfig,
    #[serde(rename = "command")]
    pub commands: Vec<CommandConfig>,
    pub output: OutputConfig,
}

#[derive(Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    /// Default wait after each command before reading output.
    pub settle_ms: u64,
    pub max_read_bytes: usize,
    /// Keywords in priority order.
    pub keywords: Vec<String>,
    pub keyword_mode: KeywordMode,
}

#[derive(Debug, Deserialize)]
pub struct CommandConfig {
    pub name: String,
    #[serde(default)]
    pub filtered: bool,
    /// Overrides `collect.settle_ms` for this command.
    #[serde(default)]
    pub settle_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
    pub sheet: String,
    /// Column labels, one per `[[command]]` in the same order.
    pub headers: Vec<String>,
}

// --- Default implementations ---

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 22,
            username: None,
            password: None,
            private_key: None,
            passphrase: None,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            settle_ms: 3000,
            max_read_bytes: crate::channel::DEFAULT_MAX_READ_BYTES,
            keywords: Vec::new(),
            keyword_mode: KeywordMode::Regex,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("harvest.xlsx"),
            sheet: "Sheet1".to_string(),
            headers: Vec::new(),
        }
    }
}

impl std::fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// One entry per problem found.
    Invalid(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(problems) => {
                write!(f, "invalid configuration:")?;
                for p in problems {
                    write!(f, "\n  - {p}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl HarvestConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Overlay `SSH_HOST`, `SSH_PORT`, `SSH_USER`, `SSH_PASSWORD` from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SSH_HOST") {
            self.ssh.host = Some(host);
        }
        if let Some(port) = lookup("SSH_PORT") {
            self.ssh.port = port.trim().parse().map_err(|_| {
                ConfigError::Invalid(vec![format!("SSH_PORT is not a valid port: {port:?}")])
            })?;
        }
        if let Some(user) = lookup("SSH_USER") {
            self.ssh.username = Some(user);
        }
        if let Some(password) = lookup("SSH_PASSWORD") {
            self.ssh.password = Some(password);
        }
        Ok(())
    }

    /// Check the resolved config, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.ssh.host.as_deref().map_or(true, |h| h.trim().is_empty()) {
            problems.push("ssh.host is not set (config or SSH_HOST)".to_string());
        }
        if self.ssh.username.as_deref().map_or(true, |u| u.is_empty()) {
            problems.push("ssh.username is not set (config or SSH_USER)".to_string());
        }
        if self.ssh.password.is_none() && self.ssh.private_key.is_none() {
            problems.push(
                "no credentials: set ssh.password, SSH_PASSWORD, or ssh.private_key".to_string(),
            );
        }

        if self.commands.is_empty() {
            problems.push("no [[command]] entries configured".to_string());
        }
        for (i, cmd) in self.commands.iter().enumerate() {
            if cmd.name.trim().is_empty() {
                problems.push(format!("command #{} has an empty name", i + 1));
            }
        }
        let mut seen = HashSet::new();
        for header in &self.output.headers {
            if header.trim().is_empty() {
                problems.push("output.headers contains an empty label".to_string());
            } else if !seen.insert(header.to_lowercase()) {
                problems.push(format!("output.headers: duplicate column {header:?}"));
            }
        }
        if self.output.headers.len() != self.commands.len() {
            problems.push(format!(
                "output.headers has {} entries but {} commands are configured",
                self.output.headers.len(),
                self.commands.len()
            ));
        }

        if self.collect.max_read_bytes == 0 {
            problems.push("collect.max_read_bytes must be greater than 0".to_string());
        }
        if let Err(e) = self.extractor() {
            problems.push(format!("collect.keywords: {e}"));
        }
        if self.collect.keywords.is_empty() && self.commands.iter().any(|c| c.filtered) {
            tracing::warn!("filtered commands configured without keywords; they will yield no values");
        }

        if self.ssh.connect_timeout_secs == 0 {
            problems.push("ssh.connect_timeout_secs must be greater than 0".to_string());
        }

        let format = StoreFormat::from_path(&self.output.path);
        if let Err(e) = &format {
            problems.push(e.to_string());
        }
        if self.output.sheet.trim().is_empty() {
            problems.push("output.sheet must not be empty".to_string());
        } else if matches!(format, Ok(StoreFormat::Xlsx)) {
            if let Some(problem) = xlsx_sheet_name_problem(&self.output.sheet) {
                problems.push(format!("output.sheet: {problem}"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Connection parameters for the SSH session.
    pub fn ssh_target(&self) -> Result<SshTarget, ConfigError> {
        let missing = |what: &str| ConfigError::Invalid(vec![format!("{what} is not set")]);
        let auth = match (&self.ssh.private_key, &self.ssh.password) {
            (Some(path), _) => SshAuth::KeyFile {
                path: path.clone(),
                passphrase: self.ssh.passphrase.clone(),
            },
            (None, Some(password)) => SshAuth::Password(password.clone()),
            (None, None) => return Err(missing("ssh credential")),
        };
        Ok(SshTarget {
            host: self.ssh.host.clone().ok_or_else(|| missing("ssh.host"))?,
            port: self.ssh.port,
            username: self
                .ssh
                .username
                .clone()
                .ok_or_else(|| missing("ssh.username"))?,
            auth,
            connect_timeout: Duration::from_secs(self.ssh.connect_timeout_secs),
        })
    }

    /// Commands in configured order, each with its effective settle duration.
    pub fn plan(&self) -> CommandPlan {
        CommandPlan::new(
            self.commands
                .iter()
                .map(|c| {
                    let settle = c.settle_ms.unwrap_or(self.collect.settle_ms);
                    CommandSpec::new(c.name.clone(), c.filtered, Duration::from_millis(settle))
                })
                .collect(),
        )
    }

    pub fn extractor(&self) -> Result<KeywordExtractor, regex::Error> {
        KeywordExtractor::new(self.collect.keywords.as_slice(), self.collect.keyword_mode)
    }

    /// Resolved settings for `--dry-run`, credentials omitted.
    pub fn summary(&self) -> serde_json::Value {
        let auth = if self.ssh.private_key.is_some() {
            "private_key"
        } else if self.ssh.password.is_some() {
            "password"
        } else {
            "none"
        };
        serde_json::json!({
            "ssh": {
                "host": self.ssh.host,
                "port": self.ssh.port,
                "username": self.ssh.username,
                "auth": auth,
                "connect_timeout_secs": self.ssh.connect_timeout_secs,
            },
            "collect": {
                "max_read_bytes": self.collect.max_read_bytes,
                "keywords": self.collect.keywords,
                "keyword_mode": self.collect.keyword_mode,
            },
            "plan": self.plan(),
            "output": {
                "path": self.output.path,
                "sheet": self.output.sheet,
                "headers": self.output.headers,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[ssh]
host = "10.0.0.5"
username = "monitor"
password = "secret"

[collect]
settle_ms = 2000
keywords = ["keyword1", "keyword2"]

[[command]]
name = "COMMAND_DATE"

[[command]]
name = "COMMAND_MEMORY"
filtered = true
settle_ms = 500

[output]
path = "Sample_Output.csv"
sheet = "TEST_SHEET_NAME"
headers = ["Date", "Memory"]
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = HarvestConfig::default();
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.ssh.connect_timeout_secs, 10);
        assert_eq!(config.collect.settle_ms, 3000);
        assert_eq!(config.collect.max_read_bytes, 65535);
        assert_eq!(config.collect.keyword_mode, KeywordMode::Regex);
        assert_eq!(config.output.path, PathBuf::from("harvest.xlsx"));
        assert_eq!(config.output.sheet, "Sheet1");
        assert!(config.commands.is_empty());
    }

    #[test]
    fn test_parse_sample() {
        let config = HarvestConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.ssh.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.commands.len(), 2);
        assert!(!config.commands[0].filtered);
        assert!(config.commands[1].filtered);
        assert_eq!(config.output.sheet, "TEST_SHEET_NAME");
        config.validate().unwrap();
    }

    #[test]
    fn test_plan_inherits_or_overrides_settle() {
        let config = HarvestConfig::parse(SAMPLE).unwrap();
        let plan = config.plan();
        let settles: Vec<Duration> = plan.iter().map(|c| c.settle).collect();
        assert_eq!(
            settles,
            vec![Duration::from_millis(2000), Duration::from_millis(500)]
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = HarvestConfig::load(Path::new("/nonexistent/harvest.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.toml");
        std::fs::write(&path, "[ssh\nhost = ").unwrap();
        let err = HarvestConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_command_without_name_is_parse_error() {
        assert!(HarvestConfig::parse("[[command]]\nfiltered = true\n").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = HarvestConfig::parse(SAMPLE).unwrap();
        config
            .apply_env(env(&[
                ("SSH_HOST", "bastion"),
                ("SSH_PORT", "2222"),
                ("SSH_USER", "ops"),
                ("SSH_PASSWORD", "from-env"),
            ]))
            .unwrap();
        let target = config.ssh_target().unwrap();
        assert_eq!(target.addr(), "bastion:2222");
        assert_eq!(target.username, "ops");
        assert!(matches!(target.auth, SshAuth::Password(ref p) if p == "from-env"));
    }

    #[test]
    fn test_env_supplies_missing_credentials() {
        let mut config = HarvestConfig::parse(
            "[[command]]\nname = \"uptime\"\n[output]\nheaders = [\"Uptime\"]\n",
        )
        .unwrap();
        assert!(config.validate().is_err());
        config
            .apply_env(env(&[
                ("SSH_HOST", "h"),
                ("SSH_USER", "u"),
                ("SSH_PASSWORD", "p"),
            ]))
            .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_env_bad_port() {
        let mut config = HarvestConfig::default();
        let err = config.apply_env(env(&[("SSH_PORT", "ssh")])).unwrap_err();
        assert!(err.to_string().contains("SSH_PORT"));
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let config = HarvestConfig::parse(
            r#"
[collect]
keywords = ["(bad"]
max_read_bytes = 0

[[command]]
name = "a"

[output]
path = "out.txt"
headers = ["A", "B"]
"#,
        )
        .unwrap();
        let ConfigError::Invalid(problems) = config.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        let all = problems.join("\n");
        assert!(all.contains("ssh.host"));
        assert!(all.contains("ssh.username"));
        assert!(all.contains("credentials"));
        assert!(all.contains("output.headers has 2 entries but 1 commands"));
        assert!(all.contains("max_read_bytes"));
        assert!(all.contains("collect.keywords"));
        assert!(all.contains("unsupported dataset format"));
    }

    fn valid_two_command_config(output: &str) -> HarvestConfig {
        HarvestConfig::parse(&format!(
            r#"
[ssh]
host = "h"
username = "u"
password = "p"

[[command]]
name = "show load"
filtered = true

[[command]]
name = "show load average"
filtered = true

{output}
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_validate_rejects_duplicate_headers() {
        for headers in [r#"["Load", "Load"]"#, r#"["Load", "LOAD"]"#] {
            for path in ["out.db", "out.csv", "out.xlsx"] {
                let config = valid_two_command_config(&format!(
                    "[output]\npath = \"{path}\"\nheaders = {headers}\n"
                ));
                let err = config.validate().unwrap_err();
                assert!(err.to_string().contains("duplicate column"), "{path} {headers}");
            }
        }
    }

    #[test]
    fn test_validate_rejects_blank_header() {
        let config = valid_two_command_config("[output]\nheaders = [\"Load\", \" \"]\n");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("empty label"));
    }

    #[test]
    fn test_validate_xlsx_sheet_name() {
        let config = valid_two_command_config(
            "[output]\npath = \"out.xlsx\"\nsheet = \"a/b\"\nheaders = [\"A\", \"B\"]\n",
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("output.sheet"));

        // Other formats accept any non-empty label
        let config = valid_two_command_config(
            "[output]\npath = \"out.db\"\nsheet = \"a/b\"\nheaders = [\"A\", \"B\"]\n",
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_zero_connect_timeout() {
        let mut config = valid_two_command_config("[output]\nheaders = [\"A\", \"B\"]\n");
        config.validate().unwrap();
        config.ssh.connect_timeout_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("connect_timeout_secs"));
    }

    #[test]
    fn test_validate_empty_plan() {
        let mut config = HarvestConfig::default();
        config
            .apply_env(env(&[("SSH_HOST", "h"), ("SSH_USER", "u"), ("SSH_PASSWORD", "p")]))
            .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no [[command]] entries"));
    }

    #[test]
    fn test_private_key_preferred_over_password() {
        let mut config = HarvestConfig::parse(SAMPLE).unwrap();
        config.ssh.private_key = Some(PathBuf::from("/keys/id_ed25519"));
        let target = config.ssh_target().unwrap();
        assert!(matches!(target.auth, SshAuth::KeyFile { .. }));
    }

    #[test]
    fn test_literal_keyword_mode_parses() {
        let config = HarvestConfig::parse("[collect]\nkeyword_mode = \"literal\"\n").unwrap();
        assert_eq!(config.collect.keyword_mode, KeywordMode::Literal);
    }

    #[test]
    fn test_summary_omits_secrets() {
        let config = HarvestConfig::parse(SAMPLE).unwrap();
        let rendered = serde_json::to_string(&config.summary()).unwrap();
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("\"auth\":\"password\""));
        assert!(rendered.contains("COMMAND_MEMORY"));
        assert!(!format!("{config:?}").contains("secret"));
    }
}
