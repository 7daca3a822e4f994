//! Adapter launch configuration (§0.3, C2, §10.5).
//!
//! Grounded on `perl-dap::configuration`'s `LaunchConfiguration`/
//! `AttachConfiguration` split, generalized to the three transport shapes
//! C2 names (stdio child process, direct TCP attach, spawn-then-TCP) and to
//! `${...}` templating instead of a single fixed workspace-root join.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{DapError, DapResult};
use crate::transport::{PortDetector, DEFAULT_CONNECT_TIMEOUT_MS, MAX_CONNECT_TIMEOUT_MS};

/// Values substituted into `${...}` placeholders when resolving a config
/// against a concrete workspace (§0.3).
#[derive(Debug, Clone, Default)]
pub struct WorkspaceContext {
    pub workspace_folder: Option<PathBuf>,
    pub file: Option<PathBuf>,
    pub port: Option<u16>,
    pub extra: HashMap<String, String>,
}

impl WorkspaceContext {
    fn substitute(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            let Some(end) = rest[start..].find('}') else {
                out.push_str(rest);
                return out;
            };
            out.push_str(&rest[..start]);
            let name = &rest[start + 2..start + end];
            out.push_str(&self.lookup(name).unwrap_or_default());
            rest = &rest[start + end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "workspaceFolder" => self.workspace_folder.as_ref().map(|p| p.display().to_string()),
            "file" => self.file.as_ref().map(|p| p.display().to_string()),
            "port" => self.port.map(|p| p.to_string()),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// An adapter launch target, as the consumer configures it before any
/// `${...}` placeholders are resolved (§0.3, C2).
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "camelCase")]
pub enum AdapterConfig {
    /// Spawn a child process and speak DAP over its stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Connect directly to an already-listening adapter.
    TcpAttach {
        host: String,
        port_template: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u32>,
    },
    /// Spawn a server process, scan its stdout for the port it announces,
    /// then connect to it (§4.2's "Server" variant, §6's `connect_condition`).
    SpawnThenTcp {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        /// Host paired with whatever port `port_detector` finds, unless the
        /// detector itself returns an overriding host.
        #[serde(default = "default_spawn_then_tcp_host")]
        host: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u32>,
        /// Scans accumulated stdout bytes for `(port, host)`. Not
        /// serializable, so a TOML-loaded entry always falls back to
        /// [`default_port_detector`] (first run of digits that parses as a
        /// `u16`, paired with `host`); set this in code when an adapter
        /// announces its port differently.
        #[serde(skip)]
        port_detector: Option<Rc<PortDetector>>,
    },
}

impl fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterConfig::Stdio { command, args, env, cwd } => {
                f.debug_struct("Stdio").field("command", command).field("args", args).field("env", env).field("cwd", cwd).finish()
            }
            AdapterConfig::TcpAttach { host, port_template, timeout_ms } => f
                .debug_struct("TcpAttach")
                .field("host", host)
                .field("port_template", port_template)
                .field("timeout_ms", timeout_ms)
                .finish(),
            AdapterConfig::SpawnThenTcp { command, args, env, host, timeout_ms, port_detector } => f
                .debug_struct("SpawnThenTcp")
                .field("command", command)
                .field("args", args)
                .field("env", env)
                .field("host", host)
                .field("timeout_ms", timeout_ms)
                .field("port_detector", &port_detector.is_some())
                .finish(),
        }
    }
}

fn default_spawn_then_tcp_host() -> String {
    "127.0.0.1".into()
}

/// Default [`PortDetector`]: looks for a `:<digits>` run in the accumulated
/// stdout bytes (the last one wins, since a preceding `host:port`-shaped
/// prefix like an IPv4 address has colons too only starting at the real
/// separator) and pairs the parsed port with `host`. Covers adapters that
/// print something like `Debug server listening at 127.0.0.1:8123`; adapters
/// that announce a port without a leading `:` need a custom detector
/// supplied through [`AdapterConfig::SpawnThenTcp::port_detector`].
pub fn default_port_detector(host: String) -> Rc<PortDetector> {
    Rc::new(move |chunk: &[u8]| port_after_colon(chunk).map(|port| (port, host.clone())))
}

fn port_after_colon(chunk: &[u8]) -> Option<u16> {
    let text = String::from_utf8_lossy(chunk);
    let mut found = None;
    for (byte_idx, ch) in text.char_indices() {
        if ch != ':' {
            continue;
        }
        let digits: String = text[byte_idx + 1..].chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(port) = digits.parse::<u16>() {
            found = Some(port);
        }
    }
    found
}

/// A fully resolved launch target: every `${...}` placeholder substituted,
/// the port parsed (or a detector ready to find one), the timeout clamped —
/// ready to hand to [`crate::transport::Transport`].
#[derive(Clone)]
pub enum ResolvedAdapterConfig {
    Stdio { command: String, args: Vec<String>, env: HashMap<String, String>, cwd: Option<PathBuf> },
    TcpAttach { host: String, port: u16, timeout_ms: u32 },
    SpawnThenTcp { command: String, args: Vec<String>, env: HashMap<String, String>, port_detector: Rc<PortDetector>, timeout_ms: u32 },
}

impl fmt::Debug for ResolvedAdapterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedAdapterConfig::Stdio { command, args, env, cwd } => {
                f.debug_struct("Stdio").field("command", command).field("args", args).field("env", env).field("cwd", cwd).finish()
            }
            ResolvedAdapterConfig::TcpAttach { host, port, timeout_ms } => {
                f.debug_struct("TcpAttach").field("host", host).field("port", port).field("timeout_ms", timeout_ms).finish()
            }
            ResolvedAdapterConfig::SpawnThenTcp { command, args, env, timeout_ms, .. } => f
                .debug_struct("SpawnThenTcp")
                .field("command", command)
                .field("args", args)
                .field("env", env)
                .field("timeout_ms", timeout_ms)
                .finish(),
        }
    }
}

impl AdapterConfig {
    /// Checks the shape is internally consistent (non-empty command, a
    /// numeric-looking port template when not pure `${port}`) without
    /// touching the filesystem — resolution against a workspace happens
    /// in [`Self::resolve`].
    pub fn validate(&self) -> DapResult<()> {
        match self {
            AdapterConfig::Stdio { command, .. } | AdapterConfig::SpawnThenTcp { command, .. } if command.trim().is_empty() => {
                Err(DapError::Configuration("adapter command must not be empty".into()))
            }
            AdapterConfig::TcpAttach { host, .. } | AdapterConfig::SpawnThenTcp { host, .. } if host.trim().is_empty() => {
                Err(DapError::Configuration("adapter host must not be empty".into()))
            }
            AdapterConfig::TcpAttach { timeout_ms: Some(ms), .. } | AdapterConfig::SpawnThenTcp { timeout_ms: Some(ms), .. }
                if *ms == 0 || *ms as u64 > MAX_CONNECT_TIMEOUT_MS =>
            {
                Err(DapError::Configuration(format!("connect_timeout must be in 1..={MAX_CONNECT_TIMEOUT_MS}ms, got {ms}")))
            }
            _ => Ok(()),
        }
    }

    /// Substitutes `${workspaceFolder}`/`${file}`/`${port}`/custom
    /// placeholders and produces a config ready for [`crate::transport`].
    pub fn resolve(&self, ctx: &WorkspaceContext) -> DapResult<ResolvedAdapterConfig> {
        self.validate()?;
        Ok(match self {
            AdapterConfig::Stdio { command, args, env, cwd } => ResolvedAdapterConfig::Stdio {
                command: ctx.substitute(command),
                args: args.iter().map(|a| ctx.substitute(a)).collect(),
                env: env.iter().map(|(k, v)| (k.clone(), ctx.substitute(v))).collect(),
                cwd: cwd.as_ref().map(|p| PathBuf::from(ctx.substitute(&p.display().to_string()))),
            },
            AdapterConfig::TcpAttach { host, port_template, timeout_ms } => ResolvedAdapterConfig::TcpAttach {
                host: ctx.substitute(host),
                port: parse_port(&ctx.substitute(port_template))?,
                timeout_ms: timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS as u32),
            },
            AdapterConfig::SpawnThenTcp { command, args, env, host, timeout_ms, port_detector } => {
                let resolved_host = ctx.substitute(host);
                ResolvedAdapterConfig::SpawnThenTcp {
                    command: ctx.substitute(command),
                    args: args.iter().map(|a| ctx.substitute(a)).collect(),
                    env: env.iter().map(|(k, v)| (k.clone(), ctx.substitute(v))).collect(),
                    port_detector: port_detector.clone().unwrap_or_else(|| default_port_detector(resolved_host)),
                    timeout_ms: timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS as u32),
                }
            }
        })
    }
}

fn parse_port(s: &str) -> DapResult<u16> {
    s.parse().map_err(|_| DapError::Configuration(format!("not a valid port: {s:?}")))
}

/// A named collection of adapter configurations, loadable from TOML
/// (`[adapters.<name>]` tables) the way an editor extension would ship an
/// `adapters.toml` alongside its settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterRegistry {
    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,
}

impl AdapterRegistry {
    pub fn from_toml_str(s: &str) -> DapResult<AdapterRegistry> {
        toml::from_str(s).map_err(|e| DapError::Configuration(format!("invalid adapter registry: {e}")))
    }

    pub fn load(path: &Path) -> DapResult<AdapterRegistry> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DapError::Configuration(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn get(&self, name: &str) -> DapResult<&AdapterConfig> {
        self.adapters.get(name).ok_or_else(|| DapError::Configuration(format!("no adapter named {name:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_placeholders() {
        let ctx = WorkspaceContext {
            workspace_folder: Some(PathBuf::from("/ws")),
            file: Some(PathBuf::from("/ws/main.py")),
            port: Some(5678),
            extra: HashMap::new(),
        };
        let cfg = AdapterConfig::Stdio {
            command: "${workspaceFolder}/bin/adapter".into(),
            args: vec!["--file".into(), "${file}".into()],
            env: HashMap::new(),
            cwd: None,
        };
        let resolved = cfg.resolve(&ctx).unwrap();
        match resolved {
            ResolvedAdapterConfig::Stdio { command, args, .. } => {
                assert_eq!(command, "/ws/bin/adapter");
                assert_eq!(args, vec!["--file", "/ws/main.py"]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_empty_command() {
        let cfg = AdapterConfig::Stdio { command: "  ".into(), args: vec![], env: HashMap::new(), cwd: None };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_timeout_above_max() {
        let cfg = AdapterConfig::TcpAttach { host: "localhost".into(), port_template: "5678".into(), timeout_ms: Some(400_000) };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tcp_attach_resolves_port_from_template() {
        let ctx = WorkspaceContext { port: Some(9229), ..Default::default() };
        let cfg = AdapterConfig::TcpAttach { host: "localhost".into(), port_template: "${port}".into(), timeout_ms: None };
        let resolved = cfg.resolve(&ctx).unwrap();
        match resolved {
            ResolvedAdapterConfig::TcpAttach { port, timeout_ms, .. } => {
                assert_eq!(port, 9229);
                assert_eq!(timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS as u32);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn loads_registry_from_toml() {
        let toml_src = r#"
            [adapters.python]
            transport = "stdio"
            command = "python"
            args = ["-m", "debugpy.adapter"]
        "#;
        let registry = AdapterRegistry::from_toml_str(toml_src).unwrap();
        assert!(matches!(registry.get("python").unwrap(), AdapterConfig::Stdio { .. }));
        assert!(registry.get("missing").is_err());
    }

    #[test]
    fn spawn_then_tcp_falls_back_to_the_default_port_detector() {
        let cfg = AdapterConfig::SpawnThenTcp {
            command: "node".into(),
            args: vec!["js-debug.js".into()],
            env: HashMap::new(),
            host: "127.0.0.1".into(),
            timeout_ms: None,
            port_detector: None,
        };
        let resolved = cfg.resolve(&WorkspaceContext::default()).unwrap();
        match resolved {
            ResolvedAdapterConfig::SpawnThenTcp { port_detector, .. } => {
                assert_eq!(port_detector(b"Debug server listening at 127.0.0.1:8123"), Some((8123, "127.0.0.1".into())));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn spawn_then_tcp_honors_a_custom_port_detector() {
        let cfg = AdapterConfig::SpawnThenTcp {
            command: "node".into(),
            args: vec![],
            env: HashMap::new(),
            host: "127.0.0.1".into(),
            timeout_ms: None,
            port_detector: Some(Rc::new(|chunk: &[u8]| {
                String::from_utf8_lossy(chunk).strip_prefix("PORT=").and_then(|s| s.trim().parse().ok()).map(|p| (p, "0.0.0.0".into()))
            })),
        };
        let resolved = cfg.resolve(&WorkspaceContext::default()).unwrap();
        match resolved {
            ResolvedAdapterConfig::SpawnThenTcp { port_detector, .. } => {
                assert_eq!(port_detector(b"PORT=4000"), Some((4000, "0.0.0.0".into())));
                assert_eq!(port_detector(b"garbage"), None);
            }
            _ => panic!("wrong variant"),
        }
    }
}
