//! Kernel connection information.
//!
//! A Jupyter client describes how to reach a kernel with a small JSON
//! document: five TCP ports, the address, the transport, and the message
//! signing scheme and key. The launcher receives it from the client, may
//! merge it into a local connection file, writes a copy next to the remote
//! kernel, and forwards the five ports.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{RemoteError, Result};

/// Names of the forwarded ports, in forwarding order.
pub const PORT_NAMES: [&str; 5] = [
    "hb_port",
    "shell_port",
    "iopub_port",
    "stdin_port",
    "control_port",
];

static KERNEL_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"kernel-([0-9a-fA-F-]{32,36})\.json$").expect("kernel file pattern is a valid regex")
});

const DESCRIPTOR_FORMAT: &str = r"%s\n";

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_transport() -> String {
    "tcp".to_string()
}

fn default_signature_scheme() -> String {
    "hmac-sha256".to_string()
}

/// How a client reaches the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Shell channel port.
    #[serde(default)]
    pub shell_port: u16,
    /// IOPub channel port.
    #[serde(default)]
    pub iopub_port: u16,
    /// Stdin channel port.
    #[serde(default)]
    pub stdin_port: u16,
    /// Control channel port.
    #[serde(default)]
    pub control_port: u16,
    /// Heartbeat port.
    #[serde(default)]
    pub hb_port: u16,
    /// Address the kernel binds to.
    #[serde(default = "default_ip")]
    pub ip: String,
    /// Message signing key.
    #[serde(default)]
    pub key: String,
    /// ZeroMQ transport.
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Message signing scheme.
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    /// Keys this launcher does not interpret, kept as found.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            shell_port: 0,
            iopub_port: 0,
            stdin_port: 0,
            control_port: 0,
            hb_port: 0,
            ip: default_ip(),
            key: String::new(),
            transport: default_transport(),
            signature_scheme: default_signature_scheme(),
            extra: Map::new(),
        }
    }
}

impl ConnectionInfo {
    /// Build from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns an error if a known key has the wrong type.
    pub fn from_map(map: Map<String, Value>) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    /// Parse from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a connection object.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Compact JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if an extra value cannot be encoded.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The five ports paired with their names, in [`PORT_NAMES`] order.
    #[must_use]
    pub const fn ports(&self) -> [(&'static str, u16); 5] {
        [
            ("hb_port", self.hb_port),
            ("shell_port", self.shell_port),
            ("iopub_port", self.iopub_port),
            ("stdin_port", self.stdin_port),
            ("control_port", self.control_port),
        ]
    }

    /// Check that every port has been assigned.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first unset port.
    pub fn require_ports(&self) -> Result<()> {
        match self.ports().iter().find(|(_, port)| *port == 0) {
            Some((name, _)) => Err(RemoteError::config(format!(
                "connection info has no {name}"
            ))),
            None => Ok(()),
        }
    }

    /// Value of a named field rendered as text, for command templates.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<String> {
        let known = match name {
            "hb_port" => Some(self.hb_port.to_string()),
            "shell_port" => Some(self.shell_port.to_string()),
            "iopub_port" => Some(self.iopub_port.to_string()),
            "stdin_port" => Some(self.stdin_port.to_string()),
            "control_port" => Some(self.control_port.to_string()),
            "ip" => Some(self.ip.clone()),
            "key" => Some(self.key.clone()),
            "transport" => Some(self.transport.clone()),
            "signature_scheme" => Some(self.signature_scheme.clone()),
            _ => None,
        };
        known.or_else(|| {
            self.extra.get(name).map(|value| match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
    }

    /// Shell line that writes this connection info to `path` on the remote
    /// side.
    ///
    /// # Errors
    ///
    /// Returns an error if the info cannot be encoded.
    pub fn descriptor_write_command(&self, path: &str) -> Result<String> {
        let json = self.to_json()?;
        Ok(format!(
            "printf {} {} > {}",
            shell_words::quote(DESCRIPTOR_FORMAT),
            shell_words::quote(&json),
            remote_path(path)
        ))
    }

    /// Recover the connection info from a line built by
    /// [`descriptor_write_command`](Self::descriptor_write_command).
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the line has another shape.
    pub fn parse_descriptor_write(line: &str) -> Result<Self> {
        let words = shell_words::split(line)
            .map_err(|e| RemoteError::config(format!("not a descriptor write command: {e}")))?;
        match words.as_slice() {
            [printf, format, json, redirect, _]
                if printf == "printf" && format == DESCRIPTOR_FORMAT && redirect == ">" =>
            {
                Self::from_json(json)
            }
            _ => Err(RemoteError::config("not a descriptor write command")),
        }
    }
}

/// Render a remote path for the shell, keeping a leading `~/` expandable.
#[must_use]
pub fn remote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) => format!("~/{}", shell_words::quote(rest)),
        None => shell_words::quote(path).into_owned(),
    }
}

/// Identifier of one kernel launch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelId(String);

impl KernelId {
    /// Take the id from a `kernel-<uuid>.json` file name, or make a new one.
    #[must_use]
    pub fn for_connection_file(path: Option<&Path>) -> Self {
        path.and_then(|p| p.to_str())
            .and_then(Self::from_file_name)
            .unwrap_or_else(Self::random)
    }

    /// Parse the version 4 uuid out of a connection file name.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let caps = KERNEL_FILE.captures(name)?;
        Uuid::parse_str(caps.get(1)?.as_str())
            .ok()
            .filter(|uuid| uuid.get_version_num() == 4)
            .map(Self::from_uuid)
    }

    /// A fresh random (version 4) uuid.
    #[must_use]
    pub fn random() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid.hyphenated().to_string())
    }

    /// The uuid text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the transient connection file on the remote side.
    #[must_use]
    pub fn remote_file_name(&self) -> String {
        format!("kernel-remote-{}.json", self.0)
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A local connection file merged with client-supplied fields.
#[derive(Debug)]
pub struct LocalConnectionFile {
    path: PathBuf,
    created: bool,
}

impl LocalConnectionFile {
    /// Load `path` if it exists, overlay `client`, and rewrite the file when
    /// it was missing or its content changed.
    ///
    /// An unreadable or malformed existing file is treated as empty, and a
    /// failed rewrite is only logged: the merged info is still returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged fields are not valid connection info.
    pub fn merge(path: &Path, client: &Map<String, Value>) -> Result<(Self, ConnectionInfo)> {
        let created = !path.exists();
        let loaded = if created {
            Map::new()
        } else {
            read_object(path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable connection file");
                Map::new()
            })
        };

        let mut merged = loaded.clone();
        merged.extend(client.iter().map(|(k, v)| (k.clone(), v.clone())));

        if created || merged != loaded {
            let written = serde_json::to_string_pretty(&merged)
                .map_err(RemoteError::from)
                .and_then(|text| {
                    std::fs::write(path, text)
                        .map_err(|e| RemoteError::io(format!("writing {}", path.display()), e))
                });
            if let Err(e) = written {
                tracing::warn!(error = %e, "connection file not updated");
            }
        }

        let info = ConnectionInfo::from_map(merged)?;
        Ok((
            Self {
                path: path.to_path_buf(),
                created,
            },
            info,
        ))
    }

    /// The file's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file did not exist before the launch.
    #[must_use]
    pub const fn created(&self) -> bool {
        self.created
    }

    /// Delete the file if this launch created it.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file could not be removed.
    pub fn remove_if_created(&self) -> Result<()> {
        if !self.created {
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RemoteError::io(
                format!("removing {}", self.path.display()),
                e,
            )),
        }
    }
}

fn read_object(path: &Path) -> Result<Map<String, Value>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RemoteError::io(format!("reading {}", path.display()), e))?;
    match serde_json::from_str(&text)? {
        Value::Object(map) => Ok(map),
        _ => Err(RemoteError::config(format!(
            "{} does not hold a JSON object",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rk-conn-{}-{name}", std::process::id()))
    }

    fn sample() -> ConnectionInfo {
        ConnectionInfo {
            shell_port: 10002,
            iopub_port: 10003,
            stdin_port: 10004,
            control_port: 10005,
            hb_port: 10001,
            key: "a0b1-c2d3".into(),
            ..ConnectionInfo::default()
        }
    }

    #[test]
    fn descriptor_write_round_trip() {
        let info = sample();
        let line = info
            .descriptor_write_command("~/.local/share/jupyter/runtime/kernel-remote-x.json")
            .expect("encode");
        assert!(line.starts_with(r"printf '%s\n' '{"));
        assert!(line.ends_with("> ~/.local/share/jupyter/runtime/kernel-remote-x.json"));
        assert_eq!(ConnectionInfo::parse_descriptor_write(&line).expect("decode"), info);
    }

    #[test]
    fn single_quotes_survive_descriptor_write() {
        let mut info = sample();
        info.extra.insert("kernel_name".into(), json!("it's"));
        let line = info.descriptor_write_command("/tmp/k.json").expect("encode");
        assert!(line.contains(r"it'\''s"));
        assert_eq!(ConnectionInfo::parse_descriptor_write(&line).expect("decode"), info);
    }

    #[test]
    fn backslashes_are_written_verbatim() {
        let mut info = sample();
        info.key = r"a\b\\c".into();
        let line = info.descriptor_write_command("/tmp/k.json").expect("encode");
        assert!(!line.contains("echo"));
        assert_eq!(ConnectionInfo::parse_descriptor_write(&line).expect("decode"), info);
    }

    #[test]
    fn other_lines_are_not_descriptor_writes() {
        assert!(ConnectionInfo::parse_descriptor_write("rm -f /tmp/k.json").is_err());
        assert!(ConnectionInfo::parse_descriptor_write("printf '%s\\n' '{' > ").is_err());
    }

    #[test]
    fn ports_in_forwarding_order() {
        let names: Vec<&str> = sample().ports().iter().map(|(n, _)| *n).collect();
        assert_eq!(names, PORT_NAMES);
        assert!(sample().require_ports().is_ok());
        assert!(ConnectionInfo::default().require_ports().is_err());
    }

    #[test]
    fn fields_for_templates() {
        let mut info = sample();
        info.extra.insert("kernel_name".into(), json!("python3"));
        assert_eq!(info.field("hb_port").as_deref(), Some("10001"));
        assert_eq!(info.field("ip").as_deref(), Some("127.0.0.1"));
        assert_eq!(info.field("kernel_name").as_deref(), Some("python3"));
        assert_eq!(info.field("nope"), None);
    }

    #[test]
    fn kernel_id_from_file_name() {
        let id = KernelId::for_connection_file(Some(Path::new(
            "/run/user/1000/jupyter/kernel-3f2c9a1e-5b7d-4c21-9e8f-0a1b2c3d4e5f.json",
        )));
        assert_eq!(id.as_str(), "3f2c9a1e-5b7d-4c21-9e8f-0a1b2c3d4e5f");
        assert_eq!(
            id.remote_file_name(),
            "kernel-remote-3f2c9a1e-5b7d-4c21-9e8f-0a1b2c3d4e5f.json"
        );

        let compact = KernelId::from_file_name("kernel-3f2c9a1e5b7d4c219e8f0a1b2c3d4e5f.json")
            .expect("compact uuid");
        assert_eq!(compact, id);
    }

    #[test]
    fn random_kernel_id_is_v4() {
        let id = KernelId::for_connection_file(Some(Path::new("connection.json")));
        let text = id.as_str();
        assert_eq!(text.len(), 36);
        assert_eq!(&text[14..15], "4");
        assert!(matches!(&text[19..20], "8" | "9" | "a" | "b"));
        assert!(KernelId::from_file_name(&format!("kernel-{text}.json")).is_some());
        assert_ne!(KernelId::random(), KernelId::random());
    }

    #[test]
    fn remote_path_keeps_tilde() {
        assert_eq!(remote_path("~/run dir/k.json"), "~/'run dir/k.json'");
        assert_eq!(remote_path("/tmp/k.json"), "/tmp/k.json");
    }

    #[test]
    fn merge_creates_and_removes_missing_file() {
        let path = temp_path("new.json");
        let _ = std::fs::remove_file(&path);
        let client = json!({"hb_port": 10001, "ip": "127.0.0.1"});
        let client = client.as_object().expect("object").clone();

        let (file, info) = LocalConnectionFile::merge(&path, &client).expect("merge");
        assert!(file.created());
        assert_eq!(info.hb_port, 10001);
        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("written")).expect("json");
        assert_eq!(on_disk["hb_port"], 10001);

        file.remove_if_created().expect("remove");
        assert!(!path.exists());
    }

    #[test]
    fn merge_overlays_existing_file_and_keeps_it() {
        let path = temp_path("existing.json");
        std::fs::write(
            &path,
            r#"{"hb_port": 1, "shell_port": 2, "kernel_name": "python3"}"#,
        )
        .expect("seed");
        let client = json!({"hb_port": 10001});
        let client = client.as_object().expect("object").clone();

        let (file, info) = LocalConnectionFile::merge(&path, &client).expect("merge");
        assert!(!file.created());
        assert_eq!(info.hb_port, 10001);
        assert_eq!(info.shell_port, 2);
        assert_eq!(info.extra.get("kernel_name"), Some(&json!("python3")));

        file.remove_if_created().expect("noop");
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_file_counts_as_empty() {
        let path = temp_path("broken.json");
        std::fs::write(&path, "not json").expect("seed");
        let (_file, info) = LocalConnectionFile::merge(&path, &Map::new()).expect("merge");
        assert_eq!(info, ConnectionInfo::default());
        let _ = std::fs::remove_file(&path);
    }
}
