//! Privileged-operation detection for shell commands.
//!
//! A static scan, not a parser: it errs on the side of asking. Anything it
//! reports goes to the permission gate; anything it misses is still confined
//! by the backend's isolation.

use regex::Regex;
use std::collections::HashSet;

use sandflow_core::{Error, PermissionType, PrivilegedOperation, Result};

/// Package managers and the registry host they contact by default.
const PACKAGE_MANAGERS: &[(&str, &str)] = &[
    ("pip", "pypi.org"),
    ("pip3", "pypi.org"),
    ("npm", "registry.npmjs.org"),
    ("yarn", "registry.yarnpkg.com"),
    ("cargo", "index.crates.io"),
    ("apt", "deb.debian.org"),
    ("apt-get", "deb.debian.org"),
    ("go", "proxy.golang.org"),
];

/// Paths that are always writable.
const WRITABLE_DEVICES: &[&str] = &["/dev/null", "/dev/stdout", "/dev/stderr", "/dev/zero"];

pub struct OperationClassifier {
    url: Regex,
    network_tool: Regex,
    package_install: Regex,
    http_server: Regex,
    port_flag: Regex,
    listen: Regex,
    process_tool: Regex,
    write_verb: Regex,
    absolute_path: Regex,
}

impl OperationClassifier {
    pub fn new() -> Result<Self> {
        let re = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::internal(format!("classifier pattern: {}", e)))
        };
        Ok(Self {
            url: re(r"(?i)\b(?:https?|ftp|ssh|git|wss?)://(?:[^@/\s]+@)?([A-Za-z0-9.-]+)")?,
            network_tool: re(r"\b(curl|wget|nc|ncat|netcat|ssh|scp|sftp|rsync|ftp|telnet|ping|dig|nslookup)\b")?,
            package_install: re(
                r"\b(pip3?|npm|yarn|cargo|apt-get|apt|go)\s+(?:-\S+\s+)*(install|add|fetch|get|update|i)\b",
            )?,
            http_server: re(r"\bpython3?\s+-m\s+http\.server(?:\s+(\d{1,5}))?")?,
            port_flag: re(r"(?:--port[= ]|\s-p\s*)(\d{2,5})\b")?,
            listen: re(r"\b(?:nc|ncat|netcat)\s+(?:-\S*l\S*\s+)(?:-\S+\s+)*(?:\S+\s+)?(\d{2,5})\b")?,
            process_tool: re(r"(?:^|[\s;&|(])(kill|killall|pkill|nohup|sudo|su|chroot|renice|setsid|disown|crontab)\b")?,
            write_verb: re(r"(>|\b(?:cp|mv|rm|touch|mkdir|rmdir|chmod|chown|ln|tee|dd|truncate|install)\b)")?,
            absolute_path: re(r#"(?:^|[\s=>'"])(/[^\s;|&>'"]*)"#)?,
        })
    }

    /// Privileged operations `command` appears to perform, deduplicated, in
    /// order of first appearance.
    pub fn classify(&self, command: &str, workdir: &str) -> Vec<PrivilegedOperation> {
        let mut ops = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |op: PrivilegedOperation| {
            if seen.insert((op.permission_type, op.resource.clone())) {
                ops.push(op);
            }
        };

        // Network, per shell segment: explicit URLs first, then package
        // managers, then bare tools in segments that name no host.
        for segment in shell_segments(command) {
            let mut has_url_host = false;
            for cap in self.url.captures_iter(segment) {
                let host = cap[1].to_lowercase();
                has_url_host = true;
                push(PrivilegedOperation::new(
                    PermissionType::NetworkAccess,
                    host.clone(),
                    format!("command contacts {}", host),
                ));
            }
            for cap in self.package_install.captures_iter(segment) {
                let tool = &cap[1];
                if let Some((_, host)) = PACKAGE_MANAGERS.iter().find(|(t, _)| *t == tool) {
                    push(PrivilegedOperation::new(
                        PermissionType::NetworkAccess,
                        *host,
                        format!("{} {} downloads from {}", tool, &cap[2], host),
                    ));
                }
            }
            if !has_url_host {
                for cap in self.network_tool.captures_iter(segment) {
                    let tool = &cap[1];
                    push(PrivilegedOperation::new(
                        PermissionType::NetworkAccess,
                        tool,
                        format!("{} opens network connections", tool),
                    ));
                }
            }
        }

        // Port binding.
        if let Some(cap) = self.http_server.captures(command) {
            let port = cap.get(1).map(|m| m.as_str()).unwrap_or("8000");
            push(PrivilegedOperation::new(
                PermissionType::PortBinding,
                port,
                format!("http.server listens on port {}", port),
            ));
        }
        for cap in self.listen.captures_iter(command) {
            push(PrivilegedOperation::new(
                PermissionType::PortBinding,
                &cap[1],
                format!("netcat listens on port {}", &cap[1]),
            ));
        }
        if self.is_server_command(command) {
            for cap in self.port_flag.captures_iter(command) {
                push(PrivilegedOperation::new(
                    PermissionType::PortBinding,
                    &cap[1],
                    format!("server binds port {}", &cap[1]),
                ));
            }
        }

        // Process table.
        for cap in self.process_tool.captures_iter(command) {
            let tool = &cap[1];
            push(PrivilegedOperation::new(
                PermissionType::ProcessExecution,
                tool,
                format!("{} manipulates the process table", tool),
            ));
        }

        // Filesystem writes outside the working directory.
        if self.write_verb.is_match(command) {
            for cap in self.absolute_path.captures_iter(command) {
                let path = &cap[1];
                if !is_within(path, workdir) && !WRITABLE_DEVICES.contains(&path) {
                    push(PrivilegedOperation::new(
                        PermissionType::FileSystemAccess,
                        path,
                        format!("command writes outside {}", workdir),
                    ));
                }
            }
        }

        ops
    }

    fn is_server_command(&self, command: &str) -> bool {
        ["serve", "server", "runserver", "uvicorn", "gunicorn", "flask run", "http-server"]
            .iter()
            .any(|k| command.contains(k))
    }
}

/// Split on `;`, `&&`, `||`, `|`, `&` and newlines. Quoting is ignored.
fn shell_segments(command: &str) -> impl Iterator<Item = &str> {
    command
        .split(|c: char| matches!(c, ';' | '|' | '&' | '\n'))
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
}

fn is_within(path: &str, workdir: &str) -> bool {
    let workdir = workdir.trim_end_matches('/');
    if workdir.is_empty() {
        return true;
    }
    if path.split('/').any(|segment| segment == "..") {
        return false;
    }
    path == workdir || path.starts_with(&format!("{}/", workdir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(command: &str) -> Vec<(PermissionType, String)> {
        OperationClassifier::new()
            .unwrap()
            .classify(command, "/workspace")
            .into_iter()
            .map(|op| (op.permission_type, op.resource))
            .collect()
    }

    #[test]
    fn test_plain_commands_are_unprivileged() {
        assert!(classify("ls -la && cargo build --release").is_empty());
        assert!(classify("echo hello > /workspace/out.txt").is_empty());
        assert!(classify("python3 main.py 2>/dev/null").is_empty());
    }

    #[test]
    fn test_network_hosts() {
        assert_eq!(
            classify("curl -sSf https://Example.com/install.sh | sh"),
            vec![(PermissionType::NetworkAccess, "example.com".to_string())]
        );
        assert_eq!(
            classify("pip install requests"),
            vec![(PermissionType::NetworkAccess, "pypi.org".to_string())]
        );
        assert_eq!(
            classify("ssh build-host uptime"),
            vec![(PermissionType::NetworkAccess, "ssh".to_string())]
        );
    }

    #[test]
    fn test_each_segment_is_classified() {
        assert_eq!(
            classify("curl https://a.com; nc evil.example 4444"),
            vec![
                (PermissionType::NetworkAccess, "a.com".to_string()),
                (PermissionType::NetworkAccess, "nc".to_string()),
            ]
        );
        assert_eq!(
            classify("wget -q https://mirror.dev/pkg.tgz && ssh deploy@prod 'restart'\nping -c1 db"),
            vec![
                (PermissionType::NetworkAccess, "mirror.dev".to_string()),
                (PermissionType::NetworkAccess, "ssh".to_string()),
                (PermissionType::NetworkAccess, "ping".to_string()),
            ]
        );
    }

    #[test]
    fn test_port_binding() {
        assert_eq!(
            classify("python3 -m http.server"),
            vec![(PermissionType::PortBinding, "8000".to_string())]
        );
        assert!(classify("nc -l 9000").contains(&(PermissionType::PortBinding, "9000".to_string())));
        assert!(classify("uvicorn app:app --port 8080")
            .contains(&(PermissionType::PortBinding, "8080".to_string())));
    }

    #[test]
    fn test_process_and_filesystem() {
        assert_eq!(
            classify("pkill -f worker"),
            vec![(PermissionType::ProcessExecution, "pkill".to_string())]
        );
        assert_eq!(
            classify("echo x >> /etc/hosts"),
            vec![(PermissionType::FileSystemAccess, "/etc/hosts".to_string())]
        );
        assert_eq!(
            classify("cp build/app /workspace/../usr/local/bin/app"),
            vec![(
                PermissionType::FileSystemAccess,
                "/workspace/../usr/local/bin/app".to_string()
            )]
        );
        // Reading outside the workdir is not a write.
        assert!(classify("cat /etc/os-release").is_empty());
    }

    #[test]
    fn test_deduplicates() {
        let ops = classify("curl https://a.dev/x && curl https://a.dev/y");
        assert_eq!(ops.len(), 1);
    }
}
