//! In-memory SSH double for tests
//!
//! `MockRemote` plays the remote host: scripted command output, a few
//! built-in shell commands (`mkdir -p`, `ls -la`, `find -maxdepth 1`) and
//! an in-memory filesystem served through [`RemoteFs`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::config::SessionConfig;
use super::error::SshError;
use super::remote::{ExecOutput, InteractivePrompter, RemoteConnector, RemoteSession};
use crate::sftp::path_utils::{remote_file_name, trim_remote_path};
use crate::sftp::{RemoteEntry, RemoteFs, SftpError};

#[derive(Debug, Clone)]
struct Script {
    stdout: Vec<String>,
    stderr: Vec<String>,
    exit: Option<u32>,
}

pub struct MockRemote {
    scripts: Mutex<HashMap<String, Script>>,
    executed: Mutex<Vec<String>>,
    closes: AtomicUsize,
    alive: AtomicBool,
    fs: Arc<MemoryFs>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
            fs: Arc::new(MemoryFs::new()),
        })
    }

    /// Answer `command` with the given output chunks and exit status
    pub fn script(&self, command: &str, stdout: &[&str], stderr: &[&str], exit: Option<u32>) {
        self.scripts.lock().insert(
            command.to_string(),
            Script {
                stdout: stdout.iter().map(|s| s.to_string()).collect(),
                stderr: stderr.iter().map(|s| s.to_string()).collect(),
                exit,
            },
        );
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fs(&self) -> Arc<MemoryFs> {
        self.fs.clone()
    }

    /// Simulate the network dropping every session
    pub fn drop_connections(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn session(self: &Arc<Self>) -> MockSession {
        MockSession {
            remote: self.clone(),
            open: AtomicBool::new(true),
        }
    }

    fn run(&self, command: &str) -> Script {
        self.executed.lock().push(command.to_string());

        if let Some(script) = self.scripts.lock().get(command) {
            return script.clone();
        }

        if let Some(path) = command.strip_prefix("mkdir -p ") {
            self.fs.add_dir(path);
            return Script::ok(Vec::new());
        }

        if let Some(path) = command.strip_prefix("ls -la ") {
            let children = self.fs.children(trim_remote_path(path));
            return match children {
                Some(children) if !children.is_empty() => {
                    let mut listing = format!("total {}\n", children.len());
                    for (name, is_dir) in children {
                        let kind = if is_dir { 'd' } else { '-' };
                        listing.push_str(&format!("{}rw-r--r-- 1 hpc hpc 0 {}\n", kind, name));
                    }
                    Script::ok(vec![listing])
                }
                _ => Script {
                    stdout: Vec::new(),
                    stderr: vec![format!(
                        "ls: cannot access '{}': No such file or directory\n",
                        path
                    )],
                    exit: Some(2),
                },
            };
        }

        if let Some((dir, pattern)) = command
            .strip_prefix("find ")
            .and_then(|rest| rest.split_once(" -maxdepth 1 -name "))
        {
            let dir = trim_remote_path(dir);
            let prefix = pattern.trim_matches('"').trim_end_matches('*');
            return match self.fs.children(dir) {
                Some(children) => Script::ok(
                    children
                        .into_iter()
                        .filter(|(name, is_dir)| !is_dir && name.starts_with(prefix))
                        .map(|(name, _)| format!("{}/{}\n", dir, name))
                        .collect(),
                ),
                None => Script {
                    stdout: Vec::new(),
                    stderr: vec![format!("find: '{}': No such file or directory\n", dir)],
                    exit: Some(1),
                },
            };
        }

        Script::ok(Vec::new())
    }
}

impl Script {
    fn ok(stdout: Vec<String>) -> Self {
        Self {
            stdout,
            stderr: Vec::new(),
            exit: Some(0),
        }
    }
}

pub struct MockSession {
    remote: Arc<MockRemote>,
    open: AtomicBool,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(
        &self,
        command: &str,
        output: mpsc::UnboundedSender<ExecOutput>,
    ) -> Result<Option<u32>, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }

        let script = self.remote.run(command);
        for chunk in script.stdout {
            let _ = output.send(ExecOutput::Stdout(chunk.into_bytes()));
        }
        for chunk in script.stderr {
            let _ = output.send(ExecOutput::Stderr(chunk.into_bytes()));
        }
        Ok(script.exit)
    }

    async fn open_fs(&self) -> Result<Arc<dyn RemoteFs>, SshError> {
        if !self.is_connected() {
            return Err(SshError::Disconnected);
        }
        Ok(self.remote.fs())
    }

    async fn ping(&self) -> bool {
        self.is_connected()
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.remote.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.remote.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Connector with scripted authentication behaviour
pub struct MockConnector {
    remote: Arc<MockRemote>,
    /// Key passphrase; `None` means an unencrypted key
    secret: Option<String>,
    /// Expected keyboard-interactive answer; the key itself is refused
    keyboard_interactive: Option<String>,
    unreachable: bool,
    attempts: AtomicUsize,
    opened: AtomicUsize,
}

impl MockConnector {
    pub fn new(remote: Arc<MockRemote>) -> Self {
        Self {
            remote,
            secret: None,
            keyboard_interactive: None,
            unreachable: false,
            attempts: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn with_passphrase(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_string());
        self
    }

    pub fn with_keyboard_interactive(mut self, answer: &str) -> Self {
        self.keyboard_interactive = Some(answer.to_string());
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successfully opened sessions
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnector for MockConnector {
    async fn connect(
        &self,
        target: &SessionConfig,
        passphrase: Option<&str>,
        prompter: &dyn InteractivePrompter,
    ) -> Result<Box<dyn RemoteSession>, SshError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.unreachable {
            return Err(SshError::ConnectionFailed(format!(
                "{} unreachable",
                target.host
            )));
        }

        if let Some(expected) = &self.keyboard_interactive {
            let answer = prompter
                .answer(&["Verification code: ".to_string()])
                .await?;
            if &answer != expected {
                return Err(SshError::AuthenticationFailed(
                    "keyboard-interactive rejected".to_string(),
                ));
            }
        } else if let Some(secret) = &self.secret {
            match passphrase {
                None => return Err(SshError::PassphraseRequired),
                Some(p) if p == secret => {}
                Some(_) => {
                    return Err(SshError::AuthenticationFailed(
                        "Invalid key passphrase".to_string(),
                    ))
                }
            }
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.remote.session()))
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// Remote filesystem kept in a sorted map of absolute paths
pub struct MemoryFs {
    nodes: Mutex<BTreeMap<String, Node>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryFs {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::Dir);
        Self {
            nodes: Mutex::new(nodes),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Like `mkdir -p`
    pub fn add_dir(&self, path: &str) {
        let mut nodes = self.nodes.lock();
        let mut current = String::new();
        for part in trim_remote_path(path).split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    /// Create a file and its parent directories
    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.add_dir(parent_of(path));
        self.nodes
            .lock()
            .insert(path.to_string(), Node::File(content.to_vec()));
    }

    /// Every transfer of a file with this name fails
    pub fn fail_transfer(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.lock().get(path) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.nodes.lock().get(path), Some(Node::Dir))
    }

    /// (name, is_dir) of the direct children, `None` when `path` is not a directory
    fn children(&self, path: &str) -> Option<Vec<(String, bool)>> {
        let nodes = self.nodes.lock();
        if !matches!(nodes.get(path), Some(Node::Dir)) {
            return None;
        }
        Some(
            nodes
                .iter()
                .filter(|(p, _)| p.as_str() != "/" && parent_of(p) == path)
                .map(|(p, node)| {
                    (
                        remote_file_name(p).to_string(),
                        matches!(node, Node::Dir),
                    )
                })
                .collect(),
        )
    }

    fn check_injected(&self, path: &str) -> Result<(), SftpError> {
        if self.failing.lock().contains(remote_file_name(path)) {
            return Err(SftpError::TransferError(format!("injected failure: {}", path)));
        }
        Ok(())
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "",
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        let path = trim_remote_path(path);
        let children = self
            .children(path)
            .ok_or_else(|| SftpError::DirectoryNotFound(path.to_string()))?;

        let nodes = self.nodes.lock();
        Ok(children
            .into_iter()
            .map(|(name, is_dir)| {
                let full = crate::sftp::path_utils::join_remote_path(path, &name);
                let size = match nodes.get(&full) {
                    Some(Node::File(content)) => content.len() as u64,
                    _ => 0,
                };
                RemoteEntry {
                    name,
                    path: full,
                    is_dir,
                    size,
                }
            })
            .collect())
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        let mut nodes = self.nodes.lock();
        match nodes.get(path) {
            Some(Node::Dir) => return Err(SftpError::AlreadyExists(path.to_string())),
            Some(Node::File(_)) => {
                return Err(SftpError::ProtocolError(format!("{} is a file", path)))
            }
            None => {}
        }
        if !matches!(nodes.get(parent_of(path)), Some(Node::Dir)) {
            return Err(SftpError::DirectoryNotFound(parent_of(path).to_string()));
        }
        nodes.insert(path.to_string(), Node::Dir);
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<u64, SftpError> {
        self.check_injected(remote)?;
        let content = tokio::fs::read(local).await?;

        let mut nodes = self.nodes.lock();
        if !matches!(nodes.get(parent_of(remote)), Some(Node::Dir)) {
            return Err(SftpError::DirectoryNotFound(parent_of(remote).to_string()));
        }
        let len = content.len() as u64;
        nodes.insert(remote.to_string(), Node::File(content));
        Ok(len)
    }

    async fn download_file(&self, remote: &str, local: &Path) -> Result<u64, SftpError> {
        self.check_injected(remote)?;
        let content = self
            .file(remote)
            .ok_or_else(|| SftpError::FileNotFound(remote.to_string()))?;
        tokio::fs::write(local, &content).await?;
        Ok(content.len() as u64)
    }
}
