use std::process::{Output, Stdio};

use anyhow::Context as _;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWriteExt as _};
use tokio::process::Command;

pub const PLACEHOLDER: &str = "{}";

const STDERR_TAIL_MAX_CHARS: usize = 200;

/// Read one item per line, skipping blank lines.
pub async fn read_items<R>(reader: R) -> anyhow::Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut items = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        items.push(line.to_string());
    }
    Ok(items)
}

/// Command line run for every item or chunk.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    program: String,
    args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(argv: &[String]) -> anyhow::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("no command given"))?;
        if program.trim().is_empty() {
            anyhow::bail!("command must not be empty");
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments for one item: every `{}` is replaced, or the item is appended
    /// when no argument contains one.
    pub fn args_for_item(&self, item: &str) -> Vec<String> {
        if self.args.iter().any(|arg| arg.contains(PLACEHOLDER)) {
            return self
                .args
                .iter()
                .map(|arg| arg.replace(PLACEHOLDER, item))
                .collect();
        }
        let mut args = self.args.clone();
        args.push(item.to_string());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    pub async fn run_item(&self, item: String) -> anyhow::Result<()> {
        let output = self
            .command(&self.args_for_item(&item))
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to start {}", self.program))?;
        check_output(&self.program, &output)
    }

    /// Run the command once with `lines` written to its stdin.
    pub async fn run_chunk(&self, lines: Vec<String>) -> anyhow::Result<()> {
        let mut child = self
            .command(&self.args)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start {}", self.program))?;

        let mut payload = lines.join("\n");
        payload.push('\n');
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("stdin of {} is not piped", self.program))?;

        let feed = async move {
            let res = stdin.write_all(payload.as_bytes()).await;
            drop(stdin);
            match res {
                Err(err) if err.kind() != std::io::ErrorKind::BrokenPipe => Err(err),
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.with_context(|| format!("failed to wait for {}", self.program))?;
        check_output(&self.program, &output)?;
        fed.with_context(|| format!("failed to write items to {}", self.program))
    }
}

fn check_output(program: &str, output: &Output) -> anyhow::Result<()> {
    if output.status.success() {
        return Ok(());
    }
    match stderr_tail(&output.stderr) {
        Some(tail) => anyhow::bail!("{program} failed ({}): {tail}", output.status),
        None => anyhow::bail!("{program} failed ({})", output.status),
    }
}

/// Last non-empty stderr line, shortened for one-line display.
fn stderr_tail(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let line = text.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    if line.chars().count() <= STDERR_TAIL_MAX_CHARS {
        return Some(line.to_string());
    }
    let mut short: String = line.chars().take(STDERR_TAIL_MAX_CHARS).collect();
    short.push('…');
    Some(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(argv: &[&str]) -> CommandTemplate {
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        CommandTemplate::new(&argv).unwrap()
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let items = read_items(&b"alpha\r\n\n  \nbeta\n gamma \n"[..]).await.unwrap();
        assert_eq!(items, vec!["alpha", "beta", " gamma "]);
    }

    #[test]
    fn placeholder_is_substituted_or_item_appended() {
        let t = template(&["curl", "-o", "{}.html", "https://example.org/{}"]);
        assert_eq!(
            t.args_for_item("a"),
            vec!["-o", "a.html", "https://example.org/a"]
        );

        let t = template(&["echo", "-n"]);
        assert_eq!(t.args_for_item("a b"), vec!["-n", "a b"]);
        assert_eq!(t.program(), "echo");
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandTemplate::new(&[]).is_err());
        assert!(CommandTemplate::new(&[" ".to_string()]).is_err());
    }

    #[test]
    fn stderr_tail_takes_the_last_line() {
        assert_eq!(stderr_tail(b""), None);
        assert_eq!(stderr_tail(b"warming up\nfatal: no such host\n\n").as_deref(), Some("fatal: no such host"));

        let long = "x".repeat(500);
        let tail = stderr_tail(long.as_bytes()).unwrap();
        assert_eq!(tail.chars().count(), STDERR_TAIL_MAX_CHARS + 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn item_mode_passes_the_item_and_reports_failures() {
        let t = template(&["sh", "-c", "test \"$0\" = hello"]);
        t.run_item("hello".to_string()).await.unwrap();

        let err = t.run_item("bye".to_string()).await.unwrap_err();
        assert!(err.to_string().starts_with("sh failed"));

        let t = template(&["sh", "-c", "echo \"no access to $0\" >&2; exit 3"]);
        let err = t.run_item("secret".to_string()).await.unwrap_err();
        assert!(err.to_string().ends_with("no access to secret"), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn chunk_mode_feeds_lines_on_stdin() {
        let t = template(&["sh", "-c", "[ $(wc -l) -eq 3 ]"]);
        t.run_chunk(vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert!(t.run_chunk(vec!["a".into()]).await.is_err());
    }

    #[tokio::test]
    async fn missing_program_fails_to_start() {
        let t = template(&["batchflow-test-no-such-program"]);
        let err = t.run_item("x".to_string()).await.unwrap_err();
        assert!(err.to_string().contains("failed to start"));
    }
}
