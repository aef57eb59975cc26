use std::{collections::VecDeque, process::ExitStatus};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, trace};

pub const TAIL_LINES: usize = 200;

/// Last lines written to one output stream of the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTail {
    lines: VecDeque<String>,
    limit: usize,
    dropped: usize,
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(TAIL_LINES)
    }
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(limit.min(64)),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.limit == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.limit {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|line| line.trim().is_empty())
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn text(&self) -> String {
        let body = self
            .lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        let body = body.trim();
        if self.dropped > 0 {
            format!("[{} earlier lines omitted]\n{body}", self.dropped)
        } else {
            body.to_string()
        }
    }
}

/// Read `reader` to EOF, forwarding each line at trace level and keeping a bounded tail.
pub async fn drain<R>(reader: R, stream: &'static str, scan_id: String) -> OutputTail
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut tail = OutputTail::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                trace!(scan_id = %scan_id, stream, line = %line, "tool output");
                tail.push(line);
            }
            Err(err) => {
                debug!(scan_id = %scan_id, stream, error = %err, "stopped reading tool output");
                break;
            }
        }
    }
    tail
}

/// "`tool` exited with code N" or "`tool` terminated by signal N".
pub fn describe_exit(tool: &str, status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("{tool} exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("{tool} terminated by signal {signal}");
        }
    }
    format!("{tool} exited abnormally")
}

/// Failure text for a non-zero exit, including the most useful captured output.
pub fn failure_message(
    tool: &str,
    status: ExitStatus,
    stdout: &OutputTail,
    stderr: &OutputTail,
) -> String {
    let headline = describe_exit(tool, status);
    if !stderr.is_empty() {
        format!("{headline}\nSTDERR:\n{}", stderr.text())
    } else if !stdout.is_empty() {
        format!("{headline}\nSTDOUT:\n{}", stdout.text())
    } else {
        headline
    }
}
