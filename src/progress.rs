//! Index progress reporting.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for scripts:
//! human-readable lines, one JSON object per line, or nothing.

use std::io::Write;

/// Stage of the indexing pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexPhase {
    Loading,
    Embedding,
    Writing,
}

impl IndexPhase {
    fn as_str(&self) -> &'static str {
        match self {
            IndexPhase::Loading => "loading",
            IndexPhase::Embedding => "embedding",
            IndexPhase::Writing => "writing",
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            IndexPhase::Loading => "files",
            IndexPhase::Embedding => "nodes",
            IndexPhase::Writing => "documents",
        }
    }
}

#[derive(Clone, Debug)]
pub enum IndexProgressEvent {
    /// Walking the source root; total unknown.
    Discovering { root: String },
    /// `n` of `total` units done in `phase`.
    Advanced { phase: IndexPhase, n: u64, total: u64 },
}

pub trait IndexProgressReporter: Send + Sync {
    fn report(&self, event: IndexProgressEvent);
}

/// "index  embedding  1,200 / 5,000 nodes"
pub struct StderrProgress;

impl IndexProgressReporter for StderrProgress {
    fn report(&self, event: IndexProgressEvent) {
        let line = match &event {
            IndexProgressEvent::Discovering { root } => {
                format!("index {}  discovering...\n", root)
            }
            IndexProgressEvent::Advanced { phase, n, total } => format!(
                "index  {}  {} / {} {}\n",
                phase.as_str(),
                format_number(*n),
                format_number(*total),
                phase.unit()
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

pub struct JsonProgress;

impl IndexProgressReporter for JsonProgress {
    fn report(&self, event: IndexProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

fn event_json(event: &IndexProgressEvent) -> serde_json::Value {
    match event {
        IndexProgressEvent::Discovering { root } => serde_json::json!({
            "event": "progress",
            "phase": "discovering",
            "root": root,
        }),
        IndexProgressEvent::Advanced { phase, n, total } => serde_json::json!({
            "event": "progress",
            "phase": phase.as_str(),
            "n": n,
            "total": total,
        }),
    }
}

pub struct NoProgress;

impl IndexProgressReporter for NoProgress {
    fn report(&self, _event: IndexProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse the `--progress` flag value.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => anyhow::bail!("Unknown progress mode: {}. Use off, human, or json.", other),
        }
    }

    pub fn reporter(&self) -> Box<dyn IndexProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_event_shape() {
        let v = event_json(&IndexProgressEvent::Advanced {
            phase: IndexPhase::Embedding,
            n: 3,
            total: 10,
        });
        assert_eq!(v["phase"], "embedding");
        assert_eq!(v["n"], 3);
        assert_eq!(v["total"], 10);
    }

    #[test]
    fn parse_modes() {
        assert_eq!(ProgressMode::parse("json").unwrap(), ProgressMode::Json);
        assert_eq!(ProgressMode::parse("off").unwrap(), ProgressMode::Off);
        assert!(ProgressMode::parse("loud").is_err());
    }
}
