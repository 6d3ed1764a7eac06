//! Line scanners turning engine output into structured signals.
//!
//! Engine output is not a stable format, so parsing is best effort: a line no
//! matcher recognizes yields no signal and is never an error.

use crate::engine::EngineKind;
use crate::result::CrashDescriptor;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    CrashDetected { crash_type: String, location: String },
    CoverageSample { count: u64 },
    ExecutionSample { count: u64 },
}

type Extract = fn(&Captures<'_>) -> Vec<Signal>;

struct Matcher {
    regex: Regex,
    extract: Extract,
}

impl Matcher {
    fn new(pattern: &str, extract: Extract) -> Self {
        Self {
            regex: Regex::new(pattern).expect("failed to compile output pattern"),
            extract,
        }
    }
}

const SANITIZER_SUMMARY: &str = r"SUMMARY:\s+\w+Sanitizer:\s+([\w-]+)(?:\s+(.*))?$";

static LIBFUZZER_MATCHERS: Lazy<Vec<Matcher>> = Lazy::new(|| {
    vec![
        Matcher::new(SANITIZER_SUMMARY, crash),
        Matcher::new(
            r"SUMMARY:\s+libFuzzer:\s+([^(]+?)\s*(?:\((.*)\))?\s*$",
            crash,
        ),
        Matcher::new(r"^stat::number_of_executed_units:\s+(\d+)", executions),
        Matcher::new(r"^#(\d+)\s+\w+.*?\bcov:\s+(\d+)", executions_and_coverage),
        Matcher::new(r"^#(\d+)\b", executions),
        Matcher::new(r"\bcov:\s*(\d+)", coverage),
    ]
});

static AFL_MATCHERS: Lazy<Vec<Matcher>> = Lazy::new(|| {
    vec![
        Matcher::new(SANITIZER_SUMMARY, crash),
        Matcher::new(r"^\s*execs_done\s*:\s*(\d+)", executions),
        Matcher::new(r"^\s*edges_found\s*:\s*(\d+)", coverage),
        Matcher::new(r"total execs\s*:\s*([\d,]+)", executions),
        Matcher::new(r"\bcov(?:erage)?:\s*(\d+)", coverage),
    ]
});

fn number(caps: &Captures<'_>, group: usize) -> Option<u64> {
    caps.get(group)?.as_str().replace(',', "").parse().ok()
}

fn crash(caps: &Captures<'_>) -> Vec<Signal> {
    let crash_type = caps.get(1).map_or("", |m| m.as_str()).trim().to_string();
    if crash_type.is_empty() {
        return Vec::new();
    }
    let location = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
    vec![Signal::CrashDetected {
        crash_type,
        location,
    }]
}

fn executions(caps: &Captures<'_>) -> Vec<Signal> {
    number(caps, 1)
        .map(|count| Signal::ExecutionSample { count })
        .into_iter()
        .collect()
}

fn coverage(caps: &Captures<'_>) -> Vec<Signal> {
    number(caps, 1)
        .map(|count| Signal::CoverageSample { count })
        .into_iter()
        .collect()
}

fn executions_and_coverage(caps: &Captures<'_>) -> Vec<Signal> {
    let mut signals = executions(caps);
    if let Some(count) = number(caps, 2) {
        signals.push(Signal::CoverageSample { count });
    }
    signals
}

fn matchers(family: EngineKind) -> &'static [Matcher] {
    match family {
        EngineKind::LibFuzzer => &LIBFUZZER_MATCHERS,
        EngineKind::Afl => &AFL_MATCHERS,
    }
}

/// Signals carried by one output line. The first matcher of the family that
/// recognizes the line decides the result.
pub fn parse_line(family: EngineKind, line: &str) -> Vec<Signal> {
    let line = line.trim_end();
    for matcher in matchers(family) {
        if let Some(caps) = matcher.regex.captures(line) {
            return (matcher.extract)(&caps);
        }
    }
    Vec::new()
}

/// The first crash classification found in `output`, using the same patterns
/// as live crash detection.
pub fn crash_type_from_output(family: EngineKind, output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        parse_line(family, line)
            .into_iter()
            .find_map(|signal| match signal {
                Signal::CrashDetected { crash_type, .. } => Some(crash_type),
                _ => None,
            })
    })
}

/// Folds signals of one run, preserving the order in which crashes were seen.
#[derive(Debug, Default, Clone)]
pub struct SignalAccumulator {
    executions: u64,
    coverage: u64,
    crashes: Vec<CrashDescriptor>,
}

impl SignalAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb(&mut self, signal: Signal) {
        match signal {
            Signal::CrashDetected {
                crash_type,
                location,
            } => self.crashes.push(CrashDescriptor {
                crash_type,
                location,
            }),
            // Counters only grow; final-stat lines may repeat an earlier value.
            Signal::CoverageSample { count } => self.coverage = self.coverage.max(count),
            Signal::ExecutionSample { count } => self.executions = self.executions.max(count),
        }
    }

    /// Parses and absorbs one line, returning how many crashes it added.
    pub fn feed_line(&mut self, family: EngineKind, line: &str) -> usize {
        let before = self.crashes.len();
        for signal in parse_line(family, line) {
            self.absorb(signal);
        }
        self.crashes.len() - before
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn coverage(&self) -> u64 {
        self.coverage
    }

    pub fn crashes(&self) -> &[CrashDescriptor] {
        &self.crashes
    }

    pub fn crash_count(&self) -> usize {
        self.crashes.len()
    }

    pub fn into_parts(self) -> (u64, u64, Vec<CrashDescriptor>) {
        (self.executions, self.coverage, self.crashes)
    }
}
