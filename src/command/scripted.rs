//! In-memory [`CommandRunner`] for tests and dry runs.
//!
//! Replies are matched by program name and argument prefix, most recently
//! added rule first. Unmatched commands succeed with empty output. Every
//! call is recorded so tests can assert on ordering.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{BackgroundProcess, CommandError, CommandOutput, CommandRunner, CommandSpec};

type Effect = Arc<dyn Fn(&CommandSpec) + Send + Sync>;

/// A canned response.
#[derive(Clone)]
pub struct Reply {
    output: Option<CommandOutput>,
    effect: Option<Effect>,
    delay: Duration,
}

impl Reply {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::output(CommandOutput::ok(stdout))
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self::output(CommandOutput::failed(code, stderr))
    }

    pub fn output(output: CommandOutput) -> Self {
        Self {
            output: Some(output),
            effect: None,
            delay: Duration::ZERO,
        }
    }

    /// The program cannot be started at all.
    pub fn spawn_error() -> Self {
        Self {
            output: None,
            effect: None,
            delay: Duration::ZERO,
        }
    }

    /// Run `effect` (e.g. create files the real tool would write) before replying.
    pub fn with_effect<F>(mut self, effect: F) -> Self
    where
        F: Fn(&CommandSpec) + Send + Sync + 'static,
    {
        self.effect = Some(Arc::new(effect));
        self
    }

    /// Take this long before replying.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct Rule {
    program: String,
    prefix: Vec<String>,
    replies: VecDeque<Reply>,
    /// Reply reused once the queue is drained
    last: Reply,
}

impl Rule {
    fn matches(&self, spec: &CommandSpec) -> bool {
        spec.program == self.program
            && spec.args.len() >= self.prefix.len()
            && spec.args.iter().zip(&self.prefix).all(|(a, p)| a == p)
    }

    fn next(&mut self) -> Reply {
        self.replies.pop_front().unwrap_or_else(|| self.last.clone())
    }
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    calls: Vec<CommandSpec>,
    spawned: Vec<CommandSpec>,
    interrupted: Vec<String>,
}

/// Scripted stand-in for real tools.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<State>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the calls recorded so far.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Always answer `program <prefix...>` with `reply`.
    pub fn on(&self, program: &str, prefix: &[&str], reply: Reply) -> &Self {
        self.on_sequence(program, prefix, vec![reply])
    }

    /// Answer successive matching calls with `replies` in order, repeating the last.
    pub fn on_sequence(&self, program: &str, prefix: &[&str], replies: Vec<Reply>) -> &Self {
        let mut replies: VecDeque<Reply> = replies.into();
        let last = replies.back().cloned().unwrap_or_else(|| Reply::ok(""));
        if replies.len() == 1 {
            replies.clear();
        }
        self.lock().rules.push(Rule {
            program: program.to_string(),
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            replies,
            last,
        });
        self
    }

    /// Every `run` call so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.lock().calls.clone()
    }

    /// Every `spawn` call so far, in order.
    pub fn spawned(&self) -> Vec<CommandSpec> {
        self.lock().spawned.clone()
    }

    /// Programs whose background handle was interrupted.
    pub fn interrupted(&self) -> Vec<String> {
        self.lock().interrupted.clone()
    }

    /// `run` calls rendered as command lines.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::display).collect()
    }

    /// Whether any call ran `program` with an argument list starting with `prefix`.
    pub fn ran(&self, program: &str, prefix: &[&str]) -> bool {
        self.calls().iter().any(|spec| {
            spec.program == program
                && spec.args.len() >= prefix.len()
                && spec.args.iter().zip(prefix).all(|(a, p)| a == p)
        })
    }

    fn reply_for(&self, spec: &CommandSpec) -> Option<Reply> {
        let mut state = self.lock();
        state
            .rules
            .iter_mut()
            .rev()
            .find(|rule| rule.matches(spec))
            .map(Rule::next)
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        self.lock().calls.push(spec.clone());
        let reply = self.reply_for(spec).unwrap_or_else(|| Reply::ok(""));

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }
        if let Some(effect) = &reply.effect {
            effect(spec);
        }
        reply.output.ok_or_else(|| CommandError::Spawn {
            program: spec.program.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
        })
    }

    async fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn BackgroundProcess>, CommandError> {
        self.lock().spawned.push(spec.clone());
        let reply = self.reply_for(spec).unwrap_or_else(|| Reply::ok(""));
        if let Some(effect) = &reply.effect {
            effect(spec);
        }
        if reply.output.is_none() {
            return Err(CommandError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }
        Ok(Box::new(ScriptedProcess {
            program: spec.program.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedProcess {
    program: String,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BackgroundProcess for ScriptedProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn interrupt(&mut self, _grace: Duration) -> Result<(), CommandError> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .interrupted
            .push(self.program.clone());
        Ok(())
    }
}
