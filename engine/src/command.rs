// command.rs — Deferred side effects produced during evaluation
//
// Operators never touch the outside world directly; they append commands
// here. The engine never runs them. An external executor drains the buffer
// after a pass and calls `prepare` then, later, `restore` for each command,
// nesting scoped pairs like a stack. Nesting is not validated here.

use std::fmt;

use crate::id::InstanceId;
use crate::value::Value;

pub type Action = Box<dyn FnOnce(&[Value]) + Send>;

/// A deferred (prepare, restore) pair plus its captured parameters.
pub struct Command {
    pub label: String,
    pub origin: Option<InstanceId>,
    pub params: Vec<Value>,
    prepare: Option<Action>,
    restore: Option<Action>,
}

impl Command {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            origin: None,
            params: Vec::new(),
            prepare: None,
            restore: None,
        }
    }

    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn from_instance(mut self, origin: InstanceId) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn on_prepare(mut self, action: impl FnOnce(&[Value]) + Send + 'static) -> Self {
        self.prepare = Some(Box::new(action));
        self
    }

    pub fn on_restore(mut self, action: impl FnOnce(&[Value]) + Send + 'static) -> Self {
        self.restore = Some(Box::new(action));
        self
    }

    /// Run the prepare action, if any. Runs at most once.
    pub fn prepare(&mut self) {
        if let Some(action) = self.prepare.take() {
            action(&self.params);
        }
    }

    /// Run the restore action, if any. Runs at most once.
    pub fn restore(&mut self) {
        if let Some(action) = self.restore.take() {
            action(&self.params);
        }
    }

    pub fn is_scoped(&self) -> bool {
        self.restore.is_some()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("label", &self.label)
            .field("origin", &self.origin)
            .field("params", &self.params)
            .field("prepare", &self.prepare.is_some())
            .field("restore", &self.restore.is_some())
            .finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)?;
        if !self.params.is_empty() {
            let params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
            write!(f, "({})", params.join(", "))?;
        }
        if let Some(origin) = self.origin {
            write!(f, " from {}", origin)?;
        }
        Ok(())
    }
}

/// Ordered collection point for commands. No execution logic lives here.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn extend(&mut self, commands: impl IntoIterator<Item = Command>) {
        self.commands.extend(commands);
    }

    /// Take every buffered command in insertion order.
    pub fn drain(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
