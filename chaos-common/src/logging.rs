use std::fmt;
use std::sync::Arc;

use log::Level;

/// Target used for records of every privileged change made to a target.
pub const AUDIT_TARGET: &str = "chaos_audit";

/// Named, structured logging handle.
///
/// Components receive a `Logger` at construction time and derive child
/// loggers with [`Logger::with_name`] and [`Logger::with_value`]. Every line is
/// rendered as `[name] message key=value ...` and emitted through the `log`
/// facade with the logger name as target, so `RUST_LOG=controller.engine=debug`
/// works as expected.
#[derive(Clone)]
pub struct Logger {
    name: Arc<str>,
    fields: Arc<Vec<(String, String)>>,
}

impl Logger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            fields: Arc::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Child logger named `parent.child`, keeping the parent's fields.
    pub fn with_name(&self, child: &str) -> Self {
        Self {
            name: Arc::from(format!("{}.{}", self.name, child)),
            fields: Arc::clone(&self.fields),
        }
    }

    pub fn with_value(&self, key: &str, value: impl fmt::Display) -> Self {
        let mut fields = (*self.fields).clone();
        fields.push((key.to_string(), value.to_string()));
        Self {
            name: Arc::clone(&self.name),
            fields: Arc::new(fields),
        }
    }

    pub fn debug(&self, msg: impl fmt::Display) {
        self.emit(Level::Debug, &self.name, msg);
    }

    pub fn info(&self, msg: impl fmt::Display) {
        self.emit(Level::Info, &self.name, msg);
    }

    pub fn warn(&self, msg: impl fmt::Display) {
        self.emit(Level::Warn, &self.name, msg);
    }

    pub fn error(&self, err: &dyn fmt::Display, msg: impl fmt::Display) {
        self.with_value("error", err)
            .emit(Level::Error, &self.name, msg);
    }

    /// Record a change to a chaos target on the audit target.
    pub fn audit(&self, msg: impl fmt::Display) {
        self.emit(Level::Info, AUDIT_TARGET, msg);
    }

    pub fn render(&self, msg: impl fmt::Display) -> String {
        let mut line = format!("[{}] {}", self.name, msg);
        for (key, value) in self.fields.iter() {
            if value.is_empty() || value.contains(char::is_whitespace) {
                line.push_str(&format!(" {key}={value:?}"));
            } else {
                line.push_str(&format!(" {key}={value}"));
            }
        }
        line
    }

    fn emit(&self, level: Level, target: &str, msg: impl fmt::Display) {
        if log::log_enabled!(target: target, level) {
            log::log!(target: target, level, "{}", self.render(msg));
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_names_are_dotted() {
        let log = Logger::new("controller").with_name("engine");
        assert_eq!(log.name(), "controller.engine");
    }

    #[test]
    fn fields_render_in_insertion_order() {
        let log = Logger::new("chaosd")
            .with_value("container", "docker://abc")
            .with_value("pid", 42);
        assert_eq!(
            log.render("installed"),
            "[chaosd] installed container=docker://abc pid=42"
        );
    }

    #[test]
    fn values_with_spaces_are_quoted() {
        let log = Logger::new("chaosd").with_value("output", "Connection refused");
        assert_eq!(
            log.render("curl failed"),
            "[chaosd] curl failed output=\"Connection refused\""
        );
    }

    #[test]
    fn child_keeps_parent_fields_without_sharing_new_ones() {
        let parent = Logger::new("a").with_value("k", "v");
        let child = parent.with_name("b").with_value("x", 1);
        assert_eq!(parent.render("m"), "[a] m k=v");
        assert_eq!(child.render("m"), "[a.b] m k=v x=1");
    }
}
