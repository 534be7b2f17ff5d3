//! Console API
//!
//! Installs `console.log`, `console.info`, `console.warn`, `console.error`,
//! `console.debug` and `console.trace`, routed to `tracing` or to a custom sink.

use std::fmt;
use std::rc::Rc;

use crate::error::Result;
use crate::handle::{ScriptType, ValueHandle};
use crate::host::{Bindings, CallArgs};
use crate::realm::Realm;
use crate::scope::Scope;

/// Severity of a console call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Trace,
}

impl ConsoleLevel {
    const ALL: [(&'static str, ConsoleLevel); 6] = [
        ("log", ConsoleLevel::Log),
        ("info", ConsoleLevel::Info),
        ("warn", ConsoleLevel::Warn),
        ("error", ConsoleLevel::Error),
        ("debug", ConsoleLevel::Debug),
        ("trace", ConsoleLevel::Trace),
    ];
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsoleLevel::Log => "LOG",
            ConsoleLevel::Info => "INFO",
            ConsoleLevel::Warn => "WARN",
            ConsoleLevel::Error => "ERROR",
            ConsoleLevel::Debug => "DEBUG",
            ConsoleLevel::Trace => "TRACE",
        };
        f.write_str(name)
    }
}

/// Receiver of formatted console lines
pub type ConsoleSink = Rc<dyn Fn(ConsoleLevel, &str)>;

/// Install a console that logs through `tracing`
pub fn install_console(realm: &mut Realm) -> Result<()> {
    install_console_with(realm, Rc::new(log_line))
}

/// Install a console that hands every line to `sink`
pub fn install_console_with(realm: &mut Realm, sink: ConsoleSink) -> Result<()> {
    let mut bindings = Bindings::new();
    bindings.namespace("console", |console| {
        for (name, level) in ConsoleLevel::ALL {
            let sink = Rc::clone(&sink);
            console.function(name, move |scope: &mut Scope<'_>, args: &CallArgs| {
                let line = format_args_line(scope, args.all())?;
                sink(level, &line);
                Ok(())
            });
        }
    });
    realm.install(bindings)
}

fn log_line(level: ConsoleLevel, line: &str) {
    match level {
        ConsoleLevel::Error => tracing::error!("[JS] {}", line),
        ConsoleLevel::Warn => tracing::warn!("[JS] {}", line),
        ConsoleLevel::Debug => tracing::debug!("[JS] {}", line),
        ConsoleLevel::Trace => tracing::trace!("[JS] {}", line),
        ConsoleLevel::Log | ConsoleLevel::Info => tracing::info!("[JS] {}", line),
    }
}

/// Space-separated rendering; strings print bare
fn format_args_line(scope: &mut Scope<'_>, values: &[ValueHandle]) -> Result<String> {
    let mut output = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            output.push(' ');
        }
        match value.tag() {
            ScriptType::String => output.push_str(&value.as_string(scope)?),
            _ => output.push_str(&scope.dump(value)?),
        }
    }
    Ok(output)
}

#[cfg(all(test, feature = "native"))]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::Runtime;

    fn capture(realm: &mut Realm) -> Rc<RefCell<Vec<(ConsoleLevel, String)>>> {
        let lines = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&lines);
        install_console_with(
            realm,
            Rc::new(move |level, line: &str| sink.borrow_mut().push((level, line.to_string()))),
        )
        .unwrap();
        lines
    }

    #[test]
    fn test_console_log() {
        let runtime = Runtime::new().unwrap();
        let mut realm = runtime.create_realm().unwrap();
        install_console(&mut realm).unwrap();
        realm.eval::<()>("console.log('test message')").unwrap();
    }

    #[test]
    fn test_console_multiple_args() {
        let runtime = Runtime::new().unwrap();
        let mut realm = runtime.create_realm().unwrap();
        let lines = capture(&mut realm);
        realm.eval::<()>("console.log('Hello', 42, true)").unwrap();
        assert_eq!(lines.borrow()[0], (ConsoleLevel::Log, "Hello 42 true".to_string()));
    }

    #[test]
    fn test_console_levels() {
        let runtime = Runtime::new().unwrap();
        let mut realm = runtime.create_realm().unwrap();
        let lines = capture(&mut realm);
        realm
            .eval::<()>("console.info('info'); console.warn('warn'); console.error('error'); console.debug('debug')")
            .unwrap();
        let levels: Vec<ConsoleLevel> = lines.borrow().iter().map(|(level, _)| *level).collect();
        assert_eq!(
            levels,
            [ConsoleLevel::Info, ConsoleLevel::Warn, ConsoleLevel::Error, ConsoleLevel::Debug]
        );
    }
}
