//! Unhandled-error reporting: handler chaining, stack capture and the
//! panic hook.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::sync::Arc;

use crate::agent::Agent;
use crate::types::RawException;

/// An error nobody handled, as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorReport {
    pub message: String,
    pub url: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub error: Option<RawException>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_location(mut self, url: impl Into<String>, line: u32, column: u32) -> Self {
        self.url = Some(url.into());
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn with_error(mut self, error: RawException) -> Self {
        self.error = Some(error);
        self
    }
}

pub type ErrorHandler = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

/// Handlers run in registration order, each before the agent logs.
#[derive(Clone, Default)]
pub struct ErrorHookChain {
    handlers: Vec<ErrorHandler>,
}

impl ErrorHookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl Fn(&ErrorReport) + Send + Sync + 'static) {
        self.handlers.push(Arc::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, report: &ErrorReport) {
        for handler in &self.handlers {
            handler(report);
        }
    }
}

// Innermost frames that belong to the agent, the backtrace machinery or the
// panic runtime rather than to the host.
const AGENT_FRAME_PREFIXES: &[&str] = &[
    "loupe_agent::",
    "std::backtrace",
    "<std::backtrace",
    "std::panicking",
    "core::panicking",
    "std::sys",
    "rust_begin_unwind",
    "__rustc::",
    "<alloc::boxed::Box",
];

/// Capture the current stack, oldest caller first, without the agent's own
/// frames. Empty when backtraces are disabled.
pub fn capture_stack() -> Vec<String> {
    frames_from(&Backtrace::capture())
}

/// Host frames of `backtrace`, oldest caller first.
pub fn frames_from(backtrace: &Backtrace) -> Vec<String> {
    if backtrace.status() != BacktraceStatus::Captured {
        return Vec::new();
    }
    frames_from_backtrace(&backtrace.to_string())
}

/// Frame symbols from a rendered backtrace, which lists the newest frame first.
fn frames_from_backtrace(rendered: &str) -> Vec<String> {
    let newest_first: Vec<String> = rendered
        .lines()
        .filter_map(|line| {
            let (index, symbol) = line.trim_start().split_once(": ")?;
            index.parse::<usize>().ok()?;
            Some(symbol.trim().to_string())
        })
        .collect();

    let user_start = newest_first
        .iter()
        .position(|frame| !AGENT_FRAME_PREFIXES.iter().any(|p| frame.starts_with(p)))
        .unwrap_or(newest_first.len());

    newest_first[user_start..].iter().rev().cloned().collect()
}

/// Chain the agent behind whatever panic hook is currently installed.
///
/// Must be called from within a tokio runtime; panics are reported on
/// that runtime. The previous hook always runs first. The stack is taken
/// on the panicking thread, whatever `RUST_BACKTRACE` says.
pub fn install_panic_hook(agent: &Arc<Agent>) {
    let previous = std::panic::take_hook();
    let agent = Arc::downgrade(agent);
    let runtime = tokio::runtime::Handle::try_current().ok();

    std::panic::set_hook(Box::new(move |info| {
        previous(info);

        let (Some(agent), Some(runtime)) = (agent.upgrade(), runtime.as_ref()) else {
            return;
        };
        let stack_trace = frames_from(&Backtrace::force_capture());

        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());

        let mut report = ErrorReport::new(message.clone())
            .with_error(
                RawException::new(message)
                    .with_name("panic")
                    .with_stack_trace(stack_trace),
            );
        if let Some(location) = info.location() {
            report = report.with_location(location.file(), location.line(), location.column());
        }

        runtime.spawn(async move {
            agent.report_unhandled_error(report).await;
        });
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn handlers_run_in_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut chain = ErrorHookChain::new();

        let c = calls.clone();
        chain.register(move |r| c.lock().unwrap().push(format!("first:{}", r.message)));
        let c = calls.clone();
        chain.register(move |r| c.lock().unwrap().push(format!("second:{}", r.message)));

        chain.dispatch(&ErrorReport::new("boom"));
        assert_eq!(*calls.lock().unwrap(), vec!["first:boom", "second:boom"]);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn agent_frames_are_stripped_and_order_reversed() {
        let rendered = "\
   0: std::backtrace::Backtrace::capture
             at /rustc/library/std/src/backtrace.rs:296:9
   1: loupe_agent::hooks::capture_stack
   2: app::save
             at ./src/main.rs:10:5
   3: app::main
   4: std::rt::lang_start";

        assert_eq!(
            frames_from_backtrace(rendered),
            vec!["std::rt::lang_start", "app::main", "app::save"]
        );
    }

    #[test]
    fn panic_runtime_frames_are_stripped() {
        let rendered = "\
   0: std::backtrace::Backtrace::force_capture
   1: loupe_agent::hooks::install_panic_hook::{{closure}}
   2: <alloc::boxed::Box<F,A> as core::ops::function::Fn<Args>>::call
   3: std::panicking::rust_panic_with_hook
   4: std::panicking::begin_panic_handler::{{closure}}
   5: std::sys::backtrace::__rust_end_short_backtrace
   6: rust_begin_unwind
   7: core::panicking::panic_fmt
   8: app::checkout
   9: app::main";

        assert_eq!(frames_from_backtrace(rendered), vec!["app::main", "app::checkout"]);
    }

    #[test]
    fn disabled_backtrace_gives_no_frames() {
        assert!(frames_from(&Backtrace::disabled()).is_empty());
    }

    #[test]
    fn empty_backtrace_gives_no_frames() {
        assert!(frames_from_backtrace("").is_empty());
    }
}
