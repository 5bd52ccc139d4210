//! Test mock for the shell layer.
//!
//! Installs a thread-local handler that intercepts subprocess invocations
//! before they fork. The handler receives the full command line and returns
//! the exit code / stdout / stderr the caller will observe. Every intercepted
//! call is recorded so tests can assert on the exact tool invocations.

use std::cell::RefCell;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};

/// Mock response for a shell command.
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn empty() -> Self {
        Self::ok("")
    }

    pub fn fail(stderr: &str) -> Self {
        Self {
            exit_code: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn to_output(&self) -> Output {
        Output {
            // Unix exit code encoding: status = code << 8
            status: ExitStatus::from_raw(self.exit_code << 8),
            stdout: self.stdout.as_bytes().to_vec(),
            stderr: self.stderr.as_bytes().to_vec(),
        }
    }
}

type MockHandler = Box<dyn FnMut(&str) -> MockResponse>;

thread_local! {
    static HANDLER: RefCell<Option<MockHandler>> = const { RefCell::new(None) };
    static CALLS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Guard that clears the mock handler and call log on drop.
pub struct MockGuard;

impl Drop for MockGuard {
    fn drop(&mut self) {
        HANDLER.with(|h| *h.borrow_mut() = None);
        CALLS.with(|c| c.borrow_mut().clear());
    }
}

/// Install a handler for this thread. The handler may keep state (e.g. fail
/// only the n-th launch); it is dropped with the guard.
pub fn install(handler: impl FnMut(&str) -> MockResponse + 'static) -> MockGuard {
    CALLS.with(|c| c.borrow_mut().clear());
    HANDLER.with(|h| *h.borrow_mut() = Some(Box::new(handler)));
    MockGuard
}

/// Try to intercept a command via the installed handler.
pub(crate) fn intercept(cmd: &str, args: &[&str]) -> Option<Output> {
    let line = if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{} {}", cmd, args.join(" "))
    };

    HANDLER.with(|h| {
        let mut handler = h.borrow_mut();
        let f = handler.as_mut()?;
        CALLS.with(|c| c.borrow_mut().push(line.clone()));
        Some(f(&line).to_output())
    })
}

/// Command lines intercepted since the handler was installed.
pub fn recorded_calls() -> Vec<String> {
    CALLS.with(|c| c.borrow().clone())
}

/// Count of recorded calls whose command line contains `needle`.
pub fn calls_matching(needle: &str) -> usize {
    CALLS.with(|c| c.borrow().iter().filter(|l| l.contains(needle)).count())
}
