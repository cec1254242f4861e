// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The engine's formatted output sink.

use crate::config::LogFlags;
use osl_host::Platform;
use std::fmt::Write;
use std::sync::Arc;

/// Longest message written in one call, matching a 4096-byte C buffer with
/// its terminator.
pub const MAX_MESSAGE_LEN: usize = 4095;

pub(crate) struct LogSink {
    flags: LogFlags,
    platform: Arc<dyn Platform>,
}

impl LogSink {
    pub fn new(flags: LogFlags, platform: Arc<dyn Platform>) -> Self {
        Self { flags, platform }
    }

    pub fn flags(&self) -> LogFlags {
        self.flags
    }

    pub fn write_fmt(&self, args: std::fmt::Arguments<'_>) {
        if !self.flags.console() && !self.flags.log() {
            return;
        }
        let mut message = BoundedMessage::default();
        // Overflow only truncates.
        let _ = message.write_fmt(args);
        let message = message.text;

        if self.flags.console() {
            self.platform.console_write(&message);
        }
        if self.flags.log() && !self.platform.at_interrupt_context() {
            self.platform.log_write(&message);
        }
    }
}

#[derive(Default)]
struct BoundedMessage {
    text: String,
}

impl Write for BoundedMessage {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        let room = MAX_MESSAGE_LEN - self.text.len();
        if s.len() <= room {
            self.text.push_str(s);
            return Ok(());
        }
        let mut end = room;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&s[..end]);
        Err(std::fmt::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osl_test_host::TestHost;
    use osl_test_host::test;

    fn new_sink(console: bool, log: bool) -> (Arc<TestHost>, LogSink) {
        let host = TestHost::new();
        let flags = LogFlags::new().with_console(console).with_log(log);
        (host.clone(), LogSink::new(flags, host))
    }

    #[test]
    fn routes_by_flags() {
        let (host, sink) = new_sink(true, false);
        sink.write_fmt(format_args!("ACPI: {} {:#x}\n", "table", 0x40));
        assert_eq!(host.console_output(), ["ACPI: table 0x40\n"]);
        assert!(host.log_output().is_empty());

        let (host, sink) = new_sink(false, true);
        sink.write_fmt(format_args!("hello"));
        assert!(host.console_output().is_empty());
        assert_eq!(host.log_output(), ["hello"]);
    }

    #[test]
    fn log_backend_skipped_at_interrupt_context() {
        let (host, sink) = new_sink(true, true);
        host.set_interrupt_context(true);
        sink.write_fmt(format_args!("from isr"));
        assert_eq!(host.console_output(), ["from isr"]);
        assert!(host.log_output().is_empty());
    }

    #[test]
    fn long_messages_are_truncated() {
        let (host, sink) = new_sink(true, false);
        let long = "é".repeat(3000);
        sink.write_fmt(format_args!("{long}{long}"));
        let out = host.console_output();
        assert!(out[0].len() <= MAX_MESSAGE_LEN);
        assert_eq!(out[0].len(), MAX_MESSAGE_LEN - 1);
        assert!(out[0].chars().all(|c| c == 'é'));
    }
}
