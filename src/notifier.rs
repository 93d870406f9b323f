//! Failure notification by email.
//!
//! Notification is best-effort: a failed delivery is logged and dropped, it
//! never reaches the dispatcher.

use std::io::Write;
use std::process::{Command, Stdio};

use chrono::Utc;
use uuid::Uuid;

use crate::config::MailConfig;
use crate::error::{CommandError, NotifyError};

/// Everything needed to tell a blamelist what went wrong.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub recipient: String,
    pub subject: String,
    pub code: i32,
    pub reason: String,
}

impl FailureReport {
    /// Build a report for a failed command.
    #[must_use]
    pub fn for_error(recipient: impl Into<String>, subject: impl Into<String>, error: &CommandError) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            code: error.code(),
            reason: error.reason(),
        }
    }
}

/// Render the failure message body sent to a blamelist.
#[must_use]
pub fn render_failure(host: &str, code: i32, reason: &str) -> String {
    format!(
        "{host} failed to reconfigure due to the following error(s):\n\n\
         Return code: {code}\n\
         Error message: {reason}\n\n\
         Please fix this error before service can resume.\n"
    )
}

/// Name of the local host, as used in failure messages.
#[must_use]
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Something that can deliver one mail message.
pub trait MailTransport {
    /// Deliver `body` to `recipient`.
    ///
    /// # Errors
    ///
    /// Returns a [`NotifyError`] if the message could not be handed off.
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError>;
}

/// Receives failure reports from the dispatcher.
pub trait Notifier {
    /// Report a failure. Must not fail or panic.
    fn notify(&self, report: &FailureReport);
}

/// Notifier that mails the rendered failure template.
#[derive(Debug, Clone)]
pub struct MailNotifier<T> {
    transport: T,
    host: String,
}

impl<T: MailTransport> MailNotifier<T> {
    /// Notifier naming the local host in its messages.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self::with_host(transport, local_hostname())
    }

    /// Notifier naming `host` in its messages.
    #[must_use]
    pub fn with_host(transport: T, host: impl Into<String>) -> Self {
        Self {
            transport,
            host: host.into(),
        }
    }

    /// The underlying transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: MailTransport> Notifier for MailNotifier<T> {
    fn notify(&self, report: &FailureReport) {
        tracing::info!(recipient = %report.recipient, code = report.code, "sending error details");
        let body = render_failure(&self.host, report.code, &report.reason);
        if let Err(e) = self.transport.send(&report.recipient, &report.subject, &body) {
            tracing::warn!(recipient = %report.recipient, error = %e, "failed to send failure notification");
        }
    }
}

/// Mail transport that pipes messages into a local `sendmail`.
#[derive(Debug, Clone)]
pub struct Sendmail {
    program: String,
    sender: String,
    host: String,
}

impl Sendmail {
    /// Transport running `program` with `sender` as the `From` address.
    #[must_use]
    pub fn new(program: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            sender: sender.into(),
            host: local_hostname(),
        }
    }

    /// Transport configured from the `mail` section; the sender defaults to
    /// `occ@<hostname>`.
    #[must_use]
    pub fn from_config(cfg: &MailConfig) -> Self {
        let host = local_hostname();
        let sender = cfg.sender.clone().unwrap_or_else(|| format!("occ@{host}"));
        Self {
            program: cfg.sendmail.clone(),
            sender,
            host,
        }
    }

    /// Format a complete message with headers.
    #[must_use]
    pub fn compose(&self, recipient: &str, subject: &str, body: &str) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nMessage-ID: <{}@{}>\r\n\
             MIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
            header_value(&self.sender),
            header_value(recipient),
            header_value(subject),
            Utc::now().to_rfc2822(),
            Uuid::new_v4(),
            self.host,
            body
        )
    }
}

/// Strip line breaks so a value cannot inject extra headers.
fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

impl MailTransport for Sendmail {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
        let message = self.compose(recipient, subject, body);
        let mut child = Command::new(&self.program)
            .args(["-t", "-oi"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| NotifyError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let written = child
            .stdin
            .take()
            .map_or(Ok(()), |mut stdin| stdin.write_all(message.as_bytes()));
        let status = child.wait().map_err(NotifyError::Write)?;
        written.map_err(NotifyError::Write)?;

        if status.success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected {
                status: status.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Outbox {
        sent: RefCell<Vec<(String, String, String)>>,
        fail: bool,
    }

    impl MailTransport for Outbox {
        fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Rejected {
                    status: "exit status: 75".to_string(),
                });
            }
            self.sent
                .borrow_mut()
                .push((recipient.to_string(), subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    #[test]
    fn template_names_host_code_and_reason() {
        let body = render_failure("web01", 3, "build failed");
        assert_eq!(
            body,
            "web01 failed to reconfigure due to the following error(s):\n\n\
             Return code: 3\nError message: build failed\n\n\
             Please fix this error before service can resume.\n"
        );
    }

    #[test]
    fn notifier_sends_rendered_template() {
        let notifier = MailNotifier::with_host(Outbox::default(), "web01");
        let err = CommandError::NonZeroExit {
            code: 3,
            output: "boom".to_string(),
        };
        notifier.notify(&FailureReport::for_error("ops@example.org", "OCC execution failure", &err));

        let sent = notifier.transport().sent.borrow();
        assert_eq!(sent.len(), 1);
        let (to, subject, body) = &sent[0];
        assert_eq!(to, "ops@example.org");
        assert_eq!(subject, "OCC execution failure");
        assert!(body.contains("Return code: 3"));
        assert!(body.contains("Error message: boom"));
    }

    #[test]
    fn transport_failure_is_swallowed() {
        let notifier = MailNotifier::with_host(
            Outbox {
                fail: true,
                ..Outbox::default()
            },
            "web01",
        );
        let err = CommandError::UnknownUser {
            user: "ghost".to_string(),
        };
        notifier.notify(&FailureReport::for_error("ops@example.org", "s", &err));
        assert!(notifier.transport().sent.borrow().is_empty());
    }

    #[test]
    fn compose_sanitizes_headers() {
        let mail = Sendmail::new("/usr/sbin/sendmail", "occ@example.org");
        let msg = mail.compose("ops@example.org", "broken\r\nBcc: evil@example.org", "body");
        assert!(msg.starts_with("From: occ@example.org\r\nTo: ops@example.org\r\n"));
        assert!(msg.contains("Subject: broken  Bcc: evil@example.org\r\n"));
        assert!(msg.ends_with("\r\n\r\nbody"));
    }

    #[test]
    fn sendmail_pipes_message_to_program() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("mail.txt");
        let script = dir.path().join("sendmail");
        std::fs::write(&script, format!("#!/bin/sh\ncat > '{}'\n", out.display())).unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let mail = Sendmail::new(script.display().to_string(), "occ@example.org");
        mail.send("ops@example.org", "subject", "hello").unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert!(written.contains("To: ops@example.org"));
        assert!(written.ends_with("hello"));
    }

    #[test]
    fn missing_sendmail_is_an_error() {
        let mail = Sendmail::new("/nonexistent/sendmail", "occ@example.org");
        let err = mail.send("ops@example.org", "s", "b").unwrap_err();
        assert!(matches!(err, NotifyError::Spawn { .. }));
    }
}
