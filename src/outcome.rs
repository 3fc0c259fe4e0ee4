//! Pass/fail/skip results for checks run against a live server.

/// The result of one named check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed(String),
    Skipped(String),
}

impl Outcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }

    /// Renders the outcome the way a progress report prints it: a dot for a
    /// pass, a header plus indented reasons otherwise.
    pub fn render(&self, name: &str) -> String {
        match self {
            Outcome::Passed => ".".to_string(),
            Outcome::Skipped(reason) if reason.is_empty() => format!("\nSkipped: {name}"),
            Outcome::Skipped(reason) => format!("\nSkipped: {name}\n  {reason}"),
            Outcome::Failed(reason) => {
                let mut out = format!("\nFAILED: {name}");
                for line in reason.lines() {
                    out.push_str("\n  ");
                    out.push_str(line);
                }
                out
            }
        }
    }
}

/// Accumulates log lines for one check. They are only shown if the check
/// fails.
#[derive(Debug, Default)]
pub struct Check {
    messages: Vec<String>,
    failed: bool,
    skipped: Option<String>,
}

impl Check {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Marks the check failed and keeps going.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.log(message);
        self.failed = true;
    }

    /// Fails the check unless `cond` holds.
    pub fn expect(&mut self, cond: bool, message: impl Into<String>) {
        if !cond {
            self.fail(message);
        }
    }

    /// Marks the check skipped. The body should return right after; a skip
    /// outranks any failure recorded before it.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.skipped = Some(reason.into());
    }

    /// Folds the check and the result of its body into an outcome. An
    /// error from the body counts as a failure.
    pub fn finish<E: std::fmt::Display>(mut self, result: Result<(), E>) -> Outcome {
        if let Some(reason) = self.skipped {
            return Outcome::Skipped(reason);
        }
        if let Err(e) = result {
            self.fail(e.to_string());
        }
        if self.failed {
            Outcome::Failed(self.messages.join("\n"))
        } else {
            Outcome::Passed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passed_hides_log() {
        let mut check = Check::new();
        check.log("going ok");
        let outcome = check.finish::<String>(Ok(()));
        assert_eq!(outcome, Outcome::Passed);
        assert_eq!(outcome.render("quiet"), ".");
    }

    #[test]
    fn test_fail_keeps_going_and_reports_log() {
        let mut check = Check::new();
        check.log("going ok");
        check.fail("bad, but continue");
        check.log("maybe?");
        let outcome = check.finish::<String>(Ok(()));
        assert!(outcome.is_failed());
        assert_eq!(
            outcome.render("can do stuff"),
            "\nFAILED: can do stuff\n  going ok\n  bad, but continue\n  maybe?"
        );
    }

    #[test]
    fn test_error_fails_the_check() {
        let mut check = Check::new();
        check.expect(true, "never shown");
        let outcome = check.finish(Err("boom"));
        assert_eq!(outcome, Outcome::Failed("boom".into()));
    }

    #[test]
    fn test_skip_outranks_failure() {
        let mut check = Check::new();
        check.fail("not yet");
        check.skip("server has no COPY support");
        let outcome = check.finish::<String>(Ok(()));
        assert_eq!(outcome, Outcome::Skipped("server has no COPY support".into()));
        assert_eq!(
            outcome.render("copy"),
            "\nSkipped: copy\n  server has no COPY support"
        );
    }

    #[test]
    fn test_skipped() {
        let outcome = Outcome::Skipped(String::new());
        assert!(outcome.is_skipped());
        assert_eq!(outcome.render("copy"), "\nSkipped: copy");
    }
}
