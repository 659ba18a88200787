use std::fmt;

/// Exit-code convention shared by repository commands, sequence steps,
/// per-project mirroring and the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Everything went fine (code 0).
    Success,
    /// Something failed (code 1).
    Failure,
    /// Stop here without treating it as a failure (code 2).
    Continue,
}

impl Outcome {
    pub const SUCCESS_CODE: i32 = 0;
    pub const FAILURE_CODE: i32 = 1;
    pub const CONTINUE_CODE: i32 = 2;

    pub fn code(self) -> i32 {
        match self {
            Outcome::Success => Self::SUCCESS_CODE,
            Outcome::Failure => Self::FAILURE_CODE,
            Outcome::Continue => Self::CONTINUE_CODE,
        }
    }

    /// Any code other than 0 and 2 counts as a failure.
    pub fn from_code(code: i32) -> Self {
        match code {
            Self::SUCCESS_CODE => Outcome::Success,
            Self::CONTINUE_CODE => Outcome::Continue,
            _ => Outcome::Failure,
        }
    }

    pub fn is_failure(self) -> bool {
        self == Outcome::Failure
    }

    /// Combine per-project outcomes: failure dominates, continue only when
    /// every outcome is continue, success otherwise. An empty set is success.
    pub fn aggregate<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = Outcome>,
    {
        let mut seen_any = false;
        let mut all_continue = true;

        for outcome in outcomes {
            seen_any = true;
            match outcome {
                Outcome::Failure => return Outcome::Failure,
                Outcome::Continue => {}
                Outcome::Success => all_continue = false,
            }
        }

        if seen_any && all_continue {
            Outcome::Continue
        } else {
            Outcome::Success
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::Continue => "continue",
        };
        write!(f, "{}", name)
    }
}

impl From<Outcome> for std::process::ExitCode {
    fn from(outcome: Outcome) -> Self {
        std::process::ExitCode::from(outcome.code() as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(Outcome::Success.code(), 0);
        assert_eq!(Outcome::Failure.code(), 1);
        assert_eq!(Outcome::Continue.code(), 2);
        assert_eq!(Outcome::from_code(2), Outcome::Continue);
        assert_eq!(Outcome::from_code(-9), Outcome::Failure);
        assert_eq!(Outcome::from_code(42), Outcome::Failure);
    }

    #[test]
    fn test_aggregate_failure_dominates() {
        let outcomes = vec![Outcome::Continue, Outcome::Failure, Outcome::Success];
        assert_eq!(Outcome::aggregate(outcomes), Outcome::Failure);
    }

    #[test]
    fn test_aggregate_all_continue() {
        let outcomes = vec![Outcome::Continue, Outcome::Continue];
        assert_eq!(Outcome::aggregate(outcomes), Outcome::Continue);
    }

    #[test]
    fn test_aggregate_mixed_is_success() {
        let outcomes = vec![Outcome::Continue, Outcome::Success];
        assert_eq!(Outcome::aggregate(outcomes), Outcome::Success);
        assert_eq!(Outcome::aggregate(Vec::new()), Outcome::Success);
    }
}
