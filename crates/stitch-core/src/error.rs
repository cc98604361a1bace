use std::fmt;

/// Machine-readable error codes surfaced by the CLI and batch-cycle callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    StoreUnavailable,
    CorruptStore,
    SourceUnavailable,
    SourceParseError,
    ReferenceLoadFailed,
    MergeFailed,
    AggregateDrift,
    DetectTimeout,
    LockContention,
    LockIoError,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::StoreUnavailable => "E2001",
            Self::CorruptStore => "E2002",
            Self::SourceUnavailable => "E3001",
            Self::SourceParseError => "E3002",
            Self::ReferenceLoadFailed => "E3003",
            Self::MergeFailed => "E4001",
            Self::AggregateDrift => "E4002",
            Self::DetectTimeout => "E4003",
            Self::LockContention => "E5001",
            Self::LockIoError => "E5002",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::StoreUnavailable => "Event store unavailable",
            Self::CorruptStore => "Event store schema is corrupt or too new",
            Self::SourceUnavailable => "Source connector unavailable",
            Self::SourceParseError => "Source file could not be parsed",
            Self::ReferenceLoadFailed => "Reference data could not be loaded",
            Self::MergeFailed => "Batch merge failed and was rolled back",
            Self::AggregateDrift => "Aggregate cache drifted from event store",
            Self::DetectTimeout => "Fraud detection timed out",
            Self::LockContention => "Lock contention",
            Self::LockIoError => "Lock file I/O error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in stitch.toml and retry."),
            Self::StoreUnavailable => Some("Check the store path and disk permissions."),
            Self::CorruptStore => Some("Restore the store from backup or upgrade stitch."),
            Self::SourceUnavailable => Some("Check that the source directory exists and is readable."),
            Self::SourceParseError => {
                Some("Fix or remove the malformed source file; it was not committed.")
            }
            Self::ReferenceLoadFailed => Some("Validate the reference file against the documented shape."),
            Self::MergeFailed => Some("Retry the batch cycle; staged rows were kept for replay."),
            Self::AggregateDrift => Some("Run `stitch rebuild` to recompute the aggregate cache."),
            Self::DetectTimeout => Some("Narrow the window or raise the timeout."),
            Self::LockContention => Some("Retry after the other `stitch` process releases its lock."),
            Self::LockIoError => Some("Check write permissions next to the store file."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::ErrorCode;
    use std::collections::HashSet;

    const ALL: [ErrorCode; 11] = [
        ErrorCode::ConfigParseError,
        ErrorCode::StoreUnavailable,
        ErrorCode::CorruptStore,
        ErrorCode::SourceUnavailable,
        ErrorCode::SourceParseError,
        ErrorCode::ReferenceLoadFailed,
        ErrorCode::MergeFailed,
        ErrorCode::AggregateDrift,
        ErrorCode::DetectTimeout,
        ErrorCode::LockContention,
        ErrorCode::LockIoError,
    ];

    #[test]
    fn all_codes_are_unique() {
        let mut seen = HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        for code in ALL {
            let raw = code.code();
            assert_eq!(raw.len(), 5);
            assert!(raw.starts_with('E'));
            assert!(raw.chars().skip(1).all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn every_code_belongs_to_a_subsystem_and_has_a_hint() {
        for code in ALL {
            let family = code.code().as_bytes()[1];
            assert!((b'1'..=b'5').contains(&family), "{code} outside E1xxx..E5xxx");
            assert!(code.hint().is_some(), "{code} has no hint");
        }
    }

    #[test]
    fn display_matches_code() {
        assert_eq!(ErrorCode::AggregateDrift.to_string(), "E4002");
    }
}
