use crate::common::error::MirrorError;

/// Result alias used across the crate.
///
/// # Examples
///
/// ```
/// use repomirror::common::result::MirrorResult;
/// use repomirror::common::error::MirrorError;
///
/// fn load() -> MirrorResult<()> {
///     Err(MirrorError::config_error("The logdir property is required in batch mode"))
/// }
///
/// assert!(load().is_err());
/// ```
pub type MirrorResult<T> = Result<T, MirrorError>;
