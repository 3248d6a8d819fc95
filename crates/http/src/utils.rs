//! Internal helper macros.

/// Early-returns an error when a condition does not hold.
///
/// Like `assert!`, but produces an `Err` instead of panicking.
///
/// # Example
///
/// ```ignore
/// ensure!(count <= limits.max_headers, ParseError::too_many_headers(limits.max_headers));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
