use std::time::{Duration, Instant};

/// Error type for polling operations
#[derive(Debug)]
pub enum PollError<E> {
    /// Operation timed out after the given wait
    Timeout(Duration),
    /// Error occurred in the condition function
    ConditionError(E),
}

impl<E> std::fmt::Display for PollError<E>
where
    E: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout(waited) => write!(f, "Operation timed out after {:?}", waited),
            PollError::ConditionError(e) => write!(f, "Condition error: {}", e),
        }
    }
}

impl<E> std::error::Error for PollError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PollError::Timeout(_) => None,
            PollError::ConditionError(e) => Some(e),
        }
    }
}

/// Poll a condition until it holds.
///
/// Repeatedly calls `condition` until it returns `Ok(true)`, sleeping
/// `poll_interval` between checks. With `timeout: None` this waits
/// indefinitely.
///
/// # Example
/// ```
/// use std::time::Duration;
/// use gate_manager::utils::poll_until;
///
/// let mut reads = 0;
/// poll_until(
///     || {
///         reads += 1;
///         Ok::<bool, ()>(reads >= 3)
///     },
///     Some(Duration::from_secs(1)),
///     Duration::from_millis(1),
/// )
/// .unwrap();
/// assert_eq!(reads, 3);
/// ```
pub fn poll_until<F, E>(
    mut condition: F,
    timeout: Option<Duration>,
    poll_interval: Duration,
) -> Result<(), PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    let start = Instant::now();

    loop {
        match condition() {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => return Err(PollError::ConditionError(e)),
        }

        if let Some(limit) = timeout {
            let waited = start.elapsed();
            if waited >= limit {
                return Err(PollError::Timeout(waited));
            }
        }

        std::thread::sleep(poll_interval);
    }
}

/// Sleep until `deadline`, waking every `granularity` so long waits stay
/// responsive to the clock rather than oversleeping.
pub fn sleep_until(deadline: Instant, granularity: Duration) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(granularity.min(deadline - now));
    }
}
