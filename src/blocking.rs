//! Bounded polling on top of the base radio traits
//!
//! Hardware completion is observed by polling a status bit a fixed number of
//! times, sleeping a fixed interval between attempts. Callers get back how many
//! attempts were made and whether the condition was observed.
//!
//! ## https://github.com/rust-iot/radio-hal
//! ## Copyright 2020 Ryan Kurte

use core::time::Duration;

use embedded_hal::delay::DelayNs;

#[cfg(feature = "structopt")]
use structopt::StructOpt;

use crate::Receive;

/// Options for a bounded poll
#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(StructOpt))]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct PollOptions {
    /// Interval between polls of the device
    #[cfg_attr(feature = "structopt", structopt(long = "poll-interval", default_value = "2ms", parse(try_from_str = crate::duration_from_str)))]
    pub interval: Duration,

    /// Maximum number of polls before giving up
    #[cfg_attr(feature = "structopt", structopt(long = "poll-attempts", default_value = "100"))]
    pub max_attempts: u32,
}

impl PollOptions {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Longest time a poll with these options may block for
    pub fn ceiling(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::new(Duration::from_millis(2), 100)
    }
}

/// Result of a bounded poll
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PollOutcome {
    /// Number of times the condition was checked
    pub attempts: u32,
    /// Whether the condition was observed before the ceiling
    pub completed: bool,
}

/// Check `done` until it returns true or `max_attempts` checks have been made,
/// sleeping `interval` between checks
///
/// A ceiling of zero still checks once.
pub fn poll<D, E>(
    delay: &mut D,
    options: &PollOptions,
    mut done: impl FnMut() -> Result<bool, E>,
) -> Result<PollOutcome, E>
where
    D: DelayNs,
{
    let max = options.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;

        if done()? {
            return Ok(PollOutcome {
                attempts,
                completed: true,
            });
        }

        if attempts >= max {
            return Ok(PollOutcome {
                attempts,
                completed: false,
            });
        }

        pause(delay, options.interval);
    }
}

/// Sleep for `interval`, in milliseconds once microseconds no longer fit a `u32`
fn pause<D: DelayNs>(delay: &mut D, interval: Duration) {
    match u32::try_from(interval.as_micros()) {
        Ok(us) => delay.delay_us(us),
        Err(_) => delay.delay_ms(u32::try_from(interval.as_millis()).unwrap_or(u32::MAX)),
    }
}

/// BlockingError wraps radio error type to provide a `Timeout` variant
#[derive(Clone, Debug, PartialEq)]
pub enum BlockingError<E> {
    Inner(E),
    Timeout,
}

impl<E> From<E> for BlockingError<E> {
    fn from(e: E) -> Self {
        BlockingError::Inner(e)
    }
}

/// Blocking receive function implemented over `Receive` using the provided
/// `PollOptions` and a `DelayNs` to poll for completion
///
/// Receive mode must already have been entered with `Receive::start_receive`.
pub trait BlockingReceive<I, E> {
    fn do_receive(
        &mut self,
        delay: &mut impl DelayNs,
        buff: &mut [u8],
        options: &PollOptions,
    ) -> Result<(usize, I), BlockingError<E>>;
}

impl<T, I, E> BlockingReceive<I, E> for T
where
    T: Receive<Info = I, Error = E>,
    E: core::fmt::Debug,
{
    fn do_receive(
        &mut self,
        delay: &mut impl DelayNs,
        buff: &mut [u8],
        options: &PollOptions,
    ) -> Result<(usize, I), BlockingError<E>> {
        let outcome = poll(delay, options, || self.check_receive(true))?;

        if !outcome.completed {
            debug!("Blocking receive timeout after {} polls", outcome.attempts);
            return Err(BlockingError::Timeout);
        }

        let (n, info) = self.get_received(buff)?;
        Ok((n, info))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::mock::SimDelay;

    #[test]
    fn poll_completes_early() {
        let mut delay = SimDelay::default();
        let mut n = 0;

        let outcome = poll(&mut delay, &PollOptions::default(), || {
            n += 1;
            Ok::<_, ()>(n == 3)
        })
        .unwrap();

        assert_eq!(
            outcome,
            PollOutcome {
                attempts: 3,
                completed: true
            }
        );
        assert_eq!(delay.elapsed(), Duration::from_millis(4));
    }

    #[test]
    fn poll_stops_at_ceiling() {
        let mut delay = SimDelay::default();
        let options = PollOptions::new(Duration::from_millis(2), 30);

        let outcome = poll(&mut delay, &options, || Ok::<_, ()>(false)).unwrap();

        assert_eq!(outcome.attempts, 30);
        assert!(!outcome.completed);
        assert!(delay.elapsed() <= options.ceiling());
    }

    #[test]
    fn poll_long_interval() {
        let mut delay = SimDelay::default();
        let options = PollOptions::new(Duration::from_secs(2 * 3600), 2);

        let outcome = poll(&mut delay, &options, || Ok::<_, ()>(false)).unwrap();

        assert!(!outcome.completed);
        assert_eq!(delay.elapsed(), Duration::from_secs(2 * 3600));
    }

    #[test]
    fn poll_propagates_errors() {
        let mut delay = SimDelay::default();

        let res = poll(&mut delay, &PollOptions::default(), || Err::<bool, _>("bus"));
        assert_eq!(res, Err("bus"));
    }
}
